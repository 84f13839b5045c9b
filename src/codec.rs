//! Text and hash codecs shared by every credential scheme.

use data_encoding::BASE32;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid base32: {0}")]
    Base32(#[from] data_encoding::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::encode(data)
}

pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(base64::decode(encoded)?)
}

pub fn encode_base32(data: &[u8]) -> String {
    BASE32.encode(data)
}

pub fn decode_base32(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE32.decode(encoded.as_bytes())?)
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(json)?)
}

/// SHA-256 digest, returned as raw bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Stable content fingerprint: base64 over the SHA-256 of the input.
///
/// Used wherever a document identifier must be a deterministic function of
/// the scanned payload, so re-importing the same code is idempotent.
pub fn fingerprint(data: &[u8]) -> String {
    encode_base64(&sha256(data))
}
