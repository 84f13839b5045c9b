//! CBOR encode/decode helpers.
//!
//! Thin wrappers over [ciborium] so the rest of the crate deals in one
//! error type and never touches reader/writer plumbing directly.

use std::io::Cursor;

use serde::{de, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CborError {
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
    #[error("unexpected item: {0}, want {1}")]
    UnexpectedItem(&'static str, &'static str),
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    ciborium::from_reader(Cursor::new(slice)).map_err(|e| CborError::DecodeFailed(e.to_string()))
}

/// Convert a [`ciborium::Value`] into a type `T`.
pub fn from_value<T>(value: ciborium::Value) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    // Round-trips through a buffer; fine for the small payloads seen here.
    let buf = to_vec(&value)?;
    from_slice(&buf)
}

pub fn into_value<S>(v: S) -> Result<ciborium::Value, CborError>
where
    S: Serialize,
{
    let bytes = to_vec(&v)?;
    from_slice(&bytes)
}
