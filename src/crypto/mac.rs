//! Keyed hashing (HMAC-SHA256).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Compute the HMAC-SHA256 tag of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time verification of an HMAC-SHA256 tag.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| CryptoError::MacMismatch)
}
