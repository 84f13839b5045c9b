//! ECDSA P-256 signing and verification.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

use super::CryptoError;

/// Sign `data` with an ECDSA P-256 key, returning the DER-encoded signature.
pub fn sign(key: &SigningKey, data: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(data);
    signature.to_der().as_bytes().to_vec()
}

/// Verify a DER-encoded ECDSA P-256 signature over `data`.
///
/// `public_key` is a SEC1-encoded point. A key that cannot be decoded is an
/// error; a signature that does not verify (or cannot be decoded) is `false`.
pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    let signature = match Signature::from_der(signature) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("undecodable signature: {e}");
            return Ok(false);
        }
    };
    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// Verify a raw (`r || s`) ECDSA P-256 signature, the form carried inside
/// COSE envelopes.
pub fn verify_raw(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    let signature = match Signature::from_slice(signature) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("undecodable raw signature: {e}");
            return Ok(false);
        }
    };
    Ok(verifying_key.verify(data, &signature).is_ok())
}
