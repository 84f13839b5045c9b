//! Signature, MAC and cipher providers.
//!
//! Every primitive here is deterministic for identical inputs except ECIES
//! encryption, which draws a fresh ephemeral key and IV per call. Failures
//! are surfaced as [`CryptoError`]; no operation ever returns truncated or
//! unauthenticated plaintext.

use thiserror::Error;

pub mod ecies;
pub mod keystore;
pub mod mac;
pub mod sign;

pub use ecies::EciesResult;
pub use keystore::{SecureKeyStore, SoftwareKeyStore, WrappedSecret};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("authenticated decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("key '{0}' is not available in the key store")]
    KeyUnavailable(String),
    #[error("algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),
}
