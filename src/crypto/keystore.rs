//! Secure key store collaborator.
//!
//! On-device secrets (passwords, key material) are handed to the key store
//! and come back only as [`WrappedSecret`] ciphertext; the wrapping key
//! never leaves the store. The platform implementation sits behind
//! [`SecureKeyStore`]; [`SoftwareKeyStore`] is the in-process stand-in used
//! by tests and platforms without hardware backing.

use std::collections::HashMap;

use async_trait::async_trait;
use p256::SecretKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{ecies, CryptoError};
use crate::cbor;

/// An opaque wrapped secret. Plaintext is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedSecret {
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<Vec<u8>>,
}

#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    /// Wrap `secret` under the key addressed by `alias`, creating the key
    /// if the store supports on-demand generation.
    async fn wrap_secret(&self, alias: &str, secret: &[u8]) -> Result<WrappedSecret, CryptoError>;

    /// Unwrap a previously wrapped secret.
    async fn unwrap_secret(
        &self,
        alias: &str,
        wrapped: &WrappedSecret,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Software key store: one P-256 key per alias, wrapping via ECIES.
#[derive(Default)]
pub struct SoftwareKeyStore {
    keys: RwLock<HashMap<String, SecretKey>>,
}

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn key_for(&self, alias: &str, create: bool) -> Result<SecretKey, CryptoError> {
        {
            let keys = self.keys.read().await;
            if let Some(key) = keys.get(alias) {
                return Ok(key.clone());
            }
        }
        if !create {
            return Err(CryptoError::KeyUnavailable(alias.to_string()));
        }
        let mut keys = self.keys.write().await;
        // Re-check under the write lock; another task may have created it.
        Ok(keys
            .entry(alias.to_string())
            .or_insert_with(|| SecretKey::random(&mut OsRng))
            .clone())
    }
}

#[async_trait]
impl SecureKeyStore for SoftwareKeyStore {
    async fn wrap_secret(&self, alias: &str, secret: &[u8]) -> Result<WrappedSecret, CryptoError> {
        let key = self.key_for(alias, true).await?;
        let sealed = ecies::encrypt(secret, &key.public_key())?;
        let ciphertext = cbor::to_vec(&sealed)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        Ok(WrappedSecret {
            ciphertext,
            iv: None,
        })
    }

    async fn unwrap_secret(
        &self,
        alias: &str,
        wrapped: &WrappedSecret,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.key_for(alias, false).await?;
        let sealed: ecies::EciesResult = cbor::from_slice(&wrapped.ciphertext)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        ecies::decrypt(&sealed, &key)
    }
}
