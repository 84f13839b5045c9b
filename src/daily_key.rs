//! Rotating daily public key registry.
//!
//! The operator publishes a fresh asymmetric key pair daily; guests encrypt
//! check-in payloads towards its public half. A key is only trusted after
//! its issuer's certificate chain verifies against the pinned trust anchor
//! and the key payload verifies against the issuer's signing key, and only
//! within a seven-day window from creation measured on genuine time.
//!
//! Refreshes are single-flight: the cache lock is held across the fetch, so
//! concurrent callers needing a refresh all await the same attempt.

use std::sync::Arc;

use p256::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

use crate::backend::{BackendClient, BackendError, SignedKeyToken};
use crate::codec;
use crate::crypto::{sign, CryptoError};
use crate::time::{GenuineClock, NoGenuineTime};

/// Validity window of a daily key, measured from its creation timestamp.
pub const DAILY_KEY_VALIDITY: Duration = Duration::days(7);

#[derive(Debug, Error)]
pub enum DailyKeyError {
    #[error("daily key {id} expired at {expires_at}")]
    Expired { id: u32, expires_at: i64 },
    #[error(transparent)]
    NoGenuineTime(#[from] NoGenuineTime),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("issuer could not be verified: {0}")]
    IssuerVerification(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

/// A verified rotating daily key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyKeyPair {
    pub id: u32,
    pub creation_timestamp: i64,
    /// SEC1-encoded P-256 point.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub issuer_id: String,
}

impl DailyKeyPair {
    pub fn expires_at(&self) -> i64 {
        self.creation_timestamp + DAILY_KEY_VALIDITY.whole_seconds()
    }

    /// Expired iff `now` has reached the end of the validity window. A key
    /// exactly seven days old is already expired.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.expires_at()
    }

    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_sec1_bytes(&self.public_key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))
    }

    /// Canonical byte layout the issuer signs:
    /// id (u32 LE) || creation timestamp (i64 LE) || SEC1 public key.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(12 + self.public_key.len());
        data.extend_from_slice(&self.id.to_le_bytes());
        data.extend_from_slice(&self.creation_timestamp.to_le_bytes());
        data.extend_from_slice(&self.public_key);
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Unloaded,
    Fetching,
    Valid,
    Expired,
}

/// Verifies the issuer's certificate chain and yields the issuer
/// certificate's public key bytes.
pub trait IssuerVerifier: Send + Sync {
    fn verify_chain(&self, pem_chain: &str) -> Result<Vec<u8>, String>;
}

/// X.509 chain verification against a pinned root key.
///
/// Walks the PEM chain (leaf first), checking each certificate is signed by
/// its successor and the last one by the pinned root key.
pub struct PinnedRootVerifier {
    /// SEC1 public key of the pinned trust anchor.
    pinned_root: Vec<u8>,
}

impl PinnedRootVerifier {
    pub fn new(pinned_root: Vec<u8>) -> Self {
        Self { pinned_root }
    }
}

impl IssuerVerifier for PinnedRootVerifier {
    fn verify_chain(&self, pem_chain: &str) -> Result<Vec<u8>, String> {
        let certificates = Certificate::load_pem_chain(pem_chain.as_bytes())
            .map_err(|e| format!("undecodable certificate chain: {e}"))?;
        if certificates.is_empty() {
            return Err("certificate chain is empty".to_string());
        }

        for pair in certificates.windows(2) {
            let issuer_key = spki_bytes(&pair[1])?;
            check_issued(&pair[0], &issuer_key)?;
        }
        let last = certificates
            .last()
            .ok_or_else(|| "certificate chain is empty".to_string())?;
        check_issued(last, &self.pinned_root)?;

        spki_bytes(&certificates[0])
    }
}

pub(crate) fn spki_bytes(certificate: &Certificate) -> Result<Vec<u8>, String> {
    certificate
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .map(|b| b.to_vec())
        .ok_or_else(|| "certificate carries no usable public key".to_string())
}

pub(crate) fn check_issued(subject: &Certificate, issuer_key: &[u8]) -> Result<(), String> {
    let tbs = subject
        .tbs_certificate
        .to_der()
        .map_err(|e| format!("unencodable tbs certificate: {e}"))?;
    let signature = subject
        .signature
        .as_bytes()
        .ok_or_else(|| "certificate signature is not octet-aligned".to_string())?;
    match sign::verify(&tbs, signature, issuer_key) {
        Ok(true) => Ok(()),
        Ok(false) => Err("certificate signature does not verify".to_string()),
        Err(e) => Err(format!("issuer key unusable: {e}")),
    }
}

pub struct DailyKeyRegistry {
    backend: Arc<dyn BackendClient>,
    clock: Arc<GenuineClock>,
    issuer_verifier: Arc<dyn IssuerVerifier>,
    ignore_freshness_window: bool,
    cache: tokio::sync::Mutex<Option<DailyKeyPair>>,
    state: std::sync::Mutex<RegistryState>,
}

impl DailyKeyRegistry {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        clock: Arc<GenuineClock>,
        issuer_verifier: Arc<dyn IssuerVerifier>,
    ) -> Self {
        Self {
            backend,
            clock,
            issuer_verifier,
            ignore_freshness_window: false,
            cache: tokio::sync::Mutex::new(None),
            state: std::sync::Mutex::new(RegistryState::Unloaded),
        }
    }

    /// Disable the expiry check. Injected configuration for tests; release
    /// configurations leave this off.
    pub fn ignore_freshness_window(mut self, ignore: bool) -> Self {
        self.ignore_freshness_window = ignore;
        self
    }

    pub fn state(&self) -> RegistryState {
        self.state.lock().map(|s| *s).unwrap_or(RegistryState::Unloaded)
    }

    fn set_state(&self, state: RegistryState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    /// The currently valid daily key, fetching and verifying a fresh one if
    /// the cache is empty or expired.
    pub async fn get_current_key(&self) -> Result<DailyKeyPair, DailyKeyError> {
        let now = self.clock.now()?;
        let mut cache = self.cache.lock().await;

        if let Some(key) = cache.as_ref() {
            if !key.is_expired_at(now) || self.ignore_freshness_window {
                return Ok(key.clone());
            }
            tracing::debug!(id = key.id, "cached daily key expired");
            self.set_state(RegistryState::Expired);
        }

        self.set_state(RegistryState::Fetching);
        let key = match self.fetch_and_verify().await {
            Ok(key) => key,
            Err(e) => {
                self.set_state(RegistryState::Unloaded);
                return Err(e);
            }
        };

        if key.is_expired_at(now) && !self.ignore_freshness_window {
            self.set_state(RegistryState::Expired);
            return Err(DailyKeyError::Expired {
                id: key.id,
                expires_at: key.expires_at(),
            });
        }

        tracing::info!(id = key.id, "daily key verified");
        self.set_state(RegistryState::Valid);
        *cache = Some(key.clone());
        Ok(key)
    }

    async fn fetch_and_verify(&self) -> Result<DailyKeyPair, DailyKeyError> {
        let response = self.backend.fetch_daily_key().await?;
        let issuer = self.backend.fetch_key_issuer(&response.issuer_id).await?;

        let issuer_certificate_key = self
            .issuer_verifier
            .verify_chain(&issuer.certificate_chain)
            .map_err(DailyKeyError::IssuerVerification)?;

        let signing_key =
            verify_key_token(&issuer.signed_signing_key_token, &issuer_certificate_key)?;
        verify_key_token(&issuer.signed_encryption_key_token, &issuer_certificate_key)?;

        let key = DailyKeyPair {
            id: response.id,
            creation_timestamp: response.creation_timestamp,
            public_key: codec::decode_base64(&response.public_key)?,
            issuer_id: response.issuer_id,
        };
        let signature = codec::decode_base64(&response.signature)?;
        if !sign::verify(&key.signed_payload(), &signature, &signing_key)? {
            return Err(DailyKeyError::IssuerVerification(
                "daily key signature does not verify against issuer signing key".to_string(),
            ));
        }
        Ok(key)
    }
}

/// Verify a token's signature with the issuer certificate's key and return
/// the vouched-for public key bytes.
fn verify_key_token(
    token: &SignedKeyToken,
    issuer_certificate_key: &[u8],
) -> Result<Vec<u8>, DailyKeyError> {
    let public_key = codec::decode_base64(&token.public_key)?;
    let signature = codec::decode_base64(&token.signature)?;
    if !sign::verify(&public_key, &signature, issuer_certificate_key)? {
        return Err(DailyKeyError::IssuerVerification(
            "key token signature does not verify against issuer certificate".to_string(),
        ));
    }
    Ok(public_key)
}
