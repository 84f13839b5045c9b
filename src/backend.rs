//! Network collaborator contracts.
//!
//! The backend is consumed through [`BackendClient`], so platform HTTP
//! stacks stay swappable and all caching/verification logic stays in this
//! crate. [`HttpBackend`] is the reqwest implementation; every call is
//! bounded by the client timeout and surfaces a typed [`BackendError`]
//! instead of hanging.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else if let Some(status) = e.status() {
            BackendError::Status(status.as_u16())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// Current rotating daily public key, as served by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyKeyResponse {
    pub id: u32,
    pub creation_timestamp: i64,
    /// base64, SEC1-encoded P-256 point.
    pub public_key: String,
    pub issuer_id: String,
    /// base64, DER ECDSA signature by the issuer's signing key over the
    /// canonical key payload.
    pub signature: String,
}

/// A public key vouched for by the issuer's certificate key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyToken {
    /// base64, SEC1-encoded P-256 point.
    pub public_key: String,
    /// base64, DER ECDSA signature over the raw public key bytes.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyIssuerResponse {
    pub id: String,
    /// PEM certificate chain, leaf first.
    pub certificate_chain: String,
    pub signed_encryption_key_token: SignedKeyToken,
    pub signed_signing_key_token: SignedKeyToken,
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn fetch_daily_key(&self) -> Result<DailyKeyResponse, BackendError>;

    async fn fetch_key_issuer(&self, issuer_id: &str) -> Result<KeyIssuerResponse, BackendError>;

    /// Submit a canonical-JSON hash of a signed ticket for remote
    /// verification. Success is the only acceptable outcome; any non-2xx
    /// status or transport failure is an error.
    async fn verify_ticket_hash(&self, hash: &str) -> Result<(), BackendError>;

    /// Fetch the COSE-signed credential key bundle (binary CBOR).
    async fn fetch_key_bundle(&self) -> Result<Vec<u8>, BackendError>;

    /// Fetch the certificate the key bundle is signed under (DER or PEM).
    async fn fetch_bundle_certificate(&self) -> Result<Vec<u8>, BackendError>;

    /// Trusted Unix timestamp from the server, used to detect local clock
    /// tampering.
    async fn fetch_server_time(&self) -> Result<i64, BackendError>;
}

/// Reqwest-backed [`BackendClient`].
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct TicketHashRequest<'a> {
    hash: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    unix: i64,
}

impl HttpBackend {
    /// Default per-request timeout: 30 seconds.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self.client.get(self.url(path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        let response = self.client.get(self.url(path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn fetch_daily_key(&self) -> Result<DailyKeyResponse, BackendError> {
        self.get_json("/v3/keys/daily/current").await
    }

    async fn fetch_key_issuer(&self, issuer_id: &str) -> Result<KeyIssuerResponse, BackendError> {
        self.get_json(&format!("/v3/keys/issuers/{issuer_id}")).await
    }

    async fn verify_ticket_hash(&self, hash: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("/v3/tickets/verify"))
            .json(&TicketHashRequest { hash })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "ticket hash rejected");
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn fetch_key_bundle(&self) -> Result<Vec<u8>, BackendError> {
        self.get_bytes("/v3/credentials/keys/bundle").await
    }

    async fn fetch_bundle_certificate(&self) -> Result<Vec<u8>, BackendError> {
        self.get_bytes("/v3/credentials/keys/certificate").await
    }

    async fn fetch_server_time(&self) -> Result<i64, BackendError> {
        let response: ServerTimeResponse = self.get_json("/v3/timesync").await?;
        Ok(response.unix)
    }
}
