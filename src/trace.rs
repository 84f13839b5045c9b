//! Per-guest check-in identity.
//!
//! A guest's presence at a venue is recorded under a *trace ID*: the keyed
//! hash of the guest id and the day, under a rotating tracing secret. Only
//! someone holding the secret (a health authority it was disclosed to) can
//! recompute the IDs, and only for the days the sequence generator covers.
//!
//! All integers in hashed payloads are little-endian; the user id
//! contributes its 16 RFC-4122 bytes; trace IDs are the first 16 bytes of
//! the HMAC, rendered base64.

use std::sync::Arc;

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Duration;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::codec;
use crate::crypto::{ecies, mac, CryptoError, EciesResult};
use crate::daily_key::{DailyKeyError, DailyKeyRegistry};
use crate::storage::{keys, KeyValueStore, KeyValueStoreExt, StorageError};

const SECONDS_PER_DAY: i64 = 86_400;
const TRACE_ID_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    DailyKey(#[from] DailyKeyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One day's opaque presence identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceIdRecord {
    /// Day-aligned Unix timestamp the ID is valid for.
    pub timestamp: i64,
    /// base64 of the 16-byte identifier.
    pub trace_id: String,
}

/// Round a Unix timestamp down to the start of its UTC day.
pub fn start_of_day(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(SECONDS_PER_DAY)
}

/// Day-aligned timestamps counting backward from `now`, covering every day
/// that overlaps the given duration. Lazy and finite; calling again yields
/// a fresh sequence.
pub fn recent_start_of_day_timestamps(
    now: i64,
    duration: Duration,
) -> impl Iterator<Item = i64> {
    let today = start_of_day(now);
    let window_start = now - duration.whole_seconds();
    (0i64..)
        .map(move |offset| today - offset * SECONDS_PER_DAY)
        .take_while(move |day| day + SECONDS_PER_DAY > window_start)
}

/// An encrypted check-in, addressed to the operator via the daily key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInPayload {
    pub trace_id: String,
    pub daily_key_id: u32,
    pub envelope: EciesResult,
}

pub struct TraceIdentity {
    user_id: Uuid,
    tracing_secret: Zeroizing<Vec<u8>>,
}

impl TraceIdentity {
    pub fn new(user_id: Uuid, tracing_secret: Vec<u8>) -> Self {
        Self {
            user_id,
            tracing_secret: Zeroizing::new(tracing_secret),
        }
    }

    /// Derive the trace ID for a day-aligned timestamp.
    ///
    /// Deterministic for identical (user, secret, day); unlinkable across
    /// days without the secret.
    pub fn generate_trace_id(&self, day_timestamp: i64) -> Result<TraceIdRecord, TraceError> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(self.user_id.as_bytes());
        data.extend_from_slice(&(day_timestamp as u32).to_le_bytes());
        let tag = mac::hmac_sha256(&self.tracing_secret, &data)?;
        Ok(TraceIdRecord {
            timestamp: day_timestamp,
            trace_id: codec::encode_base64(&tag[..TRACE_ID_LENGTH]),
        })
    }

    /// One trace ID per day over the data-sharing retention window. This is
    /// exactly the set a health authority holding the disclosed secret can
    /// recompute, and no more.
    pub fn generate_recent_trace_ids(
        &self,
        now: i64,
        duration: Duration,
    ) -> Result<Vec<TraceIdRecord>, TraceError> {
        recent_start_of_day_timestamps(now, duration)
            .map(|day| self.generate_trace_id(day))
            .collect()
    }

    /// The guest's meeting key pair for a day, created and persisted on
    /// first use so re-deriving within the day is stable.
    pub async fn guest_key_pair_for_day(
        &self,
        store: &dyn KeyValueStore,
        day_timestamp: i64,
    ) -> Result<SecretKey, TraceError> {
        let storage_key = format!("{}{}", keys::GUEST_KEY_PAIR_PREFIX, start_of_day(day_timestamp));
        if let Some(stored) = store.restore::<StoredKeyPair>(&storage_key).await? {
            return SecretKey::from_slice(&stored.secret)
                .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()).into());
        }
        let secret = SecretKey::random(&mut OsRng);
        store
            .persist(
                &storage_key,
                &StoredKeyPair {
                    day: start_of_day(day_timestamp),
                    secret: secret.to_bytes().to_vec(),
                },
            )
            .await?;
        Ok(secret)
    }

    /// Diffie-Hellman secret between the guest's daily key pair and the
    /// operator's current daily public key.
    ///
    /// Fails closed when the daily key is expired or genuine time is
    /// unavailable; no secret is ever derived from an untrusted key.
    pub async fn generate_shared_dh_secret(
        &self,
        registry: &DailyKeyRegistry,
        store: &dyn KeyValueStore,
        now: i64,
    ) -> Result<SharedDhSecret, TraceError> {
        let daily_key = registry.get_current_key().await?;
        let guest_secret = self.guest_key_pair_for_day(store, now).await?;
        let operator_key = daily_key.public_key()?;
        let shared = p256::ecdh::diffie_hellman(
            guest_secret.to_nonzero_scalar(),
            operator_key.as_affine(),
        );
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(shared.raw_secret_bytes());
        Ok(SharedDhSecret {
            daily_key_id: daily_key.id,
            guest_public_key: guest_secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            secret,
        })
    }

    /// Build an encrypted check-in: the day's trace ID plus the guest data
    /// sealed towards the operator's daily key.
    pub async fn encrypt_check_in(
        &self,
        registry: &DailyKeyRegistry,
        now: i64,
        guest_data: &[u8],
    ) -> Result<CheckInPayload, TraceError> {
        let daily_key = registry.get_current_key().await?;
        let record = self.generate_trace_id(start_of_day(now))?;
        let envelope = ecies::encrypt(guest_data, &daily_key.public_key()?)?;
        Ok(CheckInPayload {
            trace_id: record.trace_id,
            daily_key_id: daily_key.id,
            envelope,
        })
    }

    /// Seal the guest's name towards a private meeting host's public key,
    /// so only the host learns who checked in.
    pub fn encrypt_name_for_host(
        &self,
        host_public_key: &[u8],
        first_name: &str,
        last_name: &str,
    ) -> Result<EciesResult, TraceError> {
        let host = PublicKey::from_sec1_bytes(host_public_key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        let plaintext = serde_json::to_vec(&GuestName {
            first_name,
            last_name,
        })
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        Ok(ecies::encrypt(&plaintext, &host)?)
    }
}

/// Result of the guest/operator key agreement.
pub struct SharedDhSecret {
    pub daily_key_id: u32,
    /// SEC1 encoding of the guest's public half, sent alongside the
    /// encrypted check-in so the operator side can re-derive the secret.
    pub guest_public_key: Vec<u8>,
    pub secret: Zeroizing<[u8; 32]>,
}

#[derive(Serialize, Deserialize)]
struct GuestName<'a> {
    first_name: &'a str,
    last_name: &'a str,
}

#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    day: i64,
    #[serde(with = "serde_bytes")]
    secret: Vec<u8>,
}
