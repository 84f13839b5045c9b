//! Shared fixtures for the integration tests: a settable backend stub and
//! the operator side of the daily-key scheme.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand::rngs::OsRng;
use time::OffsetDateTime;

use tracelight::backend::{
    BackendClient, BackendError, DailyKeyResponse, KeyIssuerResponse, SignedKeyToken,
};
use tracelight::codec;
use tracelight::crypto::sign;
use tracelight::daily_key::{DailyKeyPair, DailyKeyRegistry, IssuerVerifier};
use tracelight::time::GenuineClock;

#[allow(dead_code)]
fn main() {}

#[allow(dead_code)]
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[allow(dead_code)]
pub fn synced_clock() -> Arc<GenuineClock> {
    let clock = GenuineClock::default();
    clock.record_sync(now_unix()).unwrap();
    Arc::new(clock)
}

#[allow(dead_code)]
pub fn sec1(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
}

/// Backend stub with settable responses; anything left unset answers 404.
#[derive(Default)]
pub struct StubBackend {
    pub daily_key: Mutex<Option<DailyKeyResponse>>,
    pub issuer: Mutex<Option<KeyIssuerResponse>>,
    pub accept_tickets: AtomicBool,
    pub bundle: Mutex<Option<Vec<u8>>>,
    pub daily_key_fetches: AtomicUsize,
}

#[async_trait]
impl BackendClient for StubBackend {
    async fn fetch_daily_key(&self) -> Result<DailyKeyResponse, BackendError> {
        self.daily_key_fetches.fetch_add(1, Ordering::SeqCst);
        self.daily_key
            .lock()
            .unwrap()
            .clone()
            .ok_or(BackendError::Status(404))
    }

    async fn fetch_key_issuer(&self, _: &str) -> Result<KeyIssuerResponse, BackendError> {
        self.issuer
            .lock()
            .unwrap()
            .clone()
            .ok_or(BackendError::Status(404))
    }

    async fn verify_ticket_hash(&self, _: &str) -> Result<(), BackendError> {
        if self.accept_tickets.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Status(404))
        }
    }

    async fn fetch_key_bundle(&self) -> Result<Vec<u8>, BackendError> {
        self.bundle
            .lock()
            .unwrap()
            .clone()
            .ok_or(BackendError::Status(404))
    }

    async fn fetch_bundle_certificate(&self) -> Result<Vec<u8>, BackendError> {
        Ok(b"stub certificate".to_vec())
    }

    async fn fetch_server_time(&self) -> Result<i64, BackendError> {
        Ok(now_unix())
    }
}

/// Hands the registry a fixed issuer certificate key instead of walking a
/// real X.509 chain.
#[allow(dead_code)]
pub struct StubIssuerVerifier {
    pub certificate_key: Vec<u8>,
}

impl IssuerVerifier for StubIssuerVerifier {
    fn verify_chain(&self, _: &str) -> Result<Vec<u8>, String> {
        Ok(self.certificate_key.clone())
    }
}

/// The operator side of the daily-key scheme: the secrets that live on the
/// backend, plus a stub serving their signed public halves.
#[allow(dead_code)]
pub struct Operator {
    pub backend: Arc<StubBackend>,
    pub daily_secret: SecretKey,
    pub certificate_key: Vec<u8>,
}

#[allow(dead_code)]
pub fn operator() -> Operator {
    operator_with_key_age(0)
}

#[allow(dead_code)]
pub fn operator_with_key_age(age_seconds: i64) -> Operator {
    let signing = SigningKey::random(&mut OsRng);
    let encryption = SigningKey::random(&mut OsRng);
    let certificate = SigningKey::random(&mut OsRng);
    let daily_secret = SecretKey::random(&mut OsRng);

    let public_key = daily_secret
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    let key = DailyKeyPair {
        id: 1,
        creation_timestamp: now_unix() - age_seconds,
        public_key: public_key.clone(),
        issuer_id: "issuer-1".to_string(),
    };
    let signature = sign::sign(&signing, &key.signed_payload());

    let backend = Arc::new(StubBackend::default());
    *backend.daily_key.lock().unwrap() = Some(DailyKeyResponse {
        id: key.id,
        creation_timestamp: key.creation_timestamp,
        public_key: codec::encode_base64(&public_key),
        issuer_id: key.issuer_id.clone(),
        signature: codec::encode_base64(&signature),
    });
    *backend.issuer.lock().unwrap() = Some(KeyIssuerResponse {
        id: "issuer-1".to_string(),
        certificate_chain: "verified by the stub".to_string(),
        signed_encryption_key_token: token(&encryption, &certificate),
        signed_signing_key_token: token(&signing, &certificate),
    });

    Operator {
        backend,
        daily_secret,
        certificate_key: sec1(&certificate),
    }
}

#[allow(dead_code)]
fn token(key: &SigningKey, issuer: &SigningKey) -> SignedKeyToken {
    let public_key = sec1(key);
    SignedKeyToken {
        public_key: codec::encode_base64(&public_key),
        signature: codec::encode_base64(&sign::sign(issuer, &public_key)),
    }
}

#[allow(dead_code)]
pub fn registry(operator: &Operator) -> DailyKeyRegistry {
    DailyKeyRegistry::new(
        operator.backend.clone(),
        synced_clock(),
        Arc::new(StubIssuerVerifier {
            certificate_key: operator.certificate_key.clone(),
        }),
    )
}
