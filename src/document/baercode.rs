//! Bundle-encrypted credential provider (Baercode-style).
//!
//! The scanned payload is base64 over a two-byte version header followed by
//! a COSE_Sign1 envelope. The envelope's payload is an encrypted inner
//! layer whose key-id can be read without decrypting anything; a separately
//! fetched, COSE-signed key bundle supplies the matching key material. Only
//! after the outer signature verifies against the located key is the inner
//! layer decrypted and the health certificate read out.
//!
//! The key bundle is shared mutable state across imports: it is refreshed
//! under a single-flight lock and carries its own freshness window. A
//! credential whose key-id is absent from the current bundle is *expired*
//! (the bundle may simply be newer than the credential), never a parse
//! failure.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use coset::{sig_structure_data, CborSerializable, SignatureContext, TaggedCborSerializable};
use serde::{Deserialize, Serialize};
use x509_cert::der::{Decode, DecodePem};
use x509_cert::Certificate;

use super::{
    CredentialExpired, Document, DocumentProvider, DocumentType, ImportError, Outcome, ParseError,
    VerificationError,
};
use crate::backend::BackendClient;
use crate::cbor;
use crate::codec;
use crate::crypto::{sign, CryptoError};
use crate::daily_key::{check_issued, spki_bytes};
use crate::time::GenuineClock;

/// Only major version 1 payloads are understood.
pub const VERSION_MAJOR: u8 = 1;

/// Bytes of a derived key-id.
pub const KEY_ID_LENGTH: usize = 8;

const ISSUER_NAME: &str = "Baercode";

/// One recorded test or vaccination event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure {
    pub kind: ProcedureKind,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    PcrTest,
    RapidAntigenTest,
    VaccinationComirnaty,
    VaccinationJannsen,
    VaccinationModerna,
    VaccinationVaxzevria,
}

impl ProcedureKind {
    fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            1 => Ok(ProcedureKind::PcrTest),
            2 => Ok(ProcedureKind::RapidAntigenTest),
            3 => Ok(ProcedureKind::VaccinationComirnaty),
            4 => Ok(ProcedureKind::VaccinationJannsen),
            5 => Ok(ProcedureKind::VaccinationModerna),
            6 => Ok(ProcedureKind::VaccinationVaxzevria),
            other => Err(ParseError::MalformedField(
                "procedure",
                format!("unknown procedure code {other}"),
            )),
        }
    }

    pub fn is_vaccination(&self) -> bool {
        matches!(
            self,
            ProcedureKind::VaccinationComirnaty
                | ProcedureKind::VaccinationJannsen
                | ProcedureKind::VaccinationModerna
                | ProcedureKind::VaccinationVaxzevria
        )
    }

    /// Doses needed for full immunization with this vaccine.
    pub fn required_doses(&self) -> usize {
        match self {
            ProcedureKind::VaccinationJannsen => 1,
            _ => 2,
        }
    }
}

/// Encrypted inner layer of the credential envelope. The key-id is readable
/// without the decryption key.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedLayer {
    #[serde(with = "serde_bytes")]
    kid: Vec<u8>,
    #[serde(with = "serde_bytes")]
    iv: Vec<u8>,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

/// Decrypted health certificate carried inside the envelope.
#[derive(Debug, Serialize, Deserialize)]
struct HealthCertificate {
    first_name: String,
    last_name: String,
    /// Unix timestamp of midnight UTC on the birth date.
    date_of_birth: i64,
    disease_type: u8,
    result: bool,
    procedures: Vec<RawProcedure>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawProcedure {
    kind: u8,
    timestamp: i64,
}

/// Key material vouched for by the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleKey {
    /// SEC1-encoded P-256 point; verifies credential envelope signatures.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// AES-256 key; decrypts the inner layer.
    #[serde(with = "serde_bytes")]
    pub encryption_key: Vec<u8>,
}

/// Key-ids are derived from the key material itself, never trusted as
/// transmitted.
pub fn derive_key_id(public_key: &[u8]) -> Vec<u8> {
    codec::sha256(public_key)[..KEY_ID_LENGTH].to_vec()
}

/// The COSE-signed key bundle: issuance date, freshness window and keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub issued_at: i64,
    pub freshness_seconds: i64,
    pub keys: Vec<BundleKey>,
}

impl KeyBundle {
    /// Stale iff `now` has reached the end of the freshness window.
    pub fn is_stale(&self, now_unix: i64) -> bool {
        now_unix >= self.issued_at + self.freshness_seconds
    }

    pub fn key_for(&self, kid: &[u8]) -> Option<&BundleKey> {
        self.keys
            .iter()
            .find(|key| derive_key_id(&key.public_key) == kid)
    }
}

/// Verifies the bundle's issuing certificate and yields its public key.
pub trait BundleCertificateVerifier: Send + Sync {
    fn verify(&self, certificate: &[u8]) -> Result<Vec<u8>, String>;
}

/// Checks the issuing certificate (DER or PEM) against a pinned authority
/// key.
pub struct PinnedAuthorityVerifier {
    /// SEC1 public key of the pinned certificate authority.
    pinned_authority: Vec<u8>,
}

impl PinnedAuthorityVerifier {
    pub fn new(pinned_authority: Vec<u8>) -> Self {
        Self { pinned_authority }
    }
}

impl BundleCertificateVerifier for PinnedAuthorityVerifier {
    fn verify(&self, certificate: &[u8]) -> Result<Vec<u8>, String> {
        let certificate = if certificate.starts_with(b"-----BEGIN") {
            Certificate::from_pem(certificate)
                .map_err(|e| format!("undecodable PEM certificate: {e}"))?
        } else {
            Certificate::from_der(certificate)
                .map_err(|e| format!("undecodable DER certificate: {e}"))?
        };
        check_issued(&certificate, &self.pinned_authority)?;
        spki_bytes(&certificate)
    }
}

struct CachedBundle {
    bundle: KeyBundle,
    fetched_at: i64,
}

/// Instance-owned cache for the key bundle and its certificate.
///
/// The lock is held across the refresh, so concurrent imports needing a
/// stale bundle trigger exactly one fetch and all await its result.
pub struct KeyBundleCache {
    backend: Arc<dyn BackendClient>,
    clock: Arc<GenuineClock>,
    certificate_verifier: Arc<dyn BundleCertificateVerifier>,
    ignore_freshness_window: bool,
    cache: tokio::sync::Mutex<Option<CachedBundle>>,
}

impl KeyBundleCache {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        clock: Arc<GenuineClock>,
        certificate_verifier: Arc<dyn BundleCertificateVerifier>,
    ) -> Self {
        Self {
            backend,
            clock,
            certificate_verifier,
            ignore_freshness_window: false,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Disable the freshness check. Injected configuration for tests;
    /// release configurations leave this off.
    pub fn ignore_freshness_window(mut self, ignore: bool) -> Self {
        self.ignore_freshness_window = ignore;
        self
    }

    /// Whether the next [`get`](Self::get) would refresh from the network.
    pub async fn needs_refresh(&self) -> Result<bool, ImportError> {
        let now = self.clock.now()?;
        let cache = self.cache.lock().await;
        Ok(match cache.as_ref() {
            Some(cached) => {
                cached.bundle.is_stale(now.unix_timestamp()) && !self.ignore_freshness_window
            }
            None => true,
        })
    }

    /// The current key bundle, refreshed and re-verified if stale.
    pub async fn get(&self) -> Result<KeyBundle, ImportError> {
        let now = self.clock.now()?;
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if !cached.bundle.is_stale(now.unix_timestamp()) || self.ignore_freshness_window {
                return Ok(cached.bundle.clone());
            }
            tracing::debug!(fetched_at = cached.fetched_at, "key bundle stale, refreshing");
        }

        let bundle = self.fetch_and_verify().await?;
        if bundle.is_stale(now.unix_timestamp()) && !self.ignore_freshness_window {
            return Err(CredentialExpired(
                "key bundle is older than its freshness window".to_string(),
            )
            .into());
        }
        tracing::info!(
            issued_at = bundle.issued_at,
            keys = bundle.keys.len(),
            "key bundle verified"
        );
        *cache = Some(CachedBundle {
            bundle: bundle.clone(),
            fetched_at: now.unix_timestamp(),
        });
        Ok(bundle)
    }

    async fn fetch_and_verify(&self) -> Result<KeyBundle, ImportError> {
        let bundle_bytes = self.backend.fetch_key_bundle().await?;
        let certificate = self.backend.fetch_bundle_certificate().await?;

        let certificate_key = self
            .certificate_verifier
            .verify(&certificate)
            .map_err(|reason| {
                ImportError::Verification(VerificationError::InvalidSignature(reason))
            })?;

        let sign1 = decode_sign1(&bundle_bytes)?;
        let payload = sign1
            .payload
            .as_deref()
            .ok_or_else(|| ParseError::Malformed("key bundle payload is detached".to_string()))?;
        if !sign::verify_raw(&signature_payload(&sign1), &sign1.signature, &certificate_key)? {
            return Err(VerificationError::InvalidSignature(
                "key bundle signature does not verify against its certificate".to_string(),
            )
            .into());
        }
        Ok(cbor::from_slice(payload).map_err(ParseError::Cbor)?)
    }
}

pub(super) fn decode_sign1(bytes: &[u8]) -> Result<coset::CoseSign1, ParseError> {
    coset::CoseSign1::from_tagged_slice(bytes)
        .or_else(|_| coset::CoseSign1::from_slice(bytes))
        .map_err(|e| ParseError::Malformed(format!("undecodable COSE envelope: {e}")))
}

pub(super) fn signature_payload(sign1: &coset::CoseSign1) -> Vec<u8> {
    sig_structure_data(
        SignatureContext::CoseSign1,
        sign1.protected.clone(),
        None,
        &[],
        sign1.payload.as_deref().unwrap_or(&[]),
    )
}

fn decrypt_aes_gcm(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != 12 {
        return Err(CryptoError::InvalidKeyMaterial(
            "initialization vector must be 12 bytes".to_string(),
        ));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::MacMismatch)
}

pub struct BaercodeProvider {
    bundle_cache: Arc<KeyBundleCache>,
}

impl BaercodeProvider {
    pub fn new(bundle_cache: Arc<KeyBundleCache>) -> Self {
        Self { bundle_cache }
    }

    /// Sort ascending by timestamp and reject empty or mixed lists.
    fn decode_procedures(raw: &[RawProcedure]) -> Result<Vec<Procedure>, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::EmptyProcedures);
        }
        let mut procedures = raw
            .iter()
            .map(|p| {
                Ok(Procedure {
                    kind: ProcedureKind::from_code(p.kind)?,
                    timestamp: p.timestamp,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        procedures.sort_by_key(|p| p.timestamp);

        let vaccinated = procedures[0].kind.is_vaccination();
        if procedures.iter().any(|p| p.kind.is_vaccination() != vaccinated) {
            return Err(ParseError::MixedProcedures);
        }
        Ok(procedures)
    }

    fn classify(procedures: &[Procedure], result: bool) -> Result<(DocumentType, Outcome), ParseError> {
        let latest = procedures.last().ok_or(ParseError::EmptyProcedures)?;
        if latest.kind.is_vaccination() {
            let outcome = if !result {
                Outcome::Unknown
            } else if procedures.len() >= latest.kind.required_doses() {
                Outcome::FullyImmune
            } else {
                Outcome::PartiallyImmune
            };
            return Ok((DocumentType::Vaccination, outcome));
        }
        let document_type = match latest.kind {
            ProcedureKind::PcrTest => DocumentType::PcrTest,
            _ => DocumentType::RapidAntigenTest,
        };
        let outcome = if result {
            Outcome::Positive
        } else {
            Outcome::Negative
        };
        Ok((document_type, outcome))
    }
}

#[async_trait]
impl DocumentProvider for BaercodeProvider {
    fn can_parse(&self, raw: &str) -> bool {
        codec::decode_base64(raw)
            .map(|bytes| bytes.len() > 2 && bytes[0] == VERSION_MAJOR)
            .unwrap_or(false)
    }

    async fn parse(&self, raw: &str) -> Result<Document, ImportError> {
        let bytes = codec::decode_base64(raw)
            .map_err(|e| ParseError::Malformed(format!("not base64: {e}")))?;
        if bytes.len() <= 2 {
            return Err(ParseError::Malformed("payload too short".to_string()).into());
        }
        if bytes[0] != VERSION_MAJOR {
            return Err(
                ParseError::Malformed(format!("unsupported version {}.{}", bytes[0], bytes[1]))
                    .into(),
            );
        }

        let sign1 = decode_sign1(&bytes[2..])?;
        let envelope_payload = sign1
            .payload
            .as_deref()
            .ok_or_else(|| ParseError::Malformed("credential payload is detached".to_string()))?;
        let layer: EncryptedLayer =
            cbor::from_slice(envelope_payload).map_err(ParseError::Cbor)?;

        let bundle = self.bundle_cache.get().await?;
        let key = bundle.key_for(&layer.kid).ok_or_else(|| {
            CredentialExpired("no bundle key matches the credential key-id".to_string())
        })?;

        if !sign::verify_raw(&signature_payload(&sign1), &sign1.signature, &key.public_key)? {
            return Err(VerificationError::InvalidSignature(
                "credential signature does not verify against the bundle key".to_string(),
            )
            .into());
        }

        let plaintext = decrypt_aes_gcm(&key.encryption_key, &layer.iv, &layer.ciphertext)?;
        let certificate: HealthCertificate =
            cbor::from_slice(&plaintext).map_err(ParseError::Cbor)?;

        let procedures = Self::decode_procedures(&certificate.procedures)?;
        let (document_type, outcome) = Self::classify(&procedures, certificate.result)?;
        let testing_timestamp = procedures
            .last()
            .map(|p| p.timestamp)
            .ok_or(ParseError::EmptyProcedures)?;

        Ok(Document {
            document_type,
            outcome,
            first_name: certificate.first_name,
            last_name: certificate.last_name,
            date_of_birth: Some(certificate.date_of_birth),
            testing_timestamp,
            result_timestamp: testing_timestamp,
            import_timestamp: 0,
            issuer_name: ISSUER_NAME.to_string(),
            id: codec::fingerprint(&bytes),
            encoded_data: raw.to_string(),
        })
    }

    // No separate verification step: the envelope signature can only be
    // checked against the bundle key located during parsing, so it happens
    // there, before decryption.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, DailyKeyResponse, KeyIssuerResponse};
    use coset::{iana, CoseSign1Builder, HeaderBuilder};
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use rand::rngs::OsRng;
    use rand::RngCore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    fn cose_sign(payload: Vec<u8>, key: &SigningKey) -> Vec<u8> {
        let protected = HeaderBuilder::new()
            .algorithm(iana::Algorithm::ES256)
            .build();
        CoseSign1Builder::new()
            .protected(protected)
            .payload(payload)
            .create_signature(&[], |data| {
                let signature: Signature = key.sign(data);
                signature.to_bytes().to_vec()
            })
            .build()
            .to_tagged_vec()
            .unwrap()
    }

    struct BundleBackend {
        bundle: Vec<u8>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl BackendClient for BundleBackend {
        async fn fetch_daily_key(&self) -> Result<DailyKeyResponse, BackendError> {
            Err(BackendError::Status(404))
        }
        async fn fetch_key_issuer(&self, _: &str) -> Result<KeyIssuerResponse, BackendError> {
            Err(BackendError::Status(404))
        }
        async fn verify_ticket_hash(&self, _: &str) -> Result<(), BackendError> {
            Err(BackendError::Status(404))
        }
        async fn fetch_key_bundle(&self) -> Result<Vec<u8>, BackendError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.bundle.clone())
        }
        async fn fetch_bundle_certificate(&self) -> Result<Vec<u8>, BackendError> {
            Ok(b"stubbed certificate".to_vec())
        }
        async fn fetch_server_time(&self) -> Result<i64, BackendError> {
            Ok(OffsetDateTime::now_utc().unix_timestamp())
        }
    }

    struct StubCertificateVerifier {
        key: Vec<u8>,
    }

    impl BundleCertificateVerifier for StubCertificateVerifier {
        fn verify(&self, _: &[u8]) -> Result<Vec<u8>, String> {
            Ok(self.key.clone())
        }
    }

    struct Fixture {
        provider: BaercodeProvider,
        backend: Arc<BundleBackend>,
        credential_key: SigningKey,
        encryption_key: [u8; 32],
    }

    fn now_unix() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn fixture_with_bundle_age(age_seconds: i64, ignore_freshness: bool) -> Fixture {
        let bundle_signer = SigningKey::random(&mut OsRng);
        let credential_key = SigningKey::random(&mut OsRng);
        let mut encryption_key = [0u8; 32];
        OsRng.fill_bytes(&mut encryption_key);

        let bundle = KeyBundle {
            issued_at: now_unix() - age_seconds,
            freshness_seconds: 86_400,
            keys: vec![BundleKey {
                public_key: credential_key
                    .verifying_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec(),
                encryption_key: encryption_key.to_vec(),
            }],
        };
        let bundle_bytes = cose_sign(cbor::to_vec(&bundle).unwrap(), &bundle_signer);

        let backend = Arc::new(BundleBackend {
            bundle: bundle_bytes,
            fetches: AtomicUsize::new(0),
        });
        let clock = GenuineClock::default();
        clock.record_sync(now_unix()).unwrap();

        let cache = KeyBundleCache::new(
            backend.clone(),
            Arc::new(clock),
            Arc::new(StubCertificateVerifier {
                key: bundle_signer
                    .verifying_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec(),
            }),
        )
        .ignore_freshness_window(ignore_freshness);

        Fixture {
            provider: BaercodeProvider::new(Arc::new(cache)),
            backend,
            credential_key,
            encryption_key,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_bundle_age(0, false)
    }

    fn credential(f: &Fixture, procedures: Vec<RawProcedure>, result: bool) -> String {
        let certificate = HealthCertificate {
            first_name: "Erika".to_string(),
            last_name: "Mustermann".to_string(),
            date_of_birth: -169_948_800,
            disease_type: 1,
            result,
            procedures,
        };
        let plaintext = cbor::to_vec(&certificate).unwrap();

        let mut iv = [0u8; 12];
        OsRng.fill_bytes(&mut iv);
        let cipher = Aes256Gcm::new_from_slice(&f.encryption_key).unwrap();
        let ciphertext = cipher.encrypt(Nonce::from_slice(&iv), plaintext.as_slice()).unwrap();

        let layer = EncryptedLayer {
            kid: derive_key_id(
                f.credential_key
                    .verifying_key()
                    .to_encoded_point(false)
                    .as_bytes(),
            ),
            iv: iv.to_vec(),
            ciphertext,
        };
        let envelope = cose_sign(cbor::to_vec(&layer).unwrap(), &f.credential_key);

        let mut bytes = vec![VERSION_MAJOR, 0];
        bytes.extend_from_slice(&envelope);
        codec::encode_base64(&bytes)
    }

    fn vaccination(kind: u8, count: usize) -> Vec<RawProcedure> {
        (0..count)
            .map(|i| RawProcedure {
                kind,
                timestamp: 1_601_481_600 + i as i64 * 28 * 86_400,
            })
            .collect()
    }

    #[tokio::test]
    async fn two_comirnaty_doses_are_fully_immune() {
        let f = fixture();
        let raw = credential(&f, vaccination(3, 2), true);
        assert!(f.provider.can_parse(&raw));
        let document = f.provider.parse(&raw).await.unwrap();
        assert_eq!(document.document_type, DocumentType::Vaccination);
        assert_eq!(document.outcome, Outcome::FullyImmune);
        assert_eq!(document.first_name, "Erika");
        // Latest procedure sets the testing timestamp.
        assert_eq!(document.testing_timestamp, 1_601_481_600 + 28 * 86_400);
    }

    #[tokio::test]
    async fn single_jannsen_dose_is_fully_immune() {
        let f = fixture();
        let raw = credential(&f, vaccination(4, 1), true);
        let document = f.provider.parse(&raw).await.unwrap();
        assert_eq!(document.outcome, Outcome::FullyImmune);
    }

    #[tokio::test]
    async fn single_comirnaty_dose_is_partially_immune() {
        let f = fixture();
        let raw = credential(&f, vaccination(3, 1), true);
        let document = f.provider.parse(&raw).await.unwrap();
        assert_eq!(document.outcome, Outcome::PartiallyImmune);
    }

    #[tokio::test]
    async fn unsuccessful_vaccination_is_unknown() {
        let f = fixture();
        let raw = credential(&f, vaccination(3, 2), false);
        let document = f.provider.parse(&raw).await.unwrap();
        assert_eq!(document.outcome, Outcome::Unknown);
    }

    #[tokio::test]
    async fn test_outcome_follows_the_result_flag() {
        let f = fixture();
        let procedures = vec![RawProcedure {
            kind: 1,
            timestamp: 1_601_481_600,
        }];
        let positive = f
            .provider
            .parse(&credential(&f, vec![RawProcedure { kind: 1, timestamp: 1_601_481_600 }], true))
            .await
            .unwrap();
        assert_eq!(positive.document_type, DocumentType::PcrTest);
        assert_eq!(positive.outcome, Outcome::Positive);
        let negative = f
            .provider
            .parse(&credential(&f, procedures, false))
            .await
            .unwrap();
        assert_eq!(negative.outcome, Outcome::Negative);
    }

    #[tokio::test]
    async fn empty_procedures_fail_to_parse() {
        let f = fixture();
        let raw = credential(&f, Vec::new(), true);
        assert!(matches!(
            f.provider.parse(&raw).await,
            Err(ImportError::Parse(ParseError::EmptyProcedures))
        ));
    }

    #[tokio::test]
    async fn mixed_procedures_fail_to_parse() {
        let f = fixture();
        let raw = credential(
            &f,
            vec![
                RawProcedure {
                    kind: 1,
                    timestamp: 1_601_481_600,
                },
                RawProcedure {
                    kind: 3,
                    timestamp: 1_601_568_000,
                },
            ],
            true,
        );
        assert!(matches!(
            f.provider.parse(&raw).await,
            Err(ImportError::Parse(ParseError::MixedProcedures))
        ));
    }

    #[tokio::test]
    async fn procedures_are_sorted_before_classification() {
        let f = fixture();
        // Out of order on the wire; the later dose must drive the counts.
        let raw = credential(
            &f,
            vec![
                RawProcedure {
                    kind: 3,
                    timestamp: 1_604_160_000,
                },
                RawProcedure {
                    kind: 3,
                    timestamp: 1_601_481_600,
                },
            ],
            true,
        );
        let document = f.provider.parse(&raw).await.unwrap();
        assert_eq!(document.outcome, Outcome::FullyImmune);
        assert_eq!(document.testing_timestamp, 1_604_160_000);
    }

    #[tokio::test]
    async fn unknown_key_id_is_credential_expired() {
        let f = fixture();
        let stranger = fixture();
        // Signed and encrypted under a key the bundle does not carry.
        let raw = credential(&stranger, vaccination(3, 2), true);
        assert!(matches!(
            f.provider.parse(&raw).await,
            Err(ImportError::Expired(CredentialExpired(_)))
        ));
    }

    #[tokio::test]
    async fn tampered_envelope_signature_is_rejected() {
        let f = fixture();
        let raw = credential(&f, vaccination(3, 2), true);
        let mut bytes = codec::decode_base64(&raw).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = codec::encode_base64(&bytes);
        assert!(matches!(
            f.provider.parse(&tampered).await,
            Err(ImportError::Verification(
                VerificationError::InvalidSignature(_)
            ))
        ));
    }

    #[tokio::test]
    async fn stale_bundle_is_credential_expired() {
        let f = fixture_with_bundle_age(2 * 86_400, false);
        let raw = credential(&f, vaccination(3, 2), true);
        assert!(matches!(
            f.provider.parse(&raw).await,
            Err(ImportError::Expired(CredentialExpired(_)))
        ));
    }

    #[tokio::test]
    async fn freshness_override_accepts_stale_bundle() {
        let f = fixture_with_bundle_age(2 * 86_400, true);
        let raw = credential(&f, vaccination(3, 2), true);
        assert!(f.provider.parse(&raw).await.is_ok());
    }

    #[tokio::test]
    async fn bundle_is_fetched_once_while_fresh() {
        let f = fixture();
        let raw = credential(&f, vaccination(3, 2), true);
        f.provider.parse(&raw).await.unwrap();
        f.provider.parse(&raw).await.unwrap();
        assert_eq!(f.backend.fetches.load(Ordering::SeqCst), 1);
        assert!(!f.provider.bundle_cache.needs_refresh().await.unwrap());
    }

    #[test]
    fn rejects_wrong_version_and_garbage() {
        let f = fixture();
        assert!(!f.provider.can_parse("not base64 at all!"));
        let wrong_version = codec::encode_base64(&[9, 0, 1, 2, 3]);
        assert!(!f.provider.can_parse(&wrong_version));
    }
}
