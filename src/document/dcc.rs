//! Generic signed certificate provider.
//!
//! Government-issued health certificates arrive as an `HC1:` prefix over a
//! base64 COSE_Sign1 envelope whose payload is a CWT-style claims map. The
//! issuer trust framework lives outside this crate: the envelope's key-id
//! and signature are handed to an injected [`TrustList`], which locates the
//! issuer key and decides. Name, age and recency checks flow through the
//! shared validation pipeline like every other scheme.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::baercode::{decode_sign1, signature_payload};
use super::{
    CredentialExpired, Document, DocumentProvider, DocumentType, ImportError, Outcome, ParseError,
    VerificationError,
};
use crate::cbor;
use crate::codec;
use crate::time::GenuineClock;

pub const PREFIX: &str = "HC1:";

const TEST_TYPE_PCR: &str = "PCR";

/// CWT-style claims wrapped by the COSE envelope.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    issuer: String,
    issued_at: i64,
    /// Unix timestamp after which the certificate is stale.
    expires_at: i64,
    certificate: HealthCertificate,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthCertificate {
    first_name: String,
    last_name: String,
    /// Unix timestamp of midnight UTC on the birth date.
    date_of_birth: Option<i64>,
    entry: CertificateEntry,
}

/// The one recorded event a certificate attests to.
#[derive(Debug, Serialize, Deserialize)]
enum CertificateEntry {
    Test {
        test_type: String,
        positive: bool,
        sampled_at: i64,
        resulted_at: i64,
    },
    Vaccination {
        doses: u32,
        required_doses: u32,
        vaccinated_at: i64,
    },
    Recovery {
        positive_test_at: i64,
        valid_from: i64,
    },
}

/// External trust-list signature check.
///
/// Implementations locate the issuer key for `kid` and verify `signature`
/// over `data`; how the list is distributed and updated is outside this
/// crate.
pub trait TrustList: Send + Sync {
    fn verify(&self, kid: &[u8], data: &[u8], signature: &[u8]) -> Result<(), String>;
}

pub struct CertificateProvider {
    trust_list: Arc<dyn TrustList>,
    clock: Arc<GenuineClock>,
}

impl CertificateProvider {
    pub fn new(trust_list: Arc<dyn TrustList>, clock: Arc<GenuineClock>) -> Self {
        Self { trust_list, clock }
    }

    fn decode(raw: &str) -> Result<coset::CoseSign1, ParseError> {
        let encoded = raw
            .strip_prefix(PREFIX)
            .ok_or_else(|| ParseError::Malformed("missing certificate prefix".to_string()))?;
        let bytes = codec::decode_base64(encoded)
            .map_err(|e| ParseError::Malformed(format!("not base64: {e}")))?;
        decode_sign1(&bytes)
    }

    fn claims(sign1: &coset::CoseSign1) -> Result<Claims, ParseError> {
        let payload = sign1
            .payload
            .as_deref()
            .ok_or_else(|| ParseError::Malformed("certificate payload is detached".to_string()))?;
        Ok(cbor::from_slice(payload)?)
    }
}

fn key_id(sign1: &coset::CoseSign1) -> Option<&[u8]> {
    if !sign1.protected.header.key_id.is_empty() {
        Some(&sign1.protected.header.key_id)
    } else if !sign1.unprotected.key_id.is_empty() {
        Some(&sign1.unprotected.key_id)
    } else {
        None
    }
}

fn classify(entry: &CertificateEntry) -> (DocumentType, Outcome, i64, i64) {
    match entry {
        CertificateEntry::Test {
            test_type,
            positive,
            sampled_at,
            resulted_at,
        } => {
            let document_type = if test_type == TEST_TYPE_PCR {
                DocumentType::PcrTest
            } else {
                DocumentType::RapidAntigenTest
            };
            let outcome = if *positive {
                Outcome::Positive
            } else {
                Outcome::Negative
            };
            (document_type, outcome, *sampled_at, *resulted_at)
        }
        CertificateEntry::Vaccination {
            doses,
            required_doses,
            vaccinated_at,
        } => {
            let outcome = if doses >= required_doses {
                Outcome::FullyImmune
            } else {
                Outcome::PartiallyImmune
            };
            (DocumentType::Vaccination, outcome, *vaccinated_at, *vaccinated_at)
        }
        CertificateEntry::Recovery {
            positive_test_at,
            valid_from,
        } => (
            DocumentType::Recovery,
            Outcome::FullyImmune,
            *positive_test_at,
            *valid_from,
        ),
    }
}

#[async_trait]
impl DocumentProvider for CertificateProvider {
    fn can_parse(&self, raw: &str) -> bool {
        raw.strip_prefix(PREFIX)
            .map(|encoded| codec::decode_base64(encoded).is_ok())
            .unwrap_or(false)
    }

    async fn parse(&self, raw: &str) -> Result<Document, ImportError> {
        let sign1 = Self::decode(raw)?;
        let claims = Self::claims(&sign1)?;
        let (document_type, outcome, testing_timestamp, result_timestamp) =
            classify(&claims.certificate.entry);

        Ok(Document {
            document_type,
            outcome,
            first_name: claims.certificate.first_name,
            last_name: claims.certificate.last_name,
            date_of_birth: claims.certificate.date_of_birth,
            testing_timestamp,
            result_timestamp,
            import_timestamp: 0,
            issuer_name: claims.issuer,
            id: codec::fingerprint(raw.as_bytes()),
            encoded_data: raw.to_string(),
        })
    }

    async fn verify(&self, raw: &str) -> Result<(), ImportError> {
        let sign1 = Self::decode(raw)?;
        let kid = key_id(&sign1).ok_or_else(|| {
            ImportError::Verification(VerificationError::InvalidSignature(
                "certificate carries no key id".to_string(),
            ))
        })?;
        self.trust_list
            .verify(kid, &signature_payload(&sign1), &sign1.signature)
            .map_err(|reason| {
                tracing::debug!(%reason, "certificate rejected by trust list");
                ImportError::Verification(VerificationError::InvalidSignature(reason))
            })?;

        let claims = Self::claims(&sign1)?;
        let now = self.clock.now()?;
        if now.unix_timestamp() >= claims.expires_at {
            return Err(CredentialExpired(format!(
                "certificate expired at {}",
                claims.expires_at
            ))
            .into());
        }
        if now.unix_timestamp() < claims.issued_at {
            return Err(VerificationError::Unknown(
                "certificate is not yet valid".to_string(),
            )
            .into());
        }
        Ok(())
    }
}
