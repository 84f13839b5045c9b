//! Health-status documents and the import pipeline.
//!
//! A raw scanned string enters the provider hierarchy
//! (`can_parse` → `parse` → `verify`) and, on success, the shared
//! validation pipeline ([`validate::validate_document`]) checks it against
//! the registered person before anything is trusted or persisted. Each
//! external credential scheme gets one [`DocumentProvider`]; the canonical
//! [`Document`] they all produce is what the rest of the app sees.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use time::Duration;

use crate::backend::BackendError;
use crate::cbor::CborError;
use crate::codec;
use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::time::{GenuineClock, NoGenuineTime};

pub mod appointment;
pub mod baercode;
pub mod dcc;
pub mod ubirch;
pub mod validate;

pub use appointment::AppointmentProvider;
pub use baercode::{BaercodeProvider, KeyBundleCache};
pub use dcc::{CertificateProvider, TrustList};
pub use ubirch::SignedTicketProvider;
pub use validate::validate_document;

/// What kind of proof a document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum DocumentType {
    Appointment,
    PcrTest,
    RapidAntigenTest,
    Vaccination,
    Recovery,
    Unknown,
}

impl DocumentType {
    /// How long an imported document of this type is kept before the
    /// expiry sweep removes it.
    pub fn retention(&self) -> Duration {
        match self {
            DocumentType::Appointment => Duration::days(14),
            DocumentType::PcrTest | DocumentType::RapidAntigenTest | DocumentType::Unknown => {
                Duration::days(28)
            }
            DocumentType::Vaccination | DocumentType::Recovery => Duration::days(365),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum Outcome {
    Positive,
    Negative,
    PartiallyImmune,
    FullyImmune,
    Unknown,
}

/// Canonical post-parse credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub document_type: DocumentType,
    pub outcome: Outcome,
    pub first_name: String,
    pub last_name: String,
    /// Unix timestamp of midnight UTC on the birth date, when the scheme
    /// carries one.
    pub date_of_birth: Option<i64>,
    pub testing_timestamp: i64,
    pub result_timestamp: i64,
    /// Set by the import pipeline after validation succeeds.
    pub import_timestamp: i64,
    /// Issuing lab or provider.
    pub issuer_name: String,
    /// Stable content-derived identifier; re-importing the same payload
    /// yields the same id.
    pub id: String,
    /// The original encoded payload as scanned.
    pub encoded_data: String,
}

impl Document {
    /// Canonical byte form used for server-side redemption fingerprints.
    pub fn hashable_encoded_data(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}",
            self.document_type,
            self.first_name,
            self.last_name,
            self.date_of_birth.unwrap_or_default(),
            self.testing_timestamp,
        )
        .into_bytes()
    }

    pub fn redemption_fingerprint(&self) -> String {
        codec::fingerprint(&self.hashable_encoded_data())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
    pub first_name: String,
    pub last_name: String,
}

impl PersonName {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

/// Default ceiling for the child date-of-birth window.
pub const MAX_CHILD_AGE_YEARS: i32 = 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Person {
    Guest(PersonName),
    Child {
        name: PersonName,
        /// Age ceiling applied during validation only; parsing never
        /// consults it.
        max_age_years: i32,
    },
}

impl Person {
    pub fn guest(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Person::Guest(PersonName::new(first_name, last_name))
    }

    pub fn child(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Person::Child {
            name: PersonName::new(first_name, last_name),
            max_age_years: MAX_CHILD_AGE_YEARS,
        }
    }

    pub fn name(&self) -> &PersonName {
        match self {
            Person::Guest(name) => name,
            Person::Child { name, .. } => name,
        }
    }
}

/// Malformed or unrecognized input structure. Always recoverable: try the
/// next provider or report the code as unsupported.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no provider recognizes this encoding")]
    UnrecognizedEncoding,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unknown field key '{0}'")]
    UnknownKey(char),
    #[error("malformed value for '{0}': {1}")]
    MalformedField(&'static str, String),
    #[error("malformed structure: {0}")]
    Malformed(String),
    #[error("procedure list is empty")]
    EmptyProcedures,
    #[error("procedure list mixes vaccination and test entries")]
    MixedProcedures,
    #[error(transparent)]
    Cbor(#[from] CborError),
}

/// Authenticity or consistency failure after a successful structural parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("credential name matches no registered person")]
    NameMismatch,
    #[error("testing timestamp lies in the future")]
    TimestampInFuture,
    #[error("date of birth exceeds the child age window")]
    DateOfBirthTooOldForChild,
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),
    #[error("verification failed: {0}")]
    Unknown(String),
}

/// The credential (or its supporting key bundle) is structurally valid but
/// temporally stale. Distinct from a verification failure.
#[derive(Debug, Error)]
#[error("credential expired: {0}")]
pub struct CredentialExpired(pub String);

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Expired(#[from] CredentialExpired),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    NoGenuineTime(#[from] NoGenuineTime),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One external credential scheme.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    /// Cheap, side-effect-free structural test. Malformed input yields
    /// `false`, never an error.
    fn can_parse(&self, raw: &str) -> bool;

    /// Decode the raw payload into the canonical document.
    async fn parse(&self, raw: &str) -> Result<Document, ImportError>;

    /// Authenticity check. Default no-op for schemes whose trust is
    /// implicit in possession of the scanned code.
    async fn verify(&self, _raw: &str) -> Result<(), ImportError> {
        Ok(())
    }
}

/// Runs the four-stage import pipeline over the registered providers.
///
/// Per document the stages are strictly sequential; independent imports may
/// run concurrently. Nothing is persisted until the whole pipeline has
/// succeeded, so an abandoned import leaves no partial state behind.
pub struct DocumentImporter {
    providers: Vec<Arc<dyn DocumentProvider>>,
    clock: Arc<GenuineClock>,
}

impl DocumentImporter {
    pub fn new(clock: Arc<GenuineClock>) -> Self {
        Self {
            providers: Vec::new(),
            clock,
        }
    }

    pub fn register(mut self, provider: Arc<dyn DocumentProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Import a scanned payload for the registered person and children.
    pub async fn import(
        &self,
        raw: &str,
        person: &Person,
        children: &[Person],
    ) -> Result<Document, ImportError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.can_parse(raw))
            .ok_or(ParseError::UnrecognizedEncoding)?;

        let mut document = provider.parse(raw).await?;
        if document.result_timestamp < document.testing_timestamp {
            return Err(ParseError::Malformed(
                "result timestamp predates testing timestamp".to_string(),
            )
            .into());
        }

        provider.verify(raw).await?;

        let now = self.clock.now()?;
        validate::validate_document(&mut document, person, children, now)?;
        document.import_timestamp = now.unix_timestamp();
        tracing::info!(
            id = %document.id,
            document_type = %document.document_type,
            "document imported"
        );
        Ok(document)
    }
}
