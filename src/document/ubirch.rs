//! Signed test ticket provider (Ubirch-style).
//!
//! The ticket rides in a URL fragment as semicolon-delimited `key=value`
//! pairs, each key a single character. Keys map to named fields through the
//! table in [`TicketFields::assign`]; an unrecognized key is a hard parse
//! failure, not something to skip over. Verification hashes the canonical
//! JSON form of the fields and submits it to the remote verification
//! endpoint; only a successful response makes the ticket trustworthy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time};

use super::{
    Document, DocumentProvider, DocumentType, ImportError, Outcome, ParseError, VerificationError,
};
use crate::backend::BackendClient;
use crate::codec;

const OUTCOME_POSITIVE: &str = "p";
const OUTCOME_NEGATIVE: &str = "n";
const TYPE_PCR: &str = "PCR";

/// Wire order of the nine single-character keys, alphabetical.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct TicketFields {
    /// `b` — date of birth, `yyyyMMdd`.
    pub b: String,
    /// `d` — testing timestamp, `yyyyMMddHHmm`.
    pub d: String,
    /// `f` — family name.
    pub f: String,
    /// `g` — given name.
    pub g: String,
    /// `i` — lab id.
    pub i: String,
    /// `p` — provider/person id.
    pub p: String,
    /// `r` — result flag (`p` positive, `n` negative).
    pub r: String,
    /// `s` — salt.
    pub s: String,
    /// `t` — test type.
    pub t: String,
}

impl TicketFields {
    fn assign(&mut self, key: char, value: &str) -> Result<(), ParseError> {
        let slot = match key {
            'b' => &mut self.b,
            'd' => &mut self.d,
            'f' => &mut self.f,
            'g' => &mut self.g,
            'i' => &mut self.i,
            'p' => &mut self.p,
            'r' => &mut self.r,
            's' => &mut self.s,
            't' => &mut self.t,
            other => return Err(ParseError::UnknownKey(other)),
        };
        *slot = value.to_string();
        Ok(())
    }

    fn require_complete(&self) -> Result<(), ParseError> {
        for (key, value) in [
            ("b", &self.b),
            ("d", &self.d),
            ("f", &self.f),
            ("g", &self.g),
            ("i", &self.i),
            ("p", &self.p),
            ("r", &self.r),
            ("s", &self.s),
            ("t", &self.t),
        ] {
            if value.is_empty() {
                return Err(ParseError::MissingField(key));
            }
        }
        Ok(())
    }

    /// Canonical JSON the remote verifier hashes: the fields as an
    /// alphabetically-keyed object, stable across calls.
    pub fn canonical_json(&self) -> Result<String, ParseError> {
        serde_json::to_string(self).map_err(|e| ParseError::Malformed(e.to_string()))
    }

    /// base64 SHA-256 over the canonical JSON, as submitted for remote
    /// verification.
    pub fn verification_hash(&self) -> Result<String, ParseError> {
        Ok(codec::fingerprint(self.canonical_json()?.as_bytes()))
    }
}

fn parse_fields(raw: &str) -> Result<TicketFields, ParseError> {
    let (_, fragment) = raw
        .split_once('#')
        .ok_or_else(|| ParseError::Malformed("no URL fragment".to_string()))?;

    let mut fields = TicketFields::default();
    for pair in fragment.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ParseError::Malformed(format!("'{pair}' is not a key=value pair")))?;
        let mut chars = key.chars();
        let (Some(key), None) = (chars.next(), chars.next()) else {
            return Err(ParseError::Malformed(format!("'{key}' is not a single-character key")));
        };
        fields.assign(key, value)?;
    }
    fields.require_complete()?;
    Ok(fields)
}

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year][month][day]");

/// `yyyyMMdd` → Unix timestamp of midnight UTC.
fn parse_date(value: &str, field: &'static str) -> Result<i64, ParseError> {
    let date = Date::parse(value, DATE_FORMAT)
        .map_err(|e| ParseError::MalformedField(field, e.to_string()))?;
    Ok(date.midnight().assume_utc().unix_timestamp())
}

/// `yyyyMMddHHmm` → Unix timestamp.
fn parse_timestamp(value: &str, field: &'static str) -> Result<i64, ParseError> {
    if value.len() != 12 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::MalformedField(
            field,
            "want 12 digits yyyyMMddHHmm".to_string(),
        ));
    }
    let date = Date::parse(&value[..8], DATE_FORMAT)
        .map_err(|e| ParseError::MalformedField(field, e.to_string()))?;
    let hour: u8 = value[8..10]
        .parse()
        .map_err(|_| ParseError::MalformedField(field, "bad hour".to_string()))?;
    let minute: u8 = value[10..12]
        .parse()
        .map_err(|_| ParseError::MalformedField(field, "bad minute".to_string()))?;
    let time = Time::from_hms(hour, minute, 0)
        .map_err(|e| ParseError::MalformedField(field, e.to_string()))?;
    Ok(PrimitiveDateTime::new(date, time)
        .assume_utc()
        .unix_timestamp())
}

pub struct SignedTicketProvider {
    backend: Arc<dyn BackendClient>,
}

impl SignedTicketProvider {
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self { backend }
    }

    /// Parse only the wire fields, without building a document.
    pub fn parse_fields(raw: &str) -> Result<TicketFields, ParseError> {
        parse_fields(raw)
    }
}

#[async_trait]
impl DocumentProvider for SignedTicketProvider {
    fn can_parse(&self, raw: &str) -> bool {
        let Some((_, fragment)) = raw.split_once('#') else {
            return false;
        };
        let mut pairs = fragment.split(';').filter(|p| !p.is_empty()).peekable();
        pairs.peek().is_some()
            && pairs.all(|pair| {
                pair.split_once('=')
                    .map(|(key, _)| key.chars().count() == 1)
                    .unwrap_or(false)
            })
    }

    async fn parse(&self, raw: &str) -> Result<Document, ImportError> {
        let fields = parse_fields(raw)?;
        let testing_timestamp = parse_timestamp(&fields.d, "d")?;

        let outcome = match fields.r.as_str() {
            OUTCOME_POSITIVE => Outcome::Positive,
            OUTCOME_NEGATIVE => Outcome::Negative,
            _ => Outcome::Unknown,
        };
        let document_type = match fields.t.as_str() {
            TYPE_PCR => DocumentType::PcrTest,
            _ => DocumentType::Unknown,
        };

        Ok(Document {
            document_type,
            outcome,
            first_name: fields.g.clone(),
            last_name: fields.f.clone(),
            date_of_birth: Some(parse_date(&fields.b, "b")?),
            testing_timestamp,
            result_timestamp: testing_timestamp,
            import_timestamp: 0,
            issuer_name: fields.i.clone(),
            id: codec::fingerprint(raw.as_bytes()),
            encoded_data: raw.to_string(),
        })
    }

    async fn verify(&self, raw: &str) -> Result<(), ImportError> {
        let fields = parse_fields(raw)?;
        let hash = fields.verification_hash()?;
        self.backend.verify_ticket_hash(&hash).await.map_err(|e| {
            tracing::debug!("remote ticket verification rejected: {e}");
            ImportError::Verification(VerificationError::Unknown(e.to_string()))
        })
    }
}
