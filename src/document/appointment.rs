//! Appointment ticket provider.
//!
//! Appointments are scanned as plain URLs whose query string carries five
//! mandatory parameters (`type`, `lab`, `address`, `timestamp`, `qrCode`).
//! There is no signature; trust is implicit in possession of the scanned
//! code. The document identifier is derived from `qrCode` alone, so
//! re-scanning the same appointment is idempotent.

use async_trait::async_trait;

use super::{Document, DocumentProvider, DocumentType, ImportError, Outcome, ParseError};
use crate::codec;

const PATH_MARKER: &str = "/appointment";

const PARAM_TYPE: &str = "type";
const PARAM_LAB: &str = "lab";
const PARAM_ADDRESS: &str = "address";
const PARAM_TIMESTAMP: &str = "timestamp";
const PARAM_QR_CODE: &str = "qrCode";

#[derive(Debug, Default)]
pub struct AppointmentProvider;

impl AppointmentProvider {
    pub fn new() -> Self {
        Self
    }

    fn parse_url(raw: &str) -> Result<AppointmentFields, ParseError> {
        let (path, query) = raw
            .split_once('?')
            .ok_or_else(|| ParseError::Malformed("no query string".to_string()))?;
        if !path.ends_with(PATH_MARKER) {
            return Err(ParseError::Malformed(
                "not an appointment URL".to_string(),
            ));
        }

        let mut fields = AppointmentFields::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value)?;
            match key {
                PARAM_TYPE => fields.appointment_type = Some(value),
                PARAM_LAB => fields.lab = Some(value),
                PARAM_ADDRESS => fields.address = Some(value),
                PARAM_TIMESTAMP => fields.timestamp = Some(value),
                PARAM_QR_CODE => fields.qr_code = Some(value),
                // Foreign parameters are tolerated, the five above are not
                // optional.
                _ => {}
            }
        }
        fields.require_complete()?;
        Ok(fields)
    }
}

#[derive(Debug, Default)]
struct AppointmentFields {
    appointment_type: Option<String>,
    lab: Option<String>,
    address: Option<String>,
    timestamp: Option<String>,
    qr_code: Option<String>,
}

impl AppointmentFields {
    fn require_complete(&self) -> Result<(), ParseError> {
        for (name, value) in [
            (PARAM_TYPE, &self.appointment_type),
            (PARAM_LAB, &self.lab),
            (PARAM_ADDRESS, &self.address),
            (PARAM_TIMESTAMP, &self.timestamp),
            (PARAM_QR_CODE, &self.qr_code),
        ] {
            if value.is_none() {
                return Err(ParseError::MissingField(name));
            }
        }
        Ok(())
    }
}

/// Decode `%XX` escapes and `+` in a query parameter value.
fn percent_decode(value: &str) -> Result<String, ParseError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        ParseError::Malformed("truncated percent escape".to_string())
                    })?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|e| ParseError::Malformed(e.to_string()))
}

#[async_trait]
impl DocumentProvider for AppointmentProvider {
    fn can_parse(&self, raw: &str) -> bool {
        raw.split_once('?')
            .map(|(path, _)| path.ends_with(PATH_MARKER))
            .unwrap_or(false)
    }

    async fn parse(&self, raw: &str) -> Result<Document, ImportError> {
        let fields = Self::parse_url(raw)?;
        // require_complete ran; the unwraps below cannot fire.
        let timestamp_millis: i64 = fields
            .timestamp
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|_| {
                ParseError::MalformedField(PARAM_TIMESTAMP, "not a unix timestamp".to_string())
            })?;
        let timestamp = timestamp_millis / 1000;
        let qr_code = fields.qr_code.unwrap_or_default();

        Ok(Document {
            document_type: DocumentType::Appointment,
            outcome: Outcome::Unknown,
            first_name: String::new(),
            last_name: String::new(),
            date_of_birth: None,
            testing_timestamp: timestamp,
            result_timestamp: timestamp,
            import_timestamp: 0,
            issuer_name: fields.lab.unwrap_or_default(),
            id: codec::fingerprint(qr_code.as_bytes()),
            encoded_data: raw.to_string(),
        })
    }
}
