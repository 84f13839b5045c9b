//! Shared validation pipeline.
//!
//! Every provider's output passes through [`validate_document`] before it is
//! trusted: the credential's holder name must match the registrant or one of
//! the children, the testing timestamp must not lie in the future, and a
//! matched child's date of birth must fall inside the child age window.
//!
//! Name matching is tolerant of academic titles, case and punctuation; on a
//! match the document's name is rewritten to the matched person's canonical
//! spelling so later equality checks are exact.

use time::{Duration, OffsetDateTime};

use super::{Document, Person, PersonName, VerificationError};

/// Strip leading academic titles, repeatedly ("Prof. Dr. Tom" → "Tom").
fn strip_titles(name: &str) -> &str {
    let mut name = name;
    loop {
        let trimmed = name.trim_start();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("prof. ") {
            name = &trimmed["prof. ".len()..];
        } else if lower.starts_with("dr. ") {
            name = &trimmed["dr. ".len()..];
        } else {
            return trimmed;
        }
    }
}

/// Canonical comparison form: titles stripped, uppercased, ASCII letters only.
pub(crate) fn normalize_name(raw: &str) -> String {
    strip_titles(raw)
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect()
}

struct Candidate {
    name: PersonName,
    max_age_years: Option<i32>,
}

/// Candidate order is fixed: registrant, then children, then synthesized
/// children. The first passing candidate wins.
fn candidates(person: &Person, children: &[Person]) -> Vec<Candidate> {
    let registrant = person.name().clone();
    let mut set = vec![Candidate {
        name: registrant.clone(),
        max_age_years: match person {
            Person::Child { max_age_years, .. } => Some(*max_age_years),
            Person::Guest(_) => None,
        },
    }];
    for child in children {
        if let Person::Child {
            name,
            max_age_years,
        } = child
        {
            set.push(Candidate {
                name: name.clone(),
                max_age_years: Some(*max_age_years),
            });
        }
    }
    // Children registered under a different legal surname also match
    // credentials issued under the registrant's.
    for child in children {
        if let Person::Child {
            name,
            max_age_years,
        } = child
        {
            if normalize_name(&name.last_name) != normalize_name(&registrant.last_name) {
                set.push(Candidate {
                    name: PersonName::new(name.first_name.clone(), registrant.last_name.clone()),
                    max_age_years: Some(*max_age_years),
                });
            }
        }
    }
    set
}

fn years_before(now: OffsetDateTime, years: i32) -> OffsetDateTime {
    now.replace_year(now.year() - years)
        .unwrap_or(now - Duration::days(365 * i64::from(years)))
}

fn check_candidate(
    document: &Document,
    candidate: &Candidate,
    now: OffsetDateTime,
) -> Result<(), VerificationError> {
    if normalize_name(&document.first_name) != normalize_name(&candidate.name.first_name)
        || normalize_name(&document.last_name) != normalize_name(&candidate.name.last_name)
    {
        return Err(VerificationError::NameMismatch);
    }
    if document.testing_timestamp > now.unix_timestamp() {
        return Err(VerificationError::TimestampInFuture);
    }
    if let (Some(max_age), Some(dob)) = (candidate.max_age_years, document.date_of_birth) {
        let dob = OffsetDateTime::from_unix_timestamp(dob)
            .map_err(|_| VerificationError::Unknown("date of birth out of range".to_string()))?;
        if dob > now {
            return Err(VerificationError::TimestampInFuture);
        }
        if dob < years_before(now, max_age) {
            return Err(VerificationError::DateOfBirthTooOldForChild);
        }
    }
    Ok(())
}

/// A candidate can fail for several reasons; the one surfaced to the caller
/// is the most specific across all candidates, never a generic mismatch
/// shadowing a better explanation.
fn specificity(error: &VerificationError) -> u8 {
    match error {
        VerificationError::NameMismatch => 0,
        VerificationError::Unknown(_) => 1,
        VerificationError::InvalidSignature(_) => 1,
        VerificationError::TimestampInFuture => 2,
        VerificationError::DateOfBirthTooOldForChild => 3,
    }
}

/// Validate `document` against the registrant and children.
///
/// On success the document's name fields are overwritten with the matched
/// person's canonical name. Documents whose scheme carries no holder name
/// (appointment tickets) bind to the registrant directly.
pub fn validate_document(
    document: &mut Document,
    person: &Person,
    children: &[Person],
    now: OffsetDateTime,
) -> Result<(), VerificationError> {
    if document.first_name.is_empty() && document.last_name.is_empty() {
        let name = person.name();
        document.first_name = name.first_name.clone();
        document.last_name = name.last_name.clone();
        return Ok(());
    }

    let mut aggregated: Option<VerificationError> = None;
    for candidate in candidates(person, children) {
        match check_candidate(document, &candidate, now) {
            Ok(()) => {
                document.first_name = candidate.name.first_name;
                document.last_name = candidate.name.last_name;
                return Ok(());
            }
            Err(error) => {
                tracing::debug!(%error, "validation candidate rejected");
                if aggregated
                    .as_ref()
                    .map(|best| specificity(&error) > specificity(best))
                    .unwrap_or(true)
                {
                    aggregated = Some(error);
                }
            }
        }
    }
    Err(aggregated.unwrap_or(VerificationError::NameMismatch))
}
