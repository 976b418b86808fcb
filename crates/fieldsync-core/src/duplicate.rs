//! Likely-duplicate detection
//!
//! A heuristic, not a uniqueness constraint: two records match when the
//! normalized subject name and guardian name are equal within the same
//! parent context (session or screening) on the same day. Same-named
//! strangers produce false positives and typos slip through, so a match
//! only prompts the caller to edit the existing record or force a new one.
//!
//! Nothing here touches the queue or storage.

use chrono::NaiveDate;
use serde_json::Value;

use crate::models::EntityKind;

const NAME_KEYS: &[&str] = &["name", "child_name"];
const GUARDIAN_KEYS: &[&str] = &["father", "father_name", "guardian_name"];
const CONTEXT_KEYS: &[&str] = &["session_id", "screening_id", "parent_id"];

/// Case-fold, trim, and collapse internal whitespace
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The identifying fields of a person-bearing record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonRecord {
    pub name: String,
    pub guardian: String,
    /// Session or screening the record belongs to
    pub context: Option<String>,
    pub day: Option<NaiveDate>,
}

impl PersonRecord {
    pub fn new(name: impl Into<String>, guardian: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guardian: guardian.into(),
            context: None,
            day: None,
        }
    }

    pub fn in_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn on_day(mut self, day: NaiveDate) -> Self {
        self.day = Some(day);
        self
    }

    /// Extract identity from a JSON payload
    ///
    /// Returns `None` for kinds that do not describe a person, or when the
    /// payload has no name. A payload without a `date` field is taken to be
    /// from `fallback_day`.
    pub fn from_payload(kind: EntityKind, payload: &Value, fallback_day: NaiveDate) -> Option<Self> {
        if !carries_identity(kind) {
            return None;
        }
        let name = first_string(payload, NAME_KEYS)?;
        if normalize(&name).is_empty() {
            return None;
        }
        let guardian = first_string(payload, GUARDIAN_KEYS).unwrap_or_default();
        let context = first_string(payload, CONTEXT_KEYS);
        let day = payload
            .get("date")
            .and_then(Value::as_str)
            .and_then(parse_day)
            .unwrap_or(fallback_day);

        Some(Self {
            name,
            guardian,
            context,
            day: Some(day),
        })
    }

    /// Whether two records likely describe the same person entry
    pub fn matches(&self, other: &PersonRecord) -> bool {
        normalize(&self.name) == normalize(&other.name)
            && normalize(&self.guardian) == normalize(&other.guardian)
            && self.context == other.context
            && self.day == other.day
    }
}

/// Kinds whose payloads name a person
pub fn carries_identity(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::Attendee | EntityKind::ScreenedChild | EntityKind::Screening
    )
}

/// Whether `candidate` likely repeats one of `existing`
pub fn is_likely_duplicate(candidate: &PersonRecord, existing: &[PersonRecord]) -> bool {
    find_duplicate(candidate, existing).is_some()
}

/// The first record in `existing` that `candidate` likely repeats
pub fn find_duplicate<'a>(
    candidate: &PersonRecord,
    existing: &'a [PersonRecord],
) -> Option<&'a PersonRecord> {
    existing.iter().find(|record| candidate.matches(record))
}

fn first_string(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts `YYYY-MM-DD` or anything starting with it (RFC 3339 timestamps)
fn parse_day(value: &str) -> Option<NaiveDate> {
    let date_part = value.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
