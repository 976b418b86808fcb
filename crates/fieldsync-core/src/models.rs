//! Data models for queued writes
//!
//! Defines the pending mutation record, its lifecycle status, and the closed
//! set of entity kinds the remote API accepts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Locally assigned identifier of a queued mutation
///
/// Handed out from a persisted, strictly increasing sequence, so two
/// mutations enqueued in the same millisecond still get distinct ids and
/// ids order the same way as enqueue calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(LocalId)
    }
}

/// Kind of record a mutation creates on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Session,
    Attendee,
    Screening,
    ScreenedChild,
    LocationUpdate,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Session,
        EntityKind::Attendee,
        EntityKind::Screening,
        EntityKind::ScreenedChild,
        EntityKind::LocationUpdate,
    ];

    /// The `POST` endpoint this kind is submitted to, relative to the API base
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Session => "/api/sessions",
            EntityKind::Attendee => "/api/attendees",
            EntityKind::Screening => "/api/screenings",
            EntityKind::ScreenedChild => "/api/screened-children",
            EntityKind::LocationUpdate => "/api/location-updates",
        }
    }

    /// Wire name used in storage and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::Attendee => "attendee",
            EntityKind::Screening => "screening",
            EntityKind::ScreenedChild => "screened-child",
            EntityKind::LocationUpdate => "location-update",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown entity kind '{}' (expected one of: session, attendee, screening, screened-child, location-update)",
                    s
                )
            })
    }
}

/// Lifecycle of a queued mutation
///
/// `Synced` exists only transiently: a synced record is removed from the
/// queue in the same write that marks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Synced => "synced",
            MutationStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

/// A write waiting to reach the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMutation {
    /// Local identifier, increasing in enqueue order
    pub id: LocalId,
    /// What kind of record this creates
    pub entity_type: EntityKind,
    /// Request body, always a JSON object
    pub payload: Value,
    /// When the mutation was enqueued
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status
    pub status: MutationStatus,
    /// Number of transient submission failures so far
    pub retry_count: u32,
    /// Sent as `Idempotency-Key` on every attempt
    pub idempotency_key: Uuid,
    /// Reason recorded by the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingMutation {
    /// Create a fresh `Pending` record
    pub fn new(id: LocalId, entity_type: EntityKind, payload: Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            entity_type,
            payload,
            created_at,
            status: MutationStatus::Pending,
            retry_count: 0,
            idempotency_key: Uuid::new_v4(),
            last_error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.status == MutationStatus::Failed
    }
}
