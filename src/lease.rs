//! Lease Record data model.
//!
//! A lease record is the store-resident view of one worker: its identity, the
//! endpoint its engine listens on, and its liveness status. The store keeps
//! every field as a string, so the typed [`LeaseRecord`] converts explicitly
//! to and from a field map.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const FIELD_ID: &str = "id";
pub const FIELD_ENDPOINT: &str = "endpoint";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_STARTED_AT: &str = "startedAt";
pub const FIELD_LAST_HEARTBEAT: &str = "lastHeartbeat";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("unknown lease status {0:?}")]
    UnknownStatus(String),

    #[error("missing lease field {0:?}")]
    MissingField(&'static str),

    #[error("invalid worker id {0:?}")]
    InvalidId(String),

    #[error("invalid timestamp in field {field:?}: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
}

/// Opaque worker identity, generated once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Path segment that makes this worker's engine endpoint unambiguous.
    pub fn path_segment(&self) -> String {
        format!("/{}", self.0)
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WorkerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for WorkerId {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| LeaseError::InvalidId(s.to_string()))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a lease as persisted in the store.
///
/// `Starting` is never written; `Recycling` is only ever written by the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseStatus {
    Starting,
    Available,
    Recycling,
    ShuttingDown,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Starting => "starting",
            LeaseStatus::Available => "available",
            LeaseStatus::Recycling => "recycling",
            LeaseStatus::ShuttingDown => "shutting-down",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: LeaseStatus) -> bool {
        matches!(
            (self, next),
            (LeaseStatus::Starting, LeaseStatus::Available)
                | (LeaseStatus::Starting, LeaseStatus::ShuttingDown)
                | (LeaseStatus::Available, LeaseStatus::Recycling)
                | (LeaseStatus::Available, LeaseStatus::ShuttingDown)
                | (LeaseStatus::Recycling, LeaseStatus::ShuttingDown)
        )
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseStatus {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(LeaseStatus::Starting),
            "available" => Ok(LeaseStatus::Available),
            "recycling" => Ok(LeaseStatus::Recycling),
            "shutting-down" => Ok(LeaseStatus::ShuttingDown),
            other => Err(LeaseError::UnknownStatus(other.to_string())),
        }
    }
}

/// Format a timestamp the way every lease field stores it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, LeaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| LeaseError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub id: WorkerId,
    pub endpoint: String,
    pub status: LeaseStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl LeaseRecord {
    /// Build the record a worker publishes once its engine is listening.
    pub fn available(id: WorkerId, endpoint: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            endpoint,
            status: LeaseStatus::Available,
            started_at,
            last_heartbeat: Utc::now(),
        }
    }

    /// Field/value pairs in the order they are written to the store.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_ID, self.id.to_string()),
            (FIELD_ENDPOINT, self.endpoint.clone()),
            (FIELD_STATUS, self.status.to_string()),
            (FIELD_STARTED_AT, format_timestamp(&self.started_at)),
            (FIELD_LAST_HEARTBEAT, format_timestamp(&self.last_heartbeat)),
        ]
    }

    /// Parse a record from the store's string-valued field map.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, LeaseError> {
        let get = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(LeaseError::MissingField(name))
        };

        Ok(Self {
            id: get(FIELD_ID)?.parse()?,
            endpoint: get(FIELD_ENDPOINT)?.to_string(),
            status: get(FIELD_STATUS)?.parse()?,
            started_at: parse_timestamp(FIELD_STARTED_AT, get(FIELD_STARTED_AT)?)?,
            last_heartbeat: parse_timestamp(FIELD_LAST_HEARTBEAT, get(FIELD_LAST_HEARTBEAT)?)?,
        })
    }
}

/// Store key for a worker's lease, e.g. `worker:<id>`.
pub fn lease_key(prefix: &str, id: &WorkerId) -> String {
    format!("{}{}", prefix, id)
}
