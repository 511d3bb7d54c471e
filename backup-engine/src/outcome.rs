//! Result codes exchanged with transports and observers, and the aggregate run result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flags passed to `Transport::perform_backup`.
pub mod flags {
    pub const USER_INITIATED: u32 = 1;
    pub const INCREMENTAL: u32 = 1 << 1;
    pub const NON_INCREMENTAL: u32 = 1 << 2;

    /// Transport-advertised flag handed to agents untouched.
    pub const CLIENT_SIDE_ENCRYPTION_ENABLED: u32 = 1;
}

/// Wire-level status codes returned by a transport.
pub mod codes {
    pub const TRANSPORT_OK: i32 = 0;
    pub const TRANSPORT_ERROR: i32 = -1000;
    pub const TRANSPORT_NOT_INITIALIZED: i32 = -1001;
    pub const TRANSPORT_PACKAGE_REJECTED: i32 = -1002;
    pub const TRANSPORT_QUOTA_EXCEEDED: i32 = -1005;
    pub const TRANSPORT_NON_INCREMENTAL_BACKUP_REQUIRED: i32 = -1006;
}

/// Result of submitting one item's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOutcome {
    Ok,
    PackageRejected,
    QuotaExceeded,
    NonIncrementalRequired,
    NotInitialized,
    Aborted,
}

impl TransportOutcome {
    pub fn from_code(code: i32) -> Self {
        match code {
            codes::TRANSPORT_OK => Self::Ok,
            codes::TRANSPORT_PACKAGE_REJECTED => Self::PackageRejected,
            codes::TRANSPORT_QUOTA_EXCEEDED => Self::QuotaExceeded,
            codes::TRANSPORT_NON_INCREMENTAL_BACKUP_REQUIRED => Self::NonIncrementalRequired,
            codes::TRANSPORT_NOT_INITIALIZED => Self::NotInitialized,
            _ => Self::Aborted,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Ok => codes::TRANSPORT_OK,
            Self::PackageRejected => codes::TRANSPORT_PACKAGE_REJECTED,
            Self::QuotaExceeded => codes::TRANSPORT_QUOTA_EXCEEDED,
            Self::NonIncrementalRequired => codes::TRANSPORT_NON_INCREMENTAL_BACKUP_REQUIRED,
            Self::NotInitialized => codes::TRANSPORT_NOT_INITIALIZED,
            Self::Aborted => codes::TRANSPORT_ERROR,
        }
    }
}

/// Terminal result recorded once per attempted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    TransportAborted,
    PackageRejected,
    AgentFailure,
    QuotaExceeded,
    PackageNotFound,
    BackupCancelled,
}

impl ItemOutcome {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::TransportAborted => -1000,
            Self::PackageRejected => -1002,
            Self::AgentFailure => -1003,
            Self::QuotaExceeded => -1005,
            Self::PackageNotFound => -2002,
            Self::BackupCancelled => -2003,
        }
    }
}

/// Overall status of a run. Item failures never downgrade it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    TransportAborted,
    BackupCancelled,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::TransportAborted => -1000,
            Self::BackupCancelled => -2003,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item: String,
    pub outcome: ItemOutcome,
}

/// Aggregate outcome of one run, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub destination: String,
    pub status: RunStatus,
    /// Outcomes of attempted real items, in queue order
    pub items: Vec<ItemResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn outcome_of(&self, item: &str) -> Option<ItemOutcome> {
        self.items.iter().find(|r| r.item == item).map(|r| r.outcome)
    }

    pub fn count(&self, outcome: ItemOutcome) -> usize {
        self.items.iter().filter(|r| r.outcome == outcome).count()
    }
}
