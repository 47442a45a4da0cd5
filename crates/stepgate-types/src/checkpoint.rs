//! Checkpoint types: pause points awaiting human approval.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolution status of a checkpoint.
///
/// Starts `Pending` and moves exactly once to one of the terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
    Timeout,
}

impl CheckpointStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CheckpointStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Approved => "approved",
            CheckpointStatus::Rejected => "rejected",
            CheckpointStatus::Skipped => "skipped",
            CheckpointStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(CheckpointStatus::Pending),
            "approved" => Ok(CheckpointStatus::Approved),
            "rejected" => Ok(CheckpointStatus::Rejected),
            "skipped" => Ok(CheckpointStatus::Skipped),
            "timeout" => Ok(CheckpointStatus::Timeout),
            other => Err(format!("invalid checkpoint status: '{other}'")),
        }
    }
}

/// Why a checkpoint was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Review of a step's result (full supervision or a flagged step).
    StepReview,
    /// Confirm data extracted with low confidence.
    DataConfirmation,
    /// Review before the workflow finishes.
    FinalReview,
    /// The step handler needs a document from the user.
    DocumentRequest,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::StepReview => "step_review",
            CheckpointType::DataConfirmation => "data_confirmation",
            CheckpointType::FinalReview => "final_review",
            CheckpointType::DocumentRequest => "document_request",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "step_review" => Ok(CheckpointType::StepReview),
            "data_confirmation" => Ok(CheckpointType::DataConfirmation),
            "final_review" => Ok(CheckpointType::FinalReview),
            "document_request" => Ok(CheckpointType::DocumentRequest),
            other => Err(format!("invalid checkpoint type: '{other}'")),
        }
    }
}

/// Unix time of 9999-12-31T23:59:59Z, the latest deadline a checkpoint may
/// carry. Later instants have no four-digit-year RFC 3339 form.
pub const MAX_EXPIRY_TIMESTAMP: i64 = 253_402_300_799;

pub fn max_expiry() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::seconds(MAX_EXPIRY_TIMESTAMP)
}

/// Deadline `lifetime` after `now`, or `None` when it would fall past
/// [`max_expiry`].
pub fn expiry_after(now: DateTime<Utc>, lifetime: TimeDelta) -> Option<DateTime<Utc>> {
    now.checked_add_signed(lifetime).filter(|t| *t <= max_expiry())
}

/// A pause point awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7 checkpoint ID.
    pub id: Uuid,
    pub task_id: Uuid,
    /// Step the task paused at.
    pub step_id: String,
    pub checkpoint_type: CheckpointType,
    pub status: CheckpointStatus,
    /// Snapshot shown to the reviewer (step output, confidence).
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// After this instant the checkpoint may be moved to `Timeout`.
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Approval comment or rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Checkpoint {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == CheckpointStatus::Pending && self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_checkpoint_status_roundtrip() {
        for status in [
            CheckpointStatus::Pending,
            CheckpointStatus::Approved,
            CheckpointStatus::Rejected,
            CheckpointStatus::Skipped,
            CheckpointStatus::Timeout,
        ] {
            let parsed: CheckpointStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!(!CheckpointStatus::Pending.is_resolved());
        assert!(CheckpointStatus::Timeout.is_resolved());
    }

    #[test]
    fn test_checkpoint_type_serde() {
        let json = serde_json::to_string(&CheckpointType::DataConfirmation).unwrap();
        assert_eq!(json, "\"data_confirmation\"");
        let parsed: CheckpointType = "document_request".parse().unwrap();
        assert_eq!(parsed, CheckpointType::DocumentRequest);
    }

    #[test]
    fn test_expiry_stops_at_year_9999() {
        let now = Utc::now();
        assert_eq!(
            expiry_after(now, Duration::hours(1)),
            Some(now + Duration::hours(1))
        );
        assert_eq!(expiry_after(now, Duration::hours(100_000_000)), None);
        assert_eq!(
            max_expiry().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "9999-12-31T23:59:59.000000Z"
        );
        assert_eq!(expiry_after(max_expiry(), Duration::zero()), Some(max_expiry()));
    }

    #[test]
    fn test_is_expired_only_when_pending() {
        let now = Utc::now();
        let mut cp = Checkpoint {
            id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            step_id: "review".to_string(),
            checkpoint_type: CheckpointType::StepReview,
            status: CheckpointStatus::Pending,
            data: serde_json::Value::Null,
            created_at: now - Duration::hours(25),
            expires_at: now - Duration::hours(1),
            resolved_at: None,
            resolved_by: None,
            comment: None,
        };
        assert!(cp.is_expired(now));
        cp.status = CheckpointStatus::Approved;
        assert!(!cp.is_expired(now));
    }
}
