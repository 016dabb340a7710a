//! Core data model.
//!
//! An email is one queued unit of work: a recipient, a delivery status and
//! an outcome note. Rows are created outside this crate and are only ever
//! claimed and marked here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// A queued email tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Email {
    /// Unique, stable identifier.
    pub id: i64,

    /// Recipient address.
    pub email: String,

    /// Current delivery status.
    #[sqlx(try_from = "String")]
    pub status: Status,

    /// When the email was marked sent. Set once, never overwritten.
    pub sent_at: Option<DateTime<Utc>>,

    /// Free-form outcome note.
    pub details: Option<String>,

    /// When a claimer took the row. Drives lease reclaim and claim
    /// ownership: a worker may only commit a claim stamped with the value
    /// it was handed.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
}

impl Email {
    /// A fresh pending email, as it looks before anything touches it.
    pub fn pending(id: i64, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            status: Status::Pending,
            sent_at: None,
            details: None,
            claimed_at: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Delivery status of an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be picked up.
    Pending,
    /// Claimed by a pipeline run, delivery in flight.
    Processing,
    /// Delivered.
    Sent,
    /// Delivered and opened by the recipient.
    Read,
    /// Given up on.
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Processing,
        Status::Sent,
        Status::Read,
        Status::Failed,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Sent)       // bulk path, no claim
                | (Processing, Sent)
                | (Processing, Pending) // lease expired, reclaimed
                | (Pending, Failed)
                | (Processing, Failed)
                | (Sent, Read)
                | (Sent, Sent)          // idempotent re-mark
        )
    }

    /// Has the email been delivered?
    pub fn is_delivered(self) -> bool {
        matches!(self, Status::Sent | Status::Read)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Sent => "sent",
            Status::Read => "read",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown email status: {s}")))
    }
}

impl TryFrom<String> for Status {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
