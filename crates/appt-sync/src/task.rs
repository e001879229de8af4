//! Units of propagation work

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a sync task does to the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One private record's pending propagation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub private_record_id: String,
    pub user_id: String,
    pub operation: SyncOperation,
}

impl SyncTask {
    pub fn new(
        private_record_id: impl Into<String>,
        user_id: impl Into<String>,
        operation: SyncOperation,
    ) -> Self {
        Self {
            private_record_id: private_record_id.into(),
            user_id: user_id.into(),
            operation,
        }
    }

    pub fn create(private_record_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(private_record_id, user_id, SyncOperation::Create)
    }

    pub fn update(private_record_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(private_record_id, user_id, SyncOperation::Update)
    }

    pub fn delete(private_record_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(private_record_id, user_id, SyncOperation::Delete)
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (user {})",
            self.operation, self.private_record_id, self.user_id
        )
    }
}

/// Successful result of running a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Mirror exists and is linked; `reused` when an earlier mirror was adopted
    Mirrored { mirror_id: String, reused: bool },
    /// Mirror content rewritten
    Updated { mirror_id: String },
    /// Mirrors removed (possibly none were left)
    Removed { mirror_ids: Vec<String> },
    /// A record the engine does not own already covers this appointment
    DuplicateSkipped { existing_id: String },
    /// The private record no longer calls for this operation
    NothingToDo,
}
