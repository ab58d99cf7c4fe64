//! Error types for TallyDB.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias using TallyError.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors that can occur in TallyDB operations.
///
/// Routine negative outcomes (duplicate insert, missing key on update or
/// delete) are reported as `Ok(false)` / `Ok(None)` by the operations
/// themselves and never appear here. Every variant below is either a storage
/// fault or a fatal contract violation.
#[derive(Debug, Error)]
pub enum TallyError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("node {id} corrupted: {reason}")]
    NodeCorrupted { id: u64, reason: String },

    // Tree contract violations. Fatal: callers propagate, never recover.
    #[error("tree invariant violated: {0}")]
    Invariant(String),

    // Key-space exhaustion
    #[error("no free sequence for account {account} at {date}")]
    SaturatedDay { account: String, date: DateTime<Utc> },
}

impl TallyError {
    /// Returns true for errors that indicate a corrupted or inconsistent
    /// tree rather than an environmental fault.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TallyError::Invariant(_) | TallyError::NodeCorrupted { .. }
        )
    }
}
