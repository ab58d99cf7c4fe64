//! Record keys and their total order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite key identifying a single record: (account, date, sequence).
///
/// The total order is account bytes lexicographic, then date ascending, then
/// sequence ascending. The derived `Ord` implements exactly that because the
/// fields are declared in comparison order, `String` compares bytewise, and
/// `DateTime<Utc>` compares on the absolute timeline. Byte order over the
/// account agrees with its UTF-8 serialization, so in-memory and on-disk
/// orderings never diverge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Account this record belongs to.
    pub account: String,
    /// Instant the record is booked at.
    pub date: DateTime<Utc>,
    /// Disambiguates multiple records on the same (account, date).
    pub sequence: u32,
}

impl RecordKey {
    /// Creates a new key.
    pub fn new(account: impl Into<String>, date: DateTime<Utc>, sequence: u32) -> Self {
        Self {
            account: account.into(),
            date,
            sequence,
        }
    }

    /// Returns the same key with a different sequence number.
    pub fn with_sequence(&self, sequence: u32) -> Self {
        Self {
            account: self.account.clone(),
            date: self.date,
            sequence,
        }
    }

    /// Returns true if `other` shares this key's (account, date) prefix.
    pub fn same_day(&self, other: &RecordKey) -> bool {
        self.account == other.account && self.date == other.date
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account,
            self.date.to_rfc3339(),
            self.sequence
        )
    }
}
