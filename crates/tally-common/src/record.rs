//! Financial records stored in the tree.

use crate::key::RecordKey;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single financial record: a key, a description, and a monetary amount.
///
/// Records are immutable once constructed; the engine never mutates one in
/// place. An update produces a replacement record under the same key.
/// Amounts are exact decimals (28+ significant digits) and serialize as
/// strings so no precision is lost on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The record's unique key.
    pub key: RecordKey,
    /// Free-form description (payee, memo).
    pub description: String,
    /// Signed monetary amount.
    pub amount: Decimal,
}

impl Record {
    /// Creates a new record.
    pub fn new(key: RecordKey, description: impl Into<String>, amount: Decimal) -> Self {
        Self {
            key,
            description: description.into(),
            amount,
        }
    }
}
