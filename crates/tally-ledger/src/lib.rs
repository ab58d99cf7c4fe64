//! Multi-account ledger façade for TallyDB.
//!
//! This crate provides:
//! - The account map: one lazily-created B-tree per account id
//! - Routing of record-level operations by the key's account
//! - The global save/load fan-out under an exclusive lock

mod ledger;

pub use ledger::Ledger;
