//! TallyDB common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all TallyDB components.

pub mod config;
pub mod error;
pub mod key;
pub mod record;

pub use config::{StorageConfig, DEFAULT_DEGREE};
pub use error::{Result, TallyError};
pub use key::RecordKey;
pub use record::Record;
