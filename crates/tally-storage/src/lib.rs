//! Storage engine for TallyDB.
//!
//! This crate provides the per-account B-tree core:
//! - Immutable node representation with cached subtree amount sums
//! - Node store: in-memory cache over per-node on-disk blobs
//! - B-tree algorithms: copy-on-write mutation, range and balance queries,
//!   deferred splits discharged at save time
//!
//! Every node caches the sum of amounts in its subtree, which makes
//! cumulative-balance queries O(height). Splits never happen during a
//! mutation; nodes overflow freely between saves, and `AccountTree::save`
//! restores the size bound before flushing the cache.

mod node;
mod store;
mod tree;

pub use node::{Node, NodeContents, NodeId, NodeRef, SearchResult, ROOT_NODE_ID};
pub use store::NodeStore;
pub use tree::AccountTree;
