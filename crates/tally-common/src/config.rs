//! Configuration structures for TallyDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default B-tree degree: maximum entries per node after a save.
pub const DEFAULT_DEGREE: usize = 100;

/// Storage configuration for the ledger engine.
///
/// One configuration applies uniformly to every account tree created in the
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted data. Node blobs live under
    /// `<data_dir>/Nodes/<account>/`.
    pub data_dir: PathBuf,
    /// B-tree degree: maximum entries per node. Nodes may overflow this
    /// bound between saves; every save restores it.
    pub degree: usize,
    /// Enable fsync after each node blob write.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            degree: DEFAULT_DEGREE,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Root directory holding one subdirectory per persisted account.
    pub fn nodes_root(&self) -> PathBuf {
        self.data_dir.join("Nodes")
    }

    /// Directory holding the node blobs of a single account.
    pub fn node_dir(&self, account: &str) -> PathBuf {
        self.nodes_root().join(account)
    }
}
