//! The ledger façade: account map, routing, and save/load fan-out.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use tally_common::{Record, RecordKey, Result, StorageConfig, TallyError};
use tally_storage::AccountTree;

/// Multiplexes accounts over per-account B-trees.
///
/// Trees are created lazily on first use. Record-level operations route by
/// the key's account and run under that account's mutex, so mutations on one
/// tree are serialized while different accounts proceed in parallel. `save`
/// and `load` take the account map's write lock, which excludes every
/// per-account operation for their duration.
pub struct Ledger {
    config: StorageConfig,
    accounts: RwLock<HashMap<String, Arc<Mutex<AccountTree>>>>,
}

impl Ledger {
    /// Creates an empty ledger. Nothing is read from disk until `load` or
    /// the first operation on a persisted account.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// The ledger's storage configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Sorted snapshot of the currently registered account ids.
    pub fn accounts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.accounts.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Inserts a record into its account's tree. Returns false on duplicate.
    pub fn insert(&self, record: Record) -> Result<bool> {
        let tree = self.tree(&record.key.account)?;
        let mut tree = tree.lock();
        tree.insert(record)
    }

    /// Replaces the record under `record.key`. Returns false if absent.
    pub fn update(&self, record: Record) -> Result<bool> {
        let tree = self.tree(&record.key.account)?;
        let mut tree = tree.lock();
        tree.update(record)
    }

    /// Deletes the given record's key. Returns false if absent.
    pub fn delete(&self, record: &Record) -> Result<bool> {
        self.delete_key(&record.key)
    }

    /// Deletes the record under `key`. Returns false if absent.
    pub fn delete_key(&self, key: &RecordKey) -> Result<bool> {
        let tree = self.tree(&key.account)?;
        let mut tree = tree.lock();
        tree.delete_key(key)
    }

    /// Deletes every record with `start <= key <= end`; both bounds must
    /// name the same account. Returns the count removed.
    pub fn delete_range(&self, start: &RecordKey, end: &RecordKey) -> Result<u64> {
        if start.account != end.account {
            return Err(TallyError::Invariant(format!(
                "delete_range spans accounts {} and {}",
                start.account, end.account
            )));
        }
        let tree = self.tree(&start.account)?;
        let mut tree = tree.lock();
        tree.delete_range(start, end)
    }

    /// Returns the record under `key`, if any.
    pub fn read(&self, key: &RecordKey) -> Result<Option<Record>> {
        let tree = self.tree(&key.account)?;
        let mut tree = tree.lock();
        tree.read(key)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &RecordKey) -> Result<bool> {
        let tree = self.tree(&key.account)?;
        let mut tree = tree.lock();
        tree.contains(key)
    }

    /// Returns every record of an account in key order.
    pub fn list(&self, account: &str) -> Result<Vec<Record>> {
        let tree = self.tree(account)?;
        let mut tree = tree.lock();
        tree.list()
    }

    /// Returns every record with `start <= key <= end` in key order; both
    /// bounds must name the same account.
    pub fn list_range(&self, start: &RecordKey, end: &RecordKey) -> Result<Vec<Record>> {
        if start.account != end.account {
            return Err(TallyError::Invariant(format!(
                "list_range spans accounts {} and {}",
                start.account, end.account
            )));
        }
        let tree = self.tree(&start.account)?;
        let mut tree = tree.lock();
        tree.list_range(start, end)
    }

    /// Number of records stored for an account.
    pub fn record_count(&self, account: &str) -> Result<u64> {
        let tree = self.tree(account)?;
        let mut tree = tree.lock();
        tree.record_count()
    }

    /// Sum of amounts over all records of the key's account with key' <= key.
    pub fn balance_as_of(&self, key: &RecordKey) -> Result<Decimal> {
        let tree = self.tree(&key.account)?;
        let mut tree = tree.lock();
        tree.balance_as_of(key)
    }

    /// Returns a key carrying the next free sequence for the key's
    /// (account, date), or the key unchanged if that instant has no records.
    pub fn adjust_key(&self, key: &RecordKey) -> Result<RecordKey> {
        let tree = self.tree(&key.account)?;
        let mut tree = tree.lock();
        tree.adjust_key(key)
    }

    /// Saves every live account tree: splits discharge first, then each
    /// cache flushes to disk. Runs under the map's write lock, so no
    /// per-account operation can interleave.
    ///
    /// Not crash-atomic: a fault mid-flush leaves some accounts written and
    /// others not.
    pub fn save(&self) -> Result<()> {
        let accounts = self.accounts.write();
        for (account, tree) in accounts.iter() {
            if let Err(e) = tree.lock().save() {
                warn!(account = %account, error = %e, "save failed; on-disk state may be partial");
                return Err(e);
            }
        }
        debug!(accounts = accounts.len(), "saved ledger");
        Ok(())
    }

    /// Replaces the in-memory account map with the accounts found on disk.
    /// Node data stays on disk until first touched; each registered tree
    /// starts with an empty cache.
    pub fn load(&self) -> Result<()> {
        let mut accounts = self.accounts.write();
        accounts.clear();

        let root = self.config.nodes_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %root.display(), "no persisted accounts");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(account) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            accounts.insert(
                account.clone(),
                Arc::new(Mutex::new(AccountTree::new(&self.config, account))),
            );
        }
        debug!(accounts = accounts.len(), "loaded ledger");
        Ok(())
    }

    /// Returns the account's tree, creating it on first use.
    fn tree(&self, account: &str) -> Result<Arc<Mutex<AccountTree>>> {
        if account.is_empty() {
            return Err(TallyError::Invariant("empty account id".to_string()));
        }
        if let Some(tree) = self.accounts.read().get(account) {
            return Ok(Arc::clone(tree));
        }

        let mut accounts = self.accounts.write();
        let tree = accounts
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountTree::new(&self.config, account))));
        Ok(Arc::clone(tree))
    }
}
