//! B-tree algorithms over a node store.
//!
//! All mutations follow one pattern: recursive descent returning whether the
//! subtree changed; on ascent, the parent's reference for the touched child
//! is rewritten so key brackets and cached amounts stay exact. No split
//! happens during a mutation. Nodes overflow freely between saves; `save`
//! repeatedly splits overflowing nodes until none remain, then flushes the
//! cache.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::debug;

use tally_common::{Record, RecordKey, Result, StorageConfig, TallyError};

use crate::node::{Node, NodeId, NodeRef, SearchResult, ROOT_NODE_ID};
use crate::store::NodeStore;

/// One account's B-tree: recursive copy-on-write mutation, range and balance
/// queries, and deferred splits discharged at save time.
///
/// The tree exclusively owns its node store; every operation takes
/// `&mut self`, so access is single-threaded by construction. Callers that
/// need concurrency serialize at a layer above.
pub struct AccountTree {
    account: String,
    degree: usize,
    store: NodeStore,
    /// Coin-flip source for neighbour selection on boundary inserts.
    rng: StdRng,
}

impl AccountTree {
    /// Creates a tree for one account. Node data is lazy-loaded from the
    /// configured data directory on first access.
    pub fn new(config: &StorageConfig, account: impl Into<String>) -> Self {
        Self::with_rng(config, account, StdRng::from_entropy())
    }

    /// Creates a tree with a caller-supplied RNG so tests are deterministic.
    /// The node store's id allocator is seeded from the same RNG.
    pub fn with_rng(config: &StorageConfig, account: impl Into<String>, mut rng: StdRng) -> Self {
        let account = account.into();
        let store_rng = StdRng::seed_from_u64(rng.gen());
        Self {
            store: NodeStore::with_rng(config, &account, store_rng),
            degree: config.degree,
            account,
            rng,
        }
    }

    /// The account this tree stores.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Maximum entries per node after a save.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of nodes currently cached.
    pub fn cached_node_count(&self) -> u64 {
        self.store.cache_len()
    }

    /// Iterates over the currently cached nodes (diagnostics and tests).
    pub fn cached_nodes(&self) -> impl Iterator<Item = &Node> {
        self.store.list()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Inserts a record. Returns false if the key already exists.
    pub fn insert(&mut self, record: Record) -> Result<bool> {
        self.check_account(&record.key)?;
        if self.store.get(ROOT_NODE_ID)?.is_none() {
            self.store.put(Node::leaf(ROOT_NODE_ID, vec![record]));
            return Ok(true);
        }
        self.insert_at(ROOT_NODE_ID, record)
    }

    fn insert_at(&mut self, id: NodeId, record: Record) -> Result<bool> {
        let node = self.load(id)?;

        if node.is_leaf() {
            return match node.find_record(&record.key)? {
                SearchResult::Found(_) => Ok(false),
                SearchResult::Missing(at) => {
                    self.store.put(node.with_inserted_record(at, record)?);
                    Ok(true)
                }
            };
        }

        let at = match node.find_child(&record.key)? {
            SearchResult::Found(at) => at,
            // The key falls between brackets: grow a neighbour.
            SearchResult::Missing(gap) => self.pick_neighbour(gap, node.len()),
        };
        let child_id = node.children()?[at].child;

        if !self.insert_at(child_id, record)? {
            return Ok(false);
        }
        let refreshed = self.refresh_ref(&node.children()?[at])?;
        self.store.put(node.with_replaced_child(at, refreshed)?);
        Ok(true)
    }

    /// Replaces the record stored under `record.key`. Returns false if the
    /// key does not exist.
    pub fn update(&mut self, record: Record) -> Result<bool> {
        self.check_account(&record.key)?;
        if self.store.get(ROOT_NODE_ID)?.is_none() {
            return Ok(false);
        }
        self.update_at(ROOT_NODE_ID, record)
    }

    fn update_at(&mut self, id: NodeId, record: Record) -> Result<bool> {
        let node = self.load(id)?;

        if node.is_leaf() {
            return match node.find_record(&record.key)? {
                SearchResult::Found(at) => {
                    self.store.put(node.with_replaced_record(at, record)?);
                    Ok(true)
                }
                SearchResult::Missing(_) => Ok(false),
            };
        }

        // A bracket miss means the key cannot exist.
        let at = match node.find_child(&record.key)? {
            SearchResult::Found(at) => at,
            SearchResult::Missing(_) => return Ok(false),
        };
        let child_id = node.children()?[at].child;

        if !self.update_at(child_id, record)? {
            return Ok(false);
        }
        let refreshed = self.refresh_ref(&node.children()?[at])?;
        self.store.put(node.with_replaced_child(at, refreshed)?);
        Ok(true)
    }

    /// Deletes the given record's key. Returns false if absent.
    pub fn delete(&mut self, record: &Record) -> Result<bool> {
        self.delete_key(&record.key)
    }

    /// Deletes the record stored under `key`. Returns false if absent.
    ///
    /// Deletion never merges or rebalances: a leaf may become empty, and its
    /// parent keeps a reference with the old key bracket and a refreshed
    /// amount.
    pub fn delete_key(&mut self, key: &RecordKey) -> Result<bool> {
        self.check_account(key)?;
        if self.store.get(ROOT_NODE_ID)?.is_none() {
            return Ok(false);
        }
        self.delete_at(ROOT_NODE_ID, key)
    }

    fn delete_at(&mut self, id: NodeId, key: &RecordKey) -> Result<bool> {
        let node = self.load(id)?;

        if node.is_leaf() {
            return match node.find_record(key)? {
                SearchResult::Found(at) => {
                    self.store.put(node.with_deleted_record(at)?);
                    Ok(true)
                }
                SearchResult::Missing(_) => Ok(false),
            };
        }

        let at = match node.find_child(key)? {
            SearchResult::Found(at) => at,
            SearchResult::Missing(_) => return Ok(false),
        };
        let child_id = node.children()?[at].child;

        if !self.delete_at(child_id, key)? {
            return Ok(false);
        }
        let refreshed = self.refresh_ref(&node.children()?[at])?;
        self.store.put(node.with_replaced_child(at, refreshed)?);
        Ok(true)
    }

    /// Deletes every record with `start <= key <= end` in one logical
    /// operation and returns the count removed.
    ///
    /// Rewritten nodes are staged in a scratch buffer and published to the
    /// cache only after the whole walk succeeds, so an internal fault leaves
    /// the tree untouched.
    pub fn delete_range(&mut self, start: &RecordKey, end: &RecordKey) -> Result<u64> {
        self.check_account(start)?;
        self.check_account(end)?;
        if start > end || self.store.get(ROOT_NODE_ID)?.is_none() {
            return Ok(0);
        }

        let mut staged = Vec::new();
        let (removed, rewritten) = self.delete_range_at(ROOT_NODE_ID, start, end, &mut staged)?;
        if let Some(root) = rewritten {
            staged.push(root);
        }
        for node in staged {
            self.store.put(node);
        }
        Ok(removed)
    }

    fn delete_range_at(
        &mut self,
        id: NodeId,
        start: &RecordKey,
        end: &RecordKey,
        staged: &mut Vec<Node>,
    ) -> Result<(u64, Option<Node>)> {
        let node = self.load(id)?;

        if node.is_leaf() {
            let records = node.records()?;
            let kept: Vec<Record> = records
                .iter()
                .filter(|r| r.key < *start || r.key > *end)
                .cloned()
                .collect();
            let removed = (records.len() - kept.len()) as u64;
            if removed == 0 {
                return Ok((0, None));
            }
            return Ok((removed, Some(Node::leaf(id, kept))));
        }

        let mut next_children = node.children()?.to_vec();
        let mut removed = 0u64;

        for (at, child_ref) in node.children()?.iter().enumerate() {
            if child_ref.last_key < *start || child_ref.first_key > *end {
                continue;
            }
            let (count, rewritten) = self.delete_range_at(child_ref.child, start, end, staged)?;
            if let Some(child_node) = rewritten {
                next_children[at] = if child_node.is_empty() {
                    NodeRef {
                        first_key: child_ref.first_key.clone(),
                        last_key: child_ref.last_key.clone(),
                        child: child_ref.child,
                        amount: child_node.amount(),
                    }
                } else {
                    child_node.self_ref()?
                };
                staged.push(child_node);
            }
            removed += count;
        }

        if removed == 0 {
            return Ok((0, None));
        }
        Ok((removed, Some(Node::internal(id, next_children))))
    }

    // =========================================================================
    // Point and range queries
    // =========================================================================

    /// Returns the record stored under `key`, if any.
    pub fn read(&mut self, key: &RecordKey) -> Result<Option<Record>> {
        self.check_account(key)?;
        let mut id = ROOT_NODE_ID;
        if self.store.get(id)?.is_none() {
            return Ok(None);
        }

        loop {
            let next = {
                let node = self.must_get(id)?;
                if node.is_leaf() {
                    return Ok(match node.find_record(key)? {
                        SearchResult::Found(at) => Some(node.records()?[at].clone()),
                        SearchResult::Missing(_) => None,
                    });
                }
                match node.find_child(key)? {
                    SearchResult::Found(at) => node.children()?[at].child,
                    SearchResult::Missing(_) => return Ok(None),
                }
            };
            id = next;
        }
    }

    /// Returns true if `key` is present.
    pub fn contains(&mut self, key: &RecordKey) -> Result<bool> {
        Ok(self.read(key)?.is_some())
    }

    /// Returns every record in key order.
    pub fn list(&mut self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        if self.store.get(ROOT_NODE_ID)?.is_some() {
            self.collect_records(ROOT_NODE_ID, &mut out)?;
        }
        Ok(out)
    }

    fn collect_records(&mut self, id: NodeId, out: &mut Vec<Record>) -> Result<()> {
        let node = self.load(id)?;
        if node.is_leaf() {
            out.extend_from_slice(node.records()?);
            return Ok(());
        }
        for child in node.children()? {
            self.collect_records(child.child, out)?;
        }
        Ok(())
    }

    /// Returns every record with `start <= key <= end` in key order.
    pub fn list_range(&mut self, start: &RecordKey, end: &RecordKey) -> Result<Vec<Record>> {
        self.check_account(start)?;
        self.check_account(end)?;
        let mut out = Vec::new();
        if *start <= *end && self.store.get(ROOT_NODE_ID)?.is_some() {
            self.collect_range(ROOT_NODE_ID, start, end, &mut out)?;
        }
        Ok(out)
    }

    fn collect_range(
        &mut self,
        id: NodeId,
        start: &RecordKey,
        end: &RecordKey,
        out: &mut Vec<Record>,
    ) -> Result<()> {
        let node = self.load(id)?;
        if node.is_leaf() {
            for record in node.records()? {
                if record.key > *end {
                    break;
                }
                if record.key >= *start {
                    out.push(record.clone());
                }
            }
            return Ok(());
        }
        for child in node.children()? {
            if child.last_key < *start {
                continue;
            }
            if child.first_key > *end {
                break;
            }
            self.collect_range(child.child, start, end, out)?;
        }
        Ok(())
    }

    /// Total number of records in the tree.
    pub fn record_count(&mut self) -> Result<u64> {
        if self.store.get(ROOT_NODE_ID)?.is_none() {
            return Ok(0);
        }
        self.count_records(ROOT_NODE_ID)
    }

    fn count_records(&mut self, id: NodeId) -> Result<u64> {
        let node = self.load(id)?;
        if node.is_leaf() {
            return Ok(node.len() as u64);
        }
        let mut count = 0;
        for child in node.children()? {
            count += self.count_records(child.child)?;
        }
        Ok(count)
    }

    // =========================================================================
    // Cumulative balance
    // =========================================================================

    /// Returns the sum of amounts over all records with key <= `key`,
    /// in O(height): subtrees entirely at or below `key` contribute their
    /// cached amount without being visited.
    pub fn balance_as_of(&mut self, key: &RecordKey) -> Result<Decimal> {
        self.check_account(key)?;
        let mut total = Decimal::ZERO;
        let mut id = ROOT_NODE_ID;
        if self.store.get(id)?.is_none() {
            return Ok(total);
        }

        loop {
            let next = {
                let node = self.must_get(id)?;
                if node.is_leaf() {
                    for record in node.records()? {
                        if record.key > *key {
                            break;
                        }
                        total += record.amount;
                    }
                    return Ok(total);
                }

                let mut descend = None;
                for child in node.children()? {
                    if *key > child.last_key {
                        total += child.amount;
                    } else {
                        descend = Some(child.child);
                        break;
                    }
                }
                match descend {
                    Some(child_id) => child_id,
                    None => return Ok(total),
                }
            };
            id = next;
        }
    }

    // =========================================================================
    // Key adjustment
    // =========================================================================

    /// Returns a key with the smallest sequence number for (account, date)
    /// that is greater than every existing sequence at that instant, or the
    /// input key unchanged if the instant has no records.
    pub fn adjust_key(&mut self, key: &RecordKey) -> Result<RecordKey> {
        self.check_account(key)?;
        if self.store.get(ROOT_NODE_ID)?.is_none() {
            return Ok(key.clone());
        }

        let probe = key.with_sequence(u32::MAX);
        match self.last_at_or_before(ROOT_NODE_ID, &probe)? {
            Some(found) if found.same_day(key) => {
                let next = found.sequence.checked_add(1).ok_or_else(|| {
                    TallyError::SaturatedDay {
                        account: key.account.clone(),
                        date: key.date,
                    }
                })?;
                Ok(key.with_sequence(next))
            }
            _ => Ok(key.clone()),
        }
    }

    /// Largest key at or before `probe`, descending right-to-left. Empty
    /// subtrees are skipped by falling back to the next reference left.
    fn last_at_or_before(&mut self, id: NodeId, probe: &RecordKey) -> Result<Option<RecordKey>> {
        let node = self.load(id)?;
        if node.is_leaf() {
            return Ok(node
                .records()?
                .iter()
                .rev()
                .find(|r| r.key <= *probe)
                .map(|r| r.key.clone()));
        }
        for child in node.children()?.iter().rev() {
            if child.first_key <= *probe {
                if let Some(found) = self.last_at_or_before(child.child, probe)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Walks the whole tree and verifies its structural invariants: record
    /// and reference ordering, key brackets containing their subtrees, and
    /// every cached amount equal to the recomputed sum. Surfaces the first
    /// violation found. Full-traversal cost; intended for diagnostics and
    /// tests.
    pub fn check_consistency(&mut self) -> Result<()> {
        if self.store.get(ROOT_NODE_ID)?.is_none() {
            return Ok(());
        }
        self.check_node(ROOT_NODE_ID)
    }

    fn check_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.load(id)?;

        if node.is_leaf() {
            let records = node.records()?;
            for pair in records.windows(2) {
                if pair[0].key >= pair[1].key {
                    return Err(TallyError::Invariant(format!(
                        "leaf {} records out of order at {}",
                        id, pair[1].key
                    )));
                }
            }
            for record in records {
                if record.key.account != self.account {
                    return Err(TallyError::Invariant(format!(
                        "leaf {} holds key {} of a foreign account",
                        id, record.key
                    )));
                }
            }
            let sum: Decimal = records.iter().map(|r| r.amount).sum();
            if sum != node.amount() {
                return Err(TallyError::Invariant(format!(
                    "leaf {} caches amount {} but records sum to {}",
                    id,
                    node.amount(),
                    sum
                )));
            }
            return Ok(());
        }

        let children = node.children()?.to_vec();
        for pair in children.windows(2) {
            if pair[0].first_key > pair[1].first_key {
                return Err(TallyError::Invariant(format!(
                    "node {} references out of order at {}",
                    id, pair[1].first_key
                )));
            }
        }

        let mut sum = Decimal::ZERO;
        for child_ref in &children {
            if child_ref.child == ROOT_NODE_ID {
                return Err(TallyError::Invariant(format!(
                    "node {} references id 0 as a child",
                    id
                )));
            }
            let child = self.load(child_ref.child)?;
            if child.amount() != child_ref.amount {
                return Err(TallyError::Invariant(format!(
                    "node {} caches amount {} for child {} holding {}",
                    id,
                    child_ref.amount,
                    child_ref.child,
                    child.amount()
                )));
            }
            if !child.is_empty() {
                let actual = child.self_ref()?;
                if actual.first_key < child_ref.first_key || actual.last_key > child_ref.last_key
                {
                    return Err(TallyError::Invariant(format!(
                        "node {} bracket does not contain child {}",
                        id, child_ref.child
                    )));
                }
            }
            sum += child_ref.amount;
            self.check_node(child_ref.child)?;
        }
        if sum != node.amount() {
            return Err(TallyError::Invariant(format!(
                "node {} caches amount {} but children sum to {}",
                id,
                node.amount(),
                sum
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Save and deferred splits
    // =========================================================================

    /// Restores the size bound, then flushes the node cache to disk.
    ///
    /// The cache is rescanned after every split because a split can push its
    /// parent over the bound, and a split's final segment may itself still
    /// overflow. Each split strictly shrinks the node it targets, so the
    /// scan reaches a fixed point with every node at or under the degree.
    pub fn save(&mut self) -> Result<()> {
        loop {
            let overflowing = self
                .store
                .list()
                .find(|node| node.len() > self.degree)
                .cloned();
            match overflowing {
                Some(node) => self.split(node)?,
                None => break,
            }
        }
        self.store.save()
    }

    /// Splits one overflowing node into `ceil(len / degree)` segments. A
    /// non-root node's first segment keeps the original id so the parent's
    /// back-reference stays valid; a split root is rebuilt as a new internal
    /// node at id 0 over fresh segment ids.
    fn split(&mut self, node: Node) -> Result<()> {
        let old_ref = node.self_ref()?;
        let is_root = node.id() == ROOT_NODE_ID;
        let bounds = segment_bounds(node.len(), self.degree);
        debug!(
            node = node.id(),
            entries = node.len(),
            segments = bounds.len(),
            "splitting overflowing node"
        );

        let parent_id = if is_root {
            None
        } else {
            Some(self.find_parent(&old_ref)?)
        };

        let mut refs = Vec::with_capacity(bounds.len());
        for (at, range) in bounds.into_iter().enumerate() {
            let part_id = if is_root || at > 0 {
                self.store.new_id()
            } else {
                node.id()
            };
            let part = if node.is_leaf() {
                Node::leaf(part_id, node.records()?[range].to_vec())
            } else {
                Node::internal(part_id, node.children()?[range].to_vec())
            };
            refs.push(part.self_ref()?);
            self.store.put(part);
        }

        match parent_id {
            None => self.store.put(Node::internal(ROOT_NODE_ID, refs)),
            Some(parent_id) => {
                let parent = self.load(parent_id)?;
                self.store
                    .put(parent.with_replaced_child_by_many(&old_ref, refs)?);
            }
        }
        Ok(())
    }

    /// Locates the parent of `target` by re-descending from the root,
    /// following the child whose bracket covers the target's first key.
    fn find_parent(&mut self, target: &NodeRef) -> Result<NodeId> {
        let mut id = ROOT_NODE_ID;
        loop {
            let node = self.load(id)?;
            if node.is_leaf() {
                return Err(TallyError::Invariant(format!(
                    "parent locator reached leaf {} searching for node {}",
                    id, target.child
                )));
            }
            let children = node.children()?;
            if children.iter().any(|c| c.child == target.child) {
                return Ok(id);
            }
            let at = match node.find_child(&target.first_key)? {
                SearchResult::Found(at) => at,
                SearchResult::Missing(gap) => gap.saturating_sub(1),
            };
            id = children[at].child;
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Loads and clones a node that is required to exist.
    fn load(&mut self, id: NodeId) -> Result<Node> {
        Ok(self.must_get(id)?.clone())
    }

    fn must_get(&mut self, id: NodeId) -> Result<&Node> {
        match self.store.get(id)? {
            Some(node) => Ok(node),
            None => Err(TallyError::Invariant(format!(
                "node {id} referenced but absent"
            ))),
        }
    }

    /// Rebuilds the parent-side reference for a child after a mutation. An
    /// emptied leaf keeps its previous key bracket; only the amount changes.
    fn refresh_ref(&mut self, old: &NodeRef) -> Result<NodeRef> {
        let child = self.load(old.child)?;
        if child.is_empty() {
            Ok(NodeRef {
                first_key: old.first_key.clone(),
                last_key: old.last_key.clone(),
                child: old.child,
                amount: child.amount(),
            })
        } else {
            child.self_ref()
        }
    }

    /// Neighbour choice when an inserted key falls between child brackets:
    /// clamp at the edges, coin-flip in the interior so boundary-heavy
    /// workloads grow both sides evenly.
    fn pick_neighbour(&mut self, gap: usize, len: usize) -> usize {
        if gap == 0 {
            0
        } else if gap >= len {
            len - 1
        } else if self.rng.gen_bool(0.5) {
            gap - 1
        } else {
            gap
        }
    }

    fn check_account(&self, key: &RecordKey) -> Result<()> {
        if key.account != self.account {
            return Err(TallyError::Invariant(format!(
                "key for account {} routed to tree for {}",
                key.account, self.account
            )));
        }
        Ok(())
    }
}

/// Segment boundaries for splitting `len` entries with the given degree:
/// `ceil(len / degree)` segments of `floor(len / segments)` entries, the
/// final segment absorbing the remainder. The final segment may therefore
/// still exceed the degree; the save loop splits it again on the next pass.
fn segment_bounds(len: usize, degree: usize) -> Vec<std::ops::Range<usize>> {
    let segments = len.div_ceil(degree);
    let base = len / segments;
    let mut bounds = Vec::with_capacity(segments);
    let mut start = 0;
    for at in 0..segments {
        let end = if at + 1 == segments { len } else { start + base };
        bounds.push(start..end);
        start = end;
    }
    bounds
}
