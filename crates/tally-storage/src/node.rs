//! Immutable B-tree nodes.
//!
//! A node is either a leaf holding sorted records or an internal node holding
//! sorted child references. Mutating operations return a new `Node` value
//! that replaces the old one in the cache under the same id; the arrays are
//! genuinely cloned, so a retired node can never observe later mutations.
//!
//! Every node carries `amount`, the exact sum of amounts in its subtree.
//! The sum is derived in the `Node::leaf` / `Node::internal` constructors
//! and nowhere else, so no mutation path can leave it stale.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_common::{Record, RecordKey, Result, TallyError};

/// Stable node identifier within one account tree.
pub type NodeId = u64;

/// The root of a tree is always node 0; a tree is empty iff node 0 is absent.
pub const ROOT_NODE_ID: NodeId = 0;

/// Summary of a child subtree held by an internal node.
///
/// `first_key` and `last_key` bracket every key reachable through `child`;
/// `amount` is the exact sum of amounts in that subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    /// Smallest key reachable through the child.
    pub first_key: RecordKey,
    /// Largest key reachable through the child.
    pub last_key: RecordKey,
    /// Id of the child node.
    pub child: NodeId,
    /// Sum of amounts in the child's subtree.
    pub amount: Decimal,
}

impl NodeRef {
    /// Returns true if `key` falls inside this reference's bracket.
    pub fn contains(&self, key: &RecordKey) -> bool {
        *key >= self.first_key && *key <= self.last_key
    }
}

/// Payload of a node: records in a leaf, child references in an internal
/// node. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeContents {
    /// Records sorted strictly ascending by key.
    Leaf(Vec<Record>),
    /// Child references sorted ascending by `first_key`.
    Internal(Vec<NodeRef>),
}

/// Outcome of a binary search over a node's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key was found at this index.
    Found(usize),
    /// The key was not found; this is its insertion point.
    Missing(usize),
}

impl SearchResult {
    /// The index, whether found or not.
    pub fn index(&self) -> usize {
        match self {
            SearchResult::Found(at) | SearchResult::Missing(at) => *at,
        }
    }
}

/// One immutable B-tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    contents: NodeContents,
    amount: Decimal,
}

impl Node {
    /// Builds a leaf. `amount` is derived from the records here; this and
    /// [`Node::internal`] are the only places the cached sum is computed.
    pub fn leaf(id: NodeId, records: Vec<Record>) -> Self {
        let amount = records.iter().map(|r| r.amount).sum();
        Self {
            id,
            contents: NodeContents::Leaf(records),
            amount,
        }
    }

    /// Builds an internal node; `amount` is derived from the child refs.
    pub fn internal(id: NodeId, children: Vec<NodeRef>) -> Self {
        let amount = children.iter().map(|c| c.amount).sum();
        Self {
            id,
            contents: NodeContents::Internal(children),
            amount,
        }
    }

    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// True if this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.contents, NodeContents::Leaf(_))
    }

    /// The cached sum of amounts in this node's subtree.
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Number of entries: records in a leaf, child refs in an internal node.
    pub fn len(&self) -> usize {
        match &self.contents {
            NodeContents::Leaf(records) => records.len(),
            NodeContents::Internal(children) => children.len(),
        }
    }

    /// True if the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The records of a leaf. Calling this on an internal node is a fatal
    /// contract violation.
    pub fn records(&self) -> Result<&[Record]> {
        match &self.contents {
            NodeContents::Leaf(records) => Ok(records),
            NodeContents::Internal(_) => Err(TallyError::Invariant(format!(
                "leaf operation on internal node {}",
                self.id
            ))),
        }
    }

    /// The child references of an internal node. Calling this on a leaf is a
    /// fatal contract violation.
    pub fn children(&self) -> Result<&[NodeRef]> {
        match &self.contents {
            NodeContents::Internal(children) => Ok(children),
            NodeContents::Leaf(_) => Err(TallyError::Invariant(format!(
                "internal operation on leaf node {}",
                self.id
            ))),
        }
    }

    /// Binary-searches a leaf for `key`.
    pub fn find_record(&self, key: &RecordKey) -> Result<SearchResult> {
        let records = self.records()?;
        Ok(match records.binary_search_by(|r| r.key.cmp(key)) {
            Ok(at) => SearchResult::Found(at),
            Err(at) => SearchResult::Missing(at),
        })
    }

    /// Binary-searches an internal node for the child whose key range
    /// brackets `key`. On a miss, the insertion point is the index of the
    /// first child whose range starts beyond `key`.
    ///
    /// Must not be called on a node with no children; non-root internals are
    /// never empty, and the tree never routes into an empty root this way.
    pub fn find_child(&self, key: &RecordKey) -> Result<SearchResult> {
        let children = self.children()?;
        if children.is_empty() {
            return Err(TallyError::Invariant(format!(
                "child search on internal node {} with no children",
                self.id
            )));
        }

        let mut lo = 0;
        let mut hi = children.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if *key < children[mid].first_key {
                hi = mid;
            } else if *key > children[mid].last_key {
                lo = mid + 1;
            } else {
                return Ok(SearchResult::Found(mid));
            }
        }
        Ok(SearchResult::Missing(lo))
    }

    /// Returns a new leaf with `record` inserted at `at`.
    pub fn with_inserted_record(&self, at: usize, record: Record) -> Result<Node> {
        let mut records = self.records()?.to_vec();
        records.insert(at, record);
        Ok(Node::leaf(self.id, records))
    }

    /// Returns a new leaf with the record at `at` removed.
    pub fn with_deleted_record(&self, at: usize) -> Result<Node> {
        let mut records = self.records()?.to_vec();
        records.remove(at);
        Ok(Node::leaf(self.id, records))
    }

    /// Returns a new leaf with the record at `at` replaced.
    pub fn with_replaced_record(&self, at: usize, record: Record) -> Result<Node> {
        let mut records = self.records()?.to_vec();
        records[at] = record;
        Ok(Node::leaf(self.id, records))
    }

    /// Returns a new internal node with the child ref at `at` replaced.
    pub fn with_replaced_child(&self, at: usize, child: NodeRef) -> Result<Node> {
        let mut children = self.children()?.to_vec();
        children[at] = child;
        Ok(Node::internal(self.id, children))
    }

    /// Returns a new internal node in which the child matching `old` is
    /// replaced by `replacements`. Used only during splits; sort order is
    /// preserved because the replacements exactly span the old child's range.
    pub fn with_replaced_child_by_many(
        &self,
        old: &NodeRef,
        replacements: Vec<NodeRef>,
    ) -> Result<Node> {
        let children = self.children()?;
        let at = children
            .iter()
            .position(|c| c.child == old.child)
            .ok_or_else(|| {
                TallyError::Invariant(format!(
                    "node {} has no child {} to replace",
                    self.id, old.child
                ))
            })?;

        let mut next = Vec::with_capacity(children.len() - 1 + replacements.len());
        next.extend_from_slice(&children[..at]);
        next.extend(replacements);
        next.extend_from_slice(&children[at + 1..]);
        Ok(Node::internal(self.id, next))
    }

    /// Produces the `NodeRef` summarizing this node for its parent.
    ///
    /// Fails on an empty node: an emptied leaf keeps its previous bracket in
    /// the parent, which the tree layer maintains.
    pub fn self_ref(&self) -> Result<NodeRef> {
        let (first_key, last_key) = match &self.contents {
            NodeContents::Leaf(records) => match (records.first(), records.last()) {
                (Some(first), Some(last)) => (first.key.clone(), last.key.clone()),
                _ => {
                    return Err(TallyError::Invariant(format!(
                        "self_ref on empty node {}",
                        self.id
                    )))
                }
            },
            NodeContents::Internal(children) => match (children.first(), children.last()) {
                (Some(first), Some(last)) => {
                    (first.first_key.clone(), last.last_key.clone())
                }
                _ => {
                    return Err(TallyError::Invariant(format!(
                        "self_ref on empty node {}",
                        self.id
                    )))
                }
            },
        };

        Ok(NodeRef {
            first_key,
            last_key,
            child: self.id,
            amount: self.amount,
        })
    }
}
