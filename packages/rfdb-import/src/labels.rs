//! Read-only node → label-set lookup consulted by the counting step.
//!
//! The cache is filled by an earlier stage and frozen before counting
//! starts. Layout is CSR: `offsets[n]..offsets[n + 1]` indexes the sorted,
//! de-duplicated label ids of node `n` in one flat array, so concurrent
//! readers share it through an `Arc` with no synchronization.

use crate::error::{ImportError, Result};

pub type LabelId = u32;

/// Label-set lookup shared by every aggregator of a stage.
///
/// Send + Sync required: one instance is read concurrently by all workers.
pub trait NodeLabelLookup: Send + Sync {
    /// Label ids of `node`, sorted ascending. Unknown ids are an error.
    fn labels_of(&self, node: u64) -> Result<&[LabelId]>;

    /// Number of node ids the lookup covers.
    fn node_count(&self) -> u64;

    /// Highest label id stored, if any node has a label.
    fn high_label_id(&self) -> Option<LabelId>;
}

// ── NodeLabelCache ──────────────────────────────────────────────────

/// Immutable CSR label cache indexed by dense node id.
#[derive(Debug, Clone, Default)]
pub struct NodeLabelCache {
    offsets: Vec<u32>,
    labels: Vec<LabelId>,
    high_label_id: Option<LabelId>,
}

impl NodeLabelCache {
    pub fn builder() -> NodeLabelCacheBuilder {
        NodeLabelCacheBuilder::default()
    }

    /// Bytes held by the two arrays.
    pub fn heap_size(&self) -> usize {
        self.offsets.len() * std::mem::size_of::<u32>()
            + self.labels.len() * std::mem::size_of::<LabelId>()
    }
}

impl NodeLabelLookup for NodeLabelCache {
    fn labels_of(&self, node: u64) -> Result<&[LabelId]> {
        if node >= self.node_count() {
            return Err(ImportError::UnknownNode(node));
        }
        let idx = node as usize;
        let from = self.offsets[idx] as usize;
        let to = self.offsets[idx + 1] as usize;
        Ok(&self.labels[from..to])
    }

    fn node_count(&self) -> u64 {
        self.offsets.len().saturating_sub(1) as u64
    }

    fn high_label_id(&self) -> Option<LabelId> {
        self.high_label_id
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Collects per-node label sets, then freezes them into a `NodeLabelCache`.
///
/// Node ids are dense: every id below the highest one put is present in the
/// built cache (ids never put get an empty label set).
#[derive(Debug, Default)]
pub struct NodeLabelCacheBuilder {
    per_node: Vec<Vec<LabelId>>,
}

impl NodeLabelCacheBuilder {
    /// Set the labels of `node`, replacing any earlier set.
    pub fn put(&mut self, node: u64, labels: &[LabelId]) -> &mut Self {
        let idx = node as usize;
        if idx >= self.per_node.len() {
            self.per_node.resize_with(idx + 1, Vec::new);
        }
        let mut set = labels.to_vec();
        set.sort_unstable();
        set.dedup();
        self.per_node[idx] = set;
        self
    }

    /// Make sure node ids `0..count` exist even if they carry no labels.
    pub fn reserve_nodes(&mut self, count: u64) -> &mut Self {
        let count = count as usize;
        if count > self.per_node.len() {
            self.per_node.resize_with(count, Vec::new);
        }
        self
    }

    pub fn build(self) -> Result<NodeLabelCache> {
        let total: usize = self.per_node.iter().map(Vec::len).sum();
        if u32::try_from(total).is_err() {
            return Err(ImportError::InvalidConfig(format!(
                "label cache holds {total} entries, more than a u32 offset can address"
            )));
        }

        let mut offsets = Vec::with_capacity(self.per_node.len() + 1);
        let mut labels = Vec::with_capacity(total);
        offsets.push(0);
        for set in &self.per_node {
            labels.extend_from_slice(set);
            offsets.push(labels.len() as u32);
        }
        let high_label_id = labels.iter().copied().max();

        Ok(NodeLabelCache {
            offsets,
            labels,
            high_label_id,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_sorted_and_deduped() {
        let mut builder = NodeLabelCache::builder();
        builder.put(0, &[3, 1, 3]).put(2, &[0]);
        let cache = builder.build().unwrap();

        assert_eq!(cache.labels_of(0).unwrap(), &[1, 3]);
        assert_eq!(cache.labels_of(1).unwrap(), &[] as &[LabelId]);
        assert_eq!(cache.labels_of(2).unwrap(), &[0]);
        assert_eq!(cache.node_count(), 3);
        assert_eq!(cache.high_label_id(), Some(3));
    }

    #[test]
    fn test_unknown_node_is_error() {
        let mut builder = NodeLabelCache::builder();
        builder.put(0, &[1]);
        let cache = builder.build().unwrap();

        let err = cache.labels_of(1).unwrap_err();
        assert!(matches!(err, ImportError::UnknownNode(1)));
    }

    #[test]
    fn test_put_replaces() {
        let mut builder = NodeLabelCache::builder();
        builder.put(0, &[1, 2]).put(0, &[5]);
        let cache = builder.build().unwrap();
        assert_eq!(cache.labels_of(0).unwrap(), &[5]);
    }

    #[test]
    fn test_reserve_nodes_without_labels() {
        let mut builder = NodeLabelCache::builder();
        builder.reserve_nodes(10);
        let cache = builder.build().unwrap();
        assert_eq!(cache.node_count(), 10);
        assert!(cache.labels_of(9).unwrap().is_empty());
        assert_eq!(cache.high_label_id(), None);
    }

    #[test]
    fn test_empty_cache() {
        let cache = NodeLabelCache::builder().build().unwrap();
        assert_eq!(cache.node_count(), 0);
        assert!(cache.labels_of(0).is_err());
        assert_eq!(cache.heap_size(), std::mem::size_of::<u32>());
    }
}
