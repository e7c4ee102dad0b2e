//! Per-worker relationship counts aggregator.
//!
//! One aggregator belongs to exactly one worker slot for the lifetime of a
//! stage. It accumulates deltas into a private arena and flushes them into
//! the sink exactly once:
//!
//! ```text
//! (no aggregator) --first process()--> Active --done()--> Drained
//! ```
//!
//! `process()` or `done()` on a drained aggregator is a `DoubleDrain`.

use std::sync::Arc;

use crate::config::ImportConfig;
use crate::counts::{CountsArena, CountsKey};
use crate::error::{ImportError, Result};
use crate::labels::{LabelId, NodeLabelLookup};
use crate::sink::CountsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Active,
    Drained,
}

/// What one drain contributed to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Distinct keys with a non-zero delta applied.
    pub keys_applied: usize,
    /// Relationships processed before the drain.
    pub relationships: u64,
}

pub struct RelationshipCountsAggregator {
    owner: String,
    labels: Arc<dyn NodeLabelLookup>,
    high_label_id: u32,
    high_relationship_type_id: u32,
    arena: CountsArena,
    relationships: u64,
    state: AggregatorState,
}

impl RelationshipCountsAggregator {
    pub fn new(
        owner: impl Into<String>,
        labels: Arc<dyn NodeLabelLookup>,
        config: &ImportConfig,
    ) -> Self {
        Self {
            owner: owner.into(),
            labels,
            high_label_id: config.high_label_id,
            high_relationship_type_id: config.high_relationship_type_id,
            arena: CountsArena::new(
                config.high_label_id,
                config.high_relationship_type_id,
                config.dense_cell_limit,
            ),
            relationships: 0,
            state: AggregatorState::Active,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn relationships(&self) -> u64 {
        self.relationships
    }

    /// Current accumulated delta for `key` (not yet applied to any sink).
    pub fn pending(&self, key: &CountsKey) -> i64 {
        self.arena.get(key)
    }

    /// Count one relationship. Not idempotent: the same triple twice counts
    /// twice.
    pub fn process(&mut self, start: u64, rel_type: u32, end: u64) -> Result<()> {
        if self.state == AggregatorState::Drained {
            return Err(ImportError::DoubleDrain { owner: self.owner.clone() });
        }
        if rel_type > self.high_relationship_type_id {
            return Err(ImportError::ConfigurationBoundsExceeded {
                kind: "relationship type",
                id: rel_type as u64,
                high: self.high_relationship_type_id as u64,
            });
        }

        let starts = self.labels.labels_of(start)?;
        let ends = self.labels.labels_of(end)?;
        check_labels(starts, self.high_label_id)?;
        check_labels(ends, self.high_label_id)?;

        self.arena.record(starts, rel_type, ends, 1);
        self.relationships += 1;
        Ok(())
    }

    /// Apply every accumulated delta to `sink` and retire the aggregator.
    ///
    /// The aggregator is Drained even when the sink fails part-way, so a
    /// failed drain can never be re-applied.
    pub fn done(&mut self, sink: &dyn CountsSink) -> Result<DrainSummary> {
        if self.state == AggregatorState::Drained {
            return Err(ImportError::DoubleDrain { owner: self.owner.clone() });
        }
        self.state = AggregatorState::Drained;

        let deltas = self.arena.drain();
        let keys_applied = deltas.len();
        for (key, delta) in deltas {
            sink.apply_delta(key, delta).map_err(|e| match e {
                ImportError::SinkApplyFailure(_) => e,
                other => ImportError::SinkApplyFailure(format!("{key}: {other}")),
            })?;
        }

        tracing::debug!(
            "{} drained {} relationships into {} keys",
            self.owner,
            self.relationships,
            keys_applied
        );
        Ok(DrainSummary {
            keys_applied,
            relationships: self.relationships,
        })
    }
}

fn check_labels(labels: &[LabelId], high: u32) -> Result<()> {
    // lookups other than NodeLabelCache may hand back labels in any order
    match labels.iter().max() {
        Some(&max) if max > high => Err(ImportError::ConfigurationBoundsExceeded {
            kind: "label",
            id: max as u64,
            high: high as u64,
        }),
        _ => Ok(()),
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::{LabelSelector, TypeSelector};
    use crate::labels::NodeLabelCache;
    use crate::sink::InMemoryCountsSink;

    const A: LabelId = 0;
    const B: LabelId = 1;

    fn lookup(entries: &[(u64, &[LabelId])]) -> Arc<dyn NodeLabelLookup> {
        let mut builder = NodeLabelCache::builder();
        for (node, labels) in entries {
            builder.put(*node, labels);
        }
        Arc::new(builder.build().unwrap())
    }

    fn aggregator(high_label: u32, high_type: u32) -> RelationshipCountsAggregator {
        let labels = lookup(&[(0, &[]), (1, &[A]), (2, &[B]), (3, &[B]), (4, &[A, B])]);
        let config = ImportConfig::with_bounds(high_label, high_type);
        RelationshipCountsAggregator::new("slot 0", labels, &config)
    }

    struct FailingSink;

    /// Lookup that returns label sets unsorted.
    struct UnsortedLookup;

    impl NodeLabelLookup for UnsortedLookup {
        fn labels_of(&self, node: u64) -> Result<&[LabelId]> {
            match node {
                0 => Ok(&[2, 0][..]),
                1 => Ok(&[0][..]),
                _ => Err(ImportError::UnknownNode(node)),
            }
        }

        fn node_count(&self) -> u64 {
            2
        }

        fn high_label_id(&self) -> Option<LabelId> {
            Some(2)
        }
    }

    impl CountsSink for FailingSink {
        fn apply_delta(&self, _key: CountsKey, _delta: i64) -> Result<()> {
            Err(ImportError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_process_and_drain() {
        let mut agg = aggregator(1, 1);
        agg.process(1, 0, 2).unwrap();
        agg.process(1, 0, 3).unwrap();
        agg.process(2, 1, 1).unwrap();
        assert_eq!(agg.pending(&CountsKey::specific(A, 0, B)), 2);

        let sink = InMemoryCountsSink::new();
        let summary = agg.done(&sink).unwrap();
        assert_eq!(summary.relationships, 3);
        assert_eq!(agg.state(), AggregatorState::Drained);

        assert_eq!(sink.get(&CountsKey::specific(A, 0, B)), 2);
        assert_eq!(sink.get(&CountsKey::specific(B, 1, A)), 1);
        assert_eq!(sink.get(&CountsKey::all()), 3);
        assert_eq!(summary.keys_applied, sink.len());
    }

    #[test]
    fn test_double_drain_is_fatal() {
        let mut agg = aggregator(1, 1);
        agg.process(1, 0, 2).unwrap();

        let sink = InMemoryCountsSink::new();
        agg.done(&sink).unwrap();
        let err = agg.done(&sink).unwrap_err();
        assert!(matches!(err, ImportError::DoubleDrain { .. }));
        assert_eq!(sink.get(&CountsKey::all()), 1, "count must not double");
    }

    #[test]
    fn test_process_after_drain_is_fatal() {
        let mut agg = aggregator(1, 1);
        agg.done(&InMemoryCountsSink::new()).unwrap();
        assert!(matches!(agg.process(1, 0, 2), Err(ImportError::DoubleDrain { .. })));
    }

    #[test]
    fn test_label_bounds_inclusive() {
        // B == 1 == high_label_id: accepted
        let mut at_bound = aggregator(1, 1);
        at_bound.process(4, 0, 4).unwrap();

        // B == 1 > high_label_id 0: rejected
        let mut over = aggregator(0, 1);
        let err = over.process(1, 0, 2).unwrap_err();
        assert!(matches!(
            err,
            ImportError::ConfigurationBoundsExceeded { kind: "label", id: 1, high: 0 }
        ));
        assert_eq!(over.relationships(), 0);
    }

    #[test]
    fn test_unsorted_labels_still_bounds_checked() {
        let mut agg = RelationshipCountsAggregator::new(
            "slot 0",
            Arc::new(UnsortedLookup),
            &ImportConfig::with_bounds(1, 0),
        );
        let err = agg.process(1, 0, 0).unwrap_err();
        assert!(matches!(
            err,
            ImportError::ConfigurationBoundsExceeded { kind: "label", id: 2, high: 1 }
        ));
        assert_eq!(agg.relationships(), 0);
        assert_eq!(agg.pending(&CountsKey::all()), 0);
    }

    #[test]
    fn test_pending_outside_bounds_is_zero() {
        let mut agg = aggregator(1, 0);
        agg.process(1, 0, 2).unwrap();
        assert_eq!(agg.pending(&CountsKey::specific(9, 0, 0)), 0);
        let past_bound =
            CountsKey::new(LabelSelector::Label(2), TypeSelector::Any, LabelSelector::Any);
        assert_eq!(agg.pending(&past_bound), 0);
        assert_eq!(agg.pending(&CountsKey::all()), 1);
    }

    #[test]
    fn test_type_bounds_inclusive() {
        let mut agg = aggregator(1, 2);
        agg.process(0, 2, 0).unwrap();
        let err = agg.process(0, 3, 0).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_BOUNDS_EXCEEDED");
    }

    #[test]
    fn test_unknown_node_is_fatal() {
        let mut agg = aggregator(1, 1);
        assert!(matches!(agg.process(1, 0, 99), Err(ImportError::UnknownNode(99))));
    }

    #[test]
    fn test_multi_label_node_counts_each_label() {
        let mut agg = aggregator(1, 0);
        agg.process(4, 0, 0).unwrap();
        let sink = InMemoryCountsSink::new();
        agg.done(&sink).unwrap();

        let any_end = LabelSelector::Any;
        let t = TypeSelector::Type(0);
        assert_eq!(sink.get(&CountsKey::new(LabelSelector::Label(A), t, any_end)), 1);
        assert_eq!(sink.get(&CountsKey::new(LabelSelector::Label(B), t, any_end)), 1);
        assert_eq!(sink.get(&CountsKey::new(LabelSelector::Any, t, any_end)), 1);
    }

    #[test]
    fn test_sink_failure_marks_drained() {
        let mut agg = aggregator(1, 1);
        agg.process(1, 0, 2).unwrap();

        let err = agg.done(&FailingSink).unwrap_err();
        assert_eq!(err.code(), "SINK_APPLY_FAILURE");
        assert_eq!(agg.state(), AggregatorState::Drained);
        assert!(agg.done(&InMemoryCountsSink::new()).is_err());
    }
}
