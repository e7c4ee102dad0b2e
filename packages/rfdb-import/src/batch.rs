//! Ticketed batches of packed relationship records.
//!
//! A batch is a flat `[start, type, end, start, type, end, ...]` run of
//! u64 values. Packing keeps a batch a single allocation no matter how many
//! relationships it holds; the width-3 layout is an internal contract
//! between the producer and the counting step and is never persisted.

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};

/// Values per packed relationship.
pub const TRIPLE_WIDTH: usize = 3;

// ── Ticket ──────────────────────────────────────────────────────────

/// Position of a batch in its stage's stream. Strictly increasing from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl Ticket {
    /// The following ticket, or None once the id space is exhausted.
    pub fn next(self) -> Option<Ticket> {
        self.0.checked_add(1).map(Ticket)
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── RelationshipRecord ──────────────────────────────────────────────

/// One relationship as seen by the counting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub start: u64,
    pub rel_type: u32,
    pub end: u64,
}

impl RelationshipRecord {
    pub fn new(start: u64, rel_type: u32, end: u64) -> Self {
        Self { start, rel_type, end }
    }
}

impl From<(u64, u32, u64)> for RelationshipRecord {
    fn from((start, rel_type, end): (u64, u32, u64)) -> Self {
        Self { start, rel_type, end }
    }
}

// ── Batch ───────────────────────────────────────────────────────────

/// Immutable ticketed run of packed relationship records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    ticket: Ticket,
    records: Box<[u64]>,
}

impl Batch {
    /// Wrap packed values. The length must be a whole number of triples
    /// and no more than `max_records`.
    pub fn new(ticket: Ticket, records: Vec<u64>, max_records: usize) -> Result<Self> {
        if records.len() % TRIPLE_WIDTH != 0 {
            return Err(ImportError::MalformedBatch {
                ticket: ticket.0,
                len: records.len(),
            });
        }
        if records.len() > max_records {
            return Err(ImportError::BatchTooLarge {
                ticket: ticket.0,
                len: records.len(),
                max: max_records,
            });
        }
        Ok(Self {
            ticket,
            records: records.into_boxed_slice(),
        })
    }

    /// Pack relationships into a batch with no size cap.
    pub fn from_relationships(ticket: Ticket, rels: &[RelationshipRecord]) -> Self {
        let mut records = Vec::with_capacity(rels.len() * TRIPLE_WIDTH);
        for rel in rels {
            pack_into(&mut records, rel);
        }
        Self {
            ticket,
            records: records.into_boxed_slice(),
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Raw packed values.
    pub fn records(&self) -> &[u64] {
        &self.records
    }

    /// Number of relationships (not packed values).
    pub fn len(&self) -> usize {
        self.records.len() / TRIPLE_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Unpack relationships in arrival order.
    ///
    /// A type value that does not fit u32 yields `ConfigurationBoundsExceeded`.
    pub fn triples(&self) -> impl Iterator<Item = Result<RelationshipRecord>> + '_ {
        self.records.chunks_exact(TRIPLE_WIDTH).map(|chunk| {
            let rel_type = u32::try_from(chunk[1]).map_err(|_| {
                ImportError::ConfigurationBoundsExceeded {
                    kind: "relationship type",
                    id: chunk[1],
                    high: u32::MAX as u64,
                }
            })?;
            Ok(RelationshipRecord {
                start: chunk[0],
                rel_type,
                end: chunk[2],
            })
        })
    }
}

fn pack_into(records: &mut Vec<u64>, rel: &RelationshipRecord) {
    records.push(rel.start);
    records.push(rel.rel_type as u64);
    records.push(rel.end);
}

// ── BatchBuilder ────────────────────────────────────────────────────

/// Packs relationships into capped batches and stamps consecutive tickets.
pub struct BatchBuilder {
    max_records: usize,
    next_ticket: Ticket,
    pending: Vec<u64>,
}

impl BatchBuilder {
    /// `max_records` is rounded down to whole triples (minimum one triple).
    pub fn new(max_records: usize) -> Self {
        let max_records = (max_records / TRIPLE_WIDTH).max(1) * TRIPLE_WIDTH;
        Self {
            max_records,
            next_ticket: Ticket(0),
            pending: Vec::with_capacity(max_records),
        }
    }

    /// Add a relationship; returns a full batch when the cap is reached.
    pub fn push(&mut self, rel: &RelationshipRecord) -> Option<Batch> {
        pack_into(&mut self.pending, rel);
        if self.pending.len() >= self.max_records {
            Some(self.seal())
        } else {
            None
        }
    }

    /// Emit whatever is pending (None if nothing is).
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.seal())
        }
    }

    /// Ticket the next sealed batch will carry.
    pub fn next_ticket(&self) -> Ticket {
        self.next_ticket
    }

    fn seal(&mut self) -> Batch {
        let records = std::mem::replace(&mut self.pending, Vec::with_capacity(self.max_records));
        let ticket = self.next_ticket;
        // past u64::MAX the ticket repeats and the stage intake rejects it
        self.next_ticket = ticket.next().unwrap_or(ticket);
        Batch {
            ticket,
            records: records.into_boxed_slice(),
        }
    }
}

// ── TicketSequencer ─────────────────────────────────────────────────

/// Stage-intake check: tickets must arrive as 0, 1, 2, ... with no gaps.
#[derive(Debug)]
pub struct TicketSequencer {
    step: String,
    last: Option<Ticket>,
}

impl TicketSequencer {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            last: None,
        }
    }

    pub fn observe(&mut self, ticket: Ticket) -> Result<()> {
        let expected = match self.last {
            None => Some(Ticket(0)),
            Some(last) => last.next(),
        };
        if expected != Some(ticket) {
            return Err(ImportError::OutOfOrderTicket {
                step: self.step.clone(),
                ticket: ticket.0,
                last: self.last.map_or(u64::MAX, |t| t.0),
            });
        }
        self.last = Some(ticket);
        Ok(())
    }

    /// Number of tickets observed so far.
    pub fn observed(&self) -> u64 {
        self.last.map_or(0, |t| t.0.saturating_add(1))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
