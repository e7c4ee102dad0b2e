//! Destination for merged relationship counts.
//!
//! The sink is the only cross-thread mutation point of a counting stage, and
//! it is touched only while aggregators drain at stage completion.
//! `apply_delta` takes `&self`: aggregators may drain concurrently, so each
//! key is an `AtomicI64` behind a read-mostly `RwLock`d map. Existing keys
//! add under the read lock; only the first delta of a new key takes the
//! write lock.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::counts::CountsKey;
use crate::error::{ImportError, Result};

/// Receives merged count deltas.
///
/// Send + Sync required: parallel merges call `apply_delta` from several
/// threads at once.
pub trait CountsSink: Send + Sync {
    fn apply_delta(&self, key: CountsKey, delta: i64) -> Result<()>;
}

// ── InMemoryCountsSink ─────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryCountsSink {
    counts: RwLock<HashMap<CountsKey, AtomicI64>>,
    applied: AtomicU64,
}

impl InMemoryCountsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key` (0 if never touched).
    pub fn get(&self, key: &CountsKey) -> i64 {
        match self.counts.read() {
            Ok(map) => map.get(key).map_or(0, |c| c.load(Ordering::Acquire)),
            Err(poisoned) => poisoned
                .into_inner()
                .get(key)
                .map_or(0, |c| c.load(Ordering::Acquire)),
        }
    }

    /// Sorted copy of every key with a non-zero count.
    pub fn snapshot(&self) -> BTreeMap<CountsKey, i64> {
        let map = match self.counts.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.iter()
            .map(|(k, c)| (*k, c.load(Ordering::Acquire)))
            .filter(|&(_, v)| v != 0)
            .collect()
    }

    /// Number of distinct keys ever touched.
    pub fn len(&self) -> usize {
        self.counts.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `apply_delta` calls accepted.
    pub fn total_applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    fn load_snapshot(&self, entries: Vec<(CountsKey, i64)>) -> Result<()> {
        for (key, count) in entries {
            self.apply_delta(key, count)?;
        }
        Ok(())
    }
}

impl CountsSink for InMemoryCountsSink {
    fn apply_delta(&self, key: CountsKey, delta: i64) -> Result<()> {
        {
            let map = self
                .counts
                .read()
                .map_err(|_| ImportError::SinkApplyFailure("counts map poisoned".into()))?;
            if let Some(cell) = map.get(&key) {
                cell.fetch_add(delta, Ordering::AcqRel);
                self.applied.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let mut map = self
            .counts
            .write()
            .map_err(|_| ImportError::SinkApplyFailure("counts map poisoned".into()))?;
        map.entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::AcqRel);
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ── FileCountsSink ─────────────────────────────────────────────────

/// On-disk snapshot written by `FileCountsSink::commit`.
#[derive(Debug, Serialize, Deserialize)]
struct CountsSnapshot {
    version: u32,
    entries: Vec<(CountsKey, i64)>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Counts sink that persists on commit.
///
/// Deltas accumulate in memory; nothing reaches disk until `commit()`, so an
/// aborted stage that never commits leaves the previous snapshot intact.
#[derive(Debug)]
pub struct FileCountsSink {
    path: PathBuf,
    inner: InMemoryCountsSink,
}

impl FileCountsSink {
    /// Start from the snapshot at `path` if one exists, else empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = InMemoryCountsSink::new();
        if path.exists() {
            inner.load_snapshot(read_snapshot(&path)?)?;
        }
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counts(&self) -> &InMemoryCountsSink {
        &self.inner
    }

    /// Write all counts atomically: temp file, fsync, rename.
    pub fn commit(&self) -> Result<()> {
        let snapshot = CountsSnapshot {
            version: SNAPSHOT_VERSION,
            entries: self.inner.snapshot().into_iter().collect(),
        };

        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(
            "committed {} relationship counts to {}",
            snapshot.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read a committed snapshot without opening a sink.
    pub fn load(path: &Path) -> Result<BTreeMap<CountsKey, i64>> {
        Ok(read_snapshot(path)?.into_iter().collect())
    }
}

impl CountsSink for FileCountsSink {
    fn apply_delta(&self, key: CountsKey, delta: i64) -> Result<()> {
        self.inner.apply_delta(key, delta)
    }
}

fn read_snapshot(path: &Path) -> Result<Vec<(CountsKey, i64)>> {
    let reader = BufReader::new(File::open(path)?);
    let snapshot: CountsSnapshot = bincode::deserialize_from(reader)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(ImportError::InvalidConfig(format!(
            "counts snapshot {} has version {}, expected {}",
            path.display(),
            snapshot.version,
            SNAPSHOT_VERSION
        )));
    }
    Ok(snapshot.entries)
}

// ── Tests ──────────────────────────────────────────────────────────
