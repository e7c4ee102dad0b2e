//! Count profile: relationship-counting throughput across worker pool sizes.
//!
//! Builds a synthetic labelled graph, runs the counting stage once per pool
//! size, and prints throughput plus process RSS delta. With `--json` the
//! per-run stage reports are printed as JSON instead of a table.
//!
//! Run: cargo run --release --bin count_profile -- [relationships] [--config <file>] [--json]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use rfdb_import::logging::{init_logging, level_from_env};
use rfdb_import::{
    relationship_counts_stage, CountsKey, ImportConfig, ImportTuning, InMemoryCountsSink, LabelId,
    NodeLabelCache, RelationshipBatchSource, RelationshipRecord, StageReport,
};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

const DEFAULT_RELATIONSHIPS: u64 = 2_000_000;
const NODES: u64 = 100_000;
const HIGH_LABEL: LabelId = 15;
const HIGH_TYPE: u32 = 7;

struct Args {
    relationships: u64,
    config: Option<PathBuf>,
    json: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        relationships: DEFAULT_RELATIONSHIPS,
        config: None,
        json: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => args.json = true,
            "--config" => {
                let path = iter.next().context("--config needs a file path")?;
                args.config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            count => {
                args.relationships = count
                    .parse()
                    .with_context(|| format!("'{count}' is not a relationship count"))?;
            }
        }
    }
    Ok(args)
}

// ── Synthetic graph ────────────────────────────────────────────────────

/// Deterministic 64-bit mixer so runs are comparable.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn make_labels() -> anyhow::Result<NodeLabelCache> {
    let mut builder = NodeLabelCache::builder();
    builder.reserve_nodes(NODES);
    let span = HIGH_LABEL as u64 + 1;
    for node in 0..NODES {
        let h = mix(node);
        let labels: Vec<LabelId> = match h % 10 {
            0 => Vec::new(),
            1..=6 => vec![(h % span) as LabelId],
            _ => vec![(h % span) as LabelId, ((h >> 8) % span) as LabelId],
        };
        builder.put(node, &labels);
    }
    Ok(builder.build()?)
}

fn relationships(count: u64) -> impl Iterator<Item = RelationshipRecord> + Send {
    (0..count).map(|i| {
        let h = mix(i ^ 0xA5A5);
        let rel_type = ((h >> 20) % (HIGH_TYPE as u64 + 1)) as u32;
        RelationshipRecord::new(h % NODES, rel_type, (h >> 40) % NODES)
    })
}

// ── RSS measurement ────────────────────────────────────────────────────

fn get_process_rss() -> u64 {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    sys.refresh_all();
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid).map(|p| p.memory()))
        .unwrap_or(0)
}

fn run_once(
    base: &ImportConfig,
    workers: usize,
    labels: Arc<NodeLabelCache>,
    count: u64,
) -> anyhow::Result<(StageReport, u64, i64)> {
    let config = ImportConfig {
        worker_count: workers,
        ..base.clone()
    };
    let sink = Arc::new(InMemoryCountsSink::new());
    let stage = relationship_counts_stage(config.clone(), labels, sink.clone())?;
    let mut source = RelationshipBatchSource::new(relationships(count), config.max_batch_records);

    std::thread::sleep(std::time::Duration::from_millis(100));
    let baseline = get_process_rss();
    let report = stage.execute(&mut source)?;
    let rss = get_process_rss().saturating_sub(baseline);

    Ok((report, rss, sink.get(&CountsKey::all())))
}

// ── Main ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    init_logging(level_from_env(tracing::Level::WARN));
    let args = parse_args()?;

    let tuning = ImportTuning::detect();
    let base = match &args.config {
        Some(path) => ImportConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ImportConfig::with_bounds(HIGH_LABEL, HIGH_TYPE).tuned(&tuning),
    };
    base.validate()?;

    let labels = Arc::new(make_labels()?);
    let mut pools = vec![1, 2, 4, tuning.worker_count];
    pools.sort_unstable();
    pools.dedup();

    if !args.json {
        println!(
            "Relationship count profile ({} relationships, {} nodes)",
            args.relationships, NODES
        );
        println!("=======================================================");
        println!();
        println!(
            "{:<8} {:>12} {:>14} {:>12} {:>12} {:>10}",
            "Workers", "Time (ms)", "Rels/sec", "Blocked (ms)", "Keys", "RSS (MB)"
        );
        println!("{:-<73}", "");
    }

    let mut reports = Vec::new();
    for workers in pools {
        eprint!("Measuring {} workers... ", workers);
        let (report, rss, total) =
            run_once(&base, workers, Arc::clone(&labels), args.relationships)?;
        eprintln!("done");

        if total != args.relationships as i64 {
            bail!(
                "{} workers counted {} relationships, expected {}",
                workers,
                total,
                args.relationships
            );
        }
        if !args.json {
            let secs = report.elapsed_ms.max(1) as f64 / 1000.0;
            println!(
                "{:<8} {:>12} {:>14.0} {:>12} {:>12} {:>10.1}",
                workers,
                report.elapsed_ms,
                report.relationships as f64 / secs,
                report.producer_blocked_ms,
                report.merge.items_flushed,
                rss as f64 / (1024.0 * 1024.0)
            );
        }
        reports.push(report);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!();
        println!("Note: Keys counts deltas applied across all worker aggregators.");
    }
    Ok(())
}
