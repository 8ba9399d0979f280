//! modification-replay: runs scripted work items through the scheduler.
//!
//! Reads a JSON fixture of work items whose payloads are scripts (see
//! `shopfloor_analysis::scripted`), seeds an in-memory store with them, and
//! runs one processor per partition pass by pass until every pass completes
//! with nothing left open, or the pass limit is reached. Prints the final
//! items as JSON on stdout.
//!
//! Fixture entries are work items with an optional `age_secs` that backdates
//! their creation, placing them in the past phase:
//!
//! ```json
//! [
//!   { "partition": "global", "kind": "scripted", "priority": 1,
//!     "payload": { "steps": ["stale", "ok"] } },
//!   { "partition": { "resource": 4 }, "kind": "scripted", "priority": 2,
//!     "age_secs": 3600 }
//! ]
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};

use shopfloor_analysis::{
    ExitSignal, GlobalPartition, HandlerRegistry, PartitionOps, PauseCoordinator,
    PendingQueueProcessor, ResourcePartition, ScriptedHandler,
};
use shopfloor_core::config::load_dotenv;
use shopfloor_core::{NewWorkItem, Partition, SchedulerConfig};
use shopfloor_storage::{MemoryStore, Store};

// ── CLI ─────────────────────────────────────────────────────────────

/// Replay scripted work items through the modification scheduler.
#[derive(Parser, Debug)]
#[command(name = "modification-replay", version, about)]
struct Cli {
    /// Path to a scheduler TOML config. Defaults plus `SHOPFLOOR_*` overrides when absent.
    #[arg(long, env = "SHOPFLOOR_CONFIG")]
    config: Option<PathBuf>,

    /// JSON fixture of work items to replay.
    #[arg(long)]
    fixture: PathBuf,

    /// Maximum number of passes over all partitions.
    #[arg(long, env = "SHOPFLOOR_REPLAY_PASSES", default_value_t = 10)]
    passes: u32,

    /// Lower bound on status priority for both scan phases.
    #[arg(long, default_value_t = 0)]
    min_priority: i32,
}

#[derive(Debug, Deserialize)]
struct FixtureItem {
    #[serde(flatten)]
    item: NewWorkItem,
    #[serde(default)]
    age_secs: u64,
}

// ── Replay ──────────────────────────────────────────────────────────

fn processor<P: PartitionOps>(
    ops: P,
    store: &Arc<MemoryStore>,
    registry: &Arc<HandlerRegistry>,
    config: &Arc<SchedulerConfig>,
    pause: &Arc<PauseCoordinator>,
    exit: &ExitSignal,
) -> PendingQueueProcessor<P> {
    let store: Arc<dyn Store> = store.clone();
    PendingQueueProcessor::builder(ops, store, Arc::clone(registry), Arc::clone(config))
        .pause(Arc::clone(pause))
        .exit_signal(exit.clone())
        .build()
}

/// Run one pass of `processor`. Returns whether it completed.
fn pass<P: PartitionOps>(
    processor: &mut PendingQueueProcessor<P>,
    min_priority: i32,
) -> anyhow::Result<bool> {
    let deadline = Instant::now() + processor.config().run_budget();
    match processor.run_once(deadline, min_priority, min_priority) {
        Ok(completed) => Ok(completed),
        Err(e) if e.is_fatal() => {
            error!(partition = %processor.partition(), error = %e, "fatal scheduler error");
            Err(e).context("replay aborted")
        }
        Err(e) => {
            warn!(partition = %processor.partition(), error = %e, "pass failed");
            Ok(false)
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SchedulerConfig::from_env().context("loading config from environment")?,
    };
    config.log_summary();
    let config = Arc::new(config);

    let raw = std::fs::read_to_string(&cli.fixture)
        .with_context(|| format!("reading fixture {}", cli.fixture.display()))?;
    let fixture: Vec<FixtureItem> = serde_json::from_str(&raw).context("parsing fixture")?;

    let store = Arc::new(MemoryStore::new());
    let mut resources = BTreeSet::new();
    let now = chrono::Utc::now();
    for entry in fixture {
        if let Partition::Resource(resource) = entry.item.partition {
            resources.insert(resource);
        }
        let created_at = now - chrono::Duration::seconds(entry.age_secs as i64);
        store.add_at(entry.item, created_at);
    }
    info!(items = store.items().len(), resources = resources.len(), "fixture loaded");

    let registry = Arc::new(HandlerRegistry::new().with(Arc::new(ScriptedHandler::default())));
    let pause = Arc::new(PauseCoordinator::from_config(&config));
    let exit = ExitSignal::new();

    let mut global = processor(
        GlobalPartition::new(&config),
        &store,
        &registry,
        &config,
        &pause,
        &exit,
    );
    let mut per_resource: Vec<_> = resources
        .iter()
        .map(|&resource| {
            processor(
                ResourcePartition::new(resource, &config),
                &store,
                &registry,
                &config,
                &pause,
                &exit,
            )
        })
        .collect();

    let mut settled = false;
    for n in 1..=cli.passes {
        let mut completed = pass(&mut global, cli.min_priority)?;
        for processor in &mut per_resource {
            completed &= pass(processor, cli.min_priority)?;
        }
        let open = store
            .items()
            .iter()
            .filter(|i| i.status.is_not_completed())
            .count();
        info!(pass = n, completed, open, "replay pass finished");
        if completed && open == 0 {
            settled = true;
            break;
        }
    }
    if !settled {
        warn!(passes = cli.passes, "pass limit reached with work left");
    }

    let metrics = global.metrics();
    info!(
        items_completed = metrics.items_completed,
        retries = metrics.retries,
        timeouts = metrics.timeouts,
        "global partition metrics"
    );

    let mut items = store.items();
    items.sort_by_key(|i| i.id);
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}
