//! Fan-out runner
//!
//! Starts a fan-out engine from the environment, submits one synthetic batch
//! of customer ids and waits for it to complete.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | FANOUT_CONFIG | - | TOML config file; replaces the engine variables below |
//! | FANOUT_BATCH_SIZE | 250 | Number of synthetic item ids |
//! | FANOUT_ITEM_DELAY_MS | 0 | Simulated work per item |
//! | FANOUT_WAIT_SECS | 60 | Completion timeout |
//! | FANOUT_SPLIT_THRESHOLD | 100 | Maximum items per leaf chunk |
//! | FANOUT_SPLIT_WORKERS | 2 | Split task consumers |
//! | FANOUT_ITEM_WORKERS | 8 | Item task consumers |
//! | FANOUT_MAX_DELIVERIES | 5 | Deliveries before dead-lettering |
//! | FANOUT_STORE_TYPE | memory | memory or localfs |
//! | FANOUT_DATA_PATH | - | LocalFs root directory |
//!
//! ## Logging
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | Filter directives |
//! | FANOUT_LOG_FORMAT | text | text or json |
//! | FANOUT_LOG_TARGET | true | Include the module target |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use batch_fanout::fanout::{
    BatchStatus, DelayHandler, EngineComponents, FanoutConfig, FanoutEngine,
};
use batch_fanout::io::production::ProductionRng;
use batch_fanout::io::Rng;
use batch_fanout::observability::{init_tracing, InitError, TracingConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const DEFAULT_BATCH_SIZE: usize = 250;
const DEFAULT_WAIT_SECS: u64 = 60;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, InitError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has invalid value {:?}", name, raw).into()),
        Err(_) => Ok(default),
    }
}

/// Unique ids with a random suffix so repeated runs do not look alike
fn synthetic_customers(count: usize) -> Vec<String> {
    let mut rng = ProductionRng::new();
    (0..count)
        .map(|i| format!("cust-{:06}-{:08x}", i, rng.next_u64() as u32))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), InitError> {
    init_tracing(&TracingConfig::from_env())?;

    let batch_size = env_or("FANOUT_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
    let item_delay = Duration::from_millis(env_or("FANOUT_ITEM_DELAY_MS", 0u64)?);
    let wait = Duration::from_secs(env_or("FANOUT_WAIT_SECS", DEFAULT_WAIT_SECS)?);

    let config = match std::env::var("FANOUT_CONFIG") {
        Ok(path) => {
            info!(%path, "Loading configuration file");
            FanoutConfig::from_toml_str(&std::fs::read_to_string(&path)?)?
        }
        Err(_) => FanoutConfig::from_env()?,
    };
    let components = EngineComponents::from_config(&config)?;
    let engine = FanoutEngine::start(config, components, Arc::new(DelayHandler::new(item_delay)))?;

    let started = Instant::now();
    let batch_id = engine.start_batch(synthetic_customers(batch_size)).await?;
    info!(%batch_id, batch_size, "Batch submitted");

    let status = engine.wait_for_completion(&batch_id, wait).await?;
    let state = engine.snapshot(&batch_id).await?;
    match status {
        BatchStatus::Completed => info!(
            %batch_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chunks = state.settled_chunks.len(),
            items = state.processed_item_count,
            "Batch completed"
        ),
        other => warn!(
            %batch_id,
            status = ?other,
            files_remaining = state.files_remaining,
            processed = state.processed_item_count,
            expected = state.expected_item_count,
            "Batch did not complete before timeout"
        ),
    }

    let stats = engine.shutdown().await;
    println!(
        "batch={} status={:?} chunks_split={} chunks_fanned_out={} items_processed={} items_duplicate={} retried={} dead_lettered={}",
        batch_id,
        status,
        stats.chunks_split,
        stats.chunks_fanned_out,
        stats.items_processed,
        stats.items_duplicate,
        stats.retried,
        stats.dead_lettered,
    );

    if status != BatchStatus::Completed {
        error!(%batch_id, "Exiting with failure");
        std::process::exit(1);
    }
    Ok(())
}
