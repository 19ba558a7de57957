//! BUGGIFY - Seeded Fault Injection
//!
//! The simulated collaborators (chunk store, record store, work queue) and
//! the DST item handler ask `buggify!` before every operation whether to
//! misbehave. Decisions are drawn from a caller-supplied
//! [`Rng`](crate::io::Rng), so a seeded run injects the same faults in the
//! same places.
//!
//! ```ignore
//! use batch_fanout::buggify::faults;
//!
//! // Probability from the thread's FaultConfig
//! if buggify!(&mut rng, faults::queue::DUPLICATE_DELIVERY) { ... }
//!
//! // Probability chosen by the call site
//! if buggify!(&mut rng, faults::chunk_store::PUT_FAIL, 0.05) { ... }
//! ```
//!
//! The fault configuration and counters are thread-local. Tokio's
//! `current_thread` test runtime keeps a whole DST run on one thread.

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use crate::io::Rng;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Checks and triggers of one fault site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounter {
    pub checks: u64,
    pub triggers: u64,
}

impl FaultCounter {
    pub fn rate(&self) -> f64 {
        if self.checks == 0 {
            0.0
        } else {
            self.triggers as f64 / self.checks as f64
        }
    }
}

/// Per-fault counters for the current thread
#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    pub faults: BTreeMap<String, FaultCounter>,
}

impl FaultStats {
    pub fn counter(&self, fault_id: &str) -> FaultCounter {
        self.faults.get(fault_id).copied().unwrap_or_default()
    }

    pub fn total_triggers(&self) -> u64 {
        self.faults.values().map(|c| c.triggers).sum()
    }

    pub fn summary(&self) -> String {
        let mut out = String::from("Injected faults:");
        for (fault_id, c) in &self.faults {
            out.push_str(&format!(
                "\n  {:<32} {:>6}/{:<6} ({:.2}%)",
                fault_id,
                c.triggers,
                c.checks,
                c.rate() * 100.0
            ));
        }
        out
    }
}

#[derive(Debug, Default)]
struct Context {
    config: FaultConfig,
    stats: FaultStats,
    /// Active suppression guards
    suppress_depth: usize,
}

thread_local! {
    static CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

/// Replace the current thread's fault configuration
pub fn install(config: FaultConfig) {
    CONTEXT.with(|ctx| ctx.borrow_mut().config = config);
}

/// Snapshot of the current thread's counters
pub fn stats() -> FaultStats {
    CONTEXT.with(|ctx| ctx.borrow().stats.clone())
}

pub fn reset_stats() {
    CONTEXT.with(|ctx| ctx.borrow_mut().stats = FaultStats::default());
}

/// While alive, every `buggify!` on this thread returns false. Guards nest.
pub struct Suppressed {
    _private: (),
}

impl Suppressed {
    pub fn enter() -> Self {
        CONTEXT.with(|ctx| ctx.borrow_mut().suppress_depth += 1);
        Suppressed { _private: () }
    }
}

impl Drop for Suppressed {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            ctx.suppress_depth = ctx.suppress_depth.saturating_sub(1);
        });
    }
}

/// Roll for `fault_id`. `probability` overrides the configured one; either
/// way a disabled config or an active suppression guard wins.
pub fn decide<R: Rng>(rng: &mut R, fault_id: &str, probability: Option<f64>) -> bool {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let p = match probability {
            Some(_) if !ctx.config.enabled => 0.0,
            Some(p) => p.clamp(0.0, 1.0),
            None => ctx.config.get(fault_id),
        };
        let active = ctx.suppress_depth == 0 && p > 0.0;

        let counter = ctx.stats.faults.entry(fault_id.to_string()).or_default();
        counter.checks += 1;
        if !active {
            return false;
        }
        // Always consume a draw for an active site so the sequence of
        // decisions depends only on the seed and the call order.
        let hit = (rng.gen_range(0, 1_000_000) as f64) < p * 1_000_000.0;
        if hit {
            counter.triggers += 1;
        }
        hit
    })
}

/// Fault injection point
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr) => {
        $crate::buggify::decide($rng, $fault_id, None)
    };
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::decide($rng, $fault_id, Some($prob))
    };
}
