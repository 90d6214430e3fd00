//! Simulated store with fault injection
//!
//! Wraps another store and fails batches on a seeded schedule, or unconditionally while
//! an outage is switched on. Used to exercise the cache's fail-open paths
//! deterministically.

use super::{Batch, BatchReplies, KeyValueStore};
use crate::error::StoreError;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability that a read-only batch fails
    pub read_fail_prob: f64,
    /// Probability that a batch containing a write fails
    pub write_fail_prob: f64,
    /// Probability that any batch times out
    pub timeout_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            read_fail_prob: 0.01,           // 1%
            write_fail_prob: 0.01,          // 1%
            timeout_prob: 0.005,            // 0.5%
            latency_range_us: (0, 0),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            read_fail_prob: 0.2,
            write_fail_prob: 0.2,
            timeout_prob: 0.05,
            latency_range_us: (0, 0),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            read_fail_prob: 0.0,
            write_fail_prob: 0.0,
            timeout_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub batches: u64,
    pub commands: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub outage_rejections: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
}

enum Fault {
    Outage,
    Fail,
    Timeout,
}

/// Store wrapper that injects faults. Clones share state and the outage switch.
#[derive(Clone)]
pub struct SimulatedStore<S> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
    outage: Arc<AtomicBool>,
}

impl<S: KeyValueStore> SimulatedStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
            })),
            outage: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While on, every batch fails with `StoreError::Unavailable`
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Roll the dice for one batch; returns the fault to inject and the latency to apply.
    fn roll(&self, batch: &Batch) -> (Option<Fault>, Duration) {
        let mut state = self.state.lock();
        state.stats.batches += 1;
        state.stats.commands += batch.len() as u64;

        if self.is_down() {
            state.stats.outage_rejections += 1;
            return (Some(Fault::Outage), Duration::ZERO);
        }

        let (min, max) = self.config.latency_range_us;
        let latency = if max > min {
            Duration::from_micros(state.rng.gen_range(min..=max))
        } else {
            Duration::from_micros(min)
        };

        if state.rng.gen_bool(self.config.timeout_prob.clamp(0.0, 1.0)) {
            state.stats.timeouts += 1;
            return (Some(Fault::Timeout), latency);
        }

        let fail_prob = if batch.commands().iter().all(|c| c.is_read_only()) {
            self.config.read_fail_prob
        } else {
            self.config.write_fail_prob
        };
        if state.rng.gen_bool(fail_prob.clamp(0.0, 1.0)) {
            state.stats.failures += 1;
            return (Some(Fault::Fail), latency);
        }

        (None, latency)
    }
}

impl<S: KeyValueStore> KeyValueStore for SimulatedStore<S> {
    fn execute(&self, batch: Batch) -> BoxFuture<'_, Result<BatchReplies, StoreError>> {
        let (fault, latency) = self.roll(&batch);

        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match fault {
                Some(Fault::Outage) => Err(StoreError::Unavailable("simulated outage".to_string())),
                Some(Fault::Fail) => Err(StoreError::Unavailable(
                    "simulated connection reset".to_string(),
                )),
                Some(Fault::Timeout) => Err(StoreError::Timeout),
                None => self.inner_store.execute(batch).await,
            }
        }
        .boxed()
    }
}
