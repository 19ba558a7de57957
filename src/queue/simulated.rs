//! Simulated work queue with fault injection
//!
//! Wraps [`InMemoryWorkQueue`] and uses buggify to produce the delivery
//! anomalies an at-least-once queue is allowed to exhibit: failed enqueues,
//! duplicate deliveries, reordering, and lost acknowledgements.

use super::{Delivery, InMemoryWorkQueue, QueueError, WorkQueue};
use crate::buggify::faults::queue as faults;
use crate::io::Rng;
use parking_lot::Mutex;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SimulatedQueueConfig {
    pub enqueue_fail_prob: f64,
    pub duplicate_delivery_prob: f64,
    pub reorder_prob: f64,
    pub ack_lost_prob: f64,
}

impl Default for SimulatedQueueConfig {
    fn default() -> Self {
        SimulatedQueueConfig {
            enqueue_fail_prob: 0.01,
            duplicate_delivery_prob: 0.02,
            reorder_prob: 0.1,
            ack_lost_prob: 0.01,
        }
    }
}

impl SimulatedQueueConfig {
    pub fn high_chaos() -> Self {
        SimulatedQueueConfig {
            enqueue_fail_prob: 0.05,
            duplicate_delivery_prob: 0.1,
            reorder_prob: 0.5,
            ack_lost_prob: 0.05,
        }
    }

    pub fn no_faults() -> Self {
        SimulatedQueueConfig {
            enqueue_fail_prob: 0.0,
            duplicate_delivery_prob: 0.0,
            reorder_prob: 0.0,
            ack_lost_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedQueueStats {
    pub enqueue_attempts: u64,
    pub enqueue_failures: u64,
    pub duplicates: u64,
    pub reorders: u64,
    pub acks_lost: u64,
}

struct SimulatedQueueInner<R: Rng> {
    rng: R,
    stats: SimulatedQueueStats,
}

/// Fault-injecting queue wrapper
pub struct SimulatedWorkQueue<R: Rng> {
    inner_queue: InMemoryWorkQueue,
    config: SimulatedQueueConfig,
    state: Arc<Mutex<SimulatedQueueInner<R>>>,
}

impl<R: Rng> SimulatedWorkQueue<R> {
    pub fn new(inner_queue: InMemoryWorkQueue, rng: R, config: SimulatedQueueConfig) -> Self {
        SimulatedWorkQueue {
            inner_queue,
            config,
            state: Arc::new(Mutex::new(SimulatedQueueInner {
                rng,
                stats: SimulatedQueueStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedQueueStats {
        self.state.lock().stats.clone()
    }

    pub fn inner(&self) -> &InMemoryWorkQueue {
        &self.inner_queue
    }

    fn roll(&self, fault_id: &str, prob: f64) -> bool {
        let mut s = self.state.lock();
        crate::buggify!(&mut s.rng, fault_id, prob)
    }

    /// Position in the ready list for a new message
    fn placement(&self) -> Option<usize> {
        if !self.roll(faults::REORDER, self.config.reorder_prob) {
            return None;
        }
        let len = self.inner_queue.len() as u64;
        let mut s = self.state.lock();
        s.stats.reorders += 1;
        Some(s.rng.gen_range(0, len + 1) as usize)
    }
}

impl<R: Rng> WorkQueue for SimulatedWorkQueue<R> {
    fn enqueue<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().stats.enqueue_attempts += 1;

            if self.roll(faults::ENQUEUE_FAIL, self.config.enqueue_fail_prob) {
                self.state.lock().stats.enqueue_failures += 1;
                return Err(QueueError::Io(IoError::new(
                    ErrorKind::Other,
                    "simulated enqueue failure",
                )));
            }

            if self.roll(faults::DUPLICATE_DELIVERY, self.config.duplicate_delivery_prob) {
                self.state.lock().stats.duplicates += 1;
                self.inner_queue.enqueue_at(body.clone(), self.placement())?;
            }
            self.inner_queue.enqueue_at(body, self.placement())
        })
    }

    fn receive<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + 'a>> {
        Box::pin(async move {
            let mut delivery = self.inner_queue.receive().await?;
            if self.roll(faults::ACK_LOST, self.config.ack_lost_prob) {
                self.state.lock().stats.acks_lost += 1;
                delivery.lose_ack();
            }
            Some(delivery)
        })
    }

    fn close(&self) {
        self.inner_queue.close()
    }
}
