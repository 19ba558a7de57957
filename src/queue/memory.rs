//! In-memory at-least-once queue
//!
//! Messages move `ready -> in_flight` on receive and leave `in_flight` when
//! the lease is settled. Abandoned leases go back to `ready` (after an
//! optional delay) until `max_deliveries` is reached, then to the dead
//! letter list.

use super::{Delivery, DeliverySink, QueueError, Settlement, WorkQueue};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, warn};

#[derive(Debug, Clone)]
struct Pending {
    body: String,
    delivery_count: u32,
}

/// A message that will not be redelivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub body: String,
    pub reason: String,
    pub delivery_count: u32,
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<u64, Pending>,
    /// Abandoned messages waiting out the redelivery delay
    delayed: usize,
    dead_letters: Vec<DeadLetter>,
    stats: QueueStats,
    next_lease: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    max_deliveries: u32,
    redelivery_delay: Duration,
}

impl Shared {
    fn push(&self, pending: Pending, position: Option<usize>) {
        {
            let mut state = self.state.lock();
            match position {
                Some(idx) if idx < state.ready.len() => state.ready.insert(idx, pending),
                _ => state.ready.push_back(pending),
            }
        }
        self.notify.notify_one();
    }

    fn requeue(self: &Arc<Self>, pending: Pending) {
        if self.redelivery_delay.is_zero() {
            self.push(pending, None);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.state.lock().delayed += 1;
                let shared = self.clone();
                let delay = self.redelivery_delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.state.lock().delayed -= 1;
                    shared.push(pending, None);
                });
            }
            Err(_) => self.push(pending, None),
        }
    }
}

/// Lease settlements route back to the shared state
struct SinkHandle(Arc<Shared>);

impl DeliverySink for SinkHandle {
    fn settle(&self, lease_id: u64, settlement: Settlement) {
        let shared = &self.0;
        let pending = match shared.state.lock().in_flight.remove(&lease_id) {
            Some(p) => p,
            None => {
                debug_assert!(false, "unknown lease {}", lease_id);
                return;
            }
        };

        match settlement {
            Settlement::Ack => shared.state.lock().stats.acked += 1,
            Settlement::Lost => {
                shared.state.lock().stats.redelivered += 1;
                shared.requeue(pending);
            }
            Settlement::Abandon if pending.delivery_count >= shared.max_deliveries => {
                error!(
                    body = %pending.body,
                    deliveries = pending.delivery_count,
                    "Message exceeded max deliveries, dead-lettering"
                );
                let mut state = shared.state.lock();
                state.stats.dead_lettered += 1;
                state.dead_letters.push(DeadLetter {
                    body: pending.body,
                    reason: "max deliveries exceeded".to_string(),
                    delivery_count: pending.delivery_count,
                });
            }
            Settlement::Abandon => {
                shared.state.lock().stats.redelivered += 1;
                shared.requeue(pending);
            }
            Settlement::DeadLetter(reason) => {
                warn!(body = %pending.body, %reason, "Message dead-lettered");
                let mut state = shared.state.lock();
                state.stats.dead_lettered += 1;
                state.dead_letters.push(DeadLetter {
                    body: pending.body,
                    reason,
                    delivery_count: pending.delivery_count,
                });
            }
        }
    }
}

/// In-memory work queue with leases, redelivery and dead letters
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    shared: Arc<Shared>,
}

impl InMemoryWorkQueue {
    pub fn new(max_deliveries: u32, redelivery_delay: Duration) -> Self {
        debug_assert!(max_deliveries >= 1);
        InMemoryWorkQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                max_deliveries: max_deliveries.max(1),
                redelivery_delay,
            }),
        }
    }

    /// Number of messages waiting to be received
    pub fn len(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing ready, leased or waiting for redelivery
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.ready.is_empty() && state.in_flight.is_empty() && state.delayed == 0
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state.lock().dead_letters.clone()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Enqueue at a position in the ready list (tail if out of range)
    pub(crate) fn enqueue_at(&self, body: String, position: Option<usize>) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.stats.enqueued += 1;
        }
        self.shared.push(
            Pending {
                body,
                delivery_count: 0,
            },
            position,
        );
        Ok(())
    }

    fn try_lease(&self) -> Option<Option<Delivery>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Some(None);
        }
        let mut pending = state.ready.pop_front()?;
        pending.delivery_count += 1;
        state.next_lease += 1;
        state.stats.delivered += 1;
        let lease_id = state.next_lease;
        let delivery = Delivery::new(
            lease_id,
            pending.body.clone(),
            pending.delivery_count,
            Arc::new(SinkHandle(self.shared.clone())),
        );
        state.in_flight.insert(lease_id, pending);
        Some(Some(delivery))
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(5, Duration::ZERO)
    }
}

impl std::fmt::Debug for InMemoryWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("InMemoryWorkQueue")
            .field("ready", &state.ready.len())
            .field("in_flight", &state.in_flight.len())
            .field("dead_letters", &state.dead_letters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn enqueue<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        Box::pin(async move { self.enqueue_at(body, None) })
    }

    fn receive<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                // Register interest before checking, so a push between the
                // check and the await is not missed.
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(result) = self.try_lease() {
                    return result;
                }
                notified.await;
            }
        })
    }

    fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = InMemoryWorkQueue::default();
        queue.enqueue("a".to_string()).await.unwrap();

        let d = queue.receive().await.unwrap();
        assert_eq!(d.body(), "a");
        assert_eq!(d.delivery_count(), 1);
        assert_eq!(queue.in_flight(), 1);

        d.ack();
        assert!(queue.is_idle());
        assert_eq!(queue.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_abandon_redelivers_with_count() {
        let queue = InMemoryWorkQueue::default();
        queue.enqueue("a".to_string()).await.unwrap();

        queue.receive().await.unwrap().abandon();
        let d = queue.receive().await.unwrap();
        assert_eq!(d.delivery_count(), 2);
        assert!(d.is_redelivery());
        d.ack();
    }

    #[tokio::test]
    async fn test_drop_abandons() {
        let queue = InMemoryWorkQueue::default();
        queue.enqueue("a".to_string()).await.unwrap();

        drop(queue.receive().await.unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_max_deliveries_dead_letters() {
        let queue = InMemoryWorkQueue::new(2, Duration::ZERO);
        queue.enqueue("poison".to_string()).await.unwrap();

        queue.receive().await.unwrap().abandon();
        queue.receive().await.unwrap().abandon();

        assert!(queue.is_idle());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "poison");
        assert_eq!(dead[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_lost_ack_redelivers_past_limit() {
        let queue = InMemoryWorkQueue::new(1, Duration::ZERO);
        queue.enqueue("a".to_string()).await.unwrap();

        let mut d = queue.receive().await.unwrap();
        d.lose_ack();
        d.ack();

        let d = queue.receive().await.unwrap();
        assert_eq!(d.delivery_count(), 2);
        d.ack();
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_dead_letter() {
        let queue = InMemoryWorkQueue::default();
        queue.enqueue("garbage".to_string()).await.unwrap();
        queue.receive().await.unwrap().dead_letter("undecodable");

        assert_eq!(queue.dead_letters()[0].reason, "undecodable");
    }

    #[tokio::test]
    async fn test_close_wakes_receivers() {
        let queue = InMemoryWorkQueue::default();
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.receive().await.is_none() });

        tokio::task::yield_now().await;
        queue.close();

        assert!(waiter.await.unwrap());
        assert!(matches!(
            queue.enqueue("late".to_string()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_receive_waits_for_enqueue() {
        let queue = InMemoryWorkQueue::default();
        let q = queue.clone();
        let consumer = tokio::spawn(async move {
            let d = q.receive().await.unwrap();
            let body = d.body().to_string();
            d.ack();
            body
        });

        tokio::task::yield_now().await;
        queue.enqueue("later".to_string()).await.unwrap();
        assert_eq!(consumer.await.unwrap(), "later");
    }

    #[tokio::test]
    async fn test_redelivery_delay() {
        let queue = InMemoryWorkQueue::new(5, Duration::from_millis(20));
        queue.enqueue("a".to_string()).await.unwrap();

        queue.receive().await.unwrap().abandon();
        assert!(queue.is_empty());
        assert!(!queue.is_idle());

        let d = queue.receive().await.unwrap();
        assert_eq!(d.delivery_count(), 2);
        d.ack();
    }
}
