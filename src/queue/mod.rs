//! Work queue collaborator
//!
//! At-least-once delivery of opaque string messages. A consumer receives a
//! [`Delivery`] lease and settles it exactly once: `ack` on success, `abandon`
//! to have it redelivered, or `dead_letter` for poison messages. A lease
//! dropped without settling is abandoned.

pub mod memory;
pub mod message;
pub mod simulated;

pub use memory::{DeadLetter, InMemoryWorkQueue, QueueStats};
pub use message::{InvalidMessage, WorkMessage};
pub use simulated::{SimulatedQueueConfig, SimulatedQueueStats, SimulatedWorkQueue};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Queue errors
#[derive(Debug)]
pub enum QueueError {
    /// The queue no longer accepts messages
    Closed,
    Io(std::io::Error),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed => write!(f, "queue is closed"),
            QueueError::Io(e) => write!(f, "queue I/O error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::Io(e) => Some(e),
            QueueError::Closed => None,
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Io(e)
    }
}

/// How a consumer finished with a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Return for redelivery; counts towards the delivery limit
    Abandon,
    DeadLetter(String),
    /// The consumer's settlement never reached the queue; the lease expires
    /// and the message is redelivered without counting against the limit
    Lost,
}

/// Receiver of settlements for leased messages
pub trait DeliverySink: Send + Sync + 'static {
    fn settle(&self, lease_id: u64, settlement: Settlement);
}

/// A leased message
pub struct Delivery {
    lease_id: u64,
    body: String,
    delivery_count: u32,
    sink: Arc<dyn DeliverySink>,
    lose_ack: bool,
    settled: bool,
}

impl Delivery {
    pub fn new(lease_id: u64, body: String, delivery_count: u32, sink: Arc<dyn DeliverySink>) -> Self {
        Delivery {
            lease_id,
            body,
            delivery_count,
            sink,
            lose_ack: false,
            settled: false,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// 1 on first delivery
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Make the eventual `ack` go missing (fault injection)
    pub(crate) fn lose_ack(&mut self) {
        self.lose_ack = true;
    }

    pub fn ack(mut self) {
        let settlement = if self.lose_ack {
            Settlement::Lost
        } else {
            Settlement::Ack
        };
        self.settle(settlement);
    }

    pub fn abandon(mut self) {
        self.settle(Settlement::Abandon);
    }

    pub fn dead_letter(mut self, reason: impl Into<String>) {
        self.settle(Settlement::DeadLetter(reason.into()));
    }

    fn settle(&mut self, settlement: Settlement) {
        debug_assert!(!self.settled, "delivery settled twice");
        self.settled = true;
        self.sink.settle(self.lease_id, settlement);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Settlement::Abandon);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("lease_id", &self.lease_id)
            .field("body", &self.body)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// At-least-once work queue
pub trait WorkQueue: Send + Sync + 'static {
    fn enqueue<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;

    /// Wait for the next message. `None` once the queue is closed.
    fn receive<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + 'a>>;

    /// Stop handing out messages and wake all waiting receivers
    fn close(&self);
}

impl<T: WorkQueue + ?Sized> WorkQueue for Arc<T> {
    fn enqueue<'a>(
        &'a self,
        body: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        (**self).enqueue(body)
    }

    fn receive<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + 'a>> {
        (**self).receive()
    }

    fn close(&self) {
        (**self).close()
    }
}
