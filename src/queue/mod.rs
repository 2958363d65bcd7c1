//! Task queue fabric.
//!
//! Per flow the engine opens a primary queue and a chain of retry
//! queues. A consumer that cannot process a delivery calls
//! [`Delivery::push`], which moves the message one hop along the chain;
//! [`Delivery::ack`] removes it. A message rejected at the tail of the
//! chain is dropped and surfaced through the event sink. Delivery is
//! at-least-once with no FIFO guarantee, so consumers must be
//! idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{internal_request_queue_id, retry_queue_id};

mod memory;
mod redis;

pub use memory::{MemoryQueue, MemoryQueueConnection};
pub use redis::RedisQueueConnection;

/// Default prefetch batch per queue poll.
pub const PREFETCH_LIMIT: usize = 10;
/// Default poll interval of the per-queue prefetcher.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Factory and lifecycle barrier for queues on one broker connection.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Opens (or returns the already-open) queue with the given name.
    async fn open_queue(&self, name: &str) -> Result<Arc<dyn Queue>>;

    /// Stops every prefetcher and consumer, waiting for in-flight
    /// `consume` calls to finish.
    async fn stop_all_consuming(&self);
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> String;

    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Designates the next hop for rejected messages.
    fn set_push_queue(&self, next: Arc<dyn Queue>);

    /// Starts the prefetcher. Must be called before `add_consumer`.
    async fn start_consuming(&self, prefetch: usize, poll_interval: Duration) -> Result<()>;

    async fn add_consumer(&self, tag: &str, consumer: Arc<dyn Consumer>) -> Result<()>;
}

/// One message handed to a consumer. Exactly one of `ack` or `push`
/// must be called.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Removes the message from its queue.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Rejects the message: moves it to the next queue in the chain, or
    /// drops it (with a `MessageDropped` event) at the chain's tail.
    async fn push(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, delivery: Box<dyn Delivery>);
}

/// Primary queue plus its retry queues, already linked into a push
/// chain.
pub struct FlowQueues {
    pub primary: Arc<dyn Queue>,
    pub retries: Vec<Arc<dyn Queue>>,
}

/// Opens the primary and retry queues of a flow and links them:
/// primary -> push-0 -> ... -> push-{n-1}.
pub async fn open_push_chain(
    connection: &dyn QueueConnection,
    flow_name: &str,
    retry_queue_count: usize,
) -> Result<FlowQueues> {
    let primary = connection.open_queue(&internal_request_queue_id(flow_name)).await?;
    let mut retries = Vec::with_capacity(retry_queue_count);
    let mut prev: Arc<dyn Queue> = primary.clone();
    for hop in 0..retry_queue_count {
        let retry = connection.open_queue(&retry_queue_id(flow_name, hop)).await?;
        prev.set_push_queue(retry.clone());
        prev = retry.clone();
        retries.push(retry);
    }
    Ok(FlowQueues { primary, retries })
}
