//! In-memory queue fabric.
//!
//! Keeps the same push-chain semantics as the Redis fabric but delivers
//! synchronously through [`MemoryQueueConnection::drain`], which makes
//! end-to-end tests deterministic: messages are handed to consumers one
//! at a time, queues in name order, FIFO within a queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::errors::Result;
use crate::events::{Event, EventHandler};

use super::{Consumer, Delivery, Queue, QueueConnection};

#[derive(Default)]
struct FabricCounters {
    published: AtomicUsize,
    acked: AtomicUsize,
    dropped: AtomicUsize,
}

pub struct MemoryQueueConnection {
    queues: DashMap<String, Arc<MemoryQueue>>,
    events: Arc<dyn EventHandler>,
    counters: Arc<FabricCounters>,
    delivered: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryQueueConnection {
    pub fn new(events: Arc<dyn EventHandler>) -> Self {
        Self {
            queues: DashMap::new(),
            events,
            counters: Arc::new(FabricCounters::default()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Messages ever published across all queues (including re-publishes
    /// onto retry queues).
    pub fn published(&self) -> usize {
        self.counters.published.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.counters.dropped.load(Ordering::SeqCst)
    }

    /// Every delivery handed to a consumer so far, `(queue, payload)`.
    pub fn deliveries(&self) -> Vec<(String, Vec<u8>)> {
        self.delivered.lock().clone()
    }

    fn next_ready(&self) -> Option<(Arc<MemoryQueue>, Vec<u8>)> {
        let mut names: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        for name in names {
            let Some(queue) = self.queues.get(&name).map(|q| q.clone()) else {
                continue;
            };
            if queue.consumers.read().is_empty() {
                continue;
            }
            let popped = queue.ready.lock().pop_front();
            if let Some(payload) = popped {
                return Some((queue, payload));
            }
        }
        None
    }

    /// Delivers queued messages to their consumers until every queue is
    /// empty. Returns the number of deliveries made.
    pub async fn drain(&self) -> usize {
        let mut count = 0usize;
        while let Some((queue, payload)) = self.next_ready() {
            queue.unacked.lock().push(payload.clone());
            self.delivered.lock().push((queue.name.clone(), payload.clone()));
            let consumer = queue.next_consumer();
            let delivery = Box::new(MemoryDelivery {
                payload,
                queue: queue.clone(),
                events: self.events.clone(),
                counters: self.counters.clone(),
            });
            consumer.consume(delivery).await;
            count += 1;
            assert!(count < 100_000, "queue drain did not converge");
        }
        count
    }

    /// Delivers at most one message. Returns false when all queues are
    /// empty.
    pub async fn deliver_one(&self) -> bool {
        let Some((queue, payload)) = self.next_ready() else {
            return false;
        };
        queue.unacked.lock().push(payload.clone());
        self.delivered.lock().push((queue.name.clone(), payload.clone()));
        let consumer = queue.next_consumer();
        let delivery = Box::new(MemoryDelivery {
            payload,
            queue,
            events: self.events.clone(),
            counters: self.counters.clone(),
        });
        consumer.consume(delivery).await;
        true
    }
}

#[async_trait]
impl QueueConnection for MemoryQueueConnection {
    async fn open_queue(&self, name: &str) -> Result<Arc<dyn Queue>> {
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryQueue {
                    name: name.to_string(),
                    ready: Mutex::new(VecDeque::new()),
                    unacked: Mutex::new(Vec::new()),
                    push_queue: RwLock::new(None),
                    consumers: RwLock::new(Vec::new()),
                    round_robin: AtomicUsize::new(0),
                    counters: self.counters.clone(),
                })
            })
            .clone();
        Ok(queue as Arc<dyn Queue>)
    }

    async fn stop_all_consuming(&self) {
        for queue in self.queues.iter() {
            queue.value().consumers.write().clear();
        }
    }
}

pub struct MemoryQueue {
    name: String,
    ready: Mutex<VecDeque<Vec<u8>>>,
    unacked: Mutex<Vec<Vec<u8>>>,
    push_queue: RwLock<Option<Arc<dyn Queue>>>,
    consumers: RwLock<Vec<Arc<dyn Consumer>>>,
    round_robin: AtomicUsize,
    counters: Arc<FabricCounters>,
}

impl MemoryQueue {
    fn next_consumer(&self) -> Arc<dyn Consumer> {
        let consumers = self.consumers.read();
        let index = self.round_robin.fetch_add(1, Ordering::SeqCst) % consumers.len();
        consumers[index].clone()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().len()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.counters.published.fetch_add(1, Ordering::SeqCst);
        self.ready.lock().push_back(payload);
        Ok(())
    }

    fn set_push_queue(&self, next: Arc<dyn Queue>) {
        *self.push_queue.write() = Some(next);
    }

    async fn start_consuming(&self, _prefetch: usize, _poll_interval: std::time::Duration) -> Result<()> {
        Ok(())
    }

    async fn add_consumer(&self, _tag: &str, consumer: Arc<dyn Consumer>) -> Result<()> {
        self.consumers.write().push(consumer);
        Ok(())
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    queue: Arc<MemoryQueue>,
    events: Arc<dyn EventHandler>,
    counters: Arc<FabricCounters>,
}

impl MemoryDelivery {
    fn remove_unacked(&self) {
        let mut unacked = self.queue.unacked.lock();
        if let Some(pos) = unacked.iter().position(|m| *m == self.payload) {
            unacked.remove(pos);
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.remove_unacked();
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push(self: Box<Self>) -> Result<()> {
        self.remove_unacked();
        let next = self.queue.push_queue.read().clone();
        match next {
            Some(queue) => queue.publish(self.payload.clone()).await,
            None => {
                warn!(queue = %self.queue.name, "rejecting at chain tail, dropping message");
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                self.events.emit(Event::MessageDropped {
                    queue: self.queue.name.clone(),
                });
                Ok(())
            }
        }
    }
}
