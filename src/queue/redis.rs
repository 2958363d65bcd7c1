//! Redis list-backed queue fabric.
//!
//! `publish` is an `LPUSH` onto the ready list. Each queue runs one
//! prefetcher that `LMOVE`s batches from the ready list into an unacked
//! list and fans the payloads out to consumer tasks over a channel.
//! `ack`/`push` remove the message from the unacked list; a crashed
//! worker leaves its messages in the unacked list for external
//! reclamation.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::events::{Event, EventHandler};

use super::{Consumer, Delivery, Queue, QueueConnection};

pub struct RedisQueueConnection {
    conn: ConnectionManager,
    events: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    queues: DashMap<String, Arc<RedisQueue>>,
}

impl RedisQueueConnection {
    pub fn new(conn: ConnectionManager, events: Arc<dyn EventHandler>) -> Self {
        Self {
            conn,
            events,
            cancel: CancellationToken::new(),
            handles: tokio::sync::Mutex::new(Vec::new()),
            queues: DashMap::new(),
        }
    }

    async fn spawn(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }
}

#[async_trait]
impl QueueConnection for RedisQueueConnection {
    async fn open_queue(&self, name: &str) -> Result<Arc<dyn Queue>> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(queue.clone() as Arc<dyn Queue>);
        }
        let queue = Arc::new(RedisQueue::new(
            name.to_string(),
            self.conn.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        ));
        self.queues.insert(name.to_string(), queue.clone());
        Ok(queue as Arc<dyn Queue>)
    }

    async fn stop_all_consuming(&self) {
        self.cancel.cancel();
        self.collect_handles().await;
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "queue task aborted during shutdown");
            }
        }
        for queue in self.queues.iter() {
            queue.value().reset_channels();
        }
    }
}

struct RedisQueue {
    name: String,
    ready_key: String,
    unacked_key: String,
    conn: ConnectionManager,
    events: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    push_queue: RwLock<Option<Arc<dyn Queue>>>,
    sender: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    receiver: RwLock<Option<Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>>>,
    pending_handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RedisQueue {
    fn new(
        name: String,
        conn: ConnectionManager,
        events: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let ready_key = name.clone();
        let unacked_key = format!("{name}:unacked");
        Self {
            name,
            ready_key,
            unacked_key,
            conn,
            events,
            cancel,
            push_queue: RwLock::new(None),
            sender: RwLock::new(None),
            receiver: RwLock::new(None),
            pending_handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn reset_channels(&self) {
        *self.sender.write() = None;
        *self.receiver.write() = None;
    }

    /// Handles spawned since the last collection, to be owned by the
    /// connection's shutdown barrier.
    fn take_handles(&self) -> Vec<JoinHandle<()>> {
        self.pending_handles.lock().drain(..).collect()
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.ready_key, payload.as_slice())
            .await
            .map_err(|err| EngineError::queue(&self.name, "publish", err.to_string()))
    }

    fn set_push_queue(&self, next: Arc<dyn Queue>) {
        *self.push_queue.write() = Some(next);
    }

    async fn start_consuming(&self, prefetch: usize, poll_interval: std::time::Duration) -> Result<()> {
        if self.sender.read().is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<Vec<u8>>(prefetch.max(1) * 2);
        *self.sender.write() = Some(tx.clone());
        *self.receiver.write() = Some(Arc::new(tokio::sync::Mutex::new(rx)));

        let ready = self.ready_key.clone();
        let unacked = self.unacked_key.clone();
        let mut conn = self.conn.clone();
        let cancel = self.cancel.clone();
        let queue_name = self.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let mut fetched = 0usize;
                for _ in 0..prefetch {
                    let moved: std::result::Result<Option<Vec<u8>>, redis::RedisError> =
                        redis::cmd("LMOVE")
                            .arg(&ready)
                            .arg(&unacked)
                            .arg("RIGHT")
                            .arg("LEFT")
                            .query_async(&mut conn)
                            .await;
                    match moved {
                        Ok(Some(payload)) => {
                            if tx.send(payload).await.is_err() {
                                return;
                            }
                            fetched += 1;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(queue = %queue_name, error = %err, "prefetch failed");
                            break;
                        }
                    }
                }
                if fetched == 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
            debug!(queue = %queue_name, "prefetcher stopped");
        });
        self.pending_handles.lock().push(handle);
        Ok(())
    }

    async fn add_consumer(&self, tag: &str, consumer: Arc<dyn Consumer>) -> Result<()> {
        let receiver = self
            .receiver
            .read()
            .clone()
            .ok_or(EngineError::NotInWorkerMode)?;
        let cancel = self.cancel.clone();
        let conn = self.conn.clone();
        let unacked_key = self.unacked_key.clone();
        let queue_name = self.name.clone();
        let events = self.events.clone();
        let push_queue = self.push_queue.read().clone();
        let tag = tag.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = async { receiver.lock().await.recv().await } => payload,
                };
                let Some(payload) = payload else { break };
                let delivery = Box::new(RedisDelivery {
                    payload,
                    unacked_key: unacked_key.clone(),
                    conn: conn.clone(),
                    push_target: push_queue.clone(),
                    queue_name: queue_name.clone(),
                    events: events.clone(),
                });
                consumer.consume(delivery).await;
            }
            debug!(queue = %queue_name, consumer = %tag, "consumer stopped");
        });
        self.pending_handles.lock().push(handle);
        Ok(())
    }
}

struct RedisDelivery {
    payload: Vec<u8>,
    unacked_key: String,
    conn: ConnectionManager,
    push_target: Option<Arc<dyn Queue>>,
    queue_name: String,
    events: Arc<dyn EventHandler>,
}

impl RedisDelivery {
    async fn remove_unacked(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(&self.unacked_key, 1, self.payload.as_slice())
            .await
            .map_err(|err| EngineError::queue(&self.queue_name, "ack", err.to_string()))
    }
}

#[async_trait]
impl Delivery for RedisDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.remove_unacked().await
    }

    async fn push(self: Box<Self>) -> Result<()> {
        self.remove_unacked().await?;
        match &self.push_target {
            Some(next) => next.publish(self.payload.clone()).await,
            None => {
                warn!(queue = %self.queue_name, "rejecting at chain tail, dropping message");
                self.events.emit(Event::MessageDropped {
                    queue: self.queue_name.clone(),
                });
                Ok(())
            }
        }
    }
}

impl RedisQueueConnection {
    /// Moves the handles the queues spawned into the connection's
    /// shutdown barrier. Called by the runtime after queue setup.
    pub async fn collect_handles(&self) {
        for queue in self.queues.iter() {
            for handle in queue.value().take_handles() {
                self.spawn(handle).await;
            }
        }
    }
}
