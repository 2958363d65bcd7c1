//! Engine runtime: flow registry, queue wiring, worker mode, and the
//! registry heartbeat.
//!
//! A runtime can publish control tasks for any registered flow. In
//! worker mode it additionally opens the per-flow queue fabric and
//! consumes tasks; leaving worker mode tears the consumers down behind
//! a single barrier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::controller;
use crate::errors::{EngineError, Result};
use crate::events::{EventHandler, TracingEventHandler};
use crate::executor::{FlowExecutor, PartialPublisher};
use crate::flow::FlowDefinition;
use crate::model::{
    internal_request_queue_id, Request, RequestType, Task, Worker, RDB_KEY_TIMEOUT,
    REGISTER_INTERVAL,
};
use crate::queue::{
    open_push_chain, Consumer, Delivery, Queue, QueueConnection, RedisQueueConnection,
    MemoryQueueConnection, POLL_INTERVAL, PREFETCH_LIMIT,
};
use crate::registry::{announce, MemoryRegistry, RedisRegistry, WorkerRegistry};
use crate::store::{
    DataStore, MemoryBackend, MemoryDataStore, MemoryStateStore, RedisDataStore, RedisStateStore,
    StateStore,
};

pub struct FlowRuntime {
    config: EngineConfig,
    flows: DashMap<String, Arc<FlowDefinition>>,
    state_store: Arc<dyn StateStore>,
    data_store: Arc<dyn DataStore>,
    registry: Arc<dyn WorkerRegistry>,
    connection: Arc<dyn QueueConnection>,
    events: Arc<dyn EventHandler>,
    task_queues: DashMap<String, Arc<dyn Queue>>,
    worker_mode: AtomicBool,
    worker_id: String,
    shutdown: CancellationToken,
    self_ref: Weak<FlowRuntime>,
}

impl FlowRuntime {
    /// Connects every backend to the configured Redis endpoint.
    pub async fn init(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let events: Arc<dyn EventHandler> = Arc::new(TracingEventHandler);
        let conn = config.redis.connection().await?;
        let state_store: Arc<dyn StateStore> =
            Arc::new(RedisStateStore::with_connection(conn.clone()));
        let data_store: Arc<dyn DataStore> = Arc::new(RedisDataStore::with_connection(conn.clone()));
        let registry: Arc<dyn WorkerRegistry> = Arc::new(RedisRegistry::new(conn.clone()));
        let connection: Arc<dyn QueueConnection> =
            Arc::new(RedisQueueConnection::new(conn, events.clone()));
        Ok(Self::assemble(config, state_store, data_store, registry, connection, events))
    }

    /// Fully in-memory runtime for tests and embedded single-process
    /// use.
    pub fn in_memory(config: EngineConfig, events: Arc<dyn EventHandler>) -> Result<(Arc<Self>, Arc<MemoryQueueConnection>, MemoryBackend)> {
        config.validate()?;
        let backend = MemoryBackend::new();
        let state_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new(backend.clone()));
        let data_store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new(backend.clone()));
        let registry: Arc<dyn WorkerRegistry> = Arc::new(MemoryRegistry::new());
        let connection = Arc::new(MemoryQueueConnection::new(events.clone()));
        let runtime = Self::assemble(
            config,
            state_store,
            data_store,
            registry,
            connection.clone(),
            events,
        );
        Ok((runtime, connection, backend))
    }

    /// Wires a runtime from explicit backends.
    pub fn assemble(
        config: EngineConfig,
        state_store: Arc<dyn StateStore>,
        data_store: Arc<dyn DataStore>,
        registry: Arc<dyn WorkerRegistry>,
        connection: Arc<dyn QueueConnection>,
        events: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            flows: DashMap::new(),
            state_store,
            data_store,
            registry,
            connection,
            events,
            task_queues: DashMap::new(),
            worker_mode: AtomicBool::new(false),
            worker_id: uuid::Uuid::new_v4().to_string(),
            shutdown: CancellationToken::new(),
            self_ref: weak.clone(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> Arc<dyn EventHandler> {
        self.events.clone()
    }

    /// Registers a flow. Fails on a duplicate name. When already in
    /// worker mode, the flow's queues are opened immediately.
    pub async fn register(&self, flow: FlowDefinition) -> Result<()> {
        let name = flow.name().to_string();
        if self.flows.contains_key(&name) {
            return Err(EngineError::Configuration(format!(
                "flow {name} already registered"
            )));
        }
        self.flows.insert(name.clone(), Arc::new(flow));
        if self.worker_mode.load(Ordering::SeqCst) {
            self.init_task_queues_for(&name).await?;
        }
        info!(flow = %name, "flow registered");
        Ok(())
    }

    pub fn registered_flows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }

    /// Starts consuming tasks for every registered flow.
    pub async fn enter_worker_mode(&self) -> Result<()> {
        if self.worker_mode.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let names = self.registered_flows();
        for name in &names {
            self.init_task_queues_for(name).await?;
        }
        info!(flows = ?names, "queue workers started");
        Ok(())
    }

    /// Stops consuming, waiting for in-flight consumer calls to finish.
    pub async fn exit_worker_mode(&self) -> Result<()> {
        if !self.worker_mode.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.connection.stop_all_consuming().await;
        self.task_queues.clear();
        self.registry
            .delete(&crate::model::worker_key(&self.worker_id))
            .await?;
        info!("worker mode exited");
        Ok(())
    }

    async fn init_task_queues_for(&self, flow_name: &str) -> Result<()> {
        let queues = open_push_chain(
            self.connection.as_ref(),
            flow_name,
            self.config.retry_queue_count,
        )
        .await?;

        queues.primary.start_consuming(PREFETCH_LIMIT, POLL_INTERVAL).await?;
        for retry in &queues.retries {
            retry.start_consuming(PREFETCH_LIMIT, POLL_INTERVAL).await?;
        }

        let consumer: Arc<dyn Consumer> = Arc::new(RuntimeConsumer {
            runtime: self.self_ref.clone(),
        });
        for index in 0..self.config.worker_concurrency {
            queues
                .primary
                .add_consumer(&format!("request-consumer-{index}"), consumer.clone())
                .await?;
        }
        for (index, retry) in queues.retries.iter().enumerate() {
            retry
                .add_consumer(&format!("retry-consumer-{index}"), consumer.clone())
                .await?;
        }

        self.task_queues.insert(flow_name.to_string(), queues.primary);
        Ok(())
    }

    async fn queue_for(&self, flow_name: &str) -> Result<Arc<dyn Queue>> {
        if let Some(queue) = self.task_queues.get(flow_name) {
            return Ok(queue.clone());
        }
        self.connection
            .open_queue(&internal_request_queue_id(flow_name))
            .await
    }

    async fn publish_control(&self, request: &Request, request_type: RequestType) -> Result<()> {
        if !self.flows.contains_key(&request.flow_name) {
            return Err(EngineError::FlowNotFound(request.flow_name.clone()));
        }
        let queue = self.queue_for(&request.flow_name).await?;
        let payload = serde_json::to_vec(&Task::from_request(request, request_type))?;
        queue.publish(payload).await
    }

    /// Submits a new request for execution.
    pub async fn execute(&self, request: &Request) -> Result<()> {
        self.publish_control(request, RequestType::New).await
    }

    pub async fn pause(&self, request: &Request) -> Result<()> {
        self.publish_control(request, RequestType::Pause).await
    }

    pub async fn resume(&self, request: &Request) -> Result<()> {
        self.publish_control(request, RequestType::Resume).await
    }

    pub async fn stop(&self, request: &Request) -> Result<()> {
        self.publish_control(request, RequestType::Stop).await
    }

    /// Serialized progress of a request, straight from the state store.
    pub async fn flow_state(&self, flow_name: &str, request_id: &str) -> Result<String> {
        let request = Request::new(flow_name, request_id, bytes::Bytes::new());
        let executor = self.create_executor(&request).await?;
        controller::flow_state_handler(&request, &executor).await
    }

    /// Builds the per-request executor: scoped store handles bound to
    /// the request's namespaces plus the flow's partial publisher.
    pub async fn create_executor(&self, request: &Request) -> Result<FlowExecutor> {
        let flow = self
            .flows
            .get(&request.flow_name)
            .map(|f| f.clone())
            .ok_or_else(|| EngineError::FlowNotFound(request.flow_name.clone()))?;

        let mut state = self.state_store.copy_store();
        state.configure(&request.flow_name, &request.request_id);
        state.init().await?;
        let mut data = self.data_store.copy_store();
        data.configure(&request.flow_name, &request.request_id);
        data.init().await?;

        let publisher = Arc::new(QueuePublisher {
            queue: self.queue_for(&request.flow_name).await?,
        });

        Ok(FlowExecutor::new(
            flow,
            request.clone(),
            state,
            data,
            self.events.clone(),
            publisher,
        ))
    }

    async fn handle_request(&self, request: Request, request_type: RequestType) -> Result<()> {
        let executor = self.create_executor(&request).await?;
        match request_type {
            RequestType::New => controller::execute_flow_handler(&request, &executor).await,
            RequestType::Partial => {
                controller::partial_execute_flow_handler(&request, &executor).await
            }
            RequestType::Pause => controller::pause_flow_handler(&request, &executor).await,
            RequestType::Resume => controller::resume_flow_handler(&request, &executor).await,
            RequestType::Stop => controller::stop_flow_handler(&request, &executor).await,
        }
    }

    /// Runs the registry heartbeat until shutdown: re-announces this
    /// worker and its flow descriptors every interval, within the key
    /// TTL.
    pub async fn start_runtime(&self) -> Result<()> {
        self.register_details().await?;
        let mut ticker = tokio::time::interval(REGISTER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.register_details().await {
                        error!(error = %err, "failed to register worker details");
                    }
                }
            }
        }
        info!("runtime stopped");
        Ok(())
    }

    /// Signals the heartbeat loop to stop and tears down consumers.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.exit_worker_mode().await
    }

    async fn register_details(&self) -> Result<()> {
        let flows = self.registered_flows();
        let worker = Worker {
            id: self.worker_id.clone(),
            flows: flows.clone(),
            concurrency: self.config.worker_concurrency,
        };
        let mut descriptors = Vec::with_capacity(flows.len());
        for name in &flows {
            if let Some(flow) = self.flows.get(name) {
                descriptors.push((name.clone(), flow.export().to_json()?));
            }
        }
        announce(
            self.registry.as_ref(),
            &worker,
            self.worker_mode.load(Ordering::SeqCst),
            &descriptors,
            RDB_KEY_TIMEOUT,
        )
        .await
    }
}

/// Publishes PARTIAL tasks onto a flow's primary queue.
struct QueuePublisher {
    queue: Arc<dyn Queue>,
}

#[async_trait]
impl PartialPublisher for QueuePublisher {
    async fn enqueue_partial(&self, request: &Request) -> Result<()> {
        // Partials carry the request identity and headers; all progress
        // lives in the state store.
        let mut task = Task::from_request(request, RequestType::Partial);
        task.body = String::new();
        let payload = serde_json::to_vec(&task)?;
        self.queue.publish(payload).await
    }
}

/// The queue consumer: parse, dispatch, ack; push on failure so the
/// message migrates along the retry chain.
struct RuntimeConsumer {
    runtime: Weak<FlowRuntime>,
}

#[async_trait]
impl Consumer for RuntimeConsumer {
    async fn consume(&self, delivery: Box<dyn Delivery>) {
        let task: Task = match serde_json::from_slice(delivery.payload()) {
            Ok(task) => task,
            Err(err) => {
                warn!(error = %err, "rejecting task for parse failure");
                if let Err(push_err) = delivery.push().await {
                    warn!(error = %push_err, "failed to push message to retry queue");
                }
                return;
            }
        };
        let request_type = task.request_type;
        let request = task.into_request();
        let request_id = request.request_id.clone();

        let Some(runtime) = self.runtime.upgrade() else {
            warn!(request = %request_id, "runtime gone, message left unacked");
            return;
        };
        if let Err(err) = runtime.handle_request(request, request_type).await {
            warn!(request = %request_id, error = %err, category = err.category(), "rejecting task for failure");
            if let Err(push_err) = delivery.push().await {
                warn!(error = %push_err, "failed to push message to retry queue");
            }
            return;
        }
        if let Err(err) = delivery.ack().await {
            warn!(request = %request_id, error = %err, "failed to acknowledge message");
            return;
        }
        debug!(request = %request_id, kind = %request_type, "task acknowledged");
    }
}
