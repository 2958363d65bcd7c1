//! Per-request flow executor.
//!
//! Every queued task for a request is handled by a short-lived
//! `FlowExecutor` bound to the request's state and data stores. A
//! PARTIAL advances the request by exactly one node: the executor
//! re-derives the frontier from the state store, claims one ready node
//! through a `pending -> running` compare-and-set, runs it, persists
//! the output, and enqueues one follow-up PARTIAL per successor that
//! became ready. Duplicate deliveries lose the CAS and fall through to
//! the next candidate, so no deduplication is needed anywhere else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, Result};
use crate::events::{Event, EventHandler};
use crate::flow::{FlowDefinition, LoopSplitter, NodeContext, NodeKind};
use crate::model::{NodeState, Phase, Request, RequestProgress};
use crate::store::{DataStore, StateStore};

const PHASE_KEY: &str = "phase";
const INIT_KEY: &str = "init";
const RUNNING_COUNT_KEY: &str = "running-count";
const COMPLETED_COUNT_KEY: &str = "completed-count";
const LAST_ADVANCE_KEY: &str = "last-advance";
/// Original request body, stored so root nodes can read their input
/// from a PARTIAL that carries no payload.
const REQUEST_BODY_KEY: &str = "request-body";

fn node_state_key(id: &str) -> String {
    format!("state-{id}")
}

fn indeg_key(id: &str) -> String {
    format!("in-{id}-remaining")
}

fn loop_total_key(id: &str) -> String {
    format!("loop-{id}-total")
}

fn loop_remaining_key(id: &str) -> String {
    format!("loop-{id}-remaining")
}

fn dead_edge_key(from: &str, to: &str) -> String {
    format!("edge-{from}-{to}")
}

fn out_key(id: &str) -> String {
    format!("node-{id}-out")
}

fn iter_out_key(id: &str, index: usize) -> String {
    format!("node-{id}-out-{index}")
}

fn loop_item_key(loop_id: &str, index: usize) -> String {
    format!("loop-{loop_id}-item-{index}")
}

/// One schedulable unit: a DAG node, or one iteration of a loop body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeInstance {
    Node(String),
    Iteration {
        loop_id: String,
        body: String,
        index: usize,
    },
}

impl NodeInstance {
    fn node_id(&self) -> &str {
        match self {
            NodeInstance::Node(id) => id,
            NodeInstance::Iteration { body, .. } => body,
        }
    }

    fn iteration(&self) -> Option<usize> {
        match self {
            NodeInstance::Node(_) => None,
            NodeInstance::Iteration { index, .. } => Some(*index),
        }
    }

    fn state_key(&self) -> String {
        match self {
            NodeInstance::Node(id) => node_state_key(id),
            NodeInstance::Iteration { body, index, .. } => node_state_key(&format!("{body}#{index}")),
        }
    }

    fn out_key(&self) -> String {
        match self {
            NodeInstance::Node(id) => out_key(id),
            NodeInstance::Iteration { body, index, .. } => iter_out_key(body, *index),
        }
    }

    fn display(&self) -> String {
        match self {
            NodeInstance::Node(id) => id.clone(),
            NodeInstance::Iteration { body, index, .. } => format!("{body}#{index}"),
        }
    }
}

/// Publishes follow-up PARTIAL tasks for a request.
#[async_trait]
pub trait PartialPublisher: Send + Sync {
    async fn enqueue_partial(&self, request: &Request) -> Result<()>;
}

pub struct FlowExecutor {
    flow: Arc<FlowDefinition>,
    request: Request,
    state: Box<dyn StateStore>,
    data: Box<dyn DataStore>,
    events: Arc<dyn EventHandler>,
    partials: Arc<dyn PartialPublisher>,
}

impl FlowExecutor {
    /// Expects stores already configured to the request's namespaces
    /// and initialized.
    pub fn new(
        flow: Arc<FlowDefinition>,
        request: Request,
        state: Box<dyn StateStore>,
        data: Box<dyn DataStore>,
        events: Arc<dyn EventHandler>,
        partials: Arc<dyn PartialPublisher>,
    ) -> Self {
        Self {
            flow,
            request,
            state,
            data,
            events,
            partials,
        }
    }

    /// Handles a NEW task: seeds progress and enqueues the roots.
    /// Idempotent per request id.
    pub async fn execute(&self) -> Result<()> {
        if self.state.incr(INIT_KEY, 1).await? > 1 {
            debug!(request = %self.request.request_id, "duplicate NEW ignored");
            return Ok(());
        }

        self.state.set(PHASE_KEY, Phase::Running.as_str()).await?;
        self.events.emit(Event::RequestStarted {
            flow_name: self.request.flow_name.clone(),
            request_id: self.request.request_id.clone(),
        });

        if self.flow.node_count() == 0 {
            return self.try_finish().await;
        }

        self.data.set(REQUEST_BODY_KEY, self.request.body.clone()).await?;
        for id in self.flow.node_ids() {
            self.state.set(&node_state_key(id), NodeState::Pending.as_str()).await?;
            self.state
                .set(&indeg_key(id), &self.flow.indegree(id).to_string())
                .await?;
        }
        self.touch_last_advance().await?;

        for _root in self.flow.roots() {
            self.partials.enqueue_partial(&self.request).await?;
        }
        Ok(())
    }

    /// Handles a PARTIAL task: advances the request by one node.
    pub async fn partial_execute(&self) -> Result<()> {
        let phase = match self.phase().await {
            Ok(phase) => phase,
            Err(err) if err.is_not_found() => {
                debug!(request = %self.request.request_id, "partial for a request that is no longer live");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        match phase {
            Phase::Running => {}
            Phase::Paused | Phase::Stopped => {
                debug!(request = %self.request.request_id, %phase, "partial short-circuited");
                return Ok(());
            }
            Phase::Finished | Phase::Failed => return Ok(()),
        }

        if let Some(instance) = self.claim_next().await? {
            self.advance(instance).await?;
        }
        self.try_finish().await
    }

    /// Phase `running -> paused`. Already-running node executions are
    /// left to complete; their follow-up partials idle until resume.
    pub async fn pause(&self) -> Result<()> {
        match self
            .state
            .update(PHASE_KEY, Phase::Running.as_str(), Phase::Paused.as_str())
            .await
        {
            Ok(()) => {
                info!(request = %self.request.request_id, "request paused");
                Ok(())
            }
            Err(err) if err.is_mismatch() => Err(self.phase_conflict("pause").await),
            Err(err) => Err(err),
        }
    }

    /// Phase `paused -> running`, then republish one PARTIAL per node
    /// that is ready: the partials delivered while paused were acked
    /// without advancing and are gone.
    pub async fn resume(&self) -> Result<()> {
        match self
            .state
            .update(PHASE_KEY, Phase::Paused.as_str(), Phase::Running.as_str())
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_mismatch() => return Err(self.phase_conflict("resume").await),
            Err(err) => return Err(err),
        }
        info!(request = %self.request.request_id, "request resumed");

        let frontier = self.resolve_frontier().await?;
        if frontier.is_empty() {
            // Pause landed after the last advance; finalize directly.
            return self.try_finish().await;
        }
        for _ in &frontier {
            self.partials.enqueue_partial(&self.request).await?;
        }
        Ok(())
    }

    /// Soft cancel: no in-flight node is aborted. Stores are cleaned
    /// once no node is running.
    pub async fn stop(&self) -> Result<()> {
        let from_running = self
            .state
            .update(PHASE_KEY, Phase::Running.as_str(), Phase::Stopped.as_str())
            .await;
        match from_running {
            Ok(()) => {}
            Err(err) if err.is_mismatch() => {
                match self
                    .state
                    .update(PHASE_KEY, Phase::Paused.as_str(), Phase::Stopped.as_str())
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_mismatch() => return Err(self.phase_conflict("stop").await),
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
        info!(request = %self.request.request_id, "request stopped");

        if self.count_or_zero(RUNNING_COUNT_KEY).await? == 0 {
            self.cleanup_stores().await?;
        }
        Ok(())
    }

    /// Serialized progress of the request.
    pub async fn get_state(&self) -> Result<String> {
        let phase = self.phase().await?;
        let mut nodes = BTreeMap::new();
        for id in self.flow.node_ids() {
            nodes.insert(id.to_string(), self.node_state_of(id).await?);
        }
        let progress = RequestProgress {
            flow_name: self.request.flow_name.clone(),
            request_id: self.request.request_id.clone(),
            phase,
            nodes,
            completed: self.count_or_zero(COMPLETED_COUNT_KEY).await?,
            last_advance: self.state.get(LAST_ADVANCE_KEY).await.ok(),
        };
        Ok(serde_json::to_string(&progress)?)
    }

    /// JSON descriptor of the flow's topology.
    pub fn export(&self) -> Result<String> {
        self.flow.export().to_json()
    }

    async fn phase(&self) -> Result<Phase> {
        let value = self.state.get(PHASE_KEY).await?;
        value.parse().map_err(|_| EngineError::StoreCorrupt {
            key: PHASE_KEY.to_string(),
        })
    }

    /// Phase read tolerant of a concurrent stop having already cleaned
    /// the namespace.
    async fn observed_phase_or_stopped(&self) -> Result<Phase> {
        match self.phase().await {
            Ok(phase) => Ok(phase),
            Err(err) if err.is_not_found() => Ok(Phase::Stopped),
            Err(err) => Err(err),
        }
    }

    async fn phase_conflict(&self, operation: &'static str) -> EngineError {
        match self.phase().await {
            Ok(phase) => EngineError::PhaseConflict {
                request: self.request.request_id.clone(),
                phase,
                operation,
            },
            Err(err) => err,
        }
    }

    async fn node_state_of(&self, id: &str) -> Result<NodeState> {
        let key = node_state_key(id);
        let value = self.state.get(&key).await?;
        value.parse().map_err(|_| EngineError::StoreCorrupt { key })
    }

    async fn instance_state(&self, instance: &NodeInstance) -> Result<NodeState> {
        let key = instance.state_key();
        let value = self.state.get(&key).await?;
        value.parse().map_err(|_| EngineError::StoreCorrupt { key })
    }

    async fn count(&self, key: &str) -> Result<i64> {
        let value = self.state.get(key).await?;
        value.parse().map_err(|_| EngineError::StoreCorrupt { key: key.to_string() })
    }

    async fn count_or_zero(&self, key: &str) -> Result<i64> {
        match self.count(key).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_not_found() => Ok(0),
            Err(err) => Err(err),
        }
    }

    async fn edge_is_dead(&self, from: &str, to: &str) -> Result<bool> {
        match self.state.get(&dead_edge_key(from, to)).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn touch_last_advance(&self) -> Result<()> {
        self.state
            .set(LAST_ADVANCE_KEY, &chrono::Utc::now().to_rfc3339())
            .await
    }

    /// Nodes (and loop-body iterations) whose dependencies are
    /// satisfied and whose state is still pending, in deterministic
    /// order: lexicographic node id, then iteration index.
    async fn resolve_frontier(&self) -> Result<Vec<NodeInstance>> {
        let mut frontier = Vec::new();
        for id in self.flow.node_ids() {
            let state = self.node_state_of(id).await?;
            let spec = self.flow.node(id)?;

            if let NodeKind::Loop { body, .. } = &spec.kind {
                if state == NodeState::Completed
                    && self.count_or_zero(&loop_remaining_key(id)).await? > 0
                {
                    let total = self.count(&loop_total_key(id)).await?;
                    for index in 0..total as usize {
                        let instance = NodeInstance::Iteration {
                            loop_id: id.to_string(),
                            body: body.clone(),
                            index,
                        };
                        if self.instance_state(&instance).await? == NodeState::Pending {
                            frontier.push(instance);
                        }
                    }
                }
            }

            if state != NodeState::Pending {
                continue;
            }
            // Loop bodies run one iteration at a time, never whole.
            if self.flow.loop_owner(id).is_some() {
                continue;
            }
            if self.count(&indeg_key(id)).await? <= 0 {
                frontier.push(NodeInstance::Node(id.to_string()));
            }
        }
        Ok(frontier)
    }

    /// Claims one ready node through CAS. A loser re-resolves against
    /// the remaining candidates so a duplicate delivery cannot strand a
    /// second ready node.
    async fn claim_next(&self) -> Result<Option<NodeInstance>> {
        let frontier = self.resolve_frontier().await?;
        for instance in frontier {
            match self
                .state
                .update(
                    &instance.state_key(),
                    NodeState::Pending.as_str(),
                    NodeState::Running.as_str(),
                )
                .await
            {
                Ok(()) => {
                    self.state.incr(RUNNING_COUNT_KEY, 1).await?;
                    return Ok(Some(instance));
                }
                Err(err) if err.is_mismatch() || err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Runs one claimed node to completion: inputs, handler, output,
    /// `running -> completed`, successor bookkeeping.
    async fn advance(&self, instance: NodeInstance) -> Result<()> {
        let spec = self.flow.node(instance.node_id())?.clone();

        if let NodeKind::Loop { splitter, body } = &spec.kind {
            return self.advance_loop(&instance, splitter.clone(), body).await;
        }

        let started = Instant::now();
        let input = self.load_input(&instance).await?;
        let ctx = NodeContext::for_request(&self.request, instance.node_id(), instance.iteration());
        let handler = spec.handler.as_ref().ok_or_else(|| {
            EngineError::Internal(format!("node {} has no handler", instance.display()))
        })?;
        let output = match handler.run(&ctx, input).await {
            Ok(output) => output,
            Err(err) => return self.fail_node(&instance, err).await,
        };

        // Branch selection is validated before the node is marked
        // terminal so a selector naming an unknown edge fails the node.
        let live: Option<Vec<String>> = match &spec.kind {
            NodeKind::Branch { selector } => {
                let selected = selector.select(&output);
                let children = self.flow.children(instance.node_id());
                if let Some(unknown) = selected.iter().find(|s| !children.contains(*s)) {
                    return self
                        .fail_node(
                            &instance,
                            anyhow::anyhow!("selector chose unknown successor {unknown}"),
                        )
                        .await;
                }
                Some(selected)
            }
            _ => None,
        };

        // A sibling's failure on another worker is terminal for the
        // whole request: discard this result before touching the data
        // store. A stop still gets the output written, but enqueues
        // nothing further.
        let phase_now = self.observed_phase_or_stopped().await?;
        if phase_now == Phase::Failed {
            return self.abandon_after_failure(&instance).await;
        }

        self.data.set(&instance.out_key(), output).await?;
        self.state
            .update(
                &instance.state_key(),
                NodeState::Running.as_str(),
                NodeState::Completed.as_str(),
            )
            .await?;
        self.state.incr(RUNNING_COUNT_KEY, -1).await?;
        self.state.incr(COMPLETED_COUNT_KEY, 1).await?;
        self.touch_last_advance().await?;
        self.events.emit(Event::NodeCompleted {
            flow_name: self.request.flow_name.clone(),
            request_id: self.request.request_id.clone(),
            node: instance.display(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        if phase_now == Phase::Stopped {
            debug!(node = %instance.display(), "stopped, successors not enqueued");
            return Ok(());
        }

        match &instance {
            NodeInstance::Iteration { loop_id, body, .. } => {
                let remaining = self.state.incr(&loop_remaining_key(loop_id), -1).await?;
                if remaining == 0 {
                    self.complete_loop_body(loop_id, body).await?;
                }
                Ok(())
            }
            NodeInstance::Node(id) => {
                let children: Vec<String> = self.flow.children(id).to_vec();
                if let Some(live) = &live {
                    for child in children.iter().filter(|c| !live.contains(*c)) {
                        self.state.set(&dead_edge_key(id, child), "dead").await?;
                    }
                }
                for child in &children {
                    let is_live = live.as_ref().map_or(true, |l| l.contains(child));
                    if is_live {
                        self.release_child(child).await?;
                    } else {
                        self.retire_incoming_edge(child).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Runs a loop node: splits the input and materializes one pending
    /// iteration record per item. The loop node itself completes
    /// immediately; the body aggregate completes when the iteration
    /// countdown reaches zero.
    async fn advance_loop(
        &self,
        instance: &NodeInstance,
        splitter: Arc<dyn LoopSplitter>,
        body: &str,
    ) -> Result<()> {
        let started = Instant::now();
        let loop_id = instance.node_id().to_string();
        let input = self.load_input(instance).await?;
        let items = match splitter.split(&input) {
            Ok(items) => items,
            Err(err) => return self.fail_node(instance, err).await,
        };
        let total = items.len();

        // Same terminal-failure gate as ordinary nodes, before any loop
        // state or items are materialized.
        let phase_now = self.observed_phase_or_stopped().await?;
        if phase_now == Phase::Failed {
            return self.abandon_after_failure(instance).await;
        }

        self.state.set(&loop_total_key(&loop_id), &total.to_string()).await?;
        self.state
            .set(&loop_remaining_key(&loop_id), &total.to_string())
            .await?;
        for (index, item) in items.into_iter().enumerate() {
            self.data.set(&loop_item_key(&loop_id, index), item).await?;
            self.state
                .set(
                    &node_state_key(&format!("{body}#{index}")),
                    NodeState::Pending.as_str(),
                )
                .await?;
        }

        self.state
            .update(
                &instance.state_key(),
                NodeState::Running.as_str(),
                NodeState::Completed.as_str(),
            )
            .await?;
        self.state.incr(RUNNING_COUNT_KEY, -1).await?;
        self.state.incr(COMPLETED_COUNT_KEY, 1).await?;
        self.touch_last_advance().await?;
        self.events.emit(Event::NodeCompleted {
            flow_name: self.request.flow_name.clone(),
            request_id: self.request.request_id.clone(),
            node: loop_id.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        if phase_now == Phase::Stopped {
            debug!(node = %loop_id, "stopped, iterations not enqueued");
            return Ok(());
        }

        if total == 0 {
            self.complete_loop_body(&loop_id, body).await?;
        } else {
            for _ in 0..total {
                self.partials.enqueue_partial(&self.request).await?;
            }
        }
        Ok(())
    }

    /// Finalizes a loop body once every iteration completed: writes the
    /// aggregate output and releases the body's successors (the loop
    /// terminator).
    async fn complete_loop_body(&self, loop_id: &str, body: &str) -> Result<()> {
        match self
            .state
            .update(
                &node_state_key(body),
                NodeState::Pending.as_str(),
                NodeState::Completed.as_str(),
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_mismatch() => return Ok(()),
            Err(err) => return Err(err),
        }

        let total = self.count(&loop_total_key(loop_id)).await? as usize;
        let mut collected = Vec::with_capacity(total);
        for index in 0..total {
            let blob = self.data.get(&iter_out_key(body, index)).await?;
            collected.push(blob_to_value(&blob));
        }
        let aggregate = serde_json::to_vec(&serde_json::Value::Array(collected))?;
        self.data.set(&out_key(body), Bytes::from(aggregate)).await?;

        // The loop -> body edge is settled by the aggregate completion.
        self.state.incr(&indeg_key(body), -1).await?;
        self.state.incr(COMPLETED_COUNT_KEY, 1).await?;

        for child in self.flow.children(body).to_vec() {
            self.release_child(&child).await?;
        }
        Ok(())
    }

    /// Fan-in bookkeeping for a live edge into `child`: the writer that
    /// observes the counter hit zero publishes the child's PARTIAL.
    async fn release_child(&self, child: &str) -> Result<()> {
        let remaining = self.state.incr(&indeg_key(child), -1).await?;
        if remaining == 0 && self.node_state_of(child).await? == NodeState::Pending {
            self.partials.enqueue_partial(&self.request).await?;
        }
        Ok(())
    }

    /// Settles an edge into `child` that will never deliver a
    /// completion (the branch deselected it, or its parent was
    /// skipped). A child cut off from every live path is skipped, and
    /// the skip cascades.
    async fn retire_incoming_edge(&self, child: &str) -> Result<()> {
        let mut work = vec![child.to_string()];
        while let Some(id) = work.pop() {
            let remaining = self.state.incr(&indeg_key(&id), -1).await?;
            if remaining > 0 {
                continue;
            }
            if self.has_live_completed_parent(&id).await? {
                if self.node_state_of(&id).await? == NodeState::Pending {
                    self.partials.enqueue_partial(&self.request).await?;
                }
                continue;
            }
            match self
                .state
                .update(
                    &node_state_key(&id),
                    NodeState::Pending.as_str(),
                    NodeState::Skipped.as_str(),
                )
                .await
            {
                Ok(()) => {
                    debug!(request = %self.request.request_id, node = %id, "node skipped");
                    for grandchild in self.flow.children(&id) {
                        work.push(grandchild.clone());
                    }
                }
                Err(err) if err.is_mismatch() || err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// A concurrently-failed request already emitted its terminal event
    /// and released its data blobs; this node's result is discarded,
    /// its record settles as skipped, and nothing further is published.
    async fn abandon_after_failure(&self, instance: &NodeInstance) -> Result<()> {
        debug!(
            request = %self.request.request_id,
            node = %instance.display(),
            "request failed concurrently, result discarded"
        );
        match self
            .state
            .update(
                &instance.state_key(),
                NodeState::Running.as_str(),
                NodeState::Skipped.as_str(),
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_mismatch() || err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.state.incr(RUNNING_COUNT_KEY, -1).await?;
        Ok(())
    }

    async fn has_live_completed_parent(&self, id: &str) -> Result<bool> {
        for parent in self.flow.parents(id) {
            if self.node_state_of(parent).await? == NodeState::Completed
                && !self.edge_is_dead(parent, id).await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Declared inputs of a node: the original request body for roots,
    /// the parent's output blob for single live parents, a JSON object
    /// keyed by parent id for fan-ins, and the materialized item for a
    /// loop iteration.
    async fn load_input(&self, instance: &NodeInstance) -> Result<Bytes> {
        if let NodeInstance::Iteration { loop_id, index, .. } = instance {
            return self.data.get(&loop_item_key(loop_id, *index)).await;
        }
        let id = instance.node_id();
        let mut live_parents = Vec::new();
        for parent in self.flow.parents(id) {
            if self.node_state_of(parent).await? == NodeState::Completed
                && !self.edge_is_dead(parent, id).await?
            {
                live_parents.push(parent.clone());
            }
        }
        match live_parents.len() {
            0 => self.data.get(REQUEST_BODY_KEY).await,
            1 => self.data.get(&out_key(&live_parents[0])).await,
            _ => {
                let mut object = serde_json::Map::new();
                for parent in &live_parents {
                    let blob = self.data.get(&out_key(parent)).await?;
                    object.insert(parent.clone(), blob_to_value(&blob));
                }
                let merged = serde_json::to_vec(&serde_json::Value::Object(object))?;
                Ok(Bytes::from(merged))
            }
        }
    }

    /// Terminal failure of a user node: the node and the request are
    /// marked failed, the data blobs are released, and the state
    /// namespace is retained so `FlowState` can report the outcome.
    async fn fail_node(&self, instance: &NodeInstance, err: anyhow::Error) -> Result<()> {
        warn!(
            request = %self.request.request_id,
            node = %instance.display(),
            error = %err,
            "node failed, request terminal"
        );
        match self
            .state
            .update(
                &instance.state_key(),
                NodeState::Running.as_str(),
                NodeState::Failed.as_str(),
            )
            .await
        {
            Ok(()) => {}
            Err(cas_err) if cas_err.is_mismatch() => {}
            Err(cas_err) => return Err(cas_err),
        }
        self.state.incr(RUNNING_COUNT_KEY, -1).await?;
        self.state.set(PHASE_KEY, Phase::Failed.as_str()).await?;
        self.events.emit(Event::RequestFailed {
            flow_name: self.request.flow_name.clone(),
            request_id: self.request.request_id.clone(),
            reason: err.to_string(),
        });
        self.data.cleanup().await?;
        Ok(())
    }

    /// Completion detection: an empty frontier with nothing running
    /// means every node is terminal. Also performs the deferred cleanup
    /// of a stopped request once it has quiesced.
    async fn try_finish(&self) -> Result<()> {
        let phase = match self.phase().await {
            Ok(phase) => phase,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        match phase {
            Phase::Stopped => {
                if self.count_or_zero(RUNNING_COUNT_KEY).await? == 0 {
                    self.cleanup_stores().await?;
                }
                Ok(())
            }
            Phase::Running => {
                if !self.resolve_frontier().await?.is_empty() {
                    return Ok(());
                }
                if self.count_or_zero(RUNNING_COUNT_KEY).await? != 0 {
                    return Ok(());
                }
                match self
                    .state
                    .update(PHASE_KEY, Phase::Running.as_str(), Phase::Finished.as_str())
                    .await
                {
                    Ok(()) => {
                        self.events.emit(Event::RequestFinished {
                            flow_name: self.request.flow_name.clone(),
                            request_id: self.request.request_id.clone(),
                        });
                        self.cleanup_stores().await
                    }
                    Err(err) if err.is_mismatch() || err.is_not_found() => Ok(()),
                    Err(err) => Err(err),
                }
            }
            _ => Ok(()),
        }
    }

    async fn cleanup_stores(&self) -> Result<()> {
        self.state.cleanup().await?;
        self.data.cleanup().await?;
        Ok(())
    }
}

/// Blobs that parse as JSON keep their structure in aggregates; others
/// are carried as strings.
fn blob_to_value(blob: &[u8]) -> serde_json::Value {
    serde_json::from_slice(blob)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(blob).into_owned()))
}
