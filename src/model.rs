//! Wire-level types shared by the queue fabric, the registry, and the
//! executor: the queued task envelope, the request it unfolds into, and
//! the request/node lifecycle enums.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Prefix of the per-flow primary task queue. Retry queues append
/// `-push-<i>`.
pub const INTERNAL_REQUEST_QUEUE_PREFIX: &str = "goflow-internal-request";
/// Prefix of flow descriptor keys in the shared registry.
pub const FLOW_KEY_PREFIX: &str = "goflow-flow";
/// Prefix of worker heartbeat keys in the shared registry.
pub const WORKER_KEY_PREFIX: &str = "goflow-worker";

/// Cadence at which a runtime re-announces itself and its flows.
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(4);
/// TTL on registry keys. Must stay comfortably above the heartbeat so a
/// single missed tick does not drop a live worker from the registry.
pub const RDB_KEY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn internal_request_queue_id(flow_name: &str) -> String {
    format!("{INTERNAL_REQUEST_QUEUE_PREFIX}:{flow_name}")
}

pub fn retry_queue_id(flow_name: &str, hop: usize) -> String {
    format!("{}-push-{hop}", internal_request_queue_id(flow_name))
}

pub fn worker_key(worker_id: &str) -> String {
    format!("{WORKER_KEY_PREFIX}:{worker_id}")
}

pub fn flow_key(flow_name: &str) -> String {
    format!("{FLOW_KEY_PREFIX}:{flow_name}")
}

/// Kind of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "RESUME")]
    Resume,
    #[serde(rename = "STOP")]
    Stop,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::New => "NEW",
            RequestType::Partial => "PARTIAL",
            RequestType::Pause => "PAUSE",
            RequestType::Resume => "RESUME",
            RequestType::Stop => "STOP",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued unit of work, exactly as serialized onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub flow_name: String,
    pub request_id: String,
    pub body: String,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub raw_query: String,
    #[serde(default)]
    pub query: HashMap<String, Vec<String>>,
    pub request_type: RequestType,
}

impl Task {
    pub fn from_request(request: &Request, request_type: RequestType) -> Self {
        Self {
            flow_name: request.flow_name.clone(),
            request_id: request.request_id.clone(),
            body: String::from_utf8_lossy(&request.body).into_owned(),
            header: request.header.clone(),
            raw_query: request.raw_query.clone(),
            query: request.query.clone(),
            request_type,
        }
    }

    pub fn into_request(self) -> Request {
        Request {
            flow_name: self.flow_name,
            request_id: self.request_id,
            body: Bytes::from(self.body.into_bytes()),
            header: self.header,
            raw_query: self.raw_query,
            query: self.query,
        }
    }
}

/// One execution instance of a flow, as seen by the controller and the
/// executor.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub flow_name: String,
    pub request_id: String,
    pub body: Bytes,
    pub header: HashMap<String, Vec<String>>,
    pub raw_query: String,
    pub query: HashMap<String, Vec<String>>,
}

impl Request {
    pub fn new(flow_name: impl Into<String>, request_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            flow_name: flow_name.into(),
            request_id: request_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Coarse request lifecycle phase.
///
/// Monotonic except for `Paused -> Running` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Running,
    Paused,
    Stopped,
    Finished,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Stopped => "stopped",
            Phase::Finished => "finished",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Stopped | Phase::Finished | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Phase::Running),
            "paused" => Ok(Phase::Paused),
            "stopped" => Ok(Phase::Stopped),
            "finished" => Ok(Phase::Finished),
            "failed" => Ok(Phase::Failed),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Per-node execution state. `Completed`, `Skipped` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Skipped => "skipped",
            NodeState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Skipped | NodeState::Failed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeState::Pending),
            "running" => Ok(NodeState::Running),
            "completed" => Ok(NodeState::Completed),
            "skipped" => Ok(NodeState::Skipped),
            "failed" => Ok(NodeState::Failed),
            other => Err(format!("unknown node state: {other}")),
        }
    }
}

/// Announcement a live worker republishes under `goflow-worker:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub flows: Vec<String>,
    pub concurrency: usize,
}

/// Serialized view of a request's progress, as returned by `FlowState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestProgress {
    pub flow_name: String,
    pub request_id: String,
    pub phase: Phase,
    pub nodes: BTreeMap<String, NodeState>,
    pub completed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_advance: Option<String>,
}
