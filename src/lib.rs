//! redflow - a Redis-backed distributed workflow execution engine.
//!
//! Flows are declarative DAGs of async nodes. An incoming request is
//! split over time into many brief partial executions: each one
//! advances the flow by a single node, persists progress to a shared
//! state store, and re-enqueues follow-up partial tasks, so a
//! long-running workflow holds no worker thread between steps and can
//! be paused, resumed, and stopped externally. Workers coordinate
//! through per-flow queues with a retry push chain and announce
//! themselves in a shared registry under TTL'd keys; at-most-once node
//! advancement is enforced with per-node compare-and-set, which makes
//! duplicate deliveries harmless.

pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod executor;
pub mod flow;
pub mod model;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod store;

pub use config::{EngineConfig, EngineConfigBuilder, RedisConfig};
pub use errors::{EngineError, Result};
pub use events::{BufferingEventHandler, Event, EventHandler, TracingEventHandler};
pub use executor::{FlowExecutor, PartialPublisher};
pub use flow::{
    handler_fn, selector_fn, splitter_fn, BranchSelector, FlowDefinition, FlowDescriptor,
    LoopSplitter, NodeContext, NodeHandler,
};
pub use model::{NodeState, Phase, Request, RequestProgress, RequestType, Task, Worker};
pub use runtime::FlowRuntime;
