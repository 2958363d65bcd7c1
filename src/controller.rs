//! Request controller: thin adapters from parsed requests to executor
//! calls. All progression logic lives in the executor.

use tracing::{debug, info};

use crate::errors::Result;
use crate::executor::FlowExecutor;
use crate::model::Request;

/// Begins a new request: seeds progress and enqueues the root nodes.
pub async fn execute_flow_handler(request: &Request, executor: &FlowExecutor) -> Result<()> {
    info!(flow = %request.flow_name, request = %request.request_id, "executing flow");
    executor.execute().await
}

/// Advances an in-flight request by one node.
pub async fn partial_execute_flow_handler(request: &Request, executor: &FlowExecutor) -> Result<()> {
    debug!(flow = %request.flow_name, request = %request.request_id, "partial executing flow");
    executor.partial_execute().await
}

pub async fn pause_flow_handler(request: &Request, executor: &FlowExecutor) -> Result<()> {
    info!(flow = %request.flow_name, request = %request.request_id, "pausing request");
    executor.pause().await
}

pub async fn resume_flow_handler(request: &Request, executor: &FlowExecutor) -> Result<()> {
    info!(flow = %request.flow_name, request = %request.request_id, "resuming request");
    executor.resume().await
}

pub async fn stop_flow_handler(request: &Request, executor: &FlowExecutor) -> Result<()> {
    info!(flow = %request.flow_name, request = %request.request_id, "stopping request");
    executor.stop().await
}

/// Returns the serialized progress of a request.
pub async fn flow_state_handler(request: &Request, executor: &FlowExecutor) -> Result<String> {
    debug!(flow = %request.flow_name, request = %request.request_id, "reading flow state");
    executor.get_state().await
}
