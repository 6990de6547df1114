//! Delivery of exit node commands by node type
//!
//! Shared nodes expose an HTTP API at `reachable_at`. Dedicated nodes run an
//! agent that holds a connection to the control plane, so their commands go
//! out as typed messages on that connection.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::rpc::{ExitNodeRequest, ExitNodeRpcDispatcher, ExitNodeTarget};
use crate::model::ExitNodeId;
use crate::rpc::RpcError;

/// Message pushed to a dedicated exit node's agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: serde_json::Value,
}

/// Connections held by dedicated exit node agents
#[async_trait]
pub trait ExitNodeAgentChannel: Send + Sync {
    async fn send_message(&self, exit_node_id: ExitNodeId, message: AgentMessage) -> Result<(), RpcError>;
}

/// Sends dedicated nodes' commands through the agent channel and everything
/// else over HTTP
pub struct RoutingExitNodeDispatcher {
    http: Arc<dyn ExitNodeRpcDispatcher>,
    agents: Arc<dyn ExitNodeAgentChannel>,
}

impl RoutingExitNodeDispatcher {
    pub fn new(http: Arc<dyn ExitNodeRpcDispatcher>, agents: Arc<dyn ExitNodeAgentChannel>) -> Self {
        Self { http, agents }
    }
}

#[async_trait]
impl ExitNodeRpcDispatcher for RoutingExitNodeDispatcher {
    async fn send(&self, target: &ExitNodeTarget, request: &ExitNodeRequest) -> Result<(), RpcError> {
        if !target.via_agent() {
            return self.http.send(target, request).await;
        }

        let message = AgentMessage {
            message_type: request.agent_message_type().to_string(),
            data: request.payload()?,
        };
        debug!(exit_node_id = %target.exit_node_id, message_type = %message.message_type, "Sending to exit node agent");
        self.agents.send_message(target.exit_node_id, message).await
    }
}

/// Channel for a process that accepts no agent connections
pub struct DisconnectedAgentChannel;

#[async_trait]
impl ExitNodeAgentChannel for DisconnectedAgentChannel {
    async fn send_message(&self, exit_node_id: ExitNodeId, _message: AgentMessage) -> Result<(), RpcError> {
        Err(RpcError::Unreachable(format!("exit node {} agent is not connected", exit_node_id)))
    }
}

/// Records agent messages instead of sending them
#[derive(Default)]
pub struct RecordingAgentChannel {
    messages: Mutex<Vec<(ExitNodeId, AgentMessage)>>,
    disconnected: Mutex<HashSet<ExitNodeId>>,
}

impl RecordingAgentChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make messages to `exit_node_id` fail after being recorded
    pub async fn disconnect(&self, exit_node_id: ExitNodeId) {
        self.disconnected.lock().await.insert(exit_node_id);
    }

    pub async fn messages(&self) -> Vec<(ExitNodeId, AgentMessage)> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl ExitNodeAgentChannel for RecordingAgentChannel {
    async fn send_message(&self, exit_node_id: ExitNodeId, message: AgentMessage) -> Result<(), RpcError> {
        self.messages.lock().await.push((exit_node_id, message));
        if self.disconnected.lock().await.contains(&exit_node_id) {
            return Err(RpcError::Unreachable(format!("exit node {} agent is not connected", exit_node_id)));
        }
        Ok(())
    }
}
