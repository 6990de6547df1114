//! Commands sent to exit node gateways

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::ExitNodeError;
use crate::model::{ExitNode, ExitNodeId, ExitNodeType};
use crate::rpc::{call_with_timeout, RpcError};

/// One site address a client may reach through the exit node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDestination {
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(rename = "destinationPort")]
    pub destination_port: u16,
}

/// Replace the destinations reachable from a client's source address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDestinationsRequest {
    pub source_ip: String,
    pub source_port: u16,
    pub destinations: Vec<PeerDestination>,
}

impl UpdateDestinationsRequest {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.source_ip.is_empty() {
            return Err(RpcError::InvalidRequest("source_ip is empty".to_string()));
        }
        for destination in &self.destinations {
            if destination.destination_ip.parse::<IpAddr>().is_err() {
                return Err(RpcError::InvalidRequest(format!(
                    "destination_ip '{}' is not an IP address",
                    destination.destination_ip
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitNodeRequest {
    UpdateDestinations(UpdateDestinationsRequest),
}

impl ExitNodeRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ExitNodeRequest::UpdateDestinations(_) => "update_destinations",
        }
    }

    /// Path under the node's `reachable_at` URL
    pub fn path(&self) -> &'static str {
        match self {
            ExitNodeRequest::UpdateDestinations(_) => "update-destinations",
        }
    }

    /// Message type when delivered over a dedicated node's agent connection
    pub fn agent_message_type(&self) -> &'static str {
        match self {
            ExitNodeRequest::UpdateDestinations(_) => "remoteExitNode/update-destinations",
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, RpcError> {
        let value = match self {
            ExitNodeRequest::UpdateDestinations(request) => serde_json::to_value(request),
        };
        value.map_err(|e| RpcError::InvalidRequest(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        match self {
            ExitNodeRequest::UpdateDestinations(request) => request.validate(),
        }
    }
}

/// Addressing information for an exit node call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNodeTarget {
    pub exit_node_id: ExitNodeId,
    pub name: String,
    pub node_type: ExitNodeType,
    pub reachable_at: String,
}

impl ExitNodeTarget {
    /// Dedicated nodes keep a connection to the control plane instead of
    /// exposing an HTTP API
    pub fn via_agent(&self) -> bool {
        self.node_type == ExitNodeType::Dedicated
    }

    /// Calls sharing a key reach the same gateway
    pub fn route_key(&self) -> String {
        if self.via_agent() {
            format!("agent:{}", self.exit_node_id)
        } else {
            self.reachable_at.clone()
        }
    }
}

impl From<&ExitNode> for ExitNodeTarget {
    fn from(node: &ExitNode) -> Self {
        Self {
            exit_node_id: node.id,
            name: node.name.clone(),
            node_type: node.node_type,
            reachable_at: node.reachable_at.clone(),
        }
    }
}

#[async_trait]
pub trait ExitNodeRpcDispatcher: Send + Sync {
    async fn send(&self, target: &ExitNodeTarget, request: &ExitNodeRequest) -> Result<(), RpcError>;
}

/// Validate, then send with a deadline
pub async fn send_to_exit_node(
    dispatcher: &dyn ExitNodeRpcDispatcher,
    target: &ExitNodeTarget,
    request: &ExitNodeRequest,
    timeout: Duration,
) -> Result<(), RpcError> {
    request.validate()?;
    call_with_timeout(request.method(), timeout, dispatcher.send(target, request)).await
}

/// POSTs JSON payloads to `<reachable_at>/<path>`
pub struct HttpExitNodeDispatcher {
    client: reqwest::Client,
}

impl HttpExitNodeDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, ExitNodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExitNodeError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ExitNodeRpcDispatcher for HttpExitNodeDispatcher {
    async fn send(&self, target: &ExitNodeTarget, request: &ExitNodeRequest) -> Result<(), RpcError> {
        if target.via_agent() {
            return Err(RpcError::Unreachable(format!(
                "exit node {} is dedicated and has no HTTP API",
                target.exit_node_id
            )));
        }
        if target.reachable_at.is_empty() {
            return Err(RpcError::Unreachable(format!(
                "exit node {} has no reachable address",
                target.exit_node_id
            )));
        }

        let url = format!("{}/{}", target.reachable_at.trim_end_matches('/'), request.path());
        let builder = self.client.post(&url);
        let builder = match request {
            ExitNodeRequest::UpdateDestinations(payload) => builder.json(payload),
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!("{} returned HTTP {}", url, status)));
        }
        debug!(exit_node_id = %target.exit_node_id, url = %url, "Exit node accepted request");
        Ok(())
    }
}

/// Records calls instead of sending them
#[derive(Default)]
pub struct RecordingExitNodeDispatcher {
    calls: Mutex<Vec<(ExitNodeTarget, ExitNodeRequest)>>,
    failing: Mutex<HashSet<ExitNodeId>>,
}

impl RecordingExitNodeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make calls to `exit_node_id` fail after being recorded
    pub async fn fail_for(&self, exit_node_id: ExitNodeId) {
        self.failing.lock().await.insert(exit_node_id);
    }

    pub async fn calls(&self) -> Vec<(ExitNodeTarget, ExitNodeRequest)> {
        self.calls.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }
}

#[async_trait]
impl ExitNodeRpcDispatcher for RecordingExitNodeDispatcher {
    async fn send(&self, target: &ExitNodeTarget, request: &ExitNodeRequest) -> Result<(), RpcError> {
        self.calls.lock().await.push((target.clone(), request.clone()));
        if self.failing.lock().await.contains(&target.exit_node_id) {
            return Err(RpcError::Transport(format!("exit node {} refused", target.exit_node_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::Arc;

    fn request() -> ExitNodeRequest {
        ExitNodeRequest::UpdateDestinations(UpdateDestinationsRequest {
            source_ip: "198.51.100.4".to_string(),
            source_port: 41000,
            destinations: vec![PeerDestination {
                destination_ip: "100.90.128.2".to_string(),
                destination_port: 51820,
            }],
        })
    }

    fn target(reachable_at: &str) -> ExitNodeTarget {
        ExitNodeTarget {
            exit_node_id: ExitNodeId(1),
            name: "fra-1".to_string(),
            node_type: ExitNodeType::Shared,
            reachable_at: reachable_at.to_string(),
        }
    }

    #[test]
    fn test_wire_format() {
        let ExitNodeRequest::UpdateDestinations(payload) = request();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["sourceIp"], "198.51.100.4");
        assert_eq!(json["sourcePort"], 41000);
        assert_eq!(json["destinations"][0]["destinationIP"], "100.90.128.2");
        assert_eq!(json["destinations"][0]["destinationPort"], 51820);
    }

    #[test]
    fn test_validation() {
        assert!(request().validate().is_ok());

        let bad = UpdateDestinationsRequest {
            source_ip: "198.51.100.4".to_string(),
            source_port: 1,
            destinations: vec![PeerDestination { destination_ip: "site-a".to_string(), destination_port: 1 }],
        };
        assert!(matches!(bad.validate(), Err(RpcError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_http_dispatcher_posts_json() {
        let received = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let sink = received.clone();
        let router = Router::new().route(
            "/update-destinations",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.push(body);
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let dispatcher = HttpExitNodeDispatcher::new(Duration::from_secs(2)).unwrap();
        send_to_exit_node(&dispatcher, &target(&format!("http://{}/", addr)), &request(), Duration::from_secs(2))
            .await
            .unwrap();

        let bodies = received.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["sourcePort"], 41000);
    }

    #[tokio::test]
    async fn test_http_dispatcher_requires_reachable_at() {
        let dispatcher = HttpExitNodeDispatcher::new(Duration::from_secs(1)).unwrap();
        let err = dispatcher.send(&target(""), &request()).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_http_dispatcher_refuses_dedicated_nodes() {
        let dispatcher = HttpExitNodeDispatcher::new(Duration::from_secs(1)).unwrap();
        let dedicated = ExitNodeTarget { node_type: ExitNodeType::Dedicated, ..target("http://127.0.0.1:9") };
        let err = dispatcher.send(&dedicated, &request()).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable(_)));
    }

    #[test]
    fn test_route_key() {
        assert_eq!(target("http://gw-a:3003").route_key(), "http://gw-a:3003");
        let dedicated = ExitNodeTarget { node_type: ExitNodeType::Dedicated, ..target("") };
        assert_eq!(dedicated.route_key(), "agent:1");
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_sent() {
        let dispatcher = RecordingExitNodeDispatcher::new();
        let invalid = ExitNodeRequest::UpdateDestinations(UpdateDestinationsRequest {
            source_ip: String::new(),
            source_port: 0,
            destinations: vec![],
        });

        let err = send_to_exit_node(&dispatcher, &target("http://gw"), &invalid, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
        assert!(dispatcher.calls().await.is_empty());
    }
}
