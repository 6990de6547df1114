//! Peer and routing commands for site and client agents

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::model::net::{is_valid_cidr, split_endpoint};
use crate::model::{AgentId, ClientId, SiteId};
use crate::rpc::{call_with_timeout, RpcError};

/// Agent a peer command is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentTarget {
    Site { site_id: SiteId, agent_id: AgentId },
    Client { client_id: ClientId, agent_id: AgentId },
}

impl AgentTarget {
    pub fn agent_id(&self) -> &AgentId {
        match self {
            AgentTarget::Site { agent_id, .. } | AgentTarget::Client { agent_id, .. } => agent_id,
        }
    }
}

impl fmt::Display for AgentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentTarget::Site { site_id, agent_id } => write!(f, "site {} (agent {})", site_id, agent_id),
            AgentTarget::Client { client_id, agent_id } => write!(f, "client {} (agent {})", client_id, agent_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPeerRequest {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    /// `host:port`, or empty to wait for the peer to connect through a relay
    pub endpoint: String,
    /// Tunnel address of the site, sent to clients only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
}

impl AddPeerRequest {
    pub fn validate(&self) -> Result<(), RpcError> {
        validate_key(&self.public_key)?;
        validate_cidrs(&self.allowed_ips)?;
        if !self.endpoint.is_empty() && split_endpoint(&self.endpoint).is_none() {
            return Err(RpcError::InvalidRequest(format!(
                "endpoint '{}' is not host:port",
                self.endpoint
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePeerRequest {
    pub public_key: String,
}

impl DeletePeerRequest {
    pub fn validate(&self) -> Result<(), RpcError> {
        validate_key(&self.public_key)
    }
}

/// Route on a site gateway from one client's tunnel address to a resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetProxyTarget {
    pub source_prefix: String,
    pub dest_prefix: String,
}

/// Proxy targets to install on, or remove from, a site gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTargetsRequest {
    pub targets: Vec<SubnetProxyTarget>,
}

impl ProxyTargetsRequest {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.targets.is_empty() {
            return Err(RpcError::InvalidRequest("no proxy targets".to_string()));
        }
        for target in &self.targets {
            validate_cidrs([&target.source_prefix, &target.dest_prefix])?;
        }
        Ok(())
    }
}

/// Subnets a client routes to an existing site peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSubnetsRequest {
    /// Key of the site peer the subnets belong to
    pub public_key: String,
    pub remote_subnets: Vec<String>,
}

impl RemoteSubnetsRequest {
    pub fn validate(&self) -> Result<(), RpcError> {
        validate_key(&self.public_key)?;
        if self.remote_subnets.is_empty() {
            return Err(RpcError::InvalidRequest("no remote subnets".to_string()));
        }
        validate_cidrs(&self.remote_subnets)
    }
}

fn validate_cidrs<'a>(values: impl IntoIterator<Item = &'a String>) -> Result<(), RpcError> {
    match values.into_iter().find(|v| !is_valid_cidr(v)) {
        Some(bad) => Err(RpcError::InvalidRequest(format!("'{}' is not a CIDR", bad))),
        None => Ok(()),
    }
}

fn validate_key(key: &str) -> Result<(), RpcError> {
    if key.trim().is_empty() {
        return Err(RpcError::InvalidRequest("public key is empty".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Add(AddPeerRequest),
    Delete(DeletePeerRequest),
    /// Site gateways only
    AddTargets(ProxyTargetsRequest),
    /// Site gateways only
    RemoveTargets(ProxyTargetsRequest),
    /// Client agents only
    AddRemoteSubnets(RemoteSubnetsRequest),
    /// Client agents only
    RemoveRemoteSubnets(RemoteSubnetsRequest),
}

impl PeerCommand {
    pub fn method(&self) -> &'static str {
        match self {
            PeerCommand::Add(_) => "add_peer",
            PeerCommand::Delete(_) => "delete_peer",
            PeerCommand::AddTargets(_) => "add_targets",
            PeerCommand::RemoveTargets(_) => "remove_targets",
            PeerCommand::AddRemoteSubnets(_) => "add_remote_subnets",
            PeerCommand::RemoveRemoteSubnets(_) => "remove_remote_subnets",
        }
    }

    /// Peer the command is about; target commands name none
    pub fn public_key(&self) -> Option<&str> {
        match self {
            PeerCommand::Add(r) => Some(&r.public_key),
            PeerCommand::Delete(r) => Some(&r.public_key),
            PeerCommand::AddRemoteSubnets(r) | PeerCommand::RemoveRemoteSubnets(r) => Some(&r.public_key),
            PeerCommand::AddTargets(_) | PeerCommand::RemoveTargets(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        match self {
            PeerCommand::Add(r) => r.validate(),
            PeerCommand::Delete(r) => r.validate(),
            PeerCommand::AddTargets(r) | PeerCommand::RemoveTargets(r) => r.validate(),
            PeerCommand::AddRemoteSubnets(r) | PeerCommand::RemoveRemoteSubnets(r) => r.validate(),
        }
    }
}

/// Transport to site and client agents
#[async_trait]
pub trait PeerRpcDispatcher: Send + Sync {
    async fn add_peer(&self, target: &AgentTarget, request: &AddPeerRequest) -> Result<(), RpcError>;

    async fn delete_peer(&self, target: &AgentTarget, request: &DeletePeerRequest) -> Result<(), RpcError>;

    async fn add_targets(&self, target: &AgentTarget, request: &ProxyTargetsRequest) -> Result<(), RpcError>;

    async fn remove_targets(&self, target: &AgentTarget, request: &ProxyTargetsRequest) -> Result<(), RpcError>;

    async fn add_remote_subnets(&self, target: &AgentTarget, request: &RemoteSubnetsRequest) -> Result<(), RpcError>;

    async fn remove_remote_subnets(
        &self,
        target: &AgentTarget,
        request: &RemoteSubnetsRequest,
    ) -> Result<(), RpcError>;
}

/// Validate, then deliver with a deadline
pub async fn send_peer_command(
    dispatcher: &dyn PeerRpcDispatcher,
    target: &AgentTarget,
    command: &PeerCommand,
    timeout: Duration,
) -> Result<(), RpcError> {
    command.validate()?;
    let addressed_to_site = matches!(target, AgentTarget::Site { .. });
    match command {
        PeerCommand::AddTargets(_) | PeerCommand::RemoveTargets(_) if !addressed_to_site => {
            return Err(RpcError::InvalidRequest(format!("{} is only sent to site gateways", command.method())));
        }
        PeerCommand::AddRemoteSubnets(_) | PeerCommand::RemoveRemoteSubnets(_) if addressed_to_site => {
            return Err(RpcError::InvalidRequest(format!("{} is only sent to clients", command.method())));
        }
        _ => {}
    }

    let method = command.method();
    match command {
        PeerCommand::Add(request) => call_with_timeout(method, timeout, dispatcher.add_peer(target, request)).await,
        PeerCommand::Delete(request) => {
            call_with_timeout(method, timeout, dispatcher.delete_peer(target, request)).await
        }
        PeerCommand::AddTargets(request) => {
            call_with_timeout(method, timeout, dispatcher.add_targets(target, request)).await
        }
        PeerCommand::RemoveTargets(request) => {
            call_with_timeout(method, timeout, dispatcher.remove_targets(target, request)).await
        }
        PeerCommand::AddRemoteSubnets(request) => {
            call_with_timeout(method, timeout, dispatcher.add_remote_subnets(target, request)).await
        }
        PeerCommand::RemoveRemoteSubnets(request) => {
            call_with_timeout(method, timeout, dispatcher.remove_remote_subnets(target, request)).await
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCall {
    pub target: AgentTarget,
    pub command: PeerCommand,
}

/// Records peer commands in arrival order
#[derive(Default)]
pub struct RecordingPeerDispatcher {
    calls: Mutex<Vec<PeerCall>>,
    failing: Mutex<HashSet<AgentId>>,
}

impl RecordingPeerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commands for `agent_id` fail after being recorded
    pub async fn fail_for(&self, agent_id: AgentId) {
        self.failing.lock().await.insert(agent_id);
    }

    pub async fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }

    async fn record(&self, target: &AgentTarget, command: PeerCommand) -> Result<(), RpcError> {
        self.calls.lock().await.push(PeerCall { target: target.clone(), command });
        if self.failing.lock().await.contains(target.agent_id()) {
            return Err(RpcError::Unreachable(target.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerRpcDispatcher for RecordingPeerDispatcher {
    async fn add_peer(&self, target: &AgentTarget, request: &AddPeerRequest) -> Result<(), RpcError> {
        self.record(target, PeerCommand::Add(request.clone())).await
    }

    async fn delete_peer(&self, target: &AgentTarget, request: &DeletePeerRequest) -> Result<(), RpcError> {
        self.record(target, PeerCommand::Delete(request.clone())).await
    }

    async fn add_targets(&self, target: &AgentTarget, request: &ProxyTargetsRequest) -> Result<(), RpcError> {
        self.record(target, PeerCommand::AddTargets(request.clone())).await
    }

    async fn remove_targets(&self, target: &AgentTarget, request: &ProxyTargetsRequest) -> Result<(), RpcError> {
        self.record(target, PeerCommand::RemoveTargets(request.clone())).await
    }

    async fn add_remote_subnets(&self, target: &AgentTarget, request: &RemoteSubnetsRequest) -> Result<(), RpcError> {
        self.record(target, PeerCommand::AddRemoteSubnets(request.clone())).await
    }

    async fn remove_remote_subnets(
        &self,
        target: &AgentTarget,
        request: &RemoteSubnetsRequest,
    ) -> Result<(), RpcError> {
        self.record(target, PeerCommand::RemoveRemoteSubnets(request.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(endpoint: &str, allowed: &[&str]) -> AddPeerRequest {
        AddPeerRequest {
            public_key: "client-key".to_string(),
            allowed_ips: allowed.iter().map(|s| s.to_string()).collect(),
            endpoint: endpoint.to_string(),
            server_ip: None,
            server_port: None,
        }
    }

    #[test]
    fn test_add_peer_validation() {
        assert!(add("", &["100.90.128.2/32"]).validate().is_ok());
        assert!(add("relay.example.com:21820", &["100.90.128.0/24"]).validate().is_ok());
        assert!(add("relay.example.com", &[]).validate().is_err());
        assert!(add("", &["100.90.128.2"]).validate().is_err());

        let mut keyless = add("", &[]);
        keyless.public_key = " ".to_string();
        assert!(keyless.validate().is_err());
    }

    #[test]
    fn test_delete_peer_validation() {
        assert!(DeletePeerRequest { public_key: "k".to_string() }.validate().is_ok());
        assert!(DeletePeerRequest { public_key: String::new() }.validate().is_err());
    }

    #[test]
    fn test_add_peer_wire_format() {
        let json = serde_json::to_value(add("", &["100.90.128.2/32"])).unwrap();
        assert_eq!(json["publicKey"], "client-key");
        assert_eq!(json["allowedIps"][0], "100.90.128.2/32");
        assert!(json.get("serverIp").is_none());
    }

    #[test]
    fn test_proxy_targets_wire_format() {
        let request = ProxyTargetsRequest {
            targets: vec![SubnetProxyTarget {
                source_prefix: "100.90.129.7/32".to_string(),
                dest_prefix: "10.1.0.0/24".to_string(),
            }],
        };
        assert!(request.validate().is_ok());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["targets"][0]["sourcePrefix"], "100.90.129.7/32");
        assert_eq!(json["targets"][0]["destPrefix"], "10.1.0.0/24");

        assert!(ProxyTargetsRequest { targets: vec![] }.validate().is_err());
    }

    #[tokio::test]
    async fn test_commands_rejected_for_wrong_agent_kind() {
        let dispatcher = RecordingPeerDispatcher::new();
        let client = AgentTarget::Client { client_id: ClientId(7), agent_id: AgentId::new("client-agent-7") };
        let site = AgentTarget::Site { site_id: SiteId(1), agent_id: AgentId::new("site-agent-1") };
        let targets = PeerCommand::AddTargets(ProxyTargetsRequest {
            targets: vec![SubnetProxyTarget {
                source_prefix: "100.90.129.7/32".to_string(),
                dest_prefix: "10.1.0.0/24".to_string(),
            }],
        });
        let subnets = PeerCommand::AddRemoteSubnets(RemoteSubnetsRequest {
            public_key: "site-1-key".to_string(),
            remote_subnets: vec!["10.1.0.0/24".to_string()],
        });

        let timeout = Duration::from_secs(1);
        assert!(send_peer_command(&dispatcher, &client, &targets, timeout).await.is_err());
        assert!(send_peer_command(&dispatcher, &site, &subnets, timeout).await.is_err());
        assert!(dispatcher.calls().await.is_empty());

        send_peer_command(&dispatcher, &site, &targets, timeout).await.unwrap();
        send_peer_command(&dispatcher, &client, &subnets, timeout).await.unwrap();
        assert_eq!(dispatcher.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_command_is_not_dispatched() {
        let dispatcher = RecordingPeerDispatcher::new();
        let target = AgentTarget::Site { site_id: SiteId(1), agent_id: AgentId::new("site-agent-1") };
        let command = PeerCommand::Add(add("not an endpoint", &[]));

        let err = send_peer_command(&dispatcher, &target, &command, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidRequest(_)));
        assert!(dispatcher.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_recording_dispatcher_failure_injection() {
        let dispatcher = RecordingPeerDispatcher::new();
        let agent = AgentId::new("client-agent-2");
        dispatcher.fail_for(agent.clone()).await;
        let target = AgentTarget::Client { client_id: ClientId(2), agent_id: agent };
        let command = PeerCommand::Delete(DeletePeerRequest { public_key: "site-key".to_string() });

        let err = send_peer_command(&dispatcher, &target, &command, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable(_)));
        assert_eq!(dispatcher.calls().await.len(), 1);
    }
}
