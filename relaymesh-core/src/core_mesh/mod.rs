//! Client/site peer mesh: association reconciliation and relay destinations

mod destinations;
mod reconciler;
mod rpc;
mod types;

pub use destinations::DestinationPropagator;
pub use reconciler::PeerAssociationReconciler;
pub use rpc::{
    send_peer_command, AddPeerRequest, AgentTarget, DeletePeerRequest, PeerCall, PeerCommand, PeerRpcDispatcher,
    ProxyTargetsRequest, RecordingPeerDispatcher, RemoteSubnetsRequest, SubnetProxyTarget,
};
pub use types::{MeshError, PropagationReport, ReconcileReport, Unprovisioned};
