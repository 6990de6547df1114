//! Exit node selection, directory and gateway commands

mod directory;
mod probe;
mod routing;
mod rpc;
mod selector;
mod types;

pub use directory::ExitNodeDirectory;
pub use probe::{HttpOnlineProbe, OnlineProbe};
pub use routing::{
    AgentMessage, DisconnectedAgentChannel, ExitNodeAgentChannel, RecordingAgentChannel, RoutingExitNodeDispatcher,
};
pub use rpc::{
    send_to_exit_node, ExitNodeRequest, ExitNodeRpcDispatcher, ExitNodeTarget, HttpExitNodeDispatcher,
    PeerDestination, RecordingExitNodeDispatcher, UpdateDestinationsRequest,
};
pub use selector::{ExitNodeSelector, Selection, SelectionReason};
pub use types::{ExitNodeCandidate, ExitNodeError, ExitNodePingResult, HealthSweep, OrgAccess};
