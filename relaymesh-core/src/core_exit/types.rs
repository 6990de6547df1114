//! Exit node selection inputs and outputs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ExitNode, ExitNodeId};
use crate::storage::StoreError;

/// Latency measurement reported by an agent for one exit node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitNodePingResult {
    pub exit_node_id: ExitNodeId,
    #[serde(default)]
    pub exit_node_name: String,
    #[serde(default)]
    pub endpoint: String,
    /// Round trip in milliseconds
    pub latency_ms: f64,
    /// Remaining capacity, 1.0 = empty, 0.0 = full
    pub weight: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub was_previously_connected: bool,
}

impl ExitNodePingResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Exit node offered to an agent before it measures latency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitNodeCandidate {
    pub exit_node_id: ExitNodeId,
    pub exit_node_name: String,
    pub endpoint: String,
    pub weight: f64,
    pub was_previously_connected: bool,
}

/// Result of an organization access check
#[derive(Debug, Clone, PartialEq)]
pub struct OrgAccess {
    pub has_access: bool,
    pub exit_node: Option<ExitNode>,
}

impl OrgAccess {
    pub(crate) fn denied(exit_node: Option<ExitNode>) -> Self {
        Self { has_access: false, exit_node }
    }
}

/// Outcome of probing every known exit node once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub online: usize,
    pub offline: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Error)]
pub enum ExitNodeError {
    #[error("Exit node {0} not found")]
    NotFound(ExitNodeId),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
