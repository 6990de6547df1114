//! Reconcile outcomes and errors

use std::fmt;
use thiserror::Error;

use crate::model::{ClientId, ExitNodeId, SiteId, SiteResourceId};
use crate::storage::StoreError;

#[derive(Debug, Clone, Error)]
pub enum MeshError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MeshError {
    pub(crate) fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        MeshError::NotFound { kind, id: id.to_string() }
    }
}

/// Why a site cannot receive peer updates yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unprovisioned {
    NoExitNode,
    ExitNodeMissing(ExitNodeId),
    NoPublicKey,
    NoAgent,
}

impl fmt::Display for Unprovisioned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unprovisioned::NoExitNode => write!(f, "site has no exit node"),
            Unprovisioned::ExitNodeMissing(id) => write!(f, "exit node {} does not exist", id),
            Unprovisioned::NoPublicKey => write!(f, "site has no public key"),
            Unprovisioned::NoAgent => write!(f, "site has no gateway agent"),
        }
    }
}

/// What a reconcile changed and how delivery went
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Association rows inserted
    pub added: Vec<(ClientId, SiteId)>,
    /// Association rows deleted
    pub removed: Vec<(ClientId, SiteId)>,
    /// Resource association rows inserted
    pub resources_added: Vec<(ClientId, SiteResourceId)>,
    /// Resource association rows deleted
    pub resources_removed: Vec<(ClientId, SiteResourceId)>,
    /// Set when the site could not be told about the change
    pub unprovisioned: Option<Unprovisioned>,
    /// Changed pairs that produced no peer RPCs
    pub skipped: Vec<(ClientId, SiteId)>,
    pub rpcs_sent: usize,
    pub rpcs_failed: usize,
    pub destination_updates: usize,
    pub destination_failures: usize,
}

impl ReconcileReport {
    /// No association rows changed, site or resource level
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.resources_added.is_empty()
            && self.resources_removed.is_empty()
    }

    pub fn added_clients(&self) -> Vec<ClientId> {
        self.added.iter().map(|(c, _)| *c).collect()
    }

    pub fn removed_clients(&self) -> Vec<ClientId> {
        self.removed.iter().map(|(c, _)| *c).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// One per distinct exit node `reachable_at`
    pub groups: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_sites: Vec<SiteId>,
}
