//! Storage seams consumed by the exit node directory and the mesh reconciler
//!
//! The relational schema lives outside this crate; these traits describe the
//! queries the control plane needs. [`InMemoryStore`] implements all of them.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    AgentId, Client, ClientId, ClientSiteAssociation, ClientSiteResourceAssociation, ExitNode, ExitNodeId, OrgId,
    RoleId, Site, SiteId, SiteResource, SiteResourceId, UserId,
};

mod memory;

pub use memory::{InMemoryStore, MeshSnapshot};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Transaction failed to commit: {0}")]
    Commit(String),

    #[error("Failed to load state snapshot: {0}")]
    Snapshot(String),
}

/// Queries used by the exit node directory
#[async_trait]
pub trait ExitNodeStore: Send + Sync {
    async fn list_exit_nodes(&self) -> Result<Vec<ExitNode>, StoreError>;

    async fn find_exit_node(&self, id: ExitNodeId) -> Result<Option<ExitNode>, StoreError>;

    /// Exit nodes explicitly dedicated to `org_id`
    async fn exit_nodes_linked_to(&self, org_id: &OrgId) -> Result<Vec<ExitNodeId>, StoreError>;

    async fn is_linked(&self, exit_node_id: ExitNodeId, org_id: &OrgId) -> Result<bool, StoreError>;

    /// Online sites currently bound to the node
    async fn count_online_sites(&self, exit_node_id: ExitNodeId) -> Result<u64, StoreError>;

    async fn set_exit_node_online(
        &self,
        exit_node_id: ExitNodeId,
        online: bool,
        last_ping: Option<u64>,
    ) -> Result<(), StoreError>;

    async fn find_site(&self, site_id: SiteId) -> Result<Option<Site>, StoreError>;
}

/// A site a client is associated with, plus what is needed to route to it
#[derive(Debug, Clone, PartialEq)]
pub struct SiteLink {
    pub site: Site,
    pub association: ClientSiteAssociation,
    pub exit_node: Option<ExitNode>,
}

/// Non-transactional reads plus transaction entry point for the mesh
#[async_trait]
pub trait MeshStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn MeshTransaction>, StoreError>;

    async fn exit_node(&self, id: ExitNodeId) -> Result<Option<ExitNode>, StoreError>;

    async fn site_agent(&self, site_id: SiteId) -> Result<Option<AgentId>, StoreError>;

    async fn client_agent(&self, client_id: ClientId) -> Result<Option<AgentId>, StoreError>;

    /// Every site associated with the client, joined with its exit node
    async fn site_links_for_client(&self, client_id: ClientId) -> Result<Vec<SiteLink>, StoreError>;
}

/// Unit of work over grants and association rows
///
/// Dropping a transaction without calling [`MeshTransaction::commit`]
/// discards its writes.
#[async_trait]
pub trait MeshTransaction: Send {
    async fn site_resource(&mut self, id: SiteResourceId) -> Result<Option<SiteResource>, StoreError>;

    async fn site(&mut self, id: SiteId) -> Result<Option<Site>, StoreError>;

    async fn sites(&mut self, ids: &[SiteId]) -> Result<Vec<Site>, StoreError>;

    async fn client(&mut self, id: ClientId) -> Result<Option<Client>, StoreError>;

    async fn clients(&mut self, ids: &[ClientId]) -> Result<Vec<Client>, StoreError>;

    async fn site_resources(&mut self, ids: &[SiteResourceId]) -> Result<Vec<SiteResource>, StoreError>;

    /// Resources hosted on the site, ordered by id
    async fn resources_on_site(&mut self, site_id: SiteId) -> Result<Vec<SiteResource>, StoreError>;

    async fn users_granted(&mut self, resource_ids: &[SiteResourceId]) -> Result<Vec<UserId>, StoreError>;

    async fn roles_granted(&mut self, resource_ids: &[SiteResourceId]) -> Result<Vec<RoleId>, StoreError>;

    async fn clients_granted(&mut self, resource_ids: &[SiteResourceId]) -> Result<Vec<ClientId>, StoreError>;

    async fn role_members(&mut self, role_ids: &[RoleId]) -> Result<Vec<UserId>, StoreError>;

    async fn roles_of_user(&mut self, org_id: &OrgId, user_id: &UserId) -> Result<Vec<RoleId>, StoreError>;

    async fn resources_granted_to_user(&mut self, user_id: &UserId) -> Result<Vec<SiteResourceId>, StoreError>;

    async fn resources_granted_to_roles(&mut self, role_ids: &[RoleId]) -> Result<Vec<SiteResourceId>, StoreError>;

    async fn resources_granted_to_client(&mut self, client_id: ClientId) -> Result<Vec<SiteResourceId>, StoreError>;

    /// Clients of `org_id` owned by any of `user_ids`
    async fn clients_of_users(&mut self, org_id: &OrgId, user_ids: &[UserId]) -> Result<Vec<ClientId>, StoreError>;

    async fn associated_clients(&mut self, site_id: SiteId) -> Result<Vec<ClientId>, StoreError>;

    async fn associated_sites(&mut self, client_id: ClientId) -> Result<Vec<SiteId>, StoreError>;

    async fn insert_associations(&mut self, rows: &[ClientSiteAssociation]) -> Result<(), StoreError>;

    async fn delete_associations(&mut self, pairs: &[(ClientId, SiteId)]) -> Result<(), StoreError>;

    /// Clients cached as reaching one resource
    async fn resource_associated_clients(&mut self, id: SiteResourceId) -> Result<Vec<ClientId>, StoreError>;

    /// Resources cached as reachable by one client
    async fn resources_associated_with_client(&mut self, client_id: ClientId) -> Result<Vec<SiteResourceId>, StoreError>;

    async fn insert_resource_associations(&mut self, rows: &[ClientSiteResourceAssociation]) -> Result<(), StoreError>;

    async fn delete_resource_associations(&mut self, rows: &[ClientSiteResourceAssociation]) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
