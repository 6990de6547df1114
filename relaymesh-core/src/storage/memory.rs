//! In-memory implementation of every storage seam
//!
//! Transactions work on a private copy of the state and replay their writes
//! onto the shared state at commit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ExitNodeStore, MeshStore, MeshTransaction, SiteLink, StoreError};
use crate::model::{
    AgentId, Client, ClientAgent, ClientId, ClientSiteAssociation, ClientSiteResourceAssociation,
    ClientSiteResourceGrant, ExitNode, ExitNodeId, ExitNodeOrgLink, OrgId, RoleId, RoleMembership,
    RoleSiteResourceGrant, Site, SiteAgent, SiteId, SiteResource, SiteResourceId, UserId, UserSiteResourceGrant,
};

/// Complete control plane state, serializable as JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSnapshot {
    pub exit_nodes: Vec<ExitNode>,
    pub exit_node_orgs: Vec<ExitNodeOrgLink>,
    pub sites: Vec<Site>,
    pub clients: Vec<Client>,
    pub site_resources: Vec<SiteResource>,
    pub role_grants: Vec<RoleSiteResourceGrant>,
    pub user_grants: Vec<UserSiteResourceGrant>,
    pub client_grants: Vec<ClientSiteResourceGrant>,
    pub role_memberships: Vec<RoleMembership>,
    pub site_agents: Vec<SiteAgent>,
    pub client_agents: Vec<ClientAgent>,
    pub associations: Vec<ClientSiteAssociation>,
    pub resource_associations: Vec<ClientSiteResourceAssociation>,
}

impl MeshSnapshot {
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::Snapshot(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Snapshot(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn to_json_pretty(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Snapshot(e.to_string()))
    }

    fn site(&self, id: SiteId) -> Option<&Site> {
        self.sites.iter().find(|s| s.id == id)
    }

    fn exit_node(&self, id: ExitNodeId) -> Option<&ExitNode> {
        self.exit_nodes.iter().find(|n| n.id == id)
    }

    fn insert_association(&mut self, row: &ClientSiteAssociation) {
        let exists = self
            .associations
            .iter()
            .any(|a| a.client_id == row.client_id && a.site_id == row.site_id);
        if !exists {
            self.associations.push(row.clone());
        }
    }

    fn delete_association(&mut self, client_id: ClientId, site_id: SiteId) {
        self.associations.retain(|a| !(a.client_id == client_id && a.site_id == site_id));
    }

    fn apply(&mut self, write: &PendingWrite) {
        match write {
            PendingWrite::Insert(rows) => rows.iter().for_each(|row| self.insert_association(row)),
            PendingWrite::Delete(pairs) => pairs.iter().for_each(|(c, s)| self.delete_association(*c, *s)),
            PendingWrite::InsertResources(rows) => {
                for row in rows {
                    if !self.resource_associations.contains(row) {
                        self.resource_associations.push(row.clone());
                    }
                }
            }
            PendingWrite::DeleteResources(rows) => self.resource_associations.retain(|a| !rows.contains(a)),
        }
    }
}

fn collect<T: Ord>(items: impl Iterator<Item = T>) -> Vec<T> {
    items.collect::<BTreeSet<_>>().into_iter().collect()
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(Vec<ClientSiteAssociation>),
    Delete(Vec<(ClientId, SiteId)>),
    InsertResources(Vec<ClientSiteResourceAssociation>),
    DeleteResources(Vec<ClientSiteResourceAssociation>),
}

/// Process-local store backed by a [`MeshSnapshot`]
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MeshSnapshot>>,
    fail_commits: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: MeshSnapshot) -> Self {
        Self { state: Arc::new(Mutex::new(snapshot)), fail_commits: Arc::default() }
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> MeshSnapshot {
        self.state.lock().await.clone()
    }

    /// Mutate the state directly, outside any transaction
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut MeshSnapshot),
    {
        f(&mut *self.state.lock().await);
    }

    /// Make every subsequent commit fail
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Association rows of a site, by client
    pub async fn associated_clients_of(&self, site_id: SiteId) -> Vec<ClientId> {
        let state = self.state.lock().await;
        collect(state.associations.iter().filter(|a| a.site_id == site_id).map(|a| a.client_id))
    }

    /// Resource association rows of a resource, by client
    pub async fn resource_clients_of(&self, id: SiteResourceId) -> Vec<ClientId> {
        let state = self.state.lock().await;
        collect(
            state
                .resource_associations
                .iter()
                .filter(|a| a.site_resource_id == id)
                .map(|a| a.client_id),
        )
    }
}

#[async_trait]
impl ExitNodeStore for InMemoryStore {
    async fn list_exit_nodes(&self) -> Result<Vec<ExitNode>, StoreError> {
        Ok(self.state.lock().await.exit_nodes.clone())
    }

    async fn find_exit_node(&self, id: ExitNodeId) -> Result<Option<ExitNode>, StoreError> {
        Ok(self.state.lock().await.exit_node(id).cloned())
    }

    async fn exit_nodes_linked_to(&self, org_id: &OrgId) -> Result<Vec<ExitNodeId>, StoreError> {
        let state = self.state.lock().await;
        Ok(collect(
            state.exit_node_orgs.iter().filter(|l| &l.org_id == org_id).map(|l| l.exit_node_id),
        ))
    }

    async fn is_linked(&self, exit_node_id: ExitNodeId, org_id: &OrgId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .exit_node_orgs
            .iter()
            .any(|l| l.exit_node_id == exit_node_id && &l.org_id == org_id))
    }

    async fn count_online_sites(&self, exit_node_id: ExitNodeId) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .iter()
            .filter(|s| s.online && s.exit_node_id == Some(exit_node_id))
            .count() as u64)
    }

    async fn set_exit_node_online(
        &self,
        exit_node_id: ExitNodeId,
        online: bool,
        last_ping: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(node) = state.exit_nodes.iter_mut().find(|n| n.id == exit_node_id) {
            node.online = online;
            if last_ping.is_some() {
                node.last_ping = last_ping;
            }
        }
        Ok(())
    }

    async fn find_site(&self, site_id: SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self.state.lock().await.site(site_id).cloned())
    }
}

#[async_trait]
impl MeshStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn MeshTransaction>, StoreError> {
        let working = self.state.lock().await.clone();
        Ok(Box::new(InMemoryTransaction {
            working,
            writes: Vec::new(),
            shared: Arc::clone(&self.state),
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        }))
    }

    async fn exit_node(&self, id: ExitNodeId) -> Result<Option<ExitNode>, StoreError> {
        Ok(self.state.lock().await.exit_node(id).cloned())
    }

    async fn site_agent(&self, site_id: SiteId) -> Result<Option<AgentId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.site_agents.iter().find(|a| a.site_id == site_id).map(|a| a.agent_id.clone()))
    }

    async fn client_agent(&self, client_id: ClientId) -> Result<Option<AgentId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .client_agents
            .iter()
            .find(|a| a.client_id == client_id)
            .map(|a| a.agent_id.clone()))
    }

    async fn site_links_for_client(&self, client_id: ClientId) -> Result<Vec<SiteLink>, StoreError> {
        let state = self.state.lock().await;
        let mut links: Vec<SiteLink> = state
            .associations
            .iter()
            .filter(|a| a.client_id == client_id)
            .filter_map(|association| {
                let site = state.site(association.site_id)?.clone();
                let exit_node = site.exit_node_id.and_then(|id| state.exit_node(id)).cloned();
                Some(SiteLink { site, association: association.clone(), exit_node })
            })
            .collect();
        links.sort_by_key(|l| l.site.id);
        Ok(links)
    }
}

struct InMemoryTransaction {
    working: MeshSnapshot,
    writes: Vec<PendingWrite>,
    shared: Arc<Mutex<MeshSnapshot>>,
    fail_commit: bool,
}

#[async_trait]
impl MeshTransaction for InMemoryTransaction {
    async fn site_resource(&mut self, id: SiteResourceId) -> Result<Option<SiteResource>, StoreError> {
        Ok(self.working.site_resources.iter().find(|r| r.id == id).cloned())
    }

    async fn site(&mut self, id: SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self.working.site(id).cloned())
    }

    async fn sites(&mut self, ids: &[SiteId]) -> Result<Vec<Site>, StoreError> {
        Ok(self.working.sites.iter().filter(|s| ids.contains(&s.id)).cloned().collect())
    }

    async fn client(&mut self, id: ClientId) -> Result<Option<Client>, StoreError> {
        Ok(self.working.clients.iter().find(|c| c.id == id).cloned())
    }

    async fn clients(&mut self, ids: &[ClientId]) -> Result<Vec<Client>, StoreError> {
        Ok(self.working.clients.iter().filter(|c| ids.contains(&c.id)).cloned().collect())
    }

    async fn site_resources(&mut self, ids: &[SiteResourceId]) -> Result<Vec<SiteResource>, StoreError> {
        Ok(self.working.site_resources.iter().filter(|r| ids.contains(&r.id)).cloned().collect())
    }

    async fn resources_on_site(&mut self, site_id: SiteId) -> Result<Vec<SiteResource>, StoreError> {
        let mut resources: Vec<SiteResource> =
            self.working.site_resources.iter().filter(|r| r.site_id == site_id).cloned().collect();
        resources.sort_by_key(|r| r.id);
        Ok(resources)
    }

    async fn users_granted(&mut self, resource_ids: &[SiteResourceId]) -> Result<Vec<UserId>, StoreError> {
        Ok(collect(
            self.working
                .user_grants
                .iter()
                .filter(|g| resource_ids.contains(&g.site_resource_id))
                .map(|g| g.user_id.clone()),
        ))
    }

    async fn roles_granted(&mut self, resource_ids: &[SiteResourceId]) -> Result<Vec<RoleId>, StoreError> {
        Ok(collect(
            self.working
                .role_grants
                .iter()
                .filter(|g| resource_ids.contains(&g.site_resource_id))
                .map(|g| g.role_id),
        ))
    }

    async fn clients_granted(&mut self, resource_ids: &[SiteResourceId]) -> Result<Vec<ClientId>, StoreError> {
        Ok(collect(
            self.working
                .client_grants
                .iter()
                .filter(|g| resource_ids.contains(&g.site_resource_id))
                .map(|g| g.client_id),
        ))
    }

    async fn role_members(&mut self, role_ids: &[RoleId]) -> Result<Vec<UserId>, StoreError> {
        Ok(collect(
            self.working
                .role_memberships
                .iter()
                .filter(|m| role_ids.contains(&m.role_id))
                .map(|m| m.user_id.clone()),
        ))
    }

    async fn roles_of_user(&mut self, org_id: &OrgId, user_id: &UserId) -> Result<Vec<RoleId>, StoreError> {
        Ok(collect(
            self.working
                .role_memberships
                .iter()
                .filter(|m| &m.org_id == org_id && &m.user_id == user_id)
                .map(|m| m.role_id),
        ))
    }

    async fn resources_granted_to_user(&mut self, user_id: &UserId) -> Result<Vec<SiteResourceId>, StoreError> {
        Ok(collect(
            self.working
                .user_grants
                .iter()
                .filter(|g| &g.user_id == user_id)
                .map(|g| g.site_resource_id),
        ))
    }

    async fn resources_granted_to_roles(&mut self, role_ids: &[RoleId]) -> Result<Vec<SiteResourceId>, StoreError> {
        Ok(collect(
            self.working
                .role_grants
                .iter()
                .filter(|g| role_ids.contains(&g.role_id))
                .map(|g| g.site_resource_id),
        ))
    }

    async fn resources_granted_to_client(&mut self, client_id: ClientId) -> Result<Vec<SiteResourceId>, StoreError> {
        Ok(collect(
            self.working
                .client_grants
                .iter()
                .filter(|g| g.client_id == client_id)
                .map(|g| g.site_resource_id),
        ))
    }

    async fn clients_of_users(&mut self, org_id: &OrgId, user_ids: &[UserId]) -> Result<Vec<ClientId>, StoreError> {
        Ok(collect(
            self.working
                .clients
                .iter()
                .filter(|c| &c.org_id == org_id)
                .filter(|c| c.user_id.as_ref().map_or(false, |u| user_ids.contains(u)))
                .map(|c| c.id),
        ))
    }

    async fn associated_clients(&mut self, site_id: SiteId) -> Result<Vec<ClientId>, StoreError> {
        Ok(collect(
            self.working
                .associations
                .iter()
                .filter(|a| a.site_id == site_id)
                .map(|a| a.client_id),
        ))
    }

    async fn associated_sites(&mut self, client_id: ClientId) -> Result<Vec<SiteId>, StoreError> {
        Ok(collect(
            self.working
                .associations
                .iter()
                .filter(|a| a.client_id == client_id)
                .map(|a| a.site_id),
        ))
    }

    async fn insert_associations(&mut self, rows: &[ClientSiteAssociation]) -> Result<(), StoreError> {
        let write = PendingWrite::Insert(rows.to_vec());
        self.working.apply(&write);
        self.writes.push(write);
        Ok(())
    }

    async fn delete_associations(&mut self, pairs: &[(ClientId, SiteId)]) -> Result<(), StoreError> {
        let write = PendingWrite::Delete(pairs.to_vec());
        self.working.apply(&write);
        self.writes.push(write);
        Ok(())
    }

    async fn resource_associated_clients(&mut self, id: SiteResourceId) -> Result<Vec<ClientId>, StoreError> {
        Ok(collect(
            self.working
                .resource_associations
                .iter()
                .filter(|a| a.site_resource_id == id)
                .map(|a| a.client_id),
        ))
    }

    async fn resources_associated_with_client(
        &mut self,
        client_id: ClientId,
    ) -> Result<Vec<SiteResourceId>, StoreError> {
        Ok(collect(
            self.working
                .resource_associations
                .iter()
                .filter(|a| a.client_id == client_id)
                .map(|a| a.site_resource_id),
        ))
    }

    async fn insert_resource_associations(
        &mut self,
        rows: &[ClientSiteResourceAssociation],
    ) -> Result<(), StoreError> {
        let write = PendingWrite::InsertResources(rows.to_vec());
        self.working.apply(&write);
        self.writes.push(write);
        Ok(())
    }

    async fn delete_resource_associations(
        &mut self,
        rows: &[ClientSiteResourceAssociation],
    ) -> Result<(), StoreError> {
        let write = PendingWrite::DeleteResources(rows.to_vec());
        self.working.apply(&write);
        self.writes.push(write);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fail_commit {
            return Err(StoreError::Commit("commit rejected by store".to_string()));
        }
        let mut shared = self.shared.lock().await;
        for write in &self.writes {
            shared.apply(write);
        }
        debug!(writes = self.writes.len(), "In-memory transaction committed");
        Ok(())
    }
}
