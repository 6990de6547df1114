//! Builders for control plane state used across tests

use crate::model::{
    Client, ClientAgent, ClientId, ClientSiteAssociation, ClientSiteResourceGrant, ExitNode, ExitNodeId,
    ExitNodeType, OrgId, RoleId, RoleMembership, RoleSiteResourceGrant, Site, SiteAgent, SiteId, SiteResource,
    SiteResourceId, UserId, UserSiteResourceGrant, AgentId,
};
use crate::storage::MeshSnapshot;

pub const FIXTURE_ORG: &str = "acme";

/// Online exit node `exit-<id>.example.com` with a control API
pub fn exit_node(id: u64, node_type: ExitNodeType) -> ExitNode {
    ExitNode {
        id: ExitNodeId(id),
        name: format!("exit-{}", id),
        endpoint: format!("exit-{}.example.com", id),
        public_key: format!("exit-{}-key", id),
        listen_port: 51820,
        reachable_at: format!("http://exit-{}.internal:3003", id),
        region: None,
        node_type,
        online: true,
        last_ping: None,
        max_connections: None,
    }
}

/// Bare offline site with no exit node, key or subnet
pub fn site(id: u64, org: &str) -> Site {
    Site {
        id: SiteId(id),
        org_id: OrgId::new(org),
        name: format!("site-{}", id),
        exit_node_id: None,
        subnet: None,
        public_key: None,
        listen_port: None,
        endpoint: None,
        address: None,
        online: false,
    }
}

/// Fully provisioned site `id` behind shared exit node `id`
pub fn provisioned_site(id: u64, org: &str) -> Site {
    Site {
        exit_node_id: Some(ExitNodeId(id)),
        subnet: Some(format!("100.90.128.{}/24", id)),
        public_key: Some(format!("site-{}-key", id)),
        listen_port: Some(51820),
        address: Some(format!("100.90.128.{}", id)),
        online: true,
        ..site(id, org)
    }
}

pub fn client(id: u64, org: &str, user: Option<&str>) -> Client {
    Client {
        id: ClientId(id),
        org_id: OrgId::new(org),
        name: format!("client-{}", id),
        user_id: user.map(UserId::new),
        public_key: Some(format!("client-{}-key", id)),
        subnet: Some(format!("100.90.129.{}/16", id)),
    }
}

/// Fluent builder for a [`MeshSnapshot`] in the `acme` organization
///
/// Sites get a shared exit node and a gateway agent; clients get an agent.
#[derive(Debug, Clone, Default)]
pub struct MeshFixture {
    snapshot: MeshSnapshot,
}

impl MeshFixture {
    pub fn new() -> Self {
        Self::default()
    }

    fn org() -> OrgId {
        OrgId::new(FIXTURE_ORG)
    }

    pub fn with_site(mut self, id: u64) -> Self {
        if !self.snapshot.exit_nodes.iter().any(|n| n.id == ExitNodeId(id)) {
            self.snapshot.exit_nodes.push(exit_node(id, ExitNodeType::Shared));
        }
        self.snapshot.sites.push(provisioned_site(id, FIXTURE_ORG));
        self.snapshot.site_agents.push(SiteAgent {
            site_id: SiteId(id),
            agent_id: AgentId::new(format!("site-agent-{}", id)),
        });
        self
    }

    pub fn without_site_agent(mut self, id: u64) -> Self {
        self.snapshot.site_agents.retain(|a| a.site_id != SiteId(id));
        self
    }

    /// Resource with no routable destination
    pub fn with_resource(mut self, id: u64, site_id: u64) -> Self {
        self.snapshot.site_resources.push(SiteResource {
            id: SiteResourceId(id),
            site_id: SiteId(site_id),
            org_id: Self::org(),
            name: format!("resource-{}", id),
            destination: None,
        });
        self
    }

    pub fn with_resource_at(self, id: u64, site_id: u64, destination: &str) -> Self {
        self.with_resource(id, site_id).update(|s| {
            if let Some(resource) = s.site_resources.iter_mut().find(|r| r.id == SiteResourceId(id)) {
                resource.destination = Some(destination.to_string());
            }
        })
    }

    pub fn with_user_client(self, id: u64, user: &str) -> Self {
        self.push_client(client(id, FIXTURE_ORG, Some(user)))
    }

    pub fn with_machine_client(self, id: u64) -> Self {
        self.push_client(client(id, FIXTURE_ORG, None))
    }

    fn push_client(mut self, client: Client) -> Self {
        self.snapshot.client_agents.push(ClientAgent {
            client_id: client.id,
            agent_id: AgentId::new(format!("client-agent-{}", client.id)),
        });
        self.snapshot.clients.push(client);
        self
    }

    pub fn without_client_agent(mut self, id: u64) -> Self {
        self.snapshot.client_agents.retain(|a| a.client_id != ClientId(id));
        self
    }

    pub fn with_role_member(mut self, role: u64, user: &str) -> Self {
        self.snapshot.role_memberships.push(RoleMembership {
            user_id: UserId::new(user),
            role_id: RoleId(role),
            org_id: Self::org(),
        });
        self
    }

    pub fn grant_user(mut self, resource: u64, user: &str) -> Self {
        self.snapshot.user_grants.push(UserSiteResourceGrant {
            user_id: UserId::new(user),
            site_resource_id: SiteResourceId(resource),
        });
        self
    }

    pub fn grant_role(mut self, resource: u64, role: u64) -> Self {
        self.snapshot.role_grants.push(RoleSiteResourceGrant {
            role_id: RoleId(role),
            site_resource_id: SiteResourceId(resource),
        });
        self
    }

    pub fn grant_client(mut self, resource: u64, client: u64) -> Self {
        self.snapshot.client_grants.push(ClientSiteResourceGrant {
            client_id: ClientId(client),
            site_resource_id: SiteResourceId(resource),
        });
        self
    }

    pub fn with_association(self, client: u64, site: u64) -> Self {
        self.with_association_endpoint(client, site, None)
    }

    pub fn with_association_endpoint(mut self, client: u64, site: u64, endpoint: Option<&str>) -> Self {
        self.snapshot.associations.push(ClientSiteAssociation {
            client_id: ClientId(client),
            site_id: SiteId(site),
            endpoint: endpoint.map(String::from),
        });
        self
    }

    /// Arbitrary edit of the state being built
    pub fn update(mut self, f: impl FnOnce(&mut MeshSnapshot)) -> Self {
        f(&mut self.snapshot);
        self
    }

    pub fn build(self) -> MeshSnapshot {
        self.snapshot
    }
}
