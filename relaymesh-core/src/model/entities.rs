//! Persisted entities and grant relations

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, ClientId, ExitNodeId, OrgId, RoleId, SiteId, SiteResourceId, UserId};
use super::net::destination_subnet;

/// Ownership of an exit node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitNodeType {
    /// Shared pool node, usable by every organization in its region
    #[serde(alias = "gerbil")]
    Shared,
    /// Node dedicated to the organizations it is linked to
    #[serde(alias = "remoteExitNode")]
    Dedicated,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ExitNodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitNodeType::Shared => "shared",
            ExitNodeType::Dedicated => "dedicated",
            ExitNodeType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitNode {
    pub id: ExitNodeId,
    pub name: String,
    /// `host[:port]` reachable by sites
    pub endpoint: String,
    pub public_key: String,
    pub listen_port: u16,
    /// Base URL of the node's control API; empty when unknown
    #[serde(default)]
    pub reachable_at: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: ExitNodeType,
    #[serde(default)]
    pub online: bool,
    /// Unix seconds of the last successful ping
    #[serde(default)]
    pub last_ping: Option<u64>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

/// Explicit dedication of an exit node to an organization
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitNodeOrgLink {
    pub exit_node_id: ExitNodeId,
    pub org_id: OrgId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub org_id: OrgId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub exit_node_id: Option<ExitNodeId>,
    /// CIDR of the site's tunnel address
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Direct `host:port` of the site, when hole punching found one
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub org_id: OrgId,
    #[serde(default)]
    pub name: String,
    /// Owning user; machine clients have none
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteResource {
    pub id: SiteResourceId,
    pub site_id: SiteId,
    pub org_id: OrgId,
    #[serde(default)]
    pub name: String,
    /// CIDR or single address reachable behind the site
    #[serde(default)]
    pub destination: Option<String>,
}

impl SiteResource {
    /// Subnet clients route through the site for this resource
    pub fn remote_subnet(&self) -> Option<String> {
        self.destination.as_deref().and_then(destination_subnet)
    }
}

/// Cached pairing of a client with a site
///
/// Derived from grants by the reconciler; never a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientSiteAssociation {
    pub client_id: ClientId,
    pub site_id: SiteId,
    /// Client endpoint observed through hole punching
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Cached pairing of a client with one resource it may reach
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientSiteResourceAssociation {
    pub client_id: ClientId,
    pub site_resource_id: SiteResourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleSiteResourceGrant {
    pub role_id: RoleId,
    pub site_resource_id: SiteResourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSiteResourceGrant {
    pub user_id: UserId,
    pub site_resource_id: SiteResourceId,
}

/// Direct grant of a resource to a machine client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientSiteResourceGrant {
    pub client_id: ClientId,
    pub site_resource_id: SiteResourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleMembership {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub org_id: OrgId,
}

/// Agent identity registered for a site gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteAgent {
    pub site_id: SiteId,
    pub agent_id: AgentId,
}

/// Agent identity registered for a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAgent {
    pub client_id: ClientId,
    pub agent_id: AgentId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_node_type_aliases() {
        let parse = |s: &str| serde_json::from_str::<ExitNodeType>(s).unwrap();
        assert_eq!(parse("\"shared\""), ExitNodeType::Shared);
        assert_eq!(parse("\"gerbil\""), ExitNodeType::Shared);
        assert_eq!(parse("\"remoteExitNode\""), ExitNodeType::Dedicated);
        assert_eq!(parse("\"satellite\""), ExitNodeType::Unknown);
    }

    #[test]
    fn test_site_defaults_when_fields_missing() {
        let site: Site = serde_json::from_str(r#"{"id": 3, "org_id": "acme"}"#).unwrap();
        assert_eq!(site.id, SiteId(3));
        assert!(site.exit_node_id.is_none());
        assert!(!site.online);
    }

    #[test]
    fn test_resource_remote_subnet() {
        let mut resource: SiteResource =
            serde_json::from_str(r#"{"id": 4, "site_id": 1, "org_id": "acme", "destination": "10.1.4.20"}"#).unwrap();
        assert_eq!(resource.remote_subnet().as_deref(), Some("10.1.4.20/32"));

        resource.destination = Some("files.corp.internal".to_string());
        assert_eq!(resource.remote_subnet(), None);
        resource.destination = None;
        assert_eq!(resource.remote_subnet(), None);
    }
}
