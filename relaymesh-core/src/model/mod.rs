//! Control plane data model

mod entities;
mod ids;
pub mod net;

pub use entities::{
    Client, ClientAgent, ClientSiteAssociation, ClientSiteResourceAssociation, ClientSiteResourceGrant, ExitNode,
    ExitNodeOrgLink, ExitNodeType, RoleMembership, RoleSiteResourceGrant, Site, SiteAgent, SiteResource,
    UserSiteResourceGrant,
};
pub use ids::{AgentId, ClientId, ExitNodeId, OrgId, RoleId, SiteId, SiteResourceId, UserId};
