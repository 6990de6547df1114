//! Client/site association reconciliation
//!
//! Grants are the source of truth. Association rows cache which clients may
//! reach which sites, and resource association rows cache which resources
//! behind a site each client may reach. A reconcile recomputes the entitled
//! sets, writes the difference in one transaction, and only after the commit
//! tells the affected site and client agents about it.
//!
//! Commands go out in two batches, every site agent first and then every
//! client agent, so a site is ready to accept a client before the client
//! starts talking to it. A failed command is logged and counted; the rows
//! stay committed and the next reconcile or agent re-registration repairs it.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::destinations::DestinationPropagator;
use super::rpc::{
    send_peer_command, AddPeerRequest, AgentTarget, DeletePeerRequest, PeerCommand, PeerRpcDispatcher,
    ProxyTargetsRequest, RemoteSubnetsRequest, SubnetProxyTarget,
};
use super::types::{MeshError, ReconcileReport, Unprovisioned};
use crate::config::{ReconcilerConfig, RelayStrategy};
use crate::metrics;
use crate::model::net::host_cidr;
use crate::model::{
    Client, ClientId, ClientSiteAssociation, ClientSiteResourceAssociation, ExitNode, OrgId, Site, SiteId,
    SiteResource, SiteResourceId,
};
use crate::storage::{MeshStore, MeshTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Add,
    Remove,
}

/// Site that can receive peer commands
struct ReadySite {
    site: Site,
    exit_node: ExitNode,
    public_key: String,
    target: AgentTarget,
}

/// Client that can receive peer commands
struct ReadyClient {
    client_id: ClientId,
    public_key: String,
    subnet: String,
    target: AgentTarget,
}

struct ResourceEntitlement {
    resource: SiteResource,
    clients: BTreeSet<ClientId>,
}

/// What one reconcile changed between a site and its clients
struct SiteDelta {
    site: Site,
    peers: Vec<(ClientId, Change)>,
    resources: Vec<(ClientId, SiteResource, Change)>,
    /// Resources on the site each affected client is still entitled to
    entitled: BTreeMap<ClientId, Vec<SiteResource>>,
}

impl SiteDelta {
    fn peer_change(&self, client_id: ClientId) -> Option<Change> {
        self.peers.iter().find(|(c, _)| *c == client_id).map(|(_, change)| *change)
    }

    fn remote_subnets(&self, client_id: ClientId) -> BTreeSet<String> {
        self.entitled
            .get(&client_id)
            .into_iter()
            .flatten()
            .filter_map(SiteResource::remote_subnet)
            .collect()
    }
}

#[derive(Default)]
struct PeerPlan {
    site_batch: Vec<(AgentTarget, PeerCommand)>,
    client_batch: Vec<(AgentTarget, PeerCommand)>,
    propagate: BTreeSet<ClientId>,
}

pub struct PeerAssociationReconciler {
    store: Arc<dyn MeshStore>,
    peers: Arc<dyn PeerRpcDispatcher>,
    propagator: Arc<DestinationPropagator>,
    config: ReconcilerConfig,
}

impl PeerAssociationReconciler {
    pub fn new(
        store: Arc<dyn MeshStore>,
        peers: Arc<dyn PeerRpcDispatcher>,
        propagator: Arc<DestinationPropagator>,
        config: ReconcilerConfig,
    ) -> Self {
        Self { store, peers, propagator, config }
    }

    /// Clients entitled to reach `site`
    ///
    /// A client is entitled when, for any resource hosted on the site, it is
    /// granted the resource directly, or its owning user is granted it
    /// directly or through a role.
    pub async fn entitled_clients_for_site(
        tx: &mut dyn MeshTransaction,
        site: &Site,
    ) -> Result<BTreeSet<ClientId>, MeshError> {
        let resources: Vec<SiteResourceId> = tx.resources_on_site(site.id).await?.iter().map(|r| r.id).collect();
        Self::entitled_clients(tx, &site.org_id, &resources).await
    }

    async fn entitled_clients(
        tx: &mut dyn MeshTransaction,
        org_id: &OrgId,
        resources: &[SiteResourceId],
    ) -> Result<BTreeSet<ClientId>, MeshError> {
        if resources.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut users: BTreeSet<_> = tx.users_granted(resources).await?.into_iter().collect();
        let roles = tx.roles_granted(resources).await?;
        if !roles.is_empty() {
            users.extend(tx.role_members(&roles).await?);
        }

        let mut clients: BTreeSet<ClientId> = tx.clients_granted(resources).await?.into_iter().collect();
        if !users.is_empty() {
            let users: Vec<_> = users.into_iter().collect();
            clients.extend(tx.clients_of_users(org_id, &users).await?);
        }
        Ok(clients)
    }

    /// Every resource on `site` with the clients entitled to it
    async fn entitlements_on_site(
        tx: &mut dyn MeshTransaction,
        site: &Site,
    ) -> Result<Vec<ResourceEntitlement>, MeshError> {
        let mut entitlements = Vec::new();
        for resource in tx.resources_on_site(site.id).await? {
            let clients = Self::entitled_clients(tx, &site.org_id, &[resource.id]).await?;
            entitlements.push(ResourceEntitlement { resource, clients });
        }
        Ok(entitlements)
    }

    /// Resources `client` is entitled to reach, on sites of its organization
    pub async fn entitled_resources_for_client(
        tx: &mut dyn MeshTransaction,
        client: &Client,
    ) -> Result<Vec<SiteResource>, MeshError> {
        let mut ids: BTreeSet<SiteResourceId> = tx.resources_granted_to_client(client.id).await?.into_iter().collect();
        if let Some(user_id) = &client.user_id {
            ids.extend(tx.resources_granted_to_user(user_id).await?);
            let roles = tx.roles_of_user(&client.org_id, user_id).await?;
            if !roles.is_empty() {
                ids.extend(tx.resources_granted_to_roles(&roles).await?);
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<_> = ids.into_iter().collect();
        let resources = tx.site_resources(&ids).await?;
        let site_ids: Vec<SiteId> = resources.iter().map(|r| r.site_id).collect::<BTreeSet<_>>().into_iter().collect();
        let in_org: BTreeSet<SiteId> = tx
            .sites(&site_ids)
            .await?
            .into_iter()
            .filter(|s| s.org_id == client.org_id)
            .map(|s| s.id)
            .collect();
        Ok(resources.into_iter().filter(|r| in_org.contains(&r.site_id)).collect())
    }

    /// Sites `client` is entitled to reach, within its organization
    pub async fn entitled_sites_for_client(
        tx: &mut dyn MeshTransaction,
        client: &Client,
    ) -> Result<BTreeSet<SiteId>, MeshError> {
        let resources = Self::entitled_resources_for_client(tx, client).await?;
        Ok(resources.iter().map(|r| r.site_id).collect())
    }

    /// Bring the site hosting `site_resource_id` in line with its grants
    pub async fn reconcile(&self, site_resource_id: SiteResourceId) -> Result<ReconcileReport, MeshError> {
        let result = self.reconcile_site_resource(site_resource_id).await;
        metrics::reconcile_run(outcome(&result));
        result
    }

    async fn reconcile_site_resource(&self, site_resource_id: SiteResourceId) -> Result<ReconcileReport, MeshError> {
        let mut tx = self.store.begin().await?;
        let resource = tx
            .site_resource(site_resource_id)
            .await?
            .ok_or_else(|| MeshError::not_found("site resource", site_resource_id))?;
        let site = tx
            .site(resource.site_id)
            .await?
            .ok_or_else(|| MeshError::not_found("site", resource.site_id))?;

        let entitlements = Self::entitlements_on_site(tx.as_mut(), &site).await?;
        let entitled: BTreeSet<ClientId> = entitlements.iter().flat_map(|e| e.clients.iter().copied()).collect();
        let current: BTreeSet<ClientId> = tx.associated_clients(site.id).await?.into_iter().collect();

        let to_add: Vec<ClientId> = entitled.difference(&current).copied().collect();
        let to_remove: Vec<ClientId> = current.difference(&entitled).copied().collect();

        // Resource rows are only maintained for the resource being reconciled
        let granted = entitlements
            .iter()
            .find(|e| e.resource.id == resource.id)
            .map(|e| e.clients.clone())
            .unwrap_or_default();
        let cached: BTreeSet<ClientId> = tx.resource_associated_clients(resource.id).await?.into_iter().collect();
        let grant_add: Vec<ClientId> = granted.difference(&cached).copied().collect();
        let grant_remove: Vec<ClientId> = cached.difference(&granted).copied().collect();

        let mut report = ReconcileReport {
            added: to_add.iter().map(|c| (*c, site.id)).collect(),
            removed: to_remove.iter().map(|c| (*c, site.id)).collect(),
            resources_added: grant_add.iter().map(|c| (*c, resource.id)).collect(),
            resources_removed: grant_remove.iter().map(|c| (*c, resource.id)).collect(),
            ..Default::default()
        };
        if report.is_noop() {
            debug!(site_resource_id = %site_resource_id, site_id = %site.id, "Associations already up to date");
            return Ok(report);
        }

        let changed: Vec<ClientId> = to_add
            .iter()
            .chain(&to_remove)
            .chain(&grant_add)
            .chain(&grant_remove)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let clients: BTreeMap<ClientId, Client> =
            tx.clients(&changed).await?.into_iter().map(|c| (c.id, c)).collect();

        self.write_site_rows(tx.as_mut(), site.id, &to_add, &to_remove).await?;
        let rows = |ids: &[ClientId]| -> Vec<ClientSiteResourceAssociation> {
            ids.iter()
                .map(|client_id| ClientSiteResourceAssociation { client_id: *client_id, site_resource_id: resource.id })
                .collect()
        };
        if !grant_add.is_empty() {
            tx.insert_resource_associations(&rows(&grant_add)).await?;
        }
        if !grant_remove.is_empty() {
            tx.delete_resource_associations(&rows(&grant_remove)).await?;
        }
        tx.commit().await?;

        info!(
            site_resource_id = %site_resource_id,
            site_id = %site.id,
            added = to_add.len(),
            removed = to_remove.len(),
            resources_added = grant_add.len(),
            resources_removed = grant_remove.len(),
            "Associations updated"
        );
        metrics::association_changes(to_add.len(), to_remove.len());

        let entitled_resources: BTreeMap<ClientId, Vec<SiteResource>> = changed
            .iter()
            .map(|client_id| {
                let resources: Vec<SiteResource> = entitlements
                    .iter()
                    .filter(|e| e.clients.contains(client_id))
                    .map(|e| e.resource.clone())
                    .collect();
                (*client_id, resources)
            })
            .collect();
        let delta = SiteDelta {
            site,
            peers: to_add
                .iter()
                .map(|c| (*c, Change::Add))
                .chain(to_remove.iter().map(|c| (*c, Change::Remove)))
                .collect(),
            resources: grant_add
                .iter()
                .map(|c| (*c, resource.clone(), Change::Add))
                .chain(grant_remove.iter().map(|c| (*c, resource.clone(), Change::Remove)))
                .collect(),
            entitled: entitled_resources,
        };

        let ready_site = match self.ready_site(delta.site.clone()).await? {
            Ok(ready) => ready,
            Err(reason) => {
                warn!(
                    site_resource_id = %site_resource_id,
                    reason = %reason,
                    "Site not provisioned, peers not updated"
                );
                report.unprovisioned = Some(reason);
                return Ok(report);
            }
        };

        let ready_clients = self.ready_clients(clients.values()).await?;
        let mut plan = PeerPlan::default();
        self.plan_site(&mut plan, &ready_site, &delta, &clients, &ready_clients, &mut report);
        self.execute(plan, &mut report).await;
        Ok(report)
    }

    /// Bring every association of `client_id` in line with its grants
    pub async fn reconcile_client(&self, client_id: ClientId) -> Result<ReconcileReport, MeshError> {
        let result = self.reconcile_client_sites(client_id).await;
        metrics::reconcile_run(outcome(&result));
        result
    }

    async fn reconcile_client_sites(&self, client_id: ClientId) -> Result<ReconcileReport, MeshError> {
        let mut tx = self.store.begin().await?;
        let client = tx
            .client(client_id)
            .await?
            .ok_or_else(|| MeshError::not_found("client", client_id))?;

        let resources = Self::entitled_resources_for_client(tx.as_mut(), &client).await?;
        let entitled: BTreeSet<SiteId> = resources.iter().map(|r| r.site_id).collect();
        let current: BTreeSet<SiteId> = tx.associated_sites(client_id).await?.into_iter().collect();

        let to_add: Vec<SiteId> = entitled.difference(&current).copied().collect();
        let to_remove: Vec<SiteId> = current.difference(&entitled).copied().collect();

        let granted: BTreeSet<SiteResourceId> = resources.iter().map(|r| r.id).collect();
        let cached: BTreeSet<SiteResourceId> =
            tx.resources_associated_with_client(client_id).await?.into_iter().collect();
        let grant_add: Vec<SiteResourceId> = granted.difference(&cached).copied().collect();
        let grant_remove: Vec<SiteResourceId> = cached.difference(&granted).copied().collect();

        let mut report = ReconcileReport {
            added: to_add.iter().map(|s| (client_id, *s)).collect(),
            removed: to_remove.iter().map(|s| (client_id, *s)).collect(),
            resources_added: grant_add.iter().map(|r| (client_id, *r)).collect(),
            resources_removed: grant_remove.iter().map(|r| (client_id, *r)).collect(),
            ..Default::default()
        };
        if report.is_noop() {
            debug!(client_id = %client_id, "Associations already up to date");
            return Ok(report);
        }

        // Revoked resources may already be gone; those only drop their rows
        let revoked = tx.site_resources(&grant_remove).await?;
        let gained: Vec<SiteResource> = resources.iter().filter(|r| grant_add.contains(&r.id)).cloned().collect();
        let changed: Vec<SiteId> = to_add
            .iter()
            .chain(&to_remove)
            .copied()
            .chain(gained.iter().map(|r| r.site_id))
            .chain(revoked.iter().map(|r| r.site_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let sites: BTreeMap<SiteId, Site> = tx.sites(&changed).await?.into_iter().map(|s| (s.id, s)).collect();

        for site_id in &to_add {
            self.write_site_rows(tx.as_mut(), *site_id, &[client_id], &[]).await?;
        }
        for site_id in &to_remove {
            self.write_site_rows(tx.as_mut(), *site_id, &[], &[client_id]).await?;
        }
        let rows = |ids: &[SiteResourceId]| -> Vec<ClientSiteResourceAssociation> {
            ids.iter()
                .map(|resource_id| ClientSiteResourceAssociation { client_id, site_resource_id: *resource_id })
                .collect()
        };
        if !grant_add.is_empty() {
            tx.insert_resource_associations(&rows(&grant_add)).await?;
        }
        if !grant_remove.is_empty() {
            tx.delete_resource_associations(&rows(&grant_remove)).await?;
        }
        tx.commit().await?;

        info!(
            client_id = %client_id,
            added = to_add.len(),
            removed = to_remove.len(),
            resources_added = grant_add.len(),
            resources_removed = grant_remove.len(),
            "Associations updated"
        );
        metrics::association_changes(to_add.len(), to_remove.len());

        let clients = BTreeMap::from([(client_id, client)]);
        let ready_clients = self.ready_clients(clients.values()).await?;
        let mut plan = PeerPlan::default();
        for site_id in changed {
            let peer_change = if to_add.contains(&site_id) {
                Some(Change::Add)
            } else if to_remove.contains(&site_id) {
                Some(Change::Remove)
            } else {
                None
            };
            let Some(site) = sites.get(&site_id) else {
                debug!(site_id = %site_id, "Site row gone, no peers to update");
                if peer_change.is_some() {
                    report.skipped.push((client_id, site_id));
                }
                continue;
            };

            let added = gained.iter().filter(|r| r.site_id == site_id).map(|r| (client_id, r.clone(), Change::Add));
            let dropped = revoked
                .iter()
                .filter(|r| r.site_id == site_id)
                .map(|r| (client_id, r.clone(), Change::Remove));
            let still_entitled: Vec<SiteResource> = resources.iter().filter(|r| r.site_id == site_id).cloned().collect();
            let delta = SiteDelta {
                site: site.clone(),
                peers: peer_change.map(|change| (client_id, change)).into_iter().collect(),
                resources: added.chain(dropped).collect(),
                entitled: BTreeMap::from([(client_id, still_entitled)]),
            };

            match self.ready_site(delta.site.clone()).await? {
                Ok(ready_site) => {
                    self.plan_site(&mut plan, &ready_site, &delta, &clients, &ready_clients, &mut report)
                }
                Err(reason) => {
                    warn!(client_id = %client_id, site_id = %site_id, reason = %reason, "Site not provisioned, skipping");
                    if peer_change.is_some() {
                        report.skipped.push((client_id, site_id));
                    }
                }
            }
        }

        self.execute(plan, &mut report).await;
        Ok(report)
    }

    async fn write_site_rows(
        &self,
        tx: &mut dyn MeshTransaction,
        site_id: SiteId,
        to_add: &[ClientId],
        to_remove: &[ClientId],
    ) -> Result<(), MeshError> {
        if !to_add.is_empty() {
            let rows: Vec<ClientSiteAssociation> = to_add
                .iter()
                .map(|client_id| ClientSiteAssociation { client_id: *client_id, site_id, endpoint: None })
                .collect();
            tx.insert_associations(&rows).await?;
        }
        if !to_remove.is_empty() {
            let pairs: Vec<(ClientId, SiteId)> = to_remove.iter().map(|c| (*c, site_id)).collect();
            tx.delete_associations(&pairs).await?;
        }
        Ok(())
    }

    async fn ready_site(&self, site: Site) -> Result<Result<ReadySite, Unprovisioned>, MeshError> {
        let Some(exit_node_id) = site.exit_node_id else {
            return Ok(Err(Unprovisioned::NoExitNode));
        };
        let Some(exit_node) = self.store.exit_node(exit_node_id).await? else {
            return Ok(Err(Unprovisioned::ExitNodeMissing(exit_node_id)));
        };
        let Some(public_key) = site.public_key.clone().filter(|k| !k.is_empty()) else {
            return Ok(Err(Unprovisioned::NoPublicKey));
        };
        let Some(agent_id) = self.store.site_agent(site.id).await? else {
            return Ok(Err(Unprovisioned::NoAgent));
        };

        let target = AgentTarget::Site { site_id: site.id, agent_id };
        Ok(Ok(ReadySite { site, exit_node, public_key, target }))
    }

    async fn ready_client(&self, client: &Client) -> Result<Option<ReadyClient>, MeshError> {
        let (Some(public_key), Some(subnet)) = (client.public_key.clone(), client.subnet.clone()) else {
            debug!(client_id = %client.id, "Client has no subnet or public key, skipping peers");
            return Ok(None);
        };
        let Some(agent_id) = self.store.client_agent(client.id).await? else {
            warn!(client_id = %client.id, "Client has no agent, skipping peers");
            return Ok(None);
        };

        let target = AgentTarget::Client { client_id: client.id, agent_id };
        Ok(Some(ReadyClient { client_id: client.id, public_key, subnet, target }))
    }

    async fn ready_clients<'a>(
        &self,
        clients: impl Iterator<Item = &'a Client>,
    ) -> Result<BTreeMap<ClientId, ReadyClient>, MeshError> {
        let mut ready = BTreeMap::new();
        for client in clients {
            if let Some(client) = self.ready_client(client).await? {
                ready.insert(client.client_id, client);
            }
        }
        Ok(ready)
    }

    /// Endpoint a client uses to reach the site
    fn client_side_endpoint(&self, site: &ReadySite) -> String {
        let relay = || format!("{}:{}", site.exit_node.endpoint, self.config.relay_port);
        match self.config.relay_strategy {
            RelayStrategy::AlwaysRelay => relay(),
            RelayStrategy::PreferDirect => site.site.endpoint.clone().filter(|e| !e.is_empty()).unwrap_or_else(relay),
        }
    }

    fn plan_site(
        &self,
        plan: &mut PeerPlan,
        site: &ReadySite,
        delta: &SiteDelta,
        clients: &BTreeMap<ClientId, Client>,
        ready: &BTreeMap<ClientId, ReadyClient>,
        report: &mut ReconcileReport,
    ) {
        for (client_id, change) in &delta.peers {
            match ready.get(client_id) {
                Some(client) => {
                    let subnets = delta.remote_subnets(*client_id).into_iter().collect();
                    self.plan_peer_change(plan, site, client, *change, subnets);
                }
                None => report.skipped.push((*client_id, site.site.id)),
            }
        }
        self.plan_resource_changes(plan, site, delta, clients, ready);
    }

    fn plan_peer_change(
        &self,
        plan: &mut PeerPlan,
        site: &ReadySite,
        client: &ReadyClient,
        change: Change,
        remote_subnets: Vec<String>,
    ) {
        match change {
            Change::Remove => {
                plan.site_batch.push((
                    site.target.clone(),
                    PeerCommand::Delete(DeletePeerRequest { public_key: client.public_key.clone() }),
                ));
                plan.client_batch.push((
                    client.target.clone(),
                    PeerCommand::Delete(DeletePeerRequest { public_key: site.public_key.clone() }),
                ));
            }
            Change::Add => {
                // New rows carry no observed client endpoint, so the site waits
                // for the client to arrive through the relay.
                plan.site_batch.push((
                    site.target.clone(),
                    PeerCommand::Add(AddPeerRequest {
                        public_key: client.public_key.clone(),
                        allowed_ips: vec![host_cidr(&client.subnet)],
                        endpoint: String::new(),
                        server_ip: None,
                        server_port: None,
                    }),
                ));
                plan.client_batch.push((
                    client.target.clone(),
                    PeerCommand::Add(AddPeerRequest {
                        public_key: site.public_key.clone(),
                        allowed_ips: remote_subnets,
                        endpoint: self.client_side_endpoint(site),
                        server_ip: site.site.address.clone(),
                        server_port: site.site.listen_port,
                    }),
                ));
            }
        }
        plan.propagate.insert(client.client_id);
    }

    /// Proxy targets on the site gateway and remote subnets on clients that
    /// stay peered with it
    fn plan_resource_changes(
        &self,
        plan: &mut PeerPlan,
        site: &ReadySite,
        delta: &SiteDelta,
        clients: &BTreeMap<ClientId, Client>,
        ready: &BTreeMap<ClientId, ReadyClient>,
    ) {
        let mut add_targets = BTreeSet::new();
        let mut remove_targets = BTreeSet::new();
        let mut add_subnets: BTreeMap<ClientId, BTreeSet<String>> = BTreeMap::new();
        let mut remove_subnets: BTreeMap<ClientId, BTreeSet<String>> = BTreeMap::new();

        for (client_id, resource, change) in &delta.resources {
            let Some(dest_prefix) = resource.remote_subnet() else {
                debug!(site_resource_id = %resource.id, "Resource has no routable destination");
                continue;
            };
            // A sibling resource with the same destination keeps the route alive
            if *change == Change::Remove && delta.remote_subnets(*client_id).contains(&dest_prefix) {
                continue;
            }

            if let Some(subnet) = clients.get(client_id).and_then(|c| c.subnet.as_deref()) {
                let target = SubnetProxyTarget { source_prefix: host_cidr(subnet), dest_prefix: dest_prefix.clone() };
                match change {
                    Change::Add => add_targets.insert(target),
                    Change::Remove => remove_targets.insert(target),
                };
            }
            // add_peer and delete_peer already carry the client's subnets
            if delta.peer_change(*client_id).is_none() {
                let subnets = match change {
                    Change::Add => &mut add_subnets,
                    Change::Remove => &mut remove_subnets,
                };
                subnets.entry(*client_id).or_default().insert(dest_prefix);
            }
        }

        if !add_targets.is_empty() {
            let request = ProxyTargetsRequest { targets: add_targets.into_iter().collect() };
            plan.site_batch.push((site.target.clone(), PeerCommand::AddTargets(request)));
        }
        if !remove_targets.is_empty() {
            let request = ProxyTargetsRequest { targets: remove_targets.into_iter().collect() };
            plan.site_batch.push((site.target.clone(), PeerCommand::RemoveTargets(request)));
        }

        let client_updates = add_subnets
            .into_iter()
            .map(|(c, s)| (c, s, Change::Add))
            .chain(remove_subnets.into_iter().map(|(c, s)| (c, s, Change::Remove)));
        for (client_id, subnets, change) in client_updates {
            let Some(client) = ready.get(&client_id) else {
                continue;
            };
            let request = RemoteSubnetsRequest {
                public_key: site.public_key.clone(),
                remote_subnets: subnets.into_iter().collect(),
            };
            let command = match change {
                Change::Add => PeerCommand::AddRemoteSubnets(request),
                Change::Remove => PeerCommand::RemoveRemoteSubnets(request),
            };
            plan.client_batch.push((client.target.clone(), command));
        }
    }

    async fn execute(&self, plan: PeerPlan, report: &mut ReconcileReport) {
        for batch in [plan.site_batch, plan.client_batch] {
            let sends = batch.iter().map(|(target, command)| async move {
                let result = send_peer_command(self.peers.as_ref(), target, command, self.config.rpc_timeout).await;
                if let Err(e) = &result {
                    warn!(target = %target, method = command.method(), error = %e, "Peer command failed");
                }
                result.is_ok()
            });
            for ok in join_all(sends).await {
                report.rpcs_sent += 1;
                if !ok {
                    report.rpcs_failed += 1;
                }
            }
        }

        let updates = plan
            .propagate
            .iter()
            .map(|client_id| async move { (*client_id, self.propagator.update_destinations(*client_id).await) });
        for (client_id, result) in join_all(updates).await {
            match result {
                Ok(propagation) => {
                    report.destination_updates += propagation.sent;
                    report.destination_failures += propagation.failed;
                }
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "Destination propagation failed");
                    report.destination_failures += 1;
                }
            }
        }
    }
}

fn outcome(result: &Result<ReconcileReport, MeshError>) -> &'static str {
    match result {
        Ok(report) if report.is_noop() => "noop",
        Ok(report) if report.unprovisioned.is_some() => "unprovisioned",
        Ok(report) if report.rpcs_failed > 0 || report.destination_failures > 0 => "partial",
        Ok(_) => "ok",
        Err(MeshError::NotFound { .. }) => "not_found",
        Err(MeshError::Store(_)) => "store_error",
    }
}
