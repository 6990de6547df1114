//! Exit node listing, org access checks and liveness

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::probe::OnlineProbe;
use super::selector::ExitNodeSelector;
use super::types::{ExitNodeCandidate, ExitNodeError, ExitNodePingResult, HealthSweep, OrgAccess};
use crate::clock::SharedClock;
use crate::model::{ExitNode, ExitNodeId, ExitNodeType, OrgId, SiteId};
use crate::storage::ExitNodeStore;

/// Which exit nodes an organization may use, and whether they are up
pub struct ExitNodeDirectory {
    store: Arc<dyn ExitNodeStore>,
    probe: Arc<dyn OnlineProbe>,
    selector: ExitNodeSelector,
    region: Option<String>,
    clock: SharedClock,
}

impl ExitNodeDirectory {
    pub fn new(
        store: Arc<dyn ExitNodeStore>,
        probe: Arc<dyn OnlineProbe>,
        selector: ExitNodeSelector,
        region: Option<String>,
        clock: SharedClock,
    ) -> Self {
        Self { store, probe, selector, region, clock }
    }

    pub fn selector(&self) -> &ExitNodeSelector {
        &self.selector
    }

    fn in_region(&self, node: &ExitNode) -> bool {
        match (&node.region, &self.region) {
            (None, _) => true,
            (Some(node_region), Some(region)) => node_region == region,
            (Some(_), None) => false,
        }
    }

    /// Exit nodes usable by `org_id`
    ///
    /// Dedicated nodes linked to the org take precedence; the regional shared
    /// pool is only used when there are none, and never when
    /// `exclude_shared_pool` is set.
    pub async fn list(
        &self,
        org_id: &OrgId,
        filter_online: bool,
        exclude_shared_pool: bool,
    ) -> Result<Vec<ExitNode>, ExitNodeError> {
        let nodes = self.store.list_exit_nodes().await?;
        let linked: HashSet<ExitNodeId> = self.store.exit_nodes_linked_to(org_id).await?.into_iter().collect();
        let usable = |node: &ExitNode| !filter_online || node.online;

        let dedicated: Vec<ExitNode> = nodes
            .iter()
            .filter(|n| n.node_type == ExitNodeType::Dedicated && linked.contains(&n.id) && usable(n))
            .cloned()
            .collect();
        if !dedicated.is_empty() {
            debug!(org_id = %org_id, count = dedicated.len(), "Using dedicated exit nodes");
            return Ok(dedicated);
        }

        let shared: Vec<ExitNode> = if exclude_shared_pool {
            Vec::new()
        } else {
            nodes
                .into_iter()
                .filter(|n| n.node_type == ExitNodeType::Shared && self.in_region(n) && usable(n))
                .collect()
        };

        if shared.is_empty() {
            warn!(
                org_id = %org_id,
                filter_online,
                exclude_shared_pool,
                region = ?self.region,
                "No exit nodes available"
            );
        }
        Ok(shared)
    }

    /// Whether `org_id` may use the exit node
    pub async fn verify_org_access(&self, exit_node_id: ExitNodeId, org_id: &OrgId) -> Result<OrgAccess, ExitNodeError> {
        let Some(node) = self.store.find_exit_node(exit_node_id).await? else {
            return Ok(OrgAccess::denied(None));
        };

        let has_access = match node.node_type {
            ExitNodeType::Shared => true,
            ExitNodeType::Dedicated => self.store.is_linked(exit_node_id, org_id).await?,
            ExitNodeType::Unknown => false,
        };
        Ok(OrgAccess { has_access, exit_node: Some(node) })
    }

    pub async fn check_online_status(&self, endpoint: &str) -> bool {
        self.probe.is_online(endpoint).await
    }

    /// Online exit nodes offered to a site's agent, with capacity weights
    ///
    /// Nodes already at `max_connections` online sites are left out.
    pub async fn ping_candidates(
        &self,
        org_id: &OrgId,
        site_id: SiteId,
        exclude_shared_pool: bool,
    ) -> Result<Vec<ExitNodeCandidate>, ExitNodeError> {
        let previous = self.store.find_site(site_id).await?.and_then(|s| s.exit_node_id);
        let nodes = self.list(org_id, true, exclude_shared_pool).await?;

        let mut candidates = Vec::with_capacity(nodes.len());
        for node in nodes {
            let weight = match node.max_connections {
                Some(max) => {
                    let connected = self.store.count_online_sites(node.id).await?;
                    if max == 0 || connected >= u64::from(max) {
                        debug!(exit_node_id = %node.id, connected, max, "Exit node at capacity");
                        continue;
                    }
                    (u64::from(max) - connected) as f64 / f64::from(max)
                }
                None => 1.0,
            };
            candidates.push(ExitNodeCandidate {
                exit_node_id: node.id,
                exit_node_name: node.name,
                endpoint: node.endpoint,
                weight,
                was_previously_connected: previous == Some(node.id),
            });
        }
        Ok(candidates)
    }

    /// Select from agent ping results, then check the winner against the org
    pub async fn choose_exit_node(
        &self,
        org_id: &OrgId,
        results: &[ExitNodePingResult],
    ) -> Result<Option<ExitNode>, ExitNodeError> {
        let Some(best) = self.selector.select(results) else {
            return Ok(None);
        };

        let access = self.verify_org_access(best.exit_node_id, org_id).await?;
        if !access.has_access {
            warn!(
                org_id = %org_id,
                exit_node_id = %best.exit_node_id,
                "Selected exit node is not available to the organization"
            );
            return Ok(None);
        }
        Ok(access.exit_node)
    }

    /// Probe the node and persist its online flag when it changed
    pub async fn refresh_online_status(&self, exit_node_id: ExitNodeId) -> Result<bool, ExitNodeError> {
        let node = self
            .store
            .find_exit_node(exit_node_id)
            .await?
            .ok_or(ExitNodeError::NotFound(exit_node_id))?;

        let online = self.probe.is_online(&node.endpoint).await;
        if online != node.online {
            let last_ping = if online {
                self.clock.now_ms().ok().map(|ms| ms / 1000)
            } else {
                None
            };
            self.store.set_exit_node_online(exit_node_id, online, last_ping).await?;
            info!(exit_node_id = %exit_node_id, exit_node = %node.name, online, "Exit node status changed");
        }
        Ok(online)
    }

    /// Refresh the online flag of every known exit node
    pub async fn refresh_all(&self) -> Result<HealthSweep, ExitNodeError> {
        let nodes = self.store.list_exit_nodes().await?;
        let results = join_all(nodes.iter().map(|node| self.refresh_online_status(node.id))).await;

        let mut sweep = HealthSweep::default();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(true) => sweep.online += 1,
                Ok(false) => sweep.offline += 1,
                Err(e) => {
                    warn!(exit_node_id = %node.id, error = %e, "Exit node health check failed");
                    sweep.failed += 1;
                }
            }
        }
        debug!(online = sweep.online, offline = sweep.offline, failed = sweep.failed, "Exit node health sweep done");
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::ExitNodeOrgLink;
    use crate::storage::{InMemoryStore, MeshSnapshot};
    use crate::test_utils::{exit_node, site, StaticProbe};

    fn directory(snapshot: MeshSnapshot, probe: StaticProbe, region: Option<&str>) -> (ExitNodeDirectory, InMemoryStore) {
        let store = InMemoryStore::from_snapshot(snapshot);
        let directory = ExitNodeDirectory::new(
            Arc::new(store.clone()),
            Arc::new(probe),
            ExitNodeSelector::default(),
            region.map(String::from),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        (directory, store)
    }

    fn link(id: u64, org: &str) -> ExitNodeOrgLink {
        ExitNodeOrgLink { exit_node_id: ExitNodeId(id), org_id: OrgId::new(org) }
    }

    fn ids(nodes: &[ExitNode]) -> Vec<u64> {
        nodes.iter().map(|n| n.id.0).collect()
    }

    #[tokio::test]
    async fn test_dedicated_nodes_win() {
        let snapshot = MeshSnapshot {
            exit_nodes: vec![
                exit_node(1, ExitNodeType::Shared),
                exit_node(2, ExitNodeType::Dedicated),
                exit_node(3, ExitNodeType::Dedicated),
            ],
            exit_node_orgs: vec![link(2, "acme"), link(3, "other")],
            ..Default::default()
        };
        let (directory, _) = directory(snapshot, StaticProbe::offline(), None);

        let nodes = directory.list(&OrgId::new("acme"), false, false).await.unwrap();
        assert_eq!(ids(&nodes), vec![2]);

        let nodes = directory.list(&OrgId::new("nobody"), false, false).await.unwrap();
        assert_eq!(ids(&nodes), vec![1]);
    }

    #[tokio::test]
    async fn test_offline_dedicated_falls_back_to_shared_pool() {
        let mut dedicated = exit_node(2, ExitNodeType::Dedicated);
        dedicated.online = false;
        let snapshot = MeshSnapshot {
            exit_nodes: vec![exit_node(1, ExitNodeType::Shared), dedicated],
            exit_node_orgs: vec![link(2, "acme")],
            ..Default::default()
        };
        let (directory, _) = directory(snapshot, StaticProbe::offline(), None);
        let org = OrgId::new("acme");

        assert_eq!(ids(&directory.list(&org, true, false).await.unwrap()), vec![1]);
        assert_eq!(ids(&directory.list(&org, false, false).await.unwrap()), vec![2]);
        assert!(directory.list(&org, true, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_pool_region_filter() {
        let mut eu = exit_node(1, ExitNodeType::Shared);
        eu.region = Some("eu".to_string());
        let mut us = exit_node(2, ExitNodeType::Shared);
        us.region = Some("us".to_string());
        let anywhere = exit_node(3, ExitNodeType::Shared);
        let snapshot = MeshSnapshot { exit_nodes: vec![eu, us, anywhere], ..Default::default() };
        let org = OrgId::new("acme");

        let (regional, _) = directory(snapshot.clone(), StaticProbe::offline(), Some("eu"));
        assert_eq!(ids(&regional.list(&org, false, false).await.unwrap()), vec![1, 3]);

        let (global, _) = directory(snapshot, StaticProbe::offline(), None);
        assert_eq!(ids(&global.list(&org, false, false).await.unwrap()), vec![3]);
    }

    #[tokio::test]
    async fn test_verify_org_access() {
        let snapshot = MeshSnapshot {
            exit_nodes: vec![
                exit_node(1, ExitNodeType::Shared),
                exit_node(2, ExitNodeType::Dedicated),
                exit_node(3, ExitNodeType::Unknown),
            ],
            exit_node_orgs: vec![link(2, "acme")],
            ..Default::default()
        };
        let (directory, _) = directory(snapshot, StaticProbe::offline(), None);
        let acme = OrgId::new("acme");
        let other = OrgId::new("other");

        assert!(directory.verify_org_access(ExitNodeId(1), &other).await.unwrap().has_access);
        assert!(directory.verify_org_access(ExitNodeId(2), &acme).await.unwrap().has_access);
        assert!(!directory.verify_org_access(ExitNodeId(2), &other).await.unwrap().has_access);

        let unknown = directory.verify_org_access(ExitNodeId(3), &acme).await.unwrap();
        assert!(!unknown.has_access);
        assert!(unknown.exit_node.is_some());

        let missing = directory.verify_org_access(ExitNodeId(9), &acme).await.unwrap();
        assert_eq!(missing, OrgAccess { has_access: false, exit_node: None });
    }

    #[tokio::test]
    async fn test_ping_candidates_weights() {
        let mut limited = exit_node(1, ExitNodeType::Shared);
        limited.max_connections = Some(4);
        let mut full = exit_node(2, ExitNodeType::Shared);
        full.max_connections = Some(1);
        let unlimited = exit_node(3, ExitNodeType::Shared);

        let mut current = site(10, "acme");
        current.exit_node_id = Some(ExitNodeId(3));
        let mut on_limited = site(11, "acme");
        on_limited.exit_node_id = Some(ExitNodeId(1));
        on_limited.online = true;
        let mut on_full = site(12, "acme");
        on_full.exit_node_id = Some(ExitNodeId(2));
        on_full.online = true;

        let snapshot = MeshSnapshot {
            exit_nodes: vec![limited, full, unlimited],
            sites: vec![current, on_limited, on_full],
            ..Default::default()
        };
        let (directory, _) = directory(snapshot, StaticProbe::offline(), None);

        let candidates = directory.ping_candidates(&OrgId::new("acme"), SiteId(10), false).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].exit_node_id, ExitNodeId(1));
        assert!((candidates[0].weight - 0.75).abs() < f64::EPSILON);
        assert!(!candidates[0].was_previously_connected);
        assert_eq!(candidates[1].exit_node_id, ExitNodeId(3));
        assert_eq!(candidates[1].weight, 1.0);
        assert!(candidates[1].was_previously_connected);
    }

    #[tokio::test]
    async fn test_choose_exit_node_checks_access() {
        let snapshot = MeshSnapshot {
            exit_nodes: vec![exit_node(1, ExitNodeType::Dedicated), exit_node(2, ExitNodeType::Shared)],
            exit_node_orgs: vec![link(1, "other")],
            ..Default::default()
        };
        let (directory, _) = directory(snapshot, StaticProbe::offline(), None);
        let result = |id: u64, latency_ms: f64| ExitNodePingResult {
            exit_node_id: ExitNodeId(id),
            exit_node_name: String::new(),
            endpoint: String::new(),
            latency_ms,
            weight: 1.0,
            error: None,
            was_previously_connected: false,
        };
        let acme = OrgId::new("acme");

        let chosen = directory.choose_exit_node(&acme, &[result(2, 30.0), result(1, 80.0)]).await.unwrap();
        assert_eq!(chosen.map(|n| n.id), Some(ExitNodeId(2)));

        // Fastest node belongs to another org
        let chosen = directory.choose_exit_node(&acme, &[result(1, 10.0), result(2, 80.0)]).await.unwrap();
        assert!(chosen.is_none());

        assert!(directory.choose_exit_node(&acme, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_online_status_persists_changes() {
        let mut node = exit_node(1, ExitNodeType::Shared);
        node.online = false;
        let snapshot = MeshSnapshot { exit_nodes: vec![node], ..Default::default() };
        let (directory, store) = directory(snapshot, StaticProbe::online(), None);

        assert!(directory.refresh_online_status(ExitNodeId(1)).await.unwrap());
        let stored = store.find_exit_node(ExitNodeId(1)).await.unwrap().unwrap();
        assert!(stored.online);
        assert_eq!(stored.last_ping, Some(1_700_000_000));

        assert!(matches!(
            directory.refresh_online_status(ExitNodeId(7)).await,
            Err(ExitNodeError::NotFound(ExitNodeId(7)))
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_counts_each_node() {
        let mut unreachable = exit_node(2, ExitNodeType::Shared);
        unreachable.endpoint = String::new();
        let snapshot = MeshSnapshot { exit_nodes: vec![exit_node(1, ExitNodeType::Shared), unreachable], ..Default::default() };
        let (directory, store) = directory(snapshot, StaticProbe::online(), None);

        let sweep = directory.refresh_all().await.unwrap();
        assert_eq!(sweep, HealthSweep { online: 1, offline: 1, failed: 0 });
        assert!(!store.find_exit_node(ExitNodeId(2)).await.unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn test_check_online_status_delegates_to_probe() {
        let (directory, _) = directory(MeshSnapshot::default(), StaticProbe::online(), None);
        assert!(directory.check_online_status("gw.example.com:3003").await);
    }
}
