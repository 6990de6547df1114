//! Relay destination updates pushed to exit nodes
//!
//! An exit node relays a client's packets to the sites it is associated
//! with. Every exit node serving at least one of those sites receives the
//! full list of destinations it must forward to for that client.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{MeshError, PropagationReport};
use crate::core_exit::{
    send_to_exit_node, ExitNodeRequest, ExitNodeRpcDispatcher, ExitNodeTarget, PeerDestination,
    UpdateDestinationsRequest,
};
use crate::metrics;
use crate::model::net::{cidr_address, split_endpoint};
use crate::model::ClientId;
use crate::storage::MeshStore;

struct DestinationGroup {
    target: ExitNodeTarget,
    source_ip: String,
    source_port: u16,
    destinations: Vec<PeerDestination>,
}

pub struct DestinationPropagator {
    store: Arc<dyn MeshStore>,
    dispatcher: Arc<dyn ExitNodeRpcDispatcher>,
    rpc_timeout: Duration,
}

impl DestinationPropagator {
    pub fn new(store: Arc<dyn MeshStore>, dispatcher: Arc<dyn ExitNodeRpcDispatcher>, rpc_timeout: Duration) -> Self {
        Self { store, dispatcher, rpc_timeout }
    }

    /// Send one `UpdateDestinations` per exit node serving the client's sites
    pub async fn update_destinations(&self, client_id: ClientId) -> Result<PropagationReport, MeshError> {
        let links = self.store.site_links_for_client(client_id).await?;
        let mut report = PropagationReport::default();
        // Keyed by gateway: shared nodes by address, dedicated nodes by id
        let mut groups: BTreeMap<String, DestinationGroup> = BTreeMap::new();

        for link in links {
            let site_id = link.site.id;
            let Some(subnet) = link.site.subnet.as_deref() else {
                warn!(client_id = %client_id, site_id = %site_id, "Site has no subnet, skipping destination");
                report.skipped_sites.push(site_id);
                continue;
            };
            let Some(endpoint) = link.association.endpoint.as_deref().filter(|e| !e.is_empty()) else {
                debug!(client_id = %client_id, site_id = %site_id, "Client endpoint not known yet, skipping destination");
                report.skipped_sites.push(site_id);
                continue;
            };
            let Some(exit_node) = link.exit_node.as_ref() else {
                warn!(client_id = %client_id, site_id = %site_id, "Site has no exit node, skipping destination");
                report.skipped_sites.push(site_id);
                continue;
            };

            let destination = PeerDestination {
                destination_ip: cidr_address(subnet).to_string(),
                destination_port: link.site.listen_port.unwrap_or(0),
            };
            let target = ExitNodeTarget::from(exit_node);
            groups
                .entry(target.route_key())
                .or_insert_with(|| {
                    let (source_ip, source_port) = match split_endpoint(endpoint) {
                        Some((host, port)) => (host.to_string(), port),
                        None => (endpoint.to_string(), 0),
                    };
                    DestinationGroup {
                        target,
                        source_ip,
                        source_port,
                        destinations: Vec::new(),
                    }
                })
                .destinations
                .push(destination);
        }

        report.groups = groups.len();
        let sends = groups.into_values().map(|group| async move {
            info!(
                client_id = %client_id,
                exit_node_id = %group.target.exit_node_id,
                reachable_at = %group.target.reachable_at,
                destinations = group.destinations.len(),
                "Updating exit node destinations"
            );
            let request = ExitNodeRequest::UpdateDestinations(UpdateDestinationsRequest {
                source_ip: group.source_ip,
                source_port: group.source_port,
                destinations: group.destinations,
            });
            let result = send_to_exit_node(self.dispatcher.as_ref(), &group.target, &request, self.rpc_timeout).await;
            if let Err(e) = &result {
                warn!(
                    client_id = %client_id,
                    exit_node_id = %group.target.exit_node_id,
                    error = %e,
                    "Failed to update exit node destinations"
                );
            }
            metrics::destination_update(result.is_ok());
            result.is_ok()
        });

        for ok in join_all(sends).await {
            if ok {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_exit::RecordingExitNodeDispatcher;
    use crate::model::{ClientSiteAssociation, ExitNodeId, ExitNodeType, SiteId};
    use crate::storage::{InMemoryStore, MeshSnapshot};
    use crate::test_utils::{exit_node, site};

    fn association(client: u64, site: u64, endpoint: Option<&str>) -> ClientSiteAssociation {
        ClientSiteAssociation {
            client_id: ClientId(client),
            site_id: SiteId(site),
            endpoint: endpoint.map(String::from),
        }
    }

    fn routed_site(id: u64, exit: u64, subnet: Option<&str>, listen_port: Option<u16>) -> crate::model::Site {
        let mut s = site(id, "acme");
        s.exit_node_id = Some(ExitNodeId(exit));
        s.subnet = subnet.map(String::from);
        s.listen_port = listen_port;
        s
    }

    fn propagator(snapshot: MeshSnapshot) -> (DestinationPropagator, Arc<RecordingExitNodeDispatcher>) {
        let dispatcher = Arc::new(RecordingExitNodeDispatcher::new());
        let propagator = DestinationPropagator::new(
            Arc::new(InMemoryStore::from_snapshot(snapshot)),
            dispatcher.clone(),
            Duration::from_secs(1),
        );
        (propagator, dispatcher)
    }

    #[tokio::test]
    async fn test_groups_by_exit_node() {
        let snapshot = MeshSnapshot {
            exit_nodes: vec![exit_node(1, ExitNodeType::Shared), exit_node(2, ExitNodeType::Shared)],
            sites: vec![
                routed_site(10, 1, Some("100.90.128.10/24"), Some(51820)),
                routed_site(11, 1, Some("100.90.128.11/24"), None),
                routed_site(12, 2, Some("100.90.128.12/24"), Some(51821)),
            ],
            associations: vec![
                association(5, 10, Some("198.51.100.4:41000")),
                association(5, 11, Some("198.51.100.4:41001")),
                association(5, 12, Some("198.51.100.4:41002")),
            ],
            ..Default::default()
        };
        let (propagator, dispatcher) = propagator(snapshot);

        let report = propagator.update_destinations(ClientId(5)).await.unwrap();
        assert_eq!(report, PropagationReport { groups: 2, sent: 2, failed: 0, skipped_sites: vec![] });

        let mut calls = dispatcher.calls().await;
        calls.sort_by_key(|(target, _)| target.exit_node_id);
        let ExitNodeRequest::UpdateDestinations(first) = &calls[0].1;
        assert_eq!(calls[0].0.exit_node_id, ExitNodeId(1));
        assert_eq!(first.source_ip, "198.51.100.4");
        assert_eq!(first.source_port, 41000);
        assert_eq!(
            first.destinations,
            vec![
                PeerDestination { destination_ip: "100.90.128.10".to_string(), destination_port: 51820 },
                PeerDestination { destination_ip: "100.90.128.11".to_string(), destination_port: 0 },
            ]
        );
        let ExitNodeRequest::UpdateDestinations(second) = &calls[1].1;
        assert_eq!(second.source_port, 41002);
        assert_eq!(second.destinations.len(), 1);
    }

    #[tokio::test]
    async fn test_dedicated_nodes_without_address_are_grouped_by_id() {
        let mut first = exit_node(1, ExitNodeType::Dedicated);
        first.reachable_at = String::new();
        let mut second = exit_node(2, ExitNodeType::Dedicated);
        second.reachable_at = String::new();
        let snapshot = MeshSnapshot {
            exit_nodes: vec![first, second],
            sites: vec![
                routed_site(10, 1, Some("100.90.128.10/24"), None),
                routed_site(12, 2, Some("100.90.128.12/24"), None),
            ],
            associations: vec![
                association(5, 10, Some("198.51.100.4:41000")),
                association(5, 12, Some("198.51.100.4:41000")),
            ],
            ..Default::default()
        };
        let (propagator, dispatcher) = propagator(snapshot);

        let report = propagator.update_destinations(ClientId(5)).await.unwrap();
        assert_eq!(report.groups, 2);
        let calls = dispatcher.calls().await;
        assert!(calls.iter().all(|(target, _)| target.node_type == ExitNodeType::Dedicated));
    }

    #[tokio::test]
    async fn test_skips_incomplete_sites() {
        let snapshot = MeshSnapshot {
            exit_nodes: vec![exit_node(1, ExitNodeType::Shared)],
            sites: vec![
                routed_site(10, 1, None, None),
                routed_site(11, 1, Some("100.90.128.11/24"), None),
                routed_site(12, 9, Some("100.90.128.12/24"), None),
            ],
            associations: vec![
                association(5, 10, Some("198.51.100.4:41000")),
                association(5, 11, None),
                association(5, 12, Some("198.51.100.4:41000")),
            ],
            ..Default::default()
        };
        let (propagator, dispatcher) = propagator(snapshot);

        let report = propagator.update_destinations(ClientId(5)).await.unwrap();
        assert_eq!(report.groups, 0);
        assert_eq!(report.skipped_sites, vec![SiteId(10), SiteId(11), SiteId(12)]);
        assert!(dispatcher.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_group_is_counted() {
        let snapshot = MeshSnapshot {
            exit_nodes: vec![exit_node(1, ExitNodeType::Shared), exit_node(2, ExitNodeType::Shared)],
            sites: vec![
                routed_site(10, 1, Some("100.90.128.10/24"), None),
                routed_site(12, 2, Some("100.90.128.12/24"), None),
            ],
            associations: vec![
                association(5, 10, Some("198.51.100.4:41000")),
                association(5, 12, Some("198.51.100.4:41000")),
            ],
            ..Default::default()
        };
        let (propagator, dispatcher) = propagator(snapshot);
        dispatcher.fail_for(ExitNodeId(2)).await;

        let report = propagator.update_destinations(ClientId(5)).await.unwrap();
        assert_eq!((report.sent, report.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_client_without_sites() {
        let (propagator, dispatcher) = propagator(MeshSnapshot::default());
        let report = propagator.update_destinations(ClientId(1)).await.unwrap();
        assert_eq!(report, PropagationReport::default());
        assert!(dispatcher.calls().await.is_empty());
    }
}
