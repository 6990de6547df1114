//! Association reconciliation and destination propagation through the
//! public API, wired the way the control plane wires them.

use relaymesh_core::clock::ManualClock;
use relaymesh_core::config::Config;
use relaymesh_core::core_exit::{ExitNodeRequest, RecordingExitNodeDispatcher};
use relaymesh_core::core_mesh::{AgentTarget, PeerCommand, RecordingPeerDispatcher, SubnetProxyTarget};
use relaymesh_core::core_ratelimit::DisabledCounterStore;
use relaymesh_core::model::{ClientId, ExitNodeId, SiteId, SiteResourceId};
use relaymesh_core::storage::InMemoryStore;
use relaymesh_core::test_utils::{MeshFixture, StaticProbe};
use relaymesh_core::{Collaborators, ControlPlane};
use std::sync::Arc;

struct Setup {
    plane: ControlPlane,
    store: InMemoryStore,
    peers: Arc<RecordingPeerDispatcher>,
    exits: Arc<RecordingExitNodeDispatcher>,
}

fn setup(fixture: MeshFixture) -> Setup {
    let store = InMemoryStore::from_snapshot(fixture.build());
    let peers = Arc::new(RecordingPeerDispatcher::new());
    let exits = Arc::new(RecordingExitNodeDispatcher::new());
    let deps = Collaborators {
        exit_node_store: Arc::new(store.clone()),
        mesh_store: Arc::new(store.clone()),
        counter_store: Arc::new(DisabledCounterStore),
        peers: peers.clone(),
        exit_node_rpc: exits.clone(),
        probe: Arc::new(StaticProbe::online()),
        clock: Arc::new(ManualClock::new(1_700_000_000_000)),
    };
    let plane = ControlPlane::build(Config::default(), deps).unwrap();
    Setup { plane, store, peers, exits }
}

#[tokio::test]
async fn test_diff_adds_missing_and_removes_stale() {
    // Entitled {1,2,3}, associated {2,3,4}
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_resource(100, 1)
        .with_user_client(1, "alice")
        .with_user_client(2, "alice")
        .with_user_client(3, "alice")
        .with_user_client(4, "bob")
        .grant_user(100, "alice")
        .with_association(2, 1)
        .with_association(3, 1)
        .with_association(4, 1);
    let s = setup(fixture);

    let report = s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    assert_eq!(report.added_clients(), vec![ClientId(1)]);
    assert_eq!(report.removed_clients(), vec![ClientId(4)]);
    assert_eq!(
        s.store.associated_clients_of(SiteId(1)).await,
        vec![ClientId(1), ClientId(2), ClientId(3)]
    );
}

#[tokio::test]
async fn test_second_reconcile_sends_nothing() {
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_resource(100, 1)
        .with_user_client(1, "alice")
        .with_machine_client(2)
        .with_role_member(5, "alice")
        .grant_role(100, 5)
        .grant_client(100, 2);
    let s = setup(fixture);

    let first = s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    assert_eq!(first.added.len(), 2);
    let rows_after_first = s.store.snapshot().await.associations.len();
    let calls_after_first = s.peers.calls().await.len();

    let second = s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    assert!(second.is_noop());
    assert_eq!(s.peers.calls().await.len(), calls_after_first);
    assert_eq!(s.store.snapshot().await.associations.len(), rows_after_first);
}

#[tokio::test]
async fn test_revoking_role_removes_peers_on_both_sides() {
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_resource(100, 1)
        .with_user_client(1, "alice")
        .with_role_member(5, "alice")
        .grant_role(100, 5);
    let s = setup(fixture);
    s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    s.peers.clear().await;

    s.store.update(|state| state.role_grants.clear()).await;
    let report = s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    assert_eq!(report.removed_clients(), vec![ClientId(1)]);

    let calls = s.peers.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0].target, AgentTarget::Site { site_id: SiteId(1), .. }));
    assert_eq!(calls[0].command, PeerCommand::Delete(relaymesh_core::core_mesh::DeletePeerRequest {
        public_key: "client-1-key".to_string(),
    }));
    assert!(matches!(&calls[1].target, AgentTarget::Client { client_id: ClientId(1), .. }));
    assert_eq!(calls[1].command.public_key(), Some("site-1-key"));
}

#[tokio::test]
async fn test_client_granted_one_of_two_resources_gets_only_its_subnet() {
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_resource_at(100, 1, "10.1.0.0/24")
        .with_resource_at(101, 1, "10.1.9.0/24")
        .with_user_client(1, "alice")
        .grant_user(100, "alice");
    let s = setup(fixture);

    s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    let calls = s.peers.calls().await;

    let client_side: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c.target, AgentTarget::Client { .. }))
        .map(|c| &c.command)
        .collect();
    let [PeerCommand::Add(add)] = client_side.as_slice() else {
        panic!("expected a single add_peer for the client, got {:?}", client_side);
    };
    assert_eq!(add.allowed_ips, vec!["10.1.0.0/24".to_string()]);

    let site_targets: Vec<SubnetProxyTarget> = calls
        .iter()
        .filter_map(|c| match &c.command {
            PeerCommand::AddTargets(r) => Some(r.targets.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(
        site_targets,
        vec![SubnetProxyTarget { source_prefix: "100.90.129.1/32".to_string(), dest_prefix: "10.1.0.0/24".to_string() }]
    );

    // Reconciling the ungranted resource changes nothing
    let report = s.plane.reconciler().reconcile(SiteResourceId(101)).await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_destinations_grouped_per_exit_node() {
    // Sites 1 and 2 share exit node 1; site 3 has its own
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_site(2)
        .with_site(3)
        .with_user_client(9, "alice")
        .with_association_endpoint(9, 1, Some("198.51.100.7:40001"))
        .with_association_endpoint(9, 2, Some("198.51.100.7:40002"))
        .with_association_endpoint(9, 3, Some("198.51.100.7:40003"))
        .update(|state| {
            if let Some(site) = state.sites.iter_mut().find(|s| s.id == SiteId(2)) {
                site.exit_node_id = Some(ExitNodeId(1));
            }
        });
    let s = setup(fixture);

    let report = s.plane.propagator().update_destinations(ClientId(9)).await.unwrap();
    assert_eq!(report.groups, 2);

    let mut calls = s.exits.calls().await;
    assert_eq!(calls.len(), 2);
    calls.sort_by_key(|(target, _)| target.exit_node_id);

    let ExitNodeRequest::UpdateDestinations(shared) = &calls[0].1;
    assert_eq!(calls[0].0.exit_node_id, ExitNodeId(1));
    assert_eq!(shared.destinations.len(), 2);
    assert_eq!(shared.source_ip, "198.51.100.7");
    assert_eq!(shared.source_port, 40001);

    let ExitNodeRequest::UpdateDestinations(own) = &calls[1].1;
    assert_eq!(calls[1].0.exit_node_id, ExitNodeId(3));
    assert_eq!(own.destinations.len(), 1);
    assert_eq!(own.destinations[0].destination_ip, "100.90.128.3");
}

#[tokio::test]
async fn test_reconcile_propagates_known_endpoints() {
    // Client already reaches site 2 with an observed endpoint; gaining site 1
    // republishes its destinations.
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_site(2)
        .with_resource(100, 1)
        .with_resource(200, 2)
        .with_user_client(9, "alice")
        .grant_user(100, "alice")
        .grant_user(200, "alice")
        .with_association_endpoint(9, 2, Some("198.51.100.7:40002"));
    let s = setup(fixture);

    let report = s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    assert_eq!(report.added_clients(), vec![ClientId(9)]);
    assert_eq!(report.destination_updates, 1);

    let calls = s.exits.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.exit_node_id, ExitNodeId(2));
}

#[tokio::test]
async fn test_unprovisioned_site_reports_reason() {
    let fixture = MeshFixture::new()
        .with_site(1)
        .with_resource(100, 1)
        .with_user_client(1, "alice")
        .grant_user(100, "alice")
        .update(|state| state.sites[0].exit_node_id = None);
    let s = setup(fixture);

    let report = s.plane.reconciler().reconcile(SiteResourceId(100)).await.unwrap();
    assert_eq!(report.unprovisioned.map(|r| r.to_string()), Some("site has no exit node".to_string()));
    assert_eq!(s.store.associated_clients_of(SiteId(1)).await, vec![ClientId(1)]);
    assert!(s.peers.calls().await.is_empty());
}
