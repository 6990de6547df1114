//! Metric names and recording helpers
//!
//! Everything goes through the `metrics` facade. Nothing is recorded until a
//! recorder is installed (the CLI installs the Prometheus exporter).

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions (call once at startup)
pub fn init_metrics() {
    // Rate limiting
    describe_counter!(
        "relaymesh_rate_limit_checks_total",
        "Rate limit decisions, labeled by result (allowed, global, message_type)"
    );
    describe_counter!(
        "relaymesh_rate_limit_syncs_total",
        "Write-backs of pending counts to the shared store, labeled by result (ok, error)"
    );
    describe_counter!(
        "relaymesh_rate_limit_store_errors_total",
        "Shared counter store failures, labeled by operation"
    );
    describe_gauge!(
        "relaymesh_rate_limit_tracked_keys",
        "Local rate limit entries currently tracked"
    );

    // Exit nodes
    describe_counter!(
        "relaymesh_exit_node_selections_total",
        "Exit node selections, labeled by reason (lowest_latency, sticky, next_with_capacity, fallback, none)"
    );
    describe_counter!(
        "relaymesh_exit_node_probes_total",
        "Online probes of exit nodes, labeled by result (online, offline)"
    );
    describe_histogram!(
        "relaymesh_exit_node_probe_duration_seconds",
        "Time until an online probe settled"
    );

    // Mesh
    describe_counter!(
        "relaymesh_reconcile_runs_total",
        "Association reconciles, labeled by outcome (noop, applied, unprovisioned, error)"
    );
    describe_counter!(
        "relaymesh_association_changes_total",
        "Client/site association rows changed, labeled by kind (added, removed)"
    );
    describe_counter!(
        "relaymesh_peer_rpc_total",
        "Agent RPCs, labeled by method and result (ok, timeout, transport, invalid, unreachable)"
    );
    describe_histogram!(
        "relaymesh_peer_rpc_duration_seconds",
        "Duration of agent and exit node RPCs"
    );
    describe_counter!(
        "relaymesh_destination_updates_total",
        "Destination update pushes to exit nodes, labeled by result"
    );
}

/// Record a rate limit decision
pub fn rate_limit_decision(result: &'static str) {
    counter!("relaymesh_rate_limit_checks_total", "result" => result).increment(1);
}

/// Record a write-back to the shared store
pub fn rate_limit_sync(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("relaymesh_rate_limit_syncs_total", "result" => result).increment(1);
}

/// Record a failed shared store operation
pub fn rate_limit_store_error(operation: &'static str) {
    counter!("relaymesh_rate_limit_store_errors_total", "operation" => operation).increment(1);
}

/// Update the tracked-key gauge
pub fn set_rate_limit_tracked_keys(count: usize) {
    gauge!("relaymesh_rate_limit_tracked_keys").set(count as f64);
}

/// Record which rule picked an exit node
pub fn exit_node_selected(reason: &'static str) {
    counter!("relaymesh_exit_node_selections_total", "reason" => reason).increment(1);
}

/// Record an online probe outcome
pub fn exit_node_probe(online: bool, duration_secs: f64) {
    let result = if online { "online" } else { "offline" };
    counter!("relaymesh_exit_node_probes_total", "result" => result).increment(1);
    histogram!("relaymesh_exit_node_probe_duration_seconds").record(duration_secs);
}

/// Record a reconcile run
pub fn reconcile_run(outcome: &'static str) {
    counter!("relaymesh_reconcile_runs_total", "outcome" => outcome).increment(1);
}

/// Record association row changes
pub fn association_changes(added: usize, removed: usize) {
    counter!("relaymesh_association_changes_total", "kind" => "added").increment(added as u64);
    counter!("relaymesh_association_changes_total", "kind" => "removed").increment(removed as u64);
}

/// Record an RPC outcome and its duration
pub fn peer_rpc(method: &'static str, result: &'static str, duration_secs: f64) {
    counter!("relaymesh_peer_rpc_total", "method" => method, "result" => result).increment(1);
    histogram!("relaymesh_peer_rpc_duration_seconds", "method" => method).record(duration_secs);
}

/// Record a destination update push
pub fn destination_update(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("relaymesh_destination_updates_total", "result" => result).increment(1);
}
