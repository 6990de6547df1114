//! Service container wiring the control plane components
//!
//! Built once by the process bootstrap and passed to whatever serves
//! requests. Owns the background tasks of the rate limiter and the exit
//! node health check.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::{Config, ConfigError};
use crate::core_exit::{ExitNodeDirectory, ExitNodeRpcDispatcher, ExitNodeSelector, OnlineProbe};
use crate::core_mesh::{DestinationPropagator, PeerAssociationReconciler, PeerRpcDispatcher};
use crate::core_ratelimit::{RateLimitTracker, SharedCounterStore};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{ExitNodeStore, MeshStore};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the control plane talks to
#[derive(Clone)]
pub struct Collaborators {
    pub exit_node_store: Arc<dyn ExitNodeStore>,
    pub mesh_store: Arc<dyn MeshStore>,
    pub counter_store: Arc<dyn SharedCounterStore>,
    pub peers: Arc<dyn PeerRpcDispatcher>,
    pub exit_node_rpc: Arc<dyn ExitNodeRpcDispatcher>,
    pub probe: Arc<dyn OnlineProbe>,
    pub clock: SharedClock,
}

pub struct ControlPlane {
    config: Config,
    rate_limiter: Arc<RateLimitTracker>,
    directory: Arc<ExitNodeDirectory>,
    propagator: Arc<DestinationPropagator>,
    reconciler: PeerAssociationReconciler,
    coordinator: ShutdownCoordinator,
}

impl ControlPlane {
    /// Validate `config` and wire every component
    pub fn build(config: Config, deps: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let rate_limiter = Arc::new(RateLimitTracker::new(
            config.rate_limit.clone(),
            deps.counter_store,
            deps.clock.clone(),
        ));
        let directory = Arc::new(ExitNodeDirectory::new(
            deps.exit_node_store,
            deps.probe,
            ExitNodeSelector::from_config(&config.exit_nodes),
            config.exit_nodes.region.clone(),
            deps.clock,
        ));
        let propagator = Arc::new(DestinationPropagator::new(
            deps.mesh_store.clone(),
            deps.exit_node_rpc,
            config.exit_nodes.rpc_timeout,
        ));
        let reconciler = PeerAssociationReconciler::new(
            deps.mesh_store,
            deps.peers,
            propagator.clone(),
            config.reconciler.clone(),
        );

        Ok(Self {
            config,
            rate_limiter,
            directory,
            propagator,
            reconciler,
            coordinator: ShutdownCoordinator::new(SHUTDOWN_TIMEOUT),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limiter
    }

    pub fn directory(&self) -> &ExitNodeDirectory {
        &self.directory
    }

    pub fn selector(&self) -> &ExitNodeSelector {
        self.directory.selector()
    }

    pub fn propagator(&self) -> &DestinationPropagator {
        &self.propagator
    }

    pub fn reconciler(&self) -> &PeerAssociationReconciler {
        &self.reconciler
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Start background tasks
    pub async fn start(&self) {
        self.rate_limiter.start(&self.coordinator).await;

        let directory = Arc::clone(&self.directory);
        let check_every = self.config.exit_nodes.health_check_interval;
        self.coordinator
            .spawn("exit-node-health", async move {
                let mut ticker = tokio::time::interval(check_every);
                loop {
                    ticker.tick().await;
                    if let Err(e) = directory.refresh_all().await {
                        warn!(error = %e, "Exit node health sweep failed");
                    }
                }
            })
            .await;
        info!(tasks = self.coordinator.task_count().await, "Control plane started");
    }

    /// Stop background tasks, then flush rate limit state
    pub async fn stop(&self) {
        self.coordinator.shutdown().await;
        self.rate_limiter.shutdown().await;
        info!("Control plane stopped");
    }
}
