//! HTTP liveness probe for exit nodes

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::types::ExitNodeError;
use crate::config::ExitNodeConfig;
use crate::metrics;

/// Decides whether an exit node endpoint answers
#[async_trait]
pub trait OnlineProbe: Send + Sync {
    async fn is_online(&self, endpoint: &str) -> bool;
}

/// Staggered parallel `GET http://<endpoint>/ping`
///
/// Returns `true` on the first HTTP 200; every attempt has its own timeout.
pub struct HttpOnlineProbe {
    client: reqwest::Client,
    attempts: usize,
    stagger: Duration,
}

impl HttpOnlineProbe {
    pub fn new(attempts: usize, stagger: Duration, timeout: Duration) -> Result<Self, ExitNodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExitNodeError::HttpClient(e.to_string()))?;
        Ok(Self { client, attempts: attempts.max(1), stagger })
    }

    pub fn from_config(config: &ExitNodeConfig) -> Result<Self, ExitNodeError> {
        Self::new(config.probe_attempts, config.probe_stagger, config.probe_timeout)
    }

    async fn attempt(&self, url: &str, index: usize) -> bool {
        if index > 0 {
            tokio::time::sleep(self.stagger * index as u32).await;
        }
        match self.client.get(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                trace!(url, attempt = index, status = %response.status(), "Ping answered without 200");
                false
            }
            Err(e) => {
                trace!(url, attempt = index, error = %e, "Ping attempt failed");
                false
            }
        }
    }
}

#[async_trait]
impl OnlineProbe for HttpOnlineProbe {
    async fn is_online(&self, endpoint: &str) -> bool {
        if endpoint.is_empty() {
            return false;
        }

        let url = format!("http://{}/ping", endpoint);
        let started = Instant::now();
        let mut attempts: FuturesUnordered<_> = (0..self.attempts).map(|i| self.attempt(&url, i)).collect();

        let mut online = false;
        while let Some(ok) = attempts.next().await {
            if ok {
                online = true;
                break;
            }
        }

        debug!(endpoint, online, elapsed = ?started.elapsed(), "Exit node probe finished");
        metrics::exit_node_probe(online, started.elapsed().as_secs_f64());
        online
    }
}
