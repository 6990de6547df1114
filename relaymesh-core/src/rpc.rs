//! Outbound RPC error type and the per-call timeout wrapper

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Target unreachable: {0}")]
    Unreachable(String),
}

impl RpcError {
    /// Metric label for the failure
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Timeout(_) => "timeout",
            RpcError::Transport(_) => "transport",
            RpcError::InvalidRequest(_) => "invalid",
            RpcError::Unreachable(_) => "unreachable",
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

/// Run `call` with a deadline and record its outcome
pub async fn call_with_timeout<T, F>(method: &'static str, timeout: Duration, call: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(timeout)),
    };
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::peer_rpc(method, outcome, started.elapsed().as_secs_f64());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let result: Result<(), RpcError> = call_with_timeout("add_peer", Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(RpcError::Timeout(Duration::from_secs(10))));
    }

    #[tokio::test]
    async fn test_call_passes_result_through() {
        let ok = call_with_timeout("delete_peer", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<(), _> = call_with_timeout("delete_peer", Duration::from_secs(1), async {
            Err(RpcError::Unreachable("site 4".to_string()))
        })
        .await;
        assert_eq!(err.unwrap_err().kind(), "unreachable");
    }
}
