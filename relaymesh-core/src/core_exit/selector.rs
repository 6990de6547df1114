//! Exit node selection from agent ping results
//!
//! Picks the lowest-latency node that still has capacity, prefers the node
//! the agent was already connected to when staying costs little latency, and
//! falls back to the least loaded node when every node is near capacity.

use std::cmp::Ordering;
use tracing::debug;

use super::types::ExitNodePingResult;
use crate::config::ExitNodeConfig;
use crate::metrics;

/// Which rule produced a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// Lowest latency node, which has capacity
    LowestLatency,
    /// Lowest latency node with capacity, the fastest ones being overloaded
    NextWithCapacity,
    /// Previously connected node within latency tolerance of the best one
    Sticky,
    /// No node has capacity; least loaded reachable node
    Fallback,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::LowestLatency => "lowest_latency",
            SelectionReason::NextWithCapacity => "next_with_capacity",
            SelectionReason::Sticky => "sticky",
            SelectionReason::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection<'a> {
    pub result: &'a ExitNodePingResult,
    pub reason: SelectionReason,
}

/// Pure selection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ExitNodeSelector {
    min_capacity_weight: f64,
    latency_tolerance_ms: f64,
    latency_tolerance_ratio: f64,
}

impl Default for ExitNodeSelector {
    fn default() -> Self {
        Self::from_config(&ExitNodeConfig::default())
    }
}

impl ExitNodeSelector {
    pub fn new(min_capacity_weight: f64, latency_tolerance_ms: f64, latency_tolerance_ratio: f64) -> Self {
        Self { min_capacity_weight, latency_tolerance_ms, latency_tolerance_ratio }
    }

    pub fn from_config(config: &ExitNodeConfig) -> Self {
        Self::new(
            config.min_capacity_weight,
            config.latency_tolerance_ms,
            config.latency_tolerance_ratio,
        )
    }

    /// Best result, or `None` when every result carries an error
    pub fn select<'a>(&self, results: &'a [ExitNodePingResult]) -> Option<&'a ExitNodePingResult> {
        self.select_with_reason(results).map(|s| s.result)
    }

    pub fn select_with_reason<'a>(&self, results: &'a [ExitNodePingResult]) -> Option<Selection<'a>> {
        let selection = self.choose(results);
        match &selection {
            Some(s) => {
                debug!(
                    exit_node_id = %s.result.exit_node_id,
                    exit_node = %s.result.exit_node_name,
                    latency_ms = s.result.latency_ms,
                    weight = s.result.weight,
                    reason = s.reason.as_str(),
                    candidates = results.len(),
                    "Selected exit node"
                );
                metrics::exit_node_selected(s.reason.as_str());
            }
            None => {
                debug!(candidates = results.len(), "No reachable exit node to select");
                metrics::exit_node_selected("none");
            }
        }
        selection
    }

    fn has_capacity(&self, result: &ExitNodePingResult) -> bool {
        result.weight >= self.min_capacity_weight
    }

    fn within_tolerance(&self, latency_ms: f64, best_latency_ms: f64) -> bool {
        latency_ms - best_latency_ms <= self.latency_tolerance_ms
            || latency_ms <= best_latency_ms * (1.0 + self.latency_tolerance_ratio)
    }

    fn choose<'a>(&self, results: &'a [ExitNodePingResult]) -> Option<Selection<'a>> {
        let mut candidates: Vec<&ExitNodePingResult> =
            results.iter().filter(|r| r.is_ok() && r.weight > 0.0).collect();
        candidates.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));

        let best = candidates.iter().position(|c| self.has_capacity(c));
        let Some(best_index) = best else {
            return self.fallback(results);
        };
        let best = candidates[best_index];
        if best_index > 0 {
            // Fastest node is overloaded: no stickiness, take the next one with room
            return Some(Selection { result: best, reason: SelectionReason::NextWithCapacity });
        }

        let previous = candidates
            .iter()
            .copied()
            .find(|c| c.was_previously_connected && self.has_capacity(c));
        if let Some(previous) = previous {
            if !std::ptr::eq(previous, best) && self.within_tolerance(previous.latency_ms, best.latency_ms) {
                return Some(Selection { result: previous, reason: SelectionReason::Sticky });
            }
        }

        Some(Selection { result: best, reason: SelectionReason::LowestLatency })
    }

    /// Highest weight among error-free results, ties going to lower latency
    fn fallback<'a>(&self, results: &'a [ExitNodePingResult]) -> Option<Selection<'a>> {
        results
            .iter()
            .filter(|r| r.is_ok())
            .min_by(|a, b| match b.weight.total_cmp(&a.weight) {
                Ordering::Equal => a.latency_ms.total_cmp(&b.latency_ms),
                other => other,
            })
            .map(|result| Selection { result, reason: SelectionReason::Fallback })
    }
}
