//! Batch-wide strategy selection.
//!
//! When the downstream scorer can only follow one execution path per step,
//! a single strategy has to serve every sequence in the batch. The policies
//! here pick it from the per-sequence assignments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::{Batch, StrategyId};

use super::error::{ProposerError, Result};
use super::registry::StrategyRegistry;

/// How to pick one strategy for a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Prefer the fallback outright; otherwise the last valid request wins.
    ///
    /// No timings are measured. The fallback (n-gram lookup) is assumed to
    /// be the fastest proposer, and batches are assumed to carry at most one
    /// other strategy.
    #[default]
    ProposalLatency,
    /// Most requested valid strategy; ties go to the one requested first.
    Popularity,
    /// Reserved for acceptance-rate based selection.
    ProposalQuality,
}

impl SchedulePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProposalLatency => "proposal_latency",
            Self::Popularity => "popularity",
            Self::ProposalQuality => "proposal_quality",
        }
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulePolicy {
    type Err = ProposerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proposal_latency" => Ok(Self::ProposalLatency),
            "popularity" => Ok(Self::Popularity),
            "proposal_quality" => Ok(Self::ProposalQuality),
            other => Err(ProposerError::UnsupportedPolicy(other.to_string())),
        }
    }
}

/// Pick the strategy that serves all of `batch` under `policy`.
///
/// The returned id is always registered. The batch is not modified.
pub fn select_strategy(
    registry: &StrategyRegistry,
    batch: &Batch,
    policy: SchedulePolicy,
) -> Result<StrategyId> {
    let chosen = match policy {
        SchedulePolicy::ProposalLatency => select_latency_greedy(registry, batch),
        SchedulePolicy::Popularity => select_most_popular(registry, batch),
        SchedulePolicy::ProposalQuality => {
            // TODO: rank strategies by observed acceptance rate once the scorer
            // reports per-strategy acceptance metrics.
            return Err(ProposerError::NotImplemented(format!(
                "schedule_policy: {policy}"
            )));
        }
    };
    debug!(policy = %policy, strategy = %chosen, batch_size = batch.len(), "selected proposer");
    Ok(chosen.clone())
}

/// Parse `policy` and select. Unknown names fail with `UnsupportedPolicy`.
pub fn select_strategy_by_name(
    registry: &StrategyRegistry,
    batch: &Batch,
    policy: &str,
) -> Result<StrategyId> {
    select_strategy(registry, batch, policy.parse()?)
}

fn select_latency_greedy<'a>(registry: &'a StrategyRegistry, batch: &'a Batch) -> &'a StrategyId {
    let mut chosen = registry.fallback();
    for requested in batch.iter().filter_map(|seq| seq.proposer()) {
        if registry.is_fallback(requested) {
            return registry.fallback();
        }
        if registry.contains(requested) {
            chosen = requested;
        }
    }
    chosen
}

fn select_most_popular<'a>(registry: &'a StrategyRegistry, batch: &'a Batch) -> &'a StrategyId {
    // Insertion-ordered tally keeps the tie-break independent of hashing.
    let mut counts: Vec<(&StrategyId, usize)> = Vec::new();
    for requested in batch.iter().filter_map(|seq| seq.proposer()) {
        if !registry.contains(requested) {
            continue;
        }
        match counts.iter_mut().find(|(id, _)| *id == requested) {
            Some((_, count)) => *count += 1,
            None => counts.push((requested, 1)),
        }
    }

    let mut best: Option<(&StrategyId, usize)> = None;
    for (id, count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((id, count));
        }
    }
    best.map_or(registry.fallback(), |(id, _)| id)
}
