//! Partitioned proposal dispatch.
//!
//! A batch whose sequences ask for different strategies is split into one
//! partition per strategy. Partitions run concurrently on the blocking pool,
//! and once every one of them has finished the per-sequence results are
//! scattered back to their original batch positions.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::request::{Batch, RequestId, StrategyId};

use super::error::{ProposerError, Result};
use super::registry::StrategyRegistry;
use super::types::{ProposalSet, SequenceProposal};

/// Sequences of one batch routed to a single strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub strategy: StrategyId,
    /// Original batch positions of the members, ascending.
    pub indices: Vec<usize>,
}

/// Group batch positions by resolved strategy.
///
/// Absent and unknown assignments resolve to the fallback. Partitions are
/// ordered by first appearance in the batch and every index `0..batch.len()`
/// appears in exactly one partition.
pub fn partition_batch(registry: &StrategyRegistry, batch: &Batch) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();
    for (idx, seq) in batch.iter().enumerate() {
        let strategy = registry.resolve(seq.proposer());
        match partitions.iter_mut().find(|p| &p.strategy == strategy) {
            Some(partition) => partition.indices.push(idx),
            None => partitions.push(Partition {
                strategy: strategy.clone(),
                indices: vec![idx],
            }),
        }
    }
    partitions
}

/// Run every non-empty partition on its backend concurrently.
///
/// Waits for all partitions before returning. If any partition fails, the
/// whole dispatch fails with the first failure in partition order.
pub async fn dispatch_partitions(
    registry: &StrategyRegistry,
    batch: &Batch,
    partitions: Vec<Partition>,
    seq_ids_with_bonus_token_in_last_step: Arc<HashSet<RequestId>>,
) -> Result<Vec<(Partition, ProposalSet)>> {
    let partitions: Vec<Partition> = partitions
        .into_iter()
        .filter(|p| !p.indices.is_empty())
        .collect();

    let tasks = partitions.iter().map(|partition| {
        let backend = Arc::clone(registry.backend_for(&partition.strategy));
        let sub_batch = batch.subset(&partition.indices);
        let bonus = Arc::clone(&seq_ids_with_bonus_token_in_last_step);
        debug!(
            strategy = %partition.strategy,
            num_seqs = sub_batch.len(),
            "dispatching partition"
        );
        tokio::task::spawn_blocking(move || backend.get_spec_proposals(&sub_batch, &bonus))
    });

    let joined = join_all(tasks).await;

    let mut results = Vec::with_capacity(partitions.len());
    for (partition, outcome) in partitions.into_iter().zip(joined) {
        let proposals = match outcome {
            Ok(Ok(proposals)) => proposals,
            Ok(Err(e)) => {
                return Err(ProposerError::PartitionDispatch {
                    strategy: partition.strategy,
                    source: Box::new(e),
                })
            }
            Err(e) => {
                return Err(ProposerError::PartitionDispatch {
                    strategy: partition.strategy,
                    source: Box::new(ProposerError::TaskJoin(e.to_string())),
                })
            }
        };
        results.push((partition, proposals));
    }
    Ok(results)
}

/// Scatter partition results back into batch order.
///
/// Every position `0..batch_len` must be written exactly once, and each
/// partition must return one entry per member. Anything else is a
/// `MergeConsistency` error.
pub fn merge_partitions(
    batch_len: usize,
    results: Vec<(Partition, ProposalSet)>,
) -> Result<ProposalSet> {
    let mut slots: Vec<Option<SequenceProposal>> = (0..batch_len).map(|_| None).collect();

    for (partition, proposals) in results {
        if !proposals.is_aligned() || proposals.len() != partition.indices.len() {
            warn!(
                strategy = %partition.strategy,
                expected = partition.indices.len(),
                got = proposals.len(),
                "proposer returned wrong number of proposals"
            );
            return Err(ProposerError::MergeConsistency(format!(
                "strategy '{}' returned {} proposals for {} sequences",
                partition.strategy,
                proposals.len(),
                partition.indices.len()
            )));
        }

        for (&idx, proposal) in partition.indices.iter().zip(proposals.into_entries()) {
            let slot = slots.get_mut(idx).ok_or_else(|| {
                ProposerError::MergeConsistency(format!(
                    "index {idx} out of range for batch of {batch_len}"
                ))
            })?;
            if slot.is_some() {
                return Err(ProposerError::MergeConsistency(format!(
                    "index {idx} written by more than one partition"
                )));
            }
            *slot = Some(proposal);
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.ok_or_else(|| {
                ProposerError::MergeConsistency(format!("index {idx} was not filled"))
            })
        })
        .collect()
}

/// Partition, dispatch and merge in one call.
pub async fn propose_partitioned(
    registry: &StrategyRegistry,
    batch: &Batch,
    seq_ids_with_bonus_token_in_last_step: Arc<HashSet<RequestId>>,
) -> Result<ProposalSet> {
    if batch.is_empty() {
        return Ok(ProposalSet::default());
    }
    let partitions = partition_batch(registry, batch);
    let results =
        dispatch_partitions(registry, batch, partitions, seq_ids_with_bonus_token_in_last_step)
            .await?;
    merge_partitions(batch.len(), results)
}
