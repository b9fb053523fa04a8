//! Coordinator over several registered proposal strategies.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{MultiProposerConfig, StrategyKind};
use crate::request::{Batch, RequestId, SequenceItem, StrategyId};

use super::capability::model_stepping_handle;
use super::error::{ProposerError, Result};
use super::ngram::NGramBackend;
use super::partition;
use super::registry::StrategyRegistry;
use super::selector::{select_strategy, SchedulePolicy};
use super::smaller_tp::SmallerTpProposer;
use super::types::{CacheBlockCounts, ProposalSet, SamplerOutput};
use super::{ModelSteppingBackend, ProposerBackend};

/// Serves speculative proposals for batches whose sequences may each request
/// a different proposal strategy.
///
/// By default one strategy serves the whole batch (see
/// [`propose_for_batch`](Self::propose_for_batch)): mixing strategies in one
/// step makes every fast proposer wait for the slowest one before scoring.
/// Callers that want per-sequence strategies anyway opt into
/// [`propose_partitioned`](Self::propose_partitioned).
pub struct MultiProposer {
    registry: StrategyRegistry,
}

impl MultiProposer {
    /// Only a draft tensor-parallel size of 1 is supported.
    pub fn new(registry: StrategyRegistry, draft_tensor_parallel_size: usize) -> Result<Self> {
        if draft_tensor_parallel_size != 1 {
            return Err(ProposerError::Config(format!(
                "draft tensor parallel size cannot be other than 1 with multiple \
                 proposers, got {draft_tensor_parallel_size}"
            )));
        }
        Ok(Self { registry })
    }

    /// Build the registry from configuration. Strategies not listed are
    /// not available; the fallback is added with defaults if missing.
    pub fn from_config(config: &MultiProposerConfig) -> Result<Self> {
        config.validate()?;

        let fallback = StrategyId::new(config.fallback_strategy.as_str());
        let build = |name: &str| -> Arc<dyn ProposerBackend> {
            match config.strategy(name) {
                Some(entry) => {
                    let backend: Arc<dyn ProposerBackend> = match entry.kind {
                        StrategyKind::Ngram => {
                            Arc::new(NGramBackend::new(
                                name,
                                entry.ngram_config(config.num_speculative_tokens),
                            ))
                        }
                    };
                    if entry.smaller_tp {
                        Arc::new(SmallerTpProposer::wrap(backend))
                    } else {
                        backend
                    }
                }
                None => Arc::new(NGramBackend::new(name, config.default_ngram_config())),
            }
        };

        let mut registry = StrategyRegistry::new(fallback.clone(), build(fallback.as_str()));
        for entry in &config.strategies {
            if entry.name == config.fallback_strategy {
                continue;
            }
            registry.register(entry.name.as_str(), build(&entry.name))?;
        }

        info!(
            strategies = ?registry.ids().map(StrategyId::as_str).collect::<Vec<_>>(),
            fallback = %fallback,
            "multi-proposer initialized"
        );
        Self::new(registry, config.draft_tensor_parallel_size)
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn fallback(&self) -> &StrategyId {
        self.registry.fallback()
    }

    // ─── Broadcast lifecycle ──────────────────────────────────────────────

    pub fn init_device(&self) -> Result<()> {
        for (_, backend) in self.registry.iter() {
            backend.init_device()?;
        }
        Ok(())
    }

    pub fn load_model(&self) -> Result<()> {
        for (_, backend) in self.registry.iter() {
            backend.load_model()?;
        }
        Ok(())
    }

    pub fn set_include_gpu_probs_tensor(&self) {
        for stepping in self.model_stepping_backends() {
            stepping.set_include_gpu_probs_tensor();
        }
    }

    /// Block size of the first model-stepping backend, or 0 if there is none.
    pub fn get_cache_block_size_bytes(&self) -> usize {
        self.model_stepping_backends()
            .next()
            .map_or(0, |stepping| stepping.get_cache_block_size_bytes())
    }

    /// Available blocks reported by the first model-stepping backend.
    /// `None` when every registered strategy is heuristic.
    pub fn determine_num_available_blocks(&self) -> Result<Option<CacheBlockCounts>> {
        self.model_stepping_backends()
            .next()
            .map(|stepping| stepping.determine_num_available_blocks())
            .transpose()
    }

    /// Allocate caches on every model-stepping backend.
    pub fn initialize_cache(&self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()> {
        for stepping in self.model_stepping_backends() {
            stepping.initialize_cache(num_gpu_blocks, num_cpu_blocks)?;
        }
        Ok(())
    }

    fn model_stepping_backends(&self) -> impl Iterator<Item = &dyn ModelSteppingBackend> + '_ {
        self.registry
            .iter()
            .filter_map(|(_, backend)| model_stepping_handle(backend.as_ref()))
    }

    // ─── Proposals ────────────────────────────────────────────────────────

    /// Pick one strategy for the batch under `policy`.
    pub fn select_strategy(&self, batch: &Batch, policy: SchedulePolicy) -> Result<StrategyId> {
        select_strategy(&self.registry, batch, policy)
    }

    /// Proposals for the whole batch from the single strategy chosen by the
    /// latency-greedy policy.
    ///
    /// The strategy is chosen from the assignments as submitted, so unknown
    /// ids do not take part in the choice. They are then rewritten to the
    /// fallback in place.
    pub fn propose_for_batch(
        &self,
        batch: &mut Batch,
        seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        let chosen = self.select_strategy(batch, SchedulePolicy::ProposalLatency)?;
        self.coerce_unknown_assignments(batch);
        self.registry
            .backend_for(&chosen)
            .get_spec_proposals(batch, seq_ids_with_bonus_token_in_last_step)
    }

    /// Proposals from each sequence's own strategy, computed concurrently and
    /// returned in batch order. Unknown assignments are rewritten to the
    /// fallback in place before partitioning.
    pub async fn propose_partitioned(
        &self,
        batch: &mut Batch,
        seq_ids_with_bonus_token_in_last_step: HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        self.coerce_unknown_assignments(batch);
        partition::propose_partitioned(
            &self.registry,
            batch,
            Arc::new(seq_ids_with_bonus_token_in_last_step),
        )
        .await
    }

    /// The coordinator never samples on its own; each strategy samples
    /// inside its backend.
    pub fn sampler_output(
        &self,
        _batch: &Batch,
        _sample_len: usize,
    ) -> Result<Vec<SamplerOutput>> {
        Err(ProposerError::NotImplemented(
            "sampler_output for the multi-proposer".to_string(),
        ))
    }

    // ─── Model execution ──────────────────────────────────────────────────

    /// Run a draft model step for the batch, if any sequence needs one.
    ///
    /// Unknown assignments are rewritten to the fallback strategy in place.
    /// The first sequence whose strategy is model-stepping decides the
    /// backend, and the entire batch is executed there. Returns an empty
    /// result when `batch` is absent or empty, or when no sequence needs a
    /// model step.
    pub fn delegate_execution_step(
        &self,
        batch: Option<&mut Batch>,
    ) -> Result<Vec<SamplerOutput>> {
        // Non-driver ranks poll with no request to keep collective ops going.
        let Some(batch) = batch else {
            return Ok(Vec::new());
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut target = None;
        for seq in batch.iter_mut() {
            let Some(resolved) = self.coerce_assignment(seq) else {
                continue;
            };
            let backend = self.registry.backend_for(&resolved);
            if let Some(stepping) = model_stepping_handle(backend.as_ref()) {
                target = Some((resolved, stepping));
                break;
            }
        }

        let Some((strategy, stepping)) = target else {
            debug!(batch_size = batch.len(), "no model-stepping proposer requested");
            return Ok(Vec::new());
        };
        debug!(strategy = %strategy, batch_size = batch.len(), "delegating model step");
        stepping.execute_model(batch)
    }

    fn coerce_unknown_assignments(&self, batch: &mut Batch) {
        for seq in batch.iter_mut() {
            self.coerce_assignment(seq);
        }
    }

    /// Rewrite an unregistered assignment to the fallback and return the
    /// resolved strategy. `None` when the sequence has no assignment.
    fn coerce_assignment(&self, seq: &mut SequenceItem) -> Option<StrategyId> {
        let requested = seq.proposer()?;
        if self.registry.contains(requested) {
            return Some(requested.clone());
        }
        let fallback = self.registry.fallback();
        info!(
            request_id = seq.request_id,
            requested = %requested,
            valid = ?self.registry.ids().map(StrategyId::as_str).collect::<Vec<_>>(),
            replacement = %fallback,
            "unknown proposer requested, using fallback"
        );
        seq.set_proposer(fallback.clone());
        Some(fallback.clone())
    }
}

impl std::fmt::Debug for MultiProposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiProposer")
            .field("registry", &self.registry)
            .finish()
    }
}
