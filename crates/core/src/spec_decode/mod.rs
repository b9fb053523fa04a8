//! Multi-proposer speculative decoding.
//!
//! Several proposal strategies can be registered side by side. Each sequence
//! in a batch may ask for one of them; the [`MultiProposer`] decides which
//! strategy serves the batch and dispatches the work.
//!
//! Backends implement [`ProposerBackend`]. Backends that also own a draft
//! model and can run a full forward step additionally implement
//! [`ModelSteppingBackend`] and expose it through
//! [`ProposerBackend::as_model_stepping`]. Wrappers such as
//! [`SmallerTpProposer`] expose their wrapped backend via
//! [`ProposerBackend::inner`] so the capability probe can see through them.
//!
//! Two proposal paths exist:
//! - [`MultiProposer::propose_for_batch`]: one strategy for the whole batch,
//!   chosen by the latency-greedy [`SchedulePolicy`].
//! - [`MultiProposer::propose_partitioned`]: every sequence goes to its own
//!   strategy; partitions run concurrently and are merged back in batch order.

pub mod capability;
mod error;
mod multi_proposer;
mod ngram;
pub mod partition;
mod registry;
pub mod selector;
mod smaller_tp;
mod types;

use std::collections::HashSet;

pub use error::{ProposerError, Result};
pub use multi_proposer::MultiProposer;
pub use ngram::{NGramBackend, NGramConfig};
pub use registry::StrategyRegistry;
pub use selector::SchedulePolicy;
pub use smaller_tp::SmallerTpProposer;
pub use types::{
    CacheBlockCounts, ProposalSet, ProposalTensors, SamplerOutput, SequenceOutput,
    SequenceProposal,
};

use crate::request::{Batch, RequestId};

/// A proposal strategy.
///
/// Backends are shared across concurrently running partitions, so every
/// method takes `&self`; backends with mutable state use interior
/// mutability.
pub trait ProposerBackend: Send + Sync {
    /// Name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Produce proposals for every sequence in `batch`, in batch order.
    ///
    /// The result must contain exactly `batch.len()` entries. Sequences the
    /// backend cannot help with get a zero-length entry. On failure no
    /// partial result is returned.
    fn get_spec_proposals(
        &self,
        batch: &Batch,
        seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet>;

    /// Prepare the device this backend runs on.
    fn init_device(&self) -> Result<()> {
        Ok(())
    }

    /// Load model weights, if any.
    fn load_model(&self) -> Result<()> {
        Ok(())
    }

    /// Full model-step capability, if this backend has it directly.
    fn as_model_stepping(&self) -> Option<&dyn ModelSteppingBackend> {
        None
    }

    /// Wrapped backend, for transparent wrappers.
    fn inner(&self) -> Option<&dyn ProposerBackend> {
        None
    }
}

/// Extended capability of backends that own a draft model and its KV cache.
pub trait ModelSteppingBackend: Send + Sync {
    /// Ask the draft sampler to keep per-token probability tensors.
    fn set_include_gpu_probs_tensor(&self);

    /// Number of KV cache blocks that fit on the GPU and in CPU swap space.
    fn determine_num_available_blocks(&self) -> Result<CacheBlockCounts>;

    /// Allocate the KV cache.
    fn initialize_cache(&self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()>;

    /// Size in bytes of one KV cache block.
    fn get_cache_block_size_bytes(&self) -> usize;

    /// Run one full forward step of the draft model over `batch`.
    fn execute_model(&self, batch: &Batch) -> Result<Vec<SamplerOutput>>;
}
