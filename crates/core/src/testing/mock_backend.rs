use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::request::{Batch, RequestId};
use crate::spec_decode::{
    CacheBlockCounts, ModelSteppingBackend, ProposalSet, ProposerBackend, ProposerError, Result,
    SamplerOutput, SequenceOutput, SequenceProposal,
};

/// Proposal `[tag, request_id]` with probabilities `[1.0, 0.5]` for every
/// sequence, so tests can tell which backend served which position.
fn tagged_proposals(tag: u32, batch: &Batch) -> ProposalSet {
    batch
        .iter()
        .map(|seq| SequenceProposal::new(vec![tag, seq.request_id as u32], vec![1.0, 0.5]))
        .collect()
}

/// Heuristic backend that tags its proposals and records what it was asked.
pub struct TaggingBackend {
    name: String,
    tag: u32,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<RequestId>>>,
}

impl TaggingBackend {
    pub fn new(name: impl Into<String>, tag: u32) -> Self {
        Self {
            name: name.into(),
            tag,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request ids of each sub-batch this backend received, per call.
    pub fn seen_request_ids(&self) -> Vec<Vec<RequestId>> {
        self.seen.lock().unwrap().clone()
    }
}

impl ProposerBackend for TaggingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_spec_proposals(
        &self,
        batch: &Batch,
        _seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(batch.iter().map(|seq| seq.request_id).collect());
        Ok(tagged_proposals(self.tag, batch))
    }
}

/// Model-stepping backend that records lifecycle and execution calls.
pub struct MockSteppingBackend {
    name: String,
    tag: u32,
    proposal_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    init_device_calls: AtomicUsize,
    load_model_calls: AtomicUsize,
    include_gpu_probs: AtomicBool,
    initialized_cache: Mutex<Option<(usize, usize)>>,
}

impl MockSteppingBackend {
    const BLOCK_SIZE_BYTES: usize = 16 * 1024;
    const AVAILABLE_BLOCKS: CacheBlockCounts = CacheBlockCounts {
        num_gpu_blocks: 128,
        num_cpu_blocks: 16,
    };

    pub fn new(name: impl Into<String>, tag: u32) -> Self {
        Self {
            name: name.into(),
            tag,
            proposal_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            init_device_calls: AtomicUsize::new(0),
            load_model_calls: AtomicUsize::new(0),
            include_gpu_probs: AtomicBool::new(false),
            initialized_cache: Mutex::new(None),
        }
    }

    pub fn proposal_calls(&self) -> usize {
        self.proposal_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn init_device_calls(&self) -> usize {
        self.init_device_calls.load(Ordering::SeqCst)
    }

    pub fn load_model_calls(&self) -> usize {
        self.load_model_calls.load(Ordering::SeqCst)
    }

    pub fn include_gpu_probs(&self) -> bool {
        self.include_gpu_probs.load(Ordering::SeqCst)
    }

    pub fn initialized_cache(&self) -> Option<(usize, usize)> {
        *self.initialized_cache.lock().unwrap()
    }

    pub fn block_size_bytes(&self) -> usize {
        Self::BLOCK_SIZE_BYTES
    }

    pub fn available_blocks(&self) -> CacheBlockCounts {
        Self::AVAILABLE_BLOCKS
    }
}

impl ProposerBackend for MockSteppingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_spec_proposals(
        &self,
        batch: &Batch,
        _seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        self.proposal_calls.fetch_add(1, Ordering::SeqCst);
        Ok(tagged_proposals(self.tag, batch))
    }

    fn init_device(&self) -> Result<()> {
        self.init_device_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_model(&self) -> Result<()> {
        self.load_model_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_model_stepping(&self) -> Option<&dyn ModelSteppingBackend> {
        Some(self)
    }
}

impl ModelSteppingBackend for MockSteppingBackend {
    fn set_include_gpu_probs_tensor(&self) {
        self.include_gpu_probs.store(true, Ordering::SeqCst);
    }

    fn determine_num_available_blocks(&self) -> Result<CacheBlockCounts> {
        Ok(Self::AVAILABLE_BLOCKS)
    }

    fn initialize_cache(&self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()> {
        *self.initialized_cache.lock().unwrap() = Some((num_gpu_blocks, num_cpu_blocks));
        Ok(())
    }

    fn get_cache_block_size_bytes(&self) -> usize {
        Self::BLOCK_SIZE_BYTES
    }

    /// One sampler output covering every sequence, token = tag.
    fn execute_model(&self, batch: &Batch) -> Result<Vec<SamplerOutput>> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let outputs = batch
            .iter()
            .map(|seq| SequenceOutput {
                request_id: seq.request_id,
                token_id: self.tag,
                logprob: 0.0,
            })
            .collect();
        Ok(vec![SamplerOutput { outputs }])
    }
}

/// Backend whose proposal generation always fails.
pub struct FailingBackend {
    name: String,
}

impl FailingBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProposerBackend for FailingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_spec_proposals(
        &self,
        _batch: &Batch,
        _seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        Err(ProposerError::backend(self.name.as_str(), "proposal generation failed"))
    }
}
