//! Proposal and execution result types.

use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::request::RequestId;

use super::error::Result;

// ─── Proposals ────────────────────────────────────────────────────────────

/// Proposal for a single sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequenceProposal {
    pub token_ids: Vec<u32>,
    /// Draft probability of each proposed token, aligned with `token_ids`.
    pub probs: Vec<f32>,
    /// Number of proposed tokens. Zero means no proposal was made.
    pub len: usize,
}

impl SequenceProposal {
    pub fn new(token_ids: Vec<u32>, probs: Vec<f32>) -> Self {
        let len = token_ids.len();
        Self {
            token_ids,
            probs,
            len,
        }
    }

    /// A sequence for which the proposer had nothing to offer.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Order-aligned proposals for a batch: entry `i` belongs to sequence `i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProposalSet {
    pub proposal_token_ids: Vec<Vec<u32>>,
    pub proposal_probs: Vec<Vec<f32>>,
    pub proposal_lens: Vec<usize>,
}

impl ProposalSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            proposal_token_ids: Vec::with_capacity(capacity),
            proposal_probs: Vec::with_capacity(capacity),
            proposal_lens: Vec::with_capacity(capacity),
        }
    }

    /// `n` entries, all without a proposal.
    pub fn empty(n: usize) -> Self {
        (0..n).map(|_| SequenceProposal::none()).collect()
    }

    pub fn push(&mut self, proposal: SequenceProposal) {
        self.proposal_token_ids.push(proposal.token_ids);
        self.proposal_probs.push(proposal.probs);
        self.proposal_lens.push(proposal.len);
    }

    pub fn len(&self) -> usize {
        self.proposal_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposal_lens.is_empty()
    }

    /// True when the three parallel vectors have the same length.
    pub fn is_aligned(&self) -> bool {
        self.proposal_token_ids.len() == self.proposal_lens.len()
            && self.proposal_probs.len() == self.proposal_lens.len()
    }

    pub fn get(&self, index: usize) -> Option<SequenceProposal> {
        Some(SequenceProposal {
            token_ids: self.proposal_token_ids.get(index)?.clone(),
            probs: self.proposal_probs.get(index)?.clone(),
            len: *self.proposal_lens.get(index)?,
        })
    }

    pub fn into_entries(self) -> impl Iterator<Item = SequenceProposal> {
        self.proposal_token_ids
            .into_iter()
            .zip(self.proposal_probs)
            .zip(self.proposal_lens)
            .map(|((token_ids, probs), len)| SequenceProposal {
                token_ids,
                probs,
                len,
            })
    }

    /// Stack into dense tensors of width `k` for the scorer.
    ///
    /// Token ids are padded with -1 and probabilities with 0. Proposals
    /// longer than `k` are truncated.
    pub fn to_tensors(&self, k: usize, device: &Device) -> Result<ProposalTensors> {
        let n = self.len();
        let mut token_ids = vec![-1i64; n * k];
        let mut probs = vec![0f32; n * k];
        let mut lens = Vec::with_capacity(n);

        for (row, ((ids, ps), &len)) in self
            .proposal_token_ids
            .iter()
            .zip(&self.proposal_probs)
            .zip(&self.proposal_lens)
            .enumerate()
        {
            let width = len.min(k).min(ids.len());
            for col in 0..width {
                token_ids[row * k + col] = i64::from(ids[col]);
                probs[row * k + col] = ps.get(col).copied().unwrap_or(0.0);
            }
            lens.push(width as i64);
        }

        Ok(ProposalTensors {
            token_ids: Tensor::from_vec(token_ids, (n, k), device)?,
            probs: Tensor::from_vec(probs, (n, k), device)?,
            lens: Tensor::from_vec(lens, n, device)?,
        })
    }
}

impl FromIterator<SequenceProposal> for ProposalSet {
    fn from_iter<I: IntoIterator<Item = SequenceProposal>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut set = ProposalSet::with_capacity(iter.size_hint().0);
        for proposal in iter {
            set.push(proposal);
        }
        set
    }
}

/// Dense tensor view of a [`ProposalSet`].
#[derive(Debug, Clone)]
pub struct ProposalTensors {
    /// `[batch, k]`, i64, -1 padded.
    pub token_ids: Tensor,
    /// `[batch, k]`, f32, zero padded.
    pub probs: Tensor,
    /// `[batch]`, i64.
    pub lens: Tensor,
}

// ─── Execution step results ──────────────────────────────────────────────

/// Token sampled for one sequence during a model step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceOutput {
    pub request_id: RequestId,
    pub token_id: u32,
    pub logprob: f32,
}

/// Output of one model execution step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplerOutput {
    pub outputs: Vec<SequenceOutput>,
}

/// Cache blocks a model-stepping backend can hold on each device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheBlockCounts {
    pub num_gpu_blocks: usize,
    pub num_cpu_blocks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_zero_lengths() {
        let set = ProposalSet::empty(3);
        assert_eq!(set.proposal_lens, vec![0, 0, 0]);
        assert!(set.proposal_token_ids.iter().all(Vec::is_empty));
        assert!(set.is_aligned());
    }

    #[test]
    fn get_returns_aligned_fields() {
        let set: ProposalSet = vec![
            SequenceProposal::new(vec![4, 5], vec![0.5, 0.25]),
            SequenceProposal::none(),
        ]
        .into_iter()
        .collect();
        let first = set.get(0).unwrap();
        assert_eq!(first.token_ids, vec![4, 5]);
        assert_eq!(first.probs, vec![0.5, 0.25]);
        assert_eq!(first.len, 2);
        assert_eq!(set.get(1).unwrap().len, 0);
        assert!(set.get(2).is_none());
    }

    #[test]
    fn to_tensors_pads_and_truncates() {
        let set: ProposalSet = vec![
            SequenceProposal::new(vec![1, 2, 3], vec![0.9, 0.8, 0.7]),
            SequenceProposal::none(),
        ]
        .into_iter()
        .collect();
        let tensors = set.to_tensors(2, &Device::Cpu).unwrap();
        assert_eq!(tensors.token_ids.dims(), &[2, 2]);
        assert_eq!(
            tensors.token_ids.to_vec2::<i64>().unwrap(),
            vec![vec![1, 2], vec![-1, -1]]
        );
        assert_eq!(
            tensors.probs.to_vec2::<f32>().unwrap(),
            vec![vec![0.9, 0.8], vec![0.0, 0.0]]
        );
        assert_eq!(tensors.lens.to_vec1::<i64>().unwrap(), vec![2, 0]);
    }
}
