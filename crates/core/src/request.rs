//! Per-request batch types consumed by the multi-proposer coordinator.
//!
//! A [`Batch`] is an ordered list of [`SequenceItem`]s. Position in the batch
//! is the only identity the coordinator relies on when it reassembles
//! per-sequence proposal results.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type RequestId = u64;

/// Strategy tag used when no (or an unknown) proposer is requested.
pub const DEFAULT_FALLBACK_STRATEGY: &str = "[ngram]";

/// Opaque identifier of a registered proposal strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(String);

impl StrategyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StrategyId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StrategyId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for StrategyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One in-flight sequence plus its optional proposer preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceItem {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    #[serde(default)]
    pub output_token_ids: Vec<u32>,
    /// Requested proposal strategy. `None` means "no preference".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proposer: Option<StrategyId>,
}

impl SequenceItem {
    pub fn new(request_id: RequestId, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            request_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            proposer: None,
        }
    }

    pub fn with_output(mut self, output_token_ids: Vec<u32>) -> Self {
        self.output_token_ids = output_token_ids;
        self
    }

    pub fn with_proposer(mut self, proposer: impl Into<StrategyId>) -> Self {
        self.proposer = Some(proposer.into());
        self
    }

    pub fn proposer(&self) -> Option<&StrategyId> {
        self.proposer.as_ref()
    }

    /// Overwrite the requested strategy. Used when an unknown strategy is
    /// coerced to the fallback.
    pub fn set_proposer(&mut self, proposer: impl Into<StrategyId>) {
        self.proposer = Some(proposer.into());
    }

    pub fn clear_proposer(&mut self) {
        self.proposer = None;
    }

    /// Prompt followed by generated tokens.
    pub fn token_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.prompt_token_ids
            .iter()
            .chain(self.output_token_ids.iter())
            .copied()
    }

    pub fn num_tokens(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }
}

/// An ordered batch of sequences for one speculative step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Batch {
    pub seqs: Vec<SequenceItem>,
    /// Maximum number of tokens any proposer may propose per sequence.
    pub num_lookahead_slots: usize,
}

impl Batch {
    pub fn new(seqs: Vec<SequenceItem>, num_lookahead_slots: usize) -> Self {
        Self {
            seqs,
            num_lookahead_slots,
        }
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SequenceItem> {
        self.seqs.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, SequenceItem> {
        self.seqs.iter_mut()
    }

    /// Build a sub-batch holding clones of the sequences at `indices`, in
    /// the given order, with the same per-call parameters.
    ///
    /// Panics if an index is out of range.
    pub fn subset(&self, indices: &[usize]) -> Batch {
        Batch {
            seqs: indices.iter().map(|&i| self.seqs[i].clone()).collect(),
            num_lookahead_slots: self.num_lookahead_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_chain_prompt_and_output() {
        let seq = SequenceItem::new(7, vec![1, 2]).with_output(vec![3]);
        assert_eq!(seq.token_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(seq.num_tokens(), 3);
    }

    #[test]
    fn set_proposer_overwrites_assignment() {
        let mut seq = SequenceItem::new(0, vec![]).with_proposer("eagle");
        assert_eq!(seq.proposer().map(StrategyId::as_str), Some("eagle"));
        seq.set_proposer(DEFAULT_FALLBACK_STRATEGY);
        assert_eq!(
            seq.proposer().map(StrategyId::as_str),
            Some(DEFAULT_FALLBACK_STRATEGY)
        );
        seq.clear_proposer();
        assert!(seq.proposer().is_none());
    }

    #[test]
    fn subset_keeps_requested_order_and_params() {
        let batch = Batch::new(
            (0..4).map(|i| SequenceItem::new(i, vec![i as u32])).collect(),
            5,
        );
        let sub = batch.subset(&[3, 1]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.seqs[0].request_id, 3);
        assert_eq!(sub.seqs[1].request_id, 1);
        assert_eq!(sub.num_lookahead_slots, 5);
    }

    #[test]
    fn sequence_deserializes_without_optional_fields() {
        let seq: SequenceItem =
            serde_json::from_str(r#"{"request_id": 4, "prompt_token_ids": [9, 9]}"#).unwrap();
        assert_eq!(seq.request_id, 4);
        assert!(seq.output_token_ids.is_empty());
        assert!(seq.proposer().is_none());
    }

    #[test]
    fn sequence_deserializes_proposer() {
        let seq: SequenceItem = serde_json::from_str(
            r#"{"request_id": 1, "prompt_token_ids": [], "proposer": "[ngram]"}"#,
        )
        .unwrap();
        assert_eq!(seq.proposer(), Some(&StrategyId::from("[ngram]")));
    }
}
