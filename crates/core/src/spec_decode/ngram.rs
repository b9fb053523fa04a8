//! N-gram prompt-lookup backend, the default fallback strategy.
//!
//! For every sequence, the longest suffix of its token history (prompt plus
//! generated tokens) that also occurs earlier in that history is located, and
//! the tokens that followed the earlier occurrence become the proposal. Pure
//! CPU work with no model or cache, so the backend is heuristic-only.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::request::{Batch, RequestId};

use super::error::Result;
use super::types::{ProposalSet, SequenceProposal};
use super::ProposerBackend;

/// Configuration for [`NGramBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NGramConfig {
    /// Shortest suffix worth matching (inclusive).
    pub min_n: usize,
    /// Longest suffix considered (inclusive).
    pub max_n: usize,
    /// Upper bound on proposed tokens, in addition to the batch's lookahead.
    pub num_speculative_tokens: usize,
}

impl Default for NGramConfig {
    fn default() -> Self {
        Self {
            min_n: 1,
            max_n: 5,
            num_speculative_tokens: 5,
        }
    }
}

/// Heuristic proposer that looks continuations up in the sequence itself.
#[derive(Debug)]
pub struct NGramBackend {
    name: String,
    config: NGramConfig,
}

impl NGramBackend {
    pub fn new(name: impl Into<String>, config: NGramConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &NGramConfig {
        &self.config
    }

    fn propose_one(&self, history: &[u32], max_tokens: usize) -> SequenceProposal {
        let k = max_tokens.min(self.config.num_speculative_tokens);
        let token_ids = find_ngram_proposals(history, self.config.min_n, self.config.max_n, k);
        // A looked-up continuation is proposed with full confidence.
        let probs = vec![1.0; token_ids.len()];
        SequenceProposal::new(token_ids, probs)
    }
}

impl ProposerBackend for NGramBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_spec_proposals(
        &self,
        batch: &Batch,
        _seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        let mut history = Vec::new();
        Ok(batch
            .iter()
            .map(|seq| {
                history.clear();
                history.extend(seq.token_ids());
                self.propose_one(&history, batch.num_lookahead_slots)
            })
            .collect())
    }
}

/// Tokens following the earliest occurrence of the longest repeated suffix.
///
/// Suffix lengths are tried from `max_n` down to `min_n`; the first length
/// with an earlier occurrence wins. An occurrence counts only if at least one
/// token follows it. At most `k` tokens are returned; an empty vec means
/// nothing matched.
fn find_ngram_proposals(tokens: &[u32], min_n: usize, max_n: usize, k: usize) -> Vec<u32> {
    let total = tokens.len();
    if k == 0 || total < 2 {
        return Vec::new();
    }

    let shortest = min_n.max(1);
    let longest = max_n.min(total - 1);
    for n in (shortest..=longest).rev() {
        let suffix = &tokens[total - n..];
        let Some(start) = tokens[..total - 1]
            .windows(n)
            .position(|window| window == suffix)
        else {
            continue;
        };
        let from = start + n;
        let take = k.min(total - from);
        return tokens[from..from + take].to_vec();
    }
    Vec::new()
}
