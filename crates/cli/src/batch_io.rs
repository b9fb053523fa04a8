//! JSON batch input and report output for the CLI.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use multi_proposer_core::request::{Batch, RequestId, SequenceItem, StrategyId};
use multi_proposer_core::spec_decode::ProposalSet;

/// Batch description read from disk.
///
/// ```json
/// {
///   "num_lookahead_slots": 3,
///   "sequences": [
///     {"request_id": 0, "prompt_token_ids": [1, 2, 1], "proposer": "[ngram]"}
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    /// Falls back to the config's `num_speculative_tokens` when absent.
    #[serde(default)]
    pub num_lookahead_slots: Option<usize>,
    pub sequences: Vec<SequenceItem>,
    #[serde(default)]
    pub seq_ids_with_bonus_token_in_last_step: Vec<RequestId>,
}

impl BatchFile {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read batch file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse batch file {}", path.display()))
    }

    pub fn into_parts(self, default_lookahead: usize) -> (Batch, HashSet<RequestId>) {
        let batch = Batch::new(
            self.sequences,
            self.num_lookahead_slots.unwrap_or(default_lookahead),
        );
        let bonus = self
            .seq_ids_with_bonus_token_in_last_step
            .into_iter()
            .collect();
        (batch, bonus)
    }
}

/// What `propose` prints.
#[derive(Debug, Serialize)]
pub struct ProposeReport {
    pub mode: &'static str,
    /// Strategy serving the whole batch; absent in partitioned mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyId>,
    /// Per-sequence assignment in batch order, after unknown strategies were
    /// rewritten to the fallback.
    pub assignments: Vec<Option<StrategyId>>,
    pub proposals: ProposalSet,
}

pub fn assignments(batch: &Batch) -> Vec<Option<StrategyId>> {
    batch.iter().map(|seq| seq.proposer().cloned()).collect()
}
