//! Transparent wrapper for draft backends running on a subset of ranks.
//!
//! When the draft model uses a smaller tensor-parallel group than the target
//! model, only ranks inside that group hold the real backend. The remaining
//! ranks hold a wrapper without an inner backend: it proposes nothing and is
//! classified as heuristic.

use std::collections::HashSet;
use std::sync::Arc;

use crate::request::{Batch, RequestId};

use super::error::Result;
use super::types::ProposalSet;
use super::ProposerBackend;

pub struct SmallerTpProposer {
    name: String,
    inner: Option<Arc<dyn ProposerBackend>>,
}

impl SmallerTpProposer {
    /// Wrap a backend that runs on this rank.
    pub fn wrap(inner: Arc<dyn ProposerBackend>) -> Self {
        Self {
            name: inner.name().to_string(),
            inner: Some(inner),
        }
    }

    /// Placeholder on a rank outside the draft's tensor-parallel group.
    pub fn non_participating(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: None,
        }
    }

    pub fn is_participating(&self) -> bool {
        self.inner.is_some()
    }
}

impl ProposerBackend for SmallerTpProposer {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_spec_proposals(
        &self,
        batch: &Batch,
        seq_ids_with_bonus_token_in_last_step: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        match &self.inner {
            Some(inner) => inner.get_spec_proposals(batch, seq_ids_with_bonus_token_in_last_step),
            None => Ok(ProposalSet::empty(batch.len())),
        }
    }

    fn init_device(&self) -> Result<()> {
        match &self.inner {
            Some(inner) => inner.init_device(),
            None => Ok(()),
        }
    }

    fn load_model(&self) -> Result<()> {
        match &self.inner {
            Some(inner) => inner.load_model(),
            None => Ok(()),
        }
    }

    fn inner(&self) -> Option<&dyn ProposerBackend> {
        self.inner.as_deref()
    }
}
