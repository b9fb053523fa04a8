//! Heuristic vs. model-stepping classification of proposer backends.
//!
//! Wrapper chains are followed through [`ProposerBackend::inner`]. Chains are
//! assumed to be finite and acyclic; this is not checked.

use super::{ModelSteppingBackend, ProposerBackend};

/// Whether `backend`, or the backend it wraps, can run a full model step.
pub fn is_model_stepping(backend: &dyn ProposerBackend) -> bool {
    model_stepping_handle(backend).is_some()
}

/// The first model-stepping capability found while unwrapping `backend`.
pub fn model_stepping_handle(backend: &dyn ProposerBackend) -> Option<&dyn ModelSteppingBackend> {
    match backend.as_model_stepping() {
        Some(stepping) => Some(stepping),
        None => backend.inner().and_then(model_stepping_handle),
    }
}
