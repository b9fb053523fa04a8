//! Shared test utilities for multi-proposer-core.
//!
//! Mock proposer backends and batch builders for unit and integration
//! tests. None of the mocks run a model.

mod mock_backend;

pub use mock_backend::{FailingBackend, MockSteppingBackend, TaggingBackend};

use crate::request::{Batch, SequenceItem};

/// Batch with one sequence per assignment. Sequence `i` gets request id `i`
/// and prompt `[i]`; lookahead is 3.
pub fn batch_with_assignments(assignments: &[Option<&str>]) -> Batch {
    let seqs = assignments
        .iter()
        .enumerate()
        .map(|(i, assignment)| {
            let seq = SequenceItem::new(i as u64, vec![i as u32]);
            match assignment {
                Some(name) => seq.with_proposer(*name),
                None => seq,
            }
        })
        .collect();
    Batch::new(seqs, 3)
}
