//! End-to-end tests for the multi-proposer coordinator.
//!
//! Real n-gram backends are mixed with mock model-stepping backends. All
//! tests are CPU-only.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use candle_core::Device;
use multi_proposer_core::{
    config::{MultiProposerConfig, StrategyConfig},
    request::{Batch, RequestId, SequenceItem, StrategyId},
    spec_decode::{
        MultiProposer, NGramBackend, NGramConfig, ProposalSet, ProposerBackend, ProposerError,
        Result, SchedulePolicy, SmallerTpProposer, StrategyRegistry,
    },
    testing::{batch_with_assignments, MockSteppingBackend, TaggingBackend},
};

const FALLBACK: &str = "[ngram]";

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Tags proposals like `TaggingBackend`, after sleeping for a fixed delay.
struct SlowBackend {
    inner: TaggingBackend,
    delay: Duration,
}

impl SlowBackend {
    fn new(name: &str, tag: u32, delay_ms: u64) -> Self {
        Self {
            inner: TaggingBackend::new(name, tag),
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl ProposerBackend for SlowBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_spec_proposals(
        &self,
        batch: &Batch,
        bonus: &HashSet<RequestId>,
    ) -> Result<ProposalSet> {
        thread::sleep(self.delay);
        self.inner.get_spec_proposals(batch, bonus)
    }
}

fn tags(proposals: &ProposalSet) -> Vec<u32> {
    proposals
        .proposal_token_ids
        .iter()
        .map(|ids| ids[0])
        .collect()
}

fn ngram_registry() -> StrategyRegistry {
    StrategyRegistry::new(
        FALLBACK,
        Arc::new(NGramBackend::new(FALLBACK, NGramConfig::default())),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn partitioned_order_holds_when_partitions_finish_out_of_order() {
    // The first-listed strategy is the slowest, so it finishes last.
    let registry = StrategyRegistry::new(FALLBACK, Arc::new(SlowBackend::new(FALLBACK, 100, 10)))
        .with("A", Arc::new(SlowBackend::new("A", 1, 120)))
        .unwrap()
        .with("B", Arc::new(SlowBackend::new("B", 2, 0)))
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let mut batch = batch_with_assignments(&[Some("A"), Some(FALLBACK), Some("A"), Some("B")]);
    let proposals = proposer
        .propose_partitioned(&mut batch, HashSet::new())
        .await
        .unwrap();

    assert_eq!(tags(&proposals), vec![1, 100, 1, 2]);
    let request_ids: Vec<u32> = proposals
        .proposal_token_ids
        .iter()
        .map(|ids| ids[1])
        .collect();
    assert_eq!(request_ids, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn partitioned_mode_with_real_ngram_backends() {
    let registry = ngram_registry()
        .with(
            "[ngram-3]",
            Arc::new(NGramBackend::new(
                "[ngram-3]",
                NGramConfig {
                    min_n: 3,
                    max_n: 3,
                    num_speculative_tokens: 5,
                },
            )),
        )
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let history = vec![1, 2, 3, 9, 1, 2, 3];
    let mut batch = Batch::new(
        vec![
            SequenceItem::new(0, history.clone()).with_proposer("[ngram-3]"),
            SequenceItem::new(1, vec![4, 4]),
            SequenceItem::new(2, vec![1, 2, 8, 2]).with_proposer("[ngram-3]"),
        ],
        2,
    );
    let proposals = proposer
        .propose_partitioned(&mut batch, HashSet::new())
        .await
        .unwrap();

    assert_eq!(proposals.proposal_token_ids[0], vec![9, 1]);
    assert_eq!(proposals.proposal_token_ids[1], vec![4]);
    assert!(proposals.proposal_token_ids[2].is_empty());
    assert_eq!(proposals.proposal_lens, vec![2, 1, 0]);

    let tensors = proposals.to_tensors(2, &Device::Cpu).unwrap();
    assert_eq!(
        tensors.token_ids.to_vec2::<i64>().unwrap(),
        vec![vec![9, 1], vec![4, -1], vec![-1, -1]]
    );
}

#[tokio::test]
async fn partitioned_failure_returns_no_partial_result() {
    struct Broken;
    impl ProposerBackend for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn get_spec_proposals(
            &self,
            _batch: &Batch,
            _bonus: &HashSet<RequestId>,
        ) -> Result<ProposalSet> {
            Err(ProposerError::backend("broken", "device lost"))
        }
    }

    let fallback = Arc::new(TaggingBackend::new(FALLBACK, 0));
    let registry = StrategyRegistry::new(FALLBACK, fallback.clone())
        .with("broken", Arc::new(Broken))
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let mut batch = batch_with_assignments(&[None, Some("broken")]);
    let err = proposer
        .propose_partitioned(&mut batch, HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProposerError::PartitionDispatch { .. }));
    // The healthy partition still ran to completion before the failure surfaced.
    assert_eq!(fallback.calls(), 1);
}

#[test]
fn single_strategy_and_execution_paths_share_a_batch() {
    let draft = Arc::new(MockSteppingBackend::new("draft", 7));
    let registry = ngram_registry()
        .with("draft", draft.clone())
        .unwrap()
        .with(
            "draft-tp",
            Arc::new(SmallerTpProposer::wrap(Arc::new(MockSteppingBackend::new(
                "draft-tp", 8,
            )))),
        )
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let mut batch = batch_with_assignments(&[Some("eagle"), Some("draft"), None]);

    // Selection ignores the unknown strategy and picks the draft model, then
    // the unknown assignment is rewritten to the fallback.
    let proposals = proposer
        .propose_for_batch(&mut batch, &HashSet::new())
        .unwrap();
    assert_eq!(tags(&proposals), vec![7, 7, 7]);
    assert_eq!(
        batch.seqs[0].proposer().map(StrategyId::as_str),
        Some(FALLBACK)
    );

    // The execution step runs the whole batch on the draft.
    let outputs = proposer.delegate_execution_step(Some(&mut batch)).unwrap();
    assert_eq!(draft.execute_calls(), 1);
    assert_eq!(outputs[0].outputs.len(), 3);

    // With the coerced assignment the fallback now wins selection outright.
    let proposals = proposer
        .propose_for_batch(&mut batch, &HashSet::new())
        .unwrap();
    assert_eq!(proposals.len(), 3);
    assert_eq!(draft.proposal_calls(), 1);
}

#[tokio::test]
async fn every_proposal_path_rewrites_unknown_assignments() {
    let registry = StrategyRegistry::new(FALLBACK, Arc::new(TaggingBackend::new(FALLBACK, 0)))
        .with("A", Arc::new(TaggingBackend::new("A", 1)))
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();
    let assigned = |batch: &Batch| -> Vec<Option<String>> {
        batch
            .iter()
            .map(|seq| seq.proposer().map(|id| id.as_str().to_string()))
            .collect()
    };
    let expected = vec![Some(FALLBACK.to_string()), Some("A".to_string())];

    let mut batch = batch_with_assignments(&[Some("medusa"), Some("A")]);
    let proposals = proposer
        .propose_for_batch(&mut batch, &HashSet::new())
        .unwrap();
    assert_eq!(tags(&proposals), vec![1, 1]);
    assert_eq!(assigned(&batch), expected);

    let mut batch = batch_with_assignments(&[Some("medusa"), Some("A")]);
    let proposals = proposer
        .propose_partitioned(&mut batch, HashSet::new())
        .await
        .unwrap();
    assert_eq!(tags(&proposals), vec![0, 1]);
    assert_eq!(assigned(&batch), expected);

    let mut batch = batch_with_assignments(&[Some("medusa"), Some("A")]);
    assert!(proposer
        .delegate_execution_step(Some(&mut batch))
        .unwrap()
        .is_empty());
    assert_eq!(assigned(&batch), expected);
}

#[test]
fn wrapped_model_stepping_backend_executes_through_wrapper() {
    let inner = Arc::new(MockSteppingBackend::new("draft-tp", 8));
    let registry = ngram_registry()
        .with("draft-tp", Arc::new(SmallerTpProposer::wrap(inner.clone())))
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let mut batch = batch_with_assignments(&[None, Some("draft-tp")]);
    let outputs = proposer.delegate_execution_step(Some(&mut batch)).unwrap();
    assert_eq!(inner.execute_calls(), 1);
    assert_eq!(outputs[0].outputs[0].token_id, 8);

    assert_eq!(
        proposer.get_cache_block_size_bytes(),
        inner.block_size_bytes()
    );
}

#[test]
fn non_participating_rank_never_executes() {
    let registry = ngram_registry()
        .with(
            "draft",
            Arc::new(SmallerTpProposer::non_participating("draft")),
        )
        .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let mut batch = batch_with_assignments(&[Some("draft"), Some("draft")]);
    assert!(proposer
        .delegate_execution_step(Some(&mut batch))
        .unwrap()
        .is_empty());
    let proposals = proposer
        .propose_for_batch(&mut batch, &HashSet::new())
        .unwrap();
    assert_eq!(proposals.proposal_lens, vec![0, 0]);
    assert_eq!(proposer.determine_num_available_blocks().unwrap(), None);
}

#[test]
fn config_built_coordinator_selects_by_configured_policy() {
    let config = MultiProposerConfig {
        schedule_policy: SchedulePolicy::Popularity,
        strategies: vec![
            StrategyConfig::ngram("[ngram-a]"),
            StrategyConfig::ngram("[ngram-b]"),
        ],
        ..MultiProposerConfig::default()
    };
    let proposer = MultiProposer::from_config(&config).unwrap();
    let batch = batch_with_assignments(&[Some("[ngram-b]"), Some("[ngram-a]"), Some("[ngram-a]")]);

    let chosen = proposer
        .select_strategy(&batch, config.schedule_policy)
        .unwrap();
    assert_eq!(chosen.as_str(), "[ngram-a]");

    let latency = proposer
        .select_strategy(&batch, SchedulePolicy::ProposalLatency)
        .unwrap();
    assert_eq!(latency.as_str(), "[ngram-a]");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn stress_partitions_run_concurrently() {
    let delay_ms = 200;
    let registry = StrategyRegistry::new(
        FALLBACK,
        Arc::new(SlowBackend::new(FALLBACK, 0, delay_ms)),
    )
    .with("A", Arc::new(SlowBackend::new("A", 1, delay_ms)))
    .unwrap()
    .with("B", Arc::new(SlowBackend::new("B", 2, delay_ms)))
    .unwrap();
    let proposer = MultiProposer::new(registry, 1).unwrap();

    let assignments: Vec<Option<&str>> = (0..300)
        .map(|i| match i % 3 {
            0 => Some("A"),
            1 => Some("B"),
            _ => None,
        })
        .collect();
    let mut batch = batch_with_assignments(&assignments);

    let start = Instant::now();
    let proposals = proposer
        .propose_partitioned(&mut batch, HashSet::new())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(proposals.len(), 300);
    let expected: Vec<u32> = (0..300).map(|i| [1, 2, 0][i % 3]).collect();
    assert_eq!(tags(&proposals), expected);
    assert!(
        elapsed < Duration::from_millis(3 * delay_ms - 100),
        "partitions ran sequentially: {elapsed:?}"
    );
}
