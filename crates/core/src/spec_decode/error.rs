//! Error types for multi-proposer coordination.

use thiserror::Error;

use crate::request::StrategyId;

/// Errors surfaced by the coordinator and by proposer backends.
///
/// Unknown strategy assignments are not represented here: they are coerced to
/// the fallback strategy and only logged.
#[derive(Error, Debug)]
pub enum ProposerError {
    /// Selection policy name not recognized.
    #[error("invalid schedule_policy: '{0}'")]
    UnsupportedPolicy(String),

    /// Operation or policy that is reserved but has no implementation.
    #[error("'{0}' has not been implemented yet")]
    NotImplemented(String),

    /// A backend failed while serving one partition of a combined call.
    /// The whole call fails; no partial proposals are returned.
    #[error("proposer '{strategy}' failed during partitioned dispatch: {source}")]
    PartitionDispatch {
        strategy: StrategyId,
        #[source]
        source: Box<ProposerError>,
    },

    /// Internal invariant violation while merging partition results.
    #[error("proposal merge inconsistency: {0}")]
    MergeConsistency(String),

    /// Failure reported by a proposer backend.
    #[error("proposer '{strategy}' error: {message}")]
    Backend {
        strategy: StrategyId,
        message: String,
    },

    /// Invalid registry or coordinator configuration.
    #[error("invalid multi-proposer configuration: {0}")]
    Config(String),

    /// A dispatched partition task panicked or was cancelled.
    #[error("partition task failed: {0}")]
    TaskJoin(String),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl ProposerError {
    pub fn backend(strategy: impl Into<StrategyId>, message: impl Into<String>) -> Self {
        Self::Backend {
            strategy: strategy.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProposerError>;
