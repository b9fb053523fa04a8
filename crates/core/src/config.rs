//! Multi-proposer configuration.
//!
//! Loaded from TOML, e.g.:
//!
//! ```toml
//! fallback_strategy = "[ngram]"
//! schedule_policy = "proposal_latency"
//! num_speculative_tokens = 3
//!
//! [[strategies]]
//! name = "[ngram-long]"
//! kind = "ngram"
//! min_n = 3
//! max_n = 8
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::DEFAULT_FALLBACK_STRATEGY;
use crate::spec_decode::{NGramConfig, ProposerError, SchedulePolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Kind of backend a configured strategy is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Prompt-lookup n-gram matching.
    #[default]
    Ngram,
}

/// One registered strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default)]
    pub kind: StrategyKind,
    #[serde(default = "default_min_n")]
    pub min_n: usize,
    #[serde(default = "default_max_n")]
    pub max_n: usize,
    /// Overrides the top-level `num_speculative_tokens` for this strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_speculative_tokens: Option<usize>,
    /// Run behind a smaller tensor-parallel group wrapper.
    #[serde(default)]
    pub smaller_tp: bool,
}

fn default_min_n() -> usize {
    NGramConfig::default().min_n
}

fn default_max_n() -> usize {
    NGramConfig::default().max_n
}

impl StrategyConfig {
    /// N-gram strategy with default matching parameters.
    pub fn ngram(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StrategyKind::Ngram,
            min_n: default_min_n(),
            max_n: default_max_n(),
            num_speculative_tokens: None,
            smaller_tp: false,
        }
    }

    /// N-gram parameters. `default_num_speculative_tokens` applies when the
    /// entry does not set its own proposal length.
    pub fn ngram_config(&self, default_num_speculative_tokens: usize) -> NGramConfig {
        NGramConfig {
            min_n: self.min_n,
            max_n: self.max_n,
            num_speculative_tokens: self
                .num_speculative_tokens
                .unwrap_or(default_num_speculative_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiProposerConfig {
    /// Strategy used when a sequence asks for none or for an unknown one.
    pub fallback_strategy: String,
    /// Policy used for batch-wide selection queries.
    pub schedule_policy: SchedulePolicy,
    /// Default proposal length.
    pub num_speculative_tokens: usize,
    /// Tensor-parallel size of draft models. Only 1 is supported.
    pub draft_tensor_parallel_size: usize,
    pub strategies: Vec<StrategyConfig>,
}

impl Default for MultiProposerConfig {
    fn default() -> Self {
        Self {
            fallback_strategy: DEFAULT_FALLBACK_STRATEGY.to_string(),
            schedule_policy: SchedulePolicy::default(),
            num_speculative_tokens: 3,
            draft_tensor_parallel_size: 1,
            strategies: Vec::new(),
        }
    }
}

impl MultiProposerConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn strategy(&self, name: &str) -> Option<&StrategyConfig> {
        self.strategies.iter().find(|s| s.name == name)
    }

    /// N-gram parameters for strategies without an explicit entry.
    pub fn default_ngram_config(&self) -> NGramConfig {
        NGramConfig {
            num_speculative_tokens: self.num_speculative_tokens,
            ..NGramConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ProposerError> {
        if self.fallback_strategy.is_empty() {
            return Err(ProposerError::Config(
                "fallback_strategy must not be empty".to_string(),
            ));
        }
        if self.draft_tensor_parallel_size != 1 {
            return Err(ProposerError::Config(format!(
                "draft_tensor_parallel_size cannot be other than 1, got {}",
                self.draft_tensor_parallel_size
            )));
        }
        let mut seen = HashSet::new();
        for entry in &self.strategies {
            if !seen.insert(entry.name.as_str()) {
                return Err(ProposerError::Config(format!(
                    "strategy '{}' is listed more than once",
                    entry.name
                )));
            }
            if entry.min_n == 0 || entry.min_n > entry.max_n {
                return Err(ProposerError::Config(format!(
                    "strategy '{}': need 0 < min_n <= max_n, got {}..={}",
                    entry.name, entry.min_n, entry.max_n
                )));
            }
        }
        Ok(())
    }
}
