use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use multi_proposer_core::{
    config::MultiProposerConfig,
    spec_decode::{MultiProposer, SchedulePolicy},
};
use multi_proposer_cli::batch_io::{self, BatchFile, ProposeReport};
use multi_proposer_cli::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "multi-proposer",
    about = "Route speculative-decoding proposals across strategies"
)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate proposals for a batch
    Propose {
        /// Proposer configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Batch description (JSON)
        #[arg(long)]
        batch: PathBuf,

        /// Serve every sequence with its own strategy instead of one
        /// strategy for the whole batch
        #[arg(long)]
        partitioned: bool,
    },
    /// Print the strategy a policy would pick for a batch
    Select {
        /// Proposer configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Batch description (JSON)
        #[arg(long)]
        batch: PathBuf,

        /// proposal_latency, popularity or proposal_quality.
        /// Defaults to the configured schedule_policy.
        #[arg(long)]
        policy: Option<String>,
    },
}

#[derive(Serialize)]
struct SelectReport {
    policy: SchedulePolicy,
    strategy: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, LogFormat::from_env())?;

    match cli.command {
        Command::Propose {
            config,
            batch,
            partitioned,
        } => {
            let config = load_config(&config)?;
            let proposer = build_proposer(&config)?;
            let (mut batch, bonus) =
                BatchFile::read(&batch)?.into_parts(config.num_speculative_tokens);
            info!(
                num_seqs = batch.len(),
                num_lookahead_slots = batch.num_lookahead_slots,
                partitioned,
                "proposing"
            );

            let report = if partitioned {
                let proposals = proposer
                    .propose_partitioned(&mut batch, bonus)
                    .await
                    .context("partitioned proposal failed")?;
                ProposeReport {
                    mode: "partitioned",
                    strategy: None,
                    assignments: batch_io::assignments(&batch),
                    proposals,
                }
            } else {
                let strategy = proposer
                    .select_strategy(&batch, SchedulePolicy::ProposalLatency)
                    .context("strategy selection failed")?;
                let proposals = proposer
                    .propose_for_batch(&mut batch, &bonus)
                    .context("proposal failed")?;
                ProposeReport {
                    mode: "single",
                    strategy: Some(strategy),
                    assignments: batch_io::assignments(&batch),
                    proposals,
                }
            };
            print_json(&report)
        }
        Command::Select {
            config,
            batch,
            policy,
        } => {
            let config = load_config(&config)?;
            let policy = match policy {
                Some(name) => name.parse::<SchedulePolicy>()?,
                None => config.schedule_policy,
            };
            let proposer = build_proposer(&config)?;
            let (batch, _) = BatchFile::read(&batch)?.into_parts(config.num_speculative_tokens);

            let strategy = proposer
                .select_strategy(&batch, policy)
                .with_context(|| format!("selection under '{policy}' failed"))?;
            print_json(&SelectReport {
                policy,
                strategy: strategy.to_string(),
            })
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<MultiProposerConfig> {
    MultiProposerConfig::load_from(path)
        .with_context(|| format!("failed to load config {}", path.display()))
}

fn build_proposer(config: &MultiProposerConfig) -> anyhow::Result<MultiProposer> {
    let proposer = MultiProposer::from_config(config).context("invalid proposer config")?;
    proposer.init_device()?;
    proposer.load_model()?;
    Ok(proposer)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
