//! Command-line interface for regress-forge.
//!
//! One command: process a single issue end to end. The exit code encodes
//! the terminal state:
//!
//! | code | meaning |
//! |---|---|
//! | 0 | candidate accepted and delivered |
//! | 1 | retry budget exhausted (generation at fault) |
//! | 2 | retry budget exhausted on infrastructure failure |
//! | 3 | delivery to the tracker failed |
//! | 4 | provisioning/configuration failure |
//! | 5 | cancelled or deadline exceeded |

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use crate::config::{RunnerConfig, RuntimeProfile};
use crate::error::OrchestrationError;
use crate::generator::LlmGenerator;
use crate::handoff::ArtifactHandoff;
use crate::llm::ChatClient;
use crate::orchestrator::{cancel_pair, OrchestrationResult, Orchestrator};
use crate::sandbox::{DockerEnvironment, SandboxConfig};
use crate::tracker::{GitLabTracker, Tracker};
use crate::verifier::ExecutionVerifier;

/// Generate, sandbox-verify and deliver a regression test for one tracker issue.
#[derive(Parser)]
#[command(name = "regress-forge")]
#[command(about = "Turn tracker bug reports into sandbox-verified regression tests")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process one issue: generate candidates, verify them in a sandbox,
    /// deliver the verified test (or a diagnostic report) to the tracker.
    #[command(alias = "run")]
    Process(ProcessArgs),
}

/// Arguments for the `process` command.
#[derive(Parser, Debug)]
pub struct ProcessArgs {
    /// Issue id to process.
    #[arg(long)]
    pub issue: u64,

    /// Retry budget: maximum generation attempts.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Docker image providing the runtime under test.
    #[arg(long, env = "REGRESS_FORGE_IMAGE")]
    pub image: Option<String>,

    /// Model for candidate generation.
    #[arg(long, env = "REGRESS_FORGE_LLM_MODEL")]
    pub model: Option<String>,

    /// Wall-clock deadline for the run, in seconds.
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// Admission limit on concurrently active sandboxes.
    #[arg(long, default_value_t = 4)]
    pub max_active: usize,

    /// Skip delivery: print the terminal state without posting to the
    /// tracker.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command; returns the process exit code.
pub async fn run_with_cli(cli: Cli) -> i32 {
    match cli.command {
        Commands::Process(args) => run_process(args).await,
    }
}

async fn run_process(args: ProcessArgs) -> i32 {
    let mut profile = RuntimeProfile::yottadb();
    if let Some(image) = &args.image {
        profile = profile.with_image(image.clone());
    }

    let llm = match ChatClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "LLM client configuration failed");
            return 4;
        }
    };
    let mut generator = LlmGenerator::new(llm);
    if let Some(model) = &args.model {
        generator = generator.with_model(model.clone());
    }

    let tracker = match GitLabTracker::from_env() {
        Ok(tracker) => tracker,
        Err(e) => {
            error!(error = %e, "Tracker configuration failed");
            return 4;
        }
    };

    let env = match DockerEnvironment::new(args.max_active) {
        Ok(env) => Arc::new(env),
        Err(e) => {
            error!(error = %e, "Docker daemon not available");
            return 4;
        }
    };

    let sandbox_config = SandboxConfig::new(profile.image.clone());
    let mut runner_config = RunnerConfig::new()
        .with_max_retries(args.retries)
        .with_max_active_sandboxes(args.max_active);
    if let Some(secs) = args.deadline_secs {
        runner_config = runner_config.with_deadline(Duration::from_secs(secs));
    }

    let orchestrator = Orchestrator::new(
        env,
        Arc::new(generator),
        ExecutionVerifier::new(profile),
        sandbox_config,
        runner_config,
    );

    let issue = match tracker.fetch_issue(args.issue).await {
        Ok(issue) => issue,
        Err(e) => {
            error!(issue = args.issue, error = %e, "Failed to fetch issue");
            return 4;
        }
    };

    // Operator abort via Ctrl-C; the sandbox is still released.
    let (cancel_handle, cancel_signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel_handle.cancel();
        }
    });

    let result = match orchestrator.process_with_cancel(&issue, cancel_signal).await {
        Ok(result) => result,
        Err(OrchestrationError::Cancelled) => {
            error!(issue = issue.iid, "Run cancelled");
            return 5;
        }
        Err(OrchestrationError::DeadlineExceeded(deadline)) => {
            error!(issue = issue.iid, ?deadline, "Run exceeded its deadline");
            return 5;
        }
        Err(e) => {
            error!(issue = issue.iid, error = %e, "Run failed");
            return 4;
        }
    };

    info!(
        issue = issue.iid,
        terminal = result.label(),
        attempts = result.attempts().len(),
        "Run complete"
    );

    if args.dry_run {
        info!("Dry run: skipping delivery");
        return terminal_exit_code(&result);
    }

    match ArtifactHandoff::deliver(&tracker, &issue, &result).await {
        Ok(receipt) => {
            info!(issue = issue.iid, note = ?receipt.note_id, "Result delivered");
            terminal_exit_code(&result)
        }
        Err(e) => {
            error!(issue = issue.iid, error = %e, "Delivery failed");
            3
        }
    }
}

fn terminal_exit_code(result: &OrchestrationResult) -> i32 {
    match result {
        OrchestrationResult::Accepted { .. } => 0,
        OrchestrationResult::Exhausted { .. } => 1,
        OrchestrationResult::EscalatedInfra { .. } => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_process_args_defaults() {
        let cli = Cli::try_parse_from(["regress-forge", "process", "--issue", "684"]).unwrap();
        let Commands::Process(args) = cli.command;
        assert_eq!(args.issue, 684);
        assert_eq!(args.retries, 3);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_terminal_exit_codes() {
        let exhausted = OrchestrationResult::Exhausted {
            attempts: Vec::new(),
            last_error: String::new(),
        };
        assert_eq!(terminal_exit_code(&exhausted), 1);

        let infra = OrchestrationResult::EscalatedInfra {
            attempts: Vec::new(),
            last_error: String::new(),
        };
        assert_eq!(terminal_exit_code(&infra), 2);
    }
}
