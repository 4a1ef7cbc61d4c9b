//! regress-forge CLI entry point.
//!
//! Initializes logging, runs the selected command, and exits with a code
//! that distinguishes the run's terminal state (see [`regress_forge::cli`]).

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = regress_forge::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let code = regress_forge::cli::run_with_cli(cli).await;
    std::process::exit(code);
}
