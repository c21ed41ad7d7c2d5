//! LokiProxy - Main entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lokiproxy::cli::{CaCommand, Cli, Command, run_ca_init, run_proxy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ca {
            command: CaCommand::Init,
        } => run_ca_init(),
        Command::Run(args) => run_proxy(args).await,
    }
}
