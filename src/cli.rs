//! Command-line interface.
//!
//! Two subcommands: `ca init` materializes the local root CA and prints its
//! paths, and `run` starts the proxy with a headless observer that drains
//! bus events into the log.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use crate::bus::{Event, EventBus};
use crate::ca::CertificateAuthority;
use crate::proxy::{ProxyConfig, ProxyServer};

#[derive(Parser, Debug)]
#[command(name = "lokiproxy")]
#[command(about = "Interactive HTTP(S) intercepting proxy for local, authorized security testing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Certificate authority utilities.
    Ca {
        #[command(subcommand)]
        command: CaCommand,
    },
    /// Run the proxy.
    Run(RunArgs),
}

#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Generate (or load) the local root CA and print its paths.
    Init,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}

/// `ca init`: ensure the root exists and report where it lives.
pub fn run_ca_init() -> anyhow::Result<()> {
    let ca = CertificateAuthority::open_default()?;
    println!(
        "CA material ready:\n  {}\n  {}",
        ca.cert_path().display(),
        ca.key_path().display()
    );
    println!("Install ca.pem in the client under test (local, authorized use only).");
    Ok(())
}

/// `run`: serve until Ctrl-C, logging bus events as they arrive.
pub async fn run_proxy(args: RunArgs) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::new());
    let config = ProxyConfig {
        host: args.host,
        port: args.port,
        ..ProxyConfig::default()
    };
    let proxy = ProxyServer::new(config, bus.clone())?;
    proxy.start().await?;

    let observer = tokio::spawn(async move {
        while let Some(event) = bus.next_event().await {
            match event {
                Event::LogMessage { msg } => tracing::info!("{msg}"),
                other => tracing::debug!(?other, "flow event"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    proxy.stop().await;
    observer.abort();
    Ok(())
}
