//! vmimport
//!
//! Pushes the import agent to a node over SSH, runs it and fetches its result

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::WrapErr;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vmimport_exec::{CancelScope, NodeConnection};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "vmimport")]
#[command(about = "Import VMs onto a node through a remote agent", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `source.host`
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the node and verify the session
    Check,
    /// Upload the agent, run it and download its result
    Agent {
        /// Arguments passed to the agent
        #[arg(long, default_value = "")]
        args: String,
        /// Result file the agent writes on the node
        #[arg(long)]
        remote_result: String,
        /// Where to store the result locally
        #[arg(long)]
        local_result: PathBuf,
    },
    /// Run one command on the node
    Exec {
        /// Command line
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load_default(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.source.host = Some(host);
    }
    init_tracing(&config.log.level);

    let scope = CancelScope::new();
    let interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let host = config.host()?;
    let node = NodeConnection::connect_with_key_file(
        host,
        config.source.port,
        &config.source.login,
        &config.source.private_key,
        &scope,
    )
    .await
    .wrap_err_with(|| format!("failed to connect to {host}"))?
    .with_agent_path(config.agent.remote_path.clone())
    .with_timeouts(config.agent.upload_timeout(), config.agent.download_timeout())
    .with_read_ahead(config.transfer.read_ahead());

    let result = run(&node, &config, cli.command, &scope).await;
    if let Err(e) = node.close().await {
        warn!(error = %e, "failed to close connection");
    }
    result
}

async fn run(node: &NodeConnection, config: &Config, command: Commands, scope: &CancelScope) -> Result<()> {
    match command {
        Commands::Check => {
            node.connection().manager().ensure_connected(scope).await?;
            info!(host = %node.host(), "connection ok");
            println!("{}: ok", node.host());
        }
        Commands::Agent {
            args,
            remote_result,
            local_result,
        } => {
            let binary = match &config.agent.binary {
                Some(path) => path.clone(),
                None => vmimport_exec::node::current_executable()?,
            };
            let output = node
                .run_agent(&binary, &args, &remote_result, &local_result, scope)
                .await
                .wrap_err("agent run failed")?;
            std::io::stdout().write_all(&output)?;
            info!(result = %local_result.display(), "agent finished");
        }
        Commands::Exec { command } => {
            let output = node.exec(&command.join(" "), scope).await?;
            std::io::stdout().write_all(&output)?;
        }
    }
    Ok(())
}
