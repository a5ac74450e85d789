use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tgmon_core::{config::Config, domain::AccountName, registry::FileRegistry, Engine};
use tgmon_telegram::BotConnector;

/// Relay messages from watched Telegram chats into one aggregator chat.
///
/// Configuration is read from the environment and `./.env` (`TGMON_*` keys).
#[derive(Debug, Parser)]
#[command(name = "tgmon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Monitor one account and forward to the aggregator.
    Run {
        /// Account name as listed in the registry.
        account: String,
    },
    /// Monitor every enabled account.
    RunAll,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("stop signal received; shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let account = match cli.command {
        Command::Run { account } => {
            let name = account.trim();
            if name.is_empty() {
                anyhow::bail!("run: account name must not be empty");
            }
            Some(AccountName::new(name))
        }
        Command::RunAll => None,
    };

    let cfg = Config::load()?;
    tgmon_core::logging::init("tgmon", cli.json_logs || cfg.log_json)?;
    cfg.ensure_dirs()?;

    let registry = FileRegistry::open(cfg.registry_path.clone())
        .await
        .with_context(|| format!("opening registry {}", cfg.registry_path.display()))?;
    let connector = BotConnector::new(cfg.engine.poll_timeout);
    let engine = Engine::new(Arc::new(registry), Arc::new(connector), cfg.engine);

    let report = match account {
        Some(name) => engine
            .run_account(&name, shutdown_signal())
            .await
            .with_context(|| format!("cannot run account '{name}'"))?,
        None => engine
            .run_all(shutdown_signal())
            .await
            .context("cannot run all accounts")?,
    };

    for st in engine.stats() {
        tracing::info!(
            account = %st.account,
            forwarded = st.forwarded,
            dropped = st.dropped,
            failed = st.failed,
            "account totals"
        );
    }
    tracing::info!(
        delivered = report.delivered,
        failed = report.failed,
        abandoned = report.abandoned,
        "tgmon stopped"
    );
    Ok(())
}
