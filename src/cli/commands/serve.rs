//! `foreman serve`: the long-running dispatcher and reconciliation sweep.

use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::CycleReport;

/// Arguments for `foreman serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Run one dispatch cycle, wait for its tasks, and exit
    #[arg(long)]
    pub once: bool,

    /// Do not run the reconciliation sweep in this process
    #[arg(long)]
    pub no_sweep: bool,
}

/// Result of `foreman serve`.
#[derive(Debug, serde::Serialize)]
pub struct ServeOutput {
    /// Human-readable summary.
    pub message: String,
    /// Set by `--once`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleReport>,
}

impl CommandOutput for ServeOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Run the dispatcher, and the sweep unless disabled, until interrupted.
pub async fn execute(args: ServeArgs, config: Config, json_mode: bool) -> Result<()> {
    let ctx = AppContext::open(config).await?;
    let registry = ctx.tasks.registry();
    if registry.is_empty() {
        warn!("No tools configured; claimed tasks will fail as unknown task types");
    } else {
        info!(tools = ?registry.names(), "Tools registered");
    }

    let dispatcher = ctx.dispatcher();

    if args.once {
        let cycle = dispatcher.run_cycle().await?;
        dispatcher.wait_idle().await;
        output(
            &ServeOutput {
                message: format!(
                    "Dispatched {} task(s) across {} tenant(s).",
                    cycle.claimed, cycle.tenants_considered
                ),
                cycle: Some(cycle),
            },
            json_mode,
        );
        ctx.close().await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    if args.no_sweep {
        dispatcher.run(shutdown).await;
    } else {
        let sweep = ctx.sweep();
        futures::future::join(dispatcher.run(shutdown.clone()), sweep.run(shutdown)).await;
    }

    output(
        &ServeOutput {
            message: "Foreman stopped.".to_string(),
            cycle: None,
        },
        json_mode,
    );
    ctx.close().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
