//! Main entry point for the Robust PBT CLI.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use robust_pbt::{
    backend::{self, SyntheticBackend},
    cli, telemetry, CancelHandle, Orchestrator, RunStatus, Settings,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    match args.command {
        cli::Commands::Run { config, group, dry_run } => {
            let mut settings = Settings::load(Some(&config))?;
            telemetry::init(&settings.logging)?;

            if let Some(group) = group {
                settings.run.group = group;
            }
            let backend: Arc<dyn backend::Backend> = if dry_run {
                info!("Dry run: using the synthetic backend");
                Arc::new(SyntheticBackend::default())
            } else {
                Arc::from(backend::from_config(&settings.backend))
            };

            let orchestrator = Orchestrator::new(settings, backend).context("Failed to start run")?;
            tokio::spawn(cancel_on_signal(orchestrator.cancel_handle()));

            let report = orchestrator.run().await?;
            report.print_summary();
            report.save(orchestrator.output_dir())?;

            if report.status == RunStatus::Cancelled {
                bail!("run '{}' was cancelled", report.group);
            }
            Ok(())
        }
        cli::Commands::Validate { config } => {
            let settings = Settings::load(Some(&config))?;
            let rendered = toml::to_string_pretty(&settings).context("Failed to render settings")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

/// Cancel the run on SIGTERM or Ctrl+C.
async fn cancel_on_signal(cancel: CancelHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                warn!("Failed to install signal handlers; run cannot be cancelled");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, cancelling run"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), cancelling run"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to listen for Ctrl+C; run cannot be cancelled");
            return;
        }
        info!("Received Ctrl+C, cancelling run");
    }

    cancel.cancel();
}
