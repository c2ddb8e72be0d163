//! Train command implementation.

use anyhow::{Context, Result};
use chexray_training::layout::LOCK_FILE;
use chexray_training::{RunConfig, Trainer, TrainingError};
use colored::Colorize;
use std::future::Future;
use std::path::Path;

/// Install the stop handlers now and resolve with the signal name once one fires.
///
/// Handlers must be in place before the lock is taken: a SIGTERM under the
/// default disposition exits without dropping the lock guard.
#[cfg(unix)]
fn stop_signal() -> Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[cfg(not(unix))]
fn stop_signal() -> Result<impl Future<Output = &'static str>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    })
}

pub async fn execute(config_path: &Path, overrides: &[String], json_output: bool) -> Result<()> {
    let config = RunConfig::from_file_with_overrides(config_path, overrides)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    let output_dir = config.train().output_dir.clone();
    let mut trainer = Trainer::new(config);
    let stop = stop_signal()?;

    let outcome = tokio::select! {
        outcome = trainer.train() => outcome,
        signal = stop => {
            // Dropping the run future released the lock.
            anyhow::bail!("interrupted by {signal}; training in {} stopped", output_dir.display());
        }
    };

    let report = match outcome {
        Ok(report) => report,
        Err(err @ TrainingError::LockConflict { .. }) => {
            return Err(err).with_context(|| {
                format!(
                    "another training is running in {} (if not, run `chexray unlock {}` to remove {LOCK_FILE})",
                    output_dir.display(),
                    output_dir.display()
                )
            });
        }
        Err(err) => return Err(err).context("training failed"),
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run:              {}", report.run.to_string().cyan());
    println!("  Epochs:           {}", report.epochs);
    println!("  Devices:          {}", report.devices);
    println!("  Best mean AUROC:  {}", format!("{:.4}", report.best_mean_auroc).green());
    println!("  Learning rate:    {}", report.lr);
    println!("  History:          {}", report.history_path.display().to_string().dimmed());
    println!();
    Ok(())
}
