//! Status command implementation.

use anyhow::{Context, Result};
use chexray_training::layout::{LOCK_FILE, STATE_FILE};
use chexray_training::TrainingState;
use colored::Colorize;
use serde_json::json;
use std::path::Path;

/// Show the persisted state and lock presence of an output directory.
pub fn execute(output_dir: &Path, json_output: bool) -> Result<()> {
    let state_path = output_dir.join(STATE_FILE);
    let state = TrainingState::load(&state_path).with_context(|| format!("cannot read {}", state_path.display()))?;
    let locked = output_dir.join(LOCK_FILE).exists();

    if json_output {
        let out = json!({
            "output_dir": output_dir,
            "state": state,
            "locked": locked,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", "Chexray Training Status".bold().cyan());
    println!("  Output dir: {}", output_dir.display());
    match state {
        Some(state) => {
            println!("  Run:             {}", state.run.to_string().green());
            println!("  Best mean AUROC: {}", format!("{:.4}", state.best_mean_auroc).green());
            println!("  Learning rate:   {}", state.lr);
        }
        None => println!("  State: {}", "no training state found".yellow()),
    }
    if locked {
        println!("  Lock: {}", "present (a training is running or was killed)".yellow());
    } else {
        println!("  Lock: {}", "none".green());
    }
    Ok(())
}
