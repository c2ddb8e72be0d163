//! Unlock command implementation.

use anyhow::{Context, Result};
use chexray_training::layout::LOCK_FILE;
use chexray_training::TrainingLock;
use colored::Colorize;
use std::path::Path;

pub fn execute(output_dir: &Path) -> Result<()> {
    let path = output_dir.join(LOCK_FILE);
    let removed = TrainingLock::force_remove(&path).with_context(|| format!("cannot remove {}", path.display()))?;
    if removed {
        println!("{} {}", "Removed".green(), path.display());
    } else {
        println!("{}", format!("No lock at {}", path.display()).dimmed());
    }
    Ok(())
}
