//! Chexray CLI - command-line interface for chest X-ray classifier training
//!
//! Provides the `chexray` command: run a training from a TOML configuration,
//! inspect the persisted state of an output directory, and clear a stale
//! training lock.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Chexray - resumable multi-label chest X-ray classifier training
#[derive(Parser, Debug)]
#[command(name = "chexray", author, version, about = "Chexray - resumable chest X-ray classifier training")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one training over the configured output directory
    ///
    /// Resumes from the persisted state when `use_trained_model_weights` is
    /// set and a previous run left one behind.
    Train {
        /// Path to the TOML run configuration
        config: PathBuf,

        /// Override a setting, e.g. `--set train.epochs=5` (repeatable)
        #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
        overrides: Vec<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted training state of an output directory
    Status {
        /// Training output directory
        output_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a lock left behind by a training process that was killed
    Unlock {
        /// Training output directory
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {e}");
    }

    let result = match args.command {
        Command::Train { config, overrides, json } => commands::train::execute(&config, &overrides, json).await,
        Command::Status { output_dir, json } => commands::status::execute(&output_dir, json),
        Command::Unlock { output_dir } => commands::unlock::execute(&output_dir),
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
