use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod model;

use commands::{distill::DistillArgs, eval::EvalArgs, presets::PresetsArgs, train::TrainArgs};
use config::load_config;

/// distilkit: knowledge distillation for candle models
#[derive(Debug, Parser)]
#[command(name = "distilkit", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train an encoder on labelled sequences (typically the teacher).
    Train(TrainArgs),

    /// Distil a trained teacher into a smaller student.
    ///
    /// Combines the KD loss on logits, the student's own cross-entropy and
    /// any intermediate matches from --preset or --distill-config.
    Distill(DistillArgs),

    /// Report accuracy and loss of a saved model.
    Eval(EvalArgs),

    /// List intermediate-match presets.
    Presets(PresetsArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match &cli.command {
        Commands::Train(args) => commands::train::run(args, &cfg)?,
        Commands::Distill(args) => commands::distill::run(args, &cfg)?,
        Commands::Eval(args) => commands::eval::run(args, &cfg)?,
        Commands::Presets(args) => commands::presets::run(args)?,
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}
