//! `distilkit train`: train a model from scratch on labelled sequences.
//!
//! The result is usually the teacher for a later `distilkit distill` run:
//!
//! ```text
//! distilkit train --dataset ./data/train.jsonl --eval-dataset ./data/dev.jsonl \
//!   --output ./runs/teacher --layers 12 --hidden-size 64
//! ```

use anyhow::Result;
use clap::Args;
use tracing::info;

use distilkit_core::{Model, Trainable};
use distilkit_distill::{BasicTrainer, TrainOptions};

use crate::commands::eval::log_checkpoint_eval;
use crate::commands::TrainingArgs;
use crate::config::{AppConfig, ArchSection};
use crate::model::{encoder_adaptor, Encoder, EncoderConfig};

#[derive(Debug, Clone, Args)]
pub struct TrainArgs {
    #[command(flatten)]
    pub training: TrainingArgs,

    #[command(flatten)]
    pub arch: ArchArgs,
}

/// Encoder shape overrides.
#[derive(Debug, Clone, Args)]
pub struct ArchArgs {
    /// Number of encoder layers.
    #[arg(long)]
    pub layers: Option<usize>,

    /// Hidden size of every layer.
    #[arg(long)]
    pub hidden_size: Option<usize>,

    /// Attention heads per layer.
    #[arg(long)]
    pub heads: Option<usize>,

    /// Dropout probability.
    #[arg(long)]
    pub dropout: Option<f32>,
}

impl ArchArgs {
    pub fn encoder_config(&self, defaults: &ArchSection, dim_in: usize, num_labels: usize) -> EncoderConfig {
        EncoderConfig {
            dim_in,
            hidden_size: self.hidden_size.unwrap_or(defaults.hidden_size),
            num_layers: self.layers.unwrap_or(defaults.num_layers),
            num_heads: self.heads.unwrap_or(defaults.num_heads),
            num_labels: num_labels.max(2),
            dropout: self.dropout.unwrap_or(defaults.dropout),
        }
    }
}

pub fn run(args: &TrainArgs, config: &AppConfig) -> Result<()> {
    let mut settings = args.training.resolve(config, "teacher")?;
    let ds = settings.dataset();
    let model_config = args.arch.encoder_config(&config.model, ds.dim(), ds.num_labels());
    let model = Encoder::new(model_config, &settings.device)?;
    info!(
        layers = model.config().num_layers,
        hidden = model.config().hidden_size,
        labels = model.config().num_labels,
        params = model.num_params(),
        "Model built"
    );

    let mut optimizer = settings.optimizer(model.trainable_vars())?;
    let mut trainer = BasicTrainer::new(settings.train_config.clone(), model, encoder_adaptor(true))?;

    let eval_batches = settings.eval_batches.take();
    let mut options = TrainOptions::epochs(settings.epochs)
        .with_max_grad_norm(settings.max_grad_norm)
        .with_lr_schedule(settings.lr_schedule())
        .with_seed(settings.seed);
    if let Some(batches) = &eval_batches {
        options = options.with_callback(move |model: &Encoder, step| log_checkpoint_eval(model, batches, step));
    }

    info!("Starting training");
    let stats = trainer.train(&mut optimizer, &mut settings.loader, options)?;

    let mut model = trainer.into_model();
    model.set_training(false);
    model.save(&settings.output)?;

    println!(
        "\nTraining complete!\n\
         Output: {}\n\
         Steps: {}\n\
         Final loss: {:.4}\n\
         Elapsed: {:.1} s\n\
         \n\
         Distil it with:\n  distilkit distill --teacher {} --dataset {}",
        settings.output.display(),
        stats.total_steps,
        stats.final_loss,
        stats.elapsed_secs,
        settings.output.display(),
        args.training.dataset.display(),
    );
    Ok(())
}
