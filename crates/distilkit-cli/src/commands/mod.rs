pub mod distill;
pub mod eval;
pub mod presets;
pub mod train;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use clap::Args;
use tracing::info;

use distilkit_core::{select_device, LinearWarmupDecay};
use distilkit_distill::{BatchLoader, SequenceBatch, SequenceDataset, SequenceLoader, TrainingConfig};

use crate::config::{expand_path, AppConfig};

/// Knobs shared by `train` and `distill`. Unset values fall back to the
/// loaded [`AppConfig`].
#[derive(Debug, Clone, Args)]
pub struct TrainingArgs {
    /// Training data: a `.jsonl` file or a directory of them, one
    /// {"features": [[...], ...], "label": n} record per line.
    #[arg(long)]
    pub dataset: PathBuf,

    /// Held-out data evaluated after every checkpoint.
    #[arg(long)]
    pub eval_dataset: Option<PathBuf>,

    /// Output directory. Defaults to `<output.runs_dir>/<command>`.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Number of training epochs.
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Examples per micro-batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Peak AdamW learning rate.
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Micro-batches per optimizer step.
    #[arg(long)]
    pub gradient_accumulation_steps: Option<usize>,

    /// Checkpoints per epoch.
    #[arg(long)]
    pub ckpt_frequency: Option<usize>,

    /// Truncate sequences to this many positions.
    #[arg(long)]
    pub max_len: Option<usize>,

    /// Seed for data shuffling.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Device: cpu, cuda[:N] or metal[:N].
    #[arg(long)]
    pub device: Option<String>,
}

/// [`TrainingArgs`] merged with the configuration file.
pub struct RunSettings {
    pub epochs: usize,
    pub learning_rate: f64,
    pub warmup_fraction: f64,
    pub max_grad_norm: f64,
    pub seed: u64,
    pub output: PathBuf,
    pub device: Device,
    pub train_config: TrainingConfig,
    pub loader: SequenceLoader,
    pub eval_batches: Option<Vec<SequenceBatch>>,
}

impl TrainingArgs {
    pub fn resolve(&self, config: &AppConfig, command: &str) -> Result<RunSettings> {
        let t = &config.training;
        let output = self
            .output
            .clone()
            .unwrap_or_else(|| expand_path(&config.output.runs_dir).join(command));
        let device_name = self.device.clone().unwrap_or_else(|| config.device.device.clone());
        let device = select_device(&device_name)?;
        let batch_size = self.batch_size.unwrap_or(t.batch_size);
        let max_len = self.max_len.unwrap_or(config.data.max_len);
        let seed = self.seed.unwrap_or(t.seed);

        let dataset = SequenceDataset::from_path(&self.dataset)
            .with_context(|| format!("Failed to load dataset from {}", self.dataset.display()))?;
        let loader = SequenceLoader::new(dataset, batch_size, max_len, device.clone()).shuffled(seed);
        let eval_batches = self
            .eval_dataset
            .as_deref()
            .map(|p| load_batches(p, batch_size, max_len, &device))
            .transpose()?;

        let train_config = TrainingConfig {
            gradient_accumulation_steps: self.gradient_accumulation_steps.unwrap_or(t.gradient_accumulation_steps),
            ckpt_frequency: self.ckpt_frequency.unwrap_or(t.ckpt_frequency),
            log_dir: Some(output.clone()),
            output_dir: output.join("checkpoints"),
            device: device_name,
            print_every: t.print_every,
            ..Default::default()
        };

        Ok(RunSettings {
            epochs: self.epochs.unwrap_or(t.epochs),
            learning_rate: self.learning_rate.unwrap_or(t.learning_rate),
            warmup_fraction: t.warmup_fraction,
            max_grad_norm: t.max_grad_norm,
            seed,
            output,
            device,
            train_config,
            loader,
            eval_batches,
        })
    }
}

impl RunSettings {
    pub fn dataset(&self) -> &SequenceDataset {
        self.loader.dataset()
    }

    pub fn optimizer(&self, vars: Vec<Var>) -> Result<AdamW> {
        AdamW::new(vars, ParamsAdamW { lr: self.learning_rate, ..Default::default() })
            .context("Failed to create AdamW optimizer")
    }

    /// Warmup over the first `warmup_fraction` of the run, then linear decay.
    pub fn lr_schedule(&self) -> LinearWarmupDecay {
        let per_epoch = self.loader.len() / self.train_config.gradient_accumulation_steps.max(1);
        LinearWarmupDecay::with_warmup_fraction(self.learning_rate, self.warmup_fraction, self.epochs * per_epoch)
    }
}

/// Load a dataset and collate it in order, for evaluation.
pub fn load_batches(path: &Path, batch_size: usize, max_len: usize, device: &Device) -> Result<Vec<SequenceBatch>> {
    let dataset = SequenceDataset::from_path(path)
        .with_context(|| format!("Failed to load dataset from {}", path.display()))?;
    let batches = SequenceLoader::new(dataset, batch_size, max_len, device.clone()).epoch_batches(0)?;
    info!(path = %path.display(), batches = batches.len(), "Evaluation data ready");
    Ok(batches)
}
