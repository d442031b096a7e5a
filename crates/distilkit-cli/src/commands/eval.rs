//! `distilkit eval`: accuracy and cross-entropy of a saved model.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, D};
use clap::Args;
use tracing::info;

use distilkit_core::{select_device, Model};
use distilkit_distill::SequenceBatch;

use crate::commands::load_batches;
use crate::config::AppConfig;
use crate::model::Encoder;

#[derive(Debug, Clone, Args)]
pub struct EvalArgs {
    /// Directory written by `train` or `distill`.
    #[arg(long, short = 'm')]
    pub model: PathBuf,

    /// Evaluation data (`.jsonl` file or directory).
    #[arg(long)]
    pub dataset: PathBuf,

    /// Examples per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Device: cpu, cuda[:N] or metal[:N].
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub examples: usize,
    pub accuracy: f64,
    /// Mean cross-entropy per example.
    pub loss: f64,
}

pub fn run(args: &EvalArgs, config: &AppConfig) -> Result<()> {
    let device = select_device(args.device.as_deref().unwrap_or(&config.device.device))?;
    let mut model = Encoder::load(&args.model, &device)?;
    model.set_training(false);

    let batch_size = args.batch_size.unwrap_or(config.training.batch_size);
    let batches = load_batches(&args.dataset, batch_size, config.data.max_len, &device)?;
    let report = evaluate(&model, &batches)?;

    println!("{:<12} {}", "MODEL", args.model.display());
    println!("{:<12} {}", "EXAMPLES", report.examples);
    println!("{:<12} {:.4}", "ACCURACY", report.accuracy);
    println!("{:<12} {:.4}", "LOSS", report.loss);
    Ok(())
}

/// Run `model` over `batches` without gradients.
pub fn evaluate(model: &Encoder, batches: &[SequenceBatch]) -> Result<EvalReport> {
    let mut examples = 0usize;
    let mut correct = 0f64;
    let mut loss_sum = 0f64;
    for batch in batches {
        let out = model.forward(batch)?;
        let logits = out.logits.detach();
        let n = batch.labels.dim(0)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?.to_scalar::<f32>()?;
        let hits = logits
            .argmax(D::Minus1)?
            .eq(&batch.labels)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        examples += n;
        correct += hits as f64;
        loss_sum += loss as f64 * n as f64;
    }
    anyhow::ensure!(examples > 0, "Evaluation set is empty");
    let report = EvalReport {
        examples,
        accuracy: correct / examples as f64,
        loss: loss_sum / examples as f64,
    };
    info!(examples, accuracy = report.accuracy, loss = report.loss, "Evaluation");
    Ok(report)
}

/// Evaluate and log at a checkpoint; used as a training callback.
pub fn log_checkpoint_eval(model: &Encoder, batches: &[SequenceBatch], step: usize) -> Result<()> {
    let report = evaluate(model, batches).with_context(|| format!("Evaluation at global step {step} failed"))?;
    info!(step, accuracy = format!("{:.4}", report.accuracy), loss = format!("{:.4}", report.loss), "Checkpoint evaluation");
    Ok(())
}
