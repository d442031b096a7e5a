//! `distilkit distill`: distil a saved teacher into a fresh, smaller student.
//!
//! ```text
//! distilkit distill \
//!   --teacher  ./runs/teacher \
//!   --dataset  ./data/train.jsonl \
//!   --output   ./runs/student-L4 \
//!   --preset   L4t_hidden_mse \
//!   --temperature 8 --hard-label-weight 0.5
//! ```
//!
//! The loss configuration starts from `--distill-config FILE` (JSON, the
//! same shape that is written next to the result as `distill_config.json`)
//! or from the defaults, then the KD flags override single fields and
//! `--preset` appends its intermediate matches.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{info, warn};

use distilkit_core::{KdLossType, Model};
use distilkit_distill::presets::PresetKind;
use distilkit_distill::{DistillationConfig, GeneralDistiller, MatchPreset, TrainOptions};

use crate::commands::eval::log_checkpoint_eval;
use crate::commands::train::ArchArgs;
use crate::commands::TrainingArgs;
use crate::config::AppConfig;
use crate::model::{encoder_adaptor, Encoder, EncoderConfig};

pub const DISTILL_CONFIG_FILE: &str = "distill_config.json";

#[derive(Debug, Clone, Args)]
pub struct DistillArgs {
    /// Teacher model directory written by `distilkit train`.
    #[arg(long)]
    pub teacher: PathBuf,

    #[command(flatten)]
    pub training: TrainingArgs,

    /// Student shape. `--layers` defaults to the preset's student depth.
    #[command(flatten)]
    pub arch: ArchArgs,

    #[command(flatten)]
    pub kd: KdArgs,
}

#[derive(Debug, Clone, Default, Args)]
pub struct KdArgs {
    /// Intermediate-match preset, e.g. L4_hidden_mse (see `distilkit presets`).
    #[arg(long)]
    pub preset: Option<String>,

    /// Distillation config JSON to start from.
    #[arg(long, value_name = "FILE")]
    pub distill_config: Option<PathBuf>,

    /// Base KD temperature.
    #[arg(long)]
    pub temperature: Option<f64>,

    /// KD loss: ce or mse.
    #[arg(long, value_parser = parse_kd_loss_type)]
    pub kd_loss_type: Option<KdLossType>,

    /// Weight of the KD loss.
    #[arg(long)]
    pub kd_loss_weight: Option<f64>,

    /// Weight of the student's own cross-entropy.
    #[arg(long)]
    pub hard_label_weight: Option<f64>,

    /// Swap the teacher's top logit with the true label's logit.
    #[arg(long)]
    pub probability_shift: bool,

    /// Run the teacher once and reuse its outputs every epoch.
    #[arg(long)]
    pub cache_logits: bool,
}

fn parse_kd_loss_type(s: &str) -> Result<KdLossType, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown KD loss type '{s}', expected ce or mse"))
}

impl KdArgs {
    pub fn preset(&self) -> Result<Option<MatchPreset>> {
        self.preset.as_deref().map(MatchPreset::parse).transpose()
    }

    /// Assemble the loss configuration for a teacher/student pair.
    pub fn distill_config(&self, teacher: &EncoderConfig, student: &EncoderConfig) -> Result<DistillationConfig> {
        let mut cfg = match &self.distill_config {
            Some(path) => DistillationConfig::from_json_file(path)?,
            None => DistillationConfig::default(),
        };
        if let Some(t) = self.temperature {
            cfg.temperature = t;
        }
        if let Some(kind) = self.kd_loss_type {
            cfg.kd_loss_type = kind;
        }
        if let Some(w) = self.kd_loss_weight {
            cfg.kd_loss_weight = w;
        }
        if let Some(w) = self.hard_label_weight {
            cfg.hard_label_weight = w;
        }
        cfg.probability_shift |= self.probability_shift;
        cfg.is_caching_logits |= self.cache_logits;

        if let Some(preset) = self.preset()? {
            if preset.kind == PresetKind::HiddenMse && !preset.projected && teacher.hidden_size != student.hidden_size {
                bail!(
                    "Preset {} compares hidden states of size {} (student) and {} (teacher); \
                     use L{}t_hidden_mse to add a projection",
                    preset.label(),
                    student.hidden_size,
                    teacher.hidden_size,
                    preset.student_layers
                );
            }
            if student.num_layers < preset.student_layers {
                bail!(
                    "Preset {} needs a student with at least {} layers, got {}",
                    preset.label(),
                    preset.student_layers,
                    student.num_layers
                );
            }
            let matches = preset.matches(teacher.num_layers, Some((student.hidden_size, teacher.hidden_size)))?;
            info!(preset = %preset.label(), matches = matches.len(), "Intermediate matches from preset");
            cfg.intermediate_matches.extend(matches);
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

pub fn run(args: &DistillArgs, config: &AppConfig) -> Result<()> {
    let mut settings = args.training.resolve(config, "student")?;
    let teacher = Encoder::load(&args.teacher, &settings.device)
        .with_context(|| format!("Failed to load teacher from {}", args.teacher.display()))?;

    let ds = settings.dataset();
    if ds.dim() != teacher.config().dim_in {
        bail!(
            "Dataset features are {}-dimensional but the teacher expects {}",
            ds.dim(),
            teacher.config().dim_in
        );
    }
    if ds.num_labels() > teacher.config().num_labels {
        warn!(
            dataset = ds.num_labels(),
            teacher = teacher.config().num_labels,
            "Dataset has more labels than the teacher predicts"
        );
    }

    let mut arch = args.arch.clone();
    if arch.layers.is_none() {
        arch.layers = args.kd.preset()?.map(|p| p.student_layers);
    }
    let student_config = arch.encoder_config(&config.student, ds.dim(), teacher.config().num_labels);
    let distill_config = args.kd.distill_config(teacher.config(), &student_config)?;
    let student = Encoder::new(student_config, &settings.device)?;
    info!(
        teacher_layers = teacher.config().num_layers,
        teacher_params = teacher.num_params(),
        student_layers = student.config().num_layers,
        student_params = student.num_params(),
        temperature = distill_config.temperature,
        matches = distill_config.intermediate_matches.len(),
        "Models ready"
    );

    let mut distiller = GeneralDistiller::new(
        settings.train_config.clone(),
        distill_config.clone(),
        teacher,
        student,
        encoder_adaptor(false),
        encoder_adaptor(true),
    )?;
    let mut optimizer = settings.optimizer(distiller.trainable_vars())?;

    let eval_batches = settings.eval_batches.take();
    let mut options = TrainOptions::epochs(settings.epochs)
        .with_max_grad_norm(settings.max_grad_norm)
        .with_lr_schedule(settings.lr_schedule())
        .with_seed(settings.seed);
    if let Some(batches) = &eval_batches {
        options = options.with_callback(move |model: &Encoder, step| log_checkpoint_eval(model, batches, step));
    }

    info!("Starting distillation");
    let stats = distiller.train(&mut optimizer, &mut settings.loader, options)?;

    let mut student = distiller.into_student();
    student.set_training(false);
    student.save(&settings.output)?;
    distill_config.to_json_file(&settings.output.join(DISTILL_CONFIG_FILE))?;

    println!(
        "\nDistillation complete!\n\
         Output: {}\n\
         Steps: {}\n\
         Final loss: {:.4}\n\
         Elapsed: {:.1} s\n\
         \n\
         Evaluate the student with:\n  distilkit eval --model {} --dataset <held-out data>",
        settings.output.display(),
        stats.total_steps,
        stats.final_loss,
        stats.elapsed_secs,
        settings.output.display(),
    );
    Ok(())
}
