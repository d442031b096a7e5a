//! The orchestration loop shared by the trainer and every distiller.
//!
//! For each micro-batch the loop post-processes the batch, asks the
//! [`Objective`] for a loss, back-propagates `loss / accum` and accumulates
//! gradients. Every `gradient_accumulation_steps` micro-batches it clips the
//! global gradient norm, steps the optimizer (and any auxiliary optimizers),
//! advances the learning-rate schedule, logs, and checkpoints on schedule,
//! handing the student to the user callback after each checkpoint.
//!
//! With logits caching the teacher runs once over the loader's first epoch
//! before training; every epoch then replays the cached `(batch, teacher
//! output)` pairs in a fresh shuffled order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::optim::Optimizer;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use distilkit_core::losses::scalar;
use distilkit_core::{AdaptorOutput, LrSchedule, Trainable};

use crate::checkpoint::{save_checkpoint, LossLog, LossRecord};
use crate::config::TrainingConfig;
use crate::dataset::BatchLoader;
use crate::objective::Objective;

// ── Options ───────────────────────────────────────────────────────────────────

/// How long to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duration {
    /// Full passes over the loader.
    Epochs(usize),
    /// Optimizer steps, cycling over the loader as often as needed.
    Steps(usize),
}

/// Called after each checkpoint with the student (in evaluation mode) and
/// the global step.
pub type Callback<'a, S> = Box<dyn FnMut(&S, usize) -> Result<()> + 'a>;

/// Applied to every batch before the forward passes.
pub type BatchPostprocessor<'a, B> = Box<dyn Fn(B) -> Result<B> + 'a>;

/// Per-run arguments of [`run_training`].
pub struct TrainOptions<'a, B, S> {
    pub duration: Duration,
    /// Clip the global gradient norm to this value; `<= 0` disables clipping.
    pub max_grad_norm: f64,
    pub lr_schedule: Option<Box<dyn LrSchedule + 'a>>,
    pub callback: Option<Callback<'a, S>>,
    pub batch_postprocessor: Option<BatchPostprocessor<'a, B>>,
    /// Seed for the replay order of cached batches.
    pub seed: u64,
}

impl<'a, B, S> TrainOptions<'a, B, S> {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            max_grad_norm: -1.0,
            lr_schedule: None,
            callback: None,
            batch_postprocessor: None,
            seed: 42,
        }
    }

    pub fn epochs(n: usize) -> Self {
        Self::new(Duration::Epochs(n))
    }

    pub fn steps(n: usize) -> Self {
        Self::new(Duration::Steps(n))
    }

    pub fn with_max_grad_norm(mut self, max_grad_norm: f64) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }

    pub fn with_lr_schedule(mut self, schedule: impl LrSchedule + 'a) -> Self {
        self.lr_schedule = Some(Box::new(schedule));
        self
    }

    pub fn with_callback(mut self, callback: impl FnMut(&S, usize) -> Result<()> + 'a) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_batch_postprocessor(mut self, f: impl Fn(B) -> Result<B> + 'a) -> Self {
        self.batch_postprocessor = Some(Box::new(f));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

// ── Training statistics ───────────────────────────────────────────────────────

/// Summary returned after training completes.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub total_steps: usize,
    pub final_loss: f32,
    pub elapsed_secs: f64,
    pub checkpoints: Vec<PathBuf>,
    /// Unweighted loss terms of the last optimizer step.
    pub final_losses: BTreeMap<String, f32>,
}

// ── Checkpoint schedule ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointPlan {
    /// Every `interval` global steps and at the last step.
    Global { interval: usize },
    /// Every `interval` steps within eligible epochs and at their last step.
    PerEpoch { interval: usize, steps_per_epoch: usize, epoch_frequency: usize, epochs: usize },
}

impl CheckpointPlan {
    fn new(config: &TrainingConfig, duration: Duration, steps_per_epoch: usize, total_steps: usize) -> Self {
        if let Some(n) = config.ckpt_steps {
            return Self::Global { interval: n.max(1) };
        }
        match duration {
            Duration::Steps(_) => Self::Global { interval: (total_steps / config.ckpt_frequency).max(1) },
            Duration::Epochs(epochs) => Self::PerEpoch {
                interval: (steps_per_epoch / config.ckpt_frequency).max(1),
                steps_per_epoch,
                epoch_frequency: config.ckpt_epoch_frequency,
                epochs,
            },
        }
    }

    fn is_due(&self, epoch: usize, epoch_step: usize, global_step: usize, total_steps: usize) -> bool {
        match *self {
            Self::Global { interval } => global_step % interval == 0 || global_step == total_steps,
            Self::PerEpoch { interval, steps_per_epoch, epoch_frequency, epochs } => {
                let eligible = epoch % epoch_frequency == 0 || epoch + 1 == epochs;
                eligible && (epoch_step % interval == 0 || epoch_step == steps_per_epoch)
            }
        }
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

/// Train `objective` with `optimizer` on batches from `loader`.
///
/// `caching` replays teacher outputs computed once up front; it requires an
/// objective whose [`Objective::teacher_output`] returns `Some`.
pub fn run_training<B, J, O, L>(
    objective: &mut J,
    config: &TrainingConfig,
    caching: bool,
    optimizer: &mut O,
    loader: &mut L,
    options: TrainOptions<'_, B, J::Student>,
) -> Result<TrainingStats>
where
    J: Objective<B>,
    O: Optimizer,
    L: BatchLoader<Batch = B>,
{
    config.validate()?;
    let TrainOptions { duration, max_grad_norm, lr_schedule, callback, batch_postprocessor, seed } = options;

    let postprocess = |batch: B| -> Result<B> {
        match &batch_postprocessor {
            Some(f) => f(batch),
            None => Ok(batch),
        }
    };

    let cache = if caching { Some(build_cache(objective, loader, &postprocess)?) } else { None };
    let len = cache.as_ref().map_or_else(|| loader.len(), Vec::len);
    let accum = config.gradient_accumulation_steps;
    anyhow::ensure!(
        len >= accum,
        "Loader yields {len} batches per epoch, fewer than gradient_accumulation_steps = {accum}"
    );

    let steps_per_epoch = len / accum;
    let total_steps = match duration {
        Duration::Epochs(n) => n * steps_per_epoch,
        Duration::Steps(n) => n,
    };
    anyhow::ensure!(total_steps > 0, "Nothing to train: {duration:?} gives 0 optimizer steps");

    let print_every = if config.print_every > 0 { config.print_every } else { (steps_per_epoch / 20).max(1) };
    let mut vars = objective.trainable_vars();
    vars.extend(objective.auxiliary_vars());

    info!(
        batches_per_epoch = len,
        accumulation = accum,
        total_steps,
        caching,
        output_dir = %config.output_dir.display(),
        "Training"
    );

    let mut run = Run {
        config,
        accum,
        total_steps,
        plan: CheckpointPlan::new(config, duration, steps_per_epoch, total_steps),
        print_every,
        max_grad_norm,
        vars,
        base_lr: optimizer.learning_rate(),
        lr_schedule,
        callback,
        log: config.log_dir.as_deref().map(LossLog::open).transpose()?,
        pb: progress_bar(total_steps as u64, "training"),
        epoch: 0,
        epoch_step: 0,
        global_step: 0,
        micro: 0,
        grads: None,
        pending_loss: 0.0,
        pending: BTreeMap::new(),
        last_loss: f32::NAN,
        last_losses: BTreeMap::new(),
        checkpoints: Vec::new(),
    };
    run.apply_lr_schedule(objective, optimizer, 0);
    objective.set_student_training(true);
    let start = Instant::now();

    'epochs: for epoch in 0.. {
        if let Duration::Epochs(n) = duration {
            if epoch >= n {
                break;
            }
        }
        run.begin_epoch(epoch);

        match &cache {
            Some(cache) => {
                let mut order: Vec<usize> = (0..cache.len()).collect();
                order.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)));
                for i in order {
                    let (batch, teacher_out) = &cache[i];
                    if run.micro_step(objective, optimizer, batch, Some(teacher_out))? {
                        break 'epochs;
                    }
                }
            }
            None => {
                let batches = loader.epoch_batches(epoch)?;
                anyhow::ensure!(
                    batches.len() >= accum,
                    "Loader produced {} batches in epoch {epoch}, fewer than gradient_accumulation_steps = {accum}",
                    batches.len()
                );
                for batch in batches {
                    let batch = postprocess(batch)?;
                    if run.micro_step(objective, optimizer, &batch, None)? {
                        break 'epochs;
                    }
                }
            }
        }
        info!(epoch = epoch + 1, global_step = run.global_step, loss = run.last_loss, "Epoch complete");
    }

    run.pb.finish_with_message(format!("Training complete, final loss {:.4}", run.last_loss));
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        steps = run.global_step,
        loss = run.last_loss,
        elapsed = %format_duration(elapsed as u64),
        "Training finished"
    );

    Ok(TrainingStats {
        total_steps: run.global_step,
        final_loss: run.last_loss,
        elapsed_secs: elapsed,
        checkpoints: run.checkpoints,
        final_losses: run.last_losses,
    })
}

/// Run the teacher once over the loader's first epoch.
fn build_cache<B, J, L>(
    objective: &J,
    loader: &mut L,
    postprocess: &dyn Fn(B) -> Result<B>,
) -> Result<Vec<(B, AdaptorOutput)>>
where
    J: Objective<B>,
    L: BatchLoader<Batch = B>,
{
    let batches = loader.epoch_batches(0)?;
    info!(batches = batches.len(), "Caching teacher outputs");
    let pb = progress_bar(batches.len() as u64, "caching teacher outputs");

    let mut cache = Vec::with_capacity(batches.len());
    for batch in batches {
        let batch = postprocess(batch)?;
        let teacher_out = objective
            .teacher_output(&batch)?
            .context("Logits caching requires a distiller with a teacher")?;
        cache.push((batch, teacher_out));
        pb.inc(1);
    }
    pb.finish_with_message(format!("cached {} batches", cache.len()));
    Ok(cache)
}

/// Mutable state of one training run.
struct Run<'c, 'a, S> {
    config: &'c TrainingConfig,
    accum: usize,
    total_steps: usize,
    plan: CheckpointPlan,
    print_every: usize,
    max_grad_norm: f64,
    vars: Vec<Var>,
    /// Optimizer learning rate before the schedule is first applied.
    base_lr: f64,
    lr_schedule: Option<Box<dyn LrSchedule + 'a>>,
    callback: Option<Callback<'a, S>>,
    log: Option<LossLog>,
    pb: ProgressBar,

    epoch: usize,
    epoch_step: usize,
    global_step: usize,
    micro: usize,
    grads: Option<GradStore>,
    pending_loss: f64,
    pending: BTreeMap<String, f32>,
    last_loss: f32,
    last_losses: BTreeMap<String, f32>,
    checkpoints: Vec<PathBuf>,
}

impl<S: Trainable> Run<'_, '_, S> {
    /// Leftover micro-batches of the previous epoch are dropped.
    fn begin_epoch(&mut self, epoch: usize) {
        if self.micro > 0 {
            debug!(dropped = self.micro, "Discarding incomplete gradient accumulation");
        }
        self.epoch = epoch;
        self.epoch_step = 0;
        self.micro = 0;
        self.grads = None;
        self.pending_loss = 0.0;
        self.pending.clear();
    }

    /// Process one micro-batch; returns `true` once training is complete.
    fn micro_step<B, J, O>(
        &mut self,
        objective: &mut J,
        optimizer: &mut O,
        batch: &B,
        cached: Option<&AdaptorOutput>,
    ) -> Result<bool>
    where
        J: Objective<B, Student = S>,
        O: Optimizer,
    {
        let progress = self.global_step as f64 / self.total_steps as f64;
        let out = objective.loss(batch, cached, progress)?;
        let value = scalar(&out.total)?;
        anyhow::ensure!(
            value.is_finite(),
            "Non-finite loss ({value}) at global step {}; losses: {:?}",
            self.global_step + 1,
            out.breakdown
        );

        let loss = if self.accum > 1 { out.total.affine(1.0 / self.accum as f64, 0.0)? } else { out.total };
        let grads = loss.backward()?;
        accumulate(&mut self.grads, grads, &self.vars)?;

        self.pending_loss += value as f64;
        for (k, v) in out.breakdown {
            *self.pending.entry(k).or_insert(0.0) += v;
        }
        self.micro += 1;
        if self.micro % self.accum != 0 {
            return Ok(false);
        }

        let Some(mut grads) = self.grads.take() else { return Ok(false) };
        if self.max_grad_norm > 0.0 {
            let norm = clip_grad_norm(&mut grads, &self.vars, self.max_grad_norm)?;
            debug!(norm, "Gradient norm");
        }
        optimizer.step(&grads)?;
        objective.after_step(&grads)?;
        self.global_step += 1;
        self.epoch_step += 1;

        let lr = optimizer.learning_rate();
        self.apply_lr_schedule(objective, optimizer, self.global_step);

        let n = self.accum as f32;
        self.last_loss = (self.pending_loss / self.accum as f64) as f32;
        self.last_losses = std::mem::take(&mut self.pending).into_iter().map(|(k, v)| (k, v / n)).collect();
        self.pending_loss = 0.0;
        self.report(lr)?;

        if self.plan.is_due(self.epoch, self.epoch_step, self.global_step, self.total_steps) {
            self.checkpoint(objective)?;
        }
        Ok(self.global_step >= self.total_steps)
    }

    fn report(&mut self, lr: f64) -> Result<()> {
        self.pb.set_message(format!("epoch {} loss {:.4}", self.epoch + 1, self.last_loss));
        self.pb.inc(1);

        if self.global_step % self.print_every == 0 {
            info!(
                global_step = self.global_step,
                epoch = self.epoch + 1,
                lr,
                loss = self.last_loss,
                losses = ?self.last_losses,
                "Step"
            );
        }
        if let Some(log) = &mut self.log {
            log.append(&LossRecord {
                global_step: self.global_step,
                epoch: self.epoch,
                lr,
                loss: self.last_loss,
                losses: self.last_losses.clone(),
            })?;
        }
        Ok(())
    }

    /// Set the main learning rate for `step` and scale the objective's own
    /// optimizers by the same factor relative to `base_lr`.
    fn apply_lr_schedule<B, J, O>(&self, objective: &mut J, optimizer: &mut O, step: usize)
    where
        J: Objective<B, Student = S>,
        O: Optimizer,
    {
        let Some(schedule) = &self.lr_schedule else { return };
        let lr = schedule.lr(step);
        optimizer.set_learning_rate(lr);
        if self.base_lr > 0.0 {
            objective.scale_learning_rate(lr / self.base_lr);
        }
    }

    fn checkpoint<B, J>(&mut self, objective: &mut J) -> Result<()>
    where
        J: Objective<B, Student = S>,
    {
        let path = save_checkpoint(objective.student().varmap(), &self.config.output_dir, self.global_step)?;
        self.checkpoints.push(path);

        if let Some(callback) = &mut self.callback {
            info!(global_step = self.global_step, "Running callback function");
            objective.set_student_training(false);
            let result = callback(objective.student(), self.global_step);
            objective.set_student_training(true);
            result.with_context(|| format!("Callback failed at global step {}", self.global_step))?;
        }
        Ok(())
    }
}

// ── Gradient helpers ──────────────────────────────────────────────────────────

/// Add `new` into `acc` for every var in `vars`.
fn accumulate(acc: &mut Option<GradStore>, new: GradStore, vars: &[Var]) -> Result<()> {
    if acc.is_none() {
        *acc = Some(new);
        return Ok(());
    }
    let Some(acc) = acc.as_mut() else { return Ok(()) };
    for var in vars {
        let Some(g) = new.get(var.as_tensor()) else { continue };
        let sum = match acc.get(var.as_tensor()) {
            Some(prev) => (prev + g)?,
            None => g.clone(),
        };
        acc.insert(var.as_tensor(), sum);
    }
    Ok(())
}

/// Rescale the gradients of `vars` so their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub(crate) fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = g.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

// ── Progress / formatting ─────────────────────────────────────────────────────

pub(crate) fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▓░"));
    }
    pb.set_message(label.to_string());
    pb
}

pub(crate) fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
