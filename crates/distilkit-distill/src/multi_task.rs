//! One student distilled from several single-task teachers.
//!
//! Each task brings its own teacher, adaptors and batch loader. Every
//! micro-batch comes from one task, sampled with probability proportional to
//! `len(loader)^(1/tau)`: `tau = 1` samples in proportion to dataset size,
//! larger values flatten the mix towards uniform.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use candle_nn::optim::Optimizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use distilkit_core::{Adaptor, AdaptorOutput, Model, Trainable};

use crate::config::{DistillationConfig, TrainingConfig};
use crate::dataset::BatchLoader;
use crate::distiller::{run_training, TrainOptions, TrainingStats};
use crate::objective::{logit_terms, run_student, run_teacher, LossOutput, LossTerms, Objective};

/// A batch tagged with the task it belongs to.
#[derive(Debug, Clone)]
pub struct TaskBatch<B> {
    pub task: String,
    pub batch: B,
}

/// Teacher and adaptors for one task.
pub struct Task<B, T: Model<B>, S: Model<B>> {
    pub teacher: T,
    pub adaptor_t: Adaptor<B, T::Output>,
    pub adaptor_s: Adaptor<B, S::Output>,
}

impl<B, T: Model<B>, S: Model<B>> Task<B, T, S> {
    pub fn new(teacher: T, adaptor_t: Adaptor<B, T::Output>, adaptor_s: Adaptor<B, S::Output>) -> Self {
        Self { teacher, adaptor_t, adaptor_s }
    }
}

pub struct MultiTaskDistiller<B, T: Model<B>, S: Model<B>> {
    train_config: TrainingConfig,
    distill_config: DistillationConfig,
    student: S,
    tasks: BTreeMap<String, Task<B, T, S>>,
}

impl<B, T, S> MultiTaskDistiller<B, T, S>
where
    T: Model<B>,
    S: Model<B> + Trainable,
{
    pub fn new(
        train_config: TrainingConfig,
        distill_config: DistillationConfig,
        student: S,
        mut tasks: BTreeMap<String, Task<B, T, S>>,
    ) -> Result<Self> {
        anyhow::ensure!(!tasks.is_empty(), "MultiTaskDistiller needs at least one task");
        train_config.validate()?;
        distill_config.validate()?;
        for task in tasks.values_mut() {
            task.teacher.set_training(false);
        }
        Ok(Self { train_config, distill_config, student, tasks })
    }

    pub fn student(&self) -> &S {
        &self.student
    }

    pub fn into_student(self) -> S {
        self.student
    }

    pub fn task(&self, name: &str) -> Result<&Task<B, T, S>> {
        self.tasks.get(name).with_context(|| format!("Unknown task '{name}'"))
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn train_on_batch(&self, batch: &TaskBatch<B>, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        let task = self.task(&batch.task)?;
        let out_t = match cached {
            Some(c) => c.clone(),
            None => run_teacher(&task.teacher, &task.adaptor_t, &batch.batch)?,
        };
        let out_s = run_student(&self.student, &task.adaptor_s, &batch.batch)?;
        let mut terms = LossTerms::new();
        logit_terms(&self.distill_config, &out_s, &out_t, progress, &mut terms)
            .with_context(|| format!("Task '{}'", batch.task))?;
        terms.finish()
    }

    /// Train on a mix of `loaders`, one per task, sampled with temperature `tau`.
    pub fn train<O, L>(
        &mut self,
        optimizer: &mut O,
        loaders: BTreeMap<String, L>,
        tau: f64,
        options: TrainOptions<'_, TaskBatch<B>, S>,
    ) -> Result<TrainingStats>
    where
        O: Optimizer,
        L: BatchLoader<Batch = B>,
    {
        if !self.distill_config.intermediate_matches.is_empty() {
            warn!(
                count = self.distill_config.intermediate_matches.len(),
                "MultiTaskDistiller ignores intermediate_matches"
            );
        }
        for name in loaders.keys() {
            self.task(name)?;
        }
        let mut mix = TaskMixLoader::new(loaders, tau, options.seed)?;
        let config = self.train_config.clone();
        let caching = self.distill_config.is_caching_logits;
        run_training(self, &config, caching, optimizer, &mut mix, options)
    }
}

impl<B, T, S> Objective<TaskBatch<B>> for MultiTaskDistiller<B, T, S>
where
    T: Model<B>,
    S: Model<B> + Trainable,
{
    type Student = S;

    fn student(&self) -> &S {
        &self.student
    }

    fn set_student_training(&mut self, training: bool) {
        self.student.set_training(training);
    }

    fn teacher_output(&self, batch: &TaskBatch<B>) -> Result<Option<AdaptorOutput>> {
        let task = self.task(&batch.task)?;
        run_teacher(&task.teacher, &task.adaptor_t, &batch.batch).map(Some)
    }

    fn loss(&mut self, batch: &TaskBatch<B>, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        self.train_on_batch(batch, cached, progress)
    }
}

// ── Task sampling ─────────────────────────────────────────────────────────────

/// Normalised sampling probabilities `len_i^(1/tau) / Σ len_j^(1/tau)`.
pub fn sampling_weights(lens: &[usize], tau: f64) -> Result<Vec<f64>> {
    anyhow::ensure!(tau.is_finite() && tau > 0.0, "Task sampling temperature must be positive, got {tau}");
    let raw: Vec<f64> = lens.iter().map(|&n| (n as f64).powf(1.0 / tau)).collect();
    let total: f64 = raw.iter().sum();
    anyhow::ensure!(total > 0.0, "Every task loader is empty");
    Ok(raw.into_iter().map(|w| w / total).collect())
}

/// Interleaves several task loaders into one stream of [`TaskBatch`]es.
///
/// An epoch has as many batches as all loaders together. Each task's loader
/// is drained in its own order and restarted (with its next epoch) when
/// exhausted.
pub struct TaskMixLoader<L: BatchLoader> {
    names: Vec<String>,
    loaders: Vec<L>,
    weights: Vec<f64>,
    queues: Vec<VecDeque<L::Batch>>,
    passes: Vec<usize>,
    rng: StdRng,
}

impl<L: BatchLoader> TaskMixLoader<L> {
    pub fn new(loaders: BTreeMap<String, L>, tau: f64, seed: u64) -> Result<Self> {
        anyhow::ensure!(!loaders.is_empty(), "No task loaders given");
        let (names, loaders): (Vec<String>, Vec<L>) = loaders.into_iter().unzip();
        let lens: Vec<usize> = loaders.iter().map(BatchLoader::len).collect();
        let weights = sampling_weights(&lens, tau)?;
        for ((name, len), w) in names.iter().zip(&lens).zip(&weights) {
            info!(task = %name, batches = len, probability = w, "Task");
        }
        let n = loaders.len();
        Ok(Self {
            names,
            loaders,
            weights,
            queues: (0..n).map(|_| VecDeque::new()).collect(),
            passes: vec![0; n],
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn sample_task(&mut self) -> usize {
        let r: f64 = self.rng.random();
        let mut acc = 0.0;
        for (i, w) in self.weights.iter().enumerate() {
            acc += w;
            if r < acc {
                return i;
            }
        }
        self.weights.len() - 1
    }

    fn next_batch(&mut self, task: usize) -> Result<L::Batch> {
        if self.queues[task].is_empty() {
            let batches = self.loaders[task].epoch_batches(self.passes[task])?;
            anyhow::ensure!(!batches.is_empty(), "Loader for task '{}' produced no batches", self.names[task]);
            self.passes[task] += 1;
            self.queues[task] = batches.into();
        }
        self.queues[task]
            .pop_front()
            .with_context(|| format!("Loader for task '{}' ran dry", self.names[task]))
    }
}

impl<L: BatchLoader> BatchLoader for TaskMixLoader<L> {
    type Batch = TaskBatch<L::Batch>;

    fn len(&self) -> usize {
        self.loaders.iter().map(BatchLoader::len).sum()
    }

    fn epoch_batches(&mut self, _epoch: usize) -> Result<Vec<Self::Batch>> {
        let n = self.len();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let task = self.sample_task();
            let batch = self.next_batch(task)?;
            out.push(TaskBatch { task: self.names[task].clone(), batch });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::VecLoader;
    use crate::objective::{HARD_LABEL_LOSS, KD_LOSS};
    use distilkit_core::{Feature, IntermediateMatch, LayerSel, MatchLoss};
    use crate::test_support::{student_adaptor, teacher_adaptor, toy_batches, toy_loader, LinearNet, ToyBatch};
    use candle_nn::SGD;
    use tempfile::TempDir;

    #[test]
    fn weights_follow_size_and_temperature() {
        let w = sampling_weights(&[1, 3], 1.0).unwrap();
        assert!((w[0] - 0.25).abs() < 1e-12 && (w[1] - 0.75).abs() < 1e-12);
        let flat = sampling_weights(&[1, 100], 1e9).unwrap();
        assert!((flat[0] - 0.5).abs() < 1e-6);
        assert!(sampling_weights(&[1], 0.0).is_err());
        assert!(sampling_weights(&[0, 0], 1.0).is_err());
    }

    #[test]
    fn mix_draws_from_every_task_and_restarts_loaders() {
        let mut loaders = BTreeMap::new();
        loaders.insert("a".to_string(), VecLoader::new(vec![1u32]));
        loaders.insert("b".to_string(), VecLoader::new(vec![10u32, 20, 30]));
        let mut mix = TaskMixLoader::new(loaders, 1.0, 7).unwrap();
        assert_eq!(mix.len(), 4);

        let mut counts = BTreeMap::new();
        for epoch in 0..50 {
            for tb in mix.epoch_batches(epoch).unwrap() {
                if tb.task == "a" {
                    assert_eq!(tb.batch, 1);
                }
                *counts.entry(tb.task).or_insert(0usize) += 1;
            }
        }
        let a = counts["a"] as f64 / 200.0;
        assert!((a - 0.25).abs() < 0.1, "task a share {a}");
    }

    fn two_task_distiller(dir: &TempDir) -> MultiTaskDistiller<ToyBatch, LinearNet, LinearNet> {
        let t = TrainingConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let mut tasks = BTreeMap::new();
        tasks.insert("swap".to_string(), Task::new(LinearNet::fixed([[0.0, 1.0], [1.0, 0.0]]), teacher_adaptor(), student_adaptor()));
        tasks.insert("main".to_string(), Task::new(LinearNet::teacher(), teacher_adaptor(), student_adaptor()));
        MultiTaskDistiller::new(t, DistillationConfig::default(), LinearNet::student(), tasks).unwrap()
    }

    #[test]
    fn trains_on_both_tasks() {
        let dir = TempDir::new().unwrap();
        let mut d = two_task_distiller(&dir);
        let mut loaders = BTreeMap::new();
        loaders.insert("main".to_string(), toy_loader());
        loaders.insert("swap".to_string(), toy_loader());
        let mut opt = SGD::new(d.student().trainable_vars(), 0.1).unwrap();
        let stats = d.train(&mut opt, loaders, 1.0, TrainOptions::epochs(2)).unwrap();
        assert_eq!(stats.total_steps, 16);
        assert!(stats.final_losses.contains_key(KD_LOSS));
        let calls: usize = d.tasks.values().map(|t| t.teacher.forward_calls.get()).sum();
        assert_eq!(calls, 16);
        assert!(d.tasks.values().all(|t| t.teacher.forward_calls.get() > 0));
    }

    #[test]
    fn intermediate_matches_are_ignored() {
        let dir = TempDir::new().unwrap();
        let mut d = two_task_distiller(&dir);
        d.distill_config.intermediate_matches =
            vec![IntermediateMatch::new(LayerSel::One(1), LayerSel::One(1), Feature::Hidden, MatchLoss::HiddenMse)];
        let mut loaders = BTreeMap::new();
        loaders.insert("main".to_string(), toy_loader());
        let mut opt = SGD::new(d.student().trainable_vars(), 0.1).unwrap();
        let stats = d.train(&mut opt, loaders, 1.0, TrainOptions::steps(2)).unwrap();
        let keys: Vec<&str> = stats.final_losses.keys().map(String::as_str).collect();
        assert_eq!(keys, vec![HARD_LABEL_LOSS, KD_LOSS]);
    }

    #[test]
    fn unknown_task_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut d = two_task_distiller(&dir);
        let mut loaders = BTreeMap::new();
        loaders.insert("other".to_string(), toy_loader());
        let mut opt = SGD::new(d.student().trainable_vars(), 0.1).unwrap();
        assert!(d.train(&mut opt, loaders, 1.0, TrainOptions::epochs(1)).is_err());

        let batch = TaskBatch { task: "other".to_string(), batch: toy_batches().remove(0) };
        assert!(d.train_on_batch(&batch, None, 0.0).is_err());
    }
}
