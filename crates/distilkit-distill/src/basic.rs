//! Single-teacher logits distillation.

use anyhow::Result;
use candle_nn::optim::Optimizer;
use tracing::warn;

use distilkit_core::{Adaptor, AdaptorOutput, Model, Trainable};

use crate::config::{DistillationConfig, TrainingConfig};
use crate::dataset::BatchLoader;
use crate::distiller::{run_training, TrainOptions, TrainingStats};
use crate::objective::{logit_terms, run_student, run_teacher, LossOutput, LossTerms, Objective};

/// KD loss between student and teacher logits plus the student's hard-label
/// losses. Intermediate matches are handled by
/// [`GeneralDistiller`](crate::GeneralDistiller).
pub struct BasicDistiller<B, T: Model<B>, S: Model<B>> {
    pub(crate) train_config: TrainingConfig,
    pub(crate) distill_config: DistillationConfig,
    pub(crate) teacher: T,
    pub(crate) student: S,
    pub(crate) adaptor_t: Adaptor<B, T::Output>,
    pub(crate) adaptor_s: Adaptor<B, S::Output>,
}

impl<B, T, S> BasicDistiller<B, T, S>
where
    T: Model<B>,
    S: Model<B> + Trainable,
{
    /// The teacher is switched to evaluation mode for the distiller's lifetime.
    pub fn new(
        train_config: TrainingConfig,
        distill_config: DistillationConfig,
        mut teacher: T,
        student: S,
        adaptor_t: Adaptor<B, T::Output>,
        adaptor_s: Adaptor<B, S::Output>,
    ) -> Result<Self> {
        train_config.validate()?;
        distill_config.validate()?;
        teacher.set_training(false);
        Ok(Self { train_config, distill_config, teacher, student, adaptor_t, adaptor_s })
    }

    pub fn student(&self) -> &S {
        &self.student
    }

    pub fn teacher(&self) -> &T {
        &self.teacher
    }

    pub fn into_student(self) -> S {
        self.student
    }

    pub fn distill_config(&self) -> &DistillationConfig {
        &self.distill_config
    }

    /// Loss of one batch, running the teacher unless `cached` is given.
    pub fn train_on_batch(&self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        let mut terms = LossTerms::new();
        self.logit_terms(batch, cached, progress, &mut terms)?;
        terms.finish()
    }

    pub(crate) fn logit_terms(
        &self,
        batch: &B,
        cached: Option<&AdaptorOutput>,
        progress: f64,
        terms: &mut LossTerms,
    ) -> Result<(AdaptorOutput, AdaptorOutput)> {
        let out_t = match cached {
            Some(c) => c.clone(),
            None => run_teacher(&self.teacher, &self.adaptor_t, batch)?,
        };
        let out_s = run_student(&self.student, &self.adaptor_s, batch)?;
        logit_terms(&self.distill_config, &out_s, &out_t, progress, terms)?;
        Ok((out_s, out_t))
    }

    pub fn train<O, L>(&mut self, optimizer: &mut O, loader: &mut L, options: TrainOptions<'_, B, S>) -> Result<TrainingStats>
    where
        O: Optimizer,
        L: BatchLoader<Batch = B>,
    {
        if !self.distill_config.intermediate_matches.is_empty() {
            warn!(
                count = self.distill_config.intermediate_matches.len(),
                "BasicDistiller ignores intermediate_matches; use GeneralDistiller"
            );
        }
        let config = self.train_config.clone();
        let caching = self.distill_config.is_caching_logits;
        run_training(self, &config, caching, optimizer, loader, options)
    }
}

impl<B, T, S> Objective<B> for BasicDistiller<B, T, S>
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

    fn teacher_output(&self, batch: &B) -> Result<Option<AdaptorOutput>> {
        run_teacher(&self.teacher, &self.adaptor_t, batch).map(Some)
    }

    fn loss(&mut self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        self.train_on_batch(batch, cached, progress)
    }
}
