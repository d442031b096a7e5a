//! Distillation from an ensemble of teachers.

use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_nn::optim::Optimizer;
use tracing::warn;

use distilkit_core::{Adaptor, AdaptorOutput, Model, Trainable};

use crate::config::{DistillationConfig, TrainingConfig};
use crate::dataset::BatchLoader;
use crate::distiller::{run_training, TrainOptions, TrainingStats};
use crate::objective::{logit_terms, run_student, run_teacher, LossOutput, LossTerms, Objective};

/// Averages the teachers' logits element-wise and distils the mean into the
/// student as [`BasicDistiller`](crate::BasicDistiller) would.
///
/// All teachers share one adaptor and must produce the same number of
/// logits heads with identical shapes.
pub struct MultiTeacherDistiller<B, T: Model<B>, S: Model<B>> {
    train_config: TrainingConfig,
    distill_config: DistillationConfig,
    teachers: Vec<T>,
    student: S,
    adaptor_t: Adaptor<B, T::Output>,
    adaptor_s: Adaptor<B, S::Output>,
}

impl<B, T, S> MultiTeacherDistiller<B, T, S>
where
    T: Model<B>,
    S: Model<B> + Trainable,
{
    pub fn new(
        train_config: TrainingConfig,
        distill_config: DistillationConfig,
        mut teachers: Vec<T>,
        student: S,
        adaptor_t: Adaptor<B, T::Output>,
        adaptor_s: Adaptor<B, S::Output>,
    ) -> Result<Self> {
        anyhow::ensure!(!teachers.is_empty(), "MultiTeacherDistiller needs at least one teacher");
        train_config.validate()?;
        distill_config.validate()?;
        for t in &mut teachers {
            t.set_training(false);
        }
        Ok(Self { train_config, distill_config, teachers, student, adaptor_t, adaptor_s })
    }

    pub fn student(&self) -> &S {
        &self.student
    }

    pub fn teachers(&self) -> &[T] {
        &self.teachers
    }

    pub fn into_student(self) -> S {
        self.student
    }

    pub fn train_on_batch(&self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        let out_t = match cached {
            Some(c) => c.clone(),
            None => self.ensemble_output(batch)?,
        };
        let out_s = run_student(&self.student, &self.adaptor_s, batch)?;
        let mut terms = LossTerms::new();
        logit_terms(&self.distill_config, &out_s, &out_t, progress, &mut terms)?;
        terms.finish()
    }

    fn ensemble_output(&self, batch: &B) -> Result<AdaptorOutput> {
        let outputs = self
            .teachers
            .iter()
            .map(|t| run_teacher(t, &self.adaptor_t, batch))
            .collect::<Result<Vec<_>>>()?;
        average_logits(outputs)
    }

    pub fn train<O, L>(&mut self, optimizer: &mut O, loader: &mut L, options: TrainOptions<'_, B, S>) -> Result<TrainingStats>
    where
        O: Optimizer,
        L: BatchLoader<Batch = B>,
    {
        if !self.distill_config.intermediate_matches.is_empty() {
            warn!("MultiTeacherDistiller ignores intermediate_matches");
        }
        let config = self.train_config.clone();
        let caching = self.distill_config.is_caching_logits;
        run_training(self, &config, caching, optimizer, loader, options)
    }
}

/// Replace the first output's logits with the element-wise mean over all
/// outputs. Other fields come from the first output.
pub fn average_logits(outputs: Vec<AdaptorOutput>) -> Result<AdaptorOutput> {
    let mut iter = outputs.into_iter();
    let mut first = iter.next().context("No teacher outputs to average")?;
    let rest: Vec<AdaptorOutput> = iter.collect();
    if rest.is_empty() {
        return Ok(first);
    }

    let Some(heads) = first.logits.take() else {
        anyhow::ensure!(rest.iter().all(|o| o.logits.is_none()), "Only some teachers produced logits");
        return Ok(first);
    };
    let n_heads = heads.len();
    let mut averaged = Vec::with_capacity(n_heads);
    for (i, head) in heads.into_iter().enumerate() {
        let mut stack = vec![head];
        for (j, o) in rest.iter().enumerate() {
            let logits = o.logits.as_ref().with_context(|| format!("Teacher {} produced no logits", j + 1))?;
            anyhow::ensure!(
                logits.len() == n_heads,
                "Teacher {} produced {} logits heads, expected {}",
                j + 1,
                logits.len(),
                n_heads
            );
            stack.push(logits[i].clone());
        }
        averaged.push(Tensor::stack(&stack, 0)?.mean(0)?);
    }
    first.logits = Some(averaged);
    Ok(first)
}

impl<B, T, S> Objective<B> for MultiTeacherDistiller<B, T, S>
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
        self.ensemble_output(batch).map(Some)
    }

    fn loss(&mut self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        self.train_on_batch(batch, cached, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::KD_LOSS;
    use crate::test_support::{student_adaptor, teacher_adaptor, toy_batches, toy_loader, LinearNet};
    use candle_core::Device;
    use candle_nn::SGD;
    use tempfile::TempDir;

    fn logits(v: [[f32; 2]; 1]) -> AdaptorOutput {
        AdaptorOutput::new().with_logits(vec![Tensor::new(&v, &Device::Cpu).unwrap()])
    }

    #[test]
    fn averages_logits_elementwise() {
        let avg = average_logits(vec![logits([[1.0, 3.0]]), logits([[3.0, -1.0]])]).unwrap();
        assert_eq!(avg.logits.unwrap()[0].to_vec2::<f32>().unwrap(), vec![vec![2.0, 1.0]]);
    }

    #[test]
    fn head_count_mismatch_is_an_error() {
        let two_heads = logits([[1.0, 1.0]]).with_logits(vec![
            Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap(),
            Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap(),
        ]);
        assert!(average_logits(vec![logits([[1.0, 1.0]]), two_heads]).is_err());
        assert!(average_logits(vec![logits([[1.0, 1.0]]), AdaptorOutput::new().with_hidden(Vec::<Tensor>::new())]).is_err());
    }

    #[test]
    fn ensemble_of_identical_teachers_equals_one_teacher() {
        let dir = TempDir::new().unwrap();
        let t = TrainingConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let d = MultiTeacherDistiller::new(
            t,
            DistillationConfig::default(),
            vec![LinearNet::teacher(), LinearNet::teacher()],
            LinearNet::student(),
            teacher_adaptor(),
            student_adaptor(),
        )
        .unwrap();
        let batch = toy_batches().remove(0);
        let single = run_teacher(&d.teachers()[0], &teacher_adaptor(), &batch).unwrap();
        let ens = d.teacher_output(&batch).unwrap().unwrap();
        assert_eq!(
            single.logits.unwrap()[0].to_vec2::<f32>().unwrap(),
            ens.logits.unwrap()[0].to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn trains_with_caching() {
        let dir = TempDir::new().unwrap();
        let t = TrainingConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let d_cfg = DistillationConfig { is_caching_logits: true, ..Default::default() };
        let mut d = MultiTeacherDistiller::new(
            t,
            d_cfg,
            vec![LinearNet::teacher(), LinearNet::fixed([[1.0, 0.0], [0.0, 1.0]])],
            LinearNet::student(),
            teacher_adaptor(),
            student_adaptor(),
        )
        .unwrap();
        let mut opt = SGD::new(d.student().trainable_vars(), 0.1).unwrap();
        let stats = d.train(&mut opt, &mut toy_loader(), TrainOptions::epochs(2)).unwrap();
        assert_eq!(stats.total_steps, 8);
        assert!(stats.final_losses.contains_key(KD_LOSS));
        assert!(d.teachers().iter().all(|t| t.forward_calls.get() == 4));
    }

    #[test]
    fn empty_ensemble_is_rejected() {
        let r = MultiTeacherDistiller::new(
            TrainingConfig::default(),
            DistillationConfig::default(),
            Vec::<LinearNet>::new(),
            LinearNet::student(),
            teacher_adaptor(),
            student_adaptor(),
        );
        assert!(r.is_err());
    }
}
