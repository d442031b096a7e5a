//! Plain supervised training on the model's own losses.

use anyhow::Result;
use candle_nn::optim::Optimizer;

use distilkit_core::{Adaptor, CoreError, Model, Trainable};

use crate::config::TrainingConfig;
use crate::dataset::BatchLoader;
use crate::distiller::{run_training, TrainOptions, TrainingStats};
use crate::objective::{hard_label_loss, run_student, LossOutput, LossTerms, Objective, HARD_LABEL_LOSS};

/// Trains a single model on `Σ mean(losses)` from its adaptor output.
///
/// Useful for fine-tuning the teacher before distillation.
pub struct BasicTrainer<B, M: Model<B>> {
    config: TrainingConfig,
    model: M,
    adaptor: Adaptor<B, M::Output>,
}

impl<B, M: Model<B> + Trainable> BasicTrainer<B, M> {
    pub fn new(config: TrainingConfig, model: M, adaptor: Adaptor<B, M::Output>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, model, adaptor })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Loss of one batch.
    pub fn train_on_batch(&self, batch: &B) -> Result<LossOutput> {
        let out = run_student(&self.model, &self.adaptor, batch)?;
        let loss = hard_label_loss(&out)?
            .ok_or_else(|| CoreError::MissingKey { role: "model", key: "losses".into() })?;
        let mut terms = LossTerms::new();
        terms.add(HARD_LABEL_LOSS, loss, 1.0)?;
        terms.finish()
    }

    pub fn train<O, L>(&mut self, optimizer: &mut O, loader: &mut L, options: TrainOptions<'_, B, M>) -> Result<TrainingStats>
    where
        O: Optimizer,
        L: BatchLoader<Batch = B>,
    {
        let config = self.config.clone();
        run_training(self, &config, false, optimizer, loader, options)
    }
}

impl<B, M: Model<B> + Trainable> Objective<B> for BasicTrainer<B, M> {
    type Student = M;

    fn student(&self) -> &M {
        &self.model
    }

    fn set_student_training(&mut self, training: bool) {
        self.model.set_training(training);
    }

    fn loss(&mut self, batch: &B, _cached: Option<&distilkit_core::AdaptorOutput>, _progress: f64) -> Result<LossOutput> {
        self.train_on_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{student_adaptor, toy_loader, LinearNet, ToyBatch, ToyOutput};
    use candle_nn::SGD;
    use distilkit_core::{adaptor, AdaptorOutput};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TrainingConfig {
        TrainingConfig { output_dir: dir.path().to_path_buf(), ..Default::default() }
    }

    #[test]
    fn reduces_hard_label_loss() {
        let dir = TempDir::new().unwrap();
        let mut trainer = BasicTrainer::new(config(&dir), LinearNet::student(), student_adaptor()).unwrap();
        let batch = crate::test_support::toy_batches().remove(0);
        let before = distilkit_core::losses::scalar(&trainer.train_on_batch(&batch).unwrap().total).unwrap();

        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.5).unwrap();
        let stats = trainer.train(&mut opt, &mut toy_loader(), TrainOptions::epochs(30)).unwrap();
        assert_eq!(stats.total_steps, 120);

        let after = distilkit_core::losses::scalar(&trainer.train_on_batch(&batch).unwrap().total).unwrap();
        assert!(after < before, "{after} !< {before}");
        assert!(trainer.model().training);
    }

    #[test]
    fn missing_losses_is_an_error() {
        let dir = TempDir::new().unwrap();
        let logits_only = adaptor(|_: &ToyBatch, o: &ToyOutput| Ok(AdaptorOutput::new().with_logits(vec![o.logits.clone()])));
        let trainer = BasicTrainer::new(config(&dir), LinearNet::student(), logits_only).unwrap();
        let batch = crate::test_support::toy_batches().remove(0);
        let err = trainer.train_on_batch(&batch).unwrap_err();
        assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::MissingKey { key, .. }) if key == "losses"));
    }

    #[test]
    fn empty_adaptor_output_is_an_error() {
        let dir = TempDir::new().unwrap();
        let empty = adaptor(|_: &ToyBatch, _: &ToyOutput| Ok(AdaptorOutput::new()));
        let trainer = BasicTrainer::new(config(&dir), LinearNet::student(), empty).unwrap();
        let batch = crate::test_support::toy_batches().remove(0);
        let err = trainer.train_on_batch(&batch).unwrap_err();
        assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::EmptyAdaptorOutput { .. })));
    }

    #[test]
    fn checkpoints_and_callback_follow_frequency() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig { ckpt_frequency: 2, ..config(&dir) };
        let mut trainer = BasicTrainer::new(cfg, LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();

        let mut seen = Vec::new();
        let options = TrainOptions::steps(6).with_callback(|m: &LinearNet, step| {
            assert!(!m.training, "callback must see the model in evaluation mode");
            seen.push(step);
            Ok(())
        });
        let stats = trainer.train(&mut opt, &mut toy_loader(), options).unwrap();

        assert_eq!(stats.total_steps, 6);
        assert_eq!(seen, vec![3, 6]);
        assert_eq!(stats.checkpoints.len(), 2);
        assert!(dir.path().join("gs3.safetensors").exists());
        assert!(dir.path().join("gs6.safetensors").exists());
    }

    #[test]
    fn callback_error_aborts_training() {
        let dir = TempDir::new().unwrap();
        let mut trainer = BasicTrainer::new(config(&dir), LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        let options = TrainOptions::steps(8).with_callback(|_: &LinearNet, _| anyhow::bail!("stop"));
        assert!(trainer.train(&mut opt, &mut toy_loader(), options).is_err());
    }

    #[test]
    fn gradient_accumulation_divides_steps() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig { gradient_accumulation_steps: 3, ..config(&dir) };
        let mut trainer = BasicTrainer::new(cfg, LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        // 4 batches per epoch, 3 per step: one step per epoch, one batch dropped.
        let stats = trainer.train(&mut opt, &mut toy_loader(), TrainOptions::epochs(2)).unwrap();
        assert_eq!(stats.total_steps, 2);
        assert_eq!(stats.checkpoints.len(), 2);
    }

    #[test]
    fn accumulation_larger_than_loader_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig { gradient_accumulation_steps: 5, ..config(&dir) };
        let mut trainer = BasicTrainer::new(cfg, LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        assert!(trainer.train(&mut opt, &mut toy_loader(), TrainOptions::epochs(1)).is_err());
    }

    /// Yields every batch in epoch 0 and only one afterwards.
    struct ShrinkingLoader(Vec<ToyBatch>);

    impl BatchLoader for ShrinkingLoader {
        type Batch = ToyBatch;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn epoch_batches(&mut self, epoch: usize) -> Result<Vec<ToyBatch>> {
            let n = if epoch == 0 { self.0.len() } else { 1 };
            Ok(self.0[..n].to_vec())
        }
    }

    #[test]
    fn short_epoch_in_steps_mode_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig { gradient_accumulation_steps: 2, ..config(&dir) };
        let mut trainer = BasicTrainer::new(cfg, LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        let mut loader = ShrinkingLoader(crate::test_support::toy_batches());
        let err = trainer.train(&mut opt, &mut loader, TrainOptions::steps(5)).unwrap_err();
        assert!(err.to_string().contains("epoch 1"), "{err}");
    }

    #[test]
    fn postprocessor_runs_on_every_batch() {
        let dir = TempDir::new().unwrap();
        let mut trainer = BasicTrainer::new(config(&dir), LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        let calls = std::cell::Cell::new(0usize);
        let options = TrainOptions::epochs(2).with_batch_postprocessor(|b: ToyBatch| {
            calls.set(calls.get() + 1);
            Ok(b)
        });
        trainer.train(&mut opt, &mut toy_loader(), options).unwrap();
        assert_eq!(calls.get(), 8);
    }

    #[test]
    fn non_finite_loss_names_the_step() {
        let dir = TempDir::new().unwrap();
        let nan = adaptor(|_: &ToyBatch, o: &ToyOutput| {
            let bad = (o.logits.sum_all()? * f64::NAN)?;
            Ok(AdaptorOutput::new().with_losses(vec![bad]))
        });
        let mut trainer = BasicTrainer::new(config(&dir), LinearNet::student(), nan).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        let err = trainer.train(&mut opt, &mut toy_loader(), TrainOptions::steps(2)).unwrap_err();
        assert!(err.to_string().contains("global step 1"), "{err}");
    }

    #[test]
    fn loss_log_gets_one_record_per_step() {
        let dir = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let cfg = TrainingConfig { log_dir: Some(logs.path().to_path_buf()), ..config(&dir) };
        let mut trainer = BasicTrainer::new(cfg, LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 0.1).unwrap();
        trainer.train(&mut opt, &mut toy_loader(), TrainOptions::steps(5)).unwrap();
        let records = crate::checkpoint::LossLog::read(&logs.path().join("losses.jsonl")).unwrap();
        assert_eq!(records.len(), 5);
        assert!(records[0].losses.contains_key(HARD_LABEL_LOSS));
    }

    #[test]
    fn lr_schedule_drives_the_optimizer() {
        let dir = TempDir::new().unwrap();
        let mut trainer = BasicTrainer::new(config(&dir), LinearNet::student(), student_adaptor()).unwrap();
        let mut opt = SGD::new(trainer.model().trainable_vars(), 1.0).unwrap();
        let schedule = distilkit_core::LinearWarmupDecay::new(1.0, 2, 4);
        trainer.train(&mut opt, &mut toy_loader(), TrainOptions::steps(4).with_lr_schedule(schedule)).unwrap();
        assert_eq!(opt.learning_rate(), 0.0);
    }
}
