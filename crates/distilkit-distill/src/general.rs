//! Logits distillation plus intermediate-feature matching.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Module, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use distilkit_core::{select_device, Adaptor, AdaptorOutput, IntermediateMatch, Model, Projection, Trainable};

use crate::basic::BasicDistiller;
use crate::config::{DistillationConfig, TrainingConfig};
use crate::dataset::BatchLoader;
use crate::distiller::{run_training, TrainOptions, TrainingStats};
use crate::objective::{LossOutput, LossTerms, Objective};

/// A projection's weights and, when it has its own learning rate, its own
/// optimizer.
struct ProjectionSlot {
    projection: Projection,
    varmap: VarMap,
    /// Dedicated optimizer and its unscaled learning rate.
    optimizer: Option<(AdamW, f64)>,
}

/// [`BasicDistiller`] losses plus every configured [`IntermediateMatch`].
///
/// Student features listed in a match with a `proj` pass through a trainable
/// [`Projection`] before the loss. Projection weights live on the training
/// device and are trained by the main optimizer, unless the projection sets
/// its own `learning_rate`, in which case a dedicated AdamW steps it.
pub struct GeneralDistiller<B, T: Model<B>, S: Model<B>> {
    inner: BasicDistiller<B, T, S>,
    projections: Vec<Option<ProjectionSlot>>,
}

impl<B, T, S> GeneralDistiller<B, T, S>
where
    T: Model<B>,
    S: Model<B> + Trainable,
{
    pub fn new(
        train_config: TrainingConfig,
        distill_config: DistillationConfig,
        teacher: T,
        student: S,
        adaptor_t: Adaptor<B, T::Output>,
        adaptor_s: Adaptor<B, S::Output>,
    ) -> Result<Self> {
        let inner = BasicDistiller::new(train_config, distill_config, teacher, student, adaptor_t, adaptor_s)?;
        let device = select_device(&inner.train_config.device)?;

        let mut projections = Vec::with_capacity(inner.distill_config.intermediate_matches.len());
        for (i, m) in inner.distill_config.intermediate_matches.iter().enumerate() {
            let Some(spec) = &m.proj else {
                projections.push(None);
                continue;
            };
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let projection = Projection::new(spec, vb.pp(format!("proj{i}")))
                .with_context(|| format!("Failed to build projection for match {i}"))?;
            let optimizer = spec
                .options
                .learning_rate
                .map(|lr| {
                    AdamW::new(varmap.all_vars(), ParamsAdamW { lr, ..Default::default() }).map(|opt| (opt, lr))
                })
                .transpose()?;
            info!(
                index = i,
                kind = ?spec.kind,
                dim_in = spec.dim_in,
                dim_out = spec.dim_out,
                own_optimizer = optimizer.is_some(),
                "Projection"
            );
            projections.push(Some(ProjectionSlot { projection, varmap, optimizer }));
        }

        Ok(Self { inner, projections })
    }

    pub fn student(&self) -> &S {
        &self.inner.student
    }

    pub fn teacher(&self) -> &T {
        &self.inner.teacher
    }

    pub fn into_student(self) -> S {
        self.inner.student
    }

    /// Student parameters plus projections without their own learning rate.
    /// Build the main optimizer from these.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.inner.student.trainable_vars();
        for slot in self.projections.iter().flatten() {
            if slot.optimizer.is_none() {
                vars.extend(slot.varmap.all_vars());
            }
        }
        vars
    }

    /// Weights of the projection attached to match `index`, if any.
    pub fn projection_varmap(&self, index: usize) -> Option<&VarMap> {
        self.projections.get(index)?.as_ref().map(|slot| &slot.varmap)
    }

    pub fn train_on_batch(&self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        let mut terms = LossTerms::new();
        let (out_s, out_t) = self.inner.logit_terms(batch, cached, progress, &mut terms)?;
        let mask = out_s.inputs_mask.as_ref();

        for (m, slot) in self.inner.distill_config.intermediate_matches.iter().zip(&self.projections) {
            let feats_s = self.student_features(m, &out_s, slot.as_ref())?;
            let feats_t = select_layers(&out_t, "teacher", m, m.layer_t.indices())?;
            let loss = m
                .loss
                .compute(&feats_s, &feats_t, mask)
                .with_context(|| format!("Intermediate match {}", m.loss_name()))?;
            terms.add(m.loss_name(), loss, m.weight)?;
        }
        terms.finish()
    }

    fn student_features(
        &self,
        m: &IntermediateMatch,
        out_s: &AdaptorOutput,
        slot: Option<&ProjectionSlot>,
    ) -> Result<Vec<Tensor>> {
        let feats = select_layers(out_s, "student", m, m.layer_s.indices())?;
        match slot {
            Some(slot) => feats
                .iter()
                .map(|f| slot.projection.forward(f).map_err(anyhow::Error::from))
                .collect(),
            None => Ok(feats),
        }
    }

    pub fn train<O, L>(&mut self, optimizer: &mut O, loader: &mut L, options: TrainOptions<'_, B, S>) -> Result<TrainingStats>
    where
        O: Optimizer,
        L: BatchLoader<Batch = B>,
    {
        let config = self.inner.train_config.clone();
        let caching = self.inner.distill_config.is_caching_logits;
        run_training(self, &config, caching, optimizer, loader, options)
    }
}

fn select_layers(out: &AdaptorOutput, role: &'static str, m: &IntermediateMatch, indices: Vec<usize>) -> Result<Vec<Tensor>> {
    indices
        .into_iter()
        .map(|i| out.layer(role, m.feature, i).cloned().map_err(anyhow::Error::from))
        .collect()
}

impl<B, T, S> Objective<B> for GeneralDistiller<B, T, S>
where
    T: Model<B>,
    S: Model<B> + Trainable,
{
    type Student = S;

    fn student(&self) -> &S {
        &self.inner.student
    }

    fn set_student_training(&mut self, training: bool) {
        self.inner.student.set_training(training);
    }

    fn trainable_vars(&self) -> Vec<Var> {
        GeneralDistiller::trainable_vars(self)
    }

    fn auxiliary_vars(&self) -> Vec<Var> {
        self.projections
            .iter()
            .flatten()
            .filter(|slot| slot.optimizer.is_some())
            .flat_map(|slot| slot.varmap.all_vars())
            .collect()
    }

    fn teacher_output(&self, batch: &B) -> Result<Option<AdaptorOutput>> {
        self.inner.teacher_output(batch)
    }

    fn loss(&mut self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput> {
        self.train_on_batch(batch, cached, progress)
    }

    fn after_step(&mut self, grads: &GradStore) -> Result<()> {
        for slot in self.projections.iter_mut().flatten() {
            if let Some((opt, _)) = &mut slot.optimizer {
                opt.step(grads)?;
            }
        }
        Ok(())
    }

    fn scale_learning_rate(&mut self, ratio: f64) {
        for slot in self.projections.iter_mut().flatten() {
            if let Some((opt, base_lr)) = &mut slot.optimizer {
                opt.set_learning_rate(*base_lr * ratio);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::KD_LOSS;
    use crate::test_support::{student_adaptor, teacher_adaptor, toy_batches, toy_loader, LinearNet, ToyBatch};
    use candle_nn::SGD;
    use distilkit_core::{ConstantLr, Feature, LayerSel, MatchLoss, ProjKind, ProjectionSpec};
    use tempfile::TempDir;

    fn distiller(dir: &TempDir, matches: Vec<IntermediateMatch>) -> GeneralDistiller<ToyBatch, LinearNet, LinearNet> {
        let t = TrainingConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let d = DistillationConfig { intermediate_matches: matches, ..Default::default() };
        GeneralDistiller::new(t, d, LinearNet::teacher(), LinearNet::student(), teacher_adaptor(), student_adaptor())
            .unwrap()
    }

    fn hidden_mse(s: usize, t: usize) -> IntermediateMatch {
        IntermediateMatch::new(LayerSel::One(t), LayerSel::One(s), Feature::Hidden, MatchLoss::HiddenMse)
    }

    #[test]
    fn reports_every_match_by_name() {
        let dir = TempDir::new().unwrap();
        let mmd = IntermediateMatch::new(
            LayerSel::Many(vec![0, 1]),
            LayerSel::Many(vec![0, 1]),
            Feature::Hidden,
            MatchLoss::Mmd,
        );
        let d = distiller(&dir, vec![hidden_mse(1, 1).with_weight(3.0), mmd]);
        let out = d.train_on_batch(&toy_batches()[0], None, 0.0).unwrap();
        assert!(out.breakdown.contains_key(KD_LOSS));
        assert!(out.breakdown.contains_key("unweighted_hidden_hidden_mse_1_1"));
        assert!(out.breakdown.contains_key("unweighted_hidden_mmd_0-1_0-1"));
    }

    #[test]
    fn identical_inputs_match_exactly() {
        let dir = TempDir::new().unwrap();
        let d = distiller(&dir, vec![hidden_mse(0, 0)]);
        let out = d.train_on_batch(&toy_batches()[0], None, 0.0).unwrap();
        assert_eq!(out.breakdown["unweighted_hidden_hidden_mse_0_0"], 0.0);
    }

    #[test]
    fn missing_layer_is_reported() {
        let dir = TempDir::new().unwrap();
        let d = distiller(&dir, vec![hidden_mse(1, 7)]);
        let err = d.train_on_batch(&toy_batches()[0], None, 0.0).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"), "{err:#}");
    }

    #[test]
    fn shared_projection_joins_the_main_optimizer() {
        let dir = TempDir::new().unwrap();
        let m = hidden_mse(1, 1).with_proj(ProjectionSpec::new(ProjKind::Linear, 2, 2));
        let d = distiller(&dir, vec![m]);
        assert_eq!(Objective::trainable_vars(&d).len(), 4);
        assert!(d.auxiliary_vars().is_empty());
        assert!(d.projection_varmap(0).is_some());
    }

    #[test]
    fn projection_with_own_lr_is_stepped_separately() {
        let dir = TempDir::new().unwrap();
        let m = hidden_mse(1, 1).with_proj(ProjectionSpec::new(ProjKind::Tanh, 2, 2).with_learning_rate(0.05));
        let mut d = distiller(&dir, vec![m]);
        assert_eq!(d.trainable_vars().len(), 2);
        assert_eq!(d.auxiliary_vars().len(), 2);

        let before = d.auxiliary_vars()[0].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mut opt = SGD::new(d.trainable_vars(), 0.1).unwrap();
        d.train(&mut opt, &mut toy_loader(), TrainOptions::steps(3)).unwrap();
        let after = d.auxiliary_vars()[0].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn own_lr_projection_follows_the_lr_schedule() {
        let dir = TempDir::new().unwrap();
        let m = hidden_mse(1, 1).with_proj(ProjectionSpec::new(ProjKind::Linear, 2, 2).with_learning_rate(0.05));
        let mut d = distiller(&dir, vec![m]);

        let weights = |d: &GeneralDistiller<ToyBatch, LinearNet, LinearNet>| {
            d.auxiliary_vars()[0].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        let before = weights(&d);
        let mut opt = SGD::new(d.trainable_vars(), 0.1).unwrap();
        d.train(&mut opt, &mut toy_loader(), TrainOptions::steps(3).with_lr_schedule(ConstantLr(0.0))).unwrap();
        assert_eq!(weights(&d), before);

        // Half the main rate halves the projection's own rate.
        let mut opt = SGD::new(d.trainable_vars(), 0.1).unwrap();
        d.train(&mut opt, &mut toy_loader(), TrainOptions::steps(1).with_lr_schedule(ConstantLr(0.05))).unwrap();
        let (aux, _) = d.projections[0].as_ref().unwrap().optimizer.as_ref().unwrap();
        assert!((aux.learning_rate() - 0.025).abs() < 1e-12, "{}", aux.learning_rate());
    }

    #[test]
    fn training_reduces_intermediate_loss() {
        let dir = TempDir::new().unwrap();
        let mut d = distiller(&dir, vec![hidden_mse(1, 1)]);
        let key = "unweighted_hidden_hidden_mse_1_1";
        let batch = toy_batches().remove(0);
        let before = d.train_on_batch(&batch, None, 0.0).unwrap().breakdown[key];
        let mut opt = SGD::new(d.trainable_vars(), 0.2).unwrap();
        d.train(&mut opt, &mut toy_loader(), TrainOptions::epochs(40).with_max_grad_norm(5.0)).unwrap();
        let after = d.train_on_batch(&batch, None, 1.0).unwrap().breakdown[key];
        assert!(after < before, "{after} !< {before}");
    }
}
