//! Per-batch loss composition shared by the trainer and the distillers.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use distilkit_core::logits::{mask_indices, probability_shift, select_logits_with_mask};
use distilkit_core::losses::scalar;
use distilkit_core::{Adaptor, AdaptorOutput, CoreError, Model, Trainable};

use crate::config::DistillationConfig;

pub const KD_LOSS: &str = "unweighted_kd_loss";
pub const HARD_LABEL_LOSS: &str = "unweighted_hard_label_loss";

/// Total loss of one micro-batch plus its named, unweighted parts.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total: Tensor,
    pub breakdown: BTreeMap<String, f32>,
}

/// What the orchestration loop needs from a trainer or distiller.
pub trait Objective<B> {
    type Student: Trainable;

    fn student(&self) -> &Self::Student;

    /// Toggle the student between training and evaluation behaviour.
    fn set_student_training(&mut self, training: bool);

    /// Parameters updated by the main optimizer.
    fn trainable_vars(&self) -> Vec<Var> {
        self.student().trainable_vars()
    }

    /// Parameters outside the student that the loss also trains, such as
    /// feature projections. They share gradient accumulation and clipping.
    fn auxiliary_vars(&self) -> Vec<Var> {
        Vec::new()
    }

    /// Detached teacher-side adaptor output, when the objective has a teacher.
    fn teacher_output(&self, _batch: &B) -> Result<Option<AdaptorOutput>> {
        Ok(None)
    }

    /// Loss for one micro-batch. `cached` holds the teacher output computed
    /// up front when logits caching is on.
    fn loss(&mut self, batch: &B, cached: Option<&AdaptorOutput>, progress: f64) -> Result<LossOutput>;

    /// Runs after every main optimizer step with the same gradients.
    fn after_step(&mut self, _grads: &GradStore) -> Result<()> {
        Ok(())
    }

    /// The LR schedule moved the main learning rate to `ratio` times its
    /// initial value. Optimizers owned by the objective follow suit.
    fn scale_learning_rate(&mut self, _ratio: f64) {}
}

// ── Loss accumulation ─────────────────────────────────────────────────────────

/// Running weighted sum of loss terms.
#[derive(Debug, Default)]
pub(crate) struct LossTerms {
    total: Option<Tensor>,
    breakdown: BTreeMap<String, f32>,
}

impl LossTerms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `unweighted` under `name` and add `weight * unweighted` to the total.
    pub fn add(&mut self, name: impl Into<String>, unweighted: Tensor, weight: f64) -> Result<()> {
        self.breakdown.insert(name.into(), scalar(&unweighted)?);
        let weighted = unweighted.affine(weight, 0.0)?;
        self.total = Some(match self.total.take() {
            Some(total) => (total + weighted)?,
            None => weighted,
        });
        Ok(())
    }

    pub fn finish(self) -> Result<LossOutput> {
        let total = self.total.context(
            "No loss terms: adaptor outputs carry neither paired logits, losses nor intermediate matches",
        )?;
        Ok(LossOutput { total, breakdown: self.breakdown })
    }
}

// ── Forward passes ────────────────────────────────────────────────────────────

/// Teacher forward pass through its adaptor, detached from the graph.
pub(crate) fn run_teacher<B, T: Model<B>>(teacher: &T, adaptor: &Adaptor<B, T::Output>, batch: &B) -> Result<AdaptorOutput> {
    let out = teacher.forward(batch).context("Teacher forward pass failed")?;
    Ok(adaptor(batch, &out)?.validate("teacher")?.detach())
}

pub(crate) fn run_student<B, S: Model<B>>(student: &S, adaptor: &Adaptor<B, S::Output>, batch: &B) -> Result<AdaptorOutput> {
    let out = student.forward(batch).context("Student forward pass failed")?;
    Ok(adaptor(batch, &out)?.validate("student")?)
}

// ── Shared terms ──────────────────────────────────────────────────────────────

/// Σ over logits heads of the KD loss between student and teacher.
///
/// `None` when neither side has logits. Heads whose mask selects no rows are
/// skipped.
pub(crate) fn kd_loss(cfg: &DistillationConfig, s: &AdaptorOutput, t: &AdaptorOutput) -> Result<Option<Tensor>> {
    let (logits_s, logits_t) = match (&s.logits, &t.logits) {
        (None, None) => return Ok(None),
        (Some(ls), Some(lt)) => (ls, lt),
        (Some(_), None) => return Err(CoreError::MissingKey { role: "teacher", key: "logits".into() }.into()),
        (None, Some(_)) => return Err(CoreError::MissingKey { role: "student", key: "logits".into() }.into()),
    };
    anyhow::ensure!(
        logits_s.len() == logits_t.len(),
        "Student has {} logits heads but teacher has {}",
        logits_s.len(),
        logits_t.len()
    );

    let mut total: Option<Tensor> = None;
    for (i, (l_s, l_t)) in logits_s.iter().zip(logits_t).enumerate() {
        let mut l_s = l_s.clone();
        let mut l_t = l_t.clone();
        let mut labels = match &s.labels {
            Some(labels) => Some(labels.get(i).cloned().with_context(|| format!("No labels for logits head {i}"))?),
            None => None,
        };

        if let Some(mask) = s.logits_mask.as_ref().and_then(|m| m.get(i)) {
            l_s = select_logits_with_mask(&l_s, mask)?;
            labels = labels.map(|l| select_rows(&l, mask)).transpose()?;
        }
        if let Some(mask) = t.logits_mask.as_ref().and_then(|m| m.get(i)) {
            l_t = select_logits_with_mask(&l_t, mask)?;
        }
        if l_s.elem_count() == 0 && l_t.elem_count() == 0 {
            continue;
        }
        if cfg.probability_shift {
            let labels = labels
                .as_ref()
                .ok_or_else(|| CoreError::MissingKey { role: "student", key: "labels".into() })?;
            l_t = probability_shift(&l_t, labels)?;
        }

        let temperature = cfg.temperature_scheduler.temperature(&l_s, &l_t, cfg.temperature)?;
        let loss = cfg.kd_loss_type.compute(&l_s, &l_t, &temperature)?;
        total = Some(match total {
            Some(acc) => (acc + loss)?,
            None => loss,
        });
    }
    Ok(total)
}

/// Σ of the means of every tensor in the student's `losses`.
pub(crate) fn hard_label_loss(s: &AdaptorOutput) -> Result<Option<Tensor>> {
    let Some(losses) = &s.losses else { return Ok(None) };
    let mut total: Option<Tensor> = None;
    for l in losses {
        let m = l.mean_all()?;
        total = Some(match total {
            Some(acc) => (acc + m)?,
            None => m,
        });
    }
    Ok(total)
}

/// KD and hard-label terms with their scheduled weights.
pub(crate) fn logit_terms(
    cfg: &DistillationConfig,
    s: &AdaptorOutput,
    t: &AdaptorOutput,
    progress: f64,
    terms: &mut LossTerms,
) -> Result<()> {
    let (kd_weight, hard_weight) = cfg.weights_at(progress);
    if let Some(kd) = kd_loss(cfg, s, t)? {
        terms.add(KD_LOSS, kd, kd_weight)?;
    }
    if let Some(hard) = hard_label_loss(s)? {
        terms.add(HARD_LABEL_LOSS, hard, hard_weight)?;
    }
    Ok(())
}

fn select_rows(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    Ok(values.flatten_all()?.index_select(&mask_indices(mask)?, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use distilkit_core::losses::{kd_mse_loss, Temperature};
    use distilkit_core::{KdLossType, TemperatureScheduler};

    fn t<const M: usize>(data: [[f32; 2]; M]) -> Tensor {
        Tensor::new(&data, &Device::Cpu).unwrap()
    }

    #[test]
    fn kd_requires_logits_on_both_sides() {
        let cfg = DistillationConfig::default();
        let s = AdaptorOutput::new().with_logits(vec![t([[1.0, 0.0]])]);
        let err = kd_loss(&cfg, &s, &AdaptorOutput::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::MissingKey { role: "teacher", .. })));
        assert!(kd_loss(&cfg, &AdaptorOutput::new(), &AdaptorOutput::new()).unwrap().is_none());
    }

    #[test]
    fn kd_sums_over_heads() {
        let cfg = DistillationConfig { temperature: 1.0, kd_loss_type: KdLossType::Mse, ..Default::default() };
        let s = AdaptorOutput::new().with_logits(vec![t([[1.0, 0.0]]), t([[0.0, 0.0]])]);
        let tt = AdaptorOutput::new().with_logits(vec![t([[0.0, 0.0]]), t([[0.0, 2.0]])]);
        let loss = scalar(&kd_loss(&cfg, &s, &tt).unwrap().unwrap()).unwrap();
        // head 0: (1 + 0) / 2, head 1: (0 + 4) / 2
        assert!((loss - 2.5).abs() < 1e-6);
    }

    #[test]
    fn temperature_scheduler_sets_per_row_temperature() {
        let s = AdaptorOutput::new().with_logits(vec![t([[10.0, 0.0], [0.0, 1.0]])]);
        let tt = AdaptorOutput::new().with_logits(vec![t([[1.0, 0.0], [1.0, 0.0]])]);
        let (l_s, l_t) = (t([[10.0, 0.0], [0.0, 1.0]]), t([[1.0, 0.0], [1.0, 0.0]]));
        for scheduler in [TemperatureScheduler::Flsw { beta: 1.0, gamma: 1.0 }, TemperatureScheduler::Cwsm { beta: 1.0 }] {
            let cfg = DistillationConfig {
                temperature: 4.0,
                temperature_scheduler: scheduler,
                kd_loss_type: KdLossType::Mse,
                ..Default::default()
            };
            let tau = scheduler.temperature(&l_s, &l_t, 4.0).unwrap();
            assert!(matches!(tau, Temperature::PerRow(_)));
            let expected = scalar(&kd_mse_loss(&l_s, &l_t, &tau).unwrap()).unwrap();
            let fixed = scalar(&kd_mse_loss(&l_s, &l_t, &Temperature::Scalar(4.0)).unwrap()).unwrap();

            let loss = scalar(&kd_loss(&cfg, &s, &tt).unwrap().unwrap()).unwrap();
            assert!((loss - expected).abs() < 1e-6, "{scheduler:?}: {loss} vs {expected}");
            assert!((loss - fixed).abs() > 1e-4, "{scheduler:?} left the temperature unchanged");
        }
    }

    #[test]
    fn masked_rows_are_dropped() {
        let cfg = DistillationConfig { temperature: 1.0, kd_loss_type: KdLossType::Mse, ..Default::default() };
        let mask = Tensor::new(&[1f32, 0.0], &Device::Cpu).unwrap();
        let s = AdaptorOutput::new()
            .with_logits(vec![t([[1.0, 1.0], [9.0, 9.0]])])
            .with_logits_mask(vec![mask.clone()]);
        let tt = AdaptorOutput::new()
            .with_logits(vec![t([[1.0, 1.0], [0.0, 0.0]])])
            .with_logits_mask(vec![mask]);
        let loss = scalar(&kd_loss(&cfg, &s, &tt).unwrap().unwrap()).unwrap();
        assert!(loss.abs() < 1e-6);
    }

    #[test]
    fn fully_masked_head_is_skipped() {
        let cfg = DistillationConfig::default();
        let mask = Tensor::new(&[0f32], &Device::Cpu).unwrap();
        let s = AdaptorOutput::new().with_logits(vec![t([[1.0, 1.0]])]).with_logits_mask(vec![mask.clone()]);
        let tt = AdaptorOutput::new().with_logits(vec![t([[1.0, 1.0]])]).with_logits_mask(vec![mask]);
        assert!(kd_loss(&cfg, &s, &tt).unwrap().is_none());
    }

    #[test]
    fn probability_shift_needs_labels() {
        let cfg = DistillationConfig { probability_shift: true, ..Default::default() };
        let s = AdaptorOutput::new().with_logits(vec![t([[1.0, 0.0]])]);
        let tt = AdaptorOutput::new().with_logits(vec![t([[1.0, 0.0]])]);
        assert!(kd_loss(&cfg, &s, &tt).is_err());

        let labels = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        let s = s.with_labels(vec![labels]);
        assert!(kd_loss(&cfg, &s, &tt).unwrap().is_some());
    }

    #[test]
    fn terms_are_weighted_but_reported_unweighted() {
        let cfg = DistillationConfig {
            temperature: 1.0,
            kd_loss_type: KdLossType::Mse,
            kd_loss_weight: 2.0,
            hard_label_weight: 0.5,
            ..Default::default()
        };
        let s = AdaptorOutput::new()
            .with_logits(vec![t([[2.0, 0.0]])])
            .with_losses(vec![Tensor::new(&[1f32, 3.0], &Device::Cpu).unwrap()]);
        let tt = AdaptorOutput::new().with_logits(vec![t([[0.0, 0.0]])]);
        let mut terms = LossTerms::new();
        logit_terms(&cfg, &s, &tt, 0.0, &mut terms).unwrap();
        let out = terms.finish().unwrap();
        assert_eq!(out.breakdown[KD_LOSS], 2.0);
        assert_eq!(out.breakdown[HARD_LABEL_LOSS], 2.0);
        assert!((scalar(&out.total).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn no_terms_is_an_error() {
        assert!(LossTerms::new().finish().is_err());
    }
}
