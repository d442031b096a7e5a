//! Temperature, loss-weight and learning-rate schedules.

use candle_core::{Tensor, D};
use candle_nn::ops::softmax;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::losses::Temperature;

// ── Temperature ───────────────────────────────────────────────────────────────

/// Dynamic per-row KD temperature.
///
/// JSON: `{"name": "none"}`, `{"name": "flsw", "beta": 1.0, "gamma": 2.0}`,
/// `{"name": "cwsm", "beta": 1.0}`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum TemperatureScheduler {
    #[default]
    None,
    /// Raises the temperature for rows where student and teacher logits
    /// already point the same way.
    Flsw { beta: f64, gamma: f64 },
    /// Raises the temperature for rows where the student is confident.
    Cwsm { beta: f64 },
}

impl TemperatureScheduler {
    /// Temperature for a pair of (already selected) logits tensors.
    pub fn temperature(&self, logits_s: &Tensor, logits_t: &Tensor, base: f64) -> CoreResult<Temperature> {
        match *self {
            Self::None => Ok(Temperature::Scalar(base)),
            Self::Flsw { beta, gamma } => {
                const EPS: f64 = 1e-4;
                let v = unit_rows(&logits_s.detach(), EPS)?;
                let t = unit_rows(&logits_t.detach(), EPS)?;
                let w = (v * t)?.sum(D::Minus1)?.affine(-1.0, 1.0)?.powf(gamma)?;
                Ok(Temperature::PerRow(spread(&w, base, beta)?))
            }
            Self::Cwsm { beta } => {
                let p = softmax(&logits_s.detach(), D::Minus1)?;
                let w = p.max(D::Minus1)?.affine(1.0, 1e-3)?.recip()?;
                Ok(Temperature::PerRow(spread(&w, base, beta)?))
            }
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        let ok = match *self {
            Self::None => true,
            Self::Flsw { beta, gamma } => beta.is_finite() && gamma.is_finite() && gamma > 0.0,
            Self::Cwsm { beta } => beta.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::config("temperature_scheduler", format!("invalid parameters: {self:?}")))
        }
    }
}

fn unit_rows(x: &Tensor, eps: f64) -> CoreResult<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.affine(1.0, eps)?;
    Ok(x.broadcast_div(&norm)?)
}

/// `tau = base + (mean(w) - w) * beta`.
fn spread(w: &Tensor, base: f64, beta: f64) -> CoreResult<Tensor> {
    let mean = w.mean_all()?;
    Ok(w.broadcast_sub(&mean)?.affine(-beta, base)?)
}

// ── Loss weights ──────────────────────────────────────────────────────────────

/// Schedule for `kd_loss_weight` / `hard_label_weight` over training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightScheduler {
    #[default]
    None,
    LinearDecay,
    LinearGrowth,
}

impl WeightScheduler {
    /// Weight at `progress = global_step / total_steps` in `[0, 1]`.
    pub fn weight(&self, base: f64, progress: f64) -> f64 {
        let p = progress.clamp(0.0, 1.0);
        match self {
            Self::None => base,
            Self::LinearDecay => base * (1.0 - p),
            Self::LinearGrowth => base * p,
        }
    }
}

// ── Learning rate ─────────────────────────────────────────────────────────────

/// Learning rate as a function of the number of optimizer steps taken.
pub trait LrSchedule {
    fn lr(&self, step: usize) -> f64;
}

/// A fixed learning rate.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLr(pub f64);

impl LrSchedule for ConstantLr {
    fn lr(&self, _step: usize) -> f64 {
        self.0
    }
}

/// Linear warm-up from 0 to `base_lr`, then linear decay to 0 at
/// `total_steps`.
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmupDecay {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LinearWarmupDecay {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, warmup_steps, total_steps }
    }

    /// Warm up over `fraction` of the run.
    pub fn with_warmup_fraction(base_lr: f64, fraction: f64, total_steps: usize) -> Self {
        let warmup = (total_steps as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
        Self::new(base_lr, warmup, total_steps)
    }
}

impl LrSchedule for LinearWarmupDecay {
    fn lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).max(0.0)
    }
}
