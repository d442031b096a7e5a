//! Distillation loss functions.
//!
//! Logit losses take student logits `S`, teacher logits `T` and a
//! [`Temperature`]. Intermediate losses take student/teacher feature tensors
//! and an optional `(batch, len)` input mask where `1` marks real tokens.
//!
//! All functions return a scalar tensor that stays attached to the student's
//! autograd graph. Teacher tensors are expected to be detached already.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::logits::mask_indices;

/// Threshold under which attention scores are treated as masked out.
const ATTENTION_MASK_THRESHOLD: f64 = -1e-3;

/// Softening temperature for logit losses.
#[derive(Debug, Clone)]
pub enum Temperature {
    /// One temperature for every row.
    Scalar(f64),
    /// One temperature per logits row; shape is the logits shape without the
    /// last (label) dimension.
    PerRow(Tensor),
}

impl Temperature {
    /// Divide `logits` by the temperature along the label dimension.
    pub fn scale(&self, logits: &Tensor) -> CoreResult<Tensor> {
        match self {
            Self::Scalar(t) => Ok(logits.affine(1.0 / t, 0.0)?),
            Self::PerRow(tau) => {
                let tau = tau.to_dtype(logits.dtype())?;
                let tau = tau.unsqueeze(tau.rank())?;
                Ok(logits.broadcast_div(&tau)?)
            }
        }
    }
}

impl From<f64> for Temperature {
    fn from(t: f64) -> Self {
        Self::Scalar(t)
    }
}

// ── Logit losses ──────────────────────────────────────────────────────────────

/// Which soft-target loss compares student and teacher logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdLossType {
    #[default]
    Ce,
    Mse,
}

impl KdLossType {
    pub fn compute(&self, logits_s: &Tensor, logits_t: &Tensor, temperature: &Temperature) -> CoreResult<Tensor> {
        match self {
            Self::Ce => kd_ce_loss(logits_s, logits_t, temperature),
            Self::Mse => kd_mse_loss(logits_s, logits_t, temperature),
        }
    }
}

/// Soft cross-entropy between temperature-scaled teacher and student
/// distributions, averaged over rows.
pub fn kd_ce_loss(logits_s: &Tensor, logits_t: &Tensor, temperature: &Temperature) -> CoreResult<Tensor> {
    same_shape("kd_ce_loss", logits_s, logits_t)?;
    let s = temperature.scale(logits_s)?;
    let t = temperature.scale(logits_t)?;
    let p_t = softmax(&t, D::Minus1)?;
    let log_p_s = log_softmax(&s, D::Minus1)?;
    Ok((p_t * log_p_s)?.sum(D::Minus1)?.neg()?.mean_all()?)
}

/// Mean squared error between temperature-scaled logits.
pub fn kd_mse_loss(logits_s: &Tensor, logits_t: &Tensor, temperature: &Temperature) -> CoreResult<Tensor> {
    same_shape("kd_mse_loss", logits_s, logits_t)?;
    let s = temperature.scale(logits_s)?;
    let t = temperature.scale(logits_t)?;
    mse(&s, &t)
}

// ── Attention losses ──────────────────────────────────────────────────────────

/// MSE between attention score matrices `(batch, heads, len, len)`.
pub fn att_mse_loss(att_s: &Tensor, att_t: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    same_shape("att_mse_loss", att_s, att_t)?;
    match mask {
        None => mse(&zero_masked_scores(att_s)?, &zero_masked_scores(att_t)?),
        Some(mask) => {
            let (_b, heads, _l, _) = att_s.dims4()?;
            let mask = mask.to_dtype(att_s.dtype())?;
            let rows = mask.unsqueeze(1)?.unsqueeze(3)?;
            let cols = mask.unsqueeze(1)?.unsqueeze(2)?;
            let valid = mask.sum(1)?.sqr()?.sum_all()?.affine(heads as f64, 0.0)?;
            let se = (att_s - att_t)?.sqr()?;
            let total = se.broadcast_mul(&rows)?.broadcast_mul(&cols)?.sum_all()?;
            Ok((total / valid)?)
        }
    }
}

/// As [`att_mse_loss`] after summing attention over heads.
pub fn att_mse_sum_loss(att_s: &Tensor, att_t: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    same_shape("att_mse_sum_loss", att_s, att_t)?;
    let (att_s, att_t) = if att_s.rank() == 4 {
        (att_s.sum(1)?, att_t.sum(1)?)
    } else {
        (att_s.clone(), att_t.clone())
    };
    match mask {
        None => mse(&zero_masked_scores(&att_s)?, &zero_masked_scores(&att_t)?),
        Some(mask) => {
            let mask = mask.to_dtype(att_s.dtype())?;
            let rows = mask.unsqueeze(2)?;
            let cols = mask.unsqueeze(1)?;
            let valid = mask.sum(1)?.sqr()?.sum_all()?;
            let se = (att_s - att_t)?.sqr()?;
            let total = se.broadcast_mul(&rows)?.broadcast_mul(&cols)?.sum_all()?;
            Ok((total / valid)?)
        }
    }
}

/// Cross-entropy between teacher and student attention distributions.
pub fn att_ce_loss(att_s: &Tensor, att_t: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    same_shape("att_ce_loss", att_s, att_t)?;
    let p_t = softmax(att_t, D::Minus1)?;
    let log_p_s = log_softmax(att_s, D::Minus1)?;
    match mask {
        None => {
            let keep = att_t.gt(ATTENTION_MASK_THRESHOLD)?;
            let p_t = keep.where_cond(&p_t, &p_t.zeros_like()?)?;
            Ok((p_t * log_p_s)?.sum(D::Minus1)?.mean_all()?.neg()?)
        }
        Some(mask) => {
            let (_b, heads, _l, _) = att_s.dims4()?;
            let mask = mask.to_dtype(att_s.dtype())?;
            let row_mask = mask.unsqueeze(1)?;
            let col_mask = row_mask.unsqueeze(2)?;
            let per_row = (p_t * log_p_s)?.broadcast_mul(&col_mask)?.sum(D::Minus1)?;
            let total = per_row.broadcast_mul(&row_mask)?.sum_all()?;
            let count = mask.sum_all()?.affine(heads as f64, 0.0)?;
            Ok((total / count)?.neg()?)
        }
    }
}

/// As [`att_ce_loss`] after averaging attention over heads.
pub fn att_ce_mean_loss(att_s: &Tensor, att_t: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    same_shape("att_ce_mean_loss", att_s, att_t)?;
    let (att_s, att_t) = if att_s.rank() == 4 {
        (att_s.mean(1)?, att_t.mean(1)?)
    } else {
        (att_s.clone(), att_t.clone())
    };
    let p_t = softmax(&att_t, D::Minus1)?;
    let log_p_s = log_softmax(&att_s, D::Minus1)?;
    match mask {
        None => {
            let keep = att_t.gt(ATTENTION_MASK_THRESHOLD)?;
            let p_t = keep.where_cond(&p_t, &p_t.zeros_like()?)?;
            Ok((p_t * log_p_s)?.sum(D::Minus1)?.mean_all()?.neg()?)
        }
        Some(mask) => {
            let mask = mask.to_dtype(att_s.dtype())?;
            let per_row = (p_t * log_p_s)?.broadcast_mul(&mask.unsqueeze(1)?)?.sum(D::Minus1)?;
            let total = (per_row * &mask)?.sum_all()?;
            Ok((total / mask.sum_all()?)?.neg()?)
        }
    }
}

// ── Hidden-state losses ───────────────────────────────────────────────────────

/// MSE between hidden states `(batch, len, hidden)`.
pub fn hid_mse_loss(state_s: &Tensor, state_t: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    same_shape("hid_mse_loss", state_s, state_t)?;
    match mask {
        None => mse(state_s, state_t),
        Some(mask) => {
            let hidden = state_s.dim(D::Minus1)?;
            let mask = mask.to_dtype(state_s.dtype())?;
            let valid = mask.sum_all()?.affine(hidden as f64, 0.0)?;
            let se = (state_s - state_t)?.sqr()?;
            let total = se.broadcast_mul(&mask.unsqueeze(mask.rank())?)?.sum_all()?;
            Ok((total / valid)?)
        }
    }
}

/// Mean cosine distance `1 - cos(s, t)` over (masked) positions.
pub fn cos_loss(state_s: &Tensor, state_t: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    same_shape("cos_loss", state_s, state_t)?;
    let hidden = state_s.dim(D::Minus1)?;
    let rows = state_s.elem_count() / hidden.max(1);
    let mut s = state_s.reshape((rows, hidden))?;
    let mut t = state_t.reshape((rows, hidden))?;
    if let Some(mask) = mask {
        let idx = mask_indices(mask)?;
        s = s.index_select(&idx, 0)?;
        t = t.index_select(&idx, 0)?;
    }
    const EPS: f64 = 1e-12;
    let dot = (&s * &t)?.sum(1)?;
    let norm_s = s.sqr()?.sum(1)?.affine(1.0, EPS)?;
    let norm_t = t.sqr()?.sum(1)?.affine(1.0, EPS)?;
    let cos = (dot / (norm_s * norm_t)?.sqrt()?)?;
    Ok(cos.affine(-1.0, 1.0)?.mean_all()?)
}

/// Patient-KD loss on the normalised first-position (`[CLS]`) vectors.
pub fn pkd_loss(state_s: &Tensor, state_t: &Tensor) -> CoreResult<Tensor> {
    same_shape("pkd_loss", state_s, state_t)?;
    let cls_s = state_s.narrow(1, 0, 1)?.squeeze(1)?;
    let cls_t = state_t.narrow(1, 0, 1)?.squeeze(1)?;
    let normed_s = cls_s.broadcast_div(&cls_s.sqr()?.sum_keepdim(1)?.sqrt()?)?;
    let normed_t = cls_t.broadcast_div(&cls_t.sqr()?.sum_keepdim(1)?.sqrt()?)?;
    Ok((normed_s - normed_t)?.sqr()?.sum(D::Minus1)?.mean_all()?)
}

/// Flow-of-solution-procedure loss between two layers per side.
///
/// Gram matrices are `S0ᵀ·S1 / len` with shape `(batch, hidden, hidden)`.
pub fn fsp_loss(state_s: &[Tensor], state_t: &[Tensor], mask: Option<&Tensor>) -> CoreResult<Tensor> {
    let (s0, s1) = pair("fsp_loss", state_s)?;
    let (t0, t1) = pair("fsp_loss", state_t)?;
    let gram_s = fsp_gram(s0, s1, mask)?;
    let gram_t = fsp_gram(t0, t1, mask)?;
    same_shape("fsp_loss", &gram_s, &gram_t)?;
    mse(&gram_s, &gram_t)
}

fn fsp_gram(a: &Tensor, b: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
    match mask {
        None => {
            let len = b.dim(1)?;
            let gram = a.transpose(1, 2)?.contiguous()?.matmul(&b.contiguous()?)?;
            Ok(gram.affine(1.0 / len as f64, 0.0)?)
        }
        Some(mask) => {
            let m = mask.to_dtype(a.dtype())?.unsqueeze(2)?;
            let lengths = m.sum_keepdim(1)?;
            let a = a.broadcast_mul(&m)?;
            let b = b.broadcast_mul(&m)?;
            let gram = a.transpose(1, 2)?.contiguous()?.matmul(&b)?;
            Ok(gram.broadcast_div(&lengths)?)
        }
    }
}

/// Similarity-matrix loss between two layers per side.
///
/// Similarity matrices are `S0·S1ᵀ / hidden` with shape `(batch, len, len)`,
/// so student and teacher may have different hidden sizes.
pub fn mmd_loss(state_s: &[Tensor], state_t: &[Tensor], mask: Option<&Tensor>) -> CoreResult<Tensor> {
    let (s0, s1) = pair("mmd_loss", state_s)?;
    let (t0, t1) = pair("mmd_loss", state_t)?;
    let gram_s = similarity(s0, s1)?;
    let gram_t = similarity(t0, t1)?;
    same_shape("mmd_loss", &gram_s, &gram_t)?;
    match mask {
        None => mse(&gram_s, &gram_t),
        Some(mask) => {
            let mask = mask.to_dtype(gram_s.dtype())?;
            let valid = mask.sum(1)?.sqr()?.sum_all()?;
            let se = (gram_s - gram_t)?.sqr()?;
            let total = se
                .broadcast_mul(&mask.unsqueeze(2)?)?
                .broadcast_mul(&mask.unsqueeze(1)?)?
                .sum_all()?;
            Ok((total / valid)?)
        }
    }
}

fn similarity(a: &Tensor, b: &Tensor) -> CoreResult<Tensor> {
    let hidden = b.dim(2)?;
    let gram = a.contiguous()?.matmul(&b.transpose(1, 2)?.contiguous()?)?;
    Ok(gram.affine(1.0 / hidden as f64, 0.0)?)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Plain mean squared error.
pub fn mse(a: &Tensor, b: &Tensor) -> CoreResult<Tensor> {
    Ok((a - b)?.sqr()?.mean_all()?)
}

/// Zero out attention entries that encode masked positions.
fn zero_masked_scores(att: &Tensor) -> CoreResult<Tensor> {
    let keep = att.gt(ATTENTION_MASK_THRESHOLD)?;
    Ok(keep.where_cond(att, &att.zeros_like()?)?)
}

fn same_shape(op: &'static str, s: &Tensor, t: &Tensor) -> CoreResult<()> {
    if s.dims() != t.dims() {
        return Err(CoreError::ShapeMismatch {
            op,
            student: s.dims().to_vec(),
            teacher: t.dims().to_vec(),
        });
    }
    Ok(())
}

fn pair<'a>(op: &'static str, tensors: &'a [Tensor]) -> CoreResult<(&'a Tensor, &'a Tensor)> {
    match tensors {
        [a, b] => Ok((a, b)),
        _ => Err(CoreError::Arity { op, expected: 2, got: tensors.len() }),
    }
}

/// Convert a scalar loss tensor to `f32` for logging.
pub fn scalar(loss: &Tensor) -> CoreResult<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}
