//! Intermediate-feature matching configuration.
//!
//! An [`IntermediateMatch`] pairs a teacher layer (or layers) with a student
//! layer and names the feature, the loss and its weight. The JSON form is
//!
//! ```json
//! {"layer_T": 8, "layer_S": 2, "feature": "hidden", "loss": "hidden_mse",
//!  "weight": 1, "proj": ["linear", 384, 768]}
//! ```

use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::losses;

/// Which intermediate output a match reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Attention,
    Hidden,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attention => "attention",
            Self::Hidden => "hidden",
        }
    }
}

/// Loss used by an intermediate match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLoss {
    AttentionMse,
    AttentionMseSum,
    AttentionCe,
    AttentionCeMean,
    HiddenMse,
    Cos,
    Pkd,
    Fsp,
    Mmd,
}

impl MatchLoss {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttentionMse => "attention_mse",
            Self::AttentionMseSum => "attention_mse_sum",
            Self::AttentionCe => "attention_ce",
            Self::AttentionCeMean => "attention_ce_mean",
            Self::HiddenMse => "hidden_mse",
            Self::Cos => "cos",
            Self::Pkd => "pkd",
            Self::Fsp => "fsp",
            Self::Mmd => "mmd",
        }
    }

    /// `fsp` and `mmd` compare a pair of layers per side.
    pub fn is_pairwise(&self) -> bool {
        matches!(self, Self::Fsp | Self::Mmd)
    }

    /// Evaluate the loss on already-projected features.
    pub fn compute(&self, s: &[Tensor], t: &[Tensor], mask: Option<&Tensor>) -> CoreResult<Tensor> {
        let op = self.as_str();
        match self {
            Self::Fsp => losses::fsp_loss(s, t, mask),
            Self::Mmd => losses::mmd_loss(s, t, mask),
            Self::AttentionMse => single(op, s, t).and_then(|(s, t)| losses::att_mse_loss(s, t, mask)),
            Self::AttentionMseSum => {
                single(op, s, t).and_then(|(s, t)| losses::att_mse_sum_loss(s, t, mask))
            }
            Self::AttentionCe => single(op, s, t).and_then(|(s, t)| losses::att_ce_loss(s, t, mask)),
            Self::AttentionCeMean => {
                single(op, s, t).and_then(|(s, t)| losses::att_ce_mean_loss(s, t, mask))
            }
            Self::HiddenMse => single(op, s, t).and_then(|(s, t)| losses::hid_mse_loss(s, t, mask)),
            Self::Cos => single(op, s, t).and_then(|(s, t)| losses::cos_loss(s, t, mask)),
            Self::Pkd => single(op, s, t).and_then(|(s, t)| losses::pkd_loss(s, t)),
        }
    }
}

fn single<'a>(op: &'static str, s: &'a [Tensor], t: &'a [Tensor]) -> CoreResult<(&'a Tensor, &'a Tensor)> {
    match (s, t) {
        ([s], [t]) => Ok((s, t)),
        ([_], _) => Err(CoreError::Arity { op, expected: 1, got: t.len() }),
        _ => Err(CoreError::Arity { op, expected: 1, got: s.len() }),
    }
}

/// One layer index or a list of indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerSel {
    One(usize),
    Many(Vec<usize>),
}

impl LayerSel {
    pub fn indices(&self) -> Vec<usize> {
        match self {
            Self::One(i) => vec![*i],
            Self::Many(v) => v.clone(),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::Many(_))
    }
}

impl fmt::Display for LayerSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.indices().iter().map(usize::to_string).collect();
        f.write_str(&parts.join("-"))
    }
}

/// Activation applied after a projection's linear map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjKind {
    Linear,
    Relu,
    Tanh,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjOptions {
    /// Train this projection with its own optimiser at this learning rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

/// Projection from the student's feature size to the teacher's.
///
/// Serialised as `[kind, dim_in, dim_out]` or
/// `[kind, dim_in, dim_out, {"learning_rate": ...}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawProj", into = "RawProj")]
pub struct ProjectionSpec {
    pub kind: ProjKind,
    pub dim_in: usize,
    pub dim_out: usize,
    pub options: ProjOptions,
}

impl ProjectionSpec {
    pub fn new(kind: ProjKind, dim_in: usize, dim_out: usize) -> Self {
        Self { kind, dim_in, dim_out, options: ProjOptions::default() }
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.options.learning_rate = Some(lr);
        self
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawProj {
    WithOptions(ProjKind, usize, usize, ProjOptions),
    Plain(ProjKind, usize, usize),
}

impl From<RawProj> for ProjectionSpec {
    fn from(raw: RawProj) -> Self {
        match raw {
            RawProj::Plain(kind, dim_in, dim_out) => Self::new(kind, dim_in, dim_out),
            RawProj::WithOptions(kind, dim_in, dim_out, options) => {
                Self { kind, dim_in, dim_out, options }
            }
        }
    }
}

impl From<ProjectionSpec> for RawProj {
    fn from(p: ProjectionSpec) -> Self {
        if p.options == ProjOptions::default() {
            RawProj::Plain(p.kind, p.dim_in, p.dim_out)
        } else {
            RawProj::WithOptions(p.kind, p.dim_in, p.dim_out, p.options)
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A teacher/student feature pairing with its loss and weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateMatch {
    #[serde(rename = "layer_T")]
    pub layer_t: LayerSel,
    #[serde(rename = "layer_S")]
    pub layer_s: LayerSel,
    pub feature: Feature,
    pub loss: MatchLoss,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proj: Option<ProjectionSpec>,
}

impl IntermediateMatch {
    pub fn new(layer_t: LayerSel, layer_s: LayerSel, feature: Feature, loss: MatchLoss) -> Self {
        Self { layer_t, layer_s, feature, loss, weight: 1.0, proj: None }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_proj(mut self, proj: ProjectionSpec) -> Self {
        self.proj = Some(proj);
        self
    }

    /// Key under which this match's unweighted loss is reported.
    pub fn loss_name(&self) -> String {
        format!(
            "unweighted_{}_{}_{}_{}",
            self.feature.as_str(),
            self.loss.as_str(),
            self.layer_s,
            self.layer_t
        )
    }

    pub fn validate(&self) -> CoreResult<()> {
        let field = "intermediate_matches";
        if self.layer_s.is_list() != self.layer_t.is_list() {
            return Err(CoreError::config(field, "layer_S and layer_T must both be indices or both be lists"));
        }
        if self.loss.is_pairwise() {
            let (s, t) = (self.layer_s.indices(), self.layer_t.indices());
            if !self.layer_s.is_list() || s.len() != 2 || t.len() != 2 {
                return Err(CoreError::config(
                    field,
                    format!("'{}' needs two layers per side, e.g. \"layer_S\": [0, 0]", self.loss.as_str()),
                ));
            }
        } else if self.layer_s.is_list() {
            return Err(CoreError::config(
                field,
                format!("'{}' takes a single layer index per side", self.loss.as_str()),
            ));
        }
        let expected = match self.loss {
            MatchLoss::AttentionMse
            | MatchLoss::AttentionMseSum
            | MatchLoss::AttentionCe
            | MatchLoss::AttentionCeMean => Feature::Attention,
            _ => Feature::Hidden,
        };
        if self.feature != expected {
            return Err(CoreError::config(
                field,
                format!("loss '{}' applies to '{}' features", self.loss.as_str(), expected.as_str()),
            ));
        }
        if let Some(p) = &self.proj {
            if p.dim_in == 0 || p.dim_out == 0 {
                return Err(CoreError::config(field, "projection dimensions must be positive"));
            }
        }
        Ok(())
    }
}
