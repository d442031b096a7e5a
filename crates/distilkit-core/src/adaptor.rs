//! The adaptor contract.
//!
//! Models return whatever their architecture produces. An adaptor is a small
//! user function that picks the pieces the distillers understand and places
//! them in an [`AdaptorOutput`]:
//!
//! | Field | Shape | Used by |
//! |-------|-------|---------|
//! | `logits` | `(batch, labels)` or `(batch, len, labels)` per head | KD loss |
//! | `logits_mask` | `(batch,)` or `(batch, len)` per head | KD loss row selection |
//! | `labels` | `(batch,)` or `(batch, len)` per head | probability shift |
//! | `losses` | any, reduced with `mean` | hard-label loss |
//! | `attention` | `(batch, heads, len, len)` per layer | intermediate matches |
//! | `hidden` | `(batch, len, hidden)` per layer | intermediate matches |
//! | `inputs_mask` | `(batch, len)` | masked intermediate losses |

use candle_core::Tensor;

use crate::error::{CoreError, CoreResult};
use crate::matches::Feature;

/// A user-supplied function mapping `(batch, model_output)` to an
/// [`AdaptorOutput`].
pub type Adaptor<B, O> = Box<dyn Fn(&B, &O) -> CoreResult<AdaptorOutput>>;

/// Wrap a closure as an [`Adaptor`].
pub fn adaptor<B, O, F>(f: F) -> Adaptor<B, O>
where
    F: Fn(&B, &O) -> CoreResult<AdaptorOutput> + 'static,
{
    Box::new(f)
}

/// Canonical loss inputs produced by an adaptor. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct AdaptorOutput {
    pub logits: Option<Vec<Tensor>>,
    pub logits_mask: Option<Vec<Tensor>>,
    pub labels: Option<Vec<Tensor>>,
    pub losses: Option<Vec<Tensor>>,
    pub attention: Option<Vec<Tensor>>,
    pub hidden: Option<Vec<Tensor>>,
    pub inputs_mask: Option<Tensor>,
}

impl AdaptorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logits(mut self, logits: impl Into<Vec<Tensor>>) -> Self {
        self.logits = Some(logits.into());
        self
    }

    pub fn with_logits_mask(mut self, mask: impl Into<Vec<Tensor>>) -> Self {
        self.logits_mask = Some(mask.into());
        self
    }

    pub fn with_labels(mut self, labels: impl Into<Vec<Tensor>>) -> Self {
        self.labels = Some(labels.into());
        self
    }

    pub fn with_losses(mut self, losses: impl Into<Vec<Tensor>>) -> Self {
        self.losses = Some(losses.into());
        self
    }

    pub fn with_attention(mut self, attention: impl Into<Vec<Tensor>>) -> Self {
        self.attention = Some(attention.into());
        self
    }

    pub fn with_hidden(mut self, hidden: impl Into<Vec<Tensor>>) -> Self {
        self.hidden = Some(hidden.into());
        self
    }

    pub fn with_inputs_mask(mut self, mask: Tensor) -> Self {
        self.inputs_mask = Some(mask);
        self
    }

    /// `true` when none of the recognised keys is present.
    pub fn is_empty(&self) -> bool {
        self.logits.is_none()
            && self.logits_mask.is_none()
            && self.labels.is_none()
            && self.losses.is_none()
            && self.attention.is_none()
            && self.hidden.is_none()
            && self.inputs_mask.is_none()
    }

    /// Names of the keys that are present, in declaration order.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.logits.is_some() {
            keys.push("logits");
        }
        if self.logits_mask.is_some() {
            keys.push("logits_mask");
        }
        if self.labels.is_some() {
            keys.push("labels");
        }
        if self.losses.is_some() {
            keys.push("losses");
        }
        if self.attention.is_some() {
            keys.push("attention");
        }
        if self.hidden.is_some() {
            keys.push("hidden");
        }
        if self.inputs_mask.is_some() {
            keys.push("inputs_mask");
        }
        keys
    }

    /// Reject outputs with no recognised key.
    pub fn validate(self, role: &'static str) -> CoreResult<Self> {
        if self.is_empty() {
            return Err(CoreError::EmptyAdaptorOutput { role });
        }
        Ok(self)
    }

    /// Cut every tensor out of the autograd graph. Applied to teacher outputs.
    pub fn detach(&self) -> Self {
        let detach_all = |v: &Option<Vec<Tensor>>| {
            v.as_ref().map(|ts| ts.iter().map(Tensor::detach).collect())
        };
        Self {
            logits: detach_all(&self.logits),
            logits_mask: detach_all(&self.logits_mask),
            labels: detach_all(&self.labels),
            losses: detach_all(&self.losses),
            attention: detach_all(&self.attention),
            hidden: detach_all(&self.hidden),
            inputs_mask: self.inputs_mask.as_ref().map(Tensor::detach),
        }
    }

    /// Per-layer tensors for an intermediate feature, or an empty slice.
    pub fn feature(&self, feature: Feature) -> &[Tensor] {
        let v = match feature {
            Feature::Attention => &self.attention,
            Feature::Hidden => &self.hidden,
        };
        v.as_deref().unwrap_or(&[])
    }

    /// Look up one layer of a feature, with a descriptive error when absent.
    pub fn layer(&self, role: &'static str, feature: Feature, index: usize) -> CoreResult<&Tensor> {
        let layers = self.feature(feature);
        if layers.is_empty() {
            return Err(CoreError::MissingKey { role, key: feature.as_str().to_string() });
        }
        layers.get(index).ok_or_else(|| CoreError::LayerOutOfRange {
            role,
            feature: feature.as_str().to_string(),
            index,
            available: layers.len(),
        })
    }
}
