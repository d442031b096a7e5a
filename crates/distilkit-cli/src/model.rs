//! A small attention encoder used by the `train`, `distill` and `eval`
//! commands.
//!
//! ```text
//! features (b, len, dim_in)
//!   └─ input projection ─────────► hidden[0]
//!        └─ N × [self-attention → add & norm → FFN → add & norm] ─► hidden[1..=N]
//!             └─ masked mean pool → classifier ─► logits (b, num_labels)
//! ```
//!
//! Every layer reports its pre-softmax attention scores `(b, heads, len, len)`
//! with padded keys pushed to `-1e4`, so the model can act as either side of
//! an attention or hidden-state match.
//!
//! A saved model is a directory holding `model_config.json` and
//! `model.safetensors`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{layer_norm, linear, ops, Dropout, LayerNorm, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use distilkit_core::{adaptor, Adaptor, AdaptorOutput, CoreError, CoreResult, Model, Trainable};
use distilkit_distill::SequenceBatch;

pub const CONFIG_FILE: &str = "model_config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

const MASKED_SCORE: f64 = -1e4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub dim_in: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_labels: usize,
    #[serde(default)]
    pub dropout: f32,
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.dim_in > 0, "dim_in must be > 0");
        anyhow::ensure!(self.num_layers > 0, "num_layers must be > 0");
        anyhow::ensure!(self.num_labels > 1, "num_labels must be > 1, got {}", self.num_labels);
        anyhow::ensure!(
            self.num_heads > 0 && self.hidden_size % self.num_heads == 0,
            "hidden_size {} is not divisible by num_heads {}",
            self.hidden_size,
            self.num_heads
        );
        anyhow::ensure!((0.0..1.0).contains(&self.dropout), "dropout must be in [0, 1)");
        Ok(())
    }
}

/// Everything the encoder computes in one forward pass.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `(b, num_labels)`
    pub logits: Tensor,
    /// `num_layers + 1` tensors of shape `(b, len, hidden)`; index 0 is the
    /// input projection.
    pub hidden: Vec<Tensor>,
    /// `num_layers` tensors of shape `(b, heads, len, len)`.
    pub attention: Vec<Tensor>,
}

struct EncoderLayer {
    qkv: Linear,
    out: Linear,
    norm1: LayerNorm,
    ff_in: Linear,
    ff_out: Linear,
    norm2: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl EncoderLayer {
    fn new(hidden: usize, num_heads: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            qkv: linear(hidden, 3 * hidden, vb.pp("qkv"))?,
            out: linear(hidden, hidden, vb.pp("out"))?,
            norm1: layer_norm(hidden, 1e-5, vb.pp("norm1"))?,
            ff_in: linear(hidden, 2 * hidden, vb.pp("ff_in"))?,
            ff_out: linear(2 * hidden, hidden, vb.pp("ff_out"))?,
            norm2: layer_norm(hidden, 1e-5, vb.pp("norm2"))?,
            num_heads,
            head_dim: hidden / num_heads,
        })
    }

    /// Returns the new hidden states and the attention scores.
    fn forward(&self, xs: &Tensor, bias: &Tensor, dropout: &Dropout, train: bool) -> candle_core::Result<(Tensor, Tensor)> {
        let (b, len, hidden) = xs.dims3()?;
        let heads = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, len, self.num_heads, self.head_dim))?.transpose(1, 2)?.contiguous()
        };
        let qkv = self.qkv.forward(xs)?;
        let q = heads(qkv.narrow(D::Minus1, 0, hidden)?)?;
        let k = heads(qkv.narrow(D::Minus1, hidden, hidden)?)?;
        let v = heads(qkv.narrow(D::Minus1, 2 * hidden, hidden)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?)?.affine(scale, 0.0)?.broadcast_add(bias)?;
        let probs = dropout.forward(&ops::softmax_last_dim(&scores)?, train)?;
        let ctx = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, len, hidden))?;

        let attn_out = dropout.forward(&self.out.forward(&ctx)?, train)?;
        let xs = self.norm1.forward(&(xs + attn_out)?)?;
        let ff = self.ff_out.forward(&self.ff_in.forward(&xs)?.gelu()?)?;
        let xs = self.norm2.forward(&(&xs + dropout.forward(&ff, train)?)?)?;
        Ok((xs, scores))
    }
}

/// The encoder plus the [`VarMap`] that owns its weights.
pub struct Encoder {
    config: EncoderConfig,
    varmap: VarMap,
    input: Linear,
    layers: Vec<EncoderLayer>,
    classifier: Linear,
    dropout: Dropout,
    training: bool,
}

impl Encoder {
    /// Build a randomly initialised encoder on `device`.
    pub fn new(config: EncoderConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let input = linear(config.dim_in, config.hidden_size, vb.pp("input"))?;
        let layers = (0..config.num_layers)
            .map(|i| EncoderLayer::new(config.hidden_size, config.num_heads, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()
            .context("Failed to construct encoder layers")?;
        let classifier = linear(config.hidden_size, config.num_labels, vb.pp("classifier"))?;
        let dropout = Dropout::new(config.dropout);

        Ok(Self { config, varmap, input, layers, classifier, dropout, training: true })
    }

    /// Load a model saved with [`Encoder::save`].
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let raw = fs::read_to_string(&config_path)
            .with_context(|| format!("Cannot read {}", config_path.display()))?;
        let config: EncoderConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid model config in {}", config_path.display()))?;

        let mut model = Self::new(config, device)?;
        let weights = dir.join(WEIGHTS_FILE);
        model
            .varmap
            .load(&weights)
            .with_context(|| format!("Failed to load weights from {}", weights.display()))?;
        info!(path = %dir.display(), layers = model.config.num_layers, hidden = model.config.hidden_size, "Model loaded");
        Ok(model)
    }

    /// Write `model_config.json` and `model.safetensors` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        let json = serde_json::to_string_pretty(&self.config)?;
        fs::write(dir.join(CONFIG_FILE), json)
            .with_context(|| format!("Failed to write {}", dir.join(CONFIG_FILE).display()))?;
        self.varmap
            .save(dir.join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to save weights to {}", dir.display()))?;
        info!(path = %dir.display(), "Model saved");
        Ok(())
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn num_params(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    fn run(&self, batch: &SequenceBatch) -> candle_core::Result<EncoderOutput> {
        let train = self.training;
        // (b, len) → (b, 1, 1, len): 0 for real keys, -1e4 for padding.
        let bias = batch.mask.affine(-MASKED_SCORE, MASKED_SCORE)?.unsqueeze(1)?.unsqueeze(1)?;

        let mut xs = self.input.forward(&batch.features)?;
        let mut hidden = Vec::with_capacity(self.layers.len() + 1);
        let mut attention = Vec::with_capacity(self.layers.len());
        hidden.push(xs.clone());
        for layer in &self.layers {
            let (next, scores) = layer.forward(&xs, &bias, &self.dropout, train)?;
            hidden.push(next.clone());
            attention.push(scores);
            xs = next;
        }

        let mask = batch.mask.unsqueeze(D::Minus1)?;
        let counts = mask.sum(1)?.maximum(1.0)?;
        let pooled = xs.broadcast_mul(&mask)?.sum(1)?.broadcast_div(&counts)?;
        let logits = self.classifier.forward(&self.dropout.forward(&pooled, train)?)?;
        Ok(EncoderOutput { logits, hidden, attention })
    }
}

impl Model<SequenceBatch> for Encoder {
    type Output = EncoderOutput;

    fn forward(&self, batch: &SequenceBatch) -> CoreResult<EncoderOutput> {
        self.run(batch).map_err(CoreError::from)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl Trainable for Encoder {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// Expose logits, hidden states, attention scores and the padding mask.
/// With `with_loss`, also the cross-entropy against the batch labels.
pub fn encoder_adaptor(with_loss: bool) -> Adaptor<SequenceBatch, EncoderOutput> {
    adaptor(move |batch: &SequenceBatch, out: &EncoderOutput| {
        let mut res = AdaptorOutput::new()
            .with_logits(vec![out.logits.clone()])
            .with_labels(vec![batch.labels.clone()])
            .with_hidden(out.hidden.clone())
            .with_attention(out.attention.clone())
            .with_inputs_mask(batch.mask.clone());
        if with_loss {
            res = res.with_losses(vec![candle_nn::loss::cross_entropy(&out.logits, &batch.labels)?]);
        }
        Ok(res)
    })
}
