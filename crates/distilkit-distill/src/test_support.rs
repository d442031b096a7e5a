//! Tiny models and data shared by the distiller tests.

use std::cell::Cell;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use distilkit_core::{adaptor, Adaptor, AdaptorOutput, CoreResult, Model, Trainable};

use crate::dataset::VecLoader;

#[derive(Debug, Clone)]
pub struct ToyBatch {
    /// `(batch, 2)`
    pub x: Tensor,
    /// `(batch,)` u32
    pub y: Tensor,
}

pub struct ToyOutput {
    pub logits: Tensor,
    /// `[input, logits]`, each `(batch, 1, 2)`
    pub hidden: Vec<Tensor>,
}

/// A single 2→2 linear layer.
pub struct LinearNet {
    linear: Linear,
    varmap: VarMap,
    pub forward_calls: Cell<usize>,
    pub training: bool,
}

impl LinearNet {
    /// Randomly initialised, trainable.
    pub fn student() -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = linear(2, 2, vb.pp("fc")).unwrap();
        Self { linear, varmap, forward_calls: Cell::new(0), training: false }
    }

    /// Fixed weights `[[2, -1], [-1, 2]]`, no trainable parameters.
    pub fn teacher() -> Self {
        Self::fixed([[2.0, -1.0], [-1.0, 2.0]])
    }

    pub fn fixed(w: [[f32; 2]; 2]) -> Self {
        let weight = Tensor::new(&w, &Device::Cpu).unwrap();
        let bias = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        Self {
            linear: Linear::new(weight, Some(bias)),
            varmap: VarMap::new(),
            forward_calls: Cell::new(0),
            training: false,
        }
    }
}

impl Model<ToyBatch> for LinearNet {
    type Output = ToyOutput;

    fn forward(&self, batch: &ToyBatch) -> CoreResult<ToyOutput> {
        self.forward_calls.set(self.forward_calls.get() + 1);
        let logits = self.linear.forward(&batch.x)?;
        let hidden = vec![batch.x.unsqueeze(1)?, logits.unsqueeze(1)?];
        Ok(ToyOutput { logits, hidden })
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl Trainable for LinearNet {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

pub fn teacher_adaptor() -> Adaptor<ToyBatch, ToyOutput> {
    adaptor(|_b: &ToyBatch, o: &ToyOutput| {
        Ok(AdaptorOutput::new().with_logits(vec![o.logits.clone()]).with_hidden(o.hidden.clone()))
    })
}

/// Logits, hidden states and a cross-entropy hard-label loss.
pub fn student_adaptor() -> Adaptor<ToyBatch, ToyOutput> {
    adaptor(|b: &ToyBatch, o: &ToyOutput| {
        let ce = candle_nn::loss::cross_entropy(&o.logits, &b.y)?;
        Ok(AdaptorOutput::new()
            .with_logits(vec![o.logits.clone()])
            .with_hidden(o.hidden.clone())
            .with_losses(vec![ce]))
    })
}

/// Eight points in four batches of two, labelled by the teacher's argmax.
pub fn toy_batches() -> Vec<ToyBatch> {
    let points = [
        [1.0f32, 0.0],
        [0.0, 1.0],
        [0.8, 0.2],
        [0.1, 0.9],
        [1.0, 0.5],
        [0.3, 1.0],
        [0.9, -0.2],
        [-0.4, 0.6],
    ];
    points
        .chunks(2)
        .map(|pair| {
            let y: Vec<u32> = pair.iter().map(|p| u32::from(p[1] > p[0])).collect();
            ToyBatch {
                x: Tensor::new(&[pair[0], pair[1]], &Device::Cpu).unwrap(),
                y: Tensor::new(y.as_slice(), &Device::Cpu).unwrap(),
            }
        })
        .collect()
}

pub fn toy_loader() -> VecLoader<ToyBatch> {
    VecLoader::new(toy_batches()).shuffled(0)
}
