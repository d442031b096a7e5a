//! Trainable projections for intermediate matches whose student and teacher
//! feature sizes differ.

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::error::CoreResult;
use crate::matches::{ProjKind, ProjectionSpec};

/// A linear map followed by an optional activation.
#[derive(Debug, Clone)]
pub struct Projection {
    kind: ProjKind,
    linear: Linear,
}

impl Projection {
    /// Create the projection's weights under `vb`.
    pub fn new(spec: &ProjectionSpec, vb: VarBuilder) -> CoreResult<Self> {
        let linear = linear(spec.dim_in, spec.dim_out, vb)?;
        Ok(Self { kind: spec.kind, linear })
    }
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.linear.forward(xs)?;
        match self.kind {
            ProjKind::Linear => Ok(ys),
            ProjKind::Relu => ys.relu(),
            ProjKind::Tanh => ys.tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn maps_student_dim_to_teacher_dim() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let proj = Projection::new(&ProjectionSpec::new(ProjKind::Tanh, 4, 8), vb.pp("proj")).unwrap();
        let xs = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let ys = proj.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[2, 3, 8]);
        assert_eq!(varmap.all_vars().len(), 2);
        let max = ys.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0);
    }
}
