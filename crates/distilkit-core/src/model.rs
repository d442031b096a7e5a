use candle_core::Var;
use candle_nn::VarMap;

use crate::error::CoreResult;

/// A network that can run a forward pass on a batch of type `B`.
///
/// Teachers only need this trait. The output type is whatever the model
/// naturally produces; an [`Adaptor`](crate::Adaptor) turns it into the
/// canonical [`AdaptorOutput`](crate::AdaptorOutput).
pub trait Model<B> {
    type Output;

    fn forward(&self, batch: &B) -> CoreResult<Self::Output>;

    /// Switch between training and evaluation behaviour (dropout etc.).
    fn set_training(&mut self, _training: bool) {}
}

/// A model whose parameters live in a [`VarMap`] and can be optimised.
pub trait Trainable {
    fn varmap(&self) -> &VarMap;

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap().all_vars()
    }
}

impl<B, M: Model<B> + ?Sized> Model<B> for Box<M> {
    type Output = M::Output;

    fn forward(&self, batch: &B) -> CoreResult<Self::Output> {
        (**self).forward(batch)
    }

    fn set_training(&mut self, training: bool) {
        (**self).set_training(training)
    }
}

impl<M: Trainable + ?Sized> Trainable for Box<M> {
    fn varmap(&self) -> &VarMap {
        (**self).varmap()
    }
}
