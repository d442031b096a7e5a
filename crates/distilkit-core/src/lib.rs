//! # distilkit-core
//!
//! Building blocks shared by every distiller:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`adaptor`] | [`AdaptorOutput`], the canonical loss-input record |
//! | [`model`] | [`Model`] / [`Trainable`] traits for teachers and students |
//! | [`losses`] | KD and intermediate-feature losses |
//! | [`logits`] | logits masking and probability shift |
//! | [`matches`] | intermediate-match configuration |
//! | [`projection`] | trainable student→teacher feature projections |
//! | [`schedulers`] | temperature, loss-weight and learning-rate schedules |
//! | [`device`] | device selection |
//!
//! Tensors, autograd and optimisers come from `candle-core` / `candle-nn`.
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod adaptor;
pub mod device;
pub mod error;
pub mod logits;
pub mod losses;
pub mod matches;
pub mod model;
pub mod projection;
pub mod schedulers;

pub use adaptor::{adaptor, Adaptor, AdaptorOutput};
pub use device::select_device;
pub use error::{CoreError, CoreResult};
pub use losses::{KdLossType, Temperature};
pub use matches::{Feature, IntermediateMatch, LayerSel, MatchLoss, ProjKind, ProjectionSpec};
pub use model::{Model, Trainable};
pub use projection::Projection;
pub use schedulers::{ConstantLr, LinearWarmupDecay, LrSchedule, TemperatureScheduler, WeightScheduler};
