//! # distilkit-distill
//!
//! The distillation orchestration loop and the trainers built on it.
//!
//! | Type | Loss |
//! |------|------|
//! | [`BasicTrainer`] | the model's own `losses` |
//! | [`BasicDistiller`] | KD on logits + hard-label losses |
//! | [`GeneralDistiller`] | Basic + intermediate feature matches |
//! | [`MultiTeacherDistiller`] | KD against the teachers' mean logits |
//! | [`MultiTaskDistiller`] | Basic, per task, over a sampled task mix |
//!
//! Each one pulls batches from a [`BatchLoader`], runs the teacher and student
//! through user [`Adaptor`](distilkit_core::Adaptor)s, combines the losses,
//! back-propagates and steps a `candle_nn` optimizer, checkpointing the
//! student's weights to `<output_dir>/gs<step>.safetensors`.
//!
//! ## Usage
//!
//! ```text
//! let mut distiller = GeneralDistiller::new(train_cfg, distill_cfg, teacher, student, adaptor_t, adaptor_s)?;
//! let mut opt = AdamW::new(distiller.trainable_vars(), ParamsAdamW { lr: 1e-3, ..Default::default() })?;
//! distiller.train(&mut opt, &mut loader, TrainOptions::epochs(3).with_callback(evaluate))?;
//! ```

pub mod basic;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distiller;
pub mod general;
pub mod multi_task;
pub mod multi_teacher;
pub mod objective;
pub mod presets;
pub mod trainer;

#[cfg(test)]
mod test_support;

pub use basic::BasicDistiller;
pub use checkpoint::{load_checkpoint, save_checkpoint, LossLog, LossRecord};
pub use config::{DistillationConfig, TrainingConfig};
pub use dataset::{BatchLoader, SequenceBatch, SequenceDataset, SequenceLoader, SequenceRecord, VecLoader};
pub use distiller::{run_training, Duration, TrainOptions, TrainingStats};
pub use general::GeneralDistiller;
pub use multi_task::{MultiTaskDistiller, Task, TaskBatch, TaskMixLoader};
pub use multi_teacher::MultiTeacherDistiller;
pub use objective::{LossOutput, Objective};
pub use presets::{preset_matches, MatchPreset, NAMED_PRESETS};
pub use trainer::BasicTrainer;
