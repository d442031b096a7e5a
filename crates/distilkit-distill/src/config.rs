//! Training and distillation hyper-parameters.
//!
//! Both configs deserialize from JSON with every field optional:
//!
//! ```json
//! {"temperature": 8, "hard_label_weight": 0.5,
//!  "intermediate_matches": [{"layer_T": 4, "layer_S": 1, "feature": "hidden", "loss": "hidden_mse"}]}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use distilkit_core::{CoreError, CoreResult, IntermediateMatch, KdLossType, TemperatureScheduler, WeightScheduler};

// ── TrainingConfig ────────────────────────────────────────────────────────────

/// Settings of the orchestration loop shared by every trainer and distiller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Micro-batches accumulated per optimizer step.
    pub gradient_accumulation_steps: usize,
    /// Checkpoints per epoch (epoch mode) or per run (steps mode).
    pub ckpt_frequency: usize,
    /// Only checkpoint in epochs where `epoch % ckpt_epoch_frequency == 0`,
    /// and always in the final epoch.
    pub ckpt_epoch_frequency: usize,
    /// Checkpoint every N global steps instead of using `ckpt_frequency`.
    pub ckpt_steps: Option<usize>,
    /// When set, scalar losses are appended to `<log_dir>/losses.jsonl`.
    pub log_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub device: String,
    /// Report losses every N global steps; 0 picks roughly 20 reports per epoch.
    pub print_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            gradient_accumulation_steps: 1,
            ckpt_frequency: 1,
            ckpt_epoch_frequency: 1,
            ckpt_steps: None,
            log_dir: None,
            output_dir: PathBuf::from("./saved_models"),
            device: "cpu".to_string(),
            print_every: 0,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.gradient_accumulation_steps == 0 {
            return Err(CoreError::config("gradient_accumulation_steps", "must be at least 1"));
        }
        if self.ckpt_frequency == 0 {
            return Err(CoreError::config("ckpt_frequency", "must be at least 1"));
        }
        if self.ckpt_epoch_frequency == 0 {
            return Err(CoreError::config("ckpt_epoch_frequency", "must be at least 1"));
        }
        if self.ckpt_steps == Some(0) {
            return Err(CoreError::config("ckpt_steps", "must be at least 1 when set"));
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

// ── DistillationConfig ────────────────────────────────────────────────────────

/// Loss composition for the distillers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillationConfig {
    pub temperature: f64,
    pub temperature_scheduler: TemperatureScheduler,
    pub hard_label_weight: f64,
    pub hard_label_weight_scheduler: WeightScheduler,
    pub kd_loss_type: KdLossType,
    pub kd_loss_weight: f64,
    pub kd_loss_weight_scheduler: WeightScheduler,
    /// Swap the teacher's top logit with the true label's logit before KD.
    pub probability_shift: bool,
    pub intermediate_matches: Vec<IntermediateMatch>,
    /// Run the teacher once up front and reuse its outputs every epoch.
    pub is_caching_logits: bool,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            temperature: 4.0,
            temperature_scheduler: TemperatureScheduler::None,
            hard_label_weight: 0.0,
            hard_label_weight_scheduler: WeightScheduler::None,
            kd_loss_type: KdLossType::Ce,
            kd_loss_weight: 1.0,
            kd_loss_weight_scheduler: WeightScheduler::None,
            probability_shift: false,
            intermediate_matches: Vec::new(),
            is_caching_logits: false,
        }
    }
}

impl DistillationConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(CoreError::config("temperature", format!("must be positive, got {}", self.temperature)));
        }
        self.temperature_scheduler.validate()?;
        for (name, w) in [("hard_label_weight", self.hard_label_weight), ("kd_loss_weight", self.kd_loss_weight)] {
            if !w.is_finite() {
                return Err(CoreError::config(name, "must be finite"));
            }
        }
        for m in &self.intermediate_matches {
            m.validate()?;
        }
        Ok(())
    }

    /// Effective (`kd`, `hard_label`) weights at `progress` through training.
    pub fn weights_at(&self, progress: f64) -> (f64, f64) {
        (
            self.kd_loss_weight_scheduler.weight(self.kd_loss_weight, progress),
            self.hard_label_weight_scheduler.weight(self.hard_label_weight, progress),
        )
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config JSON in {}", path.display()))
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use distilkit_core::{Feature, LayerSel, MatchLoss};
    use tempfile::TempDir;

    #[test]
    fn defaults_from_empty_json() {
        let t: TrainingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(t, TrainingConfig::default());
        assert_eq!(t.output_dir, PathBuf::from("./saved_models"));
        let d: DistillationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(d.temperature, 4.0);
        assert_eq!(d.kd_loss_type, KdLossType::Ce);
        assert!(d.intermediate_matches.is_empty());
    }

    #[test]
    fn parses_full_distillation_config() {
        let json = r#"{
            "temperature": 8,
            "temperature_scheduler": {"name": "cwsm", "beta": 1.0},
            "hard_label_weight": 0.5,
            "kd_loss_type": "mse",
            "kd_loss_weight_scheduler": "linear_decay",
            "probability_shift": true,
            "intermediate_matches": [
                {"layer_T": 4, "layer_S": 1, "feature": "hidden", "loss": "hidden_mse", "weight": 2}
            ],
            "is_caching_logits": true
        }"#;
        let d: DistillationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(d.kd_loss_type, KdLossType::Mse);
        assert_eq!(d.temperature_scheduler, TemperatureScheduler::Cwsm { beta: 1.0 });
        assert_eq!(d.intermediate_matches[0].layer_t, LayerSel::One(4));
        assert_eq!(d.intermediate_matches[0].weight, 2.0);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn json_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("distill.json");
        let mut d = DistillationConfig::default();
        d.intermediate_matches.push(IntermediateMatch::new(
            LayerSel::Many(vec![0, 1]),
            LayerSel::Many(vec![0, 1]),
            Feature::Hidden,
            MatchLoss::Fsp,
        ));
        d.to_json_file(&path).unwrap();
        assert_eq!(DistillationConfig::from_json_file(&path).unwrap(), d);
    }

    #[test]
    fn rejects_bad_values() {
        let t = TrainingConfig { gradient_accumulation_steps: 0, ..Default::default() };
        assert!(matches!(t.validate(), Err(CoreError::Config { .. })));
        let t = TrainingConfig { ckpt_steps: Some(0), ..Default::default() };
        assert!(t.validate().is_err());
        let d = DistillationConfig { temperature: 0.0, ..Default::default() };
        assert!(d.validate().is_err());
    }

    #[test]
    fn scheduled_weights() {
        let d = DistillationConfig {
            hard_label_weight: 1.0,
            hard_label_weight_scheduler: WeightScheduler::LinearGrowth,
            kd_loss_weight_scheduler: WeightScheduler::LinearDecay,
            ..Default::default()
        };
        assert_eq!(d.weights_at(0.25), (0.75, 0.25));
    }
}
