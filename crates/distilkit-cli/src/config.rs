use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub training: TrainingSection,
    pub data: DataSection,
    pub model: ArchSection,
    pub student: ArchSection,
    pub output: OutputSection,
    pub device: DeviceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingSection {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub warmup_fraction: f64,
    pub max_grad_norm: f64,
    pub gradient_accumulation_steps: usize,
    pub ckpt_frequency: usize,
    pub print_every: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataSection {
    pub max_len: usize,
}

/// Encoder shape used when a command builds a fresh model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchSection {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub dropout: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSection {
    pub runs_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSection {
    pub device: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            training: TrainingSection {
                epochs: 3,
                batch_size: 32,
                learning_rate: 1e-3,
                warmup_fraction: 0.1,
                max_grad_norm: 1.0,
                gradient_accumulation_steps: 1,
                ckpt_frequency: 1,
                print_every: 0,
                seed: 42,
            },
            data: DataSection { max_len: 128 },
            model: ArchSection { hidden_size: 64, num_layers: 12, num_heads: 4, dropout: 0.1 },
            student: ArchSection { hidden_size: 32, num_layers: 4, num_heads: 2, dropout: 0.1 },
            output: OutputSection { runs_dir: "~/.cache/distilkit/runs".to_string() },
            device: DeviceSection { device: "cpu".to_string() },
        }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `DISTILKIT_`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("training.epochs", 3_i64)?
        .set_default("training.batch_size", 32_i64)?
        .set_default("training.learning_rate", 1e-3)?
        .set_default("training.warmup_fraction", 0.1)?
        .set_default("training.max_grad_norm", 1.0)?
        .set_default("training.gradient_accumulation_steps", 1_i64)?
        .set_default("training.ckpt_frequency", 1_i64)?
        .set_default("training.print_every", 0_i64)?
        .set_default("training.seed", 42_i64)?
        .set_default("data.max_len", 128_i64)?
        .set_default("model.hidden_size", 64_i64)?
        .set_default("model.num_layers", 12_i64)?
        .set_default("model.num_heads", 4_i64)?
        .set_default("model.dropout", 0.1)?
        .set_default("student.hidden_size", 32_i64)?
        .set_default("student.num_layers", 4_i64)?
        .set_default("student.num_heads", 2_i64)?
        .set_default("student.dropout", 0.1)?
        .set_default("output.runs_dir", "~/.cache/distilkit/runs")?
        .set_default("device.device", "cpu")?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (DISTILKIT_DEVICE__DEVICE=cuda, ...)
    builder = builder.add_source(
        Environment::with_prefix("DISTILKIT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand a leading `~` to the actual home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}
