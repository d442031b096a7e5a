//! Student checkpoints and the loss log.
//!
//! Checkpoints are the student's [`VarMap`] written as
//! `<output_dir>/gs<global_step>.safetensors`. The loss log is a JSONL file
//! with one record per reported step.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// File name of the checkpoint taken at `global_step`.
pub fn checkpoint_name(global_step: usize) -> String {
    format!("gs{global_step}.safetensors")
}

/// Save `varmap` under `output_dir` and return the written path.
pub fn save_checkpoint(varmap: &VarMap, output_dir: &Path, global_step: usize) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Cannot create output dir: {}", output_dir.display()))?;
    let path = output_dir.join(checkpoint_name(global_step));
    varmap
        .save(&path)
        .with_context(|| format!("Failed to save checkpoint {}", path.display()))?;
    info!(path = %path.display(), global_step, "Saving model");
    Ok(path)
}

/// Load weights saved by [`save_checkpoint`] into an existing `varmap`.
pub fn load_checkpoint(varmap: &mut VarMap, path: &Path) -> Result<()> {
    varmap
        .load(path)
        .with_context(|| format!("Failed to load checkpoint {}", path.display()))
}

/// One line of `losses.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub global_step: usize,
    pub epoch: usize,
    pub lr: f64,
    pub loss: f32,
    pub losses: BTreeMap<String, f32>,
}

/// Append-only JSONL writer for [`LossRecord`]s.
pub struct LossLog {
    path: PathBuf,
    writer: BufWriter<fs::File>,
}

impl LossLog {
    pub const FILE_NAME: &'static str = "losses.jsonl";

    /// Open (or create) `<log_dir>/losses.jsonl` for appending.
    pub fn open(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Cannot create log dir: {}", log_dir.display()))?;
        let path = log_dir.join(Self::FILE_NAME);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Cannot open {} for appending", path.display()))?;
        Ok(Self { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &LossRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read every record back from a loss log file.
    pub fn read(path: &Path) -> Result<Vec<LossRecord>> {
        let text = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| {
                serde_json::from_str(l).with_context(|| format!("Parse error at {}:{}", path.display(), i + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};
    use tempfile::TempDir;

    #[test]
    fn checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let varmap = VarMap::new();
        let w = varmap.get((2, 3), "w", Init::Const(0.5), DType::F32, &Device::Cpu).unwrap();
        let path = save_checkpoint(&varmap, dir.path(), 12).unwrap();
        assert!(path.ends_with("gs12.safetensors"));

        let mut other = VarMap::new();
        let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
        let w2 = vb.get_with_hints((2, 3), "w", Init::Const(0.0)).unwrap();
        load_checkpoint(&mut other, &path).unwrap();
        let data = other.data().lock().unwrap();
        let loaded = data.get("w").unwrap().as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(loaded, w.to_vec2::<f32>().unwrap());
        assert_eq!(w2.dims(), &[2, 3]);
    }

    #[test]
    fn loss_log_appends_records() {
        let dir = TempDir::new().unwrap();
        let mut log = LossLog::open(dir.path()).unwrap();
        for step in 1..=2 {
            let mut losses = BTreeMap::new();
            losses.insert("unweighted_kd_loss".to_string(), 0.5 / step as f32);
            log.append(&LossRecord { global_step: step, epoch: 0, lr: 0.1, loss: 1.0, losses }).unwrap();
        }
        let records = LossLog::read(log.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].global_step, 2);
        assert_eq!(records[1].losses["unweighted_kd_loss"], 0.25);
    }
}
