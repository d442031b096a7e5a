//! Batch sources for the training loop.
//!
//! [`BatchLoader`] is what the loop consumes: a fixed number of batches per
//! epoch, produced afresh (and possibly reshuffled) each epoch.
//!
//! [`SequenceDataset`] reads JSONL files of variable-length feature
//! sequences. Each line is one example:
//!
//! ```json
//! {"features": [[0.1, 0.2], [0.3, 0.4]], "label": 1}
//! ```
//!
//! A path may name a single file or a directory, in which case all `.jsonl`
//! and `.json` files are concatenated in alphabetical order.

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

// ── BatchLoader ───────────────────────────────────────────────────────────────

/// A source of batches for the training loop.
pub trait BatchLoader {
    type Batch;

    /// Number of batches in one epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All batches of epoch `epoch` (0-based), in iteration order.
    fn epoch_batches(&mut self, epoch: usize) -> Result<Vec<Self::Batch>>;
}

/// Pre-built batches, optionally reshuffled every epoch.
#[derive(Debug, Clone)]
pub struct VecLoader<B> {
    batches: Vec<B>,
    shuffle: Option<u64>,
}

impl<B: Clone> VecLoader<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self { batches, shuffle: None }
    }

    /// Shuffle the batch order each epoch with a generator seeded from
    /// `seed + epoch`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }
}

impl<B: Clone> BatchLoader for VecLoader<B> {
    type Batch = B;

    fn len(&self) -> usize {
        self.batches.len()
    }

    fn epoch_batches(&mut self, epoch: usize) -> Result<Vec<B>> {
        let mut out = self.batches.clone();
        if let Some(seed) = self.shuffle {
            out.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)));
        }
        Ok(out)
    }
}

// ── Sequence data ─────────────────────────────────────────────────────────────

/// One example: a `(len, dim)` feature sequence and its class label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub features: Vec<Vec<f32>>,
    pub label: u32,
}

/// A padded batch of sequences.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    /// `(batch, len, dim)`, zero-padded on the right.
    pub features: Tensor,
    /// `(batch, len)`, 1.0 for real positions and 0.0 for padding.
    pub mask: Tensor,
    /// `(batch,)` u32 class labels.
    pub labels: Tensor,
}

/// All records from one or more JSONL files.
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    records: Vec<SequenceRecord>,
    dim: usize,
}

impl SequenceDataset {
    pub fn new(records: Vec<SequenceRecord>) -> Result<Self> {
        let dim = records
            .iter()
            .flat_map(|r| r.features.first())
            .map(Vec::len)
            .next()
            .context("Dataset has no non-empty feature sequence")?;
        for (i, r) in records.iter().enumerate() {
            anyhow::ensure!(!r.features.is_empty(), "Record {i} has an empty feature sequence");
            if let Some(row) = r.features.iter().find(|row| row.len() != dim) {
                anyhow::bail!("Record {i} has a {}-dim feature row, expected {dim}", row.len());
            }
        }
        Ok(Self { records, dim })
    }

    /// Load every record under `path` (a file or a directory of JSONL files).
    pub fn from_path(path: &Path) -> Result<Self> {
        let files = if path.is_dir() { list_data_files(path)? } else { vec![path.to_path_buf()] };

        let mut records = Vec::new();
        for file_path in &files {
            let file = fs::File::open(file_path)
                .with_context(|| format!("Cannot open {}", file_path.display()))?;
            for (line_no, line) in io::BufReader::new(file).lines().enumerate() {
                let line = line.with_context(|| format!("IO error reading {}", file_path.display()))?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let rec: SequenceRecord = serde_json::from_str(trimmed).with_context(|| {
                    format!(
                        "JSON parse error at {}:{}, expected {{\"features\": [[...]], \"label\": n}}",
                        file_path.display(),
                        line_no + 1
                    )
                })?;
                records.push(rec);
            }
            info!(path = %file_path.display(), count = records.len(), "Loaded dataset file");
        }

        let ds = Self::new(records)?;
        info!(total = ds.len(), dim = ds.dim, "Dataset loaded");
        Ok(ds)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Feature size of every sequence position.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// One more than the largest label.
    pub fn num_labels(&self) -> usize {
        self.records.iter().map(|r| r.label as usize + 1).max().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[SequenceRecord] {
        &self.records
    }

    /// Pad `records` to a common length (at most `max_len`) and build tensors.
    pub fn collate(records: &[&SequenceRecord], max_len: usize, device: &Device) -> Result<SequenceBatch> {
        anyhow::ensure!(!records.is_empty(), "Cannot collate an empty batch");
        let dim = records[0].features[0].len();
        let len = records.iter().map(|r| r.features.len()).max().unwrap_or(0).min(max_len.max(1));

        let mut features = Vec::with_capacity(records.len() * len * dim);
        let mut mask = Vec::with_capacity(records.len() * len);
        for r in records {
            for pos in 0..len {
                match r.features.get(pos) {
                    Some(row) => {
                        features.extend_from_slice(row);
                        mask.push(1.0f32);
                    }
                    None => {
                        features.extend(std::iter::repeat(0.0f32).take(dim));
                        mask.push(0.0);
                    }
                }
            }
        }
        let labels: Vec<u32> = records.iter().map(|r| r.label).collect();
        let b = records.len();

        Ok(SequenceBatch {
            features: Tensor::from_vec(features, (b, len, dim), device)
                .context("Failed to build feature tensor")?,
            mask: Tensor::from_vec(mask, (b, len), device).context("Failed to build mask tensor")?,
            labels: Tensor::from_vec(labels, b, device).context("Failed to build label tensor")?,
        })
    }
}

fn list_data_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read dataset directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let s = name.to_string_lossy();
            s.ends_with(".jsonl") || s.ends_with(".json")
        })
        .map(|e| e.path())
        .collect();

    // Deterministic order
    entries.sort();

    anyhow::ensure!(!entries.is_empty(), "No .jsonl or .json files found in {}", dir.display());
    Ok(entries)
}

// ── SequenceLoader ────────────────────────────────────────────────────────────

/// Batches a [`SequenceDataset`], reshuffling examples each epoch.
#[derive(Debug, Clone)]
pub struct SequenceLoader {
    dataset: SequenceDataset,
    batch_size: usize,
    max_len: usize,
    shuffle: Option<u64>,
    device: Device,
}

impl SequenceLoader {
    pub fn new(dataset: SequenceDataset, batch_size: usize, max_len: usize, device: Device) -> Self {
        Self { dataset, batch_size: batch_size.max(1), max_len, shuffle: None, device }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }

    pub fn dataset(&self) -> &SequenceDataset {
        &self.dataset
    }
}

impl BatchLoader for SequenceLoader {
    type Batch = SequenceBatch;

    fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn epoch_batches(&mut self, epoch: usize) -> Result<Vec<SequenceBatch>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)));
        }
        order
            .chunks(self.batch_size)
            .map(|idx| {
                let recs: Vec<&SequenceRecord> = idx.iter().map(|&i| &self.dataset.records[i]).collect();
                SequenceDataset::collate(&recs, self.max_len, &self.device)
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
