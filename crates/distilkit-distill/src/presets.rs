//! Intermediate-match presets for common teacher/student depth pairings.
//!
//! A preset name reads `L<student layers>[n|t]_<feature>_<loss>`. Student
//! layer `k` is paired with teacher layer `k * ratio`, where
//! `ratio = teacher_layers / student_layers`. Hidden states count the
//! embedding output as layer 0; attention layers are 0-based and student
//! layer `k` maps to teacher layer `(k + 1) * ratio - 1`. The `n` / `t`
//! variants add a linear projection from the student's hidden size to the
//! teacher's.
//!
//! With a 12-layer teacher:
//!
//! | Preset | Teacher layers | Student layers | Loss |
//! |--------|----------------|----------------|------|
//! | `L3_hidden_mse`     | 0 4 8 12        | 0 1 2 3         | hidden_mse |
//! | `L3n_hidden_mse`    | 0 4 8 12        | 0 1 2 3         | hidden_mse + projection |
//! | `L3_hidden_smmd`    | [0,0] … [12,12] | [0,0] … [3,3]   | mmd |
//! | `L3_attention_mse`  | 3 7 11          | 0 1 2           | attention_mse |
//! | `L4_hidden_mse`     | 0 3 6 9 12      | 0 1 2 3 4       | hidden_mse |
//! | `L4_attention_ce`   | 2 5 8 11        | 0 1 2 3         | attention_ce |
//! | `L6_hidden_mse`     | 0 2 4 … 12      | 0 1 2 … 6       | hidden_mse |

use anyhow::{bail, Result};

use distilkit_core::{Feature, IntermediateMatch, LayerSel, MatchLoss, ProjKind, ProjectionSpec};

/// Depth of the teacher the named presets are written for.
pub const DEFAULT_TEACHER_LAYERS: usize = 12;

/// The classic preset names.
pub const NAMED_PRESETS: [&str; 14] = [
    "L3_hidden_mse",
    "L3n_hidden_mse",
    "L3_hidden_smmd",
    "L3_attention_mse",
    "L3_attention_ce",
    "L3_attention_mse_sum",
    "L3_attention_ce_mean",
    "L4_hidden_mse",
    "L4t_hidden_mse",
    "L4_hidden_smmd",
    "L4_attention_mse",
    "L4_attention_ce",
    "L6_hidden_mse",
    "L6_hidden_smmd",
];

/// Feature and loss of a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetKind {
    HiddenMse,
    HiddenSmmd,
    AttentionMse,
    AttentionCe,
    AttentionMseSum,
    AttentionCeMean,
}

impl PresetKind {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "hidden_mse" => Self::HiddenMse,
            "hidden_smmd" => Self::HiddenSmmd,
            "attention_mse" => Self::AttentionMse,
            "attention_ce" => Self::AttentionCe,
            "attention_mse_sum" => Self::AttentionMseSum,
            "attention_ce_mean" => Self::AttentionCeMean,
            _ => return None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::HiddenMse => "hidden_mse",
            Self::HiddenSmmd => "hidden_smmd",
            Self::AttentionMse => "attention_mse",
            Self::AttentionCe => "attention_ce",
            Self::AttentionMseSum => "attention_mse_sum",
            Self::AttentionCeMean => "attention_ce_mean",
        }
    }

    fn attention_loss(&self) -> Option<MatchLoss> {
        match self {
            Self::AttentionMse => Some(MatchLoss::AttentionMse),
            Self::AttentionCe => Some(MatchLoss::AttentionCe),
            Self::AttentionMseSum => Some(MatchLoss::AttentionMseSum),
            Self::AttentionCeMean => Some(MatchLoss::AttentionCeMean),
            Self::HiddenMse | Self::HiddenSmmd => None,
        }
    }
}

/// A parsed preset name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPreset {
    pub student_layers: usize,
    /// Project student hidden states to the teacher's hidden size.
    pub projected: bool,
    pub kind: PresetKind,
}

impl MatchPreset {
    /// Parse a name such as `"L4t_hidden_mse"` or `"L2_attention_ce"`.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || {
            anyhow::anyhow!(
                "Unknown preset '{name}'. Expected L<layers>[n|t]_<hidden_mse|hidden_smmd|attention_mse|\
                 attention_ce|attention_mse_sum|attention_ce_mean>, e.g. {}",
                NAMED_PRESETS.join(", ")
            )
        };
        let rest = name.strip_prefix('L').ok_or_else(invalid)?;
        let (head, tail) = rest.split_once('_').ok_or_else(invalid)?;
        let digits_end = head.find(|c: char| !c.is_ascii_digit()).unwrap_or(head.len());
        let student_layers: usize = head[..digits_end].parse().map_err(|_| invalid())?;
        let projected = match &head[digits_end..] {
            "" => false,
            "n" | "t" => true,
            _ => return Err(invalid()),
        };
        let kind = PresetKind::parse(tail).ok_or_else(invalid)?;

        if student_layers == 0 {
            bail!("Preset '{name}' needs at least one student layer");
        }
        if projected && kind != PresetKind::HiddenMse {
            bail!("Preset '{name}': projections are only available for hidden_mse");
        }
        Ok(Self { student_layers, projected, kind })
    }

    pub fn label(&self) -> String {
        let suffix = if self.projected { "t" } else { "" };
        format!("L{}{}_{}", self.student_layers, suffix, self.kind.label())
    }

    /// Build the matches for a teacher of `teacher_layers` layers.
    ///
    /// `hidden_sizes = (student, teacher)` is required by projected presets.
    pub fn matches(&self, teacher_layers: usize, hidden_sizes: Option<(usize, usize)>) -> Result<Vec<IntermediateMatch>> {
        let s_layers = self.student_layers;
        if teacher_layers < s_layers || teacher_layers % s_layers != 0 {
            bail!(
                "Preset {} needs a teacher depth that is a multiple of {s_layers}, got {teacher_layers}",
                self.label()
            );
        }
        let ratio = teacher_layers / s_layers;

        let proj = match (self.projected, hidden_sizes) {
            (false, _) => None,
            (true, Some((dim_s, dim_t))) => Some(ProjectionSpec::new(ProjKind::Linear, dim_s, dim_t)),
            (true, None) => bail!("Preset {} needs the student and teacher hidden sizes", self.label()),
        };

        let out = match self.kind.attention_loss() {
            Some(loss) => (0..s_layers)
                .map(|k| {
                    IntermediateMatch::new(LayerSel::One((k + 1) * ratio - 1), LayerSel::One(k), Feature::Attention, loss)
                })
                .collect(),
            None => (0..=s_layers)
                .map(|k| {
                    let t = k * ratio;
                    match self.kind {
                        PresetKind::HiddenSmmd => IntermediateMatch::new(
                            LayerSel::Many(vec![t, t]),
                            LayerSel::Many(vec![k, k]),
                            Feature::Hidden,
                            MatchLoss::Mmd,
                        ),
                        _ => {
                            let m = IntermediateMatch::new(LayerSel::One(t), LayerSel::One(k), Feature::Hidden, MatchLoss::HiddenMse);
                            match &proj {
                                Some(p) => m.with_proj(p.clone()),
                                None => m,
                            }
                        }
                    }
                })
                .collect(),
        };
        Ok(out)
    }
}

/// Parse `name` and build its matches in one go.
pub fn preset_matches(
    name: &str,
    teacher_layers: usize,
    hidden_sizes: Option<(usize, usize)>,
) -> Result<Vec<IntermediateMatch>> {
    MatchPreset::parse(name)?.matches(teacher_layers, hidden_sizes)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
