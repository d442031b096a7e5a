use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Adaptor output for the {role} contains none of the recognised keys")]
    EmptyAdaptorOutput { role: &'static str },

    #[error("Adaptor output for the {role} is missing '{key}'")]
    MissingKey { role: &'static str, key: String },

    #[error("Layer index {index} out of range for {role} '{feature}' ({available} available)")]
    LayerOutOfRange {
        role: &'static str,
        feature: String,
        index: usize,
        available: usize,
    },

    #[error("Shape mismatch in {op}: student {student:?} vs teacher {teacher:?}")]
    ShapeMismatch {
        op: &'static str,
        student: Vec<usize>,
        teacher: Vec<usize>,
    },

    #[error("{op} expects {expected} tensors per side, got {got}")]
    Arity { op: &'static str, expected: usize, got: usize },

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),
}

impl CoreError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config { field: field.into(), reason: reason.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
