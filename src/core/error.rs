//! Error types for the GPT-2 core.

use thiserror::Error;

/// Errors raised while configuring, building or running a GPT-2 model.
#[derive(Error, Debug)]
pub enum Gpt2Error {
    /// Size label outside the known preset set.
    #[error("unknown model size {0:?} (expected one of 117M, 345M, 762M, 1.5B)")]
    UnknownModelSize(String),

    /// Hyperparameters that cannot describe a valid model.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A naming-scheme role has no tensor name bound to it.
    #[error("no tensor name bound for role {0}")]
    MissingName(&'static str),

    /// Positional clipping past the learned position table.
    #[error(
        "position range {offset}..{} exceeds the {max} learned positions (sequence length {seq_len})",
        .offset + .seq_len
    )]
    PositionOutOfRange {
        offset: usize,
        seq_len: usize,
        max: usize,
    },

    /// Tensor with a shape the operation cannot accept.
    #[error("shape mismatch for {what}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("generation needs at least one prompt token")]
    EmptyPrompt,

    /// Cache handles disagree about how many positions were consumed.
    #[error("cache state error: {0}")]
    CacheState(String),

    /// Tensors required by the naming scheme are absent from a checkpoint.
    #[error("checkpoint is missing {} tensor(s), first: {}", .0.len(), .0.first().map(String::as_str).unwrap_or("-"))]
    MissingTensors(Vec<String>),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid checkpoint {path}: {reason}")]
    InvalidCheckpoint { path: String, reason: String },
}
