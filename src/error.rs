use std::path::PathBuf;

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("checkpoint not found: {0}")]
    MissingCheckpoint(PathBuf),

    #[error("RNG state error: {0}")]
    RngState(#[from] RngStateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Attribute a decoding failure of any kind to the file at `path`.
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        CheckpointError::CorruptCheckpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// A buffer whose shape and value count disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("shape {shape:?} expects {expected} values, got {actual}")]
    Mismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("shape {0:?} has more elements than fit in memory")]
    Overflow(Vec<usize>),
}

/// Sidecar metadata that cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("missing '{0}' metadata")]
    MissingField(&'static str),

    #[error("invalid 'step' metadata: {0}")]
    InvalidStep(#[from] std::num::ParseIntError),

    #[error("invalid 'settings' metadata: {0}")]
    InvalidSettings(#[from] serde_json::Error),

    #[error("invalid 'has_momentum' metadata: {0}")]
    InvalidMomentumFlag(String),
}

/// Generator state that cannot be serialized or restored.
#[derive(Debug, thiserror::Error)]
pub enum RngStateError {
    #[error("cannot capture RNG state for {device}: {reason}")]
    Capture { device: String, reason: String },

    #[error("bad RNG state for {device}: {reason}")]
    Decode { device: String, reason: String },
}

/// Errors that can occur while running the step loop.
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("buffer error: {0}")]
    Shape(#[from] ShapeError),

    #[error("sigma schedule is empty")]
    EmptySchedule,

    #[error("start step {start} is past the end of the schedule ({end})")]
    StepOutOfRange { start: u64, end: u64 },
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),
}

/// Errors raised by the control-plane request handler.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("malformed control request: {0}")]
    MalformedRequest(#[from] serde_json::Error),

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),
}
