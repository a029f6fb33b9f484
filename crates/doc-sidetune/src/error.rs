//! Error type for every failure in the side-tuning models and training loop.
//!
//! # Error Categories
//!
//! | Category | Variants | Recovery Strategy |
//! |----------|----------|-------------------|
//! | Shape | DimensionMismatch, InvalidShape | Fix model construction |
//! | Data | LabelOutOfRange, EmptyInput | Fix dataset / label mapping |
//! | Configuration | ConfigError | Fix configuration |
//! | Infrastructure | TensorError, IoError | None (abort the run) |
//!
//! # Design Principles
//!
//! - **FAIL FAST**: every variant is fatal for the current run, nothing is retried
//! - **CONTEXTUAL**: every variant names the call site that raised it

use thiserror::Error;

/// Error type for the fusion models and training pipeline.
#[derive(Debug, Error)]
pub enum SideTuneError {
    // === Shape Errors ===
    /// Embedding width does not match the width the consumer expects.
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// Tensor rank or batch layout is wrong for the operation.
    #[error("Invalid shape in {context}: {reason}")]
    InvalidShape { context: String, reason: String },

    // === Data Errors ===
    /// Class index outside `[0, num_classes)`.
    #[error("Label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: i64, num_classes: usize },

    /// A pass needed at least one sample and got none.
    #[error("Empty input: {context}")]
    EmptyInput { context: String },

    // === Configuration Errors ===
    /// Invalid construction-time or experiment configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    // === Infrastructure Errors ===
    /// Tensor backend operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// File I/O error (config files, checkpoints, pretrained weights).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for side-tuning operations.
pub type SideTuneResult<T> = Result<T, SideTuneError>;

impl SideTuneError {
    /// Shorthand for [`SideTuneError::ConfigError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the error comes from a misconfigured model or experiment
    /// rather than the backend.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::InvalidShape { .. }
                | Self::ConfigError { .. }
                | Self::LabelOutOfRange { .. }
        )
    }
}

/// Build a mapper from candle errors to [`SideTuneError::TensorError`],
/// tagging the message with the operation that failed.
pub(crate) fn map_candle(context: &'static str) -> impl Fn(candle_core::Error) -> SideTuneError {
    move |e| SideTuneError::TensorError {
        message: format!("{}: {}", context, e),
    }
}
