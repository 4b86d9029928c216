// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-tuned-lens.

/// Errors that can occur while loading, running, or evaluating a lens.
#[derive(Debug, thiserror::Error)]
pub enum LensError {
    /// Tensor operation or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Lens construction, loading, or layer pairing error.
    #[error("lens error: {0}")]
    Lens(String),

    /// Model, lens, or run configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed dataset or batch.
    #[error("data error: {0}")]
    Data(String),

    /// Statistics accumulator error (shape mismatch, missing state).
    #[error("stats error: {0}")]
    Stats(String),

    /// Model download error.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-tuned-lens operations.
pub type Result<T> = std::result::Result<T, LensError>;
