// src/error.rs

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PcaError>;

/// Errors raised by record I/O, the statistics kernels, the eigensolver
/// adapter and the PCA driver.
///
/// Precondition violations, I/O failures and numerical hazards each have their
/// own variants so callers can tell a bad argument from an unreadable file from
/// degenerate data.
#[derive(Debug, thiserror::Error)]
pub enum PcaError {
    #[error("record file path is empty")]
    EmptyPath,

    #[error("dimension must be positive, got {dimension}")]
    InvalidDimension { dimension: usize },

    /// Header widths of 1..=3 bytes cannot hold an `i32` id.
    #[error("record header must be 0 or at least 4 bytes wide, got {header_bytes}")]
    InvalidHeaderWidth { header_bytes: usize },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what}: expected length {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("at least {required} rows are required, got {rows}")]
    InsufficientRows { rows: usize, required: usize },

    #[error("columns with zero variance cannot be whitened: {columns:?}")]
    ZeroVariance { columns: Vec<usize> },

    #[error("eigenpair rank window [{low}, {high}] is invalid for a {dimension}x{dimension} matrix")]
    InvalidRankWindow {
        low: usize,
        high: usize,
        dimension: usize,
    },

    #[error("eigensolver failed: {0}")]
    Eigensolver(String),

    #[error("non-finite values in {what}")]
    NonFinite { what: &'static str },

    #[error("model serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl PcaError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PcaError::Io {
            path: path.into(),
            source,
        }
    }
}
