// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the calibration crate.
pub type CalibResult<T> = Result<T, CalibError>;

/// Coarse classification of a failure, used when reporting an aborted run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inputs or settings that cannot describe a valid calibration.
    Configuration,
    /// Degenerate numbers with no per-element recovery rule.
    Numerical,
    /// Scratch memory could not be obtained.
    Resource,
}

/// Errors emitted by calibration stages. Every variant is fatal for the run.
#[derive(Clone, Debug, Error)]
pub enum CalibError {
    /// Attempted to register an array under a name that is already taken.
    #[error("array '{0}' already exists in the store")]
    ArrayExists(String),
    /// Requested an array that has not been registered.
    #[error("array '{0}' is not registered in the store")]
    ArrayMissing(String),
    /// Arrays carry one to three axes, none of them empty.
    #[error("invalid array shape {shape:?}; expected 1 to 3 non-empty axes")]
    InvalidShape { shape: Vec<usize> },
    /// Buffer length does not match the declared shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// Two arrays that must align do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// Ensemble companion file missing, unreadable or malformed.
    #[error("cannot read ensemble count from {path:?}: {message}")]
    CountFile { path: PathBuf, message: String },
    /// Too few ensemble members for a robust combination.
    #[error("insufficient number of ensemble members: {found}, should be at least {minimum}")]
    InsufficientEnsembles { found: usize, minimum: usize },
    /// Trimming removed every sample; the average would divide by zero.
    #[error("trimmed-mean window is empty: {samples} samples with band {band} on each side")]
    EmptyTrimWindow { samples: usize, band: usize },
    /// Mask-weighted total vanished or is not finite.
    #[error("degenerate mask while computing {label}: weighted total is {total}")]
    DegenerateMask { label: &'static str, total: f64 },
    /// A non-finite element reached a stage that has no recovery rule for it.
    #[error("non-finite value {value} in {label} at flat index {index}")]
    NonFinite {
        label: &'static str,
        index: usize,
        value: f32,
    },
    /// A tunable was outside its admissible range.
    #[error("invalid parameter {label}: {message}")]
    InvalidParameter {
        label: &'static str,
        message: String,
    },
    /// Singular value decomposition did not converge within the iteration cap.
    #[error("SVD of {rows}x{cols} matrix did not converge within {max_iterations} iterations")]
    Decomposition {
        rows: usize,
        cols: usize,
        max_iterations: usize,
    },
    /// Execution failed on a linear-algebra backend.
    #[error("{backend} backend failure: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    /// The worker pool could not be started.
    #[error("cannot start worker pool: {0}")]
    WorkerPool(String),
    /// Scratch buffer allocation failed.
    #[error("cannot allocate {label} scratch buffer of {requested} elements")]
    Allocation {
        label: &'static str,
        requested: usize,
    },
    /// Wrapper around I/O failures on array, count or audit files.
    #[error("i/o error on {path:?}: {message}")]
    Io { path: PathBuf, message: String },
    /// Wrapper around serde failures on array snapshots or configuration.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl CalibError {
    /// Maps the error onto the configuration / numerical / resource taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalibError::EmptyTrimWindow { .. }
            | CalibError::DegenerateMask { .. }
            | CalibError::NonFinite { .. }
            | CalibError::Decomposition { .. }
            | CalibError::Backend { .. } => ErrorKind::Numerical,
            CalibError::Allocation { .. } | CalibError::WorkerPool(_) => ErrorKind::Resource,
            _ => ErrorKind::Configuration,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        CalibError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn serde(err: impl ToString) -> Self {
        CalibError::Serialization {
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(label: &'static str, message: impl Into<String>) -> Self {
        CalibError::InvalidParameter {
            label,
            message: message.into(),
        }
    }
}
