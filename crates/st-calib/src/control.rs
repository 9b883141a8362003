// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Control-matrix synthesis by truncated SVD pseudo-inversion.
//!
//! The response matrix `R` (`NBpoke x P`) maps poke amplitudes onto sensor
//! pixels through `Rᵀ`. The control matrix is the pseudo-inverse of `Rᵀ`,
//! stored `[NBpoke, P]`, so that `CM · Rᵀ ≈ I` on the retained modes.

use std::fmt;

use nalgebra::{DMatrix, SVD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CalibError, CalibResult};
use crate::store::NamedArray;

/// Iteration cap of the CPU decomposition.
pub const CPU_MAX_ITERATIONS: usize = 10_000;

/// The only tunables of the decomposition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvdOptions {
    /// Singular values below `truncation * s_max` are discarded.
    pub truncation: f64,
    pub max_iterations: usize,
}

impl Default for SvdOptions {
    fn default() -> Self {
        Self {
            truncation: 1e-4,
            max_iterations: CPU_MAX_ITERATIONS,
        }
    }
}

impl SvdOptions {
    pub fn validate(&self) -> CalibResult<()> {
        if !(0.0..1.0).contains(&self.truncation) {
            return Err(CalibError::invalid(
                "control.truncation",
                format!("must lie in [0, 1), got {}", self.truncation),
            ));
        }
        if self.max_iterations == 0 {
            return Err(CalibError::invalid(
                "control.max_iterations",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Which decomposition backend to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// faer when compiled in, nalgebra otherwise.
    #[default]
    Auto,
    Cpu,
    Faer,
}

impl BackendChoice {
    pub fn label(self) -> &'static str {
        match self {
            BackendChoice::Auto => "auto",
            BackendChoice::Cpu => "cpu",
            BackendChoice::Faer => "faer",
        }
    }

    /// Instantiates the backend, failing when faer was requested but not built.
    pub fn resolve(self) -> CalibResult<Box<dyn PseudoInverseBackend>> {
        match self {
            BackendChoice::Cpu => Ok(Box::new(NalgebraSvd)),
            BackendChoice::Auto if faer_svd::is_available() => Ok(Box::new(FaerSvd)),
            BackendChoice::Auto => Ok(Box::new(NalgebraSvd)),
            BackendChoice::Faer if faer_svd::is_available() => Ok(Box::new(FaerSvd)),
            BackendChoice::Faer => Err(CalibError::Backend {
                backend: "faer",
                message: "faer backend disabled at compile time".to_string(),
            }),
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Truncated pseudo-inverse of a dense row-major matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct PseudoInverse {
    /// `cols x rows`, row-major.
    pub data: Vec<f64>,
    /// All singular values, descending.
    pub singular_values: Vec<f64>,
    /// Number of singular values retained.
    pub rank: usize,
}

pub trait PseudoInverseBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pseudo-inverse of the `rows x cols` row-major `matrix`.
    fn pseudo_inverse(
        &self,
        matrix: &[f64],
        rows: usize,
        cols: usize,
        options: &SvdOptions,
    ) -> CalibResult<PseudoInverse>;
}

fn retained(singular_values: &[f64], truncation: f64) -> Vec<usize> {
    let s_max = singular_values.iter().copied().fold(0.0f64, f64::max);
    let cutoff = truncation * s_max;
    let mut kept: Vec<usize> = (0..singular_values.len())
        .filter(|&k| singular_values[k] > 0.0 && singular_values[k] >= cutoff)
        .collect();
    kept.sort_unstable_by(|&a, &b| singular_values[b].total_cmp(&singular_values[a]));
    kept
}

/// CPU decomposition through nalgebra.
#[derive(Clone, Copy, Debug, Default)]
pub struct NalgebraSvd;

impl PseudoInverseBackend for NalgebraSvd {
    fn name(&self) -> &'static str {
        "nalgebra"
    }

    fn pseudo_inverse(
        &self,
        matrix: &[f64],
        rows: usize,
        cols: usize,
        options: &SvdOptions,
    ) -> CalibResult<PseudoInverse> {
        let m = DMatrix::from_row_slice(rows, cols, matrix);
        let svd = SVD::try_new(m, true, true, f64::EPSILON, options.max_iterations).ok_or(
            CalibError::Decomposition {
                rows,
                cols,
                max_iterations: options.max_iterations,
            },
        )?;
        let missing = || CalibError::Backend {
            backend: "nalgebra",
            message: "singular vectors were not computed".to_string(),
        };
        let u = svd.u.as_ref().ok_or_else(missing)?;
        let v_t = svd.v_t.as_ref().ok_or_else(missing)?;
        let singular: Vec<f64> = svd.singular_values.iter().copied().collect();
        let kept = retained(&singular, options.truncation);

        // pinv = V_r Σ_r⁻¹ U_rᵀ
        let mut v_scaled = DMatrix::<f64>::zeros(cols, kept.len());
        let mut u_r = DMatrix::<f64>::zeros(rows, kept.len());
        for (j, &k) in kept.iter().enumerate() {
            v_scaled.set_column(j, &(v_t.row(k).transpose() / singular[k]));
            u_r.set_column(j, &u.column(k));
        }
        let pinv = v_scaled * u_r.transpose();

        let mut singular_values = singular;
        singular_values.sort_unstable_by(|a, b| b.total_cmp(a));
        Ok(PseudoInverse {
            // Column-major storage of the transpose is the row-major pinv.
            data: pinv.transpose().as_slice().to_vec(),
            singular_values,
            rank: kept.len(),
        })
    }
}

/// Accelerated decomposition through faer. faer has no iteration cap, so
/// `max_iterations` is ignored on this path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FaerSvd;

impl PseudoInverseBackend for FaerSvd {
    fn name(&self) -> &'static str {
        "faer"
    }

    fn pseudo_inverse(
        &self,
        matrix: &[f64],
        rows: usize,
        cols: usize,
        options: &SvdOptions,
    ) -> CalibResult<PseudoInverse> {
        faer_svd::pseudo_inverse(matrix, rows, cols, options.truncation).map_err(|message| {
            CalibError::Backend {
                backend: "faer",
                message,
            }
        })
    }
}

#[cfg(feature = "faer")]
mod faer_svd {
    use super::{retained, PseudoInverse};
    use faer::mat;

    pub fn is_available() -> bool {
        true
    }

    pub fn pseudo_inverse(
        matrix: &[f64],
        rows: usize,
        cols: usize,
        truncation: f64,
    ) -> Result<PseudoInverse, String> {
        let view = mat::from_row_major_slice::<f64>(matrix, rows, cols);
        let svd = view.thin_svd();
        let (u, s, v) = (svd.u(), svd.s_diagonal(), svd.v());
        let singular: Vec<f64> = (0..s.nrows()).map(|k| s.read(k)).collect();
        if singular.iter().any(|v| !v.is_finite()) {
            return Err("decomposition produced non-finite singular values".to_string());
        }
        let kept = retained(&singular, truncation);

        let mut data = vec![0.0f64; cols * rows];
        for (j, row) in data.chunks_mut(rows).enumerate() {
            for &k in &kept {
                let scale = v.read(j, k) / singular[k];
                for (i, out) in row.iter_mut().enumerate() {
                    *out += scale * u.read(i, k);
                }
            }
        }

        let mut singular_values = singular;
        singular_values.sort_unstable_by(|a, b| b.total_cmp(a));
        Ok(PseudoInverse {
            data,
            singular_values,
            rank: kept.len(),
        })
    }
}

#[cfg(not(feature = "faer"))]
mod faer_svd {
    use super::PseudoInverse;

    pub fn is_available() -> bool {
        false
    }

    pub fn pseudo_inverse(
        _matrix: &[f64],
        rows: usize,
        cols: usize,
        _truncation: f64,
    ) -> Result<PseudoInverse, String> {
        Err(format!(
            "faer backend disabled at compile time (requested {rows}x{cols} decomposition)"
        ))
    }
}

/// Synthesised control matrix and the spectrum it was built from.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlMatrix {
    /// `[NBpoke, P]`.
    pub matrix: NamedArray,
    pub singular_values: Vec<f64>,
    pub rank: usize,
}

pub struct ControlMatrixSynthesizer {
    options: SvdOptions,
    backend: Box<dyn PseudoInverseBackend>,
}

impl fmt::Debug for ControlMatrixSynthesizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlMatrixSynthesizer")
            .field("options", &self.options)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl ControlMatrixSynthesizer {
    pub fn new(options: SvdOptions, choice: BackendChoice) -> CalibResult<Self> {
        options.validate()?;
        Ok(Self {
            options,
            backend: choice.resolve()?,
        })
    }

    /// Uses a caller-provided backend.
    pub fn with_backend(options: SvdOptions, backend: Box<dyn PseudoInverseBackend>) -> CalibResult<Self> {
        options.validate()?;
        Ok(Self { options, backend })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Builds the control matrix of a `[NBpoke, H, W]` (or `[NBpoke, P]`)
    /// response matrix.
    pub fn synthesize(&self, response: &NamedArray) -> CalibResult<ControlMatrix> {
        if let Some((index, value)) = response.first_non_finite() {
            return Err(CalibError::NonFinite {
                label: "response matrix",
                index,
                value,
            });
        }
        if !matches!(response.rank(), 2 | 3) {
            return Err(CalibError::ShapeMismatch {
                context: "response matrix rank",
                expected: vec![3],
                got: vec![response.rank()],
            });
        }
        let nb_poke = response.dim(0);
        let pixels = response.len() / nb_poke;
        let _span = tracing::info_span!("control_matrix", nb_poke, pixels).entered();

        // Rᵀ is `pixels x nb_poke`.
        let data = response.as_slice();
        let mut transposed = vec![0.0f64; pixels * nb_poke];
        for (poke, row) in data.chunks(pixels).enumerate() {
            for (pixel, &value) in row.iter().enumerate() {
                transposed[pixel * nb_poke + poke] = f64::from(value);
            }
        }

        let pinv = self
            .backend
            .pseudo_inverse(&transposed, pixels, nb_poke, &self.options)?;
        debug!(
            backend = self.backend.name(),
            rank = pinv.rank,
            modes = pinv.singular_values.len(),
            "pseudo-inverse computed"
        );
        if pinv.rank < pinv.singular_values.len() {
            info!(
                rank = pinv.rank,
                modes = pinv.singular_values.len(),
                truncation = self.options.truncation,
                "weak modes discarded"
            );
        }

        let matrix = pinv.data.iter().map(|&v| v as f32).collect();
        Ok(ControlMatrix {
            matrix: NamedArray::from_vec(&[nb_poke, pixels], matrix)?,
            singular_values: pinv.singular_values,
            rank: pinv.rank,
        })
    }
}
