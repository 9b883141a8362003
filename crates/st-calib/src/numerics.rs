// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scalar kernels shared by the reduction stages.

use tracing::warn;

use crate::error::{CalibError, CalibResult};

/// Replaces every non-finite element of a poke plane by zero.
///
/// Each replacement is reported individually; the return value is the number
/// of replaced elements.
pub fn sanitize_plane(plane: &mut [f32], array: &'static str, member: usize, poke: usize) -> usize {
    let mut replaced = 0;
    for (pixel, value) in plane.iter_mut().enumerate() {
        if !value.is_finite() {
            warn!(array, member, poke, pixel, value = %*value, "non-finite sample replaced by 0");
            *value = 0.0;
            replaced += 1;
        }
    }
    replaced
}

/// Number of samples dropped from each end of a sorted window.
pub fn trim_band(samples: usize, fraction: f64) -> usize {
    (fraction * samples as f64).floor() as usize
}

/// Fails unless trimming `band` from both ends of `samples` values leaves at
/// least one sample.
pub fn check_trim_window(samples: usize, band: usize) -> CalibResult<()> {
    if samples <= band.saturating_mul(2) {
        return Err(CalibError::EmptyTrimWindow { samples, band });
    }
    Ok(())
}

/// Mean of `samples` after sorting and dropping `band` values at each end.
///
/// The slice is sorted in place. Accumulation happens in `f64`.
pub fn trimmed_mean(samples: &mut [f32], band: usize) -> CalibResult<f64> {
    check_trim_window(samples.len(), band)?;
    samples.sort_unstable_by(f32::total_cmp);
    let kept = &samples[band..samples.len() - band];
    let sum: f64 = kept.iter().map(|&v| f64::from(v)).sum();
    Ok(sum / kept.len() as f64)
}

/// Fallibly reserves a scratch buffer of `len` elements.
pub(crate) fn scratch_buffer(len: usize) -> Option<Vec<f32>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).ok()?;
    Some(buffer)
}

/// Value at fraction `p` of the sorted samples (nearest rank, clamped).
pub fn percentile(sorted: &[f32], p: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let last = sorted.len() - 1;
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f32) as usize;
    sorted[rank.min(last)]
}
