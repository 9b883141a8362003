// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Mask-weighted flux bookkeeping for reference maps and response matrices.

use std::fs;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{CalibError, CalibResult};
use crate::store::NamedArray;

/// Weighted flux of one poke plane before and after neutralisation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FluxAudit {
    pub poke: usize,
    pub before: f64,
    pub after: f64,
}

/// Neutralised response together with its per-poke audit trail.
#[derive(Clone, Debug, PartialEq)]
pub struct NeutralizedResponse {
    pub response: NamedArray,
    pub audits: Vec<FluxAudit>,
}

fn weighted_sum(values: &[f32], mask: &[f32]) -> f64 {
    values
        .iter()
        .zip(mask)
        .map(|(&v, &m)| f64::from(v) * f64::from(m))
        .sum()
}

fn usable_total(label: &'static str, total: f64) -> CalibResult<f64> {
    if total == 0.0 || !total.is_finite() {
        return Err(CalibError::DegenerateMask { label, total });
    }
    Ok(total)
}

/// Scales `reference` so that its mask-weighted sum is one.
pub fn normalize_reference(reference: &NamedArray, mask: &NamedArray) -> CalibResult<NamedArray> {
    reference.expect_shape("reference map vs mask", mask.shape())?;
    let total = usable_total(
        "reference normalisation",
        weighted_sum(reference.as_slice(), mask.as_slice()),
    )?;
    let data = reference
        .as_slice()
        .iter()
        .map(|&v| (f64::from(v) / total) as f32)
        .collect();
    debug!(total, "reference normalised");
    NamedArray::from_vec(reference.shape(), data)
}

/// Removes the mask-weighted mean flux from every poke plane.
///
/// For each poke the weighted total `t` is taken out proportionally to the
/// mask, `r[i] -= t * m[i] / sum(m)`, leaving a weighted total near zero.
pub fn neutralize(response: &NamedArray, mask: &NamedArray) -> CalibResult<NeutralizedResponse> {
    if response.rank() != 3 {
        return Err(CalibError::ShapeMismatch {
            context: "response matrix rank",
            expected: vec![3],
            got: vec![response.rank()],
        });
    }
    mask.expect_shape("response plane vs mask", &response.shape()[1..])?;
    let weights = mask.as_slice();
    let mask_total = usable_total(
        "flux neutralisation",
        weights.iter().map(|&m| f64::from(m)).sum(),
    )?;

    let mut data = response.as_slice().to_vec();
    let audits: Vec<FluxAudit> = data
        .par_chunks_mut(response.plane_len())
        .enumerate()
        .map(|(poke, plane)| {
            let before = weighted_sum(plane, weights);
            for (value, &m) in plane.iter_mut().zip(weights) {
                *value = (f64::from(*value) - before * f64::from(m) / mask_total) as f32;
            }
            FluxAudit {
                poke,
                before,
                after: weighted_sum(plane, weights),
            }
        })
        .collect();

    Ok(NeutralizedResponse {
        response: NamedArray::from_vec(response.shape(), data)?,
        audits,
    })
}

/// Writes one line per poke: index, poke count, flux before and after.
pub fn write_audit_log(path: &Path, audits: &[FluxAudit], nb_poke: usize) -> CalibResult<()> {
    let text: String = audits
        .iter()
        .map(|audit| {
            format!(
                "{:6} {:06} {:20.6} {:20.6}\n",
                audit.poke, nb_poke, audit.before, audit.after
            )
        })
        .collect();
    fs::write(path, text).map_err(|err| CalibError::io(path, err))?;
    info!(path = %path.display(), pokes = audits.len(), "flux audit written");
    Ok(())
}
