// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Robust combination of repeated push-pull measurements.
//!
//! Every ensemble member is demodulated on its own (sanitise, optional flux
//! normalisation, half difference and half sum), then the members are folded
//! into a single response matrix and reference map with trimmed means. Poke
//! planes are independent, so each stage fans out over pokes or pixels on the
//! current rayon pool.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ensemble::{EnsembleLayout, PushPullFrames};
use crate::error::{CalibError, CalibResult};
use crate::io::ArrayIo;
use crate::numerics::{check_trim_window, sanitize_plane, scratch_buffer, trim_band, trimmed_mean};
use crate::store::NamedArray;

/// Smallest ensemble that still allows outlier rejection.
pub const MIN_ENSEMBLE_MEMBERS: usize = 3;

/// Tunables of the cross-ensemble reduction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinerConfig {
    pub min_members: usize,
    /// Fraction of sorted samples discarded at each end, in `[0, 0.5)`.
    pub trim_fraction: f64,
    /// Divide every frame by its own total flux before demodulation.
    pub normalize_flux: bool,
    /// Poke amplitude the combined response is divided by.
    pub poke_amplitude: f32,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            min_members: MIN_ENSEMBLE_MEMBERS,
            trim_fraction: 0.2,
            normalize_flux: true,
            poke_amplitude: 1.0,
        }
    }
}

impl CombinerConfig {
    pub fn validate(&self) -> CalibResult<()> {
        if self.min_members < MIN_ENSEMBLE_MEMBERS {
            return Err(CalibError::invalid(
                "combiner.min_members",
                format!("must be at least {MIN_ENSEMBLE_MEMBERS}, got {}", self.min_members),
            ));
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(CalibError::invalid(
                "combiner.trim_fraction",
                format!("must lie in [0, 0.5), got {}", self.trim_fraction),
            ));
        }
        if !self.poke_amplitude.is_finite() || self.poke_amplitude == 0.0 {
            return Err(CalibError::invalid(
                "combiner.poke_amplitude",
                format!("must be finite and non-zero, got {}", self.poke_amplitude),
            ));
        }
        Ok(())
    }
}

/// Demodulated view of one ensemble member.
#[derive(Clone, Debug, PartialEq)]
pub struct DemodulatedMember {
    /// Half difference of the frames, `[NBpoke, H, W]`.
    pub response: NamedArray,
    /// Half sum of the frames, `[NBpoke, H, W]`.
    pub reference: NamedArray,
    /// Elements replaced by zero while demodulating.
    pub sanitized: usize,
}

/// Output of the cross-ensemble reduction.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedResponse {
    /// `[NBpoke, H, W]`, already divided by the poke amplitude.
    pub response: NamedArray,
    /// `[H, W]`.
    pub reference: NamedArray,
    pub members: usize,
    pub sanitized: usize,
}

#[derive(Clone, Debug, Default)]
pub struct RobustCombiner {
    config: CombinerConfig,
}

impl RobustCombiner {
    pub fn new(config: CombinerConfig) -> CalibResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// Demodulates one member. The input frames are left untouched.
    pub fn demodulate(&self, frames: &PushPullFrames, member: usize) -> CalibResult<DemodulatedMember> {
        let PushPullFrames { positive, negative } = frames;
        if positive.rank() != 3 {
            return Err(CalibError::ShapeMismatch {
                context: "push-pull frame rank",
                expected: vec![3],
                got: vec![positive.rank()],
            });
        }
        negative.expect_shape("negative frame", positive.shape())?;

        let plane = positive.plane_len();
        let normalize = self.config.normalize_flux;
        let mut pos = positive.as_slice().to_vec();
        let mut neg = negative.as_slice().to_vec();
        let mut response = vec![0.0f32; pos.len()];
        let mut reference = vec![0.0f32; pos.len()];

        let sanitized: usize = pos
            .par_chunks_mut(plane)
            .zip(neg.par_chunks_mut(plane))
            .zip(response.par_chunks_mut(plane))
            .zip(reference.par_chunks_mut(plane))
            .enumerate()
            .map(|(poke, (((pos, neg), resp), refc))| {
                let mut replaced = sanitize_plane(pos, "positive", member, poke);
                replaced += sanitize_plane(neg, "negative", member, poke);
                if normalize {
                    normalize_by_flux(pos, "positive", member, poke);
                    normalize_by_flux(neg, "negative", member, poke);
                }
                for (((r, c), &p), &n) in resp.iter_mut().zip(refc.iter_mut()).zip(pos.iter()).zip(neg.iter()) {
                    *r = 0.5 * (p - n);
                    *c = 0.5 * (p + n);
                }
                replaced += sanitize_plane(resp, "response", member, poke);
                replaced += sanitize_plane(refc, "reference", member, poke);
                replaced
            })
            .sum();

        let shape = positive.shape();
        Ok(DemodulatedMember {
            response: NamedArray::from_vec(shape, response)?,
            reference: NamedArray::from_vec(shape, reference)?,
            sanitized,
        })
    }

    /// Folds demodulated members into the combined response and reference.
    ///
    /// The response band is derived from the member count, the reference band
    /// from the member count times the poke count.
    pub fn combine(&self, members: &[DemodulatedMember]) -> CalibResult<CombinedResponse> {
        let count = members.len();
        if count < self.config.min_members {
            return Err(CalibError::InsufficientEnsembles {
                found: count,
                minimum: self.config.min_members,
            });
        }
        let first = &members[0].response;
        let shape = first.shape().to_vec();
        for member in members {
            member.response.expect_shape("ensemble member response", &shape)?;
            member.reference.expect_shape("ensemble member reference", &shape)?;
        }

        let nb_poke = first.plane_count();
        let plane = first.plane_len();
        let response_band = trim_band(count, self.config.trim_fraction);
        let reference_samples = count * nb_poke;
        let reference_band = trim_band(reference_samples, self.config.trim_fraction);
        check_trim_window(count, response_band)?;
        check_trim_window(reference_samples, reference_band)?;

        let amplitude = f64::from(self.config.poke_amplitude);
        let mut response = vec![0.0f32; nb_poke * plane];
        response
            .par_chunks_mut(plane)
            .enumerate()
            .try_for_each_init(
                || scratch_buffer(count),
                |scratch, (poke, out)| {
                    let scratch = scratch.as_mut().ok_or(CalibError::Allocation {
                        label: "response",
                        requested: count,
                    })?;
                    let offset = poke * plane;
                    for (pixel, value) in out.iter_mut().enumerate() {
                        scratch.clear();
                        scratch.extend(members.iter().map(|m| m.response.as_slice()[offset + pixel]));
                        *value = (trimmed_mean(scratch, response_band)? / amplitude) as f32;
                    }
                    Ok::<(), CalibError>(())
                },
            )?;

        let mut reference = vec![0.0f32; plane];
        reference.par_iter_mut().enumerate().try_for_each_init(
            || scratch_buffer(reference_samples),
            |scratch, (pixel, value)| {
                let scratch = scratch.as_mut().ok_or(CalibError::Allocation {
                    label: "reference",
                    requested: reference_samples,
                })?;
                scratch.clear();
                for poke in 0..nb_poke {
                    let idx = poke * plane + pixel;
                    scratch.extend(members.iter().map(|m| m.reference.as_slice()[idx]));
                }
                *value = trimmed_mean(scratch, reference_band)? as f32;
                Ok::<(), CalibError>(())
            },
        )?;

        let sanitized = members.iter().map(|m| m.sanitized).sum();
        debug!(
            members = count,
            nb_poke, response_band, reference_band, "ensemble combined"
        );
        Ok(CombinedResponse {
            response: NamedArray::from_vec(&shape, response)?,
            reference: NamedArray::from_vec(&shape[1..], reference)?,
            members: count,
            sanitized,
        })
    }

    /// Loads the ensemble described by `layout` and combines it.
    ///
    /// Every member is read completely before any reduction starts; raw
    /// frames are dropped as soon as they are demodulated.
    pub fn combine_files(&self, layout: &EnsembleLayout, io: &dyn ArrayIo) -> CalibResult<CombinedResponse> {
        let count = layout.read_count(self.config.min_members)?;
        info!(base = layout.base(), members = count, "combining ensemble");
        let mut members = Vec::with_capacity(count);
        for index in 0..count {
            let frames = layout.load_member(io, index)?;
            members.push(self.demodulate(&frames, index)?);
        }
        self.combine(&members)
    }
}

fn normalize_by_flux(plane: &mut [f32], array: &'static str, member: usize, poke: usize) {
    let flux: f64 = plane.iter().map(|&v| f64::from(v)).sum();
    if flux == 0.0 {
        warn!(array, member, poke, "zero total flux; normalised plane will be sanitised");
    }
    for value in plane.iter_mut() {
        *value = (f64::from(*value) / flux) as f32;
    }
}
