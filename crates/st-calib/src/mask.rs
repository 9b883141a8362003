// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Validity masks over sensor pixels and actuators.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalibError, CalibResult};
use crate::numerics::percentile;
use crate::sensitivity::SensitivityMaps;
use crate::store::NamedArray;

/// Mask elements at or above this value are valid.
pub const VALID_THRESHOLD: f32 = 0.5;

#[inline]
pub fn is_valid(value: f32) -> bool {
    value >= VALID_THRESHOLD
}

/// Percentile pair that places the cut for one map.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskBand {
    pub perc_low: f32,
    pub coeff_low: f32,
    pub perc_high: f32,
    pub coeff_high: f32,
}

impl MaskBand {
    pub const fn new(perc_low: f32, coeff_low: f32, perc_high: f32, coeff_high: f32) -> Self {
        Self {
            perc_low,
            coeff_low,
            perc_high,
            coeff_high,
        }
    }

    fn validate(&self, label: &'static str) -> CalibResult<()> {
        let in_unit = |p: f32| (0.0..=1.0).contains(&p);
        if !in_unit(self.perc_low) || !in_unit(self.perc_high) {
            return Err(CalibError::invalid(
                label,
                format!(
                    "percentiles must lie in [0, 1], got {} and {}",
                    self.perc_low, self.perc_high
                ),
            ));
        }
        if !self.coeff_low.is_finite() || !self.coeff_high.is_finite() {
            return Err(CalibError::invalid(label, "coefficients must be finite"));
        }
        Ok(())
    }
}

/// Tunables handed to the mask generator unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskParams {
    pub dm: MaskBand,
    pub wfs: MaskBand,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self {
            dm: MaskBand::new(0.2, 1.0, 0.7, 0.3),
            wfs: MaskBand::new(0.05, 1.0, 0.65, 0.3),
        }
    }
}

impl MaskParams {
    pub fn validate(&self) -> CalibResult<()> {
        self.dm.validate("mask.dm")?;
        self.wfs.validate("mask.wfs")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MaskPair {
    /// Sensor-space mask, shaped like the WFS map.
    pub wfs: NamedArray,
    /// Actuator-space mask, shaped like the DM map.
    pub dm: NamedArray,
}

impl MaskPair {
    /// Number of valid pixels and valid actuators.
    pub fn valid_counts(&self) -> (usize, usize) {
        let count = |mask: &NamedArray| mask.as_slice().iter().filter(|&&v| is_valid(v)).count();
        (count(&self.wfs), count(&self.dm))
    }
}

/// Derives validity masks from a response matrix and its sensitivity maps.
pub trait MaskGenerator: Send + Sync {
    fn derive_masks(
        &self,
        response: &NamedArray,
        maps: &SensitivityMaps,
        params: &MaskParams,
    ) -> CalibResult<MaskPair>;
}

/// Thresholds each sensitivity map at a blend of two of its percentiles.
#[derive(Clone, Copy, Debug, Default)]
pub struct PercentileMaskGenerator;

impl PercentileMaskGenerator {
    fn threshold_map(map: &NamedArray, band: &MaskBand) -> CalibResult<NamedArray> {
        let mut sorted = map.as_slice().to_vec();
        sorted.sort_unstable_by(f32::total_cmp);
        let threshold = band.coeff_low * percentile(&sorted, band.perc_low)
            + band.coeff_high * percentile(&sorted, band.perc_high);
        let data = map
            .as_slice()
            .iter()
            .map(|&v| if v > threshold { 1.0 } else { 0.0 })
            .collect();
        NamedArray::from_vec(map.shape(), data)
    }
}

impl MaskGenerator for PercentileMaskGenerator {
    fn derive_masks(
        &self,
        response: &NamedArray,
        maps: &SensitivityMaps,
        params: &MaskParams,
    ) -> CalibResult<MaskPair> {
        params.validate()?;
        maps.wfs.expect_shape("wfs sensitivity map", &response.shape()[1..])?;
        let pair = MaskPair {
            wfs: Self::threshold_map(&maps.wfs, &params.wfs)?,
            dm: Self::threshold_map(&maps.dm, &params.dm)?,
        };
        let (wfs_valid, dm_valid) = pair.valid_counts();
        debug!(wfs_valid, dm_valid, "masks derived");
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_separates_bright_from_dark() {
        let wfs = NamedArray::from_vec(&[2, 5], vec![0.0, 0.1, 0.2, 5.0, 6.0, 7.0, 8.0, 9.0, 0.05, 0.0]).unwrap();
        let dm = NamedArray::from_vec(&[4], vec![1.0, 10.0, 10.0, 10.0]).unwrap();
        let response = NamedArray::zeros(&[4, 2, 5]).unwrap();
        let maps = SensitivityMaps { dm, wfs };
        let masks = PercentileMaskGenerator
            .derive_masks(&response, &maps, &MaskParams::default())
            .unwrap();
        // wfs: P(0.05) = 0, P(0.65) = 6 -> threshold 1.8.
        assert_eq!(
            masks.wfs.as_slice(),
            &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]
        );
        // dm: P(0.2) = 1, P(0.7) = 10 -> threshold 4.
        assert_eq!(masks.dm.as_slice(), &[0.0, 1.0, 1.0, 1.0]);
        assert_eq!(masks.valid_counts(), (5, 3));
    }

    #[test]
    fn percentiles_outside_unit_interval_are_rejected() {
        let params = MaskParams {
            dm: MaskBand::new(-0.1, 1.0, 0.7, 0.3),
            ..MaskParams::default()
        };
        assert!(params.validate().is_err());
        assert!(MaskParams::default().validate().is_ok());
    }

    #[test]
    fn validity_threshold_is_inclusive() {
        assert!(is_valid(0.5));
        assert!(!is_valid(0.49));
    }
}
