// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! TOML configuration of a calibration run.
//!
//! Every section is optional; missing keys fall back to their defaults.
//!
//! ```toml
//! [combiner]
//! trim_fraction = 0.2
//! poke_amplitude = 0.05
//!
//! [control]
//! truncation = 1e-3
//! backend = "cpu"
//!
//! [runtime]
//! worker_threads = 4
//! actuator_grid = [50, 50]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::combiner::CombinerConfig;
use crate::control::{BackendChoice, SvdOptions};
use crate::ensemble::EnsembleConfig;
use crate::error::{CalibError, CalibResult};
use crate::mask::MaskParams;
use crate::slave::SlaveConfig;

/// Store names of the arrays a run reads and produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayNames {
    pub response: String,
    pub reference: String,
    pub wfs_map: String,
    pub dm_map: String,
    pub wfs_mask: String,
    pub dm_mask: String,
    pub transform: String,
    pub index_map: String,
    pub poke_command: String,
    pub poke_command_decoded: String,
    /// Temporary name used while decoding in place.
    pub scratch: String,
    pub control_matrix: String,
    pub slave_map: String,
}

impl Default for ArrayNames {
    fn default() -> Self {
        Self {
            response: "zrespm".into(),
            reference: "wfsref0".into(),
            wfs_map: "wfsmap".into(),
            dm_map: "dmmap".into(),
            wfs_mask: "wfsmask".into(),
            dm_mask: "dmmask".into(),
            transform: "Hmat".into(),
            index_map: "pixindexim".into(),
            poke_command: "RMpokeC".into(),
            poke_command_decoded: "RMpokeC1".into(),
            scratch: "tmprm".into(),
            control_matrix: "cmat".into(),
            slave_map: "dmslaved".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub truncation: f64,
    pub max_iterations: usize,
    pub backend: BackendChoice,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let svd = SvdOptions::default();
        Self {
            truncation: svd.truncation,
            max_iterations: svd.max_iterations,
            backend: BackendChoice::default(),
        }
    }
}

impl ControlConfig {
    pub fn svd_options(&self) -> SvdOptions {
        SvdOptions {
            truncation: self.truncation,
            max_iterations: self.max_iterations,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads of the pipeline pool; `None` lets rayon decide.
    pub worker_threads: Option<usize>,
    /// `[ysize, xsize]` of the actuator grid the DM map is laid out on.
    pub actuator_grid: Option<[usize; 2]>,
    /// Per-poke flux audit log.
    pub audit_log: Option<PathBuf>,
    /// Snapshot of the encoded response, written before decoding.
    pub encoded_archive: Option<PathBuf>,
}

/// Complete configuration of a calibration run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibConfig {
    pub ensemble: EnsembleConfig,
    pub combiner: CombinerConfig,
    pub mask: MaskParams,
    pub control: ControlConfig,
    pub slave: SlaveConfig,
    pub names: ArrayNames,
    pub runtime: RuntimeConfig,
}

impl CalibConfig {
    pub fn from_toml_str(text: &str) -> CalibResult<Self> {
        let config: CalibConfig = toml::from_str(text).map_err(CalibError::serde)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> CalibResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| CalibError::io(path, err))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> CalibResult<String> {
        toml::to_string_pretty(self).map_err(CalibError::serde)
    }

    pub fn validate(&self) -> CalibResult<()> {
        self.combiner.validate()?;
        self.mask.validate()?;
        self.control.svd_options().validate()?;
        self.slave.validate()?;
        if self.runtime.worker_threads == Some(0) {
            return Err(CalibError::invalid(
                "runtime.worker_threads",
                "must be positive when set",
            ));
        }
        if let Some([ysize, xsize]) = self.runtime.actuator_grid {
            if ysize == 0 || xsize == 0 {
                return Err(CalibError::invalid(
                    "runtime.actuator_grid",
                    format!("grid axes must be non-empty, got [{ysize}, {xsize}]"),
                ));
            }
        }
        let names = &self.names;
        if names.scratch == names.response {
            return Err(CalibError::invalid(
                "names.scratch",
                "must differ from the response name",
            ));
        }
        Ok(())
    }

    /// File stem of the ensemble members.
    pub fn ensemble_base(&self) -> &str {
        self.ensemble.base.as_deref().unwrap_or(self.names.response.as_str())
    }
}
