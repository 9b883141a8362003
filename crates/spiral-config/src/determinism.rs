// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide reproducibility switches for calibration runs.
//!
//! Calibration reductions are embarrassingly parallel, but floating point
//! summation order still depends on how work is chunked across workers. When
//! `SPIRAL_CALIB_DETERMINISTIC` is set the worker pool collapses to a single
//! thread so repeated runs produce bit-identical matrices.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Snapshot of the reproducibility switches read from the environment.
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-label seeds for synthetic data.
    pub base_seed: u64,
    /// Reductions must run on a single worker so summation order is fixed.
    pub fix_reduction: bool,
    /// Explicit worker count requested through `SPIRAL_CALIB_THREADS`.
    pub worker_threads: Option<usize>,
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let enabled = std::env::var("SPIRAL_CALIB_DETERMINISTIC")
            .ok()
            .map(|v| !is_falsy(&v))
            .unwrap_or(false);

        let base_seed = std::env::var("SPIRAL_CALIB_SEED")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(42);

        let fix_reduction = std::env::var("SPIRAL_CALIB_FIX_REDUCTION")
            .ok()
            .map(|v| !is_falsy(&v))
            .unwrap_or(enabled);

        let worker_threads = std::env::var("SPIRAL_CALIB_THREADS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0);

        Self {
            enabled,
            base_seed,
            fix_reduction,
            worker_threads,
        }
    }

    /// Derives a stable seed for a given label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }

    /// Resolves the worker count for a pool, given the count requested by
    /// the caller's own configuration (`None` lets rayon decide).
    pub fn resolve_workers(&self, requested: Option<usize>) -> Option<usize> {
        if self.enabled && self.fix_reduction {
            return Some(1);
        }
        self.worker_threads.or(requested.filter(|&n| n > 0))
    }
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: 42,
            fix_reduction: false,
            worker_threads: None,
        }
    }
}

fn is_falsy(raw: &str) -> bool {
    matches!(
        raw.trim(),
        "" | "0" | "false" | "False" | "FALSE" | "off" | "OFF"
    )
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Seeded generator for a label, e.g. synthetic frames in tests and
/// dry runs. Always seeded, so the same label yields the same stream.
pub fn rng_from_label(label: &str) -> StdRng {
    StdRng::seed_from_u64(config().seed_for(label))
}
