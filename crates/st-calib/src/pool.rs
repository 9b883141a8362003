// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Worker pool the calibration stages run inside.

use rayon::{ThreadPool, ThreadPoolBuilder};
use spiral_config::determinism;
use tracing::debug;

use crate::error::{CalibError, CalibResult};

/// Fixed-size rayon pool every calibration stage runs inside.
///
/// The process-wide determinism settings take precedence over the requested
/// size, so a locked reduction order always yields a single worker.
#[derive(Debug)]
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(requested: Option<usize>) -> CalibResult<Self> {
        let threads = determinism::config().resolve_workers(requested);
        let mut builder = ThreadPoolBuilder::new().thread_name(|idx| format!("st-calib-{idx}"));
        if let Some(threads) = threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|err| CalibError::WorkerPool(err.to_string()))?;
        debug!(threads = pool.current_num_threads(), "worker pool ready");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` with this pool as the current rayon pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}
