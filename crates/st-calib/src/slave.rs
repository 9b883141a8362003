// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Nearest-valid-neighbour search for actuators outside the DM mask.
//!
//! Every invalid actuator looks for the closest valid actuator strictly
//! inside the search radius. The resulting map holds that distance, and 0
//! both for valid actuators and for actuators with no neighbour in range.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalibError, CalibResult};
use crate::mask::is_valid;
use crate::store::NamedArray;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// Neighbours must lie strictly closer than this, in actuator pitches.
    pub search_radius: f32,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self { search_radius: 3.0 }
    }
}

impl SlaveConfig {
    pub fn validate(&self) -> CalibResult<()> {
        validate_radius(self.search_radius)
    }
}

fn validate_radius(radius: f32) -> CalibResult<()> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(CalibError::invalid(
            "slave.search_radius",
            format!("must be finite and positive, got {radius}"),
        ));
    }
    Ok(())
}

/// Invalid actuator driven from its nearest valid neighbour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlaveAssignment {
    /// `(x, y)` of the invalid actuator.
    pub slave: (usize, usize),
    /// `(x, y)` of the nearest valid actuator.
    pub master: (usize, usize),
    pub distance: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SlaveMap {
    map: NamedArray,
    assignments: Vec<SlaveAssignment>,
}

impl SlaveMap {
    /// Solves the map over a `[ysize, xsize]` actuator mask.
    pub fn solve(mask: &NamedArray, search_radius: f32) -> CalibResult<Self> {
        validate_radius(search_radius)?;
        if mask.rank() != 2 {
            return Err(CalibError::ShapeMismatch {
                context: "actuator mask rank",
                expected: vec![2],
                got: vec![mask.rank()],
            });
        }
        let (ysize, xsize) = (mask.dim(0), mask.dim(1));
        let sentinel = (xsize + ysize) as f32;
        let cutoff = ((xsize + ysize) / 2) as f32;
        let reach = search_radius.ceil() as usize + 1;
        let valid = mask.as_slice();

        let mut data = vec![sentinel; xsize * ysize];
        let per_row: Vec<Vec<SlaveAssignment>> = data
            .par_chunks_mut(xsize)
            .enumerate()
            .map(|(y, row)| {
                let mut found = Vec::new();
                for (x, cell) in row.iter_mut().enumerate() {
                    if is_valid(valid[y * xsize + x]) {
                        continue;
                    }
                    let mut master = None;
                    for x1 in x.saturating_sub(reach)..(x + reach + 1).min(xsize) {
                        for y1 in y.saturating_sub(reach)..(y + reach + 1).min(ysize) {
                            if !is_valid(valid[y1 * xsize + x1]) {
                                continue;
                            }
                            let dx = x1 as f32 - x as f32;
                            let dy = y1 as f32 - y as f32;
                            let r = (dx * dx + dy * dy).sqrt();
                            if r < search_radius && r < *cell {
                                *cell = r;
                                master = Some((x1, y1));
                            }
                        }
                    }
                    if let Some(master) = master {
                        found.push(SlaveAssignment {
                            slave: (x, y),
                            master,
                            distance: *cell,
                        });
                    }
                }
                for cell in row.iter_mut() {
                    if *cell > cutoff {
                        *cell = 0.0;
                    }
                }
                found.retain(|a| a.distance <= cutoff);
                found
            })
            .collect();

        let assignments: Vec<SlaveAssignment> = per_row.into_iter().flatten().collect();
        debug!(
            xsize,
            ysize,
            slaved = assignments.len(),
            "slave map solved"
        );
        Ok(Self {
            map: NamedArray::from_vec(&[ysize, xsize], data)?,
            assignments,
        })
    }

    /// Distance map `[ysize, xsize]`.
    pub fn map(&self) -> &NamedArray {
        &self.map
    }

    pub fn into_map(self) -> NamedArray {
        self.map
    }

    /// Slaved actuators in row-major scan order.
    pub fn assignments(&self) -> &[SlaveAssignment] {
        &self.assignments
    }
}
