// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Energy maps of a response matrix in actuator space and sensor space.

use ndarray::{Array1, ArrayView2};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{CalibError, CalibResult};
use crate::store::NamedArray;

/// Per-actuator and per-pixel sums of squared responses.
#[derive(Clone, Debug, PartialEq)]
pub struct SensitivityMaps {
    /// One value per poke, on the actuator grid when one is configured.
    pub dm: NamedArray,
    /// One value per sensor pixel, `[H, W]`.
    pub wfs: NamedArray,
}

impl SensitivityMaps {
    /// Computes both maps without touching `response`.
    ///
    /// `actuator_grid` is `[ysize, xsize]`; when given, the poke count must
    /// equal the number of grid cells.
    pub fn compute(response: &NamedArray, actuator_grid: Option<[usize; 2]>) -> CalibResult<Self> {
        let rows = response_rows(response)?;
        let (nb_poke, plane) = rows.dim();

        let dm_shape = match actuator_grid {
            Some([ysize, xsize]) => {
                if ysize.checked_mul(xsize) != Some(nb_poke) {
                    return Err(CalibError::ShapeMismatch {
                        context: "actuator grid",
                        expected: vec![ysize * xsize],
                        got: vec![nb_poke],
                    });
                }
                vec![ysize, xsize]
            }
            None => vec![nb_poke],
        };

        let dm: Vec<f32> = response
            .as_slice()
            .par_chunks(plane)
            .map(|row| row.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() as f32)
            .collect();

        // Pokes are folded in order so every pixel sees the same summation sequence.
        let mut wfs = Array1::<f64>::zeros(plane);
        for row in rows.rows() {
            wfs.zip_mut_with(&row, |acc, &v| *acc += f64::from(v) * f64::from(v));
        }
        let wfs: Vec<f32> = wfs.iter().map(|&v| v as f32).collect();

        debug!(nb_poke, pixels = plane, "sensitivity maps computed");
        Ok(Self {
            dm: NamedArray::from_vec(&dm_shape, dm)?,
            wfs: NamedArray::from_vec(&response.shape()[1..], wfs)?,
        })
    }
}

/// Flattened `[NBpoke, H*W]` view of a 3-D response matrix.
pub(crate) fn response_rows(response: &NamedArray) -> CalibResult<ArrayView2<'_, f32>> {
    if response.rank() != 3 {
        return Err(CalibError::ShapeMismatch {
            context: "response matrix rank",
            expected: vec![3],
            got: vec![response.rank()],
        });
    }
    let shape = (response.dim(0), response.plane_len());
    ArrayView2::from_shape(shape, response.as_slice()).map_err(|_| CalibError::DataLength {
        expected: shape.0 * shape.1,
        got: response.len(),
    })
}
