// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Named array registry shared by the calibration stages.
//!
//! The store is an ordinary value owned by the caller and handed to each stage
//! by reference. Writers need `&mut ArrayStore`, so two stages can never
//! produce into the same array concurrently.

use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use tracing::debug;

use crate::error::{CalibError, CalibResult};

const MAX_RANK: usize = 3;

/// Dense `f32` buffer with an immutable row-major shape (last axis fastest).
#[derive(Clone, Debug, PartialEq)]
pub struct NamedArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl NamedArray {
    /// Zero-filled array of the given shape.
    pub fn zeros(shape: &[usize]) -> CalibResult<Self> {
        let len = checked_volume(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        })
    }

    /// Wraps an existing buffer, checking it against the shape.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> CalibResult<Self> {
        let len = checked_volume(shape)?;
        if data.len() != len {
            return Err(CalibError::DataLength {
                expected: len,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Array with every element set to `value`.
    pub fn filled(shape: &[usize], value: f32) -> CalibResult<Self> {
        let len = checked_volume(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![value; len],
        })
    }

    /// Converts an ndarray value, whatever its memory layout.
    pub fn from_array(array: ArrayD<f32>) -> CalibResult<Self> {
        let shape = array.shape().to_vec();
        let data = array.iter().copied().collect();
        Self::from_vec(&shape, data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Extent of `axis`, or 1 past the last axis.
    pub fn dim(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(1)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of elements in one plane spanned by the two trailing axes.
    pub fn plane_len(&self) -> usize {
        let rank = self.shape.len();
        self.shape[rank.saturating_sub(2)..].iter().product()
    }

    /// Number of planes along the leading axis of a 3-D array (1 otherwise).
    pub fn plane_count(&self) -> usize {
        if self.shape.len() == MAX_RANK {
            self.shape[0]
        } else {
            1
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrowed ndarray view with the array's shape.
    pub fn view(&self) -> ArrayViewD<'_, f32> {
        // Shape and length are validated at construction.
        ArrayViewD::from_shape(IxDyn(&self.shape), &self.data)
            .unwrap_or_else(|_| unreachable!("named array shape invariant violated"))
    }

    pub fn to_array(&self) -> ArrayD<f32> {
        self.view().to_owned()
    }

    /// Fails with a shape mismatch unless `self` has exactly `expected`.
    pub fn expect_shape(&self, context: &'static str, expected: &[usize]) -> CalibResult<()> {
        if self.shape != expected {
            return Err(CalibError::ShapeMismatch {
                context,
                expected: expected.to_vec(),
                got: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// First non-finite element, if any.
    pub fn first_non_finite(&self) -> Option<(usize, f32)> {
        self.data
            .iter()
            .enumerate()
            .find(|(_, value)| !value.is_finite())
            .map(|(idx, value)| (idx, *value))
    }
}

fn checked_volume(shape: &[usize]) -> CalibResult<usize> {
    if shape.is_empty() || shape.len() > MAX_RANK || shape.iter().any(|&n| n == 0) {
        return Err(CalibError::InvalidShape {
            shape: shape.to_vec(),
        });
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| CalibError::InvalidShape {
            shape: shape.to_vec(),
        })
}

/// Registry of named arrays. Arrays live until deleted explicitly.
#[derive(Debug, Default, Clone)]
pub struct ArrayStore {
    arrays: HashMap<String, NamedArray>,
}

impl ArrayStore {
    pub fn new() -> Self {
        Self {
            arrays: HashMap::new(),
        }
    }

    /// Creates a zero-filled array and returns it for writing.
    pub fn create(&mut self, name: impl Into<String>, shape: &[usize]) -> CalibResult<&mut NamedArray> {
        let array = NamedArray::zeros(shape)?;
        self.insert(name, array)
    }

    /// Registers a produced array under a fresh name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        array: NamedArray,
    ) -> CalibResult<&mut NamedArray> {
        let name = name.into();
        if self.arrays.contains_key(&name) {
            return Err(CalibError::ArrayExists(name));
        }
        debug!(array = %name, shape = ?array.shape(), "create");
        Ok(self.arrays.entry(name).or_insert(array))
    }

    /// Registers `array`, dropping any previous array of the same name.
    pub fn insert_or_replace(&mut self, name: impl Into<String>, array: NamedArray) -> Option<NamedArray> {
        let name = name.into();
        debug!(array = %name, shape = ?array.shape(), "replace");
        self.arrays.insert(name, array)
    }

    pub fn lookup(&self, name: &str) -> Option<&NamedArray> {
        self.arrays.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut NamedArray> {
        self.arrays.get_mut(name)
    }

    /// Like [`ArrayStore::lookup`] but absence is an error.
    pub fn get(&self, name: &str) -> CalibResult<&NamedArray> {
        self.arrays
            .get(name)
            .ok_or_else(|| CalibError::ArrayMissing(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> CalibResult<&mut NamedArray> {
        self.arrays
            .get_mut(name)
            .ok_or_else(|| CalibError::ArrayMissing(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    /// Removes an array and hands it back to the caller.
    pub fn delete(&mut self, name: &str) -> CalibResult<NamedArray> {
        let array = self
            .arrays
            .remove(name)
            .ok_or_else(|| CalibError::ArrayMissing(name.to_string()))?;
        debug!(array = %name, "delete");
        Ok(array)
    }

    /// Moves an array to a new name. The target name must be free.
    pub fn rename(&mut self, old: &str, new: impl Into<String>) -> CalibResult<()> {
        let new = new.into();
        if !self.arrays.contains_key(old) {
            return Err(CalibError::ArrayMissing(old.to_string()));
        }
        if self.arrays.contains_key(&new) {
            return Err(CalibError::ArrayExists(new));
        }
        if let Some(array) = self.arrays.remove(old) {
            debug!(from = %old, to = %new, "rename");
            self.arrays.insert(new, array);
        }
        Ok(())
    }

    /// Copies `src` into `dst`, replacing any existing `dst`.
    pub fn copy(&mut self, src: &str, dst: impl Into<String>) -> CalibResult<()> {
        let array = self.get(src)?.clone();
        self.insert_or_replace(dst, array);
        Ok(())
    }

    /// Registered names in lexical order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.arrays.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_delete_cycle() {
        let mut store = ArrayStore::new();
        store.create("wfsmap", &[3, 4]).unwrap().as_mut_slice()[5] = 2.5;
        assert!(store.contains("wfsmap"));
        assert_eq!(store.get("wfsmap").unwrap().as_slice()[5], 2.5);
        if let Some(map) = store.lookup_mut("wfsmap") {
            map.as_mut_slice()[0] = -1.0;
        }
        assert_eq!(store.get("wfsmap").unwrap().as_slice()[0], -1.0);
        assert!(store.lookup_mut("dmmap").is_none());
        let array = store.delete("wfsmap").unwrap();
        assert_eq!(array.shape(), &[3, 4]);
        assert!(store.lookup("wfsmap").is_none());
        assert!(matches!(
            store.delete("wfsmap"),
            Err(CalibError::ArrayMissing(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut store = ArrayStore::new();
        store.create("zrespm", &[2, 2, 2]).unwrap();
        assert!(matches!(
            store.create("zrespm", &[2, 2, 2]),
            Err(CalibError::ArrayExists(_))
        ));
    }

    #[test]
    fn rename_requires_free_target() {
        let mut store = ArrayStore::new();
        store.create("a", &[2]).unwrap();
        store.create("b", &[2]).unwrap();
        assert!(matches!(
            store.rename("a", "b"),
            Err(CalibError::ArrayExists(_))
        ));
        store.rename("a", "c").unwrap();
        assert_eq!(store.names(), vec!["b", "c"]);
    }

    #[test]
    fn shapes_are_validated() {
        assert!(NamedArray::zeros(&[]).is_err());
        assert!(NamedArray::zeros(&[1, 2, 3, 4]).is_err());
        assert!(NamedArray::zeros(&[3, 0]).is_err());
        assert!(matches!(
            NamedArray::from_vec(&[2, 2], vec![0.0; 3]),
            Err(CalibError::DataLength {
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    fn views_follow_row_major_layout() {
        let array = NamedArray::from_vec(&[2, 1, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        let view = array.view();
        assert_eq!(view[[1, 0, 2]], 5.0);
        assert_eq!(array.plane_len(), 3);
        assert_eq!(array.plane_count(), 2);

        let transposed = array.to_array().reversed_axes();
        let back = NamedArray::from_array(transposed).unwrap();
        assert_eq!(back.shape(), &[3, 1, 2]);
        assert_eq!(back.as_slice()[1], 3.0);
    }
}
