// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! File persistence for named arrays.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

use crate::error::{CalibError, CalibResult};
use crate::store::{ArrayStore, NamedArray};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl StoredArray {
    fn from_array(array: &NamedArray) -> StoredArray {
        StoredArray {
            shape: array.shape().to_vec(),
            data: array.as_slice().to_vec(),
        }
    }

    fn into_array(self) -> CalibResult<NamedArray> {
        NamedArray::from_vec(&self.shape, self.data)
    }
}

/// Loads and saves whole arrays. `save` overwrites an existing file.
pub trait ArrayIo: Send + Sync {
    /// File extension (without dot) used when composing file names.
    fn extension(&self) -> &'static str;

    fn load(&self, path: &Path) -> CalibResult<NamedArray>;

    fn save(&self, array: &NamedArray, path: &Path) -> CalibResult<()>;
}

/// Human-readable snapshots, convenient for small fixtures.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonArrayIo;

impl ArrayIo for JsonArrayIo {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn load(&self, path: &Path) -> CalibResult<NamedArray> {
        let file = File::open(path).map_err(|err| CalibError::io(path, err))?;
        let reader = BufReader::new(file);
        let stored: StoredArray = serde_json::from_reader(reader).map_err(CalibError::serde)?;
        stored.into_array()
    }

    fn save(&self, array: &NamedArray, path: &Path) -> CalibResult<()> {
        let file = File::create(path).map_err(|err| CalibError::io(path, err))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, &StoredArray::from_array(array)).map_err(CalibError::serde)?;
        Ok(())
    }
}

/// Compact binary snapshots for full-size response matrices.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeArrayIo;

impl ArrayIo for BincodeArrayIo {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn load(&self, path: &Path) -> CalibResult<NamedArray> {
        let file = File::open(path).map_err(|err| CalibError::io(path, err))?;
        let reader = BufReader::new(file);
        let stored: StoredArray = bincode::deserialize_from(reader).map_err(CalibError::serde)?;
        stored.into_array()
    }

    fn save(&self, array: &NamedArray, path: &Path) -> CalibResult<()> {
        let file = File::create(path).map_err(|err| CalibError::io(path, err))?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, &StoredArray::from_array(array)).map_err(CalibError::serde)?;
        Ok(())
    }
}

/// Loads `path` and registers it as `name`, replacing any previous array.
pub fn load_into(
    io: &dyn ArrayIo,
    store: &mut ArrayStore,
    name: &str,
    path: &Path,
) -> CalibResult<()> {
    let array = io.load(path)?;
    debug!(array = %name, path = %path.display(), shape = ?array.shape(), "loaded");
    store.insert_or_replace(name, array);
    Ok(())
}

/// Writes the registered array `name` to `path`.
pub fn save_from(io: &dyn ArrayIo, store: &ArrayStore, name: &str, path: &Path) -> CalibResult<()> {
    let array = store.get(name)?;
    io.save(array, path)?;
    debug!(array = %name, path = %path.display(), "saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NamedArray {
        NamedArray::from_vec(&[2, 3], vec![0.5, -1.0, 2.0, 0.0, 3.25, -7.5]).unwrap()
    }

    #[test]
    fn json_snapshot_preserves_shape_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        JsonArrayIo.save(&sample(), &path).unwrap();
        let loaded = JsonArrayIo.load(&path).unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn save_overwrites_and_store_helpers_round_through_bincode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.bin");
        let mut store = ArrayStore::new();
        store.insert("map", sample()).unwrap();
        BincodeArrayIo
            .save(&NamedArray::zeros(&[4]).unwrap(), &path)
            .unwrap();
        save_from(&BincodeArrayIo, &store, "map", &path).unwrap();
        load_into(&BincodeArrayIo, &mut store, "copy", &path).unwrap();
        assert_eq!(store.get("copy").unwrap(), &sample());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = JsonArrayIo.load(Path::new("/nonexistent/zrespm.json")).unwrap_err();
        assert!(matches!(err, CalibError::Io { .. }));
        assert!(err.to_string().contains("zrespm.json"));
    }
}
