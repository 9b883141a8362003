// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! On-disk layout of a push-pull measurement ensemble.
//!
//! An acquisition writes `<base>_nbiter.txt` holding the member count, then
//! one positive and one negative frame per member:
//! `<base>_pos_000.<ext>`, `<base>_neg_000.<ext>`, ...

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalibError, CalibResult};
use crate::io::ArrayIo;
use crate::store::NamedArray;

/// Where the ensemble lives and how its files are named.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub dir: PathBuf,
    /// File name stem; the response array name is used when unset.
    pub base: Option<String>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("zresptmp"),
            base: None,
        }
    }
}

/// One member's positive and negative frames, both `[NBpoke, H, W]`.
#[derive(Clone, Debug, PartialEq)]
pub struct PushPullFrames {
    pub positive: NamedArray,
    pub negative: NamedArray,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnsembleLayout {
    dir: PathBuf,
    base: String,
}

impl EnsembleLayout {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Companion file holding the member count.
    pub fn count_path(&self) -> PathBuf {
        self.dir.join(format!("{}_nbiter.txt", self.base))
    }

    /// Positive and negative frame paths of member `index`.
    pub fn member_paths(&self, index: usize, extension: &str) -> (PathBuf, PathBuf) {
        (
            self.dir
                .join(format!("{}_pos_{index:03}.{extension}", self.base)),
            self.dir
                .join(format!("{}_neg_{index:03}.{extension}", self.base)),
        )
    }

    /// Reads the member count; fewer than `minimum` members is an error.
    pub fn read_count(&self, minimum: usize) -> CalibResult<usize> {
        let path = self.count_path();
        let text = fs::read_to_string(&path).map_err(|err| CalibError::CountFile {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let token = text
            .split_whitespace()
            .next()
            .ok_or_else(|| CalibError::CountFile {
                path: path.clone(),
                message: "file is empty".to_string(),
            })?;
        let count: i64 = token.parse().map_err(|err| CalibError::CountFile {
            path: path.clone(),
            message: format!("'{token}' is not an integer: {err}"),
        })?;
        let found = usize::try_from(count).unwrap_or(0);
        if found < minimum {
            return Err(CalibError::InsufficientEnsembles { found, minimum });
        }
        debug!(path = %path.display(), count = found, "ensemble count read");
        Ok(found)
    }

    /// Writes the member count, creating the directory if needed.
    pub fn write_count(&self, count: usize) -> CalibResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| CalibError::io(&self.dir, err))?;
        let path = self.count_path();
        fs::write(&path, format!("{count}\n")).map_err(|err| CalibError::io(&path, err))
    }

    pub fn load_member(&self, io: &dyn ArrayIo, index: usize) -> CalibResult<PushPullFrames> {
        let (pos, neg) = self.member_paths(index, io.extension());
        Ok(PushPullFrames {
            positive: io.load(&pos)?,
            negative: io.load(&neg)?,
        })
    }

    pub fn save_member(&self, io: &dyn ArrayIo, index: usize, frames: &PushPullFrames) -> CalibResult<()> {
        fs::create_dir_all(&self.dir).map_err(|err| CalibError::io(&self.dir, err))?;
        let (pos, neg) = self.member_paths(index, io.extension());
        io.save(&frames.positive, &pos)?;
        io.save(&frames.negative, &neg)
    }
}
