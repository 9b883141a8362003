// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Decoding of multiplexed (e.g. Hadamard-encoded) poke sequences.

use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::ArrayNames;
use crate::error::{CalibError, CalibResult};
use crate::io::ArrayIo;
use crate::store::{ArrayStore, NamedArray};

/// Recovers per-actuator planes from an encoded measurement sequence.
pub trait Demultiplexer: Send + Sync {
    fn decode(
        &self,
        encoded: &NamedArray,
        transform: &NamedArray,
        index_map: &NamedArray,
    ) -> CalibResult<NamedArray>;
}

/// Decoder for orthogonal encodings whose transform satisfies `TᵀT = K·I`.
///
/// Encoded plane `k` was measured with actuator `a` driven by `T[k, idx(a)]`,
/// so actuator `a` is recovered as `(1/K) Σ_k T[k, idx(a)] · enc[k]`. Index
/// map values below zero mark actuators that were not driven.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransformDecoder;

impl Demultiplexer for TransformDecoder {
    fn decode(
        &self,
        encoded: &NamedArray,
        transform: &NamedArray,
        index_map: &NamedArray,
    ) -> CalibResult<NamedArray> {
        if encoded.rank() != 3 {
            return Err(CalibError::ShapeMismatch {
                context: "encoded sequence rank",
                expected: vec![3],
                got: vec![encoded.rank()],
            });
        }
        let k = encoded.dim(0);
        transform.expect_shape("transform matrix", &[k, k])?;

        let columns = index_map
            .as_slice()
            .iter()
            .map(|&v| {
                let idx = v.round();
                if idx < 0.0 {
                    Ok(None)
                } else if idx as usize >= k {
                    Err(CalibError::ShapeMismatch {
                        context: "index map entry",
                        expected: vec![k],
                        got: vec![idx as usize],
                    })
                } else {
                    Ok(Some(idx as usize))
                }
            })
            .collect::<CalibResult<Vec<_>>>()?;

        let plane = encoded.plane_len();
        let t = transform.as_slice();
        let enc = encoded.as_slice();
        let scale = 1.0 / k as f64;
        let mut out = vec![0.0f32; columns.len() * plane];
        out.par_chunks_mut(plane)
            .zip(columns.par_iter())
            .for_each(|(dst, column)| {
                let Some(col) = *column else { return };
                let mut acc = vec![0.0f64; plane];
                for (row, src) in enc.chunks(plane).enumerate() {
                    let weight = f64::from(t[row * k + col]);
                    for (a, &v) in acc.iter_mut().zip(src) {
                        *a += weight * f64::from(v);
                    }
                }
                for (d, a) in dst.iter_mut().zip(acc) {
                    *d = (a * scale) as f32;
                }
            });

        let driven = columns.iter().flatten().count();
        debug!(encoded = k, actuators = columns.len(), driven, "sequence decoded");
        let shape = [columns.len(), encoded.dim(1), encoded.dim(2)];
        NamedArray::from_vec(&shape, out)
    }
}

/// What [`demultiplex_into`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DemuxOutcome {
    /// The source was decoded rather than copied.
    pub decoded: bool,
    /// The poke-command encoding was decoded as well.
    pub poke_commands: bool,
}

/// Where to archive the encoded matrix before decoding.
pub struct Archive<'a> {
    pub io: &'a dyn ArrayIo,
    pub path: &'a Path,
}

/// Decoded response plus the decoded poke commands, not yet registered.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub response: NamedArray,
    pub poke_commands: Option<NamedArray>,
}

impl Decoded {
    pub fn outcome(&self) -> DemuxOutcome {
        DemuxOutcome {
            decoded: true,
            poke_commands: self.poke_commands.is_some(),
        }
    }
}

/// Decodes `encoded` against the transform and index map registered in
/// `store`, leaving the store untouched.
///
/// Returns `None` when no encoding is registered. A registered poke-command
/// encoding is decoded alongside.
pub fn demultiplex(
    store: &ArrayStore,
    encoded: &NamedArray,
    names: &ArrayNames,
    decoder: &dyn Demultiplexer,
    archive: Option<Archive<'_>>,
) -> CalibResult<Option<Decoded>> {
    let (Some(transform), Some(index_map)) =
        (store.lookup(&names.transform), store.lookup(&names.index_map))
    else {
        return Ok(None);
    };
    if let Some(Archive { io, path }) = archive {
        io.save(encoded, path)?;
        info!(path = %path.display(), "encoded response archived");
    }
    let response = decoder.decode(encoded, transform, index_map)?;
    let poke_commands = match store.lookup(&names.poke_command) {
        Some(commands) => Some(decoder.decode(commands, transform, index_map)?),
        None => None,
    };
    Ok(Some(Decoded {
        response,
        poke_commands,
    }))
}

/// Decodes `source` into `target` when the transform matrix and index map
/// are both registered, or copies it unchanged otherwise.
///
/// Nothing is registered unless decoding succeeds. `source` and `target`
/// must differ.
pub fn demultiplex_into(
    store: &mut ArrayStore,
    source: &str,
    target: &str,
    names: &ArrayNames,
    decoder: &dyn Demultiplexer,
    archive: Option<Archive<'_>>,
) -> CalibResult<DemuxOutcome> {
    if source == target {
        return Err(CalibError::invalid(
            "demultiplex target",
            format!("source and target are both '{source}'"),
        ));
    }
    let current: &ArrayStore = store;
    let Some(decoded) = demultiplex(current, current.get(source)?, names, decoder, archive)? else {
        store.copy(source, target)?;
        debug!(source, target, "no encoding registered; copied");
        return Ok(DemuxOutcome::default());
    };

    info!(source, target, actuators = decoded.response.dim(0), "response decoded");
    let outcome = decoded.outcome();
    store.insert_or_replace(target, decoded.response);
    if let Some(commands) = decoded.poke_commands {
        store.insert_or_replace(names.poke_command_decoded.clone(), commands);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::JsonArrayIo;

    fn hadamard4() -> NamedArray {
        NamedArray::from_vec(
            &[4, 4],
            vec![
                1.0, 1.0, 1.0, 1.0, //
                1.0, -1.0, 1.0, -1.0, //
                1.0, 1.0, -1.0, -1.0, //
                1.0, -1.0, -1.0, 1.0,
            ],
        )
        .unwrap()
    }

    #[test]
    fn decode_inverts_hadamard_encoding() {
        let h = hadamard4();
        // Actuator a responds with a on pixel 0 and -a on pixel 1.
        let plane = |a: usize| [a as f32 + 1.0, -(a as f32) - 1.0];
        let mut enc = vec![0.0f32; 8];
        for k in 0..4 {
            for a in 0..4 {
                let w = h.as_slice()[k * 4 + a];
                enc[k * 2] += w * plane(a)[0];
                enc[k * 2 + 1] += w * plane(a)[1];
            }
        }
        let encoded = NamedArray::from_vec(&[4, 1, 2], enc).unwrap();
        // 2x2 grid, one actuator not driven.
        let index_map = NamedArray::from_vec(&[2, 2], vec![0.0, 1.0, -1.0, 3.0]).unwrap();
        let out = TransformDecoder.decode(&encoded, &h, &index_map).unwrap();
        assert_eq!(out.shape(), &[4, 1, 2]);
        assert_eq!(&out.as_slice()[0..2], &plane(0));
        assert_eq!(&out.as_slice()[2..4], &plane(1));
        assert_eq!(&out.as_slice()[4..6], &[0.0, 0.0]);
        assert_eq!(&out.as_slice()[6..8], &plane(3));
    }

    #[test]
    fn index_beyond_transform_is_rejected() {
        let encoded = NamedArray::zeros(&[4, 1, 1]).unwrap();
        let index_map = NamedArray::from_vec(&[2], vec![0.0, 4.0]).unwrap();
        assert!(matches!(
            TransformDecoder.decode(&encoded, &hadamard4(), &index_map),
            Err(CalibError::ShapeMismatch { .. })
        ));
        let square = NamedArray::zeros(&[4, 2]).unwrap();
        assert!(TransformDecoder.decode(&encoded, &square, &index_map).is_err());
    }

    #[test]
    fn copies_when_no_encoding_is_registered() {
        let names = ArrayNames::default();
        let mut store = ArrayStore::new();
        store.insert("raw", NamedArray::filled(&[2, 1, 1], 3.0).unwrap()).unwrap();
        let outcome = demultiplex_into(&mut store, "raw", &names.response, &names, &TransformDecoder, None).unwrap();
        assert!(!outcome.decoded);
        assert_eq!(store.get(&names.response).unwrap().as_slice(), &[3.0, 3.0]);
        assert!(store.contains("raw"));
    }

    #[test]
    fn decodes_response_and_poke_commands_with_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("zrespm_Hadamard.json");
        let names = ArrayNames::default();
        let mut store = ArrayStore::new();
        store.insert(names.transform.clone(), hadamard4()).unwrap();
        store
            .insert(
                names.index_map.clone(),
                NamedArray::from_vec(&[2, 2], vec![0.0, 1.0, 2.0, 3.0]).unwrap(),
            )
            .unwrap();
        store.insert("raw", NamedArray::filled(&[4, 1, 1], 1.0).unwrap()).unwrap();
        store
            .insert(names.poke_command.clone(), NamedArray::filled(&[4, 2, 2], 1.0).unwrap())
            .unwrap();

        let outcome = demultiplex_into(
            &mut store,
            "raw",
            &names.response,
            &names,
            &TransformDecoder,
            Some(Archive {
                io: &JsonArrayIo,
                path: &archive_path,
            }),
        )
        .unwrap();
        assert!(outcome.decoded && outcome.poke_commands);
        // Constant encoding projects only onto the first Hadamard column.
        assert_eq!(store.get(&names.response).unwrap().as_slice(), &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(store.get(&names.poke_command_decoded).unwrap().shape(), &[4, 2, 2]);
        assert_eq!(JsonArrayIo.load(&archive_path).unwrap().shape(), &[4, 1, 1]);
    }

    #[test]
    fn failed_decode_registers_nothing() {
        let names = ArrayNames::default();
        let mut store = ArrayStore::new();
        store.insert(names.transform.clone(), hadamard4()).unwrap();
        store
            .insert(names.index_map.clone(), NamedArray::from_vec(&[2], vec![0.0, 9.0]).unwrap())
            .unwrap();
        store.insert("raw", NamedArray::filled(&[4, 1, 1], 1.0).unwrap()).unwrap();
        let err = demultiplex_into(&mut store, "raw", &names.response, &names, &TransformDecoder, None)
            .unwrap_err();
        assert!(matches!(err, CalibError::ShapeMismatch { .. }));
        assert!(!store.contains(&names.response));
        assert_eq!(store.get("raw").unwrap().as_slice(), &[1.0; 4]);
    }

    #[test]
    fn demultiplex_without_encoding_is_none() {
        let names = ArrayNames::default();
        let store = ArrayStore::new();
        let encoded = NamedArray::zeros(&[2, 1, 1]).unwrap();
        assert!(demultiplex(&store, &encoded, &names, &TransformDecoder, None)
            .unwrap()
            .is_none());
    }
}
