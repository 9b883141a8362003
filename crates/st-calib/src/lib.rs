// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Response-matrix processing for wavefront-control calibration.
//!
//! Raw push-pull poke measurements are combined robustly across repeated
//! ensembles, optionally demultiplexed from an orthogonal encoding, reduced
//! to sensitivity maps and validity masks, and finally pseudo-inverted into
//! a control matrix. Actuators outside the mask can be slaved to their
//! nearest valid neighbour.
//!
//! All arrays live in an explicit [`ArrayStore`] owned by the caller; the
//! [`CalibrationPipeline`] reads and writes it under configurable names.

pub mod combiner;
pub mod config;
pub mod control;
pub mod demux;
pub mod ensemble;
pub mod error;
pub mod flux;
pub mod io;
pub mod mask;
pub mod numerics;
pub mod pipeline;
pub mod pool;
pub mod sensitivity;
pub mod slave;
pub mod store;

pub use combiner::{CombinedResponse, CombinerConfig, DemodulatedMember, RobustCombiner};
pub use config::{ArrayNames, CalibConfig, ControlConfig, RuntimeConfig};
pub use control::{
    BackendChoice, ControlMatrix, ControlMatrixSynthesizer, FaerSvd, NalgebraSvd, PseudoInverse,
    PseudoInverseBackend, SvdOptions,
};
pub use demux::{
    demultiplex, demultiplex_into, Archive, Decoded, DemuxOutcome, Demultiplexer, TransformDecoder,
};
pub use ensemble::{EnsembleConfig, EnsembleLayout, PushPullFrames};
pub use error::{CalibError, CalibResult, ErrorKind};
pub use flux::{neutralize, normalize_reference, write_audit_log, FluxAudit, NeutralizedResponse};
pub use io::{load_into, save_from, ArrayIo, BincodeArrayIo, JsonArrayIo};
pub use mask::{MaskBand, MaskGenerator, MaskPair, MaskParams, PercentileMaskGenerator};
pub use pipeline::{CalibrationPipeline, CalibrationReport, ControlReport, ResponseReport};
pub use pool::WorkerPool;
pub use sensitivity::SensitivityMaps;
pub use slave::{SlaveAssignment, SlaveConfig, SlaveMap};
pub use store::{ArrayStore, NamedArray};
