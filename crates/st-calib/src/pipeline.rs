// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Orchestration of the calibration stages against an [`ArrayStore`].
//!
//! Stages read their inputs from the store under the configured names and
//! register their outputs back into it. Every stage runs inside the
//! pipeline's worker pool and any error aborts the whole operation.

use tracing::{info, info_span};

use crate::combiner::{CombinedResponse, RobustCombiner};
use crate::config::CalibConfig;
use crate::control::{ControlMatrix, ControlMatrixSynthesizer, PseudoInverseBackend};
use crate::demux::{
    demultiplex, demultiplex_into, Archive, DemuxOutcome, Demultiplexer, TransformDecoder,
};
use crate::ensemble::EnsembleLayout;
use crate::error::CalibResult;
use crate::flux::{self, FluxAudit};
use crate::io::ArrayIo;
use crate::mask::{MaskGenerator, PercentileMaskGenerator};
use crate::pool::WorkerPool;
use crate::sensitivity::SensitivityMaps;
use crate::slave::{SlaveAssignment, SlaveMap};
use crate::store::{ArrayStore, NamedArray};

/// Summary of [`CalibrationPipeline::process_response`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseReport {
    pub nb_poke: usize,
    pub demux: DemuxOutcome,
}

/// Summary of [`CalibrationPipeline::process_ensemble`].
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationReport {
    pub members: usize,
    pub nb_poke: usize,
    /// Non-finite samples replaced while demodulating.
    pub sanitized: usize,
    pub demux: DemuxOutcome,
    pub audits: Vec<FluxAudit>,
    pub wfs_valid: usize,
    pub dm_valid: usize,
}

/// Spectrum of a registered control matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlReport {
    pub rank: usize,
    pub singular_values: Vec<f64>,
}

pub struct CalibrationPipeline {
    config: CalibConfig,
    pool: WorkerPool,
    combiner: RobustCombiner,
    synthesizer: ControlMatrixSynthesizer,
    demultiplexer: Box<dyn Demultiplexer>,
    mask_generator: Box<dyn MaskGenerator>,
}

impl CalibrationPipeline {
    /// Validates `config` and wires the reference stage implementations.
    pub fn new(config: CalibConfig) -> CalibResult<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.runtime.worker_threads)?;
        let combiner = RobustCombiner::new(config.combiner.clone())?;
        let synthesizer =
            ControlMatrixSynthesizer::new(config.control.svd_options(), config.control.backend)?;
        info!(
            threads = pool.threads(),
            svd = synthesizer.backend_name(),
            "calibration pipeline ready"
        );
        Ok(Self {
            config,
            pool,
            combiner,
            synthesizer,
            demultiplexer: Box::new(TransformDecoder),
            mask_generator: Box::new(PercentileMaskGenerator),
        })
    }

    pub fn with_demultiplexer(mut self, demultiplexer: Box<dyn Demultiplexer>) -> Self {
        self.demultiplexer = demultiplexer;
        self
    }

    pub fn with_mask_generator(mut self, generator: Box<dyn MaskGenerator>) -> Self {
        self.mask_generator = generator;
        self
    }

    pub fn with_svd_backend(mut self, backend: Box<dyn PseudoInverseBackend>) -> CalibResult<Self> {
        self.synthesizer = ControlMatrixSynthesizer::with_backend(self.config.control.svd_options(), backend)?;
        Ok(self)
    }

    pub fn config(&self) -> &CalibConfig {
        &self.config
    }

    /// Ensemble layout described by the configuration.
    pub fn ensemble_layout(&self) -> EnsembleLayout {
        EnsembleLayout::new(self.config.ensemble.dir.clone(), self.config.ensemble_base())
    }

    /// Single-matrix path: decode (or copy) `source` into the response
    /// array, then register both sensitivity maps.
    pub fn process_response(
        &self,
        store: &mut ArrayStore,
        source: &str,
        io: Option<&dyn ArrayIo>,
    ) -> CalibResult<ResponseReport> {
        let _span = info_span!("process_response", source).entered();
        self.pool.install(|| {
            let names = &self.config.names;
            let demux = if source == names.response {
                self.decode_in_place(store, io)?
            } else {
                let archive = self.archive(io);
                demultiplex_into(store, source, &names.response, names, self.demultiplexer.as_ref(), archive)?
            };
            let response = store.get(&names.response)?;
            let maps = self.sensitivity_maps(store, response, demux.decoded)?;
            let nb_poke = response.dim(0);
            store.insert_or_replace(&names.wfs_map, maps.wfs);
            store.insert_or_replace(&names.dm_map, maps.dm);
            info!(nb_poke, decoded = demux.decoded, "response processed");
            Ok(ResponseReport { nb_poke, demux })
        })
    }

    /// Full ensemble path: combine the members found through `layout`,
    /// decode, derive maps and masks, normalise the reference and
    /// neutralise the response flux.
    ///
    /// Intermediate arrays stay local until every step has succeeded, so a
    /// failed run leaves the store as it found it.
    pub fn process_ensemble(
        &self,
        store: &mut ArrayStore,
        layout: &EnsembleLayout,
        io: &dyn ArrayIo,
    ) -> CalibResult<CalibrationReport> {
        let _span = info_span!("process_ensemble", base = layout.base()).entered();
        self.pool.install(|| {
            let names = &self.config.names;
            let CombinedResponse {
                response,
                reference,
                members,
                sanitized,
            } = self.combiner.combine_files(layout, io)?;

            let decoded = demultiplex(
                store,
                &response,
                names,
                self.demultiplexer.as_ref(),
                self.archive(Some(io)),
            )?;
            let (response, poke_commands, demux) = match decoded {
                Some(decoded) => {
                    let outcome = decoded.outcome();
                    (decoded.response, decoded.poke_commands, outcome)
                }
                None => (response, None, DemuxOutcome::default()),
            };
            let maps = self.sensitivity_maps(store, &response, demux.decoded)?;

            let masks = self
                .mask_generator
                .derive_masks(&response, &maps, &self.config.mask)?;
            let (wfs_valid, dm_valid) = masks.valid_counts();
            let reference = flux::normalize_reference(&reference, &masks.wfs)?;
            let neutralized = flux::neutralize(&response, &masks.wfs)?;
            let nb_poke = neutralized.response.dim(0);
            if let Some(path) = &self.config.runtime.audit_log {
                flux::write_audit_log(path, &neutralized.audits, nb_poke)?;
            }

            if let Some(commands) = poke_commands {
                store.insert_or_replace(names.poke_command_decoded.clone(), commands);
            }
            store.insert_or_replace(&names.reference, reference);
            store.insert_or_replace(&names.response, neutralized.response);
            store.insert_or_replace(&names.wfs_map, maps.wfs);
            store.insert_or_replace(&names.dm_map, maps.dm);
            store.insert_or_replace(&names.wfs_mask, masks.wfs);
            store.insert_or_replace(&names.dm_mask, masks.dm);
            info!(members, nb_poke, wfs_valid, dm_valid, "ensemble processed");
            Ok(CalibrationReport {
                members,
                nb_poke,
                sanitized,
                demux,
                audits: neutralized.audits,
                wfs_valid,
                dm_valid,
            })
        })
    }

    /// Synthesises the control matrix of the configured response array and
    /// registers it under the configured control-matrix name.
    pub fn make_control_matrix_from_config(&self, store: &mut ArrayStore) -> CalibResult<ControlReport> {
        let names = &self.config.names;
        self.make_control_matrix(store, &names.response, &names.control_matrix)
    }

    /// Synthesises the control matrix of `response` and registers it as
    /// `output`.
    pub fn make_control_matrix(
        &self,
        store: &mut ArrayStore,
        response: &str,
        output: &str,
    ) -> CalibResult<ControlReport> {
        let ControlMatrix {
            matrix,
            singular_values,
            rank,
        } = self
            .pool
            .install(|| self.synthesizer.synthesize(store.get(response)?))?;
        info!(response, output, rank, "control matrix registered");
        store.insert_or_replace(output, matrix);
        Ok(ControlReport {
            rank,
            singular_values,
        })
    }

    /// Slaves the actuators outside the configured DM mask within the
    /// configured search radius.
    pub fn make_slaved_actuators_from_config(
        &self,
        store: &mut ArrayStore,
    ) -> CalibResult<Vec<SlaveAssignment>> {
        let names = &self.config.names;
        self.make_slaved_actuators(
            store,
            &names.dm_mask,
            self.config.slave.search_radius,
            &names.slave_map,
        )
    }

    /// Solves the slave map of the actuator mask `mask` and registers it as
    /// `output`.
    pub fn make_slaved_actuators(
        &self,
        store: &mut ArrayStore,
        mask: &str,
        search_radius: f32,
        output: &str,
    ) -> CalibResult<Vec<SlaveAssignment>> {
        let solved = self
            .pool
            .install(|| SlaveMap::solve(store.get(mask)?, search_radius))?;
        let assignments = solved.assignments().to_vec();
        info!(mask, output, slaved = assignments.len(), "slave map registered");
        store.insert_or_replace(output, solved.into_map());
        Ok(assignments)
    }

    fn archive<'a>(&'a self, io: Option<&'a dyn ArrayIo>) -> Option<Archive<'a>> {
        match (io, self.config.runtime.encoded_archive.as_deref()) {
            (Some(io), Some(path)) => Some(Archive { io, path }),
            _ => None,
        }
    }

    /// Decodes the response array into itself through the scratch name. On
    /// failure the original response is restored.
    fn decode_in_place(&self, store: &mut ArrayStore, io: Option<&dyn ArrayIo>) -> CalibResult<DemuxOutcome> {
        let names = &self.config.names;
        if !(store.contains(&names.transform) && store.contains(&names.index_map)) {
            return Ok(DemuxOutcome::default());
        }
        store.rename(&names.response, names.scratch.clone())?;
        let outcome = demultiplex_into(
            store,
            &names.scratch,
            &names.response,
            names,
            self.demultiplexer.as_ref(),
            self.archive(io),
        );
        let original = store.delete(&names.scratch)?;
        if outcome.is_err() {
            store.insert_or_replace(names.response.clone(), original);
        }
        outcome
    }

    /// Maps of `response`. Without a configured grid, a decoded response is
    /// laid out on the index map's grid.
    fn sensitivity_maps(
        &self,
        store: &ArrayStore,
        response: &NamedArray,
        decoded: bool,
    ) -> CalibResult<SensitivityMaps> {
        let grid = self.config.runtime.actuator_grid.or_else(|| {
            store
                .lookup(&self.config.names.index_map)
                .filter(|map| decoded && map.rank() == 2)
                .map(|map| [map.dim(0), map.dim(1)])
        });
        SensitivityMaps::compute(response, grid)
    }
}
