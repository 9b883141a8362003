// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::path::Path;

use approx::assert_abs_diff_eq;
use rand::Rng;
use spiral_config::determinism;
use st_calib::{
    ArrayStore, BincodeArrayIo, CalibConfig, CalibError, CalibResult, CalibrationPipeline,
    CombinerConfig, EnsembleLayout, JsonArrayIo, MaskGenerator, MaskPair, MaskParams, NamedArray,
    PushPullFrames, RobustCombiner, SensitivityMaps, SlaveMap,
};

const NB_POKE: usize = 3;
const SENSOR: [usize; 2] = [3, 3];

fn init_logging() {
    let _ = spiral_config::tracing::init_tracing();
}

fn frames_from(pos: impl Fn(usize, usize) -> f32, neg: impl Fn(usize, usize) -> f32) -> PushPullFrames {
    frames_with(NB_POKE, pos, neg)
}

fn frames_with(
    nb_poke: usize,
    pos: impl Fn(usize, usize) -> f32,
    neg: impl Fn(usize, usize) -> f32,
) -> PushPullFrames {
    let plane = SENSOR[0] * SENSOR[1];
    let shape = [nb_poke, SENSOR[0], SENSOR[1]];
    let collect = |f: &dyn Fn(usize, usize) -> f32| -> Vec<f32> {
        (0..nb_poke * plane).map(|i| f(i / plane, i % plane)).collect()
    };
    PushPullFrames {
        positive: NamedArray::from_vec(&shape, collect(&pos)).unwrap(),
        negative: NamedArray::from_vec(&shape, collect(&neg)).unwrap(),
    }
}

#[test]
fn poke_plus_member_ensemble_matches_hand_computed_means() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let layout = EnsembleLayout::new(dir.path(), "zrespm");
    layout.write_count(4).unwrap();
    for k in 0..4 {
        let frames = frames_from(|p, _| (p + k) as f32, |_, _| 0.0);
        layout.save_member(&JsonArrayIo, k, &frames).unwrap();
    }

    let combiner = RobustCombiner::new(CombinerConfig {
        normalize_flux: false,
        ..CombinerConfig::default()
    })
    .unwrap();
    let combined = combiner.combine_files(&layout, &JsonArrayIo).unwrap();
    assert_eq!(combined.members, 4);
    assert_eq!(combined.response.shape(), &[3, 3, 3]);
    assert_eq!(combined.reference.shape(), &[3, 3]);

    // Four members: no trimming, mean of 0.5 * (p + k) over k.
    for poke in 0..NB_POKE {
        let expected = 0.5 * poke as f32 + 0.75;
        for &value in &combined.response.as_slice()[poke * 9..(poke + 1) * 9] {
            assert_abs_diff_eq!(value, expected, epsilon = 1e-6);
        }
    }
    // Twelve reference samples per pixel, two trimmed at each end.
    for &value in combined.reference.as_slice() {
        assert_abs_diff_eq!(value, 1.25, epsilon = 1e-6);
    }

    // Three pokes do not tile the 4x4 actuator grid, so the DM map stays flat.
    let maps = SensitivityMaps::compute(&combined.response, None).unwrap();
    assert_eq!(maps.dm.shape(), &[3]);
    for poke in 0..NB_POKE {
        let r = 0.5 * poke as f32 + 0.75;
        assert_abs_diff_eq!(maps.dm.as_slice()[poke], 9.0 * r * r, epsilon = 1e-4);
    }
    for &value in maps.wfs.as_slice() {
        assert_abs_diff_eq!(value, 0.5625 + 1.5625 + 3.0625, epsilon = 1e-4);
    }
    assert!(matches!(
        SensitivityMaps::compute(&combined.response, Some([4, 4])),
        Err(CalibError::ShapeMismatch { .. })
    ));
}

#[test]
fn slave_solver_on_four_by_four_grid() {
    let mut mask = NamedArray::filled(&[4, 4], 1.0).unwrap();
    // Invalidate the right column.
    for y in 0..4 {
        mask.as_mut_slice()[y * 4 + 3] = 0.0;
    }
    let slaved = SlaveMap::solve(&mask, 1.2).unwrap();
    for y in 0..4 {
        assert_eq!(slaved.map().as_slice()[y * 4 + 3], 1.0);
        assert_eq!(slaved.map().as_slice()[y * 4], 0.0);
    }
    let masters: Vec<_> = slaved.assignments().iter().map(|a| a.master).collect();
    assert_eq!(masters, vec![(2, 0), (2, 1), (2, 2), (2, 3)]);

    let far = SlaveMap::solve(&mask, 1.0).unwrap();
    assert!(far.map().as_slice().iter().all(|&v| v == 0.0));
}

fn pupil_weight(pixel: usize) -> f32 {
    [0.1, 1.0, 0.1, 1.0, 2.0, 1.0, 0.1, 1.0, 0.1][pixel]
}

#[test]
fn noisy_ensemble_runs_through_full_pipeline() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("zrespmat_flux.log");

    let mut config = CalibConfig::default();
    config.ensemble.dir = dir.path().join("zresptmp");
    config.combiner.normalize_flux = false;
    config.runtime.worker_threads = Some(3);
    config.runtime.audit_log = Some(audit_path.clone());
    let pipeline = CalibrationPipeline::new(config).unwrap();
    let layout = pipeline.ensemble_layout();

    let mut rng = determinism::rng_from_label("st-calib/e2e-noise");
    let members = 5;
    layout.write_count(members).unwrap();
    for k in 0..members {
        let noise: Vec<f32> = (0..2 * NB_POKE * 9).map(|_| rng.gen_range(-0.01..0.01)).collect();
        let signal = |p: usize, i: usize| pupil_weight(i) * (1 + p) as f32;
        let flux = |i: usize| 10.0 * pupil_weight(i);
        let mut frames = frames_from(
            |p, i| flux(i) + signal(p, i) + noise[p * 9 + i],
            |p, i| flux(i) - signal(p, i) + noise[NB_POKE * 9 + p * 9 + i],
        );
        if k == 2 {
            frames.positive.as_mut_slice()[9 + 4] += 1000.0;
        }
        layout.save_member(&BincodeArrayIo, k, &frames).unwrap();
    }

    // The outlier member is trimmed away before any flux correction.
    let combined = RobustCombiner::new(pipeline.config().combiner.clone())
        .unwrap()
        .combine_files(&layout, &BincodeArrayIo)
        .unwrap();
    assert_abs_diff_eq!(combined.response.as_slice()[9 + 4], 4.0, epsilon = 0.05);

    let mut store = ArrayStore::new();
    let report = pipeline
        .process_ensemble(&mut store, &layout, &BincodeArrayIo)
        .unwrap();
    assert_eq!(report.members, 5);
    assert_eq!(report.nb_poke, 3);
    assert!(!report.demux.decoded);
    assert_eq!(report.sanitized, 0);
    // Bright cross of the pupil, and the two strongest pokes.
    assert_eq!(report.wfs_valid, 5);
    assert_eq!(report.dm_valid, 2);
    assert_eq!(store.get("dmmask").unwrap().as_slice(), &[0.0, 1.0, 1.0]);

    let mask = store.get("wfsmask").unwrap().as_slice().to_vec();
    let reference = store.get("wfsref0").unwrap().as_slice();
    let weighted: f64 = reference.iter().zip(&mask).map(|(&r, &m)| f64::from(r * m)).sum();
    assert_abs_diff_eq!(weighted, 1.0, epsilon = 1e-5);

    let response = store.get("zrespm").unwrap().as_slice();
    for poke in 0..NB_POKE {
        let plane = &response[poke * 9..(poke + 1) * 9];
        let flux: f64 = plane.iter().zip(&mask).map(|(&r, &m)| f64::from(r * m)).sum();
        assert_abs_diff_eq!(flux, 0.0, epsilon = 1e-4);
        assert!(report.audits[poke].before > 1.0);
    }
    for name in ["wfsmap", "dmmap", "wfsmask", "dmmask", "wfsref0", "zrespm"] {
        assert!(store.contains(name), "missing {name}");
    }

    let log = fs::read_to_string(&audit_path).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    for (poke, line) in lines.iter().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields[0], poke.to_string());
        assert_eq!(fields[1], "000003");
        let after: f64 = fields[3].parse().unwrap();
        assert_abs_diff_eq!(after, 0.0, epsilon = 1e-4);
    }

    pipeline.make_control_matrix_from_config(&mut store).unwrap();
    assert_eq!(store.get("cmat").unwrap().shape(), &[3, 9]);
    // Without an actuator grid the DM mask is flat and cannot be slaved.
    assert!(matches!(
        pipeline.make_slaved_actuators_from_config(&mut store),
        Err(CalibError::ShapeMismatch { .. })
    ));
    assert!(!store.contains("dmslaved"));
    spiral_config::tracing::flush_chrome_trace();
}

/// Accepts every actuator but no sensor pixel.
struct BlindSensorMasks;

impl MaskGenerator for BlindSensorMasks {
    fn derive_masks(
        &self,
        _response: &NamedArray,
        maps: &SensitivityMaps,
        _params: &MaskParams,
    ) -> CalibResult<MaskPair> {
        Ok(MaskPair {
            wfs: NamedArray::zeros(maps.wfs.shape())?,
            dm: NamedArray::filled(maps.dm.shape(), 1.0)?,
        })
    }
}

#[test]
fn degenerate_mask_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CalibConfig::default();
    config.ensemble.dir = dir.path().to_path_buf();
    config.combiner.normalize_flux = false;
    let pipeline = CalibrationPipeline::new(config)
        .unwrap()
        .with_mask_generator(Box::new(BlindSensorMasks));
    let layout = pipeline.ensemble_layout();
    layout.write_count(3).unwrap();
    for k in 0..3 {
        let frames = frames_from(
            |p, i| 10.0 + pupil_weight(i) * (1 + p) as f32,
            |p, i| 10.0 - pupil_weight(i) * (1 + p) as f32,
        );
        layout.save_member(&JsonArrayIo, k, &frames).unwrap();
    }

    let previous = NamedArray::filled(&[1, 3, 3], 7.0).unwrap();
    let mut store = ArrayStore::new();
    store.insert("zrespm", previous.clone()).unwrap();
    let err = pipeline
        .process_ensemble(&mut store, &layout, &JsonArrayIo)
        .unwrap_err();
    assert!(matches!(err, CalibError::DegenerateMask { .. }));
    assert_eq!(store.names(), vec!["zrespm"]);
    assert_eq!(store.get("zrespm").unwrap(), &previous);
}

const GRID_POKES: usize = 9;

/// Pokes 0 and 8 (opposite corners of a 3x3 grid) barely move the sensor.
fn grid_amplitude(poke: usize) -> f32 {
    if poke == 0 || poke == 8 {
        0.01
    } else {
        1.0
    }
}

fn grid_pipeline(ensemble_dir: &Path, radius: f32) -> CalibrationPipeline {
    let text = format!(
        r#"
        [ensemble]
        dir = '{}'

        [combiner]
        normalize_flux = false

        [slave]
        search_radius = {radius:?}

        [runtime]
        actuator_grid = [3, 3]
        "#,
        ensemble_dir.display()
    );
    CalibrationPipeline::new(CalibConfig::from_toml_str(&text).unwrap()).unwrap()
}

#[test]
fn configured_grid_and_radius_drive_the_slave_stage() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ensemble_dir = dir.path().join("zresptmp");
    let layout = EnsembleLayout::new(&ensemble_dir, "zrespm");
    layout.write_count(3).unwrap();
    for k in 0..3 {
        let signal = |p: usize, i: usize| grid_amplitude(p) * pupil_weight(i);
        let frames = frames_with(
            GRID_POKES,
            |p, i| 10.0 * pupil_weight(i) + signal(p, i),
            |p, i| 10.0 * pupil_weight(i) - signal(p, i),
        );
        layout.save_member(&JsonArrayIo, k, &frames).unwrap();
    }

    let mut solved = Vec::new();
    for radius in [1.0f32, 1.5] {
        let pipeline = grid_pipeline(&ensemble_dir, radius);
        assert_eq!(pipeline.config().slave.search_radius, radius);
        let mut store = ArrayStore::new();
        let report = pipeline
            .process_ensemble(&mut store, &pipeline.ensemble_layout(), &JsonArrayIo)
            .unwrap();
        assert_eq!(report.nb_poke, GRID_POKES);
        assert_eq!(report.dm_valid, 7);
        let dm_mask = store.get("dmmask").unwrap();
        assert_eq!(dm_mask.shape(), &[3, 3]);
        assert_eq!(dm_mask.as_slice()[0], 0.0);
        assert_eq!(dm_mask.as_slice()[8], 0.0);

        let assignments = pipeline.make_slaved_actuators_from_config(&mut store).unwrap();
        solved.push((assignments, store.get("dmslaved").unwrap().clone()));
    }

    // Neighbours must lie strictly inside the radius: one pitch is out of reach at 1.0.
    let (near_assignments, near_map) = &solved[0];
    assert!(near_assignments.is_empty());
    assert!(near_map.as_slice().iter().all(|&v| v == 0.0));

    let (far_assignments, far_map) = &solved[1];
    let masters: Vec<_> = far_assignments.iter().map(|a| (a.slave, a.master)).collect();
    assert_eq!(masters, vec![((0, 0), (0, 1)), ((2, 2), (1, 2))]);
    assert_eq!(far_map.as_slice()[0], 1.0);
    assert_eq!(far_map.as_slice()[8], 1.0);
    assert_eq!(far_map.as_slice()[4], 0.0);
    assert_ne!(near_map, far_map);
}

#[test]
fn missing_or_short_ensembles_abort() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CalibConfig::default();
    config.ensemble.dir = dir.path().to_path_buf();
    let pipeline = CalibrationPipeline::new(config).unwrap();
    let layout = pipeline.ensemble_layout();
    let mut store = ArrayStore::new();

    let err = pipeline
        .process_ensemble(&mut store, &layout, &JsonArrayIo)
        .unwrap_err();
    assert!(matches!(err, CalibError::CountFile { .. }));

    layout.write_count(2).unwrap();
    let err = pipeline
        .process_ensemble(&mut store, &layout, &JsonArrayIo)
        .unwrap_err();
    assert!(matches!(
        err,
        CalibError::InsufficientEnsembles {
            found: 2,
            minimum: 3
        }
    ));
    assert!(store.is_empty());
}
