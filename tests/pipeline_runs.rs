mod common;

use std::{fs::File, sync::Arc};

use approx::assert_relative_eq;
use common::{
    assert_same_table, synthetic_aspect, synthetic_stream, Fixture, LocalMirror, DT,
    SCST_TEMPERATURE, T0,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use photonpipe::{
    band::Band,
    calibration::{table_path, CalibrationData, CalibrationEpoch, TableKind},
    constants::{EPOCH_THRESHOLD, FLAG_STIM},
    photon_stream::PhotonStream,
    photonpipe_errors::PipelineError,
    pipeline::{ExposureRequest, PhotonPipe, RunOutcome, RunReport, RunWarning},
    worker::result::{ChunkResult, OutputColumn},
    writer::read_photon_table,
};

fn completed(outcome: RunOutcome) -> RunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::Skipped { outfile } => panic!("run skipped, {outfile} exists"),
    }
}

fn run_with(
    fixture: &Fixture,
    name: &str,
    threads: Option<usize>,
    share: bool,
    chunk_size: usize,
) -> (RunReport, ChunkResult) {
    let config = fixture
        .config()
        .threads(threads)
        .share_memory(share)
        .chunk_size(chunk_size)
        .build()
        .unwrap();
    let report = completed(
        PhotonPipe::new(config)
            .unwrap()
            .run(&fixture.request(name))
            .unwrap(),
    );
    let table = read_photon_table(&report.outfile).unwrap();
    (report, table)
}

#[test]
fn test_pool_modes_agree() {
    let fixture = Fixture::new(Band::Nuv, 23456, 4001, 7);
    let (reference, expected) = run_with(&fixture, "single", None, false, 100_000);
    assert_eq!(reference.chunks, 1);

    for (i, (threads, share)) in [
        (None, false),
        (Some(1), false),
        (Some(4), false),
        (Some(1), true),
        (Some(4), true),
    ]
    .into_iter()
    .enumerate()
    {
        let (report, table) = run_with(&fixture, &format!("mode-{i}"), threads, share, 1000);
        assert_eq!(report.chunks, 5);
        assert_eq!(report.input_events, 4001);
        assert_eq!(report.processed_events, 4001);
        assert!(report.warnings.is_empty());
        assert_same_table(&table, &expected);
    }
    assert_eq!(fixture.segment_leftovers(), 0);
}

#[test]
fn test_all_valid_stream_keeps_every_row() {
    let fixture = Fixture::new(Band::Fuv, 1200, 2500, 11);
    let (report, table) = run_with(&fixture, "fuv", Some(2), true, 600);

    let builder =
        ParquetRecordBatchReaderBuilder::try_new(File::open(&report.outfile).unwrap()).unwrap();
    let names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let expected: Vec<String> = OutputColumn::ALL.iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, expected);

    assert_eq!(table.len(), 2500);
    assert_eq!(table.t, fixture.stream.t);
    assert_eq!(table.q, fixture.stream.q);
    assert_eq!(
        table.flags.iter().filter(|f| *f & FLAG_STIM != 0).count(),
        250
    );
    assert!(table.ra.iter().chain(&table.dec).all(|v| v.is_finite()));
    assert!(table.response.iter().all(|r| (r - 1.0).abs() < 1e-6));
    let (first, last) = report.time_span.unwrap();
    assert!(first <= last);
}

#[test]
fn test_rerun_with_overwrite_is_identical() {
    let fixture = Fixture::new(Band::Nuv, 30000, 1500, 3);
    let (_, first) = run_with(&fixture, "same", Some(3), true, 400);
    let (_, second) = run_with(&fixture, "same", Some(3), true, 400);
    assert_same_table(&second, &first);
}

#[test]
fn test_existing_output_is_not_recomputed() {
    let fixture = Fixture::new(Band::Nuv, 30001, 500, 5);
    let (report, first) = run_with(&fixture, "keep", Some(2), false, 200);

    // without its telemetry the run could only fail if it recomputed
    std::fs::remove_file(&fixture.raw6).unwrap();
    let config = fixture.config().overwrite(false).build().unwrap();
    let outcome = PhotonPipe::new(config)
        .unwrap()
        .run(&fixture.request("keep"))
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Skipped {
            outfile: report.outfile.clone()
        }
    );
    assert_same_table(&read_photon_table(&report.outfile).unwrap(), &first);
}

#[test]
fn test_empty_exposure() {
    let fixture = Fixture::new(Band::Nuv, 4000, 0, 1);
    for (name, share) in [("empty-owned", false), ("empty-shared", true)] {
        let (report, table) = run_with(&fixture, name, Some(2), share, 1000);
        assert_eq!(report.chunks, 0);
        assert_eq!(report.input_events, 0);
        assert!(report.time_span.is_none());
        assert!(report.warnings.is_empty());
        assert!(table.is_empty());
    }
    assert_eq!(fixture.segment_leftovers(), 0);
}

#[test]
fn test_remainder_chunk_keeps_every_row() {
    let fixture = Fixture::new(Band::Nuv, 4500, 1001, 9);
    let (whole, expected) = run_with(&fixture, "whole", None, false, 2000);
    let (report, table) = run_with(&fixture, "split", Some(3), true, 250);
    assert_eq!(whole.chunks, 1);
    assert_eq!(report.chunks, 5);
    assert_eq!(table.len(), 1001);
    assert_same_table(&table, &expected);
}

#[test]
fn test_shared_memory_without_pool_warns() {
    let fixture = Fixture::new(Band::Nuv, 4501, 800, 13);
    let (_, expected) = run_with(&fixture, "plain", None, false, 300);
    let (report, table) = run_with(&fixture, "inline-shared", None, true, 300);
    assert_eq!(report.warnings, vec![RunWarning::SharedMemoryWithoutPool]);
    assert_same_table(&table, &expected);
    assert_eq!(fixture.segment_leftovers(), 0);
}

#[test]
fn test_epoch_correction_threshold() {
    let band = Band::Nuv;
    let n = 4000;
    let stream = synthetic_stream(band, n, 21, 0.02);
    let aspect = Arc::new(synthetic_aspect(n as f64 * DT));

    let calibrate = |eclipse| {
        let config = photonpipe::config::PipelineConfig::builder()
            .band(band)
            .threads(Some(2))
            .share_memory(false)
            .chunk_size(1000)
            .build()
            .unwrap();
        PhotonPipe::new(config)
            .unwrap()
            .calibrate(
                stream.clone(),
                eclipse,
                CalibrationData::nominal(band, CalibrationEpoch::of(eclipse)),
                Arc::clone(&aspect),
            )
            .unwrap()
    };

    let early = calibrate(EPOCH_THRESHOLD - 1);
    let late = calibrate(EPOCH_THRESHOLD);
    assert!(early.epoch.is_none());
    let epoch = late.epoch.expect("epoch correction above the threshold");
    assert!((epoch.slope - 0.02).abs() < 0.01, "slope {}", epoch.slope);

    assert_eq!(early.stim, late.stim);
    assert_eq!(early.result.x, late.result.x);
    assert_ne!(early.result.y, late.result.y);
}

#[test]
fn test_constant_stim_offset_corrected_once_across_threshold() {
    let band = Band::Nuv;
    let n = 2000;
    let mut stream = PhotonStream::with_capacity(n);
    for i in 0..n {
        let t = T0 + i as f64 * DT;
        let (x, y) = if i % 5 == 0 {
            let (sx, sy) = band.stim_positions()[(i / 5) % 4];
            (sx, sy + 4.0)
        } else {
            (400.0, 404.0)
        };
        stream.push(t, x as f32, y as f32, 0, 0, 0, 0, 20);
    }
    let aspect = Arc::new(synthetic_aspect(n as f64 * DT));

    let calibrate = |eclipse| {
        let config = photonpipe::config::PipelineConfig::builder()
            .band(band)
            .threads(Some(2))
            .share_memory(false)
            .chunk_size(500)
            .build()
            .unwrap();
        PhotonPipe::new(config)
            .unwrap()
            .calibrate(
                stream.clone(),
                eclipse,
                CalibrationData::nominal(band, CalibrationEpoch::of(eclipse)),
                Arc::clone(&aspect),
            )
            .unwrap()
    };

    let early = calibrate(EPOCH_THRESHOLD - 1);
    let late = calibrate(EPOCH_THRESHOLD);
    assert!(late.epoch.is_some());
    assert_relative_eq!(late.stim.y_offset, 4.0, epsilon = 1e-4);
    for (i, (e, l)) in early.result.y.iter().zip(&late.result.y).enumerate() {
        assert_relative_eq!(*e, *l, epsilon = 1e-3);
        if i % 5 != 0 {
            assert_relative_eq!(*l, 400.0, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_stim_offsets_shift_coordinates() {
    let fixture = Fixture::new(Band::Nuv, 2000, 3000, 17);
    let (_, table) = run_with(&fixture, "stims", Some(2), false, 1000);

    let shifts: Vec<f64> = table
        .flags
        .iter()
        .zip(table.x_raw.iter().zip(&table.x))
        .filter(|(flags, _)| **flags == 0)
        .map(|(_, (raw, x))| (*raw - *x) as f64)
        .collect();
    assert!(!shifts.is_empty());
    let mean = shifts.iter().sum::<f64>() / shifts.len() as f64;
    assert_relative_eq!(mean, 1.5, epsilon = 0.1);
}

#[test]
fn test_inputs_retrieved_from_archive() {
    let fixture = Fixture::new(Band::Nuv, 12345, 700, 23);
    let mirror = Arc::new(LocalMirror::new(&fixture.local));
    let config = fixture.config().threads(Some(2)).build().unwrap();
    let pipe = PhotonPipe::new(config).unwrap().with_archive(mirror.clone());

    let request = ExposureRequest::new(
        fixture.root.join("out").join("remote"),
        &fixture.calibration_dir,
        fixture.root.join("cache"),
    )
    .eclipse(fixture.eclipse);

    let report = completed(pipe.run(&request).unwrap());
    assert_eq!(report.processed_events, 700);
    assert_eq!(mirror.fetches.load(std::sync::atomic::Ordering::SeqCst), 2);

    // cached inputs are not fetched again
    completed(pipe.run(&request).unwrap());
    assert_eq!(mirror.fetches.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn test_fuv_offsets_from_retrieved_spacecraft_state() {
    let fixture = Fixture::new(Band::Fuv, 1500, 800, 31);
    let mirror = Arc::new(LocalMirror::new(&fixture.local));
    let config = fixture.config().threads(Some(2)).build().unwrap();
    let pipe = PhotonPipe::new(config).unwrap().with_archive(mirror.clone());

    let request = ExposureRequest::new(
        fixture.root.join("out").join("remote"),
        &fixture.calibration_dir,
        fixture.root.join("cache"),
    )
    .eclipse(fixture.eclipse);
    let report = completed(pipe.run(&request).unwrap());
    // telemetry, aspect and spacecraft state
    assert_eq!(mirror.fetches.load(std::sync::atomic::Ordering::SeqCst), 3);
    let remote = read_photon_table(&report.outfile).unwrap();

    let run_at = |name: &str, temperature: f64| {
        let config = fixture
            .config()
            .threads(Some(2))
            .fuv_detector_temperature(Some(temperature))
            .build()
            .unwrap();
        let report = completed(
            PhotonPipe::new(config)
                .unwrap()
                .run(&fixture.request(name))
                .unwrap(),
        );
        read_photon_table(&report.outfile).unwrap()
    };

    assert_same_table(&remote, &run_at("override-same", SCST_TEMPERATURE));
    let colder = run_at("override-colder", SCST_TEMPERATURE - 2.0);
    assert_eq!(colder.len(), remote.len());
    assert!(remote
        .y
        .iter()
        .zip(&colder.y)
        .any(|(a, b)| a.is_finite() && b.is_finite() && a != b));
}

#[test]
fn test_missing_calibration_table_fails_cleanly() {
    let fixture = Fixture::new(Band::Nuv, 40000, 600, 29);
    std::fs::remove_file(table_path(
        &fixture.calibration_dir,
        Band::Nuv,
        CalibrationEpoch::Late,
        TableKind::WalkY,
    ))
    .unwrap();

    let config = fixture.config().build().unwrap();
    let request = fixture.request("broken");
    let err = PhotonPipe::new(config).unwrap().run(&request).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::MissingCalibrationTable { eclipse: 40000, .. }
    ));
    assert!(!request.outfile().exists());
    assert_eq!(fixture.segment_leftovers(), 0);
}

#[test]
fn test_request_errors() {
    let fixture = Fixture::new(Band::Nuv, 500, 100, 31);

    let config = fixture.config().band(Band::Fuv).build().unwrap();
    assert_eq!(
        PhotonPipe::new(config)
            .unwrap()
            .run(&fixture.request("wrong-band")),
        Err(PipelineError::BandMismatch {
            requested: Band::Fuv,
            header: Band::Nuv
        })
    );

    let config = fixture.config().build().unwrap();
    let anonymous = ExposureRequest::new(
        fixture.root.join("out").join("anonymous"),
        &fixture.calibration_dir,
        fixture.root.join("cache"),
    );
    assert_eq!(
        PhotonPipe::new(config).unwrap().run(&anonymous),
        Err(PipelineError::MissingExposureId)
    );
}
