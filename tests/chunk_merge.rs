mod common;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use camino::Utf8Path;
use common::{synthetic_aspect, synthetic_stream, DT};
use photonpipe::{
    band::{Band, DetectorOffsets},
    calibration::{
        shared::{publish, CalibrationSource},
        CalibrationData, CalibrationEpoch,
    },
    chunking::{chunk_ranges, partition_shared},
    merge::ResultMerger,
    photonpipe_errors::PipelineError,
    pool::{first_failure, WorkerPool},
    shared_memory::SegmentDir,
    stim::StimCoefficients,
    worker::{process_chunk, result::ChunkResult, ChunkOutput, WorkerContext},
};

/// A result whose `t` column holds the global row indices of `start..start + len`.
fn indexed_result(start: usize, len: usize) -> ChunkResult {
    let mut r = ChunkResult {
        t: (start..start + len).map(|i| i as f64).collect(),
        ..Default::default()
    };
    r.flags = vec![0; len];
    r.x_raw = vec![0.0; len];
    r.y_raw = vec![0.0; len];
    r.xa = vec![0; len];
    r.xb = vec![0; len];
    r.ya = vec![0; len];
    r.yb = vec![0; len];
    r.q = vec![0; len];
    r.x = vec![0.0; len];
    r.y = vec![0.0; len];
    r.mask = vec![false; len];
    r.detrad = vec![0.0; len];
    r.response = vec![0.0; len];
    r.ra = vec![0.0; len];
    r.dec = vec![0.0; len];
    r
}

#[test]
fn test_large_exposure_merges_in_original_order() {
    let ranges = chunk_ranges(2_500_000, 1_000_000);
    assert_eq!(
        ranges.iter().map(|r| r.len()).collect::<Vec<_>>(),
        vec![1_000_000, 1_000_000, 500_000]
    );

    // the first chunk finishes last
    let pool = WorkerPool::new(Some(3)).unwrap();
    let tasks = ranges.iter().map(|r| (r.index, *r)).collect::<Vec<_>>();
    let outcomes = pool.fan_out(tasks, |index, range| {
        std::thread::sleep(Duration::from_millis(60 * (3 - index as u64)));
        Ok(ChunkOutput::Owned(indexed_result(range.start, range.len())))
    });
    let merged = ResultMerger::new(ranges.len())
        .merge(first_failure(outcomes).unwrap())
        .unwrap();

    assert_eq!(merged.len(), 2_500_000);
    assert!(merged
        .t
        .iter()
        .enumerate()
        .all(|(i, t)| *t == i as f64));
}

#[test]
fn test_failed_fan_out_leaves_no_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = SegmentDir::create(Utf8Path::from_path(tmp.path()).unwrap()).unwrap();
    let band = Band::Nuv;
    let stream = synthetic_stream(band, 1000, 42, 0.0);

    let (chunks, shared_stream) = partition_shared(&stream, 150, &dir).unwrap();
    let (handles, calibration_segment) =
        publish(&CalibrationData::nominal(band, CalibrationEpoch::Early), &dir).unwrap();
    let ctx = WorkerContext {
        band,
        calibration: CalibrationSource::shared(dir.clone(), handles),
        aspect: Arc::new(synthetic_aspect(1000.0 * DT)),
        stim: StimCoefficients::default(),
        offsets: DetectorOffsets::default(),
        stim_margin: 20.0,
        segment_dir: Some(dir.clone()),
        verbose: 0,
    };
    let total = chunks.len();
    assert_eq!(total, 7);

    let pool = WorkerPool::new(Some(3)).unwrap();
    let tasks = chunks
        .into_iter()
        .map(|c| (c.range().index, c))
        .collect::<Vec<_>>();
    let outcomes = pool.fan_out(tasks, |index, chunk| {
        if index == 4 || index == 5 {
            return Err(PipelineError::MissingChunk(index));
        }
        process_chunk(&chunk, &ctx, &format!("{} of {total}:", index + 1))
    });
    assert_eq!(outcomes.values().filter(|o| o.is_ok()).count(), 5);
    let successes: BTreeMap<usize, bool> = outcomes
        .iter()
        .map(|(i, o)| (*i, matches!(o, Ok(ChunkOutput::Shared(_)))))
        .collect();
    assert!(successes[&0] && successes[&6] && !successes[&4]);

    assert!(matches!(
        first_failure(outcomes),
        Err(PipelineError::MissingChunk(4))
    ));
    drop(shared_stream);
    drop(calibration_segment);

    assert_eq!(dir.segment_count(), 0);
    dir.remove().unwrap();
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}
