//! # Result merger
//!
//! Reassembles per-chunk outputs into the result of the whole exposure, strictly in
//! ascending chunk-index order. The merger also owns the shared resources of the run (the
//! column segments and the calibration segment) and releases them, together with every
//! result segment, once all columns have been retrieved.
//!
//! Checks
//! -----------------
//! * every index in `0..total` is present, otherwise [`PipelineError::MissingChunk`];
//! * all outputs use the same mode and no index lies beyond `total`, otherwise
//!   [`PipelineError::SchemaMismatch`];
//! * every column of every chunk has the chunk's length.
use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    photonpipe_errors::{PipelineError, Result},
    shared_memory::OwnedSegment,
    worker::{
        result::{ChunkResult, OutputColumn},
        ChunkOutput,
    },
};

#[derive(Debug, Default)]
pub struct ResultMerger {
    total: usize,
    shared_resources: Vec<OwnedSegment>,
}

impl ResultMerger {
    /// Merger expecting `total` chunks.
    pub fn new(total: usize) -> Self {
        ResultMerger {
            total,
            shared_resources: Vec::new(),
        }
    }

    /// Hand over segments to release once merging is done.
    pub fn with_shared_resources(mut self, segments: impl IntoIterator<Item = OwnedSegment>) -> Self {
        self.shared_resources.extend(segments);
        self
    }

    fn check_indices(&self, outputs: &BTreeMap<usize, ChunkOutput>) -> Result<()> {
        if let Some(missing) = (0..self.total).find(|i| !outputs.contains_key(i)) {
            return Err(PipelineError::MissingChunk(missing));
        }
        if let Some((&extra, _)) = outputs.range(self.total..).next() {
            return Err(PipelineError::SchemaMismatch {
                chunk: extra,
                detail: format!("unexpected chunk, only {} were submitted", self.total),
            });
        }
        if let Some((&first, output)) = outputs.iter().next() {
            let shared = output.is_shared();
            if let Some((&index, _)) = outputs.iter().find(|(_, o)| o.is_shared() != shared) {
                return Err(PipelineError::SchemaMismatch {
                    chunk: index,
                    detail: format!(
                        "{} result while chunk {first} is {}",
                        if shared { "owned" } else { "shared" },
                        if shared { "shared" } else { "owned" },
                    ),
                });
            }
        }
        Ok(())
    }

    /// Concatenate `outputs` in index order and release every shared resource.
    ///
    /// Arguments
    /// -----------------
    /// * `outputs`: chunk outputs keyed by chunk index.
    ///
    /// Return
    /// ----------
    /// * The merged result. On error the segments are still released when the merger and
    ///   the outputs are dropped.
    pub fn merge(self, outputs: BTreeMap<usize, ChunkOutput>) -> Result<ChunkResult> {
        self.check_indices(&outputs)?;
        let n: usize = outputs.values().map(ChunkOutput::len).sum();
        let mut merged = ChunkResult::with_capacity(n);

        let mut owned = Vec::new();
        let mut shared = Vec::new();
        for (index, output) in outputs {
            match output {
                ChunkOutput::Owned(r) => owned.push((index, r)),
                ChunkOutput::Shared(r) => shared.push((index, r)),
            }
        }

        for (index, result) in &owned {
            result.validate().map_err(|e| PipelineError::SchemaMismatch {
                chunk: *index,
                detail: e.to_string(),
            })?;
            merged.extend_from(result);
        }

        if !shared.is_empty() {
            let views = shared
                .iter()
                .map(|(_, r)| r.attach())
                .collect::<Result<Vec<_>>>()?;
            for column in OutputColumn::ALL {
                for ((index, result), view) in shared.iter().zip(&views) {
                    result
                        .read_column_into(view, column, &mut merged)
                        .map_err(|e| PipelineError::SchemaMismatch {
                            chunk: *index,
                            detail: e.to_string(),
                        })?;
                }
            }
            drop(views);

            for (_, result) in shared {
                result.release()?;
            }
        }

        let released = self.shared_resources.len();
        for segment in self.shared_resources {
            segment.unlink()?;
        }
        if released > 0 {
            debug!("Released {released} shared input segments");
        }

        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod merge_test {
    use camino::Utf8Path;

    use super::*;
    use crate::{shared_memory::SegmentDir, worker::result::result_test::sample_result};

    fn owned(parts: &[(usize, usize)]) -> BTreeMap<usize, ChunkOutput> {
        parts
            .iter()
            .map(|&(index, len)| {
                (
                    index,
                    ChunkOutput::Owned(sample_result(len, 1000.0 * index as f64)),
                )
            })
            .collect()
    }

    #[test]
    fn test_merge_in_index_order() {
        // inserted out of order on purpose
        let outputs = owned(&[(2, 5), (0, 10), (1, 10)]);
        let merged = ResultMerger::new(3).merge(outputs).unwrap();
        assert_eq!(merged.len(), 25);
        assert_eq!(merged.t[0], 0.0);
        assert_eq!(merged.t[10], 1000.0);
        assert_eq!(merged.t[20], 2000.0);
        assert_eq!(merged.t[24], 2004.0);
    }

    #[test]
    fn test_missing_and_extra_chunks() {
        assert_eq!(
            ResultMerger::new(3).merge(owned(&[(0, 1), (2, 1)])),
            Err(PipelineError::MissingChunk(1))
        );
        assert!(matches!(
            ResultMerger::new(1).merge(owned(&[(0, 1), (1, 1)])),
            Err(PipelineError::SchemaMismatch { chunk: 1, .. })
        ));
    }

    #[test]
    fn test_ragged_chunk_is_rejected() {
        let mut outputs = owned(&[(0, 3), (1, 3)]);
        if let Some(ChunkOutput::Owned(r)) = outputs.get_mut(&1) {
            r.dec.pop();
        }
        assert!(matches!(
            ResultMerger::new(2).merge(outputs),
            Err(PipelineError::SchemaMismatch { chunk: 1, .. })
        ));
    }

    #[test]
    fn test_shared_merge_releases_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SegmentDir::create(Utf8Path::from_path(tmp.path()).unwrap()).unwrap();

        let parts = [sample_result(4, 0.0), sample_result(3, 50.0)];
        let outputs: BTreeMap<usize, ChunkOutput> = parts
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let shared = r.write_to_segment(&dir, &format!("result-{i}")).unwrap();
                (i, ChunkOutput::Shared(shared))
            })
            .collect();
        let mut input = dir.allocate("photons-t", 8).unwrap();
        input.write(0, &[1.0_f64]).unwrap();
        let input = input.seal().unwrap();
        assert_eq!(dir.segment_count(), 3);

        let merged = ResultMerger::new(2)
            .with_shared_resources([input])
            .merge(outputs)
            .unwrap();
        assert_eq!(merged, ChunkResult::concat(&parts));
        assert_eq!(dir.segment_count(), 0);
    }

    #[test]
    fn test_mixed_modes_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SegmentDir::create(Utf8Path::from_path(tmp.path()).unwrap()).unwrap();

        let mut outputs = owned(&[(0, 2)]);
        let shared = sample_result(2, 9.0).write_to_segment(&dir, "result-1").unwrap();
        outputs.insert(1, ChunkOutput::Shared(shared));

        assert!(matches!(
            ResultMerger::new(2).merge(outputs),
            Err(PipelineError::SchemaMismatch { chunk: 1, .. })
        ));
        // the dropped shared output removed its segment
        assert_eq!(dir.segment_count(), 0);
    }
}
