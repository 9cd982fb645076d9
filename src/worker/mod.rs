//! # Worker calibration stage
//!
//! [`process_chunk`] is the unit of work submitted to the pool. It reaches its photons
//! (owned copy or shared segments), resolves the reference data, runs
//! [`transforms::calibrate_slice`] and returns a [`ChunkOutput`] in the same mode as its
//! input: owned results for owned chunks, a result segment for shared chunks.
//!
//! A worker only reads shared inputs and writes its own result segment, so chunks never
//! contend with each other.
pub mod result;
pub mod transforms;

use std::{sync::Arc, time::Instant};

use tracing::debug;

use crate::{
    aspect::AspectSolution,
    band::{Band, DetectorOffsets},
    calibration::shared::CalibrationSource,
    chunking::ChunkInput,
    constants::Pixel,
    photonpipe_errors::{PipelineError, Result},
    shared_memory::SegmentDir,
    stim::StimCoefficients,
    worker::{
        result::{ChunkResult, SharedChunkResult},
        transforms::{calibrate_slice, TransformContext},
    },
};

/// Read-only inputs given to every worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub band: Band,
    pub calibration: CalibrationSource,
    pub aspect: Arc<AspectSolution>,
    pub stim: StimCoefficients,
    pub offsets: DetectorOffsets,
    pub stim_margin: Pixel,
    /// Directory of the run's segments; required for shared chunks.
    pub segment_dir: Option<SegmentDir>,
    pub verbose: u8,
}

/// Result of one chunk.
#[derive(Debug)]
pub enum ChunkOutput {
    Owned(ChunkResult),
    Shared(SharedChunkResult),
}

impl ChunkOutput {
    pub fn len(&self) -> usize {
        match self {
            ChunkOutput::Owned(r) => r.len(),
            ChunkOutput::Shared(r) => r.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ChunkOutput::Shared(_))
    }
}

/// Calibrate one chunk.
///
/// Arguments
/// -----------------
/// * `input`: the chunk, owned or shared.
/// * `ctx`: reference data, aspect and coefficients.
/// * `label`: progress label, e.g. `"2 of 3:"`.
///
/// Return
/// ----------
/// * The chunk result, or the first structural failure (segment attach, column lengths,
///   reference data).
pub fn process_chunk(input: &ChunkInput, ctx: &WorkerContext, label: &str) -> Result<ChunkOutput> {
    let start = Instant::now();
    let calibration = ctx.calibration.resolve()?;
    let tctx = TransformContext {
        band: ctx.band,
        calibration: &calibration,
        aspect: &ctx.aspect,
        stim: ctx.stim,
        offsets: ctx.offsets,
        stim_margin: ctx.stim_margin,
    };

    let output = match input {
        ChunkInput::Owned(chunk) => {
            let photons = chunk.photons.as_slice();
            photons.validate_len(chunk.range.len())?;
            ChunkOutput::Owned(calibrate_slice(photons, &tctx))
        }
        ChunkInput::Shared(chunk) => {
            let dir = ctx
                .segment_dir
                .as_ref()
                .ok_or_else(|| PipelineError::SegmentAttach {
                    name: chunk.columns.t.segment.to_string(),
                    reason: "no segment directory for a shared chunk".into(),
                })?;
            let attached = chunk.columns.attach(dir)?;
            let photons = attached.as_slice()?;
            photons.validate_len(chunk.range.len())?;
            let result = calibrate_slice(photons, &tctx);
            ChunkOutput::Shared(
                result.write_to_segment(dir, &format!("result-{}", chunk.range.index))?,
            )
        }
    };

    if ctx.verbose >= 2 {
        debug!(
            "{label} calibrated {} photons in {:.3} s",
            output.len(),
            start.elapsed().as_secs_f64()
        );
    }
    Ok(output)
}
