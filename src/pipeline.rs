//! # Run orchestration
//!
//! [`PhotonPipe`] owns the configuration, the archive client and the worker pool, and runs
//! one exposure end to end:
//!
//! 1. skip when the output exists and overwriting is disabled;
//! 2. locate (or retrieve) and decode the raw telemetry, check its header;
//! 3. load the aspect solution, the calibration reference data and, for FUV, the
//!    spacecraft state that sets the detector offsets;
//! 4. apply the stim and epoch corrections on the whole stream;
//! 5. partition, publish the side inputs, fan the chunks out to the pool;
//! 6. merge in chunk-index order and write the photon table.
//!
//! Shared segments live in a run-scoped [`SegmentDir`] that is removed when step 5-6 ends,
//! whether it succeeded or not.
//!
//! ## See also
//! ------------
//! * [`crate::config::PipelineConfig`] – Every knob of a run.
//! * [`RunReport`] – Diagnostics of a completed run.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use hifitime::Epoch;
use tracing::{debug, info, warn};

use crate::{
    archive::{ArchiveClient, OfflineArchive},
    aspect::{load_aspect, AspectSolution},
    band::{Band, DetectorOffsets},
    calibration::{
        shared::{publish, CalibrationSource},
        CalibrationData,
    },
    chunking::{partition_shared, partition_unshared},
    config::PipelineConfig,
    constants::{ExposureId, Seconds},
    merge::ResultMerger,
    photon_stream::PhotonStream,
    photonpipe_errors::Result,
    pool::{first_failure, WorkerPool},
    progress_bar::{fmt_dur, ChunkProgress},
    scst::load_scst,
    shared_memory::SegmentDir,
    stim::{correct_stream, EpochCoefficients, StimCoefficients},
    telemetry::{check_header, load_raw6, resolve_raw6},
    worker::{process_chunk, result::ChunkResult, WorkerContext},
    writer::{output_path, write_photon_table},
};

/// Degraded-but-successful conditions of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunWarning {
    /// Shared memory was requested without a worker pool.
    SharedMemoryWithoutPool,
    /// Fewer events came out of the merge than went into the partitioner.
    ///
    /// The merger already refuses missing chunks and ragged columns, so this only fires if
    /// a worker returned a well-formed but shortened chunk.
    MissingEvents { input: usize, processed: usize },
}

impl RunWarning {
    /// Warning for a run that processed fewer events than it read, if any.
    pub fn missing_events(input: usize, processed: usize) -> Option<Self> {
        (processed < input).then_some(RunWarning::MissingEvents { input, processed })
    }
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::SharedMemoryWithoutPool => {
                write!(f, "shared memory requested without a worker pool")
            }
            RunWarning::MissingEvents { input, processed } => write!(
                f,
                "processed {processed} of {input} input events ({} missing)",
                input - processed
            ),
        }
    }
}

/// Inputs and outputs of one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    /// Raw telemetry file; retrieved into `download_dir` when absent.
    pub raw6: Option<Utf8PathBuf>,
    /// Exposure id; read from the telemetry header when not given.
    pub eclipse: Option<ExposureId>,
    /// Aspect file; retrieved into `download_dir` when absent.
    pub aspect: Option<Utf8PathBuf>,
    /// Spacecraft state file, read by FUV runs; retrieved into `download_dir` when absent.
    pub scst: Option<Utf8PathBuf>,
    pub calibration_dir: Utf8PathBuf,
    /// Output path without extension.
    pub outbase: Utf8PathBuf,
    pub download_dir: Utf8PathBuf,
}

impl ExposureRequest {
    pub fn new(
        outbase: impl Into<Utf8PathBuf>,
        calibration_dir: impl Into<Utf8PathBuf>,
        download_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        ExposureRequest {
            raw6: None,
            eclipse: None,
            aspect: None,
            scst: None,
            calibration_dir: calibration_dir.into(),
            outbase: outbase.into(),
            download_dir: download_dir.into(),
        }
    }

    pub fn raw6(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.raw6 = Some(path.into());
        self
    }

    pub fn eclipse(mut self, eclipse: ExposureId) -> Self {
        self.eclipse = Some(eclipse);
        self
    }

    pub fn aspect(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.aspect = Some(path.into());
        self
    }

    pub fn scst(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.scst = Some(path.into());
        self
    }

    pub fn outfile(&self) -> Utf8PathBuf {
        output_path(&self.outbase)
    }
}

/// Calibrated photons of one exposure, before writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrated {
    pub result: ChunkResult,
    pub chunks: usize,
    pub stim: StimCoefficients,
    pub epoch: Option<EpochCoefficients>,
    pub warnings: Vec<RunWarning>,
}

/// Diagnostics of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outfile: Utf8PathBuf,
    pub band: Band,
    pub eclipse: ExposureId,
    pub input_events: usize,
    pub processed_events: usize,
    pub chunks: usize,
    pub runtime: Duration,
    /// First and last photon time, in spacecraft clock seconds.
    pub time_span: Option<(Seconds, Seconds)>,
    pub warnings: Vec<RunWarning>,
}

impl RunReport {
    /// [`RunReport::time_span`] read on the GPS time scale.
    ///
    /// The spacecraft clock counts SI seconds from the GPS epoch (1980-01-06T00:00:00 UTC);
    /// this is only meaningful for telemetry that follows that convention.
    pub fn gps_time_span(&self) -> Option<(Epoch, Epoch)> {
        self.time_span
            .map(|(first, last)| (Epoch::from_gpst_seconds(first), Epoch::from_gpst_seconds(last)))
    }

    /// Processed events per second of wall time.
    pub fn rate(&self) -> f64 {
        let secs = self.runtime.as_secs_f64();
        if secs > 0.0 {
            self.processed_events as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exposure {}: {} of {} events in {} chunks, {} ({:.0} events/s)",
            self.band,
            self.eclipse,
            self.processed_events,
            self.input_events,
            self.chunks,
            fmt_dur(self.runtime),
            self.rate()
        )?;
        if let Some((first, last)) = self.time_span {
            write!(f, ", span [{first:.3}, {last:.3}] s")?;
        }
        write!(f, " -> {}", self.outfile)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// The output existed and overwriting was disabled; nothing was computed.
    Skipped { outfile: Utf8PathBuf },
}

impl RunOutcome {
    pub fn outfile(&self) -> &Utf8Path {
        match self {
            RunOutcome::Completed(report) => &report.outfile,
            RunOutcome::Skipped { outfile } => outfile,
        }
    }
}

fn time_span(t: &[Seconds]) -> Option<(Seconds, Seconds)> {
    t.iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<(Seconds, Seconds)>, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
        })
}

pub struct PhotonPipe {
    config: PipelineConfig,
    archive: Arc<dyn ArchiveClient>,
    pool: WorkerPool,
}

impl PhotonPipe {
    /// Pipeline with no remote archive: every input must already be on disk.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let pool = WorkerPool::new(config.threads)?;
        Ok(PhotonPipe {
            config,
            archive: Arc::new(OfflineArchive),
            pool,
        })
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveClient>) -> Self {
        self.archive = archive;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Calibrate one exposure and write its photon table.
    ///
    /// Arguments
    /// -----------------
    /// * `request`: input locations and output base name.
    ///
    /// Return
    /// ----------
    /// * [`RunOutcome::Completed`] with the run diagnostics, or [`RunOutcome::Skipped`]
    ///   when the output exists and `overwrite` is disabled. Structural failures abort the
    ///   run without committing an output file.
    pub fn run(&self, request: &ExposureRequest) -> Result<RunOutcome> {
        let start = Instant::now();
        let config = &self.config;
        let outfile = request.outfile();
        if outfile.exists() && !config.overwrite {
            info!("{outfile} exists and overwrite is disabled, skipping");
            return Ok(RunOutcome::Skipped { outfile });
        }

        let raw6 = resolve_raw6(
            request.raw6.as_deref(),
            request.eclipse,
            config.band,
            self.archive.as_ref(),
            config.retries,
            &request.download_dir,
        )?;
        let (header, stream) = load_raw6(&raw6)?;
        let eclipse = check_header(&header, config.band, request.eclipse)?;

        let aspect = load_aspect(
            request.aspect.as_deref(),
            eclipse,
            self.archive.as_ref(),
            config.retries,
            &request.download_dir,
        )?;
        let calibration = CalibrationData::load(&request.calibration_dir, config.band, eclipse)?;
        let offsets = self.detector_offsets(request, eclipse)?;

        let input_events = stream.len();
        let calibrated =
            self.calibrate_with_offsets(stream, eclipse, calibration, Arc::new(aspect), offsets)?;
        let outcome = write_photon_table(&calibrated.result, &outfile, config.overwrite)?;

        let report = RunReport {
            outfile: outcome.path().to_path_buf(),
            band: config.band,
            eclipse,
            input_events,
            processed_events: calibrated.result.len(),
            chunks: calibrated.chunks,
            runtime: start.elapsed(),
            time_span: time_span(&calibrated.result.t),
            warnings: calibrated.warnings,
        };
        if config.verbose >= 1 {
            info!("{report}");
        }
        Ok(RunOutcome::Completed(report))
    }

    /// Detector offsets of the exposure.
    ///
    /// NUV has none. FUV takes the configured temperature override when there is one,
    /// otherwise the temperature recorded in the spacecraft state file.
    fn detector_offsets(
        &self,
        request: &ExposureRequest,
        eclipse: ExposureId,
    ) -> Result<DetectorOffsets> {
        let config = &self.config;
        if config.band == Band::Nuv || config.fuv_detector_temperature.is_some() {
            return Ok(config.detector_offsets());
        }
        let state = load_scst(
            request.scst.as_deref(),
            eclipse,
            self.archive.as_ref(),
            config.retries,
            &request.download_dir,
        )?;
        Ok(state.fuv_offsets())
    }

    /// Run the corrections and the chunked calibration on a decoded stream, with the
    /// detector offsets derived from the configuration alone.
    pub fn calibrate(
        &self,
        stream: PhotonStream,
        eclipse: ExposureId,
        calibration: CalibrationData,
        aspect: Arc<AspectSolution>,
    ) -> Result<Calibrated> {
        let offsets = self.config.detector_offsets();
        self.calibrate_with_offsets(stream, eclipse, calibration, aspect, offsets)
    }

    /// Run the corrections and the chunked calibration on a decoded stream.
    ///
    /// Arguments
    /// -----------------
    /// * `stream`: the whole decoded photon stream.
    /// * `eclipse`: exposure id, selects the epoch correction.
    /// * `calibration`: reference data of the exposure.
    /// * `aspect`: pointing solution of the exposure.
    /// * `offsets`: fixed detector offsets applied by every worker.
    ///
    /// Return
    /// ----------
    /// * The merged result with the number of chunks, the coefficients and warnings.
    pub fn calibrate_with_offsets(
        &self,
        stream: PhotonStream,
        eclipse: ExposureId,
        calibration: CalibrationData,
        aspect: Arc<AspectSolution>,
        offsets: DetectorOffsets,
    ) -> Result<Calibrated> {
        let config = &self.config;
        let mut warnings = Vec::new();
        if config.share_memory && self.pool.is_inline() {
            warn!("Shared memory requested without a worker pool; chunks run inline");
            warnings.push(RunWarning::SharedMemoryWithoutPool);
        }

        let input_events = stream.len();
        let (stream, stim, epoch) =
            correct_stream(stream, config.band, eclipse, config.stim_margins());

        let dir = if config.share_memory {
            Some(SegmentDir::create(&config.segment_dir)?)
        } else {
            None
        };
        let merged = self.fan_out_chunks(
            &stream,
            eclipse,
            calibration,
            aspect,
            (stim, offsets),
            dir.as_ref(),
        );
        if let Some(dir) = dir {
            match (&merged, dir.remove()) {
                (Ok(_), Err(e)) => return Err(e),
                (Err(_), Err(e)) => warn!("Unable to remove the segment directory: {e}"),
                _ => {}
            }
        }
        let (result, chunks) = merged?;

        if let Some(w) = RunWarning::missing_events(input_events, result.len()) {
            warn!("Exposure {eclipse}: {w}");
            warnings.push(w);
        }

        Ok(Calibrated {
            result,
            chunks,
            stim,
            epoch,
            warnings,
        })
    }

    fn fan_out_chunks(
        &self,
        stream: &PhotonStream,
        eclipse: ExposureId,
        calibration: CalibrationData,
        aspect: Arc<AspectSolution>,
        (stim, offsets): (StimCoefficients, DetectorOffsets),
        dir: Option<&SegmentDir>,
    ) -> Result<(ChunkResult, usize)> {
        let config = &self.config;
        let (chunks, shared_resources, calibration) = match dir {
            Some(dir) => {
                let (chunks, shared_stream) = partition_shared(stream, config.chunk_size, dir)?;
                let (handles, calibration_segment) = publish(&calibration, dir)?;
                let mut resources = shared_stream.into_segments();
                resources.push(calibration_segment);
                let source = CalibrationSource::shared(dir.clone(), handles);
                (chunks, resources, source)
            }
            None => (
                partition_unshared(stream, config.chunk_size),
                Vec::new(),
                CalibrationSource::Owned(Arc::new(calibration)),
            ),
        };

        let total = chunks.len();
        info!(
            "Calibrating {} photons of {} exposure {eclipse} in {total} chunks ({}, {})",
            stream.len(),
            config.band,
            if dir.is_some() { "shared" } else { "owned" },
            match self.pool.threads() {
                Some(n) => format!("{n} workers"),
                None => "inline".to_string(),
            }
        );

        let ctx = WorkerContext {
            band: config.band,
            calibration,
            aspect,
            stim,
            offsets,
            stim_margin: config.stim_margin,
            segment_dir: dir.cloned(),
            verbose: config.verbose,
        };
        let progress = ChunkProgress::new(total);
        let tasks = chunks
            .into_iter()
            .map(|chunk| (chunk.range().index, chunk))
            .collect::<Vec<_>>();

        let outcomes = self.pool.fan_out(tasks, |index, chunk| {
            let label = format!("{} of {total}:", index + 1);
            let output = process_chunk(&chunk, &ctx, &label)?;
            progress.chunk_done(&label);
            Ok(output)
        });
        if total > 0 {
            debug!(
                "{} chunks done, {} between chunks on average",
                progress.done(),
                fmt_dur(progress.avg_chunk_time())
            );
        }
        progress.finish();

        let outputs = first_failure(outcomes)?;
        let merged = ResultMerger::new(total)
            .with_shared_resources(shared_resources)
            .merge(outputs)?;
        Ok((merged, total))
    }
}

#[cfg(test)]
mod pipeline_test {
    use super::*;
    use crate::calibration::CalibrationEpoch;

    fn stream(n: usize) -> PhotonStream {
        let mut s = PhotonStream::with_capacity(n);
        for i in 0..n {
            let f = (i % 97) as f32;
            s.push(
                1.0e8 + 0.01 * i as f64,
                200.0 + 4.0 * f,
                300.0 + 3.0 * f,
                (i % 32) as u8,
                ((i + 1) % 32) as u8,
                ((i + 2) % 32) as u8,
                ((i + 3) % 32) as u8,
                (i % 31) as u8,
            );
        }
        s
    }

    fn aspect() -> Arc<AspectSolution> {
        let time: Vec<f64> = (0..20).map(|i| 1.0e8 + i as f64).collect();
        Arc::new(
            AspectSolution::new(
                time,
                (0..20).map(|i| 150.0 + 0.001 * i as f64).collect(),
                vec![2.5; 20],
                vec![45.0; 20],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_time_span() {
        assert_eq!(time_span(&[]), None);
        assert_eq!(time_span(&[5.0, f64::NAN, 1.0, 3.0]), Some((1.0, 5.0)));
    }

    #[test]
    fn test_modes_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let parent = Utf8Path::from_path(tmp.path()).unwrap();
        let calibration = CalibrationData::nominal(Band::Nuv, CalibrationEpoch::Early);

        let run = |threads: Option<usize>, share: bool| {
            let config = PipelineConfig::builder()
                .chunk_size(300)
                .threads(threads)
                .share_memory(share)
                .segment_dir(parent)
                .build()
                .unwrap();
            PhotonPipe::new(config)
                .unwrap()
                .calibrate(stream(1000), 1000, calibration.clone(), aspect())
                .unwrap()
        };

        let reference = run(None, false);
        assert_eq!(reference.chunks, 4);
        assert_eq!(reference.result.len(), 1000);
        assert!(reference.warnings.is_empty());
        for (threads, share) in [(Some(1), false), (Some(3), false), (Some(3), true)] {
            let other = run(threads, share);
            assert_eq!(other.result, reference.result);
            assert!(other.warnings.is_empty());
        }

        let inline_shared = run(None, true);
        assert_eq!(inline_shared.result, reference.result);
        assert_eq!(
            inline_shared.warnings,
            vec![RunWarning::SharedMemoryWithoutPool]
        );

        // every run removed its segment directory
        assert_eq!(std::fs::read_dir(parent).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_events_warning() {
        assert_eq!(RunWarning::missing_events(10, 10), None);
        assert_eq!(RunWarning::missing_events(0, 0), None);
        assert_eq!(
            RunWarning::missing_events(10, 7),
            Some(RunWarning::MissingEvents {
                input: 10,
                processed: 7
            })
        );
    }

    #[test]
    fn test_shortened_chunk_is_a_warning() {
        use crate::worker::{result::result_test::sample_result, ChunkOutput};

        // 100 events read, the second chunk came back 3 rows short but well formed
        let outputs = [(0, 40), (1, 37), (2, 20)]
            .into_iter()
            .map(|(index, len)| (index, ChunkOutput::Owned(sample_result(len, index as f64))))
            .collect();
        let merged = ResultMerger::new(3).merge(outputs).unwrap();
        assert_eq!(merged.len(), 97);

        let warning = RunWarning::missing_events(100, merged.len()).unwrap();
        assert_eq!(warning.to_string(), "processed 97 of 100 input events (3 missing)");
    }

    #[test]
    fn test_report_display() {
        let report = RunReport {
            outfile: Utf8PathBuf::from("/out/e01000-nd.parquet"),
            band: Band::Nuv,
            eclipse: 1000,
            input_events: 10,
            processed_events: 10,
            chunks: 1,
            runtime: Duration::from_millis(500),
            time_span: None,
            warnings: Vec::new(),
        };
        assert_eq!(report.rate(), 20.0);
        assert_eq!(
            report.to_string(),
            "NUV exposure 1000: 10 of 10 events in 1 chunks, 500ms (20 events/s) -> /out/e01000-nd.parquet"
        );
        assert_eq!(
            RunWarning::MissingEvents {
                input: 10,
                processed: 7
            }
            .to_string(),
            "processed 7 of 10 input events (3 missing)"
        );
    }

    #[test]
    fn test_time_span_is_spacecraft_seconds() {
        let report = RunReport {
            outfile: Utf8PathBuf::from("out.parquet"),
            band: Band::Fuv,
            eclipse: 2,
            input_events: 4,
            processed_events: 4,
            chunks: 1,
            runtime: Duration::from_secs(2),
            time_span: Some((100.0, 104.5)),
            warnings: Vec::new(),
        };
        assert_eq!(
            report.to_string(),
            "FUV exposure 2: 4 of 4 events in 1 chunks, 2.00s (2 events/s), span [100.000, 104.500] s -> out.parquet"
        );
        let (first, last) = report.gps_time_span().unwrap();
        assert_eq!(first, Epoch::from_gpst_seconds(100.0));
        assert_eq!((last - first).to_seconds(), 4.5);
    }
}
