//! # Pipeline configuration
//!
//! [`PipelineConfig`] gathers every knob of a calibration run. Build it with
//! [`PipelineConfig::builder`]; [`PipelineConfigBuilder::build`] validates the values and
//! resolves the shared-memory default.
//!
//! Defaults
//! -----------------
//! | field | default |
//! |---|---|
//! | `band` | NUV |
//! | `chunk_size` | 1 000 000 photons |
//! | `threads` | `Some(4)`; `None` runs every chunk inline |
//! | `share_memory` | `threads.is_some()` |
//! | `retries` | 20 attempts |
//! | `overwrite` | `true` |
//! | `verbose` | 0 |
//! | `stim_margin` | [`STIM_MARGIN`] |
//! | `epoch_stim_margin` | [`EPOCH_STIM_MARGIN`] |
//! | `segment_dir` | [`SegmentDir::default_parent`] |
//! | `fuv_detector_temperature` | `None`: read from the exposure's spacecraft state |
use std::fmt;

use camino::Utf8PathBuf;

use crate::{
    band::{Band, DetectorOffsets},
    constants::{Pixel, EPOCH_STIM_MARGIN, STIM_MARGIN},
    photonpipe_errors::{PipelineError, Result},
    shared_memory::SegmentDir,
    stim::StimMargins,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub band: Band,
    /// Photons per chunk.
    pub chunk_size: usize,
    /// Worker threads; `None` processes chunks inline on the caller's thread.
    pub threads: Option<usize>,
    /// Pass photons and results through memory-mapped segments.
    pub share_memory: bool,
    /// Archive retrieval attempts.
    pub retries: u32,
    pub overwrite: bool,
    /// 0 quiet, 1 runtime summary, 2 per-chunk lines.
    pub verbose: u8,
    pub stim_margin: Pixel,
    pub epoch_stim_margin: Pixel,
    /// Parent directory of the run's segment directory.
    pub segment_dir: Utf8PathBuf,
    /// FUV detector temperature (°C) overriding the spacecraft state file.
    pub fuv_detector_temperature: Option<f64>,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    pub fn stim_margins(&self) -> StimMargins {
        StimMargins {
            stim: self.stim_margin,
            epoch: self.epoch_stim_margin,
        }
    }

    /// Offsets from the configuration alone; an FUV run without a temperature override
    /// uses the nominal temperature.
    pub fn detector_offsets(&self) -> DetectorOffsets {
        DetectorOffsets::for_band(self.band, self.fuv_detector_temperature)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            band: Band::Nuv,
            chunk_size: 1_000_000,
            threads: Some(4),
            share_memory: true,
            retries: 20,
            overwrite: true,
            verbose: 0,
            stim_margin: STIM_MARGIN,
            epoch_stim_margin: EPOCH_STIM_MARGIN,
            segment_dir: SegmentDir::default_parent(),
            fuv_detector_temperature: None,
        }
    }
}

/// Builder for [`PipelineConfig`], with validation.
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    params: PipelineConfig,
    share_memory: Option<bool>,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self {
            params: PipelineConfig::default(),
            share_memory: None,
        }
    }

    pub fn band(mut self, v: Band) -> Self {
        self.params.band = v;
        self
    }
    pub fn chunk_size(mut self, v: usize) -> Self {
        self.params.chunk_size = v;
        self
    }
    pub fn threads(mut self, v: Option<usize>) -> Self {
        self.params.threads = v;
        self
    }
    /// Force shared memory on or off; left unset it follows `threads`.
    pub fn share_memory(mut self, v: bool) -> Self {
        self.share_memory = Some(v);
        self
    }
    pub fn retries(mut self, v: u32) -> Self {
        self.params.retries = v;
        self
    }
    pub fn overwrite(mut self, v: bool) -> Self {
        self.params.overwrite = v;
        self
    }
    pub fn verbose(mut self, v: u8) -> Self {
        self.params.verbose = v;
        self
    }
    pub fn stim_margin(mut self, v: Pixel) -> Self {
        self.params.stim_margin = v;
        self
    }
    pub fn epoch_stim_margin(mut self, v: Pixel) -> Self {
        self.params.epoch_stim_margin = v;
        self
    }
    pub fn segment_dir(mut self, v: impl Into<Utf8PathBuf>) -> Self {
        self.params.segment_dir = v.into();
        self
    }
    pub fn fuv_detector_temperature(mut self, v: Option<f64>) -> Self {
        self.params.fuv_detector_temperature = v;
        self
    }

    #[inline]
    fn gt0(x: f64) -> bool {
        x.is_finite() && x > 0.0
    }

    /// Validate and return the configuration.
    ///
    /// Return
    /// ----------
    /// * The configuration, or [`PipelineError::InvalidConfig`] when
    ///   `chunk_size < 1`, `threads == Some(0)`, `retries < 1`, a margin is not strictly
    ///   positive, or `epoch_stim_margin < stim_margin`.
    pub fn build(mut self) -> Result<PipelineConfig> {
        let p = &self.params;
        if p.chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk_size must be >= 1".into(),
            ));
        }
        if p.threads == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "threads must be >= 1 when given".into(),
            ));
        }
        if p.retries == 0 {
            return Err(PipelineError::InvalidConfig("retries must be >= 1".into()));
        }
        if !Self::gt0(p.stim_margin) {
            return Err(PipelineError::InvalidConfig(
                "stim_margin must be > 0".into(),
            ));
        }
        if !Self::gt0(p.epoch_stim_margin) {
            return Err(PipelineError::InvalidConfig(
                "epoch_stim_margin must be > 0".into(),
            ));
        }
        if p.epoch_stim_margin < p.stim_margin {
            return Err(PipelineError::InvalidConfig(
                "require stim_margin <= epoch_stim_margin".into(),
            ));
        }

        self.params.share_memory = self
            .share_memory
            .unwrap_or(self.params.threads.is_some());
        Ok(self.params)
    }
}

fn fmt_threads(threads: Option<usize>) -> String {
    match threads {
        Some(n) => n.to_string(),
        None => "inline".into(),
    }
}

impl fmt::Display for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 44; // width reserved for "name = value"
            writeln!(f, "Photon Pipeline Configuration")?;
            writeln!(f, "-----------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Run]")?;
            line!("band              = {}", self.band, "Detector band")?;
            line!("overwrite         = {}", self.overwrite, "Replace an existing table")?;
            line!("retries           = {}", self.retries, "Archive retrieval attempts")?;
            line!("verbose           = {}", self.verbose, "Diagnostics level")?;

            writeln!(f, "\n[Parallelism]")?;
            line!("chunk_size        = {}", self.chunk_size, "Photons per chunk")?;
            line!(
                "threads           = {}",
                fmt_threads(self.threads),
                "Worker pool size"
            )?;
            line!(
                "share_memory      = {}",
                self.share_memory,
                "Memory-mapped segments"
            )?;
            line!("segment_dir       = {}", self.segment_dir, "Segment parent directory")?;

            writeln!(f, "\n[Detector]")?;
            line!(
                "stim_margin       = {:.3} px",
                self.stim_margin,
                "Stim classification box"
            )?;
            line!(
                "epoch_stim_margin = {:.3} px",
                self.epoch_stim_margin,
                "Epoch correction stim box"
            )?;
            line!(
                "fuv_temperature   = {}",
                self.fuv_detector_temperature
                    .map_or_else(|| "from scst".to_string(), |t| format!("{t:.1} C")),
                "FUV detector temperature"
            )?;

            Ok(())
        } else {
            write!(
                f,
                "PipelineConfig(band={}, chunk_size={}, threads={}, share_memory={}, retries={}, overwrite={}, verbose={}, stim_margin={:.1}, epoch_stim_margin={:.3})",
                self.band,
                self.chunk_size,
                fmt_threads(self.threads),
                self.share_memory,
                self.retries,
                self.overwrite,
                self.verbose,
                self.stim_margin,
                self.epoch_stim_margin,
            )
        }
    }
}
