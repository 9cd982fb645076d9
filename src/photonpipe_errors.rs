use camino::Utf8PathBuf;
use thiserror::Error;

use crate::{band::Band, constants::ExposureId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Structural decoding failures of a raw telemetry file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryParseError {
    #[error("Bad magic bytes: expected RAW6, found {0:?}")]
    BadMagic(Vec<u8>),

    #[error("Unsupported telemetry format version {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown band code {0}")]
    UnknownBandCode(u8),

    #[error("Truncated file: header announces {expected} events, payload holds {found} bytes")]
    Truncated { expected: u64, found: usize },

    #[error("{0} unexpected trailing bytes after the last event")]
    TrailingBytes(usize),

    #[error("Header is incomplete ({0} bytes)")]
    IncompleteHeader(usize),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow_schema::ArrowError),

    #[error("HTTP ureq error: {0}")]
    UreqHttpError(#[from] ureq::Error),

    #[error("Unable to build the worker pool: {0}")]
    WorkerPoolError(#[from] rayon::ThreadPoolBuildError),

    #[error("Malformed telemetry file: {0}")]
    MalformedTelemetry(#[from] TelemetryParseError),

    #[error("Unknown band: {0}")]
    UnknownBand(String),

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("An exposure id is required to retrieve data that is not available locally")]
    MissingExposureId,

    #[error("Exposure id mismatch: requested {requested}, telemetry header holds {header}")]
    ExposureMismatch {
        requested: ExposureId,
        header: ExposureId,
    },

    #[error("Band mismatch: requested {requested}, telemetry header holds {header}")]
    BandMismatch { requested: Band, header: Band },

    #[error("Missing calibration table {table} for {band} exposure {eclipse} (looked in {path})")]
    MissingCalibrationTable {
        band: Band,
        eclipse: ExposureId,
        table: String,
        path: Utf8PathBuf,
    },

    #[error("Malformed calibration table {path}: {reason}")]
    MalformedCalibrationTable { path: Utf8PathBuf, reason: String },

    #[error("Invalid aspect solution: {0}")]
    InvalidAspect(String),

    #[error("Invalid spacecraft state file {path}: {reason}")]
    InvalidSpacecraftState { path: Utf8PathBuf, reason: String },

    #[error("Retrieval of {product} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        product: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Unable to allocate shared segment {name}: {reason}")]
    SegmentAllocation { name: String, reason: String },

    #[error("Unable to attach shared segment {name}: {reason}")]
    SegmentAttach { name: String, reason: String },

    #[error("Column {column} has length {found}, expected {expected}")]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Schema mismatch in chunk {chunk}: {detail}")]
    SchemaMismatch { chunk: usize, detail: String },

    #[error("Result of chunk {0} is missing")]
    MissingChunk(usize),

    #[error("Malformed photon table {path}: {reason}")]
    MalformedPhotonTable { path: Utf8PathBuf, reason: String },
}

impl PartialEq for PipelineError {
    fn eq(&self, other: &Self) -> bool {
        use PipelineError::*;
        match (self, other) {
            // Foreign errors are not comparable: same variant means equal
            (IoError(_), IoError(_)) => true,
            (ParquetError(_), ParquetError(_)) => true,
            (ArrowError(_), ArrowError(_)) => true,
            (UreqHttpError(_), UreqHttpError(_)) => true,
            (WorkerPoolError(_), WorkerPoolError(_)) => true,

            (MalformedTelemetry(a), MalformedTelemetry(b)) => a == b,
            (UnknownBand(a), UnknownBand(b)) => a == b,
            (InvalidConfig(a), InvalidConfig(b)) => a == b,
            (MissingExposureId, MissingExposureId) => true,
            (
                ExposureMismatch {
                    requested: r1,
                    header: h1,
                },
                ExposureMismatch {
                    requested: r2,
                    header: h2,
                },
            ) => r1 == r2 && h1 == h2,
            (
                BandMismatch {
                    requested: r1,
                    header: h1,
                },
                BandMismatch {
                    requested: r2,
                    header: h2,
                },
            ) => r1 == r2 && h1 == h2,
            (
                MissingCalibrationTable {
                    band: b1,
                    eclipse: e1,
                    table: t1,
                    ..
                },
                MissingCalibrationTable {
                    band: b2,
                    eclipse: e2,
                    table: t2,
                    ..
                },
            ) => b1 == b2 && e1 == e2 && t1 == t2,
            (MalformedCalibrationTable { path: a, .. }, MalformedCalibrationTable { path: b, .. }) => {
                a == b
            }
            (InvalidAspect(a), InvalidAspect(b)) => a == b,
            (
                InvalidSpacecraftState { path: a, .. },
                InvalidSpacecraftState { path: b, .. },
            ) => a == b,
            (
                RetriesExhausted {
                    product: p1,
                    attempts: a1,
                    ..
                },
                RetriesExhausted {
                    product: p2,
                    attempts: a2,
                    ..
                },
            ) => p1 == p2 && a1 == a2,
            (SegmentAllocation { name: a, .. }, SegmentAllocation { name: b, .. }) => a == b,
            (SegmentAttach { name: a, .. }, SegmentAttach { name: b, .. }) => a == b,
            (
                ColumnLengthMismatch {
                    column: c1,
                    expected: e1,
                    found: f1,
                },
                ColumnLengthMismatch {
                    column: c2,
                    expected: e2,
                    found: f2,
                },
            ) => c1 == c2 && e1 == e2 && f1 == f2,
            (SchemaMismatch { chunk: a, .. }, SchemaMismatch { chunk: b, .. }) => a == b,
            (MissingChunk(a), MissingChunk(b)) => a == b,
            (MalformedPhotonTable { path: a, .. }, MalformedPhotonTable { path: b, .. }) => a == b,

            _ => false,
        }
    }
}
