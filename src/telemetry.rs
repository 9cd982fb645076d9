//! # Raw telemetry loader
//!
//! Decoder and encoder for the binary raw event files (`RAW6`), one file per band and
//! exposure. The decoder is a small [`nom`] parser; every structural problem is reported as
//! a [`TelemetryParseError`] wrapped in [`PipelineError::MalformedTelemetry`].
//!
//! # Layout (little endian)
//!
//! ```text
//! header (20 bytes)
//!   0..4    magic     b"RAW6"
//!   4..6    version   u16 (= 1)
//!   6       band      u8  (1 = NUV, 2 = FUV)
//!   7       reserved  u8
//!   8..12   eclipse   u32
//!   12..20  count     u64
//! record (22 bytes, repeated `count` times)
//!   t f64 | x f32 | y f32 | xa u8 | xb u8 | ya u8 | yb u8 | q u8 | reserved u8
//! ```
//!
//! # See also
//! ------------
//! * [`resolve_raw6`] – Locates the file, retrieving it from the archive when needed.
//! * [`check_header`] – Reconciles the header with the requested band and exposure.
use camino::{Utf8Path, Utf8PathBuf};
use nom::{
    bytes::complete::take,
    number::complete::{le_f32, le_f64, le_u16, le_u32, le_u64, le_u8},
    IResult,
};
use tracing::{debug, info};

use crate::{
    archive::{retrieve_with_retries, ArchiveClient, ArchiveProduct},
    band::Band,
    constants::ExposureId,
    photon_stream::PhotonStream,
    photonpipe_errors::{PipelineError, Result, TelemetryParseError},
};

pub const RAW6_MAGIC: &[u8; 4] = b"RAW6";
pub const RAW6_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 20;
pub const RECORD_LEN: usize = 22;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHeader {
    pub band: Band,
    pub eclipse: ExposureId,
    pub count: u64,
}

struct RawHeader<'a> {
    magic: &'a [u8],
    version: u16,
    band_code: u8,
    eclipse: u32,
    count: u64,
}

fn parse_header(input: &[u8]) -> IResult<&[u8], RawHeader<'_>> {
    let (input, magic) = take(4usize)(input)?;
    let (input, version) = le_u16(input)?;
    let (input, band_code) = le_u8(input)?;
    let (input, _) = le_u8(input)?; // reserved
    let (input, eclipse) = le_u32(input)?;
    let (input, count) = le_u64(input)?;
    Ok((
        input,
        RawHeader {
            magic,
            version,
            band_code,
            eclipse,
            count,
        },
    ))
}

type RawRecord = (f64, f32, f32, u8, u8, u8, u8, u8);

fn parse_record(input: &[u8]) -> IResult<&[u8], RawRecord> {
    let (input, t) = le_f64(input)?;
    let (input, x) = le_f32(input)?;
    let (input, y) = le_f32(input)?;
    let (input, xa) = le_u8(input)?;
    let (input, xb) = le_u8(input)?;
    let (input, ya) = le_u8(input)?;
    let (input, yb) = le_u8(input)?;
    let (input, q) = le_u8(input)?;
    let (input, _) = le_u8(input)?; // reserved
    Ok((input, (t, x, y, xa, xb, ya, yb, q)))
}

/// Decode a complete raw telemetry file held in memory.
///
/// Arguments
/// -----------------
/// * `bytes`: the whole file content.
///
/// Return
/// ----------
/// * The header and the photon stream, or [`PipelineError::MalformedTelemetry`] when the
///   magic, version or band code is wrong, or when the payload does not hold exactly
///   `count` records.
pub fn decode_raw6(bytes: &[u8]) -> Result<(TelemetryHeader, PhotonStream)> {
    let (payload, raw) = parse_header(bytes)
        .map_err(|_| TelemetryParseError::IncompleteHeader(bytes.len()))?;

    if raw.magic != RAW6_MAGIC {
        return Err(TelemetryParseError::BadMagic(raw.magic.to_vec()).into());
    }
    if raw.version != RAW6_VERSION {
        return Err(TelemetryParseError::UnsupportedVersion(raw.version).into());
    }
    let band = Band::from_code(raw.band_code)
        .ok_or(TelemetryParseError::UnknownBandCode(raw.band_code))?;

    let truncated = TelemetryParseError::Truncated {
        expected: raw.count,
        found: payload.len(),
    };
    let n = usize::try_from(raw.count).map_err(|_| truncated.clone())?;
    let expected_len = n.checked_mul(RECORD_LEN).ok_or(truncated.clone())?;
    if payload.len() < expected_len {
        return Err(truncated.into());
    }
    if payload.len() > expected_len {
        return Err(TelemetryParseError::TrailingBytes(payload.len() - expected_len).into());
    }

    let mut stream = PhotonStream::with_capacity(n);
    for record in payload.chunks_exact(RECORD_LEN) {
        let (_, (t, x, y, xa, xb, ya, yb, q)) =
            parse_record(record).map_err(|_| truncated.clone())?;
        stream.push(t, x, y, xa, xb, ya, yb, q);
    }

    Ok((
        TelemetryHeader {
            band,
            eclipse: raw.eclipse,
            count: raw.count,
        },
        stream,
    ))
}

/// Read and decode a raw telemetry file.
pub fn load_raw6(path: &Utf8Path) -> Result<(TelemetryHeader, PhotonStream)> {
    let bytes = std::fs::read(path)?;
    let (header, stream) = decode_raw6(&bytes)?;
    info!(
        "Loaded {} {} events of exposure {} from {path}",
        stream.len(),
        header.band,
        header.eclipse
    );
    Ok((header, stream))
}

/// Encode `stream` as a raw telemetry file for `band` / `eclipse`.
pub fn encode_raw6(band: Band, eclipse: ExposureId, stream: &PhotonStream) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + RECORD_LEN * stream.len());
    out.extend_from_slice(RAW6_MAGIC);
    out.extend_from_slice(&RAW6_VERSION.to_le_bytes());
    out.push(band.code());
    out.push(0);
    out.extend_from_slice(&eclipse.to_le_bytes());
    out.extend_from_slice(&(stream.len() as u64).to_le_bytes());

    for i in 0..stream.len() {
        out.extend_from_slice(&stream.t[i].to_le_bytes());
        out.extend_from_slice(&stream.x[i].to_le_bytes());
        out.extend_from_slice(&stream.y[i].to_le_bytes());
        out.extend_from_slice(&[
            stream.xa[i],
            stream.xb[i],
            stream.ya[i],
            stream.yb[i],
            stream.q[i],
            0,
        ]);
    }
    out
}

pub fn write_raw6(
    path: &Utf8Path,
    band: Band,
    eclipse: ExposureId,
    stream: &PhotonStream,
) -> Result<()> {
    std::fs::write(path, encode_raw6(band, eclipse, stream))?;
    Ok(())
}

/// Reconcile a decoded header with the run request.
///
/// The header band must equal `band`. A caller-supplied exposure id must equal the header's;
/// when none is supplied the header's is adopted.
///
/// Return
/// ----------
/// * The exposure id the run proceeds with.
pub fn check_header(
    header: &TelemetryHeader,
    band: Band,
    eclipse: Option<ExposureId>,
) -> Result<ExposureId> {
    if header.band != band {
        return Err(PipelineError::BandMismatch {
            requested: band,
            header: header.band,
        });
    }
    match eclipse {
        Some(requested) if requested != header.eclipse => Err(PipelineError::ExposureMismatch {
            requested,
            header: header.eclipse,
        }),
        _ => Ok(header.eclipse),
    }
}

/// Locate the raw telemetry file of a run, retrieving it if it is not on disk.
///
/// Arguments
/// -----------------
/// * `path`: explicit local path, if any.
/// * `eclipse`: exposure id, required when the file must be retrieved.
/// * `band`: detector band.
/// * `archive`: remote archive used on a cache miss.
/// * `retries`: retrieval attempt budget.
/// * `cache_dir`: destination directory when no explicit path is given.
///
/// Return
/// ----------
/// * The path of a local telemetry file, or [`PipelineError::MissingExposureId`] when the
///   file is missing and no exposure id is known.
pub fn resolve_raw6(
    path: Option<&Utf8Path>,
    eclipse: Option<ExposureId>,
    band: Band,
    archive: &dyn ArchiveClient,
    retries: u32,
    cache_dir: &Utf8Path,
) -> Result<Utf8PathBuf> {
    if let Some(path) = path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    let eclipse = eclipse.ok_or(PipelineError::MissingExposureId)?;
    let product = ArchiveProduct::Raw6 { eclipse, band };
    let dest = match path {
        Some(p) => p.to_path_buf(),
        None => cache_dir.join(product.file_name()),
    };
    if dest.exists() {
        debug!("Using cached telemetry {dest}");
        return Ok(dest);
    }

    retrieve_with_retries(archive, &product, &dest, retries)?;
    Ok(dest)
}
