//! # Calibration reference store
//!
//! Eight immutable lookup tables per band and calibration epoch drive the per-photon chain:
//!
//! | [`TableKind`] | shape | use |
//! |---|---|---|
//! | `DistortionX`, `DistortionY` | 2-D over detector (x, y) | geometric distortion, pixels |
//! | `WalkX`, `WalkY` | rows = pulse height, cols = phase | walk correction, pixels |
//! | `LinearityX`, `LinearityY` | 1 row over detector x / y | linearity correction, pixels |
//! | `Flat` | 2-D over detector (x, y) | relative response |
//! | `Mask` | 2-D over detector (x, y) | `>= 0.5` usable, below is a hotspot |
//!
//! Tables live in `{cal_dir}/{band}/{table}_{epoch}.cal` (see [`table_path`]), where the
//! epoch is `early` below [`EPOCH_THRESHOLD`] and `late` from it on.
//!
//! # File layout (little endian)
//!
//! ```text
//!  magic b"GCAL" | version u16 | kind u8 | reserved u8 | rows u32 | cols u32
//!  x0 f64 | y0 f64 | dx f64 | dy f64 | rows * cols f32 values (row major)
//! ```
//!
//! Grid node `(row, col)` sits at detector coordinates `(x0 + col * dx, y0 + row * dy)`.
//!
//! # See also
//! ------------
//! * [`shared`] – Publishing the tables once into shared segments for the workers.
pub mod shared;

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use nom::{
    bytes::complete::take,
    number::complete::{le_f64, le_u16, le_u32, le_u8},
    IResult,
};
use tracing::info;

use crate::{
    band::Band,
    constants::{ExposureId, DETECTOR_SIZE, EPOCH_THRESHOLD},
    photonpipe_errors::{PipelineError, Result},
};

pub const GCAL_MAGIC: &[u8; 4] = b"GCAL";
pub const GCAL_VERSION: u16 = 1;
pub const GCAL_HEADER_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    DistortionX,
    DistortionY,
    WalkX,
    WalkY,
    LinearityX,
    LinearityY,
    Flat,
    Mask,
}

impl TableKind {
    pub const ALL: [TableKind; 8] = [
        TableKind::DistortionX,
        TableKind::DistortionY,
        TableKind::WalkX,
        TableKind::WalkY,
        TableKind::LinearityX,
        TableKind::LinearityY,
        TableKind::Flat,
        TableKind::Mask,
    ];

    pub fn code(self) -> u8 {
        self as u8 + 1
    }

    pub fn from_code(code: u8) -> Option<TableKind> {
        TableKind::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            TableKind::DistortionX => "distortion_x",
            TableKind::DistortionY => "distortion_y",
            TableKind::WalkX => "walk_x",
            TableKind::WalkY => "walk_y",
            TableKind::LinearityX => "linearity_x",
            TableKind::LinearityY => "linearity_y",
            TableKind::Flat => "flat",
            TableKind::Mask => "mask",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Calibration epoch of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationEpoch {
    Early,
    Late,
}

impl CalibrationEpoch {
    pub fn of(eclipse: ExposureId) -> Self {
        if eclipse >= EPOCH_THRESHOLD {
            CalibrationEpoch::Late
        } else {
            CalibrationEpoch::Early
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            CalibrationEpoch::Early => "early",
            CalibrationEpoch::Late => "late",
        }
    }
}

/// Location of one table file.
pub fn table_path(
    cal_dir: &Utf8Path,
    band: Band,
    epoch: CalibrationEpoch,
    kind: TableKind,
) -> Utf8PathBuf {
    cal_dir
        .join(band.dir_name())
        .join(format!("{}_{}.cal", kind.name(), epoch.suffix()))
}

/// Regular grid of `f32` values with its placement on the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    pub kind: TableKind,
    pub rows: usize,
    pub cols: usize,
    pub x0: f64,
    pub y0: f64,
    pub dx: f64,
    pub dy: f64,
    pub values: Vec<f32>,
}

/// Fractional grid coordinate along one axis, or `None` outside `[0, n - 1]`.
#[inline]
fn grid_coordinate(v: f64, origin: f64, step: f64, n: usize) -> Option<(usize, f64)> {
    let g = (v - origin) / step;
    if !g.is_finite() || g < 0.0 || g > (n - 1) as f64 {
        return None;
    }
    let i = (g.floor() as usize).min(n.saturating_sub(2));
    Some((i, g - i as f64))
}

impl LookupTable {
    /// Check the table's internal consistency.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.rows == 0 || self.cols == 0 {
            return Err(format!("empty grid {}x{}", self.rows, self.cols));
        }
        if self.values.len() != self.rows * self.cols {
            return Err(format!(
                "{} values for a {}x{} grid",
                self.values.len(),
                self.rows,
                self.cols
            ));
        }
        if !(self.dx.is_finite() && self.dx > 0.0 && self.dy.is_finite() && self.dy > 0.0) {
            return Err(format!("invalid grid step ({}, {})", self.dx, self.dy));
        }
        if !(self.x0.is_finite() && self.y0.is_finite()) {
            return Err("non-finite grid origin".into());
        }
        Ok(())
    }

    /// A table holding `value` everywhere on a `rows` x `cols` grid.
    #[allow(clippy::too_many_arguments)]
    pub fn constant(
        kind: TableKind,
        rows: usize,
        cols: usize,
        x0: f64,
        y0: f64,
        dx: f64,
        dy: f64,
        value: f32,
    ) -> Self {
        LookupTable {
            kind,
            rows,
            cols,
            x0,
            y0,
            dx,
            dy,
            values: vec![value; rows * cols],
        }
    }

    #[inline]
    pub fn cell(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.rows && col < self.cols {
            Some(self.values[row * self.cols + col])
        } else {
            None
        }
    }

    /// Bilinear interpolation at detector coordinates `(x, y)`.
    ///
    /// Return
    /// ----------
    /// * `None` when `(x, y)` lies outside the grid or is not finite.
    pub fn bilinear(&self, x: f64, y: f64) -> Option<f64> {
        let (c, wx) = grid_coordinate(x, self.x0, self.dx, self.cols)?;
        let (r, wy) = grid_coordinate(y, self.y0, self.dy, self.rows)?;
        let c1 = (c + 1).min(self.cols - 1);
        let r1 = (r + 1).min(self.rows - 1);

        let v00 = self.values[r * self.cols + c] as f64;
        let v01 = self.values[r * self.cols + c1] as f64;
        let v10 = self.values[r1 * self.cols + c] as f64;
        let v11 = self.values[r1 * self.cols + c1] as f64;

        Some(
            (1.0 - wy) * ((1.0 - wx) * v00 + wx * v01) + wy * ((1.0 - wx) * v10 + wx * v11),
        )
    }

    /// Linear interpolation along the first row, for 1-D tables.
    pub fn linear_1d(&self, v: f64) -> Option<f64> {
        let (c, w) = grid_coordinate(v, self.x0, self.dx, self.cols)?;
        let c1 = (c + 1).min(self.cols - 1);
        Some((1.0 - w) * self.values[c] as f64 + w * self.values[c1] as f64)
    }

    /// Value of the grid node closest to `(x, y)`.
    pub fn nearest(&self, x: f64, y: f64) -> Option<f32> {
        let col = ((x - self.x0) / self.dx).round();
        let row = ((y - self.y0) / self.dy).round();
        if !(col.is_finite() && row.is_finite()) || col < 0.0 || row < 0.0 {
            return None;
        }
        self.cell(row as usize, col as usize)
    }

    /// Serialize in the `GCAL` file layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(GCAL_HEADER_LEN + 4 * self.values.len());
        out.extend_from_slice(GCAL_MAGIC);
        out.extend_from_slice(&GCAL_VERSION.to_le_bytes());
        out.push(self.kind.code());
        out.push(0);
        out.extend_from_slice(&(self.rows as u32).to_le_bytes());
        out.extend_from_slice(&(self.cols as u32).to_le_bytes());
        for v in [self.x0, self.y0, self.dx, self.dy] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode a `GCAL` file; `path` only labels errors.
    pub fn decode(bytes: &[u8], path: &Utf8Path) -> Result<Self> {
        let malformed = |reason: String| PipelineError::MalformedCalibrationTable {
            path: path.to_path_buf(),
            reason,
        };

        let (body, header) = parse_gcal_header(bytes)
            .map_err(|_| malformed(format!("incomplete header ({} bytes)", bytes.len())))?;
        if header.magic != GCAL_MAGIC {
            return Err(malformed(format!("bad magic {:?}", header.magic)));
        }
        if header.version != GCAL_VERSION {
            return Err(malformed(format!("unsupported version {}", header.version)));
        }
        let kind = TableKind::from_code(header.kind)
            .ok_or_else(|| malformed(format!("unknown table kind {}", header.kind)))?;

        let n = header.rows as usize * header.cols as usize;
        if body.len() != 4 * n {
            return Err(malformed(format!(
                "{} payload bytes for a {}x{} grid",
                body.len(),
                header.rows,
                header.cols
            )));
        }
        let values = body
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let table = LookupTable {
            kind,
            rows: header.rows as usize,
            cols: header.cols as usize,
            x0: header.x0,
            y0: header.y0,
            dx: header.dx,
            dy: header.dy,
            values,
        };
        table.validate().map_err(malformed)?;
        Ok(table)
    }
}

struct GcalHeader<'a> {
    magic: &'a [u8],
    version: u16,
    kind: u8,
    rows: u32,
    cols: u32,
    x0: f64,
    y0: f64,
    dx: f64,
    dy: f64,
}

fn parse_gcal_header(input: &[u8]) -> IResult<&[u8], GcalHeader<'_>> {
    let (input, magic) = take(4usize)(input)?;
    let (input, version) = le_u16(input)?;
    let (input, kind) = le_u8(input)?;
    let (input, _) = le_u8(input)?; // reserved
    let (input, rows) = le_u32(input)?;
    let (input, cols) = le_u32(input)?;
    let (input, x0) = le_f64(input)?;
    let (input, y0) = le_f64(input)?;
    let (input, dx) = le_f64(input)?;
    let (input, dy) = le_f64(input)?;
    Ok((
        input,
        GcalHeader {
            magic,
            version,
            kind,
            rows,
            cols,
            x0,
            y0,
            dx,
            dy,
        },
    ))
}

/// The complete reference data of one band and epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationData {
    pub band: Band,
    pub epoch: CalibrationEpoch,
    pub distortion_x: LookupTable,
    pub distortion_y: LookupTable,
    pub walk_x: LookupTable,
    pub walk_y: LookupTable,
    pub linearity_x: LookupTable,
    pub linearity_y: LookupTable,
    pub flat: LookupTable,
    pub mask: LookupTable,
}

impl CalibrationData {
    /// Assemble reference data from tables given in [`TableKind::ALL`] order.
    pub fn from_tables(
        band: Band,
        epoch: CalibrationEpoch,
        tables: [LookupTable; 8],
    ) -> Result<Self> {
        for (table, kind) in tables.iter().zip(TableKind::ALL) {
            if table.kind != kind {
                return Err(PipelineError::MalformedCalibrationTable {
                    path: Utf8PathBuf::from(kind.name()),
                    reason: format!("expected a {kind} table, found {}", table.kind),
                });
            }
            table
                .validate()
                .map_err(|reason| PipelineError::MalformedCalibrationTable {
                    path: Utf8PathBuf::from(kind.name()),
                    reason,
                })?;
        }
        let [distortion_x, distortion_y, walk_x, walk_y, linearity_x, linearity_y, flat, mask] =
            tables;
        Ok(CalibrationData {
            band,
            epoch,
            distortion_x,
            distortion_y,
            walk_x,
            walk_y,
            linearity_x,
            linearity_y,
            flat,
            mask,
        })
    }

    pub fn table(&self, kind: TableKind) -> &LookupTable {
        match kind {
            TableKind::DistortionX => &self.distortion_x,
            TableKind::DistortionY => &self.distortion_y,
            TableKind::WalkX => &self.walk_x,
            TableKind::WalkY => &self.walk_y,
            TableKind::LinearityX => &self.linearity_x,
            TableKind::LinearityY => &self.linearity_y,
            TableKind::Flat => &self.flat,
            TableKind::Mask => &self.mask,
        }
    }

    /// Identity reference data: no distortion, walk or linearity correction, unit response
    /// and no hotspot anywhere on the detector.
    pub fn nominal(band: Band, epoch: CalibrationEpoch) -> Self {
        let s = DETECTOR_SIZE;
        CalibrationData {
            band,
            epoch,
            distortion_x: LookupTable::constant(TableKind::DistortionX, 2, 2, 0.0, 0.0, s, s, 0.0),
            distortion_y: LookupTable::constant(TableKind::DistortionY, 2, 2, 0.0, 0.0, s, s, 0.0),
            walk_x: LookupTable::constant(TableKind::WalkX, 32, 32, 0.0, 0.0, 1.0, 1.0, 0.0),
            walk_y: LookupTable::constant(TableKind::WalkY, 32, 32, 0.0, 0.0, 1.0, 1.0, 0.0),
            linearity_x: LookupTable::constant(TableKind::LinearityX, 1, 2, 0.0, 0.0, s, 1.0, 0.0),
            linearity_y: LookupTable::constant(TableKind::LinearityY, 1, 2, 0.0, 0.0, s, 1.0, 0.0),
            flat: LookupTable::constant(TableKind::Flat, 2, 2, 0.0, 0.0, s, s, 1.0),
            mask: LookupTable::constant(TableKind::Mask, 81, 81, 0.0, 0.0, 10.0, 10.0, 1.0),
        }
    }

    /// Load the tables of `band` for exposure `eclipse` from `cal_dir`.
    ///
    /// Return
    /// ----------
    /// * [`PipelineError::MissingCalibrationTable`] naming the first absent table, or
    ///   [`PipelineError::MalformedCalibrationTable`] if a file does not decode.
    pub fn load(cal_dir: &Utf8Path, band: Band, eclipse: ExposureId) -> Result<Self> {
        let epoch = CalibrationEpoch::of(eclipse);
        let mut tables = Vec::with_capacity(TableKind::ALL.len());

        for kind in TableKind::ALL {
            let path = table_path(cal_dir, band, epoch, kind);
            if !path.is_file() {
                return Err(PipelineError::MissingCalibrationTable {
                    band,
                    eclipse,
                    table: kind.name().to_string(),
                    path,
                });
            }
            let table = LookupTable::decode(&std::fs::read(&path)?, &path)?;
            if table.kind != kind {
                return Err(PipelineError::MalformedCalibrationTable {
                    path,
                    reason: format!("holds a {} table", table.kind),
                });
            }
            tables.push(table);
        }

        let tables: [LookupTable; 8] =
            tables
                .try_into()
                .map_err(|_| PipelineError::MalformedCalibrationTable {
                    path: cal_dir.to_path_buf(),
                    reason: "incomplete table set".into(),
                })?;
        info!(
            "Loaded {band} calibration tables ({} epoch) from {cal_dir}",
            epoch.suffix()
        );
        Self::from_tables(band, epoch, tables)
    }

    /// Write every table under `cal_dir` in the layout [`CalibrationData::load`] reads.
    pub fn write_to_dir(&self, cal_dir: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(cal_dir.join(self.band.dir_name()))?;
        for kind in TableKind::ALL {
            let path = table_path(cal_dir, self.band, self.epoch, kind);
            std::fs::write(&path, self.table(kind).encode())?;
        }
        Ok(())
    }
}
