//! Fixed output record of the calibration chain.
//!
//! [`ChunkResult`] holds one typed vector per output column; [`OutputColumn`] lists the
//! schema in output order. A result is valid when every column has the length of `t`.
//!
//! In shared mode a worker copies its result into one segment laid out column after column,
//! each column start aligned to 8 bytes, and hands back a [`SharedChunkResult`]: the handles
//! plus the segment's unlink token.
use arrow_schema::DataType;

use crate::{
    photonpipe_errors::{PipelineError, Result},
    shared_memory::{ArrayHandle, DType, OwnedSegment, SegmentDir, SegmentView},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputColumn {
    T,
    Flags,
    XRaw,
    YRaw,
    Xa,
    Xb,
    Ya,
    Yb,
    Q,
    X,
    Y,
    Mask,
    Detrad,
    Response,
    Ra,
    Dec,
}

impl OutputColumn {
    pub const ALL: [OutputColumn; 16] = [
        OutputColumn::T,
        OutputColumn::Flags,
        OutputColumn::XRaw,
        OutputColumn::YRaw,
        OutputColumn::Xa,
        OutputColumn::Xb,
        OutputColumn::Ya,
        OutputColumn::Yb,
        OutputColumn::Q,
        OutputColumn::X,
        OutputColumn::Y,
        OutputColumn::Mask,
        OutputColumn::Detrad,
        OutputColumn::Response,
        OutputColumn::Ra,
        OutputColumn::Dec,
    ];

    /// Position in [`OutputColumn::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputColumn::T => "t",
            OutputColumn::Flags => "flags",
            OutputColumn::XRaw => "x_raw",
            OutputColumn::YRaw => "y_raw",
            OutputColumn::Xa => "xa",
            OutputColumn::Xb => "xb",
            OutputColumn::Ya => "ya",
            OutputColumn::Yb => "yb",
            OutputColumn::Q => "q",
            OutputColumn::X => "x",
            OutputColumn::Y => "y",
            OutputColumn::Mask => "mask",
            OutputColumn::Detrad => "detrad",
            OutputColumn::Response => "response",
            OutputColumn::Ra => "ra",
            OutputColumn::Dec => "dec",
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            OutputColumn::T | OutputColumn::Ra | OutputColumn::Dec => DType::F64,
            OutputColumn::XRaw
            | OutputColumn::YRaw
            | OutputColumn::X
            | OutputColumn::Y
            | OutputColumn::Detrad
            | OutputColumn::Response => DType::F32,
            OutputColumn::Mask => DType::Bool,
            OutputColumn::Flags
            | OutputColumn::Xa
            | OutputColumn::Xb
            | OutputColumn::Ya
            | OutputColumn::Yb
            | OutputColumn::Q => DType::U8,
        }
    }

    pub fn data_type(self) -> DataType {
        match self.dtype() {
            DType::F64 => DataType::Float64,
            DType::F32 => DataType::Float32,
            DType::U8 => DataType::UInt8,
            DType::Bool => DataType::Boolean,
        }
    }

    /// Low-cardinality columns written with dictionary encoding.
    pub fn dictionary_encoded(self) -> bool {
        matches!(
            self,
            OutputColumn::T
                | OutputColumn::Flags
                | OutputColumn::Xa
                | OutputColumn::Xb
                | OutputColumn::Ya
                | OutputColumn::Yb
                | OutputColumn::Q
        )
    }
}

/// Borrowed values of one column.
#[derive(Debug, Clone, Copy)]
pub enum ColumnData<'a> {
    F64(&'a [f64]),
    F32(&'a [f32]),
    U8(&'a [u8]),
    Bool(&'a [bool]),
}

impl ColumnData<'_> {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::F64(v) => v.len(),
            ColumnData::F32(v) => v.len(),
            ColumnData::U8(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Calibrated photons of one chunk, or of a whole exposure once merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkResult {
    pub t: Vec<f64>,
    pub flags: Vec<u8>,
    pub x_raw: Vec<f32>,
    pub y_raw: Vec<f32>,
    pub xa: Vec<u8>,
    pub xb: Vec<u8>,
    pub ya: Vec<u8>,
    pub yb: Vec<u8>,
    pub q: Vec<u8>,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub mask: Vec<bool>,
    pub detrad: Vec<f32>,
    pub response: Vec<f32>,
    pub ra: Vec<f64>,
    pub dec: Vec<f64>,
}

fn align8(bytes: usize) -> usize {
    bytes.div_ceil(8) * 8
}

impl ChunkResult {
    pub fn with_capacity(n: usize) -> Self {
        ChunkResult {
            t: Vec::with_capacity(n),
            flags: Vec::with_capacity(n),
            x_raw: Vec::with_capacity(n),
            y_raw: Vec::with_capacity(n),
            xa: Vec::with_capacity(n),
            xb: Vec::with_capacity(n),
            ya: Vec::with_capacity(n),
            yb: Vec::with_capacity(n),
            q: Vec::with_capacity(n),
            x: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            mask: Vec::with_capacity(n),
            detrad: Vec::with_capacity(n),
            response: Vec::with_capacity(n),
            ra: Vec::with_capacity(n),
            dec: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn column(&self, column: OutputColumn) -> ColumnData<'_> {
        match column {
            OutputColumn::T => ColumnData::F64(&self.t),
            OutputColumn::Flags => ColumnData::U8(&self.flags),
            OutputColumn::XRaw => ColumnData::F32(&self.x_raw),
            OutputColumn::YRaw => ColumnData::F32(&self.y_raw),
            OutputColumn::Xa => ColumnData::U8(&self.xa),
            OutputColumn::Xb => ColumnData::U8(&self.xb),
            OutputColumn::Ya => ColumnData::U8(&self.ya),
            OutputColumn::Yb => ColumnData::U8(&self.yb),
            OutputColumn::Q => ColumnData::U8(&self.q),
            OutputColumn::X => ColumnData::F32(&self.x),
            OutputColumn::Y => ColumnData::F32(&self.y),
            OutputColumn::Mask => ColumnData::Bool(&self.mask),
            OutputColumn::Detrad => ColumnData::F32(&self.detrad),
            OutputColumn::Response => ColumnData::F32(&self.response),
            OutputColumn::Ra => ColumnData::F64(&self.ra),
            OutputColumn::Dec => ColumnData::F64(&self.dec),
        }
    }

    /// Check that every column has the length of `t`.
    pub fn validate(&self) -> Result<()> {
        let expected = self.len();
        for column in OutputColumn::ALL {
            let found = self.column(column).len();
            if found != expected {
                return Err(PipelineError::ColumnLengthMismatch {
                    column: column.name().to_string(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Append every column of `other`.
    pub fn extend_from(&mut self, other: &ChunkResult) {
        self.t.extend_from_slice(&other.t);
        self.flags.extend_from_slice(&other.flags);
        self.x_raw.extend_from_slice(&other.x_raw);
        self.y_raw.extend_from_slice(&other.y_raw);
        self.xa.extend_from_slice(&other.xa);
        self.xb.extend_from_slice(&other.xb);
        self.ya.extend_from_slice(&other.ya);
        self.yb.extend_from_slice(&other.yb);
        self.q.extend_from_slice(&other.q);
        self.x.extend_from_slice(&other.x);
        self.y.extend_from_slice(&other.y);
        self.mask.extend_from_slice(&other.mask);
        self.detrad.extend_from_slice(&other.detrad);
        self.response.extend_from_slice(&other.response);
        self.ra.extend_from_slice(&other.ra);
        self.dec.extend_from_slice(&other.dec);
    }

    /// Concatenate `parts` in the given order.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a ChunkResult>) -> ChunkResult {
        let parts: Vec<&ChunkResult> = parts.into_iter().collect();
        let mut merged = ChunkResult::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            merged.extend_from(part);
        }
        merged
    }

    /// Copy the result into a new segment of `dir`.
    pub fn write_to_segment(&self, dir: &SegmentDir, prefix: &str) -> Result<SharedChunkResult> {
        self.validate()?;
        let n = self.len();

        let mut byte_offsets = Vec::with_capacity(OutputColumn::ALL.len());
        let mut cursor = 0;
        for column in OutputColumn::ALL {
            cursor = align8(cursor);
            byte_offsets.push(cursor);
            cursor += n * column.dtype().size();
        }

        let mut writer = dir.allocate(prefix, cursor)?;
        let mut handles = Vec::with_capacity(OutputColumn::ALL.len());
        for (column, byte_offset) in OutputColumn::ALL.into_iter().zip(byte_offsets) {
            let offset = byte_offset / column.dtype().size();
            let handle = match self.column(column) {
                ColumnData::F64(v) => writer.write(offset, v)?,
                ColumnData::F32(v) => writer.write(offset, v)?,
                ColumnData::U8(v) => writer.write(offset, v)?,
                ColumnData::Bool(v) => writer.write_bools(offset, v)?,
            };
            handles.push(handle);
        }

        Ok(SharedChunkResult {
            len: n,
            handles,
            dir: dir.clone(),
            segment: writer.seal()?,
        })
    }
}

/// A chunk result stored in a segment.
#[derive(Debug)]
pub struct SharedChunkResult {
    pub len: usize,
    /// One handle per [`OutputColumn::ALL`] entry.
    pub handles: Vec<ArrayHandle>,
    pub dir: SegmentDir,
    segment: OwnedSegment,
}

impl SharedChunkResult {
    pub fn attach(&self) -> Result<SegmentView> {
        self.dir.attach(self.segment.name())
    }

    /// Append one column of this result, read from `view`, to `out`.
    pub fn read_column_into(
        &self,
        view: &SegmentView,
        column: OutputColumn,
        out: &mut ChunkResult,
    ) -> Result<()> {
        let handle = self
            .handles
            .get(column.index())
            .ok_or_else(|| PipelineError::ColumnLengthMismatch {
                column: column.name().to_string(),
                expected: self.len,
                found: 0,
            })?;
        if handle.shape != self.len {
            return Err(PipelineError::ColumnLengthMismatch {
                column: column.name().to_string(),
                expected: self.len,
                found: handle.shape,
            });
        }

        match column {
            OutputColumn::T => out.t.extend_from_slice(view.read(handle)?),
            OutputColumn::Flags => out.flags.extend_from_slice(view.read(handle)?),
            OutputColumn::XRaw => out.x_raw.extend_from_slice(view.read(handle)?),
            OutputColumn::YRaw => out.y_raw.extend_from_slice(view.read(handle)?),
            OutputColumn::Xa => out.xa.extend_from_slice(view.read(handle)?),
            OutputColumn::Xb => out.xb.extend_from_slice(view.read(handle)?),
            OutputColumn::Ya => out.ya.extend_from_slice(view.read(handle)?),
            OutputColumn::Yb => out.yb.extend_from_slice(view.read(handle)?),
            OutputColumn::Q => out.q.extend_from_slice(view.read(handle)?),
            OutputColumn::X => out.x.extend_from_slice(view.read(handle)?),
            OutputColumn::Y => out.y.extend_from_slice(view.read(handle)?),
            OutputColumn::Mask => out.mask.extend(view.read_bools(handle)?),
            OutputColumn::Detrad => out.detrad.extend_from_slice(view.read(handle)?),
            OutputColumn::Response => out.response.extend_from_slice(view.read(handle)?),
            OutputColumn::Ra => out.ra.extend_from_slice(view.read(handle)?),
            OutputColumn::Dec => out.dec.extend_from_slice(view.read(handle)?),
        }
        Ok(())
    }

    /// Read the whole result back.
    pub fn to_owned_result(&self) -> Result<ChunkResult> {
        let view = self.attach()?;
        let mut out = ChunkResult::with_capacity(self.len);
        for column in OutputColumn::ALL {
            self.read_column_into(&view, column, &mut out)?;
        }
        Ok(out)
    }

    /// Release the result segment.
    pub fn release(self) -> Result<()> {
        self.segment.unlink()
    }
}
