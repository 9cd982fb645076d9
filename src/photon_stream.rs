//! # Photon stream
//!
//! Structure-of-arrays container for decoded photon events. Index `i` denotes the same
//! photon in every column, and every column always holds exactly [`PhotonStream::len`]
//! values: the constructor rejects anything else with
//! [`PipelineError::ColumnLengthMismatch`].
//!
//! Columns
//! -----------------
//! | name | type | meaning |
//! |------|------|---------|
//! | `t`  | f64  | spacecraft time (s) |
//! | `x`, `y` | f32 | detector position (pixels) |
//! | `xa`, `xb`, `ya`, `yb` | u8 | 5-bit phase attributes |
//! | `q`  | u8   | pulse height |
//!
//! [`PhotonSlice`] is the borrowed view the workers compute on; it is built either from an
//! owned chunk or from shared segments.
use std::ops::Range;

use crate::{
    photonpipe_errors::{PipelineError, Result},
    shared_memory::DType,
};

/// Columns of a decoded photon stream, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamColumn {
    T,
    X,
    Y,
    Xa,
    Xb,
    Ya,
    Yb,
    Q,
}

impl StreamColumn {
    pub const ALL: [StreamColumn; 8] = [
        StreamColumn::T,
        StreamColumn::X,
        StreamColumn::Y,
        StreamColumn::Xa,
        StreamColumn::Xb,
        StreamColumn::Ya,
        StreamColumn::Yb,
        StreamColumn::Q,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StreamColumn::T => "t",
            StreamColumn::X => "x",
            StreamColumn::Y => "y",
            StreamColumn::Xa => "xa",
            StreamColumn::Xb => "xb",
            StreamColumn::Ya => "ya",
            StreamColumn::Yb => "yb",
            StreamColumn::Q => "q",
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            StreamColumn::T => DType::F64,
            StreamColumn::X | StreamColumn::Y => DType::F32,
            _ => DType::U8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotonStream {
    pub t: Vec<f64>,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub xa: Vec<u8>,
    pub xb: Vec<u8>,
    pub ya: Vec<u8>,
    pub yb: Vec<u8>,
    pub q: Vec<u8>,
}

impl PhotonStream {
    /// Build a stream from its columns, checking that they share one length.
    ///
    /// Arguments
    /// -----------------
    /// * `t`, `x`, `y`, `xa`, `xb`, `ya`, `yb`, `q`: the decoded columns.
    ///
    /// Return
    /// ----------
    /// * The stream, or [`PipelineError::ColumnLengthMismatch`] naming the first column
    ///   whose length differs from `t`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        t: Vec<f64>,
        x: Vec<f32>,
        y: Vec<f32>,
        xa: Vec<u8>,
        xb: Vec<u8>,
        ya: Vec<u8>,
        yb: Vec<u8>,
        q: Vec<u8>,
    ) -> Result<Self> {
        let stream = PhotonStream {
            t,
            x,
            y,
            xa,
            xb,
            ya,
            yb,
            q,
        };
        stream.as_slice().validate()?;
        Ok(stream)
    }

    pub fn with_capacity(n: usize) -> Self {
        PhotonStream {
            t: Vec::with_capacity(n),
            x: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            xa: Vec::with_capacity(n),
            xb: Vec::with_capacity(n),
            ya: Vec::with_capacity(n),
            yb: Vec::with_capacity(n),
            q: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn as_slice(&self) -> PhotonSlice<'_> {
        PhotonSlice {
            t: &self.t,
            x: &self.x,
            y: &self.y,
            xa: &self.xa,
            xb: &self.xb,
            ya: &self.ya,
            yb: &self.yb,
            q: &self.q,
        }
    }

    /// Independent copy of the rows in `range`.
    pub fn copy_range(&self, range: Range<usize>) -> PhotonStream {
        PhotonStream {
            t: self.t[range.clone()].to_vec(),
            x: self.x[range.clone()].to_vec(),
            y: self.y[range.clone()].to_vec(),
            xa: self.xa[range.clone()].to_vec(),
            xb: self.xb[range.clone()].to_vec(),
            ya: self.ya[range.clone()].to_vec(),
            yb: self.yb[range.clone()].to_vec(),
            q: self.q[range].to_vec(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push(&mut self, t: f64, x: f32, y: f32, xa: u8, xb: u8, ya: u8, yb: u8, q: u8) {
        self.t.push(t);
        self.x.push(x);
        self.y.push(y);
        self.xa.push(xa);
        self.xb.push(xb);
        self.ya.push(ya);
        self.yb.push(yb);
        self.q.push(q);
    }
}

/// Borrowed, column-wise view over photon events.
#[derive(Debug, Clone, Copy)]
pub struct PhotonSlice<'a> {
    pub t: &'a [f64],
    pub x: &'a [f32],
    pub y: &'a [f32],
    pub xa: &'a [u8],
    pub xb: &'a [u8],
    pub ya: &'a [u8],
    pub yb: &'a [u8],
    pub q: &'a [u8],
}

impl PhotonSlice<'_> {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    fn column_len(&self, column: StreamColumn) -> usize {
        match column {
            StreamColumn::T => self.t.len(),
            StreamColumn::X => self.x.len(),
            StreamColumn::Y => self.y.len(),
            StreamColumn::Xa => self.xa.len(),
            StreamColumn::Xb => self.xb.len(),
            StreamColumn::Ya => self.ya.len(),
            StreamColumn::Yb => self.yb.len(),
            StreamColumn::Q => self.q.len(),
        }
    }

    /// Check that every column has the length of `t`.
    pub fn validate(&self) -> Result<()> {
        self.validate_len(self.len())
    }

    /// Check that every column has exactly `expected` values.
    pub fn validate_len(&self, expected: usize) -> Result<()> {
        for column in StreamColumn::ALL {
            let found = self.column_len(column);
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
}
