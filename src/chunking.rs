//! # Chunk partitioning
//!
//! The corrected stream is cut into contiguous, ascending chunks of at most `chunk_size`
//! photons. Chunks tile `[0, N)` exactly; only the last one may be shorter. Both modes use
//! the same boundaries ([`chunk_ranges`]):
//!
//! * **unshared** ([`partition_unshared`]): every chunk owns an independent copy of its rows;
//! * **shared** ([`partition_shared`]): each stream column is copied once into its own
//!   segment sized for the whole stream, and chunks only carry [`ArrayHandle`]s restricted to
//!   their rows. The segments are owned by the returned [`SharedStream`].
use std::ops::Range;

use tracing::debug;

use crate::{
    photon_stream::{PhotonSlice, PhotonStream, StreamColumn},
    photonpipe_errors::Result,
    shared_memory::{ArrayHandle, OwnedSegment, SegmentDir, SegmentView},
};

/// Rows `[start, end)` of chunk number `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn rows(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Boundaries of the chunks of an `n`-photon stream.
///
/// Arguments
/// -----------------
/// * `n`: stream length.
/// * `chunk_size`: maximum rows per chunk; `0` is treated as `1`.
///
/// Return
/// ----------
/// * `ceil(n / chunk_size)` ranges in ascending order; empty when `n == 0`.
pub fn chunk_ranges(n: usize, chunk_size: usize) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    (0..n)
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| ChunkRange {
            index,
            start,
            end: (start + chunk_size).min(n),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhotonChunk {
    pub range: ChunkRange,
    pub photons: PhotonStream,
}

/// One handle per stream column.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedColumns {
    pub t: ArrayHandle,
    pub x: ArrayHandle,
    pub y: ArrayHandle,
    pub xa: ArrayHandle,
    pub xb: ArrayHandle,
    pub ya: ArrayHandle,
    pub yb: ArrayHandle,
    pub q: ArrayHandle,
}

impl SharedColumns {
    pub fn handle(&self, column: StreamColumn) -> &ArrayHandle {
        match column {
            StreamColumn::T => &self.t,
            StreamColumn::X => &self.x,
            StreamColumn::Y => &self.y,
            StreamColumn::Xa => &self.xa,
            StreamColumn::Xb => &self.xb,
            StreamColumn::Ya => &self.ya,
            StreamColumn::Yb => &self.yb,
            StreamColumn::Q => &self.q,
        }
    }

    /// The same columns restricted to `len` rows from `start`.
    pub fn rows(&self, start: usize, len: usize) -> SharedColumns {
        SharedColumns {
            t: self.t.rows(start, len),
            x: self.x.rows(start, len),
            y: self.y.rows(start, len),
            xa: self.xa.rows(start, len),
            xb: self.xb.rows(start, len),
            ya: self.ya.rows(start, len),
            yb: self.yb.rows(start, len),
            q: self.q.rows(start, len),
        }
    }

    /// Map every column segment of `dir`.
    pub fn attach(&self, dir: &SegmentDir) -> Result<AttachedColumns> {
        let views = StreamColumn::ALL
            .iter()
            .map(|&c| dir.attach(&self.handle(c).segment))
            .collect::<Result<Vec<_>>>()?;
        Ok(AttachedColumns {
            handles: self.clone(),
            views,
        })
    }
}

/// Column segments mapped by a worker.
#[derive(Debug)]
pub struct AttachedColumns {
    handles: SharedColumns,
    views: Vec<SegmentView>,
}

impl AttachedColumns {
    /// Borrow the columns as a photon slice.
    pub fn as_slice(&self) -> Result<PhotonSlice<'_>> {
        let h = &self.handles;
        let v = &self.views;
        let slice = PhotonSlice {
            t: v[0].read(&h.t)?,
            x: v[1].read(&h.x)?,
            y: v[2].read(&h.y)?,
            xa: v[3].read(&h.xa)?,
            xb: v[4].read(&h.xb)?,
            ya: v[5].read(&h.ya)?,
            yb: v[6].read(&h.yb)?,
            q: v[7].read(&h.q)?,
        };
        slice.validate_len(h.t.shape)?;
        Ok(slice)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SharedChunk {
    pub range: ChunkRange,
    pub columns: SharedColumns,
}

/// Work unit handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkInput {
    Owned(PhotonChunk),
    Shared(SharedChunk),
}

impl ChunkInput {
    pub fn range(&self) -> ChunkRange {
        match self {
            ChunkInput::Owned(c) => c.range,
            ChunkInput::Shared(c) => c.range,
        }
    }
}

/// Column segments holding the whole stream, with their unlink tokens.
#[derive(Debug)]
pub struct SharedStream {
    pub columns: SharedColumns,
    pub len: usize,
    segments: Vec<OwnedSegment>,
}

impl SharedStream {
    pub fn into_segments(self) -> Vec<OwnedSegment> {
        self.segments
    }
}

/// Cut `stream` into owned chunks.
pub fn partition_unshared(stream: &PhotonStream, chunk_size: usize) -> Vec<ChunkInput> {
    chunk_ranges(stream.len(), chunk_size)
        .into_iter()
        .map(|range| {
            ChunkInput::Owned(PhotonChunk {
                range,
                photons: stream.copy_range(range.rows()),
            })
        })
        .collect()
}

/// Copy `stream` into one segment per column and describe its chunks by handle.
///
/// Return
/// ----------
/// * The chunk descriptors and the [`SharedStream`] owning the segments, or
///   [`crate::photonpipe_errors::PipelineError::SegmentAllocation`].
pub fn partition_shared(
    stream: &PhotonStream,
    chunk_size: usize,
    dir: &SegmentDir,
) -> Result<(Vec<ChunkInput>, SharedStream)> {
    let n = stream.len();
    let mut segments = Vec::with_capacity(StreamColumn::ALL.len());
    let mut publish = |column: StreamColumn| -> Result<ArrayHandle> {
        let mut writer = dir.allocate(
            &format!("photons-{}", column.name()),
            n * column.dtype().size(),
        )?;
        let handle = match column {
            StreamColumn::T => writer.write(0, &stream.t)?,
            StreamColumn::X => writer.write(0, &stream.x)?,
            StreamColumn::Y => writer.write(0, &stream.y)?,
            StreamColumn::Xa => writer.write(0, &stream.xa)?,
            StreamColumn::Xb => writer.write(0, &stream.xb)?,
            StreamColumn::Ya => writer.write(0, &stream.ya)?,
            StreamColumn::Yb => writer.write(0, &stream.yb)?,
            StreamColumn::Q => writer.write(0, &stream.q)?,
        };
        segments.push(writer.seal()?);
        Ok(handle)
    };

    let columns = SharedColumns {
        t: publish(StreamColumn::T)?,
        x: publish(StreamColumn::X)?,
        y: publish(StreamColumn::Y)?,
        xa: publish(StreamColumn::Xa)?,
        xb: publish(StreamColumn::Xb)?,
        ya: publish(StreamColumn::Ya)?,
        yb: publish(StreamColumn::Yb)?,
        q: publish(StreamColumn::Q)?,
    };

    let chunks = chunk_ranges(n, chunk_size)
        .into_iter()
        .map(|range| {
            ChunkInput::Shared(SharedChunk {
                range,
                columns: columns.rows(range.start, range.len()),
            })
        })
        .collect::<Vec<_>>();
    debug!(
        "Published {n} photons in {} column segments, {} chunks",
        segments.len(),
        chunks.len()
    );

    Ok((
        chunks,
        SharedStream {
            columns,
            len: n,
            segments,
        },
    ))
}
