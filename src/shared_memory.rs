//! # Named shared-memory segments
//!
//! Large photon arrays are handed to workers through **named, file-backed memory maps**
//! living in a run-scoped [`SegmentDir`] (by default under `/dev/shm`). Any thread or
//! process that knows the directory and a segment name can map the segment; nothing but
//! an [`ArrayHandle`] (`{segment, shape, dtype, offset}`) ever crosses the worker boundary.
//!
//! ## Lifecycle
//!
//! ```text
//! SegmentDir::allocate ──► SegmentWriter ──write──► seal() ──► OwnedSegment ──unlink()──► gone
//!                                                                │
//!                                   ArrayHandle (clone, by value) ──► SegmentDir::attach ──► SegmentView (read-only)
//! ```
//!
//! * A segment has a single writer until [`SegmentWriter::seal`]; afterwards it is only read.
//! * [`OwnedSegment`] is the unique unlink right. [`OwnedSegment::unlink`] consumes it, so a
//!   segment cannot be unlinked twice. Dropping a token that was never unlinked removes the
//!   file as well, which is what failed runs rely on to leave no segment behind.
//! * Attaching never transfers ownership: a [`SegmentView`] only keeps a read-only map.
//!
//! ## Layout
//!
//! Values are stored in native byte order with no header. An [`ArrayHandle`] offset is
//! counted in elements of its [`DType`]; writers keep every array start aligned to its
//! element size so views can be borrowed without copying.
use std::{
    fs::OpenOptions,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use bytemuck::Pod;
use camino::{Utf8Path, Utf8PathBuf};
use memmap2::{Mmap, MmapMut};
use tracing::{debug, warn};

use crate::photonpipe_errors::{PipelineError, Result};

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);
static SEGMENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Element type of an array stored in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F64,
    F32,
    U8,
    /// Stored as one byte per value, 0 or 1.
    Bool,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::F64 => 8,
            DType::F32 => 4,
            DType::U8 | DType::Bool => 1,
        }
    }
}

/// Plain-old-data element types that can be stored in a segment.
pub trait SegmentElement: Pod {
    const DTYPE: DType;
}

impl SegmentElement for f64 {
    const DTYPE: DType = DType::F64;
}

impl SegmentElement for f32 {
    const DTYPE: DType = DType::F32;
}

impl SegmentElement for u8 {
    const DTYPE: DType = DType::U8;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName(String);

impl SegmentName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SegmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor of one array inside a segment.
///
/// Fields
/// -----------------
/// * `segment` – name of the segment holding the data.
/// * `shape` – number of elements.
/// * `dtype` – element type.
/// * `offset` – index of the first element, in elements of `dtype`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayHandle {
    pub segment: SegmentName,
    pub shape: usize,
    pub dtype: DType,
    pub offset: usize,
}

impl ArrayHandle {
    fn byte_range(&self) -> Range<usize> {
        let start = self.offset * self.dtype.size();
        start..start + self.shape * self.dtype.size()
    }

    /// Handle on `len` rows starting `start` rows into this array.
    pub fn rows(&self, start: usize, len: usize) -> ArrayHandle {
        debug_assert!(start + len <= self.shape);
        ArrayHandle {
            segment: self.segment.clone(),
            shape: len,
            dtype: self.dtype,
            offset: self.offset + start,
        }
    }
}

/// Run-scoped directory holding every segment of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct SegmentDir {
    root: Utf8PathBuf,
}

impl SegmentDir {
    /// Preferred parent directory: `/dev/shm` when available, the system temp dir otherwise.
    pub fn default_parent() -> Utf8PathBuf {
        let shm = Utf8Path::new("/dev/shm");
        if shm.is_dir() {
            return shm.to_path_buf();
        }
        Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
    }

    /// Create a fresh, uniquely named segment directory under `parent`.
    pub fn create(parent: &Utf8Path) -> Result<Self> {
        let root = parent.join(format!(
            "photonpipe-{}-{}",
            std::process::id(),
            RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&root).map_err(|e| PipelineError::SegmentAllocation {
            name: root.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Created segment directory {root}");
        Ok(SegmentDir { root })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    fn segment_path(&self, name: &SegmentName) -> Utf8PathBuf {
        self.root.join(name.as_str())
    }

    /// Number of segment files currently present.
    pub fn segment_count(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    /// Allocate a new segment of `bytes` bytes, named after `prefix`.
    ///
    /// Return
    /// ----------
    /// * A [`SegmentWriter`], the only writer the segment will ever have, or
    ///   [`PipelineError::SegmentAllocation`] if the backing file or mapping fails.
    pub fn allocate(&self, prefix: &str, bytes: usize) -> Result<SegmentWriter> {
        let name = SegmentName(format!(
            "{prefix}-{}",
            SEGMENT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        let path = self.segment_path(&name);
        let alloc_err = |e: std::io::Error| PipelineError::SegmentAllocation {
            name: name.to_string(),
            reason: e.to_string(),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(alloc_err)?;

        // From here on the token owns the file, so any failure below removes it.
        let owner = OwnedSegment {
            name: name.clone(),
            path,
            released: false,
        };

        // Zero-length maps are rejected by the OS.
        file.set_len(bytes.max(1) as u64).map_err(alloc_err)?;
        // SAFETY: the file was just created by this writer and is not shared until sealed.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(alloc_err)?;

        Ok(SegmentWriter {
            owner,
            mmap,
            len: bytes,
        })
    }

    /// Map an existing segment read-only.
    pub fn attach(&self, name: &SegmentName) -> Result<SegmentView> {
        let attach_err = |e: std::io::Error| PipelineError::SegmentAttach {
            name: name.to_string(),
            reason: e.to_string(),
        };
        let file = std::fs::File::open(self.segment_path(name)).map_err(attach_err)?;
        // SAFETY: segments are sealed before any handle on them is published, and never
        // written again.
        let mmap = unsafe { Mmap::map(&file) }.map_err(attach_err)?;
        Ok(SegmentView {
            name: name.clone(),
            mmap,
        })
    }

    /// Remove the directory. Leftover segments are reported and deleted.
    pub fn remove(self) -> Result<()> {
        let leftovers = self.segment_count();
        if leftovers > 0 {
            warn!(
                "{leftovers} segment(s) still present in {} at teardown",
                self.root
            );
            std::fs::remove_dir_all(&self.root)?;
        } else {
            std::fs::remove_dir(&self.root)?;
        }
        Ok(())
    }
}

/// Write access to a freshly allocated segment.
#[derive(Debug)]
pub struct SegmentWriter {
    owner: OwnedSegment,
    mmap: MmapMut,
    len: usize,
}

impl SegmentWriter {
    pub fn name(&self) -> &SegmentName {
        &self.owner.name
    }

    fn checked_range(&self, range: Range<usize>) -> Result<Range<usize>> {
        if range.end > self.len {
            return Err(PipelineError::SegmentAllocation {
                name: self.owner.name.to_string(),
                reason: format!("write of bytes {range:?} beyond segment size {}", self.len),
            });
        }
        Ok(range)
    }

    /// Copy `data` into the segment, starting `offset` elements in.
    pub fn write<T: SegmentElement>(&mut self, offset: usize, data: &[T]) -> Result<ArrayHandle> {
        let handle = ArrayHandle {
            segment: self.owner.name.clone(),
            shape: data.len(),
            dtype: T::DTYPE,
            offset,
        };
        let range = self.checked_range(handle.byte_range())?;
        self.mmap[range].copy_from_slice(bytemuck::cast_slice(data));
        Ok(handle)
    }

    /// Copy booleans into the segment as bytes, starting `offset` elements in.
    pub fn write_bools(&mut self, offset: usize, data: &[bool]) -> Result<ArrayHandle> {
        let handle = ArrayHandle {
            segment: self.owner.name.clone(),
            shape: data.len(),
            dtype: DType::Bool,
            offset,
        };
        let range = self.checked_range(handle.byte_range())?;
        for (dst, &v) in self.mmap[range].iter_mut().zip(data) {
            *dst = u8::from(v);
        }
        Ok(handle)
    }

    /// End the write phase and hand back the unlink token.
    pub fn seal(self) -> Result<OwnedSegment> {
        self.mmap.flush()?;
        Ok(self.owner)
    }
}

/// Unique right to unlink one segment.
#[derive(Debug)]
pub struct OwnedSegment {
    name: SegmentName,
    path: Utf8PathBuf,
    released: bool,
}

impl OwnedSegment {
    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    /// Remove the segment. Consumes the token.
    pub fn unlink(mut self) -> Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)?;
        debug!("Unlinked segment {}", self.name);
        Ok(())
    }
}

impl Drop for OwnedSegment {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to release segment {}: {e}", self.name);
            } else {
                debug!("Released abandoned segment {}", self.name);
            }
        }
    }
}

/// Read-only map of a sealed segment.
#[derive(Debug)]
pub struct SegmentView {
    name: SegmentName,
    mmap: Mmap,
}

impl SegmentView {
    fn bytes(&self, handle: &ArrayHandle, expected: DType) -> Result<&[u8]> {
        let attach_err = |reason: String| PipelineError::SegmentAttach {
            name: self.name.to_string(),
            reason,
        };
        if handle.segment != self.name {
            return Err(attach_err(format!(
                "handle refers to segment {}",
                handle.segment
            )));
        }
        if handle.dtype != expected {
            return Err(attach_err(format!(
                "dtype mismatch: handle holds {:?}, read as {expected:?}",
                handle.dtype
            )));
        }
        let range = handle.byte_range();
        if range.end > self.mmap.len() {
            return Err(attach_err(format!(
                "bytes {range:?} beyond segment size {}",
                self.mmap.len()
            )));
        }
        Ok(&self.mmap[range])
    }

    /// Borrow the array described by `handle`.
    pub fn read<T: SegmentElement>(&self, handle: &ArrayHandle) -> Result<&[T]> {
        let bytes = self.bytes(handle, T::DTYPE)?;
        bytemuck::try_cast_slice(bytes).map_err(|e| PipelineError::SegmentAttach {
            name: self.name.to_string(),
            reason: format!("misaligned array: {e:?}"),
        })
    }

    pub fn read_bools(&self, handle: &ArrayHandle) -> Result<Vec<bool>> {
        Ok(self
            .bytes(handle, DType::Bool)?
            .iter()
            .map(|&b| b != 0)
            .collect())
    }
}

#[cfg(test)]
mod shared_memory_test {
    use super::*;

    fn temp_segment_dir() -> (tempfile::TempDir, SegmentDir) {
        let tmp = tempfile::tempdir().unwrap();
        let parent = Utf8Path::from_path(tmp.path()).unwrap().to_path_buf();
        let dir = SegmentDir::create(&parent).unwrap();
        (tmp, dir)
    }

    #[test]
    fn test_write_seal_attach_unlink() {
        let (_tmp, dir) = temp_segment_dir();

        let data = [1.5_f64, 2.5, 3.5, 4.5];
        let mut writer = dir.allocate("column-t", data.len() * 8).unwrap();
        let handle = writer.write(0, &data).unwrap();
        let owner = writer.seal().unwrap();
        assert_eq!(dir.segment_count(), 1);

        let view = dir.attach(&handle.segment).unwrap();
        assert_eq!(view.read::<f64>(&handle).unwrap(), &data);
        assert_eq!(view.read::<f64>(&handle.rows(1, 2)).unwrap(), &[2.5, 3.5]);
        drop(view);

        owner.unlink().unwrap();
        assert_eq!(dir.segment_count(), 0);
        dir.remove().unwrap();
    }

    #[test]
    fn test_dtype_mismatch_is_rejected() {
        let (_tmp, dir) = temp_segment_dir();

        let mut writer = dir.allocate("column-x", 8).unwrap();
        let handle = writer.write(0, &[1.0_f32, 2.0]).unwrap();
        let _owner = writer.seal().unwrap();

        let view = dir.attach(&handle.segment).unwrap();
        assert!(matches!(
            view.read::<f64>(&handle),
            Err(PipelineError::SegmentAttach { .. })
        ));
    }

    #[test]
    fn test_write_past_end_fails() {
        let (_tmp, dir) = temp_segment_dir();
        let mut writer = dir.allocate("small", 4).unwrap();
        assert!(writer.write(1, &[1.0_f32]).is_err());
    }

    #[test]
    fn test_dropped_token_releases_segment() {
        let (_tmp, dir) = temp_segment_dir();
        {
            let mut writer = dir.allocate("abandoned", 3).unwrap();
            writer.write_bools(0, &[true, false, true]).unwrap();
            let _owner = writer.seal().unwrap();
            assert_eq!(dir.segment_count(), 1);
        }
        assert_eq!(dir.segment_count(), 0);
    }

    #[test]
    fn test_empty_segment() {
        let (_tmp, dir) = temp_segment_dir();
        let mut writer = dir.allocate("empty", 0).unwrap();
        let handle = writer.write::<f64>(0, &[]).unwrap();
        let owner = writer.seal().unwrap();

        let view = dir.attach(&handle.segment).unwrap();
        assert!(view.read::<f64>(&handle).unwrap().is_empty());
        owner.unlink().unwrap();
    }
}
