//! Publishing reference data to shared segments.
//!
//! In shared mode the eight tables are copied once, before fan-out, into a single segment.
//! Workers receive [`CalibrationHandles`] (grid geometry plus one [`ArrayHandle`] per table)
//! through a [`CalibrationSource`]. The first chunk to need the tables rebuilds them from the
//! segment; every later chunk of the run reuses that copy. The publishing side keeps the
//! [`OwnedSegment`] and hands it to the merger, which releases it after every worker has
//! finished.
use std::sync::{Arc, Mutex};

use crate::{
    band::Band,
    calibration::{CalibrationData, CalibrationEpoch, LookupTable, TableKind},
    photonpipe_errors::{PipelineError, Result},
    shared_memory::{ArrayHandle, OwnedSegment, SegmentDir},
};

/// Placement of one table, without its values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableGeometry {
    pub kind: TableKind,
    pub rows: usize,
    pub cols: usize,
    pub x0: f64,
    pub y0: f64,
    pub dx: f64,
    pub dy: f64,
}

impl From<&LookupTable> for TableGeometry {
    fn from(t: &LookupTable) -> Self {
        TableGeometry {
            kind: t.kind,
            rows: t.rows,
            cols: t.cols,
            x0: t.x0,
            y0: t.y0,
            dx: t.dx,
            dy: t.dy,
        }
    }
}

/// Everything a worker needs to rebuild the reference data from a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationHandles {
    pub band: Band,
    pub epoch: CalibrationEpoch,
    pub tables: Vec<(TableGeometry, ArrayHandle)>,
}

/// Copy `data` into one new segment of `dir`.
///
/// Return
/// ----------
/// * The handles to give to the workers and the segment's unlink token.
pub fn publish(
    data: &CalibrationData,
    dir: &SegmentDir,
) -> Result<(CalibrationHandles, OwnedSegment)> {
    let total: usize = TableKind::ALL
        .iter()
        .map(|&k| data.table(k).values.len())
        .sum();
    let mut writer = dir.allocate("calibration", total * std::mem::size_of::<f32>())?;

    let mut tables = Vec::with_capacity(TableKind::ALL.len());
    let mut offset = 0;
    for kind in TableKind::ALL {
        let table = data.table(kind);
        let handle = writer.write(offset, &table.values)?;
        offset += table.values.len();
        tables.push((TableGeometry::from(table), handle));
    }

    let owner = writer.seal()?;
    Ok((
        CalibrationHandles {
            band: data.band,
            epoch: data.epoch,
            tables,
        },
        owner,
    ))
}

impl CalibrationHandles {
    /// Rebuild the reference data from the published segment.
    pub fn attach(&self, dir: &SegmentDir) -> Result<CalibrationData> {
        let Some((_, first)) = self.tables.first() else {
            return Err(PipelineError::SegmentAttach {
                name: "calibration".into(),
                reason: "no table handles".into(),
            });
        };
        let view = dir.attach(&first.segment)?;

        let tables = self
            .tables
            .iter()
            .map(|(g, handle)| {
                Ok(LookupTable {
                    kind: g.kind,
                    rows: g.rows,
                    cols: g.cols,
                    x0: g.x0,
                    y0: g.y0,
                    dx: g.dx,
                    dy: g.dy,
                    values: view.read::<f32>(handle)?.to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tables: [LookupTable; 8] =
            tables
                .try_into()
                .map_err(|v: Vec<LookupTable>| PipelineError::SegmentAttach {
                    name: first.segment.to_string(),
                    reason: format!("{} table handles, expected 8", v.len()),
                })?;
        CalibrationData::from_tables(self.band, self.epoch, tables)
    }
}

/// How a worker reaches the reference data.
#[derive(Debug, Clone)]
pub enum CalibrationSource {
    /// Shared in-process by reference counting.
    Owned(Arc<CalibrationData>),
    /// Published in a segment of `dir`.
    Shared {
        dir: SegmentDir,
        handles: Arc<CalibrationHandles>,
        attached: Arc<Mutex<Option<Arc<CalibrationData>>>>,
    },
}

impl CalibrationSource {
    /// Source reading the tables published under `handles`, not attached yet.
    pub fn shared(dir: SegmentDir, handles: CalibrationHandles) -> Self {
        CalibrationSource::Shared {
            dir,
            handles: Arc::new(handles),
            attached: Arc::default(),
        }
    }

    /// Reference data for one chunk.
    ///
    /// A shared source attaches the segment on the first call; clones of the source share
    /// the attached tables.
    pub fn resolve(&self) -> Result<Arc<CalibrationData>> {
        match self {
            CalibrationSource::Owned(data) => Ok(Arc::clone(data)),
            CalibrationSource::Shared {
                dir,
                handles,
                attached,
            } => {
                let mut slot = attached.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(data) = slot.as_ref() {
                    return Ok(Arc::clone(data));
                }
                let data = Arc::new(handles.attach(dir)?);
                *slot = Some(Arc::clone(&data));
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod calibration_shared_test {
    use camino::Utf8Path;

    use super::*;

    #[test]
    fn test_publish_and_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SegmentDir::create(Utf8Path::from_path(tmp.path()).unwrap()).unwrap();

        let mut data = CalibrationData::nominal(Band::Fuv, CalibrationEpoch::Late);
        data.flat.values = vec![0.5, 1.0, 1.5, 2.0];

        let (handles, owner) = publish(&data, &dir).unwrap();
        assert_eq!(handles.attach(&dir).unwrap(), data);
        let source = CalibrationSource::shared(dir.clone(), handles.clone());
        assert_eq!(*source.resolve().unwrap(), data);

        owner.unlink().unwrap();
        assert!(matches!(
            handles.attach(&dir),
            Err(PipelineError::SegmentAttach { .. })
        ));
        assert!(matches!(
            CalibrationSource::shared(dir.clone(), handles).resolve(),
            Err(PipelineError::SegmentAttach { .. })
        ));
        dir.remove().unwrap();
    }

    #[test]
    fn test_tables_attached_once_per_run() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SegmentDir::create(Utf8Path::from_path(tmp.path()).unwrap()).unwrap();
        let data = CalibrationData::nominal(Band::Nuv, CalibrationEpoch::Early);
        let (handles, owner) = publish(&data, &dir).unwrap();

        let source = CalibrationSource::shared(dir.clone(), handles);
        let per_chunk = source.clone();
        let first = source.resolve().unwrap();
        let second = per_chunk.resolve().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // later chunks no longer read the segment
        owner.unlink().unwrap();
        assert!(Arc::ptr_eq(&per_chunk.resolve().unwrap(), &first));
        dir.remove().unwrap();
    }
}
