//! # Aspect solution
//!
//! Time series of spacecraft pointing `(ra, dec, roll)` in degrees, interpolated per
//! photon by the workers. Samples are stored column-wise and must be strictly increasing
//! in time; [`AspectSolution::new`] rejects anything else.
//!
//! Interpolation is linear between the two bracketing samples. Right ascension and roll
//! are interpolated along the shortest arc, so a pair straddling 0°/360° does not sweep
//! through the whole circle. Times outside the covered span, or inside a gap longer than
//! [`ASPECT_MAX_GAP`], have no pointing.
//!
//! The on-disk form is a Parquet file with `f64` columns `time`, `ra`, `dec`, `roll`.
use std::{fs::File, sync::Arc};

use arrow_array::{Array, Float64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use camino::{Utf8Path, Utf8PathBuf};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask};
use tracing::{debug, info};

use crate::{
    archive::{retrieve_with_retries, ArchiveClient, ArchiveProduct},
    constants::{Degree, ExposureId, Seconds, ASPECT_MAX_GAP},
    photonpipe_errors::{PipelineError, Result},
};

const ASPECT_COLUMNS: [&str; 4] = ["time", "ra", "dec", "roll"];

/// Pointing of the boresight at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointing {
    pub ra: Degree,
    pub dec: Degree,
    pub roll: Degree,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AspectSolution {
    time: Vec<Seconds>,
    ra: Vec<Degree>,
    dec: Vec<Degree>,
    roll: Vec<Degree>,
}

/// Signed shortest angular difference `b - a`, in (-180, 180].
fn wrapped_delta(a: Degree, b: Degree) -> Degree {
    let d = (b - a).rem_euclid(360.0);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

impl AspectSolution {
    /// Build a solution from its columns.
    ///
    /// Return
    /// ----------
    /// * [`PipelineError::InvalidAspect`] if the columns are empty, have different lengths,
    ///   contain non-finite values, or if `time` is not strictly increasing.
    pub fn new(
        time: Vec<Seconds>,
        ra: Vec<Degree>,
        dec: Vec<Degree>,
        roll: Vec<Degree>,
    ) -> Result<Self> {
        if time.is_empty() {
            return Err(PipelineError::InvalidAspect("no samples".into()));
        }
        if ra.len() != time.len() || dec.len() != time.len() || roll.len() != time.len() {
            return Err(PipelineError::InvalidAspect(format!(
                "column lengths differ (time {}, ra {}, dec {}, roll {})",
                time.len(),
                ra.len(),
                dec.len(),
                roll.len()
            )));
        }
        if let Some(i) = (0..time.len()).find(|&i| {
            !(time[i].is_finite() && ra[i].is_finite() && dec[i].is_finite() && roll[i].is_finite())
        }) {
            return Err(PipelineError::InvalidAspect(format!(
                "non-finite sample at row {i}"
            )));
        }
        if let Some(i) = time.windows(2).position(|w| w[1] <= w[0]) {
            return Err(PipelineError::InvalidAspect(format!(
                "time not strictly increasing at row {}",
                i + 1
            )));
        }
        Ok(AspectSolution {
            time,
            ra,
            dec,
            roll,
        })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// First and last sample times.
    pub fn time_span(&self) -> (Seconds, Seconds) {
        (self.time[0], self.time[self.time.len() - 1])
    }

    /// Pointing at time `t`, or `None` when `t` is not covered.
    pub fn interpolate(&self, t: Seconds) -> Option<Pointing> {
        let (first, last) = self.time_span();
        if !t.is_finite() || t < first || t > last {
            return None;
        }

        // First sample strictly after `t`.
        let next = self.time.partition_point(|&s| s <= t);
        if next == self.time.len() {
            let i = next - 1;
            return Some(Pointing {
                ra: self.ra[i],
                dec: self.dec[i],
                roll: self.roll[i],
            });
        }
        let i = next - 1;

        let gap = self.time[next] - self.time[i];
        if gap > ASPECT_MAX_GAP {
            return None;
        }
        let f = (t - self.time[i]) / gap;

        Some(Pointing {
            ra: (self.ra[i] + f * wrapped_delta(self.ra[i], self.ra[next])).rem_euclid(360.0),
            dec: self.dec[i] + f * (self.dec[next] - self.dec[i]),
            roll: self.roll[i] + f * wrapped_delta(self.roll[i], self.roll[next]),
        })
    }

    /// Read an aspect Parquet file.
    pub fn read_parquet(path: &Utf8Path) -> Result<Self> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let schema_descr = builder.metadata().file_metadata().schema_descr();
        let all_fields = schema_descr.columns();
        let projection_indices = ASPECT_COLUMNS
            .iter()
            .map(|name| {
                all_fields
                    .iter()
                    .position(|f| f.name() == *name)
                    .ok_or_else(|| {
                        PipelineError::InvalidAspect(format!("column '{name}' not found in {path}"))
                    })
            })
            .collect::<Result<Vec<usize>>>()?;
        let mask = ProjectionMask::leaves(schema_descr, projection_indices);
        let reader = builder.with_projection(mask).build()?;

        let mut columns: [Vec<f64>; 4] = Default::default();
        for maybe_batch in reader {
            let batch = maybe_batch?;
            for (name, values) in ASPECT_COLUMNS.iter().zip(columns.iter_mut()) {
                let array = batch
                    .column_by_name(name)
                    .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                    .ok_or_else(|| {
                        PipelineError::InvalidAspect(format!("column '{name}' is not Float64"))
                    })?;
                if array.null_count() > 0 {
                    return Err(PipelineError::InvalidAspect(format!(
                        "column '{name}' contains nulls"
                    )));
                }
                values.extend_from_slice(array.values());
            }
        }

        let [time, ra, dec, roll] = columns;
        let aspect = AspectSolution::new(time, ra, dec, roll)?;
        debug!("Read {} aspect samples from {path}", aspect.len());
        Ok(aspect)
    }

    /// Write the solution as an aspect Parquet file.
    pub fn write_parquet(&self, path: &Utf8Path) -> Result<()> {
        let schema = Arc::new(Schema::new(
            ASPECT_COLUMNS
                .iter()
                .map(|name| Field::new(*name, DataType::Float64, false))
                .collect::<Vec<_>>(),
        ));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Float64Array::from(self.time.clone())),
                Arc::new(Float64Array::from(self.ra.clone())),
                Arc::new(Float64Array::from(self.dec.clone())),
                Arc::new(Float64Array::from(self.roll.clone())),
            ],
        )?;

        let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }
}

/// Load the aspect solution of a run, retrieving the file if it is not on disk.
///
/// Arguments
/// -----------------
/// * `path`: explicit local path, if any.
/// * `eclipse`: exposure id of the run.
/// * `archive`, `retries`: retrieval on a cache miss.
/// * `cache_dir`: destination directory when no explicit path is given.
pub fn load_aspect(
    path: Option<&Utf8Path>,
    eclipse: ExposureId,
    archive: &dyn ArchiveClient,
    retries: u32,
    cache_dir: &Utf8Path,
) -> Result<AspectSolution> {
    let product = ArchiveProduct::Aspect { eclipse };
    let path: Utf8PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => cache_dir.join(product.file_name()),
    };
    if !path.exists() {
        retrieve_with_retries(archive, &product, &path, retries)?;
    }
    let aspect = AspectSolution::read_parquet(&path)?;
    info!(
        "Aspect solution of exposure {eclipse}: {} samples over [{:.3}, {:.3}] s",
        aspect.len(),
        aspect.time_span().0,
        aspect.time_span().1
    );
    Ok(aspect)
}
