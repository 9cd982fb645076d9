//! # Spacecraft state
//!
//! Housekeeping of one exposure. The pipeline only reads the FUV detector temperature
//! (`fdttdc`, °C), which sets the FUV detector offsets through
//! [`DetectorOffsets::for_band`].
//!
//! The on-disk form is a Parquet file with `f64` columns `time` and `fdttdc`, one row per
//! housekeeping sample. The schema metadata key `ECLIPSE`, when present, names the
//! exposure the file belongs to.
//!
//! ## See also
//! ------------
//! * [`load_scst`] – Local file or archive retrieval, like the aspect solution.
use std::{collections::HashMap, fs::File, sync::Arc};

use arrow_array::{Array, Float64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use camino::{Utf8Path, Utf8PathBuf};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask};
use tracing::{debug, info, warn};

use crate::{
    archive::{retrieve_with_retries, ArchiveClient, ArchiveProduct},
    band::{Band, DetectorOffsets},
    constants::{ExposureId, Seconds},
    photonpipe_errors::{PipelineError, Result},
};

const SCST_COLUMNS: [&str; 2] = ["time", "fdttdc"];
const ECLIPSE_KEY: &str = "ECLIPSE";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpacecraftState {
    /// Exposure named in the file metadata.
    pub eclipse: Option<ExposureId>,
    pub time: Vec<Seconds>,
    /// FUV detector temperature samples (°C).
    pub fdttdc: Vec<f64>,
}

impl SpacecraftState {
    /// Median of the finite temperature samples.
    pub fn fuv_temperature(&self) -> Option<f64> {
        let mut samples: Vec<f64> = self.fdttdc.iter().copied().filter(|v| v.is_finite()).collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(f64::total_cmp);
        let mid = samples.len() / 2;
        Some(if samples.len() % 2 == 0 {
            0.5 * (samples[mid - 1] + samples[mid])
        } else {
            samples[mid]
        })
    }

    /// FUV detector offsets at the recorded temperature.
    ///
    /// Without any temperature sample the nominal temperature is used.
    pub fn fuv_offsets(&self) -> DetectorOffsets {
        let temperature = self.fuv_temperature();
        if temperature.is_none() {
            warn!("No FUV detector temperature in the spacecraft state; assuming nominal");
        }
        DetectorOffsets::for_band(Band::Fuv, temperature)
    }

    /// Read a spacecraft state Parquet file.
    pub fn read_parquet(path: &Utf8Path) -> Result<Self> {
        let invalid = |reason: String| PipelineError::InvalidSpacecraftState {
            path: path.to_path_buf(),
            reason,
        };

        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let eclipse = match builder.schema().metadata().get(ECLIPSE_KEY) {
            Some(v) => Some(
                v.trim()
                    .parse::<ExposureId>()
                    .map_err(|e| invalid(format!("{ECLIPSE_KEY} = '{v}': {e}")))?,
            ),
            None => None,
        };

        let schema_descr = builder.metadata().file_metadata().schema_descr();
        let projection_indices = SCST_COLUMNS
            .iter()
            .map(|name| {
                schema_descr
                    .columns()
                    .iter()
                    .position(|f| f.name() == *name)
                    .ok_or_else(|| invalid(format!("column '{name}' not found")))
            })
            .collect::<Result<Vec<usize>>>()?;
        let mask = ProjectionMask::leaves(schema_descr, projection_indices);
        let reader = builder.with_projection(mask).build()?;

        let mut state = SpacecraftState {
            eclipse,
            ..Default::default()
        };
        for maybe_batch in reader {
            let batch = maybe_batch?;
            for (name, values) in SCST_COLUMNS
                .iter()
                .zip([&mut state.time, &mut state.fdttdc])
            {
                let array = batch
                    .column_by_name(name)
                    .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                    .ok_or_else(|| invalid(format!("column '{name}' is not Float64")))?;
                if array.null_count() > 0 {
                    return Err(invalid(format!("column '{name}' contains nulls")));
                }
                values.extend_from_slice(array.values());
            }
        }
        debug!("Read {} spacecraft state samples from {path}", state.time.len());
        Ok(state)
    }

    /// Write the state as a spacecraft state Parquet file.
    pub fn write_parquet(&self, path: &Utf8Path) -> Result<()> {
        let metadata: HashMap<String, String> = self
            .eclipse
            .map(|e| (ECLIPSE_KEY.to_string(), e.to_string()))
            .into_iter()
            .collect();
        let schema = Arc::new(
            Schema::new(
                SCST_COLUMNS
                    .iter()
                    .map(|name| Field::new(*name, DataType::Float64, false))
                    .collect::<Vec<_>>(),
            )
            .with_metadata(metadata),
        );
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Float64Array::from(self.time.clone())),
                Arc::new(Float64Array::from(self.fdttdc.clone())),
            ],
        )?;

        let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }
}

/// Load the spacecraft state of a run, retrieving the file if it is not on disk.
///
/// Arguments
/// -----------------
/// * `path`: explicit local path, if any.
/// * `eclipse`: exposure id of the run; a file naming another exposure is rejected.
/// * `archive`, `retries`: retrieval on a cache miss.
/// * `cache_dir`: destination directory when no explicit path is given.
pub fn load_scst(
    path: Option<&Utf8Path>,
    eclipse: ExposureId,
    archive: &dyn ArchiveClient,
    retries: u32,
    cache_dir: &Utf8Path,
) -> Result<SpacecraftState> {
    let product = ArchiveProduct::Scst { eclipse };
    let path: Utf8PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => cache_dir.join(product.file_name()),
    };
    if !path.exists() {
        retrieve_with_retries(archive, &product, &path, retries)?;
    }
    let state = SpacecraftState::read_parquet(&path)?;
    if let Some(found) = state.eclipse.filter(|&e| e != eclipse) {
        return Err(PipelineError::InvalidSpacecraftState {
            path,
            reason: format!("file of exposure {found}, expected {eclipse}"),
        });
    }
    info!(
        "Spacecraft state of exposure {eclipse}: {} samples, FUV detector at {:?} °C",
        state.time.len(),
        state.fuv_temperature()
    );
    Ok(state)
}
