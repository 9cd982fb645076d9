//! # Output writer
//!
//! Writes the merged photon table as a single Parquet file (writer version 2.0) with the
//! fixed column order of [`OutputColumn::ALL`]. Dictionary encoding is enabled only on the
//! low-cardinality columns (`t`, `flags`, `xa`, `xb`, `ya`, `yb`, `q`).
//!
//! The file is first written to `<outfile>.partial` and renamed into place once the Parquet
//! footer is committed, so a failed write never leaves a readable table behind.
use std::{fs::File, sync::Arc};

use arrow_array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, RecordBatch, UInt8Array,
};
use arrow_schema::{Field, Schema, SchemaRef};
use camino::{Utf8Path, Utf8PathBuf};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask},
    file::properties::{WriterProperties, WriterVersion},
    schema::types::ColumnPath,
};
use tracing::{debug, info, warn};

use crate::{
    photonpipe_errors::{PipelineError, Result},
    worker::result::{ChunkResult, ColumnData, OutputColumn},
};

/// What [`write_photon_table`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(Utf8PathBuf),
    /// The file existed and overwriting was disabled; it was left untouched.
    Existing(Utf8PathBuf),
}

impl WriteOutcome {
    pub fn path(&self) -> &Utf8Path {
        match self {
            WriteOutcome::Written(p) | WriteOutcome::Existing(p) => p,
        }
    }
}

/// `{outbase}.parquet`
pub fn output_path(outbase: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{outbase}.parquet"))
}

/// Arrow schema of the photon table.
pub fn photon_schema() -> SchemaRef {
    Arc::new(Schema::new(
        OutputColumn::ALL
            .iter()
            .map(|c| Field::new(c.name(), c.data_type(), false))
            .collect::<Vec<_>>(),
    ))
}

fn writer_properties() -> WriterProperties {
    OutputColumn::ALL
        .iter()
        .filter(|c| c.dictionary_encoded())
        .fold(
            WriterProperties::builder()
                .set_writer_version(WriterVersion::PARQUET_2_0)
                .set_dictionary_enabled(false),
            |builder, c| builder.set_column_dictionary_enabled(ColumnPath::from(c.name()), true),
        )
        .build()
}

fn to_array(data: ColumnData<'_>) -> ArrayRef {
    match data {
        ColumnData::F64(v) => Arc::new(Float64Array::from(v.to_vec())),
        ColumnData::F32(v) => Arc::new(Float32Array::from(v.to_vec())),
        ColumnData::U8(v) => Arc::new(UInt8Array::from(v.to_vec())),
        ColumnData::Bool(v) => Arc::new(BooleanArray::from(v.to_vec())),
    }
}

fn write_batch(result: &ChunkResult, path: &Utf8Path) -> Result<()> {
    let schema = photon_schema();
    let columns = OutputColumn::ALL
        .iter()
        .map(|c| to_array(result.column(*c)))
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, Some(writer_properties()))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Write the photon table to `outfile`.
///
/// Arguments
/// -----------------
/// * `result`: the merged table; every column must have the length of `t`.
/// * `outfile`: destination path, usually from [`output_path`].
/// * `overwrite`: replace an existing file; when `false` an existing file is kept.
///
/// Return
/// ----------
/// * [`WriteOutcome::Written`] or [`WriteOutcome::Existing`].
///
/// See also
/// ------------
/// * [`read_photon_table`] – Reads the table back.
pub fn write_photon_table(
    result: &ChunkResult,
    outfile: &Utf8Path,
    overwrite: bool,
) -> Result<WriteOutcome> {
    if outfile.exists() && !overwrite {
        info!("{outfile} exists and overwrite is disabled, keeping it");
        return Ok(WriteOutcome::Existing(outfile.to_path_buf()));
    }
    result.validate()?;
    if let Some(parent) = outfile.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let partial = Utf8PathBuf::from(format!("{outfile}.partial"));
    if let Err(e) = write_batch(result, &partial) {
        if partial.exists() {
            if let Err(rm) = std::fs::remove_file(&partial) {
                warn!("Unable to remove {partial}: {rm}");
            }
        }
        return Err(e);
    }
    std::fs::rename(&partial, outfile)?;

    info!("Wrote {} photons to {outfile}", result.len());
    Ok(WriteOutcome::Written(outfile.to_path_buf()))
}

fn typed_column<'a, A: Array + 'static>(
    batch: &'a RecordBatch,
    column: OutputColumn,
    path: &Utf8Path,
) -> Result<&'a A> {
    let malformed = |reason: String| PipelineError::MalformedPhotonTable {
        path: path.to_path_buf(),
        reason,
    };
    let array = batch
        .column_by_name(column.name())
        .ok_or_else(|| malformed(format!("column '{}' not found", column.name())))?;
    if array.null_count() > 0 {
        return Err(malformed(format!("column '{}' contains nulls", column.name())));
    }
    array
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| malformed(format!("column '{}' is not {}", column.name(), column.data_type())))
}

/// Read a photon table written by [`write_photon_table`].
///
/// Every column of the fixed schema must be present with its exact type and without nulls;
/// extra columns are ignored.
pub fn read_photon_table(path: &Utf8Path) -> Result<ChunkResult> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;

    let schema = builder.schema().clone();
    for column in OutputColumn::ALL {
        let field = schema
            .field_with_name(column.name())
            .map_err(|_| PipelineError::MalformedPhotonTable {
                path: path.to_path_buf(),
                reason: format!("column '{}' not found", column.name()),
            })?;
        if *field.data_type() != column.data_type() {
            return Err(PipelineError::MalformedPhotonTable {
                path: path.to_path_buf(),
                reason: format!(
                    "column '{}' has type {}, expected {}",
                    column.name(),
                    field.data_type(),
                    column.data_type()
                ),
            });
        }
    }

    let schema_descr = builder.metadata().file_metadata().schema_descr();
    let projection_indices = schema_descr
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| OutputColumn::ALL.iter().any(|o| o.name() == c.name()))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let mask = ProjectionMask::leaves(schema_descr, projection_indices);
    let reader = builder.with_projection(mask).build()?;

    let mut out = ChunkResult::default();
    for maybe_batch in reader {
        let batch = maybe_batch?;
        for column in OutputColumn::ALL {
            macro_rules! extend {
                ($field:ident, $array:ty) => {
                    out.$field
                        .extend_from_slice(typed_column::<$array>(&batch, column, path)?.values())
                };
            }
            match column {
                OutputColumn::T => extend!(t, Float64Array),
                OutputColumn::Flags => extend!(flags, UInt8Array),
                OutputColumn::XRaw => extend!(x_raw, Float32Array),
                OutputColumn::YRaw => extend!(y_raw, Float32Array),
                OutputColumn::Xa => extend!(xa, UInt8Array),
                OutputColumn::Xb => extend!(xb, UInt8Array),
                OutputColumn::Ya => extend!(ya, UInt8Array),
                OutputColumn::Yb => extend!(yb, UInt8Array),
                OutputColumn::Q => extend!(q, UInt8Array),
                OutputColumn::X => extend!(x, Float32Array),
                OutputColumn::Y => extend!(y, Float32Array),
                OutputColumn::Mask => out
                    .mask
                    .extend(typed_column::<BooleanArray>(&batch, column, path)?.values().iter()),
                OutputColumn::Detrad => extend!(detrad, Float32Array),
                OutputColumn::Response => extend!(response, Float32Array),
                OutputColumn::Ra => extend!(ra, Float64Array),
                OutputColumn::Dec => extend!(dec, Float64Array),
            }
        }
    }

    out.validate()?;
    debug!("Read {} photons from {path}", out.len());
    Ok(out)
}

#[cfg(test)]
mod writer_test {
    use parquet::basic::Encoding;

    use super::*;
    use crate::{aspect::AspectSolution, worker::result::result_test::sample_result};

    fn tmp_file(tmp: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join(name)).unwrap()
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Utf8Path::new("/data/e23456-nd")),
            Utf8PathBuf::from("/data/e23456-nd.parquet")
        );
    }

    #[test]
    fn test_write_then_read() {
        let tmp = tempfile::tempdir().unwrap();
        let outfile = tmp_file(&tmp, "photons.parquet");
        let r = sample_result(37, 5.0);

        let outcome = write_photon_table(&r, &outfile, true).unwrap();
        assert_eq!(outcome, WriteOutcome::Written(outfile.clone()));
        assert!(!Utf8PathBuf::from(format!("{outfile}.partial")).exists());
        assert_eq!(read_photon_table(&outfile).unwrap(), r);
    }

    #[test]
    fn test_existing_file_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let outfile = tmp_file(&tmp, "photons.parquet");
        let first = sample_result(3, 0.0);
        write_photon_table(&first, &outfile, true).unwrap();

        let outcome = write_photon_table(&sample_result(9, 1.0), &outfile, false).unwrap();
        assert_eq!(outcome, WriteOutcome::Existing(outfile.clone()));
        assert_eq!(read_photon_table(&outfile).unwrap(), first);

        let second = sample_result(9, 1.0);
        write_photon_table(&second, &outfile, true).unwrap();
        assert_eq!(read_photon_table(&outfile).unwrap(), second);
    }

    #[test]
    fn test_empty_table_keeps_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let outfile = tmp_file(&tmp, "empty.parquet");
        write_photon_table(&ChunkResult::default(), &outfile, true).unwrap();

        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&outfile).unwrap()).unwrap();
        assert_eq!(builder.schema().fields().len(), OutputColumn::ALL.len());
        assert!(read_photon_table(&outfile).unwrap().is_empty());
    }

    #[test]
    fn test_dictionary_columns() {
        let tmp = tempfile::tempdir().unwrap();
        let outfile = tmp_file(&tmp, "photons.parquet");
        write_photon_table(&sample_result(100, 0.0), &outfile, true).unwrap();

        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&outfile).unwrap()).unwrap();
        let row_group = builder.metadata().row_group(0);
        for column in OutputColumn::ALL {
            let encodings = row_group.column(column.index()).encodings();
            assert_eq!(
                encodings.contains(&Encoding::RLE_DICTIONARY),
                column.dictionary_encoded(),
                "column {}",
                column.name()
            );
        }
    }

    #[test]
    fn test_ragged_result_is_not_written() {
        let tmp = tempfile::tempdir().unwrap();
        let outfile = tmp_file(&tmp, "photons.parquet");
        let mut r = sample_result(4, 0.0);
        r.x.pop();
        assert!(matches!(
            write_photon_table(&r, &outfile, true),
            Err(PipelineError::ColumnLengthMismatch { .. })
        ));
        assert!(!outfile.exists());
    }

    #[test]
    fn test_foreign_table_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp_file(&tmp, "asprta.parquet");
        AspectSolution::new(vec![0.0, 1.0], vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0])
            .unwrap()
            .write_parquet(&path)
            .unwrap();
        assert!(matches!(
            read_photon_table(&path),
            Err(PipelineError::MalformedPhotonTable { .. })
        ));
    }
}
