#![allow(dead_code)]

use std::f64::consts::TAU;

use camino::{Utf8Path, Utf8PathBuf};
use photonpipe::{
    archive::{ArchiveClient, ArchiveProduct},
    aspect::AspectSolution,
    band::Band,
    calibration::{CalibrationData, CalibrationEpoch},
    config::PipelineConfigBuilder,
    constants::ExposureId,
    photon_stream::PhotonStream,
    photonpipe_errors::Result,
    pipeline::ExposureRequest,
    scst::SpacecraftState,
    telemetry::write_raw6,
    worker::result::{ChunkResult, ColumnData, OutputColumn},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

/// Spacecraft time of the first synthetic photon.
pub const T0: f64 = 1.0e9;
/// Seconds between two synthetic photons.
pub const DT: f64 = 0.005;
/// FUV detector temperature recorded in the synthetic spacecraft state (°C).
pub const SCST_TEMPERATURE: f64 = 31.0;

/// Synthetic stream: every tenth event is a stim, the others fall inside a disk of
/// radius 300 px around the detector centre.
///
/// Stims sit at their nominal position shifted by `(1.5, -1.0)` px, plus
/// `stim_drift * (t - T0)` px in y.
pub fn synthetic_stream(band: Band, n: usize, seed: u64, stim_drift: f64) -> PhotonStream {
    let mut rng = StdRng::seed_from_u64(seed);
    let stims = band.stim_positions();
    let mut stream = PhotonStream::with_capacity(n);

    for i in 0..n {
        let t = T0 + i as f64 * DT;
        let (x, y) = if i % 10 == 0 {
            let (sx, sy) = stims[(i / 10) % 4];
            (
                sx + 1.5 + rng.gen_range(-0.5..0.5),
                sy - 1.0 + stim_drift * (t - T0) + rng.gen_range(-0.5..0.5),
            )
        } else {
            let r = 300.0 * rng.gen::<f64>().sqrt();
            let theta = TAU * rng.gen::<f64>();
            (400.0 + r * theta.cos(), 400.0 + r * theta.sin())
        };
        stream.push(
            t,
            x as f32,
            y as f32,
            rng.gen_range(0..32),
            rng.gen_range(0..32),
            rng.gen_range(0..32),
            rng.gen_range(0..32),
            rng.gen_range(2..32),
        );
    }
    stream
}

/// One sample per second, covering `[T0 - 2, T0 + duration + 2]`.
pub fn synthetic_aspect(duration: f64) -> AspectSolution {
    let samples = duration.ceil() as usize + 5;
    let time: Vec<f64> = (0..samples).map(|k| T0 - 2.0 + k as f64).collect();
    let ra = (0..samples).map(|k| 210.0 + 1.0e-4 * k as f64).collect();
    let dec = (0..samples).map(|k| 35.0 - 5.0e-5 * k as f64).collect();
    AspectSolution::new(time, ra, dec, vec![112.5; samples]).unwrap()
}

/// Inputs of one synthetic exposure written to a temporary directory.
pub struct Fixture {
    _tmp: TempDir,
    pub root: Utf8PathBuf,
    pub band: Band,
    pub eclipse: ExposureId,
    pub stream: PhotonStream,
    /// Directory holding the telemetry, aspect and spacecraft state files under their
    /// archive names.
    pub local: Utf8PathBuf,
    pub raw6: Utf8PathBuf,
    pub aspect: Utf8PathBuf,
    pub scst: Utf8PathBuf,
    pub calibration_dir: Utf8PathBuf,
    pub segment_parent: Utf8PathBuf,
}

impl Fixture {
    pub fn new(band: Band, eclipse: ExposureId, n: usize, seed: u64) -> Self {
        Self::with_stream(band, eclipse, synthetic_stream(band, n, seed, 0.0))
    }

    pub fn with_stream(band: Band, eclipse: ExposureId, stream: PhotonStream) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let local = root.join("local");
        let calibration_dir = root.join("cal");
        let segment_parent = root.join("shm");
        for dir in [&local, &calibration_dir, &segment_parent] {
            std::fs::create_dir_all(dir).unwrap();
        }

        let raw6 = local.join(ArchiveProduct::Raw6 { eclipse, band }.file_name());
        write_raw6(&raw6, band, eclipse, &stream).unwrap();

        let aspect = local.join(ArchiveProduct::Aspect { eclipse }.file_name());
        synthetic_aspect(stream.len() as f64 * DT)
            .write_parquet(&aspect)
            .unwrap();

        let scst = local.join(ArchiveProduct::Scst { eclipse }.file_name());
        SpacecraftState {
            eclipse: Some(eclipse),
            time: vec![T0, T0 + 1.0, T0 + 2.0],
            fdttdc: vec![SCST_TEMPERATURE; 3],
        }
        .write_parquet(&scst)
        .unwrap();

        CalibrationData::nominal(band, CalibrationEpoch::of(eclipse))
            .write_to_dir(&calibration_dir)
            .unwrap();

        Fixture {
            _tmp: tmp,
            root,
            band,
            eclipse,
            stream,
            local,
            raw6,
            aspect,
            scst,
            calibration_dir,
            segment_parent,
        }
    }

    /// Request reading the local files, writing `{root}/out/{name}.parquet`.
    pub fn request(&self, name: &str) -> ExposureRequest {
        ExposureRequest::new(
            self.root.join("out").join(name),
            &self.calibration_dir,
            self.root.join("cache"),
        )
        .raw6(&self.raw6)
        .aspect(&self.aspect)
        .scst(&self.scst)
        .eclipse(self.eclipse)
    }

    /// Configuration builder for this exposure with segments under the fixture.
    pub fn config(&self) -> PipelineConfigBuilder {
        photonpipe::config::PipelineConfig::builder()
            .band(self.band)
            .segment_dir(&self.segment_parent)
    }

    /// Entries left in the segment parent directory.
    pub fn segment_leftovers(&self) -> usize {
        std::fs::read_dir(&self.segment_parent).unwrap().count()
    }
}

/// Archive answering from a local directory, counting the fetches.
pub struct LocalMirror {
    pub source: Utf8PathBuf,
    pub fetches: std::sync::atomic::AtomicUsize,
}

impl LocalMirror {
    pub fn new(source: &Utf8Path) -> Self {
        LocalMirror {
            source: source.to_path_buf(),
            fetches: Default::default(),
        }
    }
}

impl ArchiveClient for LocalMirror {
    fn fetch(&self, product: &ArchiveProduct, dest: &Utf8Path) -> Result<()> {
        self.fetches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.source.join(product.file_name()), dest)?;
        Ok(())
    }
}

/// Bitwise equality of two tables, NaN included.
pub fn assert_same_table(actual: &ChunkResult, expected: &ChunkResult) {
    assert_eq!(actual.len(), expected.len(), "row count");
    for column in OutputColumn::ALL {
        let same = match (actual.column(column), expected.column(column)) {
            (ColumnData::F64(a), ColumnData::F64(b)) => {
                a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ColumnData::F32(a), ColumnData::F32(b)) => {
                a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ColumnData::U8(a), ColumnData::U8(b)) => a == b,
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a == b,
            _ => false,
        };
        assert!(same, "column {} differs", column.name());
    }
}
