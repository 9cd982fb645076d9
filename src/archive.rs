//! # Remote archive retrieval
//!
//! Raw telemetry, aspect and spacecraft state files that are not available locally are fetched from the
//! mission archive. Only the interface matters to the pipeline: an [`ArchiveClient`]
//! knows how to place one [`ArchiveProduct`] at a destination path, and
//! [`retrieve_with_retries`] wraps it with the retry budget.
//!
//! Implementations
//! -----------------
//! * [`HttpArchive`] – downloads `{base_url}/{file_name}` with a shared [`ureq::Agent`].
//! * [`OfflineArchive`] – refuses every request; for runs on local data only.
use std::{fmt, fs::File, io, time::Duration};

use camino::Utf8Path;
use tracing::{info, warn};
use ureq::Agent;

use crate::{
    band::Band,
    constants::ExposureId,
    photonpipe_errors::{PipelineError, Result},
};

/// A file the archive can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveProduct {
    Raw6 { eclipse: ExposureId, band: Band },
    Aspect { eclipse: ExposureId },
    Scst { eclipse: ExposureId },
}

impl ArchiveProduct {
    /// Canonical file name, used both remotely and in the local cache.
    pub fn file_name(&self) -> String {
        match self {
            ArchiveProduct::Raw6 { eclipse, band } => {
                format!("e{eclipse:05}-{}d-raw6.bin", band.letter())
            }
            ArchiveProduct::Aspect { eclipse } => format!("e{eclipse:05}-asprta.parquet"),
            ArchiveProduct::Scst { eclipse } => format!("e{eclipse:05}-scst.parquet"),
        }
    }
}

impl fmt::Display for ArchiveProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveProduct::Raw6 { eclipse, band } => {
                write!(f, "{band} raw telemetry of exposure {eclipse}")
            }
            ArchiveProduct::Aspect { eclipse } => write!(f, "aspect solution of exposure {eclipse}"),
            ArchiveProduct::Scst { eclipse } => {
                write!(f, "spacecraft state of exposure {eclipse}")
            }
        }
    }
}

/// Source of remote products.
pub trait ArchiveClient: Send + Sync {
    /// Place `product` at `dest`. Must not leave a partial file at `dest` on failure.
    fn fetch(&self, product: &ArchiveProduct, dest: &Utf8Path) -> Result<()>;
}

/// Archive served over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArchive {
    agent: Agent,
    base_url: String,
}

impl HttpArchive {
    /// Create a client for `base_url` with a 60 s global request timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        HttpArchive {
            agent: config.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_of(&self, product: &ArchiveProduct) -> String {
        format!("{}/{}", self.base_url, product.file_name())
    }
}

impl ArchiveClient for HttpArchive {
    fn fetch(&self, product: &ArchiveProduct, dest: &Utf8Path) -> Result<()> {
        let mut response = self.agent.get(&self.url_of(product)).call()?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = dest.with_extension("download");
        let copied = File::create(&partial)
            .and_then(|mut file| io::copy(&mut response.body_mut().as_reader(), &mut file));
        match copied {
            Ok(_) => {
                std::fs::rename(&partial, dest)?;
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                Err(e.into())
            }
        }
    }
}

/// Client that never reaches any archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineArchive;

impl ArchiveClient for OfflineArchive {
    fn fetch(&self, product: &ArchiveProduct, dest: &Utf8Path) -> Result<()> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{product} is not available at {dest} and no archive is configured"),
        )
        .into())
    }
}

/// Fetch `product` into `dest`, trying at most `retries` times.
///
/// Arguments
/// -----------------
/// * `client`: the archive to query.
/// * `product`: what to retrieve.
/// * `dest`: local destination path.
/// * `retries`: attempt budget; `0` still makes one attempt.
///
/// Return
/// ----------
/// * `Ok(())` once a fetch succeeds, or [`PipelineError::RetriesExhausted`] carrying the
///   last failure when the budget is used up.
pub fn retrieve_with_retries(
    client: &dyn ArchiveClient,
    product: &ArchiveProduct,
    dest: &Utf8Path,
    retries: u32,
) -> Result<()> {
    let attempts = retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match client.fetch(product, dest) {
            Ok(()) => {
                info!("Retrieved {product} into {dest}");
                return Ok(());
            }
            Err(e) => {
                warn!("Attempt {attempt}/{attempts} to retrieve {product} failed: {e}");
                last_error = e.to_string();
            }
        }
    }

    Err(PipelineError::RetriesExhausted {
        product: product.to_string(),
        attempts,
        last_error,
    })
}
