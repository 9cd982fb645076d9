//! # Stim and epoch corrections
//!
//! Each detector carries four electronic stim pulsers that fire at known positions. Their
//! observed positions over a whole exposure measure the detector's offset and scale, and
//! for late exposures a slow drift of `y` with time.
//!
//! Both corrections are **population-level**: they are derived once from the full stream
//! before it is partitioned, so every chunk sees the same coefficients.
//!
//! Sequence ([`correct_stream`])
//! -----------------
//! 1. [`create_stim_solution`] with margin [`STIM_MARGIN`] gives the [`StimCoefficients`]
//!    every worker applies per photon.
//! 2. From [`EPOCH_THRESHOLD`] on, a second classification with the wider
//!    [`EPOCH_STIM_MARGIN`] fits `dy(t) = intercept + slope * (t - t_ref)` to the stim `y`
//!    residuals left once the stim `y_offset` is removed ([`derive_epoch_coefficients`]),
//!    and [`apply_epoch_correction`] subtracts it from every photon.
//!
//! The stim coefficients are derived before the epoch correction and are not refreshed
//! afterwards. The workers still remove `y_offset`, so the epoch model only carries what
//! the constant offset does not explain: a stream with a steady offset and no drift is
//! corrected identically on both sides of the threshold.
use tracing::{debug, info, warn};

use crate::{
    band::Band,
    constants::{
        ExposureId, Pixel, Seconds, DETECTOR_CENTER, EPOCH_STIM_MARGIN, EPOCH_THRESHOLD,
        STIM_MARGIN,
    },
    photon_stream::{PhotonSlice, PhotonStream},
};

/// Classification margins of the two stim passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StimMargins {
    pub stim: Pixel,
    pub epoch: Pixel,
}

impl Default for StimMargins {
    fn default() -> Self {
        StimMargins {
            stim: STIM_MARGIN,
            epoch: EPOCH_STIM_MARGIN,
        }
    }
}

/// Indices of the events attributed to each of the four stims.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StimEvents {
    pub indices: [Vec<usize>; 4],
}

impl StimEvents {
    pub fn total(&self) -> usize {
        self.indices.iter().map(Vec::len).sum()
    }
}

/// Index of the stim whose box of half-width `margin` contains `(x, y)`, if any.
#[inline]
pub fn stim_index(band: Band, x: f64, y: f64, margin: Pixel) -> Option<usize> {
    band.stim_positions()
        .iter()
        .position(|&(sx, sy)| (x - sx).abs() <= margin && (y - sy).abs() <= margin)
}

/// Attribute every event to the first stim whose square box contains it.
pub fn classify_stims(stream: PhotonSlice<'_>, band: Band, margin: Pixel) -> StimEvents {
    let mut events = StimEvents::default();
    for (i, (&x, &y)) in stream.x.iter().zip(stream.y).enumerate() {
        if let Some(s) = stim_index(band, x as f64, y as f64, margin) {
            events.indices[s].push(i);
        }
    }
    events
}

/// Offset and per-axis scale measured on the stims.
///
/// A corrected coordinate is `c + (v - c - offset) * scale` with `c` the detector centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StimCoefficients {
    pub x_offset: Pixel,
    pub y_offset: Pixel,
    pub x_scale: f64,
    pub y_scale: f64,
}

impl Default for StimCoefficients {
    fn default() -> Self {
        StimCoefficients {
            x_offset: 0.0,
            y_offset: 0.0,
            x_scale: 1.0,
            y_scale: 1.0,
        }
    }
}

impl StimCoefficients {
    #[inline]
    pub fn apply(&self, x: Pixel, y: Pixel) -> (Pixel, Pixel) {
        (
            DETECTOR_CENTER + (x - DETECTOR_CENTER - self.x_offset) * self.x_scale,
            DETECTOR_CENTER + (y - DETECTOR_CENTER - self.y_offset) * self.y_scale,
        )
    }
}

fn mean_position(stream: PhotonSlice<'_>, indices: &[usize]) -> Option<(f64, f64)> {
    if indices.is_empty() {
        return None;
    }
    let n = indices.len() as f64;
    let (sx, sy) = indices.iter().fold((0.0, 0.0), |(sx, sy), &i| {
        (sx + stream.x[i] as f64, sy + stream.y[i] as f64)
    });
    Some((sx / n, sy / n))
}

/// Mean of `expected / observed` separations over the pairs where both stims were seen.
fn pair_scale(
    observed: &[Option<(f64, f64)>; 4],
    expected: &[(f64, f64); 4],
    pairs: [(usize, usize); 2],
    axis: fn((f64, f64)) -> f64,
) -> f64 {
    let ratios: Vec<f64> = pairs
        .iter()
        .filter_map(|&(a, b)| {
            let (oa, ob) = (observed[a]?, observed[b]?);
            let sep = axis(ob) - axis(oa);
            (sep.abs() > f64::EPSILON).then(|| (axis(expected[b]) - axis(expected[a])) / sep)
        })
        .collect();
    if ratios.is_empty() {
        1.0
    } else {
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }
}

/// Derive offsets and scales from classified stim events.
///
/// Arguments
/// -----------------
/// * `stream`: the full photon stream.
/// * `band`: detector band, selecting the expected stim positions.
/// * `stims`: output of [`classify_stims`] on the same stream.
///
/// Return
/// ----------
/// * The coefficients. Without any stim the offsets are zero; without a complete
///   horizontal (vertical) pair the x (y) scale is one.
pub fn derive_stim_coefficients(
    stream: PhotonSlice<'_>,
    band: Band,
    stims: &StimEvents,
) -> StimCoefficients {
    let expected = band.stim_positions();
    let observed: [Option<(f64, f64)>; 4] =
        std::array::from_fn(|s| mean_position(stream, &stims.indices[s]));

    let present: Vec<(f64, f64)> = observed
        .iter()
        .zip(expected)
        .filter_map(|(o, e)| o.map(|(ox, oy)| (ox - e.0, oy - e.1)))
        .collect();
    if present.is_empty() {
        return StimCoefficients::default();
    }
    let n = present.len() as f64;

    StimCoefficients {
        x_offset: present.iter().map(|d| d.0).sum::<f64>() / n,
        y_offset: present.iter().map(|d| d.1).sum::<f64>() / n,
        x_scale: pair_scale(&observed, &expected, [(0, 1), (2, 3)], |p| p.0),
        y_scale: pair_scale(&observed, &expected, [(0, 2), (1, 3)], |p| p.1),
    }
}

/// Classify then derive, on the full stream.
pub fn create_stim_solution(
    stream: PhotonSlice<'_>,
    band: Band,
    eclipse: ExposureId,
    margin: Pixel,
) -> StimCoefficients {
    let stims = classify_stims(stream, band, margin);
    let coefficients = derive_stim_coefficients(stream, band, &stims);
    if stims.total() == 0 {
        warn!("No stim events found in exposure {eclipse}; stim correction disabled");
    } else {
        debug!(
            "Exposure {eclipse}: {} stim events, {:?}",
            stims.total(),
            coefficients
        );
    }
    coefficients
}

/// Linear time model of the stim `y` drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochCoefficients {
    pub t_ref: Seconds,
    pub intercept: Pixel,
    pub slope: f64,
}

impl EpochCoefficients {
    #[inline]
    pub fn dy(&self, t: Seconds) -> Pixel {
        self.intercept + self.slope * (t - self.t_ref)
    }
}

/// Least-squares fit of the stim `y` residuals against time.
///
/// `t_ref` is the mean stim time, so `intercept` is the mean residual.
///
/// Arguments
/// -----------------
/// * `stream`, `band`, `stims`: the stream and its wide-margin stim classification.
/// * `baseline`: constant `y` offset already corrected downstream, removed from every
///   residual before the fit.
///
/// Return
/// ----------
/// * `None` when no stim event was classified.
pub fn derive_epoch_coefficients(
    stream: PhotonSlice<'_>,
    band: Band,
    stims: &StimEvents,
    baseline: Pixel,
) -> Option<EpochCoefficients> {
    let expected = band.stim_positions();
    let samples: Vec<(f64, f64)> = stims
        .indices
        .iter()
        .zip(expected)
        .flat_map(|(indices, (_, sy))| {
            indices
                .iter()
                .map(move |&i| (stream.t[i], stream.y[i] as f64 - sy - baseline))
        })
        .collect();
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as f64;
    let t_ref = samples.iter().map(|s| s.0).sum::<f64>() / n;
    let mean_r = samples.iter().map(|s| s.1).sum::<f64>() / n;
    let (sxy, sxx) = samples.iter().fold((0.0, 0.0), |(sxy, sxx), &(t, r)| {
        let dt = t - t_ref;
        (sxy + dt * (r - mean_r), sxx + dt * dt)
    });
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };

    Some(EpochCoefficients {
        t_ref,
        intercept: mean_r,
        slope,
    })
}

/// Subtract `dy(t)` from the `y` of every photon.
pub fn apply_epoch_correction(stream: &mut PhotonStream, coefficients: &EpochCoefficients) {
    for (y, &t) in stream.y.iter_mut().zip(&stream.t) {
        *y = (*y as f64 - coefficients.dy(t)) as f32;
    }
}

/// Run the population-level corrections on the full stream.
///
/// Arguments
/// -----------------
/// * `stream`: the decoded stream; consumed and returned corrected.
/// * `band`, `eclipse`: the exposure.
/// * `margins`: classification margins of both passes.
///
/// Return
/// ----------
/// * The corrected stream, the stim coefficients for the workers, and the epoch
///   coefficients when the epoch correction ran.
pub fn correct_stream(
    mut stream: PhotonStream,
    band: Band,
    eclipse: ExposureId,
    margins: StimMargins,
) -> (PhotonStream, StimCoefficients, Option<EpochCoefficients>) {
    let stim = create_stim_solution(stream.as_slice(), band, eclipse, margins.stim);

    if eclipse < EPOCH_THRESHOLD {
        return (stream, stim, None);
    }

    let wide = classify_stims(stream.as_slice(), band, margins.epoch);
    let epoch = derive_epoch_coefficients(stream.as_slice(), band, &wide, stim.y_offset);
    match &epoch {
        Some(coefficients) => {
            info!(
                "Exposure {eclipse}: epoch correction dy = {:.4} + {:.3e} * (t - {:.3})",
                coefficients.intercept, coefficients.slope, coefficients.t_ref
            );
            apply_epoch_correction(&mut stream, coefficients);
        }
        None => warn!("No stim events for the epoch correction of exposure {eclipse}"),
    }
    (stream, stim, epoch)
}
