//! # Per-photon calibration chain
//!
//! Every photon goes through the same fixed sequence of steps:
//!
//! 1. **Geometry**: stim offset/scale about the detector centre ([`StimCoefficients::apply`]),
//!    the fixed band offset, then the distortion tables (bilinear);
//! 2. **Walk and linearity**: walk tables indexed by pulse height and phase, linearity
//!    tables interpolated along each axis;
//! 3. **Detector to sky**: plate scale to standard coordinates `(xi, eta)`, rotation by the
//!    roll angle, gnomonic deprojection at the pointing interpolated at the photon time;
//! 4. **Flags and mask**, see below;
//! 5. **Response**: flat table (bilinear).
//!
//! Anomalies never drop a photon; they set bits in `flags`:
//!
//! | bit | condition |
//! |---|---|
//! | [`FLAG_STIM`] | raw position inside a stim box |
//! | [`FLAG_EDGE`] | `detrad > 350` |
//! | [`FLAG_LOW_QUALITY`] | `q < 2` |
//! | [`FLAG_HOTSPOT`] | mask table marks the position |
//! | [`FLAG_NO_ASPECT`] | no pointing at `t`; `ra`/`dec` are NaN |
//! | [`FLAG_LOOKUP_RANGE`] | a table lookup fell outside its grid |
//! | [`FLAG_OFF_DETECTOR`] | `detrad >= 400` or non-finite position |
use itertools::izip;
use nalgebra::{Rotation2, Vector2};

use crate::{
    aspect::{AspectSolution, Pointing},
    band::{Band, DetectorOffsets},
    calibration::CalibrationData,
    constants::{
        Degree, Pixel, DEGREES_PER_PIXEL, DETECTOR_CENTER, DETECTOR_EDGE_RADIUS,
        DETECTOR_RADIUS, FLAG_EDGE, FLAG_HOTSPOT, FLAG_LOOKUP_RANGE, FLAG_LOW_QUALITY,
        FLAG_NO_ASPECT, FLAG_OFF_DETECTOR, FLAG_STIM, MIN_PULSE_HEIGHT,
    },
    photon_stream::PhotonSlice,
    stim::{stim_index, StimCoefficients},
    worker::result::ChunkResult,
};

/// Read-only inputs shared by every photon of a chunk.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub band: Band,
    pub calibration: &'a CalibrationData,
    pub aspect: &'a AspectSolution,
    pub stim: StimCoefficients,
    pub offsets: DetectorOffsets,
    pub stim_margin: Pixel,
}

/// One decoded event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPhoton {
    pub t: f64,
    pub x: f32,
    pub y: f32,
    pub xa: u8,
    pub xb: u8,
    pub ya: u8,
    pub yb: u8,
    pub q: u8,
}

/// Derived fields of one calibrated event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedPhoton {
    pub x: f32,
    pub y: f32,
    pub flags: u8,
    pub mask: bool,
    pub detrad: f32,
    pub response: f32,
    pub ra: f64,
    pub dec: f64,
}

/// Stim correction, band offset and distortion.
///
/// Return
/// ----------
/// * The corrected position and whether both distortion lookups were in range.
pub fn geometric_correction(
    x: Pixel,
    y: Pixel,
    stim: &StimCoefficients,
    offsets: &DetectorOffsets,
    calibration: &CalibrationData,
) -> (Pixel, Pixel, bool) {
    let (x, y) = stim.apply(x, y);
    let (x, y) = (x + offsets.x, y + offsets.y);

    let dx = calibration.distortion_x.bilinear(x, y);
    let dy = calibration.distortion_y.bilinear(x, y);
    (
        x - dx.unwrap_or(0.0),
        y - dy.unwrap_or(0.0),
        dx.is_some() && dy.is_some(),
    )
}

/// Walk (pulse height, phase) and linearity corrections.
pub fn walk_and_linearity(
    x: Pixel,
    y: Pixel,
    q: u8,
    xa: u8,
    ya: u8,
    calibration: &CalibrationData,
) -> (Pixel, Pixel, bool) {
    let wx = calibration.walk_x.cell(q as usize, xa as usize);
    let wy = calibration.walk_y.cell(q as usize, ya as usize);
    let x = x - wx.map_or(0.0, f64::from);
    let y = y - wy.map_or(0.0, f64::from);

    let lx = calibration.linearity_x.linear_1d(x);
    let ly = calibration.linearity_y.linear_1d(y);
    (
        x - lx.unwrap_or(0.0),
        y - ly.unwrap_or(0.0),
        wx.is_some() && wy.is_some() && lx.is_some() && ly.is_some(),
    )
}

/// Inverse gnomonic projection of standard coordinates about a tangent point.
///
/// Arguments
/// -----------------
/// * `xi`, `eta`: standard coordinates (degrees).
/// * `ra0`, `dec0`: tangent point (degrees).
///
/// Return
/// ----------
/// * `(ra, dec)` in degrees, `ra` in `[0, 360)`.
pub fn deproject(xi: Degree, eta: Degree, ra0: Degree, dec0: Degree) -> (Degree, Degree) {
    let (xi, eta) = (xi.to_radians(), eta.to_radians());
    let (sin_d0, cos_d0) = dec0.to_radians().sin_cos();

    let denom = cos_d0 - eta * sin_d0;
    let ra = ra0 + xi.atan2(denom).to_degrees();
    let dec = (sin_d0 + eta * cos_d0)
        .atan2((xi * xi + denom * denom).sqrt())
        .to_degrees();
    (ra.rem_euclid(360.0), dec)
}

/// Sky position of detector position `(x, y)` at `pointing`.
pub fn detector_to_sky(x: Pixel, y: Pixel, pointing: &Pointing) -> (Degree, Degree) {
    let standard = Vector2::new(
        (x - DETECTOR_CENTER) * DEGREES_PER_PIXEL,
        (y - DETECTOR_CENTER) * DEGREES_PER_PIXEL,
    );
    let rotated = Rotation2::new(pointing.roll.to_radians()) * standard;
    deproject(rotated.x, rotated.y, pointing.ra, pointing.dec)
}

/// Run the whole chain on one event.
pub fn calibrate_photon(ctx: &TransformContext<'_>, raw: RawPhoton) -> CalibratedPhoton {
    let cal = ctx.calibration;
    let mut flags = 0u8;

    if stim_index(ctx.band, raw.x as f64, raw.y as f64, ctx.stim_margin).is_some() {
        flags |= FLAG_STIM;
    }
    if raw.q < MIN_PULSE_HEIGHT {
        flags |= FLAG_LOW_QUALITY;
    }

    let (x, y, geometry_ok) =
        geometric_correction(raw.x as f64, raw.y as f64, &ctx.stim, &ctx.offsets, cal);
    let (x, y, walk_ok) = walk_and_linearity(x, y, raw.q, raw.xa, raw.ya, cal);
    if !(geometry_ok && walk_ok) {
        flags |= FLAG_LOOKUP_RANGE;
    }

    let detrad = (x - DETECTOR_CENTER).hypot(y - DETECTOR_CENTER);
    if !detrad.is_finite() || detrad >= DETECTOR_RADIUS {
        flags |= FLAG_OFF_DETECTOR;
    }
    if detrad > DETECTOR_EDGE_RADIUS {
        flags |= FLAG_EDGE;
    }

    let mask = match cal.mask.nearest(x, y) {
        Some(v) => {
            let hotspot = v < 0.5;
            if hotspot {
                flags |= FLAG_HOTSPOT;
            }
            hotspot
        }
        None => {
            flags |= FLAG_LOOKUP_RANGE;
            true
        }
    };

    let response = match cal.flat.bilinear(x, y) {
        Some(v) => v as f32,
        None => {
            flags |= FLAG_LOOKUP_RANGE;
            f32::NAN
        }
    };

    let (ra, dec) = match ctx.aspect.interpolate(raw.t) {
        Some(pointing) if x.is_finite() && y.is_finite() => detector_to_sky(x, y, &pointing),
        Some(_) => (f64::NAN, f64::NAN),
        None => {
            flags |= FLAG_NO_ASPECT;
            (f64::NAN, f64::NAN)
        }
    };

    CalibratedPhoton {
        x: x as f32,
        y: y as f32,
        flags,
        mask,
        detrad: detrad as f32,
        response,
        ra,
        dec,
    }
}

/// Calibrate every photon of `photons`, preserving order.
pub fn calibrate_slice(photons: PhotonSlice<'_>, ctx: &TransformContext<'_>) -> ChunkResult {
    let mut out = ChunkResult::with_capacity(photons.len());

    for (&t, &x, &y, &xa, &xb, &ya, &yb, &q) in izip!(
        photons.t, photons.x, photons.y, photons.xa, photons.xb, photons.ya, photons.yb, photons.q
    ) {
        let raw = RawPhoton {
            t,
            x,
            y,
            xa,
            xb,
            ya,
            yb,
            q,
        };
        let p = calibrate_photon(ctx, raw);

        out.t.push(raw.t);
        out.flags.push(p.flags);
        out.x_raw.push(raw.x);
        out.y_raw.push(raw.y);
        out.xa.push(raw.xa);
        out.xb.push(raw.xb);
        out.ya.push(raw.ya);
        out.yb.push(raw.yb);
        out.q.push(raw.q);
        out.x.push(p.x);
        out.y.push(p.y);
        out.mask.push(p.mask);
        out.detrad.push(p.detrad);
        out.response.push(p.response);
        out.ra.push(p.ra);
        out.dec.push(p.dec);
    }
    out
}
