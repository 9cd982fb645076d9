//! # Mission constants and type definitions
//!
//! This module centralizes the **fixed detector geometry**, **calibration thresholds** and
//! **flag bits** used throughout `photonpipe`. Calibration constants are fixed per mission;
//! nothing here is meant to be overridden at run time.
//!
//! ## Overview
//!
//! - Detector geometry (pixel grid, centre, usable radius, plate scale)
//! - Stim classification margins and the epoch threshold for the secondary correction
//! - Per-photon flag bits written to the `flags` output column
//! - Core type aliases

// -------------------------------------------------------------------------------------------------
// Detector geometry
// -------------------------------------------------------------------------------------------------

/// Side of the square detector pixel grid
pub const DETECTOR_SIZE: f64 = 800.0;

/// Detector centre, in pixels, on both axes
pub const DETECTOR_CENTER: f64 = DETECTOR_SIZE / 2.0;

/// Radius of the photosensitive area in pixels
pub const DETECTOR_RADIUS: f64 = 400.0;

/// Photons farther than this from the centre are flagged as detector-edge events
pub const DETECTOR_EDGE_RADIUS: f64 = 350.0;

/// Plate scale, degrees per detector pixel (1.5 arcsec)
pub const DEGREES_PER_PIXEL: f64 = 0.000416666666666667;

/// Pulse heights below this value are flagged as low quality
pub const MIN_PULSE_HEIGHT: u8 = 2;

/// Largest gap (seconds) between aspect samples that may be interpolated across
pub const ASPECT_MAX_GAP: f64 = 1.5;

// -------------------------------------------------------------------------------------------------
// Stim and epoch corrections
// -------------------------------------------------------------------------------------------------

/// Box half-width (pixels) used to classify stim events for the stim coefficients
pub const STIM_MARGIN: f64 = 20.0;

/// Wider box half-width used by the second, epoch-correction stim pass
pub const EPOCH_STIM_MARGIN: f64 = 90.001;

/// First exposure id processed with the late-epoch correction and calibration variant
pub const EPOCH_THRESHOLD: ExposureId = 37461;

/// Nominal FUV detector temperature (°C) at which the FUV offsets equal their base value
pub const FUV_NOMINAL_TEMPERATURE: f64 = 29.0;

/// Exclusive temperature window (°C) inside which the FUV offset model is valid
pub const FUV_TEMPERATURE_RANGE: (f64, f64) = (20.0, 40.0);

/// FUV x offset model: `c0 - c1 * (T - 29)`, pixels
pub const FUV_OFFSET_X: (f64, f64) = (0.65, 0.0);

/// FUV y offset model: `c0 - c1 * (T - 29)`, pixels
pub const FUV_OFFSET_Y: (f64, f64) = (-0.13, 0.3597);

// -------------------------------------------------------------------------------------------------
// Flag bits
// -------------------------------------------------------------------------------------------------

/// Event lies inside a stim classification box
pub const FLAG_STIM: u8 = 1;
/// Event lies beyond [`DETECTOR_EDGE_RADIUS`]
pub const FLAG_EDGE: u8 = 1 << 1;
/// Pulse height below [`MIN_PULSE_HEIGHT`]
pub const FLAG_LOW_QUALITY: u8 = 1 << 2;
/// Event falls on a masked hotspot
pub const FLAG_HOTSPOT: u8 = 1 << 3;
/// No aspect solution covers the event time
pub const FLAG_NO_ASPECT: u8 = 1 << 4;
/// A calibration lookup was out of range for this event
pub const FLAG_LOOKUP_RANGE: u8 = 1 << 5;
/// Event lies outside the photosensitive area or has non-finite coordinates
pub const FLAG_OFF_DETECTOR: u8 = 1 << 6;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Identifier of one observational visit ("eclipse")
pub type ExposureId = u32;
/// Angle in degrees
pub type Degree = f64;
/// Detector coordinate in pixels
pub type Pixel = f64;
/// Spacecraft time in seconds
pub type Seconds = f64;
