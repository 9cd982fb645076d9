//! # Detector bands
//!
//! The instrument carries two detectors, identified by their band: far ultraviolet
//! ([`Band::Fuv`]) and near ultraviolet ([`Band::Nuv`]). The band selects the stim
//! positions, the calibration table directory and the fixed geometric offsets.
//!
//! ## See also
//! ------------
//! * [`DetectorOffsets::for_band`] – Fixed per-band offsets applied by every worker.
//! * [`crate::stim`] – Stim classification against [`Band::stim_positions`].
use std::{fmt, str::FromStr};

use tracing::warn;

use crate::{
    constants::{
        Pixel, FUV_NOMINAL_TEMPERATURE, FUV_OFFSET_X, FUV_OFFSET_Y, FUV_TEMPERATURE_RANGE,
    },
    photonpipe_errors::PipelineError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    Fuv,
    Nuv,
}

impl Band {
    /// Code stored in the telemetry header.
    pub fn code(self) -> u8 {
        match self {
            Band::Nuv => 1,
            Band::Fuv => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Band> {
        match code {
            1 => Some(Band::Nuv),
            2 => Some(Band::Fuv),
            _ => None,
        }
    }

    /// Single-letter tag used in archive file names (`n` / `f`).
    pub fn letter(self) -> char {
        match self {
            Band::Nuv => 'n',
            Band::Fuv => 'f',
        }
    }

    /// Lower-case name, used as the calibration sub-directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            Band::Nuv => "nuv",
            Band::Fuv => "fuv",
        }
    }

    /// Expected detector positions of the four stim pulsers.
    ///
    /// Order is fixed: lower-left, lower-right, upper-left, upper-right. Stims 0/1 and
    /// 2/3 are horizontal pairs, 0/2 and 1/3 vertical pairs.
    pub fn stim_positions(self) -> [(Pixel, Pixel); 4] {
        match self {
            Band::Nuv => [(60.0, 60.0), (740.0, 60.0), (60.0, 740.0), (740.0, 740.0)],
            Band::Fuv => [(70.0, 55.0), (730.0, 55.0), (70.0, 745.0), (730.0, 745.0)],
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Fuv => write!(f, "FUV"),
            Band::Nuv => write!(f, "NUV"),
        }
    }
}

impl FromStr for Band {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FUV" => Ok(Band::Fuv),
            "NUV" => Ok(Band::Nuv),
            _ => Err(PipelineError::UnknownBand(s.to_string())),
        }
    }
}

/// Fixed geometric offsets (pixels) added to the detector coordinates of one band.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectorOffsets {
    pub x: Pixel,
    pub y: Pixel,
}

impl DetectorOffsets {
    /// Offsets for `band`.
    ///
    /// NUV has none. FUV follows the linear temperature model
    /// `c0 - c1 * (T - 29)` per axis, valid strictly inside
    /// [`FUV_TEMPERATURE_RANGE`]. Outside that window the offsets are zero.
    ///
    /// Arguments
    /// -----------------
    /// * `band`: the detector band.
    /// * `fuv_temperature`: FUV detector temperature (°C); `None` uses the nominal temperature.
    pub fn for_band(band: Band, fuv_temperature: Option<f64>) -> Self {
        match band {
            Band::Nuv => DetectorOffsets::default(),
            Band::Fuv => {
                let t = fuv_temperature.unwrap_or(FUV_NOMINAL_TEMPERATURE);
                let (lo, hi) = FUV_TEMPERATURE_RANGE;
                if !(t > lo && t < hi) {
                    warn!("FUV detector temperature {t} °C outside ({lo}, {hi}); using zero offsets");
                    return DetectorOffsets::default();
                }
                let dt = t - FUV_NOMINAL_TEMPERATURE;
                DetectorOffsets {
                    x: FUV_OFFSET_X.0 - FUV_OFFSET_X.1 * dt,
                    y: FUV_OFFSET_Y.0 - FUV_OFFSET_Y.1 * dt,
                }
            }
        }
    }
}

#[cfg(test)]
mod band_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_band_parsing() {
        assert_eq!("nuv".parse::<Band>().unwrap(), Band::Nuv);
        assert_eq!(" FUV ".parse::<Band>().unwrap(), Band::Fuv);
        assert_eq!(
            "XUV".parse::<Band>(),
            Err(PipelineError::UnknownBand("XUV".into()))
        );
    }

    #[test]
    fn test_band_code_round_trip() {
        for band in [Band::Fuv, Band::Nuv] {
            assert_eq!(Band::from_code(band.code()), Some(band));
        }
        assert_eq!(Band::from_code(0), None);
    }

    #[test]
    fn test_offsets() {
        assert_eq!(
            DetectorOffsets::for_band(Band::Nuv, Some(35.0)),
            DetectorOffsets::default()
        );

        let nominal = DetectorOffsets::for_band(Band::Fuv, None);
        assert_relative_eq!(nominal.x, 0.65);
        assert_relative_eq!(nominal.y, -0.13);

        let warm = DetectorOffsets::for_band(Band::Fuv, Some(31.0));
        assert_relative_eq!(warm.y, -0.13 - 0.3597 * 2.0, epsilon = 1e-12);

        let out_of_range = DetectorOffsets::for_band(Band::Fuv, Some(45.0));
        assert_eq!(out_of_range, DetectorOffsets::default());
    }
}
