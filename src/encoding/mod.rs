//! Quantization encodings: the range description for a fixed-point grid
//!
//! An [`Encoding`] fully describes how real values map onto an integer grid:
//! - `min`/`max`: the representable real range
//! - `scale`: the real width of one quantization step
//! - `offset`: the (integer-valued) grid index of `min`, i.e. `min / scale`
//! - `bitwidth`: number of bits of the target representation (1..=32)
//! - `symmetric`: whether the grid is forced to be zero-centered
//!
//! Encodings are immutable once computed. Recalibration produces a new
//! `Encoding` value rather than mutating one that concurrent readers may
//! hold.

mod compute;
mod stats;

pub use compute::{compute_encoding, encoding_from_stats, MIN_SCALE};
pub use stats::{CalibrationScheme, PerChannelCollector, StatsCollector, TensorStats};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Quantization range for one tensor (or one channel of a tensor).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    /// Smallest representable real value
    pub min: f64,
    /// Largest representable real value
    pub max: f64,
    /// Real width of one quantization step
    pub scale: f64,
    /// Grid index of `min` (always integer-valued, stored as f64 for the
    /// kernel's arithmetic; `min == offset * scale`)
    pub offset: f64,
    /// Target bit-width, 1..=32
    pub bitwidth: u8,
    /// Zero-centered grid
    pub symmetric: bool,
}

impl Encoding {
    /// Number of representable steps above code zero.
    ///
    /// This is `2^bitwidth - 1` for asymmetric and unsigned-symmetric
    /// encodings, and one less for strict-symmetric encodings (the most
    /// negative code is excluded there).
    pub fn num_steps(&self) -> f64 {
        (self.max / self.scale).round() - self.offset
    }

    /// Validate the invariants of a finalized encoding.
    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || !self.offset.is_finite() {
            return Err(Error::InvalidRange(format!(
                "non-finite encoding fields: min {}, max {}, offset {}",
                self.min, self.max, self.offset
            )));
        }
        if !(1..=32).contains(&self.bitwidth) {
            return Err(Error::InvalidRange(format!(
                "bitwidth {} outside [1, 32]",
                self.bitwidth
            )));
        }
        if !(self.max >= self.min) {
            return Err(Error::InvalidRange(format!(
                "max {} < min {}",
                self.max, self.min
            )));
        }
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            return Err(Error::InvalidRange(format!(
                "scale {} must be finite and positive",
                self.scale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_bitwidth() {
        let enc = Encoding {
            min: -1.0,
            max: 1.0,
            scale: 0.01,
            offset: -100.0,
            bitwidth: 0,
            symmetric: false,
        };
        assert!(matches!(enc.validate(), Err(Error::InvalidRange(_))));

        let enc = Encoding { bitwidth: 33, ..enc };
        assert!(matches!(enc.validate(), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let enc = Encoding {
            min: 1.0,
            max: -1.0,
            scale: 0.01,
            offset: 0.0,
            bitwidth: 8,
            symmetric: false,
        };
        assert!(enc.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_scale() {
        let enc = Encoding {
            min: 0.0,
            max: 0.0,
            scale: 0.0,
            offset: 0.0,
            bitwidth: 8,
            symmetric: false,
        };
        assert!(enc.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_fields() {
        let enc = Encoding {
            min: -1.0,
            max: 1.0,
            scale: 0.01,
            offset: f64::NAN,
            bitwidth: 8,
            symmetric: false,
        };
        assert!(matches!(enc.validate(), Err(Error::InvalidRange(_))));

        let enc = Encoding {
            offset: -100.0,
            max: f64::INFINITY,
            ..enc
        };
        assert!(enc.validate().is_err());
    }

    #[test]
    fn test_num_steps_asymmetric() {
        let enc = compute_encoding(-0.46, 0.72, 8, false, false, false).unwrap();
        assert_eq!(enc.num_steps(), 255.0);
    }

    #[test]
    fn test_encoding_serde_round_trip() {
        let enc = compute_encoding(-1.0, 1.0, 8, true, false, false).unwrap();
        let json = serde_json::to_string(&enc).unwrap();
        let back: Encoding = serde_json::from_str(&json).unwrap();
        assert_eq!(enc, back);
    }
}
