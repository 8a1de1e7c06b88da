//! Encoding computation from observed ranges
//!
//! Pure functions mapping an observed min/max (plus bit-width and symmetry
//! flags) to a finalized [`Encoding`]. Three policies apply:
//!
//! - **Zero inclusion**: the range is widened to contain 0.0 before any
//!   scaling, so real zero always lands exactly on a grid point. Zero-padded
//!   tensors would otherwise accumulate bias through the simulated grid.
//! - **Degenerate-range guard**: a collapsed range (width below the fixed
//!   epsilon `MIN_SCALE`, e.g. all-equal observations) is expanded
//!   symmetrically around its midpoint to `MIN_SCALE * num_steps`, keeping
//!   `scale > 0`. Ordinary ranges are never touched, at any bit-width.
//! - **Zero-point correction** (asymmetric): the offset is rounded to an
//!   integer grid index and min/max are re-derived from it, so the encoded
//!   zero maps to a representable integer.

use tracing::debug;

use super::{Encoding, TensorStats};
use crate::error::{Error, Result};

/// Range-collapse epsilon. Observed ranges narrower than this count as
/// degenerate and are expanded until the quantization step equals
/// `MIN_SCALE`; wider ranges keep their exact observed width.
pub const MIN_SCALE: f64 = 1e-8;

/// Compute an encoding from an observed real range.
///
/// `symmetric` forces a zero-centered `[-absmax, absmax]` range.
/// `strict_symmetric` additionally excludes the most negative code so the
/// positive and negative ranges hold the same number of steps.
/// `unsigned_symmetric` maps an all-non-negative observed range onto the
/// full unsigned grid `0..=2^bitwidth - 1` instead of a signed one.
///
/// Fails with [`Error::InvalidRange`] when `bitwidth` is outside `[1, 32]`
/// or the observed range is inverted.
pub fn compute_encoding(
    observed_min: f64,
    observed_max: f64,
    bitwidth: u8,
    symmetric: bool,
    strict_symmetric: bool,
    unsigned_symmetric: bool,
) -> Result<Encoding> {
    if !(1..=32).contains(&bitwidth) {
        return Err(Error::InvalidRange(format!(
            "bitwidth {bitwidth} outside [1, 32]"
        )));
    }
    if observed_min > observed_max {
        return Err(Error::InvalidRange(format!(
            "observed min {observed_min} > observed max {observed_max}"
        )));
    }

    let full_steps = ((1u64 << bitwidth) - 1) as f64;

    let encoding = if symmetric {
        if unsigned_symmetric && observed_min >= 0.0 {
            unsigned_symmetric_encoding(observed_max, bitwidth, full_steps)
        } else {
            signed_symmetric_encoding(
                observed_min,
                observed_max,
                bitwidth,
                full_steps,
                strict_symmetric,
            )
        }
    } else {
        asymmetric_encoding(observed_min, observed_max, bitwidth, full_steps)
    };

    debug!(
        min = encoding.min,
        max = encoding.max,
        scale = encoding.scale,
        offset = encoding.offset,
        bitwidth,
        symmetric,
        "computed encoding"
    );
    Ok(encoding)
}

/// Compute an encoding from accumulated statistics.
///
/// Fails with [`Error::InvalidRange`] when the statistics hold no samples;
/// a quantizer with an explicitly supplied range bypasses this path.
pub fn encoding_from_stats(
    stats: &TensorStats,
    bitwidth: u8,
    symmetric: bool,
    strict_symmetric: bool,
    unsigned_symmetric: bool,
) -> Result<Encoding> {
    if stats.is_empty() {
        return Err(Error::InvalidRange(
            "statistics contain no samples".to_string(),
        ));
    }
    compute_encoding(
        stats.min,
        stats.max,
        bitwidth,
        symmetric,
        strict_symmetric,
        unsigned_symmetric,
    )
}

fn asymmetric_encoding(observed_min: f64, observed_max: f64, bitwidth: u8, steps: f64) -> Encoding {
    // Zero inclusion, then the degenerate-range guard. The collapse test
    // uses the fixed epsilon; only the expansion width scales with the
    // grid, so the resulting step comes out at MIN_SCALE.
    let mut min = observed_min.min(0.0);
    let mut max = observed_max.max(0.0);
    if max - min < MIN_SCALE {
        let mid = (min + max) / 2.0;
        let half = MIN_SCALE * steps / 2.0;
        min = mid - half;
        max = mid + half;
    }

    let scale = (max - min) / steps;
    // Zero-point correction: snap min/max to the integer grid.
    let offset = (min / scale).round();
    let min = offset * scale;
    let max = min + steps * scale;

    Encoding {
        min,
        max,
        scale,
        offset,
        bitwidth,
        symmetric: false,
    }
}

fn signed_symmetric_encoding(
    observed_min: f64,
    observed_max: f64,
    bitwidth: u8,
    full_steps: f64,
    strict: bool,
) -> Encoding {
    let steps = if strict {
        (full_steps - 1.0).max(1.0)
    } else {
        full_steps
    };
    // Positive and negative code counts around zero. Non-strict grids keep
    // the extra most-negative code, so negative_codes exceeds positive_codes
    // by one there.
    let positive_codes = (steps / 2.0).floor().max(1.0);
    let negative_codes = (steps - positive_codes).max(0.0);

    let mut absmax = observed_min.abs().max(observed_max.abs());
    if absmax < MIN_SCALE {
        absmax = MIN_SCALE * positive_codes;
    }
    let scale = absmax / positive_codes;

    Encoding {
        min: -absmax,
        max: absmax,
        scale,
        offset: -negative_codes,
        bitwidth,
        symmetric: true,
    }
}

fn unsigned_symmetric_encoding(observed_max: f64, bitwidth: u8, steps: f64) -> Encoding {
    let max = if observed_max < MIN_SCALE {
        MIN_SCALE * steps
    } else {
        observed_max
    };
    Encoding {
        min: 0.0,
        max,
        scale: max / steps,
        offset: 0.0,
        bitwidth,
        symmetric: true,
    }
}
