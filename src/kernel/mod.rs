//! Quantize→clamp→round→dequantize kernels
//!
//! The numeric heart of the crate. Every execution variant (CPU here, CUDA
//! under the `cuda` feature) runs the same per-element pipeline:
//!
//! ```text
//! q  = round(x / scale - offset)      // selected rounding mode
//! q  = clamp(q, 0, num_steps)
//! x' = (q + offset) * scale
//! ```
//!
//! All intermediate arithmetic is f64 even for f32 buffers, so the two
//! range remaps do not compound rounding error. Variants must stay
//! branch-identical: the CUDA source in `cuda_src.rs` mirrors this file's
//! scalar pipeline operation for operation, including the stochastic
//! random stream, so outputs are bit-comparable across backends.
//!
//! NaN inputs propagate (the clamp keeps NaN), ±Inf clamps to the extreme
//! codes. This follows IEEE arithmetic deliberately instead of raising an
//! error.

pub mod cpu;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "cuda")]
mod cuda_src;

use serde::{Deserialize, Serialize};

use crate::encoding::Encoding;

/// Rounding applied to the scaled value before clamping.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoundingMode {
    /// Round half away from zero
    Nearest,
    /// Round up with probability equal to the fractional part. The stream
    /// is keyed by (seed, element index), so a fixed seed reproduces the
    /// exact same output on every backend.
    Stochastic { seed: u64 },
}

impl Default for RoundingMode {
    fn default() -> Self {
        RoundingMode::Nearest
    }
}

/// splitmix64 finalizer; the per-element stochastic stream is
/// `splitmix64(seed + (index + 1) * GOLDEN_GAMMA)`. The CUDA kernel carries
/// the identical sequence.
const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Uniform draw in [0, 1) for one element of one call.
#[inline]
pub(crate) fn unit_uniform(seed: u64, index: u64) -> f64 {
    let z = splitmix64(seed.wrapping_add((index + 1).wrapping_mul(GOLDEN_GAMMA)));
    // 53 high bits → [0, 1) double.
    (z >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

/// The shared per-element pipeline. `index` feeds the stochastic stream and
/// is ignored under nearest rounding.
#[inline]
pub(crate) fn quantize_dequantize_value(
    x: f32,
    encoding: &Encoding,
    num_steps: f64,
    rounding: RoundingMode,
    index: u64,
) -> f32 {
    let v = x as f64 / encoding.scale - encoding.offset;
    let q = match rounding {
        RoundingMode::Nearest => v.round(),
        RoundingMode::Stochastic { seed } => (v + unit_uniform(seed, index)).floor(),
    };
    // f64::clamp keeps NaN, maps ±Inf to the range ends.
    let q = q.clamp(0.0, num_steps);
    ((q + encoding.offset) * encoding.scale) as f32
}
