#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use cuantizar::kernel::cpu;
use cuantizar::{compute_encoding, RoundingMode};

/// Fuzz target for the quantize-dequantize kernel
///
/// The kernel sits behind a no-unwind runtime boundary, so it must never
/// panic: any finite or non-finite input buffer and any observed range must
/// either produce an output or a recoverable error.

#[derive(Arbitrary, Debug)]
struct KernelFuzzInput {
    values: Vec<f32>,
    observed_min: f32,
    observed_max: f32,
    bitwidth: u8,
    symmetric: bool,
    strict: bool,
    unsigned: bool,
    stochastic_seed: Option<u64>,
}

fuzz_target!(|input: KernelFuzzInput| {
    let (lo, hi) = (
        input.observed_min.min(input.observed_max) as f64,
        input.observed_min.max(input.observed_max) as f64,
    );
    // Bounded so the dequantized grid stays inside f32 range; the grid can
    // extend up to one snapped range width beyond the observation.
    if !lo.is_finite() || !hi.is_finite() || lo.abs() > 1e30 || hi.abs() > 1e30 {
        return;
    }

    let Ok(encoding) = compute_encoding(
        lo,
        hi,
        input.bitwidth,
        input.symmetric,
        input.strict,
        input.unsigned,
    ) else {
        // Out-of-range bitwidths are rejected, never panicked on.
        return;
    };

    let rounding = match input.stochastic_seed {
        Some(seed) => RoundingMode::Stochastic { seed },
        None => RoundingMode::Nearest,
    };

    let mut output = vec![0.0f32; input.values.len()];
    cpu::quantize_dequantize(&input.values, &encoding, rounding, &mut output).unwrap();

    // IEEE semantics: NaN stays NaN, everything else lands on the grid
    // inside the representable range.
    for (&x, &y) in input.values.iter().zip(output.iter()) {
        if x.is_nan() {
            assert!(y.is_nan());
        } else {
            assert!(y.is_finite());
        }
    }
});
