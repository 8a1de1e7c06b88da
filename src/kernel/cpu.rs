//! CPU execution variant of the quantize-dequantize kernel

use ndarray::{ArrayViewD, ArrayViewMutD, Axis, IxDyn, Zip};

use super::{quantize_dequantize_value, RoundingMode};
use crate::encoding::Encoding;
use crate::error::{Error, Result};

/// Quantize-then-dequantize `input` into the caller-provided `output`.
///
/// Pure transform: no allocation, no state. Buffers must have equal length.
pub fn quantize_dequantize(
    input: &[f32],
    encoding: &Encoding,
    rounding: RoundingMode,
    output: &mut [f32],
) -> Result<()> {
    if input.len() != output.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![input.len()],
            got: vec![output.len()],
        });
    }
    encoding.validate()?;

    let num_steps = encoding.num_steps();
    for (i, (&x, out)) in input.iter().zip(output.iter_mut()).enumerate() {
        *out = quantize_dequantize_value(x, encoding, num_steps, rounding, i as u64);
    }
    Ok(())
}

/// Allocating convenience wrapper around [`quantize_dequantize`].
pub fn fake_quantize(input: &[f32], encoding: &Encoding, rounding: RoundingMode) -> Result<Vec<f32>> {
    let mut output = vec![0.0; input.len()];
    quantize_dequantize(input, encoding, rounding, &mut output)?;
    Ok(output)
}

/// Per-channel variant: one encoding per lane along `axis` of a row-major
/// tensor of the given shape.
pub fn quantize_dequantize_per_channel(
    input: &[f32],
    shape: &[usize],
    axis: usize,
    encodings: &[Encoding],
    rounding: RoundingMode,
    output: &mut [f32],
) -> Result<()> {
    if input.len() != output.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![input.len()],
            got: vec![output.len()],
        });
    }
    if axis >= shape.len() || shape[axis] != encodings.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![encodings.len()],
            got: shape.to_vec(),
        });
    }

    let view = ArrayViewD::from_shape(IxDyn(shape), input).map_err(|_| Error::ShapeMismatch {
        expected: shape.to_vec(),
        got: vec![input.len()],
    })?;
    let mut out_view =
        ArrayViewMutD::from_shape(IxDyn(shape), output).map_err(|_| Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![],
        })?;

    for ((lane_in, mut lane_out), encoding) in view
        .axis_iter(Axis(axis))
        .zip(out_view.axis_iter_mut(Axis(axis)))
        .zip(encodings.iter())
    {
        encoding.validate()?;
        let num_steps = encoding.num_steps();
        // Element index restarts per lane; each lane is its own stochastic
        // stream offset by the lane's encoding, matching repeated
        // per-tensor calls over the same data.
        let mut index = 0u64;
        Zip::from(&mut lane_out).and(&lane_in).for_each(|out, &x| {
            *out = quantize_dequantize_value(x, encoding, num_steps, rounding, index);
            index += 1;
        });
    }
    Ok(())
}
