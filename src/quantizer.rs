//! Tensor quantizer façade: one encoding + one mode per logical tensor
//!
//! A [`TensorQuantizer`] is created once per logical tensor position in a
//! model (one weight, one activation) and lives until the owning session is
//! torn down. The calibration layer drives its [`QuantizeMode`] state
//! machine; inference passes call [`TensorQuantizer::apply_into`] from
//! whatever threads the host runtime uses.
//!
//! Concurrency contract: calls on *different* quantizers are always safe;
//! concurrent calls on the *same* quantizer are safe in the reader modes
//! (`PassThrough`, `QuantizeDequantize` with a computed encoding). The
//! stat-mutating modes (`UpdateStats`, `OneShotQuantizeDequantize`) take
//! the interior write lock and expect the calibration pass to be
//! single-threaded per tensor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoding::{
    compute_encoding, CalibrationScheme, Encoding, PerChannelCollector, StatsCollector,
};
use crate::error::{Error, Result};
use crate::kernel::{cpu, RoundingMode};

/// Mode state machine. Transitions are driven externally via
/// [`TensorQuantizer::set_mode`]; the quantizer never self-transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuantizeMode {
    /// Identity transform; an unconfigured quantizer is always safe to call
    #[default]
    PassThrough,
    /// Observe range statistics, return the input unchanged
    UpdateStats,
    /// Apply the previously computed encoding
    QuantizeDequantize,
    /// Observe, compute the encoding (unless frozen), then apply it
    OneShotQuantizeDequantize,
}

/// Static configuration of one quantizer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    pub bitwidth: u8,
    pub rounding: RoundingMode,
    pub symmetric: bool,
    /// Exclude the most negative code so positive and negative ranges hold
    /// the same number of steps
    pub strict_symmetric: bool,
    /// Map all-non-negative observed ranges onto the unsigned grid
    pub unsigned_symmetric: bool,
    pub scheme: CalibrationScheme,
    /// Per-channel quantization along this axis; `None` is per-tensor
    pub per_channel_axis: Option<usize>,
}

impl QuantizerConfig {
    pub fn asymmetric(bitwidth: u8) -> Self {
        QuantizerConfig {
            bitwidth,
            rounding: RoundingMode::Nearest,
            symmetric: false,
            strict_symmetric: false,
            unsigned_symmetric: false,
            scheme: CalibrationScheme::MinMax,
            per_channel_axis: None,
        }
    }

    pub fn symmetric(bitwidth: u8) -> Self {
        QuantizerConfig {
            symmetric: true,
            ..Self::asymmetric(bitwidth)
        }
    }
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self::asymmetric(8)
    }
}

enum Collector {
    PerTensor(StatsCollector),
    PerChannel(PerChannelCollector),
}

struct State {
    mode: QuantizeMode,
    frozen: bool,
    collector: Collector,
    /// One entry per-tensor, or one per channel lane. `None` until computed
    /// or supplied.
    encodings: Option<Vec<Encoding>>,
}

/// Stateful quantization-simulation façade for one logical tensor.
pub struct TensorQuantizer {
    config: QuantizerConfig,
    enabled: AtomicBool,
    state: RwLock<State>,
}

impl TensorQuantizer {
    pub fn new(config: QuantizerConfig) -> Self {
        let collector = match config.per_channel_axis {
            Some(axis) => Collector::PerChannel(PerChannelCollector::new(axis, config.scheme)),
            None => Collector::PerTensor(StatsCollector::new(config.scheme)),
        };
        TensorQuantizer {
            config,
            enabled: AtomicBool::new(true),
            state: RwLock::new(State {
                mode: QuantizeMode::PassThrough,
                frozen: false,
                collector,
                encodings: None,
            }),
        }
    }

    pub fn config(&self) -> &QuantizerConfig {
        &self.config
    }

    pub fn mode(&self) -> QuantizeMode {
        self.state.read().unwrap_or_else(|e| e.into_inner()).mode
    }

    pub fn set_mode(&self, mode: QuantizeMode) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).mode = mode;
    }

    /// Disabled quantizers behave as `PassThrough` regardless of mode, so
    /// per-tensor quantization can be switched off without touching mode
    /// bookkeeping.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Frozen quantizers skip recomputation in one-shot mode and keep the
    /// last computed encoding, so export and inference passes see a stable
    /// calibrated range.
    pub fn freeze_encoding(&self, frozen: bool) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).frozen = frozen;
    }

    pub fn is_encoding_frozen(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).frozen
    }

    /// The current per-tensor encoding, if any. Per-channel quantizers
    /// report their first lane; use [`TensorQuantizer::encodings`] for all.
    pub fn encoding(&self) -> Option<Encoding> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .encodings
            .as_ref()
            .and_then(|e| e.first().copied())
    }

    pub fn encodings(&self) -> Option<Vec<Encoding>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .encodings
            .clone()
    }

    /// Install an externally supplied encoding (e.g. loaded from an export
    /// record), bypassing statistics entirely.
    pub fn set_encoding(&self, encoding: Encoding) -> Result<()> {
        encoding.validate()?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.encodings = Some(vec![encoding]);
        Ok(())
    }

    /// Clear accumulated statistics between calibration epochs.
    pub fn reset_stats(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match &mut state.collector {
            Collector::PerTensor(c) => c.reset(),
            Collector::PerChannel(c) => c.reset(),
        }
    }

    /// Fold a tensor into the statistics without transforming it.
    pub fn observe(&self, input: &[f32], shape: &[usize]) -> Result<()> {
        validate_shape(input.len(), shape)?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        Self::observe_locked(&mut state, input, shape)
    }

    /// Fold an externally computed min/max (e.g. a device-side reduction).
    /// Only valid for per-tensor quantizers.
    pub fn observe_min_max(&self, min: f64, max: f64, count: u64) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match &mut state.collector {
            Collector::PerTensor(c) => {
                c.observe_min_max(min, max, count);
                Ok(())
            }
            Collector::PerChannel(_) => Err(Error::Kernel(
                "per-channel quantizers require shaped observations".to_string(),
            )),
        }
    }

    /// Compute and store encodings from the accumulated statistics.
    ///
    /// Fails with [`Error::InvalidRange`] when nothing has been observed
    /// and no explicit encoding was supplied.
    pub fn compute_encoding(&self) -> Result<Encoding> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.compute_encoding_locked(&mut state)?;
        // compute_encoding_locked always stores at least one entry
        state
            .encodings
            .as_ref()
            .and_then(|e| e.first().copied())
            .ok_or(Error::EncodingNotSet)
    }

    /// Transform `input` into the caller-provided `output` according to the
    /// current mode. `shape` is the row-major shape of both buffers.
    pub fn apply_into(&self, input: &[f32], shape: &[usize], output: &mut [f32]) -> Result<()> {
        validate_shape(input.len(), shape)?;
        if output.len() != input.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![input.len()],
                got: vec![output.len()],
            });
        }

        if !self.is_enabled() {
            output.copy_from_slice(input);
            return Ok(());
        }

        // Reader modes run under the read lock; stat-mutating modes retake
        // the write lock. A mode change between the two lock acquisitions
        // is the caller's race by contract.
        let mode = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            match state.mode {
                QuantizeMode::PassThrough => {
                    output.copy_from_slice(input);
                    return Ok(());
                }
                QuantizeMode::QuantizeDequantize => {
                    let encodings = state.encodings.as_ref().ok_or(Error::EncodingNotSet)?;
                    return self.run_kernel(encodings, input, shape, output);
                }
                other => other,
            }
        };

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match mode {
            QuantizeMode::UpdateStats => {
                Self::observe_locked(&mut state, input, shape)?;
                output.copy_from_slice(input);
                Ok(())
            }
            QuantizeMode::OneShotQuantizeDequantize => {
                Self::observe_locked(&mut state, input, shape)?;
                if !(state.frozen && state.encodings.is_some()) {
                    self.compute_encoding_locked(&mut state)?;
                }
                let encodings = state.encodings.as_ref().ok_or(Error::EncodingNotSet)?;
                self.run_kernel(encodings, input, shape, output)
            }
            // Handled under the read lock above.
            QuantizeMode::PassThrough | QuantizeMode::QuantizeDequantize => unreachable!(),
        }
    }

    /// Allocating convenience wrapper around [`TensorQuantizer::apply_into`].
    pub fn apply(&self, input: &[f32], shape: &[usize]) -> Result<Vec<f32>> {
        let mut output = vec![0.0; input.len()];
        self.apply_into(input, shape, &mut output)?;
        Ok(output)
    }

    fn observe_locked(state: &mut State, input: &[f32], shape: &[usize]) -> Result<()> {
        match &mut state.collector {
            Collector::PerTensor(c) => {
                c.observe(input);
                Ok(())
            }
            Collector::PerChannel(c) => c.observe(input, shape),
        }
    }

    fn compute_encoding_locked(&self, state: &mut State) -> Result<()> {
        let cfg = &self.config;
        cfg.scheme.validate()?;
        let from_collector = |c: &StatsCollector| -> Result<Encoding> {
            let (lo, hi) = c.range().ok_or_else(|| {
                Error::InvalidRange("statistics contain no samples".to_string())
            })?;
            compute_encoding(
                lo,
                hi,
                cfg.bitwidth,
                cfg.symmetric,
                cfg.strict_symmetric,
                cfg.unsigned_symmetric,
            )
        };
        let encodings = match &state.collector {
            Collector::PerTensor(c) => vec![from_collector(c)?],
            Collector::PerChannel(c) => {
                if c.num_channels() == 0 {
                    return Err(Error::InvalidRange(
                        "statistics contain no samples".to_string(),
                    ));
                }
                c.lanes()
                    .iter()
                    .map(from_collector)
                    .collect::<Result<Vec<_>>>()?
            }
        };
        debug!(lanes = encodings.len(), "quantizer encoding recomputed");
        state.encodings = Some(encodings);
        Ok(())
    }

    fn run_kernel(
        &self,
        encodings: &[Encoding],
        input: &[f32],
        shape: &[usize],
        output: &mut [f32],
    ) -> Result<()> {
        match self.config.per_channel_axis {
            None => cpu::quantize_dequantize(input, &encodings[0], self.config.rounding, output),
            Some(axis) => cpu::quantize_dequantize_per_channel(
                input,
                shape,
                axis,
                encodings,
                self.config.rounding,
                output,
            ),
        }
    }
}

fn validate_shape(len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![len],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn quantizer(config: QuantizerConfig) -> TensorQuantizer {
        TensorQuantizer::new(config)
    }

    #[test]
    fn test_initial_mode_is_pass_through() {
        let q = quantizer(QuantizerConfig::default());
        assert_eq!(q.mode(), QuantizeMode::PassThrough);

        let input = [0.1f32, -0.2, 0.3];
        let out = q.apply(&input, &[3]).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_pass_through_is_bit_identical() {
        let q = quantizer(QuantizerConfig::default());
        let input = [f32::NAN, 0.1, -0.0, f32::INFINITY];
        let out = q.apply(&input, &[4]).unwrap();
        assert_eq!(out[1].to_bits(), input[1].to_bits());
        assert_eq!(out[2].to_bits(), input[2].to_bits());
        assert_eq!(out[3].to_bits(), input[3].to_bits());
        assert!(out[0].is_nan());
    }

    #[test]
    fn test_quantize_without_encoding_fails() {
        let q = quantizer(QuantizerConfig::default());
        q.set_mode(QuantizeMode::QuantizeDequantize);
        let err = q.apply(&[0.5], &[1]).unwrap_err();
        assert!(matches!(err, Error::EncodingNotSet));
    }

    #[test]
    fn test_update_stats_returns_input_unchanged() {
        let q = quantizer(QuantizerConfig::default());
        q.set_mode(QuantizeMode::UpdateStats);
        let input = [0.7f32, -0.3];
        let out = q.apply(&input, &[2]).unwrap();
        assert_eq!(out, input);
        assert!(q.encoding().is_none());

        let enc = q.compute_encoding().unwrap();
        assert!(enc.min <= -0.3);
        assert!(enc.max >= 0.7 - enc.scale);
    }

    #[test]
    fn test_one_shot_computes_and_applies() {
        let q = quantizer(QuantizerConfig::symmetric(8));
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);
        let input = [-1.0f32, 0.5, 1.0];
        let out = q.apply(&input, &[3]).unwrap();

        let enc = q.encoding().unwrap();
        assert_abs_diff_eq!(enc.max, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out[2], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[1], 0.5, epsilon = 1e-2);
    }

    #[test]
    fn test_frozen_encoding_survives_one_shot() {
        let q = quantizer(QuantizerConfig::symmetric(8));
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);
        q.apply(&[-1.0, 1.0], &[2]).unwrap();
        let enc_before = q.encoding().unwrap();

        q.freeze_encoding(true);
        // A much wider tensor would normally widen the range.
        q.apply(&[-100.0, 100.0], &[2]).unwrap();
        let enc_after = q.encoding().unwrap();
        assert_eq!(enc_before, enc_after);

        // Unfreezing lets the next one-shot recompute.
        q.freeze_encoding(false);
        q.apply(&[-100.0, 100.0], &[2]).unwrap();
        assert!(q.encoding().unwrap().max > 1.0);
    }

    #[test]
    fn test_disabled_quantizer_passes_through_in_any_mode() {
        let q = quantizer(QuantizerConfig::default());
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);
        q.set_enabled(false);

        let input = [0.123f32, -0.456];
        let out = q.apply(&input, &[2]).unwrap();
        assert_eq!(out, input);
        // Disabled calls touch neither stats nor encoding.
        assert!(q.encoding().is_none());
    }

    #[test]
    fn test_explicit_encoding_enables_quantize_mode() {
        let q = quantizer(QuantizerConfig::default());
        let enc = crate::encoding::compute_encoding(-0.46, 0.72, 8, false, false, false).unwrap();
        q.set_encoding(enc).unwrap();
        q.set_mode(QuantizeMode::QuantizeDequantize);

        let out = q.apply(&[0.25], &[1]).unwrap();
        assert_abs_diff_eq!(out[0], 0.2499, epsilon = 1e-4);
    }

    #[test]
    fn test_reset_stats_requires_fresh_observation() {
        let q = quantizer(QuantizerConfig::default());
        q.set_mode(QuantizeMode::UpdateStats);
        q.apply(&[-5.0, 5.0], &[2]).unwrap();
        q.reset_stats();
        assert!(q.compute_encoding().is_err());

        q.apply(&[-1.0, 1.0], &[2]).unwrap();
        let enc = q.compute_encoding().unwrap();
        assert!(enc.max < 2.0);
    }

    #[test]
    fn test_invalid_percentile_config_reports_invalid_range() {
        // Inverted percentile bounds must surface as an error, never as an
        // out-of-bounds index inside the reservoir.
        let config = QuantizerConfig {
            scheme: CalibrationScheme::Percentile {
                lower: 100.0,
                upper: 99.5,
            },
            ..QuantizerConfig::default()
        };
        let q = quantizer(config);
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);
        let err = q.apply(&[0.1, 0.2, 0.3], &[3]).unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[test]
    fn test_percentile_lower_bound_at_100_does_not_panic() {
        let config = QuantizerConfig {
            scheme: CalibrationScheme::Percentile {
                lower: 100.0,
                upper: 100.0,
            },
            ..QuantizerConfig::default()
        };
        let q = quantizer(config);
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);
        let out = q.apply(&[0.1, 0.2, 0.3], &[3]).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_set_encoding_rejects_non_finite_offset() {
        let q = quantizer(QuantizerConfig::default());
        let mut enc = crate::encoding::compute_encoding(-1.0, 1.0, 8, false, false, false).unwrap();
        enc.offset = f64::NAN;
        assert!(matches!(q.set_encoding(enc), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let q = quantizer(QuantizerConfig::default());
        let err = q.apply(&[0.0; 4], &[5]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_per_channel_quantizer_end_to_end() {
        let config = QuantizerConfig {
            per_channel_axis: Some(0),
            symmetric: true,
            ..QuantizerConfig::symmetric(8)
        };
        let q = quantizer(config);
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);

        // Channel 0 narrow, channel 1 wide.
        let input = [0.5f32, -0.5, 50.0, -50.0];
        let out = q.apply(&input, &[2, 2]).unwrap();

        let encodings = q.encodings().unwrap();
        assert_eq!(encodings.len(), 2);
        assert_abs_diff_eq!(encodings[0].max, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(encodings[1].max, 50.0, epsilon = 1e-9);
        // Narrow channel keeps fine resolution despite the wide sibling.
        assert_abs_diff_eq!(out[0], 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(out[2], 50.0, epsilon = 1e-1);
    }

    #[test]
    fn test_concurrent_reads_on_frozen_quantizer() {
        use std::sync::Arc;

        let q = Arc::new(quantizer(QuantizerConfig::symmetric(8)));
        q.set_mode(QuantizeMode::OneShotQuantizeDequantize);
        q.apply(&[-1.0, 1.0], &[2]).unwrap();
        q.freeze_encoding(true);
        q.set_mode(QuantizeMode::QuantizeDequantize);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let out = q.apply(&[0.25, -0.75], &[2]).unwrap();
                        assert!((out[0] - 0.25).abs() < 0.01);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
