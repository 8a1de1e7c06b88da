//! Range statistics for calibration
//!
//! A [`StatsCollector`] observes a stream of tensors and accumulates the
//! range information a calibration pass needs before an encoding can be
//! computed. Three schemes are supported:
//! - Min-max: running min/max over every observed value
//! - Percentile: reservoir-sampled percentile clipping, robust to outliers
//! - Moving average: min/max smoothed across batches
//!
//! `reset()` clears accumulated state without deallocating, so back-to-back
//! calibration epochs reuse the same collector.

use ndarray::{ArrayViewD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Running aggregate over observed tensors.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorStats {
    /// Smallest observed value
    pub min: f64,
    /// Largest observed value
    pub max: f64,
    /// Number of observed elements
    pub count: u64,
}

impl TensorStats {
    pub fn new() -> Self {
        TensorStats {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        }
    }

    /// Fold one batch's min/max into the running aggregate.
    pub fn update(&mut self, batch_min: f64, batch_max: f64, n: u64) {
        if n == 0 {
            return;
        }
        self.min = self.min.min(batch_min);
        self.max = self.max.max(batch_max);
        self.count += n;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for TensorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Range-selection scheme used during calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum CalibrationScheme {
    /// Full observed range
    #[default]
    MinMax,
    /// Percentile clipping over a sample reservoir
    Percentile {
        /// Lower percentile, e.g. 0.01 for 0.01%
        lower: f64,
        /// Upper percentile, e.g. 99.99 for 99.99%
        upper: f64,
    },
    /// Min/max smoothed over batches; `momentum` is the weight of the new
    /// batch (1.0 means only the newest batch counts)
    MovingAverage { momentum: f64 },
}

impl CalibrationScheme {
    /// Reject parameter combinations that cannot produce a valid range.
    pub fn validate(&self) -> Result<()> {
        match *self {
            CalibrationScheme::MinMax => {}
            CalibrationScheme::Percentile { lower, upper } => {
                if !lower.is_finite()
                    || !upper.is_finite()
                    || lower < 0.0
                    || upper > 100.0
                    || lower > upper
                {
                    return Err(Error::InvalidRange(format!(
                        "percentile bounds [{lower}, {upper}] outside 0 <= lower <= upper <= 100"
                    )));
                }
            }
            CalibrationScheme::MovingAverage { momentum } => {
                if !(momentum > 0.0 && momentum <= 1.0) {
                    return Err(Error::InvalidRange(format!(
                        "moving-average momentum {momentum} outside (0, 1]"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Reservoir capacity for percentile calibration.
const DEFAULT_MAX_SAMPLES: usize = 16_384;

/// Observes tensors and accumulates range statistics for one logical tensor.
#[derive(Clone, Debug)]
pub struct StatsCollector {
    scheme: CalibrationScheme,
    stats: TensorStats,
    samples: Vec<f32>,
    max_samples: usize,
    seen: u64,
    rng: StdRng,
}

impl StatsCollector {
    pub fn new(scheme: CalibrationScheme) -> Self {
        let max_samples = match scheme {
            CalibrationScheme::Percentile { .. } => DEFAULT_MAX_SAMPLES,
            _ => 0,
        };
        StatsCollector {
            scheme,
            stats: TensorStats::new(),
            samples: Vec::new(),
            max_samples,
            seen: 0,
            // Fixed seed: reservoir contents are reproducible run to run.
            rng: StdRng::seed_from_u64(0x5EED_CA11),
        }
    }

    pub fn min_max() -> Self {
        Self::new(CalibrationScheme::MinMax)
    }

    pub fn scheme(&self) -> CalibrationScheme {
        self.scheme
    }

    /// Fold one tensor's values into the running statistics.
    ///
    /// NaN values are skipped; they carry no range information.
    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }
        let (batch_min, batch_max) = data
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
                (lo.min(x as f64), hi.max(x as f64))
            });

        match self.scheme {
            CalibrationScheme::MinMax => {
                self.stats.update(batch_min, batch_max, data.len() as u64);
            }
            CalibrationScheme::Percentile { .. } => {
                self.stats.update(batch_min, batch_max, data.len() as u64);
                self.sample(data);
            }
            CalibrationScheme::MovingAverage { momentum } => {
                if self.stats.is_empty() {
                    self.stats.update(batch_min, batch_max, data.len() as u64);
                } else {
                    self.stats.min = self.stats.min * (1.0 - momentum) + batch_min * momentum;
                    self.stats.max = self.stats.max * (1.0 - momentum) + batch_max * momentum;
                    self.stats.count += data.len() as u64;
                }
            }
        }
    }

    /// Fold an externally computed min/max (e.g. a device-side reduction)
    /// into the running statistics.
    pub fn observe_min_max(&mut self, batch_min: f64, batch_max: f64, n: u64) {
        match self.scheme {
            CalibrationScheme::MovingAverage { momentum } if !self.stats.is_empty() => {
                self.stats.min = self.stats.min * (1.0 - momentum) + batch_min * momentum;
                self.stats.max = self.stats.max * (1.0 - momentum) + batch_max * momentum;
                self.stats.count += n;
            }
            _ => self.stats.update(batch_min, batch_max, n),
        }
    }

    pub fn stats(&self) -> &TensorStats {
        &self.stats
    }

    /// Calibrated range under the collector's scheme, or `None` before any
    /// observation.
    pub fn range(&self) -> Option<(f64, f64)> {
        if self.stats.is_empty() {
            return None;
        }
        match self.scheme {
            CalibrationScheme::Percentile { lower, upper } if !self.samples.is_empty() => {
                Some(self.percentile_bounds(lower, upper))
            }
            _ => Some((self.stats.min, self.stats.max)),
        }
    }

    /// Clear accumulated statistics. Keeps the reservoir allocation for the
    /// next calibration epoch.
    pub fn reset(&mut self) {
        self.stats = TensorStats::new();
        self.samples.clear();
        self.seen = 0;
    }

    fn sample(&mut self, data: &[f32]) {
        for &x in data {
            if x.is_nan() {
                continue;
            }
            self.seen += 1;
            if self.samples.len() < self.max_samples {
                self.samples.push(x);
            } else {
                // Reservoir sampling: each element survives with probability
                // max_samples / seen.
                let j = self.rng.random_range(0..self.seen);
                if (j as usize) < self.max_samples {
                    self.samples[j as usize] = x;
                }
            }
        }
    }

    fn percentile_bounds(&self, lower: f64, upper: f64) -> (f64, f64) {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        // Both indices clamp: a 100th-percentile bound lands on the last
        // sample instead of one past it.
        let lower_idx = (((lower / 100.0) * n as f64) as usize).min(n - 1);
        let upper_idx = (((upper / 100.0) * n as f64) as usize).min(n - 1);
        (sorted[lower_idx] as f64, sorted[upper_idx] as f64)
    }
}

/// Per-channel statistics along one axis of a shaped tensor.
///
/// Lanes are created on first observation; all subsequent observations must
/// agree on the channel count.
#[derive(Clone, Debug)]
pub struct PerChannelCollector {
    axis: usize,
    scheme: CalibrationScheme,
    lanes: Vec<StatsCollector>,
}

impl PerChannelCollector {
    pub fn new(axis: usize, scheme: CalibrationScheme) -> Self {
        PerChannelCollector {
            axis,
            scheme,
            lanes: Vec::new(),
        }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn num_channels(&self) -> usize {
        self.lanes.len()
    }

    pub fn lanes(&self) -> &[StatsCollector] {
        &self.lanes
    }

    /// Observe a row-major tensor of the given shape, folding each channel
    /// slice along the collector's axis into its own lane.
    pub fn observe(&mut self, data: &[f32], shape: &[usize]) -> Result<()> {
        if self.axis >= shape.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.axis + 1],
                got: shape.to_vec(),
            });
        }
        let view = ArrayViewD::from_shape(IxDyn(shape), data).map_err(|_| Error::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data.len()],
        })?;

        let channels = shape[self.axis];
        if self.lanes.is_empty() {
            self.lanes = (0..channels).map(|_| StatsCollector::new(self.scheme)).collect();
        } else if self.lanes.len() != channels {
            return Err(Error::ShapeMismatch {
                expected: vec![self.lanes.len()],
                got: vec![channels],
            });
        }

        for (lane, slice) in self.lanes.iter_mut().zip(view.axis_iter(Axis(self.axis))) {
            let (lo, hi, n) = slice
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY, 0u64), |(lo, hi, n), &x| {
                    (lo.min(x as f64), hi.max(x as f64), n + 1)
                });
            lane.observe_min_max(lo, hi, n);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for lane in &mut self.lanes {
            lane.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Min-max accumulation over split batches equals accumulation over
        /// the concatenation.
        #[test]
        fn prop_min_max_batch_invariant(
            batch1 in prop::collection::vec(-50.0f32..50.0, 1..64),
            batch2 in prop::collection::vec(-50.0f32..50.0, 1..64),
        ) {
            let mut split = StatsCollector::min_max();
            split.observe(&batch1);
            split.observe(&batch2);

            let mut joined = StatsCollector::min_max();
            let all: Vec<f32> = batch1.iter().chain(batch2.iter()).copied().collect();
            joined.observe(&all);

            prop_assert_eq!(split.range(), joined.range());
            prop_assert_eq!(split.stats().count, joined.stats().count);
        }

        /// Percentile bounds never exceed the observed range.
        #[test]
        fn prop_percentile_within_observed_range(
            data in prop::collection::vec(-50.0f32..50.0, 32..512),
        ) {
            let mut collector = StatsCollector::new(CalibrationScheme::Percentile {
                lower: 1.0,
                upper: 99.0,
            });
            collector.observe(&data);
            let (lo, hi) = collector.range().unwrap();
            prop_assert!(lo >= collector.stats().min - 1e-6);
            prop_assert!(hi <= collector.stats().max + 1e-6);
            prop_assert!(lo <= hi);
        }
    }

    #[test]
    fn test_running_min_max() {
        let mut collector = StatsCollector::min_max();
        collector.observe(&[0.0, 1.0, -2.0]);
        collector.observe(&[0.5, 3.0]);
        let (lo, hi) = collector.range().unwrap();
        assert_abs_diff_eq!(lo, -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 3.0, epsilon = 1e-12);
        assert_eq!(collector.stats().count, 5);
    }

    #[test]
    fn test_empty_collector_has_no_range() {
        let collector = StatsCollector::min_max();
        assert!(collector.range().is_none());
        assert!(collector.stats().is_empty());
    }

    #[test]
    fn test_reset_clears_without_losing_scheme() {
        let mut collector = StatsCollector::min_max();
        collector.observe(&[1.0, 2.0]);
        collector.reset();
        assert!(collector.range().is_none());
        collector.observe(&[-4.0, 4.0]);
        assert_eq!(collector.range(), Some((-4.0, 4.0)));
    }

    #[test]
    fn test_nan_observations_are_skipped() {
        let mut collector = StatsCollector::min_max();
        collector.observe(&[f32::NAN, 1.0, -1.0]);
        let (lo, hi) = collector.range().unwrap();
        assert_eq!((lo, hi), (-1.0, 1.0));
    }

    #[test]
    fn test_percentile_ignores_outliers() {
        let mut data: Vec<f32> = (0..1000).map(|i| i as f32 * 0.01).collect();
        data.push(1e6);
        data.push(-1e6);

        let mut collector = StatsCollector::new(CalibrationScheme::Percentile {
            lower: 1.0,
            upper: 99.0,
        });
        collector.observe(&data);
        let (lo, hi) = collector.range().unwrap();
        assert!(lo > -100.0);
        assert!(hi < 100.0);
    }

    #[test]
    fn test_percentile_bounds_at_extremes_stay_in_range() {
        let mut collector = StatsCollector::new(CalibrationScheme::Percentile {
            lower: 0.0,
            upper: 100.0,
        });
        collector.observe(&[1.0, 2.0, 3.0]);
        assert_eq!(collector.range(), Some((1.0, 3.0)));

        let mut collector = StatsCollector::new(CalibrationScheme::Percentile {
            lower: 100.0,
            upper: 100.0,
        });
        collector.observe(&[1.0, 2.0, 3.0]);
        assert_eq!(collector.range(), Some((3.0, 3.0)));
    }

    #[test]
    fn test_scheme_validation_rejects_bad_parameters() {
        let bad = CalibrationScheme::Percentile {
            lower: 100.0,
            upper: 99.5,
        };
        assert!(bad.validate().is_err());
        let bad = CalibrationScheme::Percentile {
            lower: -1.0,
            upper: 50.0,
        };
        assert!(bad.validate().is_err());
        let good = CalibrationScheme::Percentile {
            lower: 0.5,
            upper: 99.5,
        };
        assert!(good.validate().is_ok());

        assert!(CalibrationScheme::MovingAverage { momentum: 0.0 }.validate().is_err());
        assert!(CalibrationScheme::MovingAverage { momentum: 1.0 }.validate().is_ok());
        assert!(CalibrationScheme::MinMax.validate().is_ok());
    }

    #[test]
    fn test_moving_average_blends_batches() {
        let mut collector = StatsCollector::new(CalibrationScheme::MovingAverage { momentum: 0.5 });
        collector.observe(&[-1.0, 1.0]);
        collector.observe(&[-3.0, 3.0]);
        let (lo, hi) = collector.range().unwrap();
        assert_abs_diff_eq!(lo, -2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(hi, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_per_channel_lanes_track_independent_ranges() {
        // 2x3 tensor, channels along axis 0.
        let data = [1.0f32, 2.0, 3.0, -10.0, 0.0, 10.0];
        let mut collector = PerChannelCollector::new(0, CalibrationScheme::MinMax);
        collector.observe(&data, &[2, 3]).unwrap();

        assert_eq!(collector.num_channels(), 2);
        assert_eq!(collector.lanes()[0].range(), Some((1.0, 3.0)));
        assert_eq!(collector.lanes()[1].range(), Some((-10.0, 10.0)));
    }

    #[test]
    fn test_per_channel_axis_one() {
        let data = [1.0f32, -1.0, 2.0, -2.0];
        let mut collector = PerChannelCollector::new(1, CalibrationScheme::MinMax);
        collector.observe(&data, &[2, 2]).unwrap();

        assert_eq!(collector.lanes()[0].range(), Some((1.0, 2.0)));
        assert_eq!(collector.lanes()[1].range(), Some((-2.0, -1.0)));
    }

    #[test]
    fn test_per_channel_rejects_axis_out_of_rank() {
        let mut collector = PerChannelCollector::new(2, CalibrationScheme::MinMax);
        let err = collector.observe(&[0.0; 4], &[2, 2]).unwrap_err();
        assert!(matches!(err, crate::error::Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_per_channel_rejects_changed_channel_count() {
        let mut collector = PerChannelCollector::new(0, CalibrationScheme::MinMax);
        collector.observe(&[0.0; 4], &[2, 2]).unwrap();
        let err = collector.observe(&[0.0; 6], &[3, 2]).unwrap_err();
        assert!(matches!(err, crate::error::Error::ShapeMismatch { .. }));
    }
}
