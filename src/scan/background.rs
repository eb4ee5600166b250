//! # Background level of the maximum-coalescence trace
//!
//! The normalised trace divides each maximum by a background estimate.
//! [`BackgroundStatistic::Median`] and [`BackgroundStatistic::Rms`] are
//! computed over a trailing window of the maxima themselves, the samples
//! `[t - W + 1, t]`. The window is shorter at the start of the trace and
//! undefined (NaN) entries are skipped. [`BackgroundStatistic::VolumeMean`]
//! uses the mean coalescence over the grid at the same sample instead.
//!
//! The normalised value is NaN whenever the background is not strictly
//! positive or not defined.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackgroundStatistic {
    /// Median of the maxima in the trailing window.
    Median,
    /// Root mean square of the maxima in the trailing window.
    Rms,
    /// Mean coalescence of the whole volume at the same sample.
    VolumeMean,
}

/// Streaming estimator fed one maximum per output sample, in time order.
#[derive(Debug, Clone)]
pub struct BackgroundEstimator {
    statistic: BackgroundStatistic,
    window: usize,
    history: VecDeque<f64>,
    scratch: Vec<f64>,
}

impl BackgroundEstimator {
    pub fn new(statistic: BackgroundStatistic, window: usize) -> Self {
        let window = window.max(1);
        BackgroundEstimator {
            statistic,
            window,
            history: VecDeque::with_capacity(window),
            scratch: Vec::with_capacity(window),
        }
    }

    pub fn statistic(&self) -> BackgroundStatistic {
        self.statistic
    }

    /// Add the next sample and return its normalised maximum.
    ///
    /// Arguments
    /// -----------------
    /// * `maximum`: Maximum coalescence of the sample, NaN when undefined.
    /// * `volume_mean`: Mean coalescence of the grid at the sample.
    pub fn push(&mut self, maximum: f64, volume_mean: f64) -> f64 {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(maximum);

        let background = match self.statistic {
            BackgroundStatistic::Median => self.median(),
            BackgroundStatistic::Rms => self.rms(),
            BackgroundStatistic::VolumeMean => volume_mean,
        };

        normalise(maximum, background)
    }

    fn median(&mut self) -> f64 {
        self.scratch.clear();
        self.scratch
            .extend(self.history.iter().copied().filter(|v| !v.is_nan()));
        let n = self.scratch.len();
        if n == 0 {
            return f64::NAN;
        }
        self.scratch.sort_unstable_by(f64::total_cmp);
        if n % 2 == 1 {
            self.scratch[n / 2]
        } else {
            0.5 * (self.scratch[n / 2 - 1] + self.scratch[n / 2])
        }
    }

    fn rms(&self) -> f64 {
        let (sum, n) = self
            .history
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, n), v| (s + v * v, n + 1));
        if n == 0 {
            return f64::NAN;
        }
        (sum / n as f64).sqrt()
    }
}

#[inline]
fn normalise(maximum: f64, background: f64) -> f64 {
    if maximum.is_nan() || !background.is_finite() || background <= 0.0 {
        f64::NAN
    } else {
        maximum / background
    }
}

#[cfg(test)]
mod background_test {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_median_window_is_shortened_at_start() {
        let mut est = BackgroundEstimator::new(BackgroundStatistic::Median, 3);
        assert_relative_eq!(est.push(2.0, 0.0), 1.0);
        // window [2, 4], median 3
        assert_relative_eq!(est.push(4.0, 0.0), 4.0 / 3.0);
        // window [2, 4, 9], median 4
        assert_relative_eq!(est.push(9.0, 0.0), 9.0 / 4.0);
        // window [4, 9, 1], median 4
        assert_relative_eq!(est.push(1.0, 0.0), 1.0 / 4.0);
    }

    #[test]
    fn test_rms() {
        let mut est = BackgroundEstimator::new(BackgroundStatistic::Rms, 2);
        assert_relative_eq!(est.push(3.0, 0.0), 1.0);
        // rms of [3, 4] = sqrt(12.5)
        assert_relative_eq!(est.push(4.0, 0.0), 4.0 / 12.5f64.sqrt());
    }

    #[test]
    fn test_volume_mean() {
        let mut est = BackgroundEstimator::new(BackgroundStatistic::VolumeMean, 10);
        assert_relative_eq!(est.push(6.0, 2.0), 3.0);
        assert!(est.push(6.0, 0.0).is_nan());
    }

    #[test]
    fn test_undefined_samples() {
        let mut est = BackgroundEstimator::new(BackgroundStatistic::Median, 4);
        assert!(est.push(f64::NAN, 0.0).is_nan());
        // NaN skipped, median of [0] is not > 0
        assert!(est.push(0.0, 0.0).is_nan());
        // median of [0, 2] = 1
        assert_relative_eq!(est.push(2.0, 0.0), 2.0);
    }
}
