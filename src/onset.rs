//! # Onset (characteristic) functions
//!
//! An [`OnsetSeries`] is one uniformly sampled, non-negative amplitude series
//! computed from a station's waveforms for one phase. The series are produced
//! outside this crate and handed to the migration as an [`OnsetSet`], keyed by
//! [`StationPhaseKey`]; they are never mutated by the scan.
//!
//! Sample `i` of a series sits at `start + i · sample_interval`. A query at an
//! arbitrary epoch resolves to the **nearest** sample (ties away from zero);
//! queries outside `[start, start + len · sample_interval)` after rounding
//! have no value.
use std::collections::HashMap;

use ahash::RandomState;
use hifitime::{Duration, Epoch};

use crate::{constants::Seconds, lut::StationPhaseKey, quakescan_errors::QuakeScanError};

/// Onset series of a run, one per station/phase.
pub type OnsetSet = HashMap<StationPhaseKey, OnsetSeries, RandomState>;

#[derive(Debug, Clone, PartialEq)]
pub struct OnsetSeries {
    values: Vec<f64>,
    sample_interval: Seconds,
    start: Epoch,
}

impl OnsetSeries {
    /// Construct a new [`OnsetSeries`].
    ///
    /// Arguments
    /// -----------------
    /// * `values`: Onset amplitudes, non-negative and finite.
    /// * `sample_interval`: Spacing between samples, in seconds (> 0).
    /// * `start`: Epoch of the first sample.
    ///
    /// Return
    /// ----------
    /// * The series, or [`QuakeScanError::InvalidOnset`] if an argument is out of range.
    pub fn new(values: Vec<f64>, sample_interval: Seconds, start: Epoch) -> Result<Self, QuakeScanError> {
        if !sample_interval.is_finite() || sample_interval <= 0.0 {
            return Err(QuakeScanError::InvalidOnset(format!(
                "sample interval must be finite and > 0, got {sample_interval}"
            )));
        }
        if let Some((i, v)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(QuakeScanError::InvalidOnset(format!(
                "sample {i} has invalid amplitude {v}"
            )));
        }
        Ok(OnsetSeries {
            values,
            sample_interval,
            start,
        })
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn sample_interval(&self) -> Seconds {
        self.sample_interval
    }

    pub fn start(&self) -> Epoch {
        self.start
    }

    /// Epoch just after the last sample, `start + len · sample_interval`.
    pub fn end(&self) -> Epoch {
        self.start + Duration::from_seconds(self.values.len() as f64 * self.sample_interval)
    }

    /// Position of `time` in samples from the start, before rounding.
    #[inline]
    pub fn fractional_index(&self, time: Epoch) -> f64 {
        (time - self.start).to_seconds() / self.sample_interval
    }

    /// Nearest sample to `time`, `None` outside the series.
    pub fn sample_index(&self, time: Epoch) -> Option<usize> {
        let idx = self.fractional_index(time).round();
        if idx < 0.0 || idx >= self.values.len() as f64 {
            return None;
        }
        Some(idx as usize)
    }

    /// Amplitude of the nearest sample to `time`, `None` outside the series.
    pub fn value_at(&self, time: Epoch) -> Option<f64> {
        self.sample_index(time).map(|i| self.values[i])
    }
}
