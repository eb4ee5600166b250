//! # Coalescence scanner
//!
//! Reduces every [`CoalescenceSample`] to its maximum over the grid and
//! accumulates two traces in time order:
//!
//! * [`DetectionTrace`] – the maximum coalescence and its normalised value.
//! * [`LocationTrace`] – the node (and its coordinates) holding the maximum.
//!
//! The maximum is the largest value; among equal values the **smallest linear
//! node index** wins. Reductions combine per-chunk maxima in chunk order with
//! that rule, so the result does not depend on the number of workers.
//!
//! A time index where no key contributes is recorded with a NaN maximum and no
//! node; it does not stop the scan.
use std::collections::BTreeMap;

use hifitime::Epoch;
use nalgebra::Point3;
use rayon::prelude::*;

use crate::{
    constants::{Meter, NodeIndex},
    grid::Grid,
    lut::StationPhaseKey,
    migration::CoalescenceSample,
};

pub mod background;

use background::{BackgroundEstimator, BackgroundStatistic};

/// Maximum of one sample over the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleMaximum {
    pub value: f64,
    pub node: NodeIndex,
    /// Sum of every node value, for the volume mean.
    pub volume_sum: f64,
    /// Nodes visited.
    pub nodes: usize,
}

impl SampleMaximum {
    /// Merge two partial maxima. `self` must cover nodes before `other`.
    #[inline]
    pub fn combine(self, other: SampleMaximum) -> SampleMaximum {
        let (value, node) = if other.value > self.value
            || (other.value == self.value && other.node < self.node)
        {
            (other.value, other.node)
        } else {
            (self.value, self.node)
        };
        SampleMaximum {
            value,
            node,
            volume_sum: self.volume_sum + other.volume_sum,
            nodes: self.nodes + other.nodes,
        }
    }

    pub fn volume_mean(&self) -> f64 {
        if self.nodes == 0 {
            f64::NAN
        } else {
            self.volume_sum / self.nodes as f64
        }
    }
}

fn chunk_maximum(values: &[f64], first_node: NodeIndex) -> Option<SampleMaximum> {
    let (offset, &value) = values
        .iter()
        .enumerate()
        .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })?;
    Some(SampleMaximum {
        value,
        node: first_node + offset,
        volume_sum: values.iter().sum(),
        nodes: values.len(),
    })
}

/// Reduce `values` to its maximum on the calling thread, `chunk` nodes at a time.
pub fn reduce_serial(values: &[f64], chunk: usize) -> Option<SampleMaximum> {
    let chunk = chunk.max(1);
    values
        .chunks(chunk)
        .enumerate()
        .filter_map(|(i, c)| chunk_maximum(c, i * chunk))
        .reduce(SampleMaximum::combine)
}

/// Reduce `values` to its maximum, chunks spread over the current rayon pool.
///
/// Gives the same result as [`reduce_serial`] with the same `chunk`, bit for bit.
pub fn reduce_sample(values: &[f64], chunk: usize) -> Option<SampleMaximum> {
    let chunk = chunk.max(1);
    let partial: Vec<Option<SampleMaximum>> = values
        .par_chunks(chunk)
        .enumerate()
        .map(|(i, c)| chunk_maximum(c, i * chunk))
        .collect();
    partial.into_iter().flatten().reduce(SampleMaximum::combine)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSample {
    pub time_index: usize,
    pub time: Epoch,
    /// Maximum coalescence, NaN when no key contributed.
    pub value: f64,
    /// `value` divided by the background, NaN when undefined.
    pub normalised: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub time_index: usize,
    pub time: Epoch,
    pub node: Option<NodeIndex>,
    pub coordinates: Option<Point3<Meter>>,
}

/// Maximum coalescence through time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionTrace {
    samples: Vec<DetectionSample>,
}

impl DetectionTrace {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, time_index: usize) -> Option<&DetectionSample> {
        self.samples.get(time_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectionSample> {
        self.samples.iter()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn normalised(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.normalised).collect()
    }

    /// Sample with the largest maximum, the earliest on ties. NaN samples are skipped.
    pub fn peak(&self) -> Option<&DetectionSample> {
        self.samples
            .iter()
            .filter(|s| !s.value.is_nan())
            .reduce(|best, s| if s.value > best.value { s } else { best })
    }

    /// Number of samples with a defined maximum.
    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|s| !s.value.is_nan()).count()
    }
}

/// Node of the maximum coalescence through time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationTrace {
    samples: Vec<LocationSample>,
}

impl LocationTrace {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, time_index: usize) -> Option<&LocationSample> {
        self.samples.get(time_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationSample> {
        self.samples.iter()
    }

    pub fn nodes(&self) -> Vec<Option<NodeIndex>> {
        self.samples.iter().map(|s| s.node).collect()
    }
}

/// Bookkeeping of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Samples the run was asked for.
    pub requested: usize,
    /// Samples pushed to the traces.
    pub completed: usize,
    pub cancelled: bool,
    /// Samples where no key contributed.
    pub empty_samples: usize,
    /// Keys taking part in the run.
    pub keys: usize,
    /// Time indices lacking full coverage, per key.
    pub coverage_gaps: BTreeMap<StationPhaseKey, usize>,
}

/// Traces and report of a scan over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub grid: Grid,
    /// Decimation of the table the result was computed on.
    pub decimation: [usize; 3],
    pub detection: DetectionTrace,
    pub location: LocationTrace,
    pub report: ScanReport,
}

impl ScanResult {
    /// Time index and location of the peak of the detection trace.
    pub fn peak(&self) -> Option<(&DetectionSample, &LocationSample)> {
        let peak = self.detection.peak()?;
        let location = self.location.get(peak.time_index)?;
        Some((peak, location))
    }
}

/// Consumer side of a run: turns samples into traces, strictly in time order.
#[derive(Debug)]
pub struct CoalescenceScanner {
    grid: Grid,
    node_chunk: usize,
    background: BackgroundEstimator,
    detection: DetectionTrace,
    location: LocationTrace,
    empty_samples: usize,
}

impl CoalescenceScanner {
    pub fn new(grid: Grid, statistic: BackgroundStatistic, window: usize, node_chunk: usize) -> Self {
        CoalescenceScanner {
            grid,
            node_chunk,
            background: BackgroundEstimator::new(statistic, window),
            detection: DetectionTrace::default(),
            location: LocationTrace::default(),
            empty_samples: 0,
        }
    }

    /// Samples pushed so far; also the time index expected next.
    pub fn len(&self) -> usize {
        self.detection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detection.is_empty()
    }

    /// Reduce `sample` in the current rayon pool and push the result.
    pub fn consume(&mut self, sample: &CoalescenceSample) {
        let maximum = reduce_sample(sample.values(), self.node_chunk);
        self.push_reduced(sample.time_index(), sample.time(), maximum);
    }

    /// Reduce `sample` on the calling thread and push the result.
    pub fn consume_serial(&mut self, sample: &CoalescenceSample) {
        let maximum = reduce_serial(sample.values(), self.node_chunk);
        self.push_reduced(sample.time_index(), sample.time(), maximum);
    }

    pub fn node_chunk(&self) -> usize {
        self.node_chunk
    }

    /// Push an already reduced sample; `None` records an undefined sample.
    pub fn push_reduced(&mut self, time_index: usize, time: Epoch, maximum: Option<SampleMaximum>) {
        debug_assert_eq!(time_index, self.detection.len());
        let Some(maximum) = maximum else {
            self.push_empty(time_index, time);
            return;
        };
        let normalised = self.background.push(maximum.value, maximum.volume_mean());
        self.detection.samples.push(DetectionSample {
            time_index,
            time,
            value: maximum.value,
            normalised,
        });
        self.location.samples.push(LocationSample {
            time_index,
            time,
            node: Some(maximum.node),
            coordinates: self.grid.node_coordinates(maximum.node),
        });
    }

    /// Record a sample where no key contributed.
    pub fn push_empty(&mut self, time_index: usize, time: Epoch) {
        debug_assert_eq!(time_index, self.detection.len());
        let normalised = self.background.push(f64::NAN, f64::NAN);
        self.empty_samples += 1;
        self.detection.samples.push(DetectionSample {
            time_index,
            time,
            value: f64::NAN,
            normalised,
        });
        self.location.samples.push(LocationSample {
            time_index,
            time,
            node: None,
            coordinates: None,
        });
    }

    pub fn empty_samples(&self) -> usize {
        self.empty_samples
    }

    pub fn into_traces(self) -> (DetectionTrace, LocationTrace) {
        (self.detection, self.location)
    }
}
