//! # Migration of onset functions
//!
//! The [`MigrationEngine`] stacks the onset series of every station/phase key
//! through the travel-time table. For an output time index `t` (epoch
//! `t0 + t·Δ`) and a grid node `n`:
//!
//! ```text
//! coalescence(t, n) = Σ_k onset_k[ base_k(t) + shift_k(n) ]
//!
//! base_k(t)  = round((t0 + t·Δ − start_k) / Δ_k)
//! shift_k(n) = round(tt_k(n) / Δ_k)
//! ```
//!
//! where `Δ_k` is the sample interval of the onset series of key `k`. Both
//! terms are rounded to the nearest sample on their own, so the time
//! resolution of the search is the onset sampling interval. A query that falls
//! outside the onset series contributes zero for that key.
//!
//! ## Run-scoped shift arena
//!
//! Building an engine converts the travel times of the keys present in the run
//! into integer sample shifts, stored in one flat `keys × nodes` arena of
//! `i32`. The hot loop then only adds integers and reads onset amplitudes.
//!
//! ## Determinism
//!
//! Keys are visited in sorted order for every node, so the floating-point
//! summation order of a node never depends on how nodes are split across
//! workers. Node values are therefore bit-identical for any chunk size,
//! worker count or [`Partition`]. Permuting the keys of the input set changes
//! nothing either, since the order is re-derived from the keys themselves.
//!
//! ## Coverage
//!
//! For each time index a key *contributes* when its shifted range of samples
//! overlaps its onset series at all. A key overlapping only partially, or not
//! at all, is reported once per key with a warning and counted in
//! [`MigrationEngine::coverage_gaps`]. When no key contributes, the sample
//! fails with [`QuakeScanError::EmptyReduction`] and the run moves on.
//!
//! ## See also
//! ------------
//! * [`pipeline`] – Streaming producer/consumer execution of a run.
//! * [`crate::scan`] – Reduction of each sample to its maximum.
use std::sync::atomic::{AtomicUsize, Ordering};

use hifitime::{Duration, Epoch};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    constants::{NodeIndex, Seconds, TIME_TOLERANCE},
    grid::Grid,
    lut::{LookupTable, StationPhaseKey},
    onset::{OnsetSeries, OnsetSet},
    quakescan_errors::QuakeScanError,
    scan_params::ScanParams,
};

pub mod pipeline;

/// Per-node reduction across station/phase keys.
///
/// Both variants are commutative and associative in the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Plain sum of the shifted onset amplitudes.
    Sum,
    /// Sum divided by the number of keys contributing at that time index.
    StationNormalised,
}

/// Axis along which a run is split across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    /// One time index at a time, nodes split in chunks across workers.
    Nodes,
    /// Blocks of time indices in parallel, each worker handles whole samples.
    Times,
}

/// Half-open interval `[start, end)` of output epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: Epoch,
    pub end: Epoch,
}

impl TimeRange {
    pub fn new(start: Epoch, end: Epoch) -> Result<Self, QuakeScanError> {
        if end < start {
            return Err(QuakeScanError::InvalidScanParameter(format!(
                "time range ends ({end}) before it starts ({start})"
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// Range holding exactly `n_samples` samples of `sampling_interval` from `start`.
    pub fn from_samples(start: Epoch, n_samples: usize, sampling_interval: Seconds) -> Self {
        TimeRange {
            start,
            end: start + Duration::from_seconds(n_samples as f64 * sampling_interval),
        }
    }

    /// Number of output samples of `sampling_interval` starting in `[start, end)`.
    ///
    /// An `end` within [`TIME_TOLERANCE`] of a sample epoch excludes that sample.
    pub fn n_samples(&self, sampling_interval: Seconds) -> usize {
        let span = (self.end - self.start).to_seconds();
        ((span - TIME_TOLERANCE) / sampling_interval).ceil().max(0.0) as usize
    }
}

/// Coalescence of every grid node at one output time index.
///
/// Produced by the engine, consumed by the scanner, then either dropped or
/// recycled through [`CoalescenceSample::into_buffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescenceSample {
    time_index: usize,
    time: Epoch,
    values: Vec<f64>,
    contributing_keys: usize,
}

impl CoalescenceSample {
    pub fn time_index(&self) -> usize {
        self.time_index
    }

    pub fn time(&self) -> Epoch {
        self.time
    }

    /// One value per node, in grid linear order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn contributing_keys(&self) -> usize {
        self.contributing_keys
    }

    /// Give back the node buffer for reuse.
    pub fn into_buffer(self) -> Vec<f64> {
        self.values
    }
}

struct Channel<'a> {
    key: &'a StationPhaseKey,
    onset: &'a OnsetSeries,
    /// Scan start relative to the onset start, in onset samples.
    offset: f64,
    /// Output sampling interval in onset samples.
    step: f64,
    min_shift: i64,
    max_shift: i64,
}

impl Channel<'_> {
    #[inline]
    fn base(&self, t: usize) -> i64 {
        (self.offset + t as f64 * self.step).round() as i64
    }
}

/// Coverage of one key at one time index.
enum Coverage {
    Full(i64),
    Partial(i64),
    None,
}

pub struct MigrationEngine<'a> {
    grid: &'a Grid,
    channels: Vec<Channel<'a>>,
    shifts: Vec<i32>,
    gaps: Vec<AtomicUsize>,
    node_count: usize,
    start: Epoch,
    sampling_interval: Seconds,
    n_samples: usize,
    aggregation: Aggregation,
    node_chunk: usize,
}

impl<'a> MigrationEngine<'a> {
    /// Prepare a run of the migration over `range`.
    ///
    /// Arguments
    /// -----------------
    /// * `lut`: Travel-time table, read-only for the lifetime of the engine.
    /// * `onsets`: Onset series of the run; every key must be present in `lut`.
    /// * `range`: Output epochs to migrate.
    /// * `params`: Sampling interval, aggregation and node chunk size.
    ///
    /// Return
    /// ----------
    /// * The engine, or [`QuakeScanError::UnknownKey`] if an onset key is absent
    ///   from the table. Table keys without an onset series are simply left out.
    /// * [`QuakeScanError::InvalidScanParameter`] if `params` breaks a builder rule.
    pub fn new(
        lut: &'a LookupTable,
        onsets: &'a OnsetSet,
        range: &TimeRange,
        params: &ScanParams,
    ) -> Result<Self, QuakeScanError> {
        params.validate()?;
        let mut keyed: Vec<(&'a StationPhaseKey, &'a OnsetSeries)> = onsets.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));

        if let Some((key, _)) = keyed.iter().find(|(key, _)| !lut.contains(key)) {
            return Err(QuakeScanError::UnknownKey((*key).clone()));
        }

        let unused = lut.len() - keyed.len();
        if unused > 0 {
            debug!(unused, "lookup table keys without onset series are excluded");
        }

        let node_count = lut.node_count();
        let mut shifts = Vec::with_capacity(keyed.len() * node_count);
        let mut channels = Vec::with_capacity(keyed.len());

        for (key, onset) in keyed {
            let field = lut.field(key)?;
            let dt = onset.sample_interval();
            let mut min_shift = i64::MAX;
            let mut max_shift = i64::MIN;
            for (node, &tt) in field.values().iter().enumerate() {
                let shift = (tt / dt).round();
                if shift > i32::MAX as f64 {
                    return Err(QuakeScanError::InvalidTravelTime {
                        key: key.clone(),
                        node,
                        value: tt,
                    });
                }
                let shift = shift as i32;
                min_shift = min_shift.min(shift as i64);
                max_shift = max_shift.max(shift as i64);
                shifts.push(shift);
            }
            channels.push(Channel {
                key,
                onset,
                offset: onset.fractional_index(range.start),
                step: params.sampling_interval / dt,
                min_shift,
                max_shift,
            });
        }

        let gaps = channels.iter().map(|_| AtomicUsize::new(0)).collect();

        Ok(MigrationEngine {
            grid: lut.grid(),
            channels,
            shifts,
            gaps,
            node_count,
            start: range.start,
            sampling_interval: params.sampling_interval,
            n_samples: range.n_samples(params.sampling_interval),
            aggregation: params.aggregation,
            node_chunk: params.node_chunk,
        })
    }

    pub fn grid(&self) -> &Grid {
        self.grid
    }

    #[inline]
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn node_chunk(&self) -> usize {
        self.node_chunk
    }

    /// Keys taking part in the run, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &StationPhaseKey> {
        self.channels.iter().map(|c| c.key)
    }

    /// Epoch of output time index `t`.
    pub fn time_of(&self, t: usize) -> Epoch {
        self.start + Duration::from_seconds(t as f64 * self.sampling_interval)
    }

    /// Number of time indices at which each key lacked full coverage so far.
    pub fn coverage_gaps(&self) -> Vec<(StationPhaseKey, usize)> {
        self.channels
            .iter()
            .zip(&self.gaps)
            .map(|(c, g)| (c.key.clone(), g.load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    fn coverage(&self, k: usize, t: usize) -> Coverage {
        let channel = &self.channels[k];
        let base = channel.base(t);
        let len = channel.onset.len() as i64;
        let lo = base + channel.min_shift;
        let hi = base + channel.max_shift;
        if hi < 0 || lo >= len {
            Coverage::None
        } else if lo < 0 || hi >= len {
            Coverage::Partial(base)
        } else {
            Coverage::Full(base)
        }
    }

    fn record_gap(&self, k: usize, t: usize) {
        if self.gaps[k].fetch_add(1, Ordering::Relaxed) == 0 {
            let warning = QuakeScanError::InsufficientCoverage {
                key: self.channels[k].key.clone(),
                time_index: t,
            };
            warn!(%warning, "key contributes zero where its onset series ends");
        }
    }

    /// Base sample of every key at `t`, `None` for keys without any overlap.
    fn bases(&self, t: usize) -> (Vec<Option<i64>>, usize) {
        let mut contributing = 0;
        let bases = (0..self.channels.len())
            .map(|k| match self.coverage(k, t) {
                Coverage::Full(base) => {
                    contributing += 1;
                    Some(base)
                }
                Coverage::Partial(base) => {
                    self.record_gap(k, t);
                    contributing += 1;
                    Some(base)
                }
                Coverage::None => {
                    self.record_gap(k, t);
                    None
                }
            })
            .collect();
        (bases, contributing)
    }

    /// Stack every contributing key into `out`, the nodes `first_node..first_node + out.len()`.
    #[inline]
    fn stack_chunk(&self, bases: &[Option<i64>], first_node: NodeIndex, out: &mut [f64], scale: f64) {
        for (k, channel) in self.channels.iter().enumerate() {
            let Some(base) = bases[k] else {
                continue;
            };
            let offset = k * self.node_count + first_node;
            let shifts = &self.shifts[offset..offset + out.len()];
            let values = channel.onset.values();
            let len = values.len() as i64;
            for (o, &s) in out.iter_mut().zip(shifts) {
                let idx = base + s as i64;
                if idx >= 0 && idx < len {
                    *o += values[idx as usize];
                }
            }
        }
        if scale != 1.0 {
            out.iter_mut().for_each(|o| *o *= scale);
        }
    }

    fn prepare(&self, t: usize, buffer: &mut Vec<f64>) -> Result<(Vec<Option<i64>>, usize, f64), QuakeScanError> {
        if t >= self.n_samples {
            return Err(QuakeScanError::InvalidScanParameter(format!(
                "time index {t} outside a run of {} samples",
                self.n_samples
            )));
        }
        let (bases, contributing) = self.bases(t);
        if contributing == 0 {
            return Err(QuakeScanError::EmptyReduction { time_index: t });
        }
        let scale = match self.aggregation {
            Aggregation::Sum => 1.0,
            Aggregation::StationNormalised => 1.0 / contributing as f64,
        };
        buffer.clear();
        buffer.resize(self.node_count, 0.0);
        Ok((bases, contributing, scale))
    }

    /// Migrate time index `t` into `buffer`, node chunks spread over the current rayon pool.
    ///
    /// Return
    /// ----------
    /// * The sample, or [`QuakeScanError::EmptyReduction`] when no key covers `t`.
    pub fn migrate_into(&self, t: usize, mut buffer: Vec<f64>) -> Result<CoalescenceSample, QuakeScanError> {
        let (bases, contributing, scale) = self.prepare(t, &mut buffer)?;
        buffer
            .par_chunks_mut(self.node_chunk)
            .enumerate()
            .for_each(|(i, out)| self.stack_chunk(&bases, i * self.node_chunk, out, scale));
        Ok(self.sample(t, buffer, contributing))
    }

    /// Same as [`migrate_into`](Self::migrate_into) on the calling thread only.
    pub fn migrate_serial_into(
        &self,
        t: usize,
        mut buffer: Vec<f64>,
    ) -> Result<CoalescenceSample, QuakeScanError> {
        let (bases, contributing, scale) = self.prepare(t, &mut buffer)?;
        buffer
            .chunks_mut(self.node_chunk)
            .enumerate()
            .for_each(|(i, out)| self.stack_chunk(&bases, i * self.node_chunk, out, scale));
        Ok(self.sample(t, buffer, contributing))
    }

    /// Migrate time index `t` into a freshly allocated sample.
    pub fn migrate(&self, t: usize) -> Result<CoalescenceSample, QuakeScanError> {
        self.migrate_into(t, Vec::with_capacity(self.node_count))
    }

    fn sample(&self, t: usize, values: Vec<f64>, contributing_keys: usize) -> CoalescenceSample {
        CoalescenceSample {
            time_index: t,
            time: self.time_of(t),
            values,
            contributing_keys,
        }
    }
}

#[cfg(test)]
mod migration_test {
    use nalgebra::Vector3;

    use super::*;
    use crate::lut::travel_time_source::PrecomputedTravelTimes;

    fn epoch() -> Epoch {
        Epoch::from_gregorian_utc_at_midnight(2021, 6, 15)
    }

    /// Three nodes on a line; station A at node 0, station B at node 2.
    fn line_lut() -> LookupTable {
        let grid = Grid::cartesian(Vector3::zeros(), 1.0, [3, 1, 1]).unwrap();
        let mut source = PrecomputedTravelTimes::new(grid.clone());
        source.insert(("A", "P").into(), vec![0.0, 1.0, 2.0]).unwrap();
        source.insert(("B", "P").into(), vec![2.0, 1.0, 0.0]).unwrap();
        let keys: Vec<StationPhaseKey> = source.keys().cloned().collect();
        LookupTable::build(&grid, &keys, &source).unwrap()
    }

    fn spike(len: usize, at: usize) -> Vec<f64> {
        let mut v = vec![0.0; len];
        v[at] = 1.0;
        v
    }

    fn onsets(a: Vec<f64>, b: Vec<f64>) -> OnsetSet {
        let mut set = OnsetSet::default();
        set.insert(("A", "P").into(), OnsetSeries::new(a, 1.0, epoch()).unwrap());
        set.insert(("B", "P").into(), OnsetSeries::new(b, 1.0, epoch()).unwrap());
        set
    }

    fn params() -> ScanParams {
        ScanParams::builder()
            .sampling_interval(1.0)
            .node_chunk(2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_stack_aligns_at_middle_node() {
        let lut = line_lut();
        // Both arrivals at sample 5: the middle node is 1 s from each station.
        let set = onsets(spike(10, 5), spike(10, 5));
        let range = TimeRange::from_samples(epoch(), 10, 1.0);
        let engine = MigrationEngine::new(&lut, &set, &range, &params()).unwrap();

        assert_eq!(engine.n_samples(), 10);
        let sample = engine.migrate(4).unwrap();
        assert_eq!(sample.values(), &[0.0, 2.0, 0.0]);
        assert_eq!(sample.contributing_keys(), 2);
        assert_eq!(sample.time(), epoch() + Duration::from_seconds(4.0));

        let serial = engine.migrate_serial_into(4, Vec::new()).unwrap();
        assert_eq!(serial, sample);
    }

    #[test]
    fn test_station_normalised_sum() {
        let lut = line_lut();
        let set = onsets(spike(10, 5), spike(10, 5));
        let range = TimeRange::from_samples(epoch(), 10, 1.0);
        let params = ScanParams::builder()
            .sampling_interval(1.0)
            .aggregation(Aggregation::StationNormalised)
            .build()
            .unwrap();
        let engine = MigrationEngine::new(&lut, &set, &range, &params).unwrap();
        assert_eq!(engine.migrate(4).unwrap().values(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_out_of_series_contributes_zero() {
        let lut = line_lut();
        let set = onsets(spike(6, 5), spike(4, 3));
        let range = TimeRange::from_samples(epoch(), 6, 1.0);
        let engine = MigrationEngine::new(&lut, &set, &range, &params()).unwrap();

        // At t = 5, A (6 samples) is queried at 5, 6 and 7: partial overlap.
        // B (4 samples) is queried at 7, 6 and 5: no overlap at all.
        let sample = engine.migrate(5).unwrap();
        assert_eq!(sample.contributing_keys(), 1);
        assert_eq!(sample.values(), &[1.0, 0.0, 0.0]);

        let expected: Vec<(StationPhaseKey, usize)> =
            vec![(("A", "P").into(), 1), (("B", "P").into(), 1)];
        assert_eq!(engine.coverage_gaps(), expected);

        // At t = 1 both keys are fully covered.
        engine.migrate(1).unwrap();
        assert_eq!(engine.coverage_gaps().len(), 2);
        assert_eq!(engine.coverage_gaps()[0].1, 1);
    }

    #[test]
    fn test_unknown_onset_key() {
        let lut = line_lut();
        let mut set = onsets(spike(4, 1), spike(4, 1));
        set.insert(
            ("C", "S").into(),
            OnsetSeries::new(vec![0.0; 4], 1.0, epoch()).unwrap(),
        );
        let range = TimeRange::from_samples(epoch(), 4, 1.0);
        let err = MigrationEngine::new(&lut, &set, &range, &params()).err();
        assert_eq!(err, Some(QuakeScanError::UnknownKey(("C", "S").into())));
    }

    #[test]
    fn test_missing_onsets_are_excluded_and_empty_is_reported() {
        let lut = line_lut();
        let set = OnsetSet::default();
        let range = TimeRange::from_samples(epoch(), 3, 1.0);
        let engine = MigrationEngine::new(&lut, &set, &range, &params()).unwrap();
        assert_eq!(engine.keys().count(), 0);
        assert_eq!(
            engine.migrate(0),
            Err(QuakeScanError::EmptyReduction { time_index: 0 })
        );
        assert!(matches!(
            engine.migrate(3),
            Err(QuakeScanError::InvalidScanParameter(_))
        ));
    }

    #[test]
    fn test_fractional_shift_rounds_to_nearest_sample() {
        let grid = Grid::cartesian(Vector3::zeros(), 1.0, [2, 1, 1]).unwrap();
        let mut source = PrecomputedTravelTimes::new(grid.clone());
        // 0.24 s → 0 samples of 0.5 s, 0.26 s → 1 sample.
        source.insert(("A", "P").into(), vec![0.24, 0.26]).unwrap();
        let lut = LookupTable::build(&grid, &[("A", "P").into()], &source).unwrap();

        let mut set = OnsetSet::default();
        set.insert(
            ("A", "P").into(),
            OnsetSeries::new(vec![1.0, 2.0, 3.0, 4.0], 0.5, epoch()).unwrap(),
        );
        let range = TimeRange::from_samples(epoch(), 4, 0.5);
        let params = ScanParams::builder().sampling_interval(0.5).build().unwrap();
        let engine = MigrationEngine::new(&lut, &set, &range, &params).unwrap();
        assert_eq!(engine.migrate(1).unwrap().values(), &[2.0, 3.0]);
    }

    #[test]
    fn test_node_values_ignore_chunking_and_key_order() {
        let lut = &*crate::unit_test_global::HOMOGENEOUS_LUT;
        let keys: Vec<StationPhaseKey> = lut.keys().cloned().collect();
        let series = |i: usize| {
            let values = (0..400).map(|s| ((s * (i + 3)) % 17) as f64 * 0.25).collect();
            OnsetSeries::new(values, 0.01, epoch()).unwrap()
        };

        let forward: OnsetSet = keys.iter().enumerate().map(|(i, k)| (k.clone(), series(i))).collect();
        let backward: OnsetSet = keys
            .iter()
            .enumerate()
            .rev()
            .map(|(i, k)| (k.clone(), series(i)))
            .collect();

        let range = TimeRange::from_samples(epoch(), 200, 0.01);
        let reference = {
            let params = ScanParams::builder().sampling_interval(0.01).build().unwrap();
            let engine = MigrationEngine::new(lut, &forward, &range, &params).unwrap();
            engine.migrate(120).unwrap()
        };

        for (chunk, set) in [(1, &forward), (7, &backward), (64, &backward)] {
            let params = ScanParams::builder()
                .sampling_interval(0.01)
                .node_chunk(chunk)
                .build()
                .unwrap();
            let engine = MigrationEngine::new(lut, set, &range, &params).unwrap();
            let sample = engine.migrate(120).unwrap();
            let bits = |s: &CoalescenceSample| s.values().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&sample), bits(&reference), "chunk {chunk}");
        }
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(epoch(), epoch() + Duration::from_seconds(2.0)).unwrap();
        assert_eq!(range.n_samples(0.5), 4);
        assert_eq!(range.n_samples(0.3), 7);
        assert_eq!(range.n_samples(0.4), 5);
        // 1.8 s is still inside [0, 2)
        assert_eq!(range.n_samples(0.6), 4);
        assert_eq!(range.n_samples(2.0), 1);
        assert_eq!(range.n_samples(3.0), 1);
        assert_eq!(TimeRange::from_samples(epoch(), 200, 0.01).n_samples(0.01), 200);
        assert_eq!(TimeRange::from_samples(epoch(), 7, 0.6).n_samples(0.6), 7);
        assert_eq!(TimeRange::new(epoch(), epoch()).unwrap().n_samples(0.5), 0);
        assert!(TimeRange::new(epoch(), epoch() - Duration::from_seconds(1.0)).is_err());
    }

    #[test]
    fn test_engine_rejects_unbuilt_params() {
        let lut = line_lut();
        let set = onsets(spike(4, 1), spike(4, 1));
        let range = TimeRange::from_samples(epoch(), 4, 1.0);

        let zero_chunk = ScanParams {
            node_chunk: 0,
            ..params()
        };
        assert!(matches!(
            MigrationEngine::new(&lut, &set, &range, &zero_chunk).err(),
            Some(QuakeScanError::InvalidScanParameter(_))
        ));

        let zero_dt = ScanParams {
            sampling_interval: 0.0,
            ..params()
        };
        assert!(matches!(
            MigrationEngine::new(&lut, &set, &range, &zero_dt).err(),
            Some(QuakeScanError::InvalidScanParameter(_))
        ));
    }
}
