//! # QuakeScan: coarse detection and fine location over one lookup table
//!
//! [`QuakeScan`] ties together a shared, read-only [`LookupTable`], the
//! [`ScanParams`] of the runs and the worker pool executing them:
//!
//! 1. **Detection** ([`detect`](QuakeScan::detect)) scans the decimated table
//!    (built on first use and cached in a [`OnceCell`]) to produce a cheap
//!    detection trace over long periods.
//! 2. **Location** ([`locate`](QuakeScan::locate)) scans the full-resolution
//!    table, typically over a short window around a detection.
//!
//! With `decimation = [1, 1, 1]` both passes use the full table.
//!
//! ## Typical usage
//!
//! ```rust, no_run
//! use std::sync::Arc;
//!
//! use camino::Utf8Path;
//! use hifitime::{Duration, Epoch};
//! use quakescan::{
//!     grid::Grid, lut::LookupTable, migration::TimeRange, onset::OnsetSet,
//!     quakescan::QuakeScan, scan_params::ScanParams,
//! };
//!
//! let lut = LookupTable::read(Utf8Path::new("model.lut")).unwrap();
//! let params = ScanParams::builder()
//!     .sampling_interval(0.02)
//!     .decimation([2, 2, 2])
//!     .build()
//!     .unwrap();
//! let scan = QuakeScan::new(Arc::new(lut), params).unwrap();
//!
//! let onsets = OnsetSet::default(); // filled by the waveform stage
//! let start = Epoch::from_gregorian_utc_at_midnight(2024, 1, 1);
//! let range = TimeRange::new(start, start + Duration::from_seconds(60.0)).unwrap();
//!
//! let detection = scan.detect(&onsets, &range).unwrap();
//! let location = scan.locate(&onsets, &range).unwrap();
//! ```
//!
//! ## See also
//! ------------
//! * [`MigrationEngine`] – Stacking of the onset series.
//! * [`pipeline`] – Streaming execution and cancellation.
//! * [`CoalescenceScanner`] – Reduction into traces.
use std::{collections::BTreeMap, sync::Arc};

use camino::Utf8Path;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    grid::Grid,
    lut::LookupTable,
    migration::{
        pipeline::{self, Executor, PipelineConfig},
        MigrationEngine, TimeRange,
    },
    onset::OnsetSet,
    quakescan_errors::QuakeScanError,
    scan::{CoalescenceScanner, ScanReport, ScanResult},
    scan_params::ScanParams,
};

#[derive(Debug)]
pub struct QuakeScan {
    lut: Arc<LookupTable>,
    params: ScanParams,
    coarse_lut: OnceCell<LookupTable>,
    executor: Executor,
}

impl QuakeScan {
    /// Construct a new [`QuakeScan`].
    ///
    /// The coarse table is **not** built yet; it is decimated the first time
    /// [`get_coarse_lut`](QuakeScan::get_coarse_lut) or [`detect`](QuakeScan::detect) is called.
    ///
    /// Arguments
    /// -----------------
    /// * `lut`: Full-resolution table, shared read-only.
    /// * `params`: Parameters of every run.
    ///
    /// Return
    /// ----------
    /// * The façade, or [`QuakeScanError::ThreadPool`] if the dedicated pool cannot be built.
    pub fn new(lut: Arc<LookupTable>, params: ScanParams) -> Result<Self, QuakeScanError> {
        params.validate()?;
        let executor = Executor::new(params.threads)?;
        Ok(QuakeScan {
            lut,
            params,
            coarse_lut: OnceCell::new(),
            executor,
        })
    }

    /// Load the table persisted at `path`, checking it against `grid`.
    pub fn from_file(path: &Utf8Path, grid: &Grid, params: ScanParams) -> Result<Self, QuakeScanError> {
        let lut = LookupTable::load(path, grid)?;
        Self::new(Arc::new(lut), params)
    }

    pub fn lut(&self) -> &LookupTable {
        &self.lut
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    /// Get the lazily-built table of the detection pass.
    ///
    /// Return
    /// ----------
    /// * The full table when `params.decimation` is `[1, 1, 1]`, the cached decimated one otherwise.
    pub fn get_coarse_lut(&self) -> Result<&LookupTable, QuakeScanError> {
        if !self.params.is_decimated() {
            return Ok(&self.lut);
        }
        self.coarse_lut
            .get_or_try_init(|| self.lut.decimate(self.params.decimation))
    }

    /// Scan `range` on the coarse table.
    pub fn detect(&self, onsets: &OnsetSet, range: &TimeRange) -> Result<ScanResult, QuakeScanError> {
        self.detect_with_cancel(onsets, range, || false)
    }

    /// Cancellable [`detect`](QuakeScan::detect); see [`pipeline::run`] for the polling.
    pub fn detect_with_cancel<F>(
        &self,
        onsets: &OnsetSet,
        range: &TimeRange,
        should_cancel: F,
    ) -> Result<ScanResult, QuakeScanError>
    where
        F: FnMut() -> bool,
    {
        let lut = self.get_coarse_lut()?;
        self.scan_with_cancel(lut, onsets, range, should_cancel)
    }

    /// Scan `range` on the full-resolution table.
    pub fn locate(&self, onsets: &OnsetSet, range: &TimeRange) -> Result<ScanResult, QuakeScanError> {
        self.locate_with_cancel(onsets, range, || false)
    }

    pub fn locate_with_cancel<F>(
        &self,
        onsets: &OnsetSet,
        range: &TimeRange,
        should_cancel: F,
    ) -> Result<ScanResult, QuakeScanError>
    where
        F: FnMut() -> bool,
    {
        self.scan_with_cancel(&self.lut, onsets, range, should_cancel)
    }

    /// Run one scan of `range` over an arbitrary table with the parameters of `self`.
    ///
    /// Arguments
    /// -----------------
    /// * `lut`: Table to migrate through.
    /// * `onsets`: Onset series; every key must be present in `lut`.
    /// * `range`: Output epochs.
    /// * `should_cancel`: Polled between samples; `true` stops the scan.
    ///
    /// Return
    /// ----------
    /// * The traces of the completed samples and a [`ScanReport`]. A cancelled
    ///   scan returns the samples completed before the cancellation.
    pub fn scan_with_cancel<F>(
        &self,
        lut: &LookupTable,
        onsets: &OnsetSet,
        range: &TimeRange,
        should_cancel: F,
    ) -> Result<ScanResult, QuakeScanError>
    where
        F: FnMut() -> bool,
    {
        let engine = MigrationEngine::new(lut, onsets, range, &self.params)?;
        let mut scanner = CoalescenceScanner::new(
            lut.grid().clone(),
            self.params.background,
            self.params.background_window,
            self.params.node_chunk,
        );
        info!(
            samples = engine.n_samples(),
            keys = engine.keys().count(),
            nodes = engine.node_count(),
            decimation = ?lut.decimation(),
            "coalescence scan started"
        );

        let config = PipelineConfig {
            partition: self.params.partition,
            pipeline_depth: self.params.pipeline_depth,
            time_block: self.params.time_block,
        };
        let outcome = pipeline::run(&engine, &mut scanner, &self.executor, config, should_cancel)?;

        let coverage_gaps: BTreeMap<_, _> = engine.coverage_gaps().into_iter().collect();
        let report = ScanReport {
            requested: engine.n_samples(),
            completed: outcome.completed,
            cancelled: outcome.cancelled,
            empty_samples: scanner.empty_samples(),
            keys: engine.keys().count(),
            coverage_gaps,
        };

        if report.cancelled {
            warn!(
                completed = report.completed,
                requested = report.requested,
                "coalescence scan cancelled"
            );
        } else {
            info!(
                completed = report.completed,
                empty = report.empty_samples,
                "coalescence scan finished"
            );
        }
        if report.empty_samples > 0 {
            warn!(
                empty = report.empty_samples,
                completed = report.completed,
                "samples without any contributing key left undefined"
            );
        }
        if !report.coverage_gaps.is_empty() {
            debug!(keys = report.coverage_gaps.len(), "keys with partial coverage");
        }

        let (detection, location) = scanner.into_traces();
        Ok(ScanResult {
            grid: lut.grid().clone(),
            decimation: lut.decimation(),
            detection,
            location,
            report,
        })
    }
}
