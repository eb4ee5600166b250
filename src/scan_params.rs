//! # Scan parameters
//!
//! This module defines the [`ScanParams`] configuration struct and its
//! validating builder. One `ScanParams` drives a whole run of
//! [`QuakeScan`](crate::quakescan::QuakeScan): output sampling, the stacking
//! rule, the background statistic of the normalised trace, the parallel
//! decomposition, and the decimation used for the coarse detection pass.
//!
//! ## Example
//!
//! ```rust,no_run
//! use quakescan::scan_params::ScanParams;
//! use quakescan::migration::{Aggregation, Partition};
//! use quakescan::scan::background::BackgroundStatistic;
//!
//! let params = ScanParams::builder()
//!     .sampling_interval(0.02)
//!     .aggregation(Aggregation::StationNormalised)
//!     .background(BackgroundStatistic::Median)
//!     .background_window(500)
//!     .partition(Partition::Nodes)
//!     .threads(Some(8))
//!     .decimation([2, 2, 2])
//!     .build()
//!     .unwrap();
//! ```
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        Seconds, DEFAULT_BACKGROUND_WINDOW, DEFAULT_NODE_CHUNK, DEFAULT_PIPELINE_DEPTH,
        DEFAULT_TIME_BLOCK,
    },
    migration::{Aggregation, Partition},
    quakescan_errors::QuakeScanError,
    scan::background::BackgroundStatistic,
};

/// Configuration of a coalescence scan.
///
/// Fields
/// -----------------
/// * `sampling_interval` – spacing of the output traces, in seconds.
/// * `aggregation` – per-node stacking rule across station/phase keys.
/// * `background` – statistic used to normalise the maximum coalescence.
/// * `background_window` – trailing window (output samples) of `background`.
/// * `partition` – parallel axis: node ranges or time indices.
/// * `node_chunk` – nodes handled by one task when splitting a sample.
/// * `time_block` – time indices scheduled together in time-parallel mode.
/// * `pipeline_depth` – samples buffered between migration and scanner.
/// * `threads` – `None` to use the global rayon pool, `Some(n)` for a dedicated one.
/// * `decimation` – per-axis factor of the coarse table used by `detect`.
///
/// Defaults
/// -----------------
/// * `sampling_interval`: 0.01 s
/// * `aggregation`: [`Aggregation::Sum`]
/// * `background`: [`BackgroundStatistic::Median`]
/// * `background_window`: 100
/// * `partition`: [`Partition::Nodes`]
/// * `node_chunk`: 4096
/// * `time_block`: 64
/// * `pipeline_depth`: 2
/// * `threads`: `None`
/// * `decimation`: `[1, 1, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    pub sampling_interval: Seconds,
    pub aggregation: Aggregation,
    pub background: BackgroundStatistic,
    pub background_window: usize,
    pub partition: Partition,
    pub node_chunk: usize,
    pub time_block: usize,
    pub pipeline_depth: usize,
    pub threads: Option<usize>,
    pub decimation: [usize; 3],
}

impl ScanParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ScanParamsBuilder {
        ScanParamsBuilder::new()
    }

    /// Check the rules enforced by [`ScanParamsBuilder::build`].
    ///
    /// Also run by [`QuakeScan::new`](crate::quakescan::QuakeScan::new) and
    /// [`MigrationEngine::new`](crate::migration::MigrationEngine::new), for
    /// parameters assembled field by field or deserialized.
    pub fn validate(&self) -> Result<(), QuakeScanError> {
        if !self.sampling_interval.is_finite() || self.sampling_interval <= 0.0 {
            return Err(QuakeScanError::InvalidScanParameter(
                "sampling_interval must be > 0".into(),
            ));
        }
        if self.background_window == 0 {
            return Err(QuakeScanError::InvalidScanParameter(
                "background_window must be >= 1".into(),
            ));
        }
        if self.node_chunk == 0 {
            return Err(QuakeScanError::InvalidScanParameter(
                "node_chunk must be >= 1".into(),
            ));
        }
        if self.time_block == 0 {
            return Err(QuakeScanError::InvalidScanParameter(
                "time_block must be >= 1".into(),
            ));
        }
        if self.pipeline_depth == 0 {
            return Err(QuakeScanError::InvalidScanParameter(
                "pipeline_depth must be >= 1".into(),
            ));
        }
        if self.threads == Some(0) {
            return Err(QuakeScanError::InvalidScanParameter(
                "threads must be >= 1".into(),
            ));
        }
        if self.decimation.iter().any(|&f| f == 0) {
            return Err(QuakeScanError::InvalidScanParameter(
                "decimation factors must be >= 1".into(),
            ));
        }

        Ok(())
    }

    /// `true` when `detect` runs on a decimated table.
    pub fn is_decimated(&self) -> bool {
        self.decimation != [1, 1, 1]
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        ScanParams {
            sampling_interval: 0.01,
            aggregation: Aggregation::Sum,
            background: BackgroundStatistic::Median,
            background_window: DEFAULT_BACKGROUND_WINDOW,
            partition: Partition::Nodes,
            node_chunk: DEFAULT_NODE_CHUNK,
            time_block: DEFAULT_TIME_BLOCK,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            threads: None,
            decimation: [1, 1, 1],
        }
    }
}

/// Builder for [`ScanParams`], with validation.
#[derive(Debug, Clone)]
pub struct ScanParamsBuilder {
    params: ScanParams,
}

impl Default for ScanParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: ScanParams::default(),
        }
    }

    pub fn sampling_interval(mut self, v: Seconds) -> Self {
        self.params.sampling_interval = v;
        self
    }
    pub fn aggregation(mut self, v: Aggregation) -> Self {
        self.params.aggregation = v;
        self
    }
    pub fn background(mut self, v: BackgroundStatistic) -> Self {
        self.params.background = v;
        self
    }
    pub fn background_window(mut self, v: usize) -> Self {
        self.params.background_window = v;
        self
    }
    pub fn partition(mut self, v: Partition) -> Self {
        self.params.partition = v;
        self
    }
    pub fn node_chunk(mut self, v: usize) -> Self {
        self.params.node_chunk = v;
        self
    }
    pub fn time_block(mut self, v: usize) -> Self {
        self.params.time_block = v;
        self
    }
    pub fn pipeline_depth(mut self, v: usize) -> Self {
        self.params.pipeline_depth = v;
        self
    }
    pub fn threads(mut self, v: Option<usize>) -> Self {
        self.params.threads = v;
        self
    }
    pub fn decimation(mut self, v: [usize; 3]) -> Self {
        self.params.decimation = v;
        self
    }

    /// Finalize the builder and produce a [`ScanParams`] instance.
    ///
    /// Validation rules
    /// -----------------
    /// * `sampling_interval` finite and `> 0`.
    /// * `background_window`, `node_chunk`, `time_block`, `pipeline_depth` `≥ 1`.
    /// * `threads`, when given, `≥ 1`.
    /// * every `decimation` factor `≥ 1`.
    ///
    /// Returns
    /// -----------------
    /// * `Ok(ScanParams)`, or [`QuakeScanError::InvalidScanParameter`] naming the rule that failed.
    pub fn build(self) -> Result<ScanParams, QuakeScanError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for ScanParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let threads = match self.threads {
            Some(n) => n.to_string(),
            None => "global".to_string(),
        };
        if f.alternate() {
            const PARAM_COL: usize = 40;
            writeln!(f, "Coalescence Scan Parameters")?;
            writeln!(f, "---------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            line!(
                "sampling_interval = {:.4} s",
                self.sampling_interval,
                "Output trace spacing"
            )?;
            line!(
                "aggregation       = {:?}",
                self.aggregation,
                "Stacking rule across keys"
            )?;
            line!(
                "background        = {:?}",
                self.background,
                "Normalisation statistic"
            )?;
            line!(
                "background_window = {}",
                self.background_window,
                "Trailing window in samples"
            )?;
            line!(
                "partition         = {:?}",
                self.partition,
                "Parallel decomposition axis"
            )?;
            line!(
                "node_chunk        = {}",
                self.node_chunk,
                "Nodes per parallel task"
            )?;
            line!(
                "time_block        = {}",
                self.time_block,
                "Time indices per parallel block"
            )?;
            line!(
                "pipeline_depth    = {}",
                self.pipeline_depth,
                "Samples buffered before the scanner"
            )?;
            line!("threads           = {}", threads, "Worker threads")?;
            line!(
                "decimation        = {:?}",
                self.decimation,
                "Coarse detection grid factor"
            )?;
            Ok(())
        } else {
            write!(
                f,
                "ScanParams(dt={:.4}s, aggregation={:?}, background={:?}/{}, partition={:?}, threads={}, decimation={:?})",
                self.sampling_interval,
                self.aggregation,
                self.background,
                self.background_window,
                self.partition,
                threads,
                self.decimation,
            )
        }
    }
}
