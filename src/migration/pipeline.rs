//! # Streaming execution of a run
//!
//! A run turns every output time index into a [`CoalescenceSample`] and feeds
//! it to a [`CoalescenceScanner`], strictly in time order. Two decompositions
//! are available, selected by [`Partition`]:
//!
//! * [`Partition::Nodes`] – a producer thread migrates one time index at a
//!   time, node chunks in parallel, and hands the sample over a bounded
//!   channel of `pipeline_depth` slots. The consumer reduces it (again node
//!   chunks in parallel) and sends the node buffer back for reuse. At most
//!   `pipeline_depth + 2` node buffers are ever alive.
//! * [`Partition::Times`] – blocks of `time_block` time indices are migrated
//!   and reduced in parallel, one worker per time index, each with its own
//!   scratch buffer. Results are pushed to the scanner in time order.
//!
//! Both honour cooperative cancellation: `should_cancel` is polled after the
//! first completed work item, then on a wall-clock interval of
//! [`POLL_INTERVAL`]. Once it returns `true`, no new sample is pushed and the
//! samples completed so far are kept.
//!
//! Both produce bit-identical traces for the same inputs.
use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace};

use super::{MigrationEngine, Partition};
use crate::{
    progress::ScanProgress,
    quakescan_errors::QuakeScanError,
    scan::{reduce_serial, CoalescenceScanner, SampleMaximum},
};

/// Wall-clock interval between two calls of `should_cancel`.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Where the parallel work of a run is executed.
#[derive(Debug)]
pub enum Executor {
    /// The global rayon pool.
    Global,
    /// A dedicated pool with a fixed number of workers.
    Pool(ThreadPool),
}

impl Executor {
    /// `None` for the global pool, `Some(n)` for a dedicated pool of `n` workers.
    pub fn new(threads: Option<usize>) -> Result<Self, QuakeScanError> {
        match threads {
            None => Ok(Executor::Global),
            Some(n) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("quakescan-{i}"))
                    .build()?;
                Ok(Executor::Pool(pool))
            }
        }
    }

    pub fn current_num_threads(&self) -> usize {
        match self {
            Executor::Global => rayon::current_num_threads(),
            Executor::Pool(pool) => pool.current_num_threads(),
        }
    }

    /// Run `op` so that its rayon calls use this executor.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match self {
            Executor::Global => op(),
            Executor::Pool(pool) => pool.install(op),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub completed: usize,
    pub cancelled: bool,
}

/// Settings of one run of the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub partition: Partition,
    pub pipeline_depth: usize,
    pub time_block: usize,
}

/// Drive every time index of `engine` through `scanner`.
///
/// Arguments
/// -----------------
/// * `engine`: Prepared migration of the run.
/// * `scanner`: Receives the samples in time order.
/// * `executor`: Rayon pool of the parallel work.
/// * `config`: Decomposition and buffering of the run.
/// * `should_cancel`: Polled every [`POLL_INTERVAL`]; `true` stops the run.
///
/// Return
/// ----------
/// * The number of samples pushed to `scanner` and whether the run was cancelled.
///   Samples without any contributing key are pushed as empty; any other error aborts.
/// * [`QuakeScanError::InvalidScanParameter`] for a zero `pipeline_depth` or `time_block`.
pub fn run<F>(
    engine: &MigrationEngine<'_>,
    scanner: &mut CoalescenceScanner,
    executor: &Executor,
    config: PipelineConfig,
    should_cancel: F,
) -> Result<PipelineOutcome, QuakeScanError>
where
    F: FnMut() -> bool,
{
    if config.pipeline_depth == 0 || config.time_block == 0 {
        return Err(QuakeScanError::InvalidScanParameter(format!(
            "pipeline_depth ({}) and time_block ({}) must be >= 1",
            config.pipeline_depth, config.time_block
        )));
    }
    debug!(
        samples = engine.n_samples(),
        nodes = engine.node_count(),
        keys = engine.keys().count(),
        partition = ?config.partition,
        workers = executor.current_num_threads(),
        "starting migration run"
    );
    let mut progress = ScanProgress::new(engine.n_samples());
    let outcome = match config.partition {
        Partition::Nodes => run_node_parallel(
            engine,
            scanner,
            executor,
            config.pipeline_depth,
            should_cancel,
            &mut progress,
        ),
        Partition::Times => run_time_parallel(
            engine,
            scanner,
            executor,
            config.time_block,
            should_cancel,
            &mut progress,
        ),
    };
    progress.finish();
    outcome
}

fn run_node_parallel<F>(
    engine: &MigrationEngine<'_>,
    scanner: &mut CoalescenceScanner,
    executor: &Executor,
    pipeline_depth: usize,
    mut should_cancel: F,
    progress: &mut ScanProgress,
) -> Result<PipelineOutcome, QuakeScanError>
where
    F: FnMut() -> bool,
{
    let n_samples = engine.n_samples();
    let mut completed = 0;
    let mut cancelled = false;
    let mut failure = None;
    let mut last_poll: Option<Instant> = None;

    thread::scope(|scope| {
        let (sample_tx, sample_rx) = mpsc::sync_channel(pipeline_depth);
        let (recycle_tx, recycle_rx) = mpsc::channel::<Vec<f64>>();

        scope.spawn(move || {
            for t in 0..n_samples {
                let buffer = recycle_rx.try_recv().unwrap_or_default();
                let sample = executor.install(|| engine.migrate_into(t, buffer));
                if sample_tx.send((t, sample)).is_err() {
                    trace!(time_index = t, "scanner hung up, producer stops");
                    break;
                }
            }
        });

        for (t, sample) in sample_rx.iter() {
            match sample {
                Ok(sample) => {
                    executor.install(|| scanner.consume(&sample));
                    // The producer may already be gone.
                    let _ = recycle_tx.send(sample.into_buffer());
                }
                Err(QuakeScanError::EmptyReduction { time_index }) => {
                    debug!(time_index, "no key contributes, sample left undefined");
                    scanner.push_empty(time_index, engine.time_of(time_index));
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
            completed = t + 1;
            progress.inc(1);

            if last_poll.map_or(true, |p| p.elapsed() >= POLL_INTERVAL) {
                last_poll = Some(Instant::now());
                if should_cancel() {
                    cancelled = completed < n_samples;
                    break;
                }
            }
        }
        // Dropping the receiver unblocks a producer waiting on a full channel.
        drop(sample_rx);
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(PipelineOutcome {
            completed,
            cancelled,
        }),
    }
}

fn run_time_parallel<F>(
    engine: &MigrationEngine<'_>,
    scanner: &mut CoalescenceScanner,
    executor: &Executor,
    time_block: usize,
    mut should_cancel: F,
    progress: &mut ScanProgress,
) -> Result<PipelineOutcome, QuakeScanError>
where
    F: FnMut() -> bool,
{
    let n_samples = engine.n_samples();
    let node_chunk = scanner.node_chunk();
    let mut completed = 0;
    let mut last_poll: Option<Instant> = None;

    while completed < n_samples {
        let end = (completed + time_block).min(n_samples);

        let block: Vec<Result<Option<SampleMaximum>, QuakeScanError>> = executor.install(|| {
            (completed..end)
                .into_par_iter()
                .map_init(Vec::new, |buffer, t| {
                    let sample = engine.migrate_serial_into(t, std::mem::take(buffer));
                    match sample {
                        Ok(sample) => {
                            let maximum = reduce_serial(sample.values(), node_chunk);
                            *buffer = sample.into_buffer();
                            Ok(maximum)
                        }
                        Err(QuakeScanError::EmptyReduction { .. }) => Ok(None),
                        Err(err) => Err(err),
                    }
                })
                .collect()
        });

        for (t, maximum) in (completed..end).zip(block) {
            let maximum = maximum?;
            if maximum.is_none() {
                debug!(time_index = t, "no key contributes, sample left undefined");
            }
            scanner.push_reduced(t, engine.time_of(t), maximum);
        }
        progress.inc(end - completed);
        completed = end;

        if completed < n_samples && last_poll.map_or(true, |p| p.elapsed() >= POLL_INTERVAL) {
            last_poll = Some(Instant::now());
            if should_cancel() {
                return Ok(PipelineOutcome {
                    completed,
                    cancelled: true,
                });
            }
        }
    }

    Ok(PipelineOutcome {
        completed,
        cancelled: false,
    })
}

#[cfg(test)]
mod pipeline_test {
    use hifitime::Epoch;
    use nalgebra::Vector3;

    use super::*;
    use crate::{
        grid::Grid,
        lut::{travel_time_source::PrecomputedTravelTimes, LookupTable, StationPhaseKey},
        migration::TimeRange,
        onset::{OnsetSeries, OnsetSet},
        scan::background::BackgroundStatistic,
        scan_params::ScanParams,
    };

    fn scenario() -> (LookupTable, OnsetSet, Epoch) {
        let grid = Grid::cartesian(Vector3::zeros(), 1.0, [5, 1, 1]).unwrap();
        let mut source = PrecomputedTravelTimes::new(grid.clone());
        source.insert(("A", "P").into(), vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        source.insert(("B", "P").into(), vec![4.0, 3.0, 2.0, 1.0, 0.0]).unwrap();
        let keys: Vec<StationPhaseKey> = source.keys().cloned().collect();
        let lut = LookupTable::build(&grid, &keys, &source).unwrap();

        let start = Epoch::from_gregorian_utc_at_midnight(2022, 2, 2);
        let ramp = |offset: usize| (0..30).map(|i| ((i + offset) % 7) as f64).collect();
        let mut onsets = OnsetSet::default();
        onsets.insert(("A", "P").into(), OnsetSeries::new(ramp(0), 1.0, start).unwrap());
        onsets.insert(("B", "P").into(), OnsetSeries::new(ramp(3), 1.0, start).unwrap());
        (lut, onsets, start)
    }

    fn run_with(partition: Partition, threads: Option<usize>) -> (usize, Vec<f64>, Vec<Option<usize>>) {
        let (lut, onsets, start) = scenario();
        let params = ScanParams::builder()
            .sampling_interval(1.0)
            .node_chunk(2)
            .time_block(4)
            .build()
            .unwrap();
        let range = TimeRange::from_samples(start, 30, 1.0);
        let engine = MigrationEngine::new(&lut, &onsets, &range, &params).unwrap();
        let mut scanner = CoalescenceScanner::new(lut.grid().clone(), BackgroundStatistic::Rms, 8, 2);
        let executor = Executor::new(threads).unwrap();
        let config = PipelineConfig {
            partition,
            pipeline_depth: 1,
            time_block: 4,
        };
        let outcome = run(&engine, &mut scanner, &executor, config, || false).unwrap();
        assert!(!outcome.cancelled);
        let (detection, location) = scanner.into_traces();
        (outcome.completed, detection.values(), location.nodes())
    }

    #[test]
    fn test_partitions_agree() {
        let (n_nodes, values_nodes, loc_nodes) = run_with(Partition::Nodes, Some(3));
        let (n_times, values_times, loc_times) = run_with(Partition::Times, Some(2));
        assert_eq!(n_nodes, 30);
        assert_eq!(n_times, 30);
        assert_eq!(loc_nodes, loc_times);
        for (a, b) in values_nodes.iter().zip(&values_times) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_cancel_keeps_completed_prefix() {
        let (lut, onsets, start) = scenario();
        let params = ScanParams::builder().sampling_interval(1.0).build().unwrap();
        let range = TimeRange::from_samples(start, 30, 1.0);
        let engine = MigrationEngine::new(&lut, &onsets, &range, &params).unwrap();
        let executor = Executor::new(Some(1)).unwrap();

        for partition in [Partition::Nodes, Partition::Times] {
            let mut scanner = CoalescenceScanner::new(lut.grid().clone(), BackgroundStatistic::Median, 4, 8);
            let config = PipelineConfig {
                partition,
                pipeline_depth: 2,
                time_block: 4,
            };
            let mut polls = 0;
            let outcome = run(&engine, &mut scanner, &executor, config, || {
                polls += 1;
                true
            })
            .unwrap();
            assert!(outcome.cancelled, "{partition:?}");
            assert_eq!(polls, 1);
            let expected = match partition {
                Partition::Nodes => 1,
                Partition::Times => 4,
            };
            assert_eq!(outcome.completed, expected);
            assert_eq!(scanner.len(), expected);
        }
    }

    #[test]
    fn test_zero_sized_blocks_are_rejected() {
        let (lut, onsets, start) = scenario();
        let params = ScanParams::builder().sampling_interval(1.0).build().unwrap();
        let range = TimeRange::from_samples(start, 30, 1.0);
        let engine = MigrationEngine::new(&lut, &onsets, &range, &params).unwrap();
        let executor = Executor::new(Some(1)).unwrap();

        for (partition, pipeline_depth, time_block) in
            [(Partition::Times, 2, 0), (Partition::Nodes, 0, 4)]
        {
            let mut scanner = CoalescenceScanner::new(lut.grid().clone(), BackgroundStatistic::Median, 4, 8);
            let config = PipelineConfig {
                partition,
                pipeline_depth,
                time_block,
            };
            assert!(matches!(
                run(&engine, &mut scanner, &executor, config, || false),
                Err(QuakeScanError::InvalidScanParameter(_))
            ));
            assert_eq!(scanner.len(), 0);
        }
    }
}
