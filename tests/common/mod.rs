#![allow(dead_code)]

use approx::assert_relative_eq;
use hifitime::Epoch;
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quakescan::{
    grid::Grid,
    lut::{
        travel_time_source::{HomogeneousVelocity, PrecomputedTravelTimes},
        LookupTable, StationPhaseKey,
    },
    migration::TimeRange,
    onset::{OnsetSeries, OnsetSet},
    scan::ScanResult,
};

pub fn epoch0() -> Epoch {
    Epoch::from_gregorian_utc_at_midnight(2019, 8, 24)
}

/// Unit spike at `at`, zero elsewhere.
pub fn spike(len: usize, at: usize) -> Vec<f64> {
    let mut values = vec![0.0; len];
    values[at] = 1.0;
    values
}

pub fn onset(values: Vec<f64>, dt: f64) -> OnsetSeries {
    OnsetSeries::new(values, dt, epoch0()).unwrap()
}

/// Synthetic two-station scenario with a single source node.
pub struct Impulse {
    pub lut: LookupTable,
    pub onsets: OnsetSet,
    pub range: TimeRange,
    pub source_node: usize,
}

/// Two stations on a 9-node line, source at node 4, `dt = 1 s`.
///
/// Travel times to node `n` are `|n - 4|` for A and `5 + 2|n - 4|` for B, so
/// only node 4 aligns the spikes of A (sample 10) and B (sample 15), at t = 10.
pub fn impulse_line() -> Impulse {
    let grid = Grid::cartesian(Vector3::zeros(), 1.0, [9, 1, 1]).unwrap();
    let d = |n: usize| (n as f64 - 4.0).abs();
    let mut source = PrecomputedTravelTimes::new(grid.clone());
    source
        .insert(("A", "P").into(), (0..9).map(d).collect())
        .unwrap();
    source
        .insert(("B", "P").into(), (0..9).map(|n| 5.0 + 2.0 * d(n)).collect())
        .unwrap();
    let keys: Vec<StationPhaseKey> = source.keys().cloned().collect();
    let lut = LookupTable::build(&grid, &keys, &source).unwrap();

    let mut onsets = OnsetSet::default();
    onsets.insert(("A", "P").into(), onset(spike(40, 10), 1.0));
    onsets.insert(("B", "P").into(), onset(spike(40, 15), 1.0));

    Impulse {
        lut,
        onsets,
        range: TimeRange::from_samples(epoch0(), 30, 1.0),
        source_node: 4,
    }
}

/// Same spikes on a 5 × 5 × 1 plane, source at (2, 2, 0), Manhattan travel times.
///
/// The source sits on a node retained by `decimate([2, 2, 1])`.
pub fn impulse_plane() -> Impulse {
    let grid = Grid::cartesian(Vector3::new(-200.0, -200.0, 0.0), 100.0, [5, 5, 1]).unwrap();
    let dist: Vec<f64> = grid
        .iter_ijk()
        .map(|[i, j, _]| ((i as f64) - 2.0).abs() + ((j as f64) - 2.0).abs())
        .collect();
    let mut source = PrecomputedTravelTimes::new(grid.clone());
    source.insert(("A", "P").into(), dist.clone()).unwrap();
    source
        .insert(("B", "P").into(), dist.iter().map(|d| 5.0 + 2.0 * d).collect())
        .unwrap();
    let keys: Vec<StationPhaseKey> = source.keys().cloned().collect();
    let lut = LookupTable::build(&grid, &keys, &source).unwrap();

    let mut onsets = OnsetSet::default();
    onsets.insert(("A", "P").into(), onset(spike(40, 10), 1.0));
    onsets.insert(("B", "P").into(), onset(spike(40, 15), 1.0));

    let source_node = grid.node_index(2, 2, 0).unwrap();
    Impulse {
        lut,
        onsets,
        range: TimeRange::from_samples(epoch0(), 30, 1.0),
        source_node,
    }
}

/// Homogeneous medium with `n_stations` random surface stations, P and S phases,
/// and random onset series of `n_onset` samples at 0.01 s.
pub fn random_scenario(seed: u64, node_count: [usize; 3], n_stations: usize, n_onset: usize) -> (LookupTable, OnsetSet) {
    let mut rng = StdRng::seed_from_u64(seed);
    let spacing = 250.0;
    let grid = Grid::cartesian(Vector3::zeros(), spacing, node_count).unwrap();
    let extent = |axis: usize| (node_count[axis] - 1) as f64 * spacing;

    let mut model = HomogeneousVelocity::new(grid.clone());
    for s in 0..n_stations {
        let position = Point3::new(
            rng.random_range(0.0..=extent(0)),
            rng.random_range(0.0..=extent(1)),
            0.0,
        );
        model = model.with_station(format!("ST{s:02}"), position);
    }
    let model = model
        .with_phase("P", 5500.0)
        .unwrap()
        .with_phase("S", 3200.0)
        .unwrap();
    let keys = model.keys();
    let lut = LookupTable::build(&grid, &keys, &model).unwrap();

    let onsets = keys
        .into_iter()
        .map(|key| {
            let values = (0..n_onset).map(|_| rng.random_range(0.0..3.0)).collect();
            (key, onset(values, 0.01))
        })
        .collect();
    (lut, onsets)
}

/// Same onset series inserted in reverse key order.
pub fn reversed(onsets: &OnsetSet) -> OnsetSet {
    let mut keys: Vec<&StationPhaseKey> = onsets.keys().collect();
    keys.sort();
    let mut out = OnsetSet::default();
    for key in keys.into_iter().rev() {
        out.insert(key.clone(), onsets[key].clone());
    }
    out
}

/// Traces agree: same length and nodes, maxima within `epsilon`.
pub fn assert_scans_close(actual: &ScanResult, expected: &ScanResult, epsilon: f64) {
    assert_eq!(actual.detection.len(), expected.detection.len());
    assert_eq!(actual.location.nodes(), expected.location.nodes());
    for (a, e) in actual.detection.iter().zip(expected.detection.iter()) {
        assert_eq!(a.time_index, e.time_index);
        if e.value.is_nan() {
            assert!(a.value.is_nan());
        } else {
            assert_relative_eq!(a.value, e.value, epsilon = epsilon);
        }
    }
}
