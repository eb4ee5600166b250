use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hifitime::Epoch;
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quakescan::{
    grid::Grid,
    lut::{travel_time_source::HomogeneousVelocity, LookupTable},
    migration::{MigrationEngine, TimeRange},
    onset::{OnsetSeries, OnsetSet},
    scan_params::ScanParams,
};

const DT: f64 = 0.01;

/// Homogeneous volume of `node_count` nodes with `n_stations` surface stations (P and S).
fn fixture(rng: &mut StdRng, node_count: [usize; 3], n_stations: usize) -> (LookupTable, OnsetSet, Epoch) {
    let spacing = 500.0;
    let grid = Grid::cartesian(Vector3::zeros(), spacing, node_count).unwrap();
    let mut model = HomogeneousVelocity::new(grid.clone());
    for s in 0..n_stations {
        let position = Point3::new(
            rng.random_range(0.0..(node_count[0] - 1) as f64 * spacing),
            rng.random_range(0.0..(node_count[1] - 1) as f64 * spacing),
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

    let start = Epoch::from_gregorian_utc_at_midnight(2020, 1, 1);
    let onsets = keys
        .into_iter()
        .map(|key| {
            let values = (0..2_000).map(|_| rng.random::<f64>()).collect();
            (key, OnsetSeries::new(values, DT, start).unwrap())
        })
        .collect();
    (lut, onsets, start)
}

/// One time index, node chunks in parallel vs. serial, on a 40 × 40 × 20 volume.
fn bench_single_sample(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0x5CA1AB1E);
    let (lut, onsets, start) = fixture(&mut rng, [40, 40, 20], 12);
    let params = ScanParams::builder().sampling_interval(DT).build().unwrap();
    let range = TimeRange::from_samples(start, 200, DT);
    let engine = MigrationEngine::new(&lut, &onsets, &range, &params).unwrap();

    c.bench_function("migrate/parallel_32k_nodes_24_keys", |b| {
        b.iter_batched(
            || Vec::with_capacity(engine.node_count()),
            |buffer| black_box(engine.migrate_into(black_box(100), buffer).unwrap()),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("migrate/serial_32k_nodes_24_keys", |b| {
        b.iter_batched(
            || Vec::with_capacity(engine.node_count()),
            |buffer| black_box(engine.migrate_serial_into(black_box(100), buffer).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

/// Building the shift arena of a run.
fn bench_engine_setup(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let (lut, onsets, start) = fixture(&mut rng, [40, 40, 20], 12);
    let params = ScanParams::builder().sampling_interval(DT).build().unwrap();
    let range = TimeRange::from_samples(start, 200, DT);

    c.bench_function("migrate/engine_setup_24_keys", |b| {
        b.iter(|| black_box(MigrationEngine::new(&lut, &onsets, &range, &params).unwrap()))
    });
}

criterion_group!(benches, bench_single_sample, bench_engine_setup);
criterion_main!(benches);
