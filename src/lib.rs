pub mod constants;
pub mod grid;
pub mod lut;
pub mod migration;
pub mod onset;
mod progress;
pub mod quakescan;
pub mod quakescan_errors;
pub mod scan;
pub mod scan_params;

#[cfg(test)]
pub(crate) mod unit_test_global {
    use std::sync::LazyLock;

    use nalgebra::{Point3, Vector3};

    use crate::{
        grid::Grid,
        lut::{travel_time_source::HomogeneousVelocity, LookupTable},
    };

    /// 6 × 5 × 4 grid of 100 m, three stations at the surface, P and S phases.
    pub(crate) static HOMOGENEOUS_LUT: LazyLock<LookupTable> = LazyLock::new(|| {
        let grid = Grid::cartesian(Vector3::zeros(), 100.0, [6, 5, 4]).unwrap();
        let model = HomogeneousVelocity::new(grid.clone())
            .with_station("ST01", Point3::new(0.0, 0.0, 0.0))
            .with_station("ST02", Point3::new(500.0, 0.0, 0.0))
            .with_station("ST03", Point3::new(250.0, 400.0, 0.0))
            .with_phase("P", 5000.0)
            .unwrap()
            .with_phase("S", 2900.0)
            .unwrap();
        LookupTable::build(&grid, &model.keys(), &model).unwrap()
    });
}
