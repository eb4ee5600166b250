//! # Search volume geometry
//!
//! A [`Grid`] is the immutable description of the discretized 3-D volume the
//! coalescence search runs over: an origin, a node spacing and a node count per
//! axis, plus the [`Projection`] the coordinates refer to.
//!
//! Every node-indexed array of the crate (travel-time fields, coalescence
//! samples) is laid out with the same linear order, z fastest:
//!
//! ```text
//! index = (ix * ny + iy) * nz + iz
//! ```
//!
//! ## Decimation
//!
//! [`Grid::decimate`] keeps one node out of `f` on each axis, starting from the
//! origin node, so a coarse node always sits exactly on a fine node:
//!
//! ```text
//! fine   : 0 1 2 3 4 5 6     (n = 7, f = 2)
//! coarse : 0   1   2   3     (n' = (7 - 1) / 2 + 1 = 4)
//! ```
//!
//! [`Grid::coarse_to_fine`] recovers the fine index sampled by a coarse node.
use std::fmt;

use itertools::iproduct;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    constants::{Meter, NodeIndex, GEOMETRY_TOLERANCE},
    quakescan_errors::QuakeScanError,
};

/// Coordinate convention of the grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// Plain cartesian axes, no geographic anchoring.
    Cartesian,
    /// Local tangent plane anchored at a geographic point (degrees).
    LocalTangentPlane { longitude: f64, latitude: f64 },
}

impl Projection {
    fn approx_eq(&self, other: &Projection) -> bool {
        match (self, other) {
            (Projection::Cartesian, Projection::Cartesian) => true,
            (
                Projection::LocalTangentPlane {
                    longitude: lo1,
                    latitude: la1,
                },
                Projection::LocalTangentPlane {
                    longitude: lo2,
                    latitude: la2,
                },
            ) => (lo1 - lo2).abs() <= GEOMETRY_TOLERANCE && (la1 - la2).abs() <= GEOMETRY_TOLERANCE,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    origin: Vector3<Meter>,
    spacing: Vector3<Meter>,
    node_count: [usize; 3],
    projection: Projection,
}

impl Grid {
    /// Construct a new [`Grid`].
    ///
    /// Arguments
    /// -----------------
    /// * `origin`: Coordinates of node `(0, 0, 0)`.
    /// * `spacing`: Node spacing along x, y and z (strictly positive).
    /// * `node_count`: Number of nodes along x, y and z (at least one each).
    /// * `projection`: Coordinate convention of the axes.
    ///
    /// Return
    /// ----------
    /// * The grid, or [`QuakeScanError::InvalidGrid`] if a value is out of range.
    pub fn new(
        origin: Vector3<Meter>,
        spacing: Vector3<Meter>,
        node_count: [usize; 3],
        projection: Projection,
    ) -> Result<Self, QuakeScanError> {
        if origin.iter().any(|v| !v.is_finite()) {
            return Err(QuakeScanError::InvalidGrid(
                "origin must be finite".into(),
            ));
        }
        if spacing.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(QuakeScanError::InvalidGrid(
                "spacing must be finite and > 0".into(),
            ));
        }
        if node_count.iter().any(|&n| n == 0) {
            return Err(QuakeScanError::InvalidGrid(
                "node count must be >= 1 on every axis".into(),
            ));
        }
        Ok(Grid {
            origin,
            spacing,
            node_count,
            projection,
        })
    }

    /// Cartesian grid with the same spacing on every axis.
    pub fn cartesian(
        origin: Vector3<Meter>,
        spacing: Meter,
        node_count: [usize; 3],
    ) -> Result<Self, QuakeScanError> {
        Self::new(
            origin,
            Vector3::repeat(spacing),
            node_count,
            Projection::Cartesian,
        )
    }

    pub fn origin(&self) -> &Vector3<Meter> {
        &self.origin
    }

    pub fn spacing(&self) -> &Vector3<Meter> {
        &self.spacing
    }

    pub fn node_count(&self) -> [usize; 3] {
        self.node_count
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Total number of nodes, `nx * ny * nz`.
    #[inline]
    pub fn node_count_total(&self) -> usize {
        self.node_count.iter().product()
    }

    /// Linear index of the node `(ix, iy, iz)`, `None` outside the grid.
    #[inline]
    pub fn node_index(&self, ix: usize, iy: usize, iz: usize) -> Option<NodeIndex> {
        let [nx, ny, nz] = self.node_count;
        if ix >= nx || iy >= ny || iz >= nz {
            return None;
        }
        Some((ix * ny + iy) * nz + iz)
    }

    /// Axis indices of a linear node index, `None` outside the grid.
    #[inline]
    pub fn node_ijk(&self, index: NodeIndex) -> Option<[usize; 3]> {
        if index >= self.node_count_total() {
            return None;
        }
        let [_, ny, nz] = self.node_count;
        let iz = index % nz;
        let iy = (index / nz) % ny;
        let ix = index / (ny * nz);
        Some([ix, iy, iz])
    }

    /// Coordinates of a node, `origin + ijk ⊙ spacing`.
    pub fn node_coordinates(&self, index: NodeIndex) -> Option<Point3<Meter>> {
        let [ix, iy, iz] = self.node_ijk(index)?;
        let ijk = Vector3::new(ix as f64, iy as f64, iz as f64);
        Some(Point3::from(self.origin + ijk.component_mul(&self.spacing)))
    }

    /// Iterate the axis indices of every node, in linear index order.
    pub fn iter_ijk(&self) -> impl Iterator<Item = [usize; 3]> {
        let [nx, ny, nz] = self.node_count;
        iproduct!(0..nx, 0..ny, 0..nz).map(|(ix, iy, iz)| [ix, iy, iz])
    }

    /// Coarser grid keeping nodes `0, f, 2f, …` on each axis.
    ///
    /// Arguments
    /// -----------------
    /// * `factor`: Decimation factor along x, y and z (each at least one).
    ///
    /// Return
    /// ----------
    /// * The coarse grid; its origin is unchanged and its spacing is `spacing ⊙ factor`.
    pub fn decimate(&self, factor: [usize; 3]) -> Result<Grid, QuakeScanError> {
        if factor.iter().any(|&f| f == 0) {
            return Err(QuakeScanError::InvalidGrid(
                "decimation factor must be >= 1 on every axis".into(),
            ));
        }
        let mut node_count = [0usize; 3];
        for axis in 0..3 {
            node_count[axis] = (self.node_count[axis] - 1) / factor[axis] + 1;
        }
        let factor_v = Vector3::new(factor[0] as f64, factor[1] as f64, factor[2] as f64);
        Grid::new(
            self.origin,
            self.spacing.component_mul(&factor_v),
            node_count,
            self.projection,
        )
    }

    /// Fine node sampled by `coarse_index` of `self.decimate(factor)`.
    pub fn coarse_to_fine(&self, coarse_index: NodeIndex, factor: [usize; 3]) -> Option<NodeIndex> {
        let coarse = self.decimate(factor).ok()?;
        let [cx, cy, cz] = coarse.node_ijk(coarse_index)?;
        self.node_index(cx * factor[0], cy * factor[1], cz * factor[2])
    }

    /// Check that `other` describes the same nodes as `self`.
    ///
    /// Counts must match exactly; origin and spacing within
    /// [`GEOMETRY_TOLERANCE`]; projections must agree.
    ///
    /// Return
    /// ----------
    /// * `Ok(())`, or [`QuakeScanError::GeometryMismatch`] naming the first differing attribute.
    pub fn check_compatible(&self, other: &Grid) -> Result<(), QuakeScanError> {
        if self.node_count != other.node_count {
            return Err(QuakeScanError::GeometryMismatch(format!(
                "node count {:?} != {:?}",
                self.node_count, other.node_count
            )));
        }
        if (self.spacing - other.spacing).amax() > GEOMETRY_TOLERANCE {
            return Err(QuakeScanError::GeometryMismatch(format!(
                "node spacing {:?} != {:?}",
                self.spacing.as_slice(),
                other.spacing.as_slice()
            )));
        }
        if (self.origin - other.origin).amax() > GEOMETRY_TOLERANCE {
            return Err(QuakeScanError::GeometryMismatch(format!(
                "grid origin {:?} != {:?}",
                self.origin.as_slice(),
                other.origin.as_slice()
            )));
        }
        if !self.projection.approx_eq(&other.projection) {
            return Err(QuakeScanError::GeometryMismatch(format!(
                "projection {:?} != {:?}",
                self.projection, other.projection
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [nx, ny, nz] = self.node_count;
        write!(
            f,
            "Grid({nx}x{ny}x{nz} nodes, origin=({:.3}, {:.3}, {:.3}), spacing=({:.3}, {:.3}, {:.3}), {:?})",
            self.origin.x,
            self.origin.y,
            self.origin.z,
            self.spacing.x,
            self.spacing.y,
            self.spacing.z,
            self.projection
        )
    }
}
