//! # Travel-time lookup table
//!
//! The [`LookupTable`] stores, for every station/phase pair, the travel time
//! from each node of a [`Grid`] to that station. It is built once from an
//! external [`TravelTimeSource`], persisted with [`lut_file`], and shared
//! read-only across any number of scans.
//!
//! ## Layout
//!
//! ```text
//! LookupTable
//! ├── grid            (Grid, shared node order)
//! ├── fields          (BTreeMap<StationPhaseKey, TravelTimeField>)
//! │     └── values    (Vec<f64>, one travel time per node)
//! ├── unit_conversion (cumulative scale applied by unit_convert)
//! ├── decimation      (cumulative per-axis factor applied by decimate)
//! ├── fraction_tt     (onset window fraction, carried for downstream stages)
//! └── phases          (phase codes present in the table)
//! ```
//!
//! Keys are kept in a `BTreeMap`, so iteration order is the sorted key order
//! everywhere in the crate.
//!
//! ## Operations
//!
//! * [`LookupTable::build`] – populate one field per key from a source.
//! * [`LookupTable::lookup`] – O(1) travel time for a key and node.
//! * [`LookupTable::decimate`] – nearest-node subsampling onto a coarse grid.
//! * [`LookupTable::unit_convert`] – rescale every stored travel time in place.
//!
//! ## See also
//! ------------
//! * [`travel_time_source`] – Provider trait and the bundled implementations.
//! * [`lut_file`] – Binary persistence of a table.
use std::{collections::BTreeMap, fmt};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    constants::{NodeIndex, Seconds, DEFAULT_FRACTION_TT},
    grid::Grid,
    quakescan_errors::QuakeScanError,
};

pub mod lut_file;
pub mod travel_time_source;

pub use travel_time_source::TravelTimeSource;

/// Identifier of one travel-time field: a station and a seismic phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationPhaseKey {
    pub station: String,
    pub phase: String,
}

impl StationPhaseKey {
    pub fn new(station: impl Into<String>, phase: impl Into<String>) -> Self {
        StationPhaseKey {
            station: station.into(),
            phase: phase.into(),
        }
    }
}

impl fmt::Display for StationPhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.station, self.phase)
    }
}

impl From<(&str, &str)> for StationPhaseKey {
    fn from((station, phase): (&str, &str)) -> Self {
        StationPhaseKey::new(station, phase)
    }
}

/// Travel times of one key, one non-negative value per grid node.
#[derive(Debug, Clone, PartialEq)]
pub struct TravelTimeField {
    values: Vec<Seconds>,
}

impl TravelTimeField {
    /// Wrap a travel-time array, rejecting negative or non-finite values.
    pub fn new(key: &StationPhaseKey, values: Vec<Seconds>) -> Result<Self, QuakeScanError> {
        if let Some((node, &value)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(QuakeScanError::InvalidTravelTime {
                key: key.clone(),
                node,
                value,
            });
        }
        Ok(TravelTimeField { values })
    }

    #[inline]
    pub fn values(&self) -> &[Seconds] {
        &self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Smallest and largest travel time of the field.
    pub fn range(&self) -> Option<(Seconds, Seconds)> {
        self.values.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    grid: Grid,
    fields: BTreeMap<StationPhaseKey, TravelTimeField>,
    unit_conversion: f64,
    decimation: [usize; 3],
    fraction_tt: f64,
    phases: Vec<String>,
}

impl LookupTable {
    /// Populate one travel-time field per key from an external source.
    ///
    /// Fields are requested from the source in parallel (one task per key).
    ///
    /// Arguments
    /// -----------------
    /// * `grid`: Geometry the table is declared on.
    /// * `keys`: Station/phase pairs to tabulate; duplicates are ignored.
    /// * `source`: Provider of travel times (ray tracer, precomputed grid reader, …).
    ///
    /// Return
    /// ----------
    /// * The table, or
    ///   * [`QuakeScanError::GeometryMismatch`] if the source geometry disagrees with `grid`,
    ///   * [`QuakeScanError::UnknownKey`] if the source cannot serve a key,
    ///   * [`QuakeScanError::InvalidTravelTime`] if the source yields a negative/non-finite value.
    pub fn build<S>(
        grid: &Grid,
        keys: &[StationPhaseKey],
        source: &S,
    ) -> Result<Self, QuakeScanError>
    where
        S: TravelTimeSource + Sync + ?Sized,
    {
        grid.check_compatible(source.grid())?;

        let mut unique: Vec<StationPhaseKey> = keys.to_vec();
        unique.sort();
        unique.dedup();

        let fields = unique
            .par_iter()
            .map(|key| {
                let values = source.field(key)?;
                if values.len() != grid.node_count_total() {
                    return Err(QuakeScanError::GeometryMismatch(format!(
                        "source returned {} travel times for {key}, grid has {} nodes",
                        values.len(),
                        grid.node_count_total()
                    )));
                }
                Ok((key.clone(), TravelTimeField::new(key, values)?))
            })
            .collect::<Result<BTreeMap<_, _>, QuakeScanError>>()?;

        debug!(
            keys = fields.len(),
            nodes = grid.node_count_total(),
            "travel-time table built"
        );

        Ok(Self::from_fields(grid.clone(), fields))
    }

    /// Assemble a table from already validated fields.
    pub(crate) fn from_fields(grid: Grid, fields: BTreeMap<StationPhaseKey, TravelTimeField>) -> Self {
        let mut phases: Vec<String> = fields.keys().map(|k| k.phase.clone()).collect();
        phases.sort();
        phases.dedup();
        LookupTable {
            grid,
            fields,
            unit_conversion: 1.0,
            decimation: [1, 1, 1],
            fraction_tt: DEFAULT_FRACTION_TT,
            phases,
        }
    }

    /// Travel time from `node` for `key`.
    ///
    /// Return
    /// ----------
    /// * The travel time, [`QuakeScanError::UnknownKey`] if `key` is absent, or
    ///   [`QuakeScanError::GeometryMismatch`] if `node` lies outside the grid.
    #[inline]
    pub fn lookup(&self, key: &StationPhaseKey, node: NodeIndex) -> Result<Seconds, QuakeScanError> {
        let field = self.field(key)?;
        field.values.get(node).copied().ok_or_else(|| {
            QuakeScanError::GeometryMismatch(format!(
                "node {node} outside a grid of {} nodes",
                field.len()
            ))
        })
    }

    /// Full travel-time field of `key`.
    pub fn field(&self, key: &StationPhaseKey) -> Result<&TravelTimeField, QuakeScanError> {
        self.fields
            .get(key)
            .ok_or_else(|| QuakeScanError::UnknownKey(key.clone()))
    }

    /// Coarser table obtained by nearest-node subsampling of every field.
    ///
    /// Each coarse node takes the travel time of the fine node it sits on (see
    /// [`Grid::decimate`]); no averaging is performed, so sharp travel-time
    /// contrasts near velocity boundaries are preserved.
    ///
    /// Arguments
    /// -----------------
    /// * `factor`: Decimation factor along x, y and z.
    ///
    /// Return
    /// ----------
    /// * A new table on the coarse grid; the cumulative decimation factor is updated.
    pub fn decimate(&self, factor: [usize; 3]) -> Result<LookupTable, QuakeScanError> {
        let coarse = self.grid.decimate(factor)?;
        let fine_nodes: Vec<NodeIndex> = coarse
            .iter_ijk()
            .map(|[cx, cy, cz]| {
                self.grid
                    .node_index(cx * factor[0], cy * factor[1], cz * factor[2])
                    .ok_or_else(|| {
                        QuakeScanError::GeometryMismatch(format!(
                            "coarse node ({cx}, {cy}, {cz}) outside the fine grid"
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let fields = self
            .fields
            .iter()
            .map(|(key, field)| {
                let values = fine_nodes.iter().map(|&n| field.values[n]).collect();
                (key.clone(), TravelTimeField { values })
            })
            .collect();

        let mut decimation = self.decimation;
        for axis in 0..3 {
            decimation[axis] *= factor[axis];
        }

        debug!(
            ?factor,
            fine_nodes = self.grid.node_count_total(),
            coarse_nodes = coarse.node_count_total(),
            "travel-time table decimated"
        );

        Ok(LookupTable {
            grid: coarse,
            fields,
            unit_conversion: self.unit_conversion,
            decimation,
            fraction_tt: self.fraction_tt,
            phases: self.phases.clone(),
        })
    }

    /// Multiply every stored travel time by `factor`, in place.
    ///
    /// Used to reconcile the time unit of the table with the onset sample
    /// interval (e.g. milliseconds → seconds with `factor = 1e-3`).
    pub fn unit_convert(&mut self, factor: f64) -> Result<(), QuakeScanError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(QuakeScanError::InvalidScanParameter(format!(
                "unit conversion factor must be finite and > 0, got {factor}"
            )));
        }
        self.fields.par_iter_mut().for_each(|(_, field)| {
            field.values.iter_mut().for_each(|v| *v *= factor);
        });
        self.unit_conversion *= factor;
        debug!(factor, cumulative = self.unit_conversion, "travel times rescaled");
        Ok(())
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.grid.node_count_total()
    }

    pub fn contains(&self, key: &StationPhaseKey) -> bool {
        self.fields.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &StationPhaseKey> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StationPhaseKey, &TravelTimeField)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Distinct station identifiers, sorted.
    pub fn stations(&self) -> Vec<&str> {
        let mut stations: Vec<&str> = self.fields.keys().map(|k| k.station.as_str()).collect();
        stations.dedup();
        stations
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn unit_conversion(&self) -> f64 {
        self.unit_conversion
    }

    pub fn decimation(&self) -> [usize; 3] {
        self.decimation
    }

    pub fn fraction_tt(&self) -> f64 {
        self.fraction_tt
    }

    pub fn set_fraction_tt(&mut self, fraction_tt: f64) -> Result<(), QuakeScanError> {
        if !(0.0..=1.0).contains(&fraction_tt) {
            return Err(QuakeScanError::InvalidScanParameter(format!(
                "fraction_tt must lie in [0, 1], got {fraction_tt}"
            )));
        }
        self.fraction_tt = fraction_tt;
        Ok(())
    }

    /// Smallest and largest travel time stored for `key`.
    pub fn travel_time_range(
        &self,
        key: &StationPhaseKey,
    ) -> Result<Option<(Seconds, Seconds)>, QuakeScanError> {
        Ok(self.field(key)?.range())
    }

    pub(crate) fn restore_metadata(
        &mut self,
        unit_conversion: f64,
        decimation: [usize; 3],
        fraction_tt: f64,
    ) {
        self.unit_conversion = unit_conversion;
        self.decimation = decimation;
        self.fraction_tt = fraction_tt;
    }
}

impl fmt::Display for LookupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LookupTable({} keys, phases={:?}, {}, unit_conversion={}, decimation={:?})",
            self.fields.len(),
            self.phases,
            self.grid,
            self.unit_conversion,
            self.decimation
        )
    }
}
