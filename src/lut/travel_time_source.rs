//! Providers of travel times consumed by [`LookupTable::build`](crate::lut::LookupTable::build).
//!
//! The table treats its source as opaque: anything that can report the grid it
//! was computed on and a travel time for a key and node implements
//! [`TravelTimeSource`]. Two implementations ship with the crate:
//!
//! * [`PrecomputedTravelTimes`] – in-memory arrays, typically the output of an
//!   external travel-time grid reader.
//! * [`HomogeneousVelocity`] – straight-ray travel times through a uniform
//!   medium, one velocity per phase. Handy for synthetic scenarios.
use std::collections::HashMap;

use ahash::RandomState;
use nalgebra::Point3;

use crate::{
    constants::{Meter, NodeIndex, Seconds},
    grid::Grid,
    lut::StationPhaseKey,
    quakescan_errors::QuakeScanError,
};

pub trait TravelTimeSource {
    /// Geometry the travel times were computed on.
    fn grid(&self) -> &Grid;

    /// Travel time from `node` to the station of `key` for its phase.
    fn travel_time(&self, key: &StationPhaseKey, node: NodeIndex) -> Result<Seconds, QuakeScanError>;

    /// Travel times of `key` for every node, in linear index order.
    fn field(&self, key: &StationPhaseKey) -> Result<Vec<Seconds>, QuakeScanError> {
        (0..self.grid().node_count_total())
            .map(|node| self.travel_time(key, node))
            .collect()
    }
}

/// Travel-time arrays held in memory, keyed by station/phase.
#[derive(Debug, Clone)]
pub struct PrecomputedTravelTimes {
    grid: Grid,
    fields: HashMap<StationPhaseKey, Vec<Seconds>, RandomState>,
}

impl PrecomputedTravelTimes {
    pub fn new(grid: Grid) -> Self {
        PrecomputedTravelTimes {
            grid,
            fields: HashMap::default(),
        }
    }

    /// Register the travel times of `key`; the array length must match the grid.
    pub fn insert(&mut self, key: StationPhaseKey, values: Vec<Seconds>) -> Result<(), QuakeScanError> {
        if values.len() != self.grid.node_count_total() {
            return Err(QuakeScanError::GeometryMismatch(format!(
                "{} travel times given for {key}, grid has {} nodes",
                values.len(),
                self.grid.node_count_total()
            )));
        }
        self.fields.insert(key, values);
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &StationPhaseKey> {
        self.fields.keys()
    }
}

impl TravelTimeSource for PrecomputedTravelTimes {
    fn grid(&self) -> &Grid {
        &self.grid
    }

    fn travel_time(&self, key: &StationPhaseKey, node: NodeIndex) -> Result<Seconds, QuakeScanError> {
        let values = self
            .fields
            .get(key)
            .ok_or_else(|| QuakeScanError::UnknownKey(key.clone()))?;
        values.get(node).copied().ok_or_else(|| {
            QuakeScanError::GeometryMismatch(format!("node {node} outside the source grid"))
        })
    }

    fn field(&self, key: &StationPhaseKey) -> Result<Vec<Seconds>, QuakeScanError> {
        self.fields
            .get(key)
            .cloned()
            .ok_or_else(|| QuakeScanError::UnknownKey(key.clone()))
    }
}

/// Uniform medium: `travel_time = |node - station| / velocity(phase)`.
#[derive(Debug, Clone)]
pub struct HomogeneousVelocity {
    grid: Grid,
    stations: HashMap<String, Point3<Meter>, RandomState>,
    velocities: HashMap<String, f64, RandomState>,
}

impl HomogeneousVelocity {
    pub fn new(grid: Grid) -> Self {
        HomogeneousVelocity {
            grid,
            stations: HashMap::default(),
            velocities: HashMap::default(),
        }
    }

    /// Add a station at `position`, in grid coordinates.
    pub fn with_station(mut self, name: impl Into<String>, position: Point3<Meter>) -> Self {
        self.stations.insert(name.into(), position);
        self
    }

    /// Set the propagation velocity of `phase` (grid length unit per second).
    pub fn with_phase(mut self, phase: impl Into<String>, velocity: f64) -> Result<Self, QuakeScanError> {
        if !velocity.is_finite() || velocity <= 0.0 {
            return Err(QuakeScanError::InvalidScanParameter(format!(
                "phase velocity must be finite and > 0, got {velocity}"
            )));
        }
        self.velocities.insert(phase.into(), velocity);
        Ok(self)
    }

    /// Every station × phase combination this model can serve, sorted.
    pub fn keys(&self) -> Vec<StationPhaseKey> {
        let mut keys: Vec<StationPhaseKey> = self
            .stations
            .keys()
            .flat_map(|s| {
                self.velocities
                    .keys()
                    .map(move |p| StationPhaseKey::new(s.clone(), p.clone()))
            })
            .collect();
        keys.sort();
        keys
    }
}

impl TravelTimeSource for HomogeneousVelocity {
    fn grid(&self) -> &Grid {
        &self.grid
    }

    fn travel_time(&self, key: &StationPhaseKey, node: NodeIndex) -> Result<Seconds, QuakeScanError> {
        let unknown = || QuakeScanError::UnknownKey(key.clone());
        let station = self.stations.get(&key.station).ok_or_else(unknown)?;
        let velocity = self.velocities.get(&key.phase).ok_or_else(unknown)?;
        let position = self.grid.node_coordinates(node).ok_or_else(|| {
            QuakeScanError::GeometryMismatch(format!("node {node} outside the source grid"))
        })?;
        Ok((position - station).norm() / velocity)
    }
}
