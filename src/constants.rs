//! # Constants and type definitions for quakescan
//!
//! This module centralizes the **numeric tolerances**, **persisted format tags**, **default
//! configuration values** and **common type aliases** used throughout the crate.
//!
//! ## Overview
//!
//! - Unit-bearing type aliases (seconds, meters, node indices)
//! - Magic bytes and version of the persisted lookup-table format
//! - Tolerances used for geometry comparisons
//! - Defaults for [`ScanParams`](crate::scan_params::ScanParams)

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Duration or relative time in seconds
pub type Seconds = f64;
/// Distance in meters (or any consistent length unit of the grid)
pub type Meter = f64;
/// Linear index of a grid node, `(ix * ny + iy) * nz + iz`
pub type NodeIndex = usize;

// -------------------------------------------------------------------------------------------------
// Persisted lookup table
// -------------------------------------------------------------------------------------------------

/// Leading bytes of every persisted lookup table
pub const LUT_MAGIC: &[u8; 8] = b"QSCANLUT";

/// Current version of the persisted lookup table layout
pub const LUT_FORMAT_VERSION: u32 = 1;

// -------------------------------------------------------------------------------------------------
// Tolerances
// -------------------------------------------------------------------------------------------------

/// Absolute tolerance on origin/spacing when comparing two grids
pub const GEOMETRY_TOLERANCE: f64 = 1e-6;

/// Slack (seconds) absorbing epoch rounding when counting samples in a time range
pub const TIME_TOLERANCE: Seconds = 1e-9;

// -------------------------------------------------------------------------------------------------
// Defaults
// -------------------------------------------------------------------------------------------------

/// Fraction of the travel time used downstream to size onset windows
pub const DEFAULT_FRACTION_TT: f64 = 0.1;

/// Number of grid nodes handled by one parallel task
pub const DEFAULT_NODE_CHUNK: usize = 4096;

/// Number of time indices scheduled together in time-parallel mode
pub const DEFAULT_TIME_BLOCK: usize = 64;

/// Samples buffered between the migration producer and the scanner
pub const DEFAULT_PIPELINE_DEPTH: usize = 2;

/// Trailing window (in output samples) of the background estimate
pub const DEFAULT_BACKGROUND_WINDOW: usize = 100;
