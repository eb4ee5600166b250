use thiserror::Error;

use crate::lut::StationPhaseKey;

#[derive(Error, Debug)]
pub enum QuakeScanError {
    #[error("Grid geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("Unknown station/phase key: {0}")]
    UnknownKey(StationPhaseKey),

    #[error("No station/phase contributes to time index {time_index}")]
    EmptyReduction { time_index: usize },

    #[error("Onset series of {key} does not cover time index {time_index}")]
    InsufficientCoverage {
        key: StationPhaseKey,
        time_index: usize,
    },

    #[error("Invalid travel time for {key} at node {node}: {value}")]
    InvalidTravelTime {
        key: StationPhaseKey,
        node: usize,
        value: f64,
    },

    #[error("Invalid onset series: {0}")]
    InvalidOnset(String),

    #[error("Invalid grid definition: {0}")]
    InvalidGrid(String),

    #[error("Invalid scan parameter: {0}")]
    InvalidScanParameter(String),

    #[error("Error while parsing the lookup table file: {0}")]
    LutParsing(String),

    #[error("Unsupported lookup table format version: {0}")]
    UnsupportedLutVersion(u32),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unable to build the worker thread pool: {0}")]
    ThreadPool(String),
}

impl From<rayon::ThreadPoolBuildError> for QuakeScanError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        QuakeScanError::ThreadPool(err.to_string())
    }
}

impl QuakeScanError {
    /// `true` for errors confined to a single time index; the run goes on.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            QuakeScanError::EmptyReduction { .. } | QuakeScanError::InsufficientCoverage { .. }
        )
    }
}

impl PartialEq for QuakeScanError {
    fn eq(&self, other: &Self) -> bool {
        use QuakeScanError::*;
        match (self, other) {
            (GeometryMismatch(a), GeometryMismatch(b)) => a == b,
            (UnknownKey(a), UnknownKey(b)) => a == b,
            (EmptyReduction { time_index: a }, EmptyReduction { time_index: b }) => a == b,
            (
                InsufficientCoverage {
                    key: ka,
                    time_index: ta,
                },
                InsufficientCoverage {
                    key: kb,
                    time_index: tb,
                },
            ) => ka == kb && ta == tb,
            (
                InvalidTravelTime {
                    key: ka,
                    node: na,
                    value: va,
                },
                InvalidTravelTime {
                    key: kb,
                    node: nb,
                    value: vb,
                },
            ) => ka == kb && na == nb && (va == vb || (va.is_nan() && vb.is_nan())),
            (InvalidOnset(a), InvalidOnset(b)) => a == b,
            (InvalidGrid(a), InvalidGrid(b)) => a == b,
            (InvalidScanParameter(a), InvalidScanParameter(b)) => a == b,
            (LutParsing(a), LutParsing(b)) => a == b,
            (UnsupportedLutVersion(a), UnsupportedLutVersion(b)) => a == b,
            (ThreadPool(a), ThreadPool(b)) => a == b,

            // io::Error carries no comparable payload: same variant means equal
            (IoError(_), IoError(_)) => true,

            _ => false,
        }
    }
}
