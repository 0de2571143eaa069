//! Error types for the ozone-trends library.

use thiserror::Error;

/// Result type alias for trend-engine operations.
pub type Result<T> = std::result::Result<T, TrendError>;

/// Errors that can occur while preparing or running a regression.
///
/// Everything here is fatal for the run and surfaced before the cell
/// loop starts. Per-cell numerical failures (singular normal equations,
/// insufficient data) are not errors; they are reported through
/// [`crate::fit::CellFit`] and leave NaN in the affected output slots.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrendError {
    /// Input data is empty.
    #[error("empty input data")]
    EmptyData,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A date string could not be parsed.
    #[error("invalid date '{value}': expected {expected}")]
    InvalidDate { value: String, expected: &'static str },

    /// Dimension mismatch between data structures.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A named axis was not found on the dataset.
    #[error("axis '{0}' not found on dataset")]
    AxisNotFound(String),

    /// The configured inflection point does not fall inside the analysis window.
    #[error("inflection point {0} lies outside the analysis window")]
    InflectionOutOfRange(String),

    /// Dataset and proxy time ranges have no overlap.
    #[error("no temporal overlap between dataset and proxy '{0}'")]
    NoOverlap(String),
}
