//! Multiple linear regression trend analysis for gridded atmospheric
//! time series.
//!
//! The crate fits a configurable regression model (trend and intercept
//! terms with optional seasonal expansion, plus explanatory proxy
//! series) independently to every cell of a gridded monthly dataset,
//! then corrects the coefficient covariance for first-order
//! autocorrelation in the residuals and reports a decadal trend with a
//! significance ratio per cell.
//!
//! ```no_run
//! use ozone_trends::{GriddedDataset, Proxy, RegressionConfig, run};
//! # fn main() -> ozone_trends::Result<()> {
//! # let (values, time, solar) = unimplemented!();
//! let dataset = GriddedDataset::single_series("o3", values, time)?;
//! let config = RegressionConfig::default();
//! let analysis = run(&dataset, &[solar], &config)?;
//! println!("trend: {:?} %/decade", analysis.trend);
//! # Ok(())
//! # }
//! ```

pub mod align;
pub mod config;
pub mod core;
pub mod design;
pub mod error;
pub mod fit;
pub mod model;
pub mod preprocess;

pub use crate::config::{
    AnomalyMethod, AveragingWindow, Inflection, InflectionMethod, RegressionConfig, TermMethod,
};
pub use crate::core::{CellIter, GriddedDataset, Proxy, ProxyTag};
pub use crate::error::{Result, TrendError};
pub use crate::model::{run, Diagnostic, TrendAnalysis};
