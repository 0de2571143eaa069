//! Core data structures: gridded datasets and proxy time series.

mod dataset;
mod proxy;

pub use dataset::{CellIter, GriddedDataset};
pub use proxy::{Proxy, ProxyTag};
