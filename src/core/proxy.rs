//! Proxy time series: explanatory covariates for the regression.

use crate::config::{mid_month, TermMethod};
use crate::error::{Result, TrendError};
use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::HashMap;

/// Names the auxiliary dataset axis a 2-D proxy spans, with the proxy's
/// own coordinates along that axis (e.g. latitude band centers).
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyTag {
    pub axis: String,
    pub coords: Vec<f64>,
}

/// An explanatory time series (solar flux, ENSO index, aerosol optical
/// depth, ...) used as a regressor.
///
/// `data` is always a matrix with rows indexed by time; a plain 1-D
/// series is stored as a single column with no [`ProxyTag`]. Timestamps
/// are normalized to day 15 of their month at construction so that
/// monthly series from different sources compare equal.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub name: String,
    pub data: Array2<f64>,
    pub time: Vec<NaiveDate>,
    pub tag: Option<ProxyTag>,
    /// How this proxy enters the design matrix.
    pub method: TermMethod,
    /// Harmonic pair count when `method` is [`TermMethod::Harmonic`].
    pub seas_comp: usize,
    /// Applicability bounds per dataset axis: cells whose coordinate
    /// falls outside `(min, max)` do not use this proxy.
    pub bounds: HashMap<String, (Option<f64>, Option<f64>)>,
}

impl Proxy {
    /// Create a 1-D proxy from a plain series.
    pub fn series(
        name: impl Into<String>,
        time: Vec<NaiveDate>,
        values: Vec<f64>,
    ) -> Result<Self> {
        if values.len() != time.len() {
            return Err(TrendError::DimensionMismatch {
                expected: time.len(),
                got: values.len(),
            });
        }
        let n = values.len();
        let data = Array2::from_shape_vec((n, 1), values)
            .map_err(|_| TrendError::EmptyData)?;
        Ok(Self {
            name: name.into(),
            data,
            time: time.into_iter().map(mid_month).collect(),
            tag: None,
            method: TermMethod::Single,
            seas_comp: 2,
            bounds: HashMap::new(),
        })
    }

    /// Create a 2-D proxy whose columns span an auxiliary dataset axis.
    pub fn tagged(
        name: impl Into<String>,
        time: Vec<NaiveDate>,
        data: Array2<f64>,
        axis: impl Into<String>,
        coords: Vec<f64>,
    ) -> Result<Self> {
        if data.nrows() != time.len() {
            return Err(TrendError::DimensionMismatch {
                expected: time.len(),
                got: data.nrows(),
            });
        }
        if data.ncols() != coords.len() {
            return Err(TrendError::DimensionMismatch {
                expected: coords.len(),
                got: data.ncols(),
            });
        }
        Ok(Self {
            name: name.into(),
            data,
            time: time.into_iter().map(mid_month).collect(),
            tag: Some(ProxyTag {
                axis: axis.into(),
                coords,
            }),
            method: TermMethod::Single,
            seas_comp: 2,
            bounds: HashMap::new(),
        })
    }

    pub fn with_method(mut self, method: TermMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_seasonal_components(mut self, seas_comp: usize) -> Self {
        self.seas_comp = seas_comp;
        self
    }

    /// Restrict this proxy to cells whose coordinate on `axis` lies in
    /// `(min, max)` (either bound may be open).
    pub fn with_bounds(
        mut self,
        axis: impl Into<String>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Self {
        self.bounds.insert(axis.into(), (min, max));
        self
    }

    /// Whether the proxy contributes columns to the design matrix.
    pub fn is_active(&self) -> bool {
        self.method != TermMethod::Disabled
    }

    /// Number of design-matrix columns this proxy expands into.
    pub fn column_count(&self) -> usize {
        self.method.column_count(self.seas_comp)
    }

    /// Whether a cell at the given axis coordinates may use this proxy.
    ///
    /// `coords` maps axis name to the cell's coordinate value; axes
    /// without a bound (or absent from the map) never exclude the cell.
    pub fn applies_at(&self, coords: &HashMap<String, f64>) -> bool {
        self.bounds.iter().all(|(axis, (min, max))| {
            match coords.get(axis) {
                Some(value) => {
                    min.map_or(true, |lo| *value >= lo) && max.map_or(true, |hi| *value <= hi)
                }
                None => true,
            }
        })
    }

    /// The proxy series for a cell at `coord` on the tag axis.
    ///
    /// Untagged proxies return their single column. Tagged proxies
    /// return the exact matching column when one exists, otherwise the
    /// linear interpolation between the two nearest tag coordinates,
    /// independently at every time step.
    pub fn series_at(&self, coord: Option<f64>) -> Vec<f64> {
        let tag = match (&self.tag, coord) {
            (Some(tag), Some(_)) if tag.coords.len() > 1 => tag,
            _ => return self.data.column(0).to_vec(),
        };
        let coord = coord.unwrap_or(tag.coords[0]);

        if let Some(col) = tag.coords.iter().position(|&c| c == coord) {
            return self.data.column(col).to_vec();
        }

        // Two nearest tag coordinates, by absolute distance.
        let mut order: Vec<usize> = (0..tag.coords.len()).collect();
        order.sort_by(|&a, &b| {
            (tag.coords[a] - coord)
                .abs()
                .total_cmp(&(tag.coords[b] - coord).abs())
        });
        let (i1, i2) = (order[0], order[1]);
        let (c1, c2) = (tag.coords[i1], tag.coords[i2]);
        let (col1, col2) = (self.data.column(i1), self.data.column(i2));

        col1.iter()
            .zip(col2.iter())
            .map(|(&v1, &v2)| {
                if c2 == c1 {
                    v1
                } else {
                    v1 + (v2 - v1) * (coord - c1) / (c2 - c1)
                }
            })
            .collect()
    }

    /// Trim the proxy in place to rows with `start <= time <= end`.
    pub(crate) fn trim(&mut self, start: NaiveDate, end: NaiveDate) {
        let keep: Vec<usize> = self
            .time
            .iter()
            .enumerate()
            .filter(|(_, t)| **t >= start && **t <= end)
            .map(|(k, _)| k)
            .collect();
        let mut data = Array2::zeros((keep.len(), self.data.ncols()));
        for (row, &k) in keep.iter().enumerate() {
            data.row_mut(row).assign(&self.data.row(k));
        }
        self.time = keep.iter().map(|&k| self.time[k]).collect();
        self.data = data;
    }
}
