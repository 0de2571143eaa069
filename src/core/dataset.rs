//! Gridded dataset: a scalar field over time and auxiliary dimensions.

use crate::config::mid_month;
use crate::error::{Result, TrendError};
use chrono::NaiveDate;
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;

/// A time-ordered scalar field (e.g. ozone) over an arbitrary set of
/// auxiliary dimensions (altitude, latitude, longitude, ...).
///
/// Axis 0 of `values` is always time; the remaining axes are named by
/// `dim_names[1..]` and carry a coordinate array each in `coords`.
/// Missing observations are `NaN` and are excluded from every fit.
///
/// All shape/consistency invariants are checked once at construction,
/// so the cell loop never has to re-validate.
#[derive(Debug, Clone)]
pub struct GriddedDataset {
    pub name: String,
    pub values: ArrayD<f64>,
    pub time: Vec<NaiveDate>,
    /// Axis names in storage order; first entry is always `"time"`.
    pub dim_names: Vec<String>,
    /// Coordinate arrays for the non-time axes, keyed by axis name.
    pub coords: HashMap<String, Vec<f64>>,
}

impl GriddedDataset {
    pub fn new(
        name: impl Into<String>,
        values: ArrayD<f64>,
        time: Vec<NaiveDate>,
        dim_names: Vec<String>,
        coords: HashMap<String, Vec<f64>>,
    ) -> Result<Self> {
        if time.is_empty() {
            return Err(TrendError::EmptyData);
        }
        if values.shape()[0] != time.len() {
            return Err(TrendError::DimensionMismatch {
                expected: time.len(),
                got: values.shape()[0],
            });
        }
        if dim_names.len() != values.ndim() {
            return Err(TrendError::DimensionMismatch {
                expected: values.ndim(),
                got: dim_names.len(),
            });
        }
        if dim_names.first().map(String::as_str) != Some("time") {
            return Err(TrendError::AxisNotFound("time".into()));
        }
        for (axis, name) in dim_names.iter().enumerate().skip(1) {
            let coord = coords
                .get(name)
                .ok_or_else(|| TrendError::AxisNotFound(name.clone()))?;
            if coord.len() != values.shape()[axis] {
                return Err(TrendError::DimensionMismatch {
                    expected: values.shape()[axis],
                    got: coord.len(),
                });
            }
        }
        Ok(Self {
            name: name.into(),
            values,
            time: time.into_iter().map(mid_month).collect(),
            dim_names,
            coords,
        })
    }

    /// Convenience constructor for a dataset with no auxiliary axes
    /// (a single time series as a 1-D grid).
    pub fn single_series(
        name: impl Into<String>,
        values: Vec<f64>,
        time: Vec<NaiveDate>,
    ) -> Result<Self> {
        let n = values.len();
        let values = ArrayD::from_shape_vec(IxDyn(&[n]), values)
            .map_err(|_| TrendError::EmptyData)?;
        Self::new(name, values, time, vec!["time".into()], HashMap::new())
    }

    /// Names of the non-time axes, in storage order.
    pub fn aux_names(&self) -> &[String] {
        &self.dim_names[1..]
    }

    /// Shape of the non-time axes, in storage order.
    pub fn aux_shape(&self) -> Vec<usize> {
        self.values.shape()[1..].to_vec()
    }

    /// The full time series of the cell at `index` (one entry per
    /// non-time axis, in storage order).
    pub fn cell_series(&self, index: &[usize]) -> Vec<f64> {
        let mut full = Vec::with_capacity(index.len() + 1);
        full.push(0);
        full.extend_from_slice(index);
        (0..self.time.len())
            .map(|t| {
                full[0] = t;
                self.values[IxDyn(&full)]
            })
            .collect()
    }

    /// The cell's coordinate value on each named auxiliary axis.
    pub fn cell_coords(&self, index: &[usize]) -> HashMap<String, f64> {
        self.aux_names()
            .iter()
            .zip(index.iter())
            .filter_map(|(name, &i)| self.coords.get(name).map(|c| (name.clone(), c[i])))
            .collect()
    }

    /// Iterate over every cell in row-major order, yielding the cell's
    /// multi-index and its full time series.
    ///
    /// The traversal is a pure function of the grid shape: each cell is
    /// visited exactly once and cells are mutually independent.
    pub fn cells(&self) -> CellIter<'_> {
        CellIter {
            dataset: self,
            shape: self.aux_shape(),
            next: Some(vec![0; self.values.ndim() - 1]),
        }
    }
}

/// Row-major iterator over the non-time cells of a [`GriddedDataset`].
pub struct CellIter<'a> {
    dataset: &'a GriddedDataset,
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl<'a> Iterator for CellIter<'a> {
    type Item = (Vec<usize>, Vec<f64>);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;
        let series = self.dataset.cell_series(&index);

        // Advance the odometer, last axis fastest.
        let mut carry = index.clone();
        let mut axis = self.shape.len();
        loop {
            if axis == 0 {
                self.next = None;
                break;
            }
            axis -= 1;
            carry[axis] += 1;
            if carry[axis] < self.shape[axis] {
                self.next = Some(carry);
                break;
            }
            carry[axis] = 0;
        }

        Some((index, series))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn dates(n: usize) -> Vec<NaiveDate> {
        (0..n)
            .map(|k| {
                NaiveDate::from_ymd_opt(2000 + (k / 12) as i32, (k % 12) as u32 + 1, 1).unwrap()
            })
            .collect()
    }

    fn grid_2x3(n_time: usize) -> GriddedDataset {
        let mut coords = HashMap::new();
        coords.insert("alt".to_string(), vec![10.0, 20.0]);
        coords.insert("lat".to_string(), vec![-60.0, 0.0, 60.0]);
        let total = n_time * 2 * 3;
        let values =
            ArrayD::from_shape_vec(IxDyn(&[n_time, 2, 3]), (0..total).map(|v| v as f64).collect())
                .unwrap();
        GriddedDataset::new(
            "test",
            values,
            dates(n_time),
            vec!["time".into(), "alt".into(), "lat".into()],
            coords,
        )
        .unwrap()
    }

    #[test]
    fn constructor_validates_time_axis() {
        let values = ArrayD::from_shape_vec(IxDyn(&[3]), vec![1.0, 2.0, 3.0]).unwrap();
        let err = GriddedDataset::new("bad", values, dates(4), vec!["time".into()], HashMap::new())
            .unwrap_err();
        assert!(matches!(err, TrendError::DimensionMismatch { .. }));
    }

    #[test]
    fn constructor_requires_coordinates_for_named_axes() {
        let values = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.0; 4]).unwrap();
        let err = GriddedDataset::new(
            "bad",
            values,
            dates(2),
            vec!["time".into(), "lat".into()],
            HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(err, TrendError::AxisNotFound("lat".into()));
    }

    #[test]
    fn cell_iteration_is_row_major_and_complete() {
        let grid = grid_2x3(4);
        let indices: Vec<Vec<usize>> = grid.cells().map(|(i, _)| i).collect();
        assert_eq!(indices.len(), 6);
        assert_eq!(indices[0], vec![0, 0]);
        assert_eq!(indices[1], vec![0, 1]);
        assert_eq!(indices[3], vec![1, 0]);
        assert_eq!(indices[5], vec![1, 2]);
    }

    #[test]
    fn cell_series_follows_time_axis() {
        let grid = grid_2x3(4);
        let (index, series) = grid.cells().next().unwrap();
        assert_eq!(index, vec![0, 0]);
        // Stride over the time axis of the row-major layout.
        assert_eq!(series, vec![0.0, 6.0, 12.0, 18.0]);
    }

    #[test]
    fn cell_coords_map_axis_names() {
        let grid = grid_2x3(2);
        let coords = grid.cell_coords(&[1, 2]);
        assert_eq!(coords["alt"], 20.0);
        assert_eq!(coords["lat"], 60.0);
    }

    #[test]
    fn single_series_has_one_cell() {
        let grid = GriddedDataset::single_series("s", vec![1.0, 2.0], dates(2)).unwrap();
        let cells: Vec<_> = grid.cells().collect();
        assert_eq!(cells.len(), 1);
        assert!(cells[0].0.is_empty());
        assert_eq!(cells[0].1, vec![1.0, 2.0]);
    }
}
