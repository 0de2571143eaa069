//! Per-cell design matrix assembly.
//!
//! The [`DesignBuilder`] is constructed once per run (it owns the
//! column layout, tags, and labels, which are identical for every
//! cell); [`DesignBuilder::build`] then assembles and cleans the actual
//! matrix for one cell's valid-sample mask and coordinates.

use crate::config::{InflectionMethod, RegressionConfig, TermMethod};
use crate::core::Proxy;
use crate::design::columns::{normalize_columns, ColumnTag, Expansion, TermSource};
use ndarray::Array2;
use std::collections::HashMap;
use std::f64::consts::PI;

/// Harmonic period in samples: one calendar year of monthly data.
const SEASONAL_PERIOD: f64 = 12.0;

/// A cell's cleaned design matrix plus the row/column drop masks needed
/// to pad results back out to the fixed global column layout.
#[derive(Debug, Clone)]
pub struct CellDesign {
    /// Cleaned matrix: kept rows x kept columns, NaN-free.
    pub matrix: Array2<f64>,
    /// Which of the window's rows survived cleanup.
    pub row_kept: Vec<bool>,
    /// Which of the full column layout survived cleanup.
    pub col_kept: Vec<bool>,
}

impl CellDesign {
    pub fn kept_column_indices(&self) -> Vec<usize> {
        self.col_kept
            .iter()
            .enumerate()
            .filter(|(_, &kept)| kept)
            .map(|(c, _)| c)
            .collect()
    }
}

/// Raw trend/intercept column before expansion.
struct RawTerm {
    source: TermSource,
    values: Vec<f64>,
}

/// Run-wide design-matrix layout and per-cell assembly.
pub struct DesignBuilder {
    n_rows: usize,
    /// Calendar month (1-12) of each output row.
    months: Vec<u32>,
    inflection: Option<(usize, InflectionMethod)>,
    trend_method: TermMethod,
    intercept_method: TermMethod,
    trend_seas: usize,
    intercept_seas: usize,
    /// Number of columns in the trend/intercept block.
    n_trend_cols: usize,
    tags: Vec<ColumnTag>,
    labels: Vec<String>,
}

impl DesignBuilder {
    /// Lay out the full column set for the run.
    ///
    /// `inflection_offset` is already remapped into the output (possibly
    /// yearly-aggregated) index space; `proxies` are the aligned,
    /// preprocessed proxy list, in order.
    pub fn new(
        config: &RegressionConfig,
        months: Vec<u32>,
        inflection_offset: Option<usize>,
        proxies: &[Proxy],
    ) -> Self {
        let inflection = match (inflection_offset, config.inflection) {
            (Some(offset), Some(inf)) => Some((offset, inf.method)),
            _ => None,
        };

        let mut tags = Vec::new();
        let mut labels = Vec::new();

        for raw in raw_term_layout(inflection.map(|(_, m)| m)) {
            let (method, seas) = match raw.0 {
                TermSource::Intercept => (config.intercept_method, config.intercept_seasonal_component),
                _ => (config.trend_method, config.trend_seasonal_component),
            };
            push_expansion_tags(&mut tags, &mut labels, raw.0, raw.1, method, seas);
        }
        let n_trend_cols = tags.len();

        for proxy in proxies.iter().filter(|p| p.is_active()) {
            push_expansion_tags(
                &mut tags,
                &mut labels,
                TermSource::Proxy(proxy.name.clone()),
                None,
                proxy.method,
                proxy.seas_comp,
            );
        }

        Self {
            n_rows: months.len(),
            months,
            inflection,
            trend_method: config.trend_method,
            intercept_method: config.intercept_method,
            trend_seas: config.trend_seasonal_component,
            intercept_seas: config.intercept_seasonal_component,
            n_trend_cols,
            tags,
            labels,
        }
    }

    /// Total number of columns in the fixed layout.
    pub fn n_columns(&self) -> usize {
        self.tags.len()
    }

    pub fn tags(&self) -> &[ColumnTag] {
        &self.tags
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Offset of the inflection point in output index space.
    pub fn inflection_offset(&self) -> Option<usize> {
        self.inflection.map(|(offset, _)| offset)
    }

    /// Assemble, clean, and normalize the design matrix for one cell.
    ///
    /// `valid` marks the non-missing rows of the cell's (preprocessed)
    /// series; `proxies` is the aligned proxy list; `cell_coords` maps
    /// axis names to the cell's coordinate values.
    pub fn build(
        &self,
        valid: &[bool],
        proxies: &[Proxy],
        cell_coords: &HashMap<String, f64>,
    ) -> CellDesign {
        let n = self.n_rows;
        let mut matrix = Array2::from_elem((n, self.n_columns()), f64::NAN);

        self.fill_trend_block(&mut matrix, valid);
        self.fill_proxy_block(&mut matrix, valid, proxies, cell_coords);
        self.cleanup(matrix)
    }

    /// Trend/intercept block: raw ramp/intercept values crossed with the
    /// configured expansion methods. Invalid rows stay NaN.
    fn fill_trend_block(&self, matrix: &mut Array2<f64>, valid: &[bool]) {
        let mut col = 0;
        for RawTerm { source, values } in self.raw_terms() {
            let (method, seas) = match source {
                TermSource::Intercept => (self.intercept_method, self.intercept_seas),
                _ => (self.trend_method, self.trend_seas),
            };
            match method {
                TermMethod::Disabled => {}
                TermMethod::Single => {
                    for (row, &v) in values.iter().enumerate() {
                        if valid[row] {
                            matrix[[row, col]] = v;
                        }
                    }
                    col += 1;
                }
                TermMethod::Harmonic => {
                    for (row, &v) in values.iter().enumerate() {
                        if valid[row] {
                            matrix[[row, col]] = v;
                        }
                    }
                    col += 1;
                    for k in 1..=seas {
                        for (row, &v) in values.iter().enumerate() {
                            if valid[row] {
                                // 1-based sample index sets the phase.
                                let t = (row + 1) as f64;
                                let angle = k as f64 * 2.0 * PI * t / SEASONAL_PERIOD;
                                matrix[[row, col]] = v * angle.sin();
                                matrix[[row, col + 1]] = v * angle.cos();
                            }
                        }
                        col += 2;
                    }
                }
                TermMethod::MonthOfYear => {
                    for month in 1..=12u32 {
                        for (row, &v) in values.iter().enumerate() {
                            if valid[row] {
                                matrix[[row, col]] =
                                    if self.months[row] == month { v } else { 0.0 };
                            }
                        }
                        col += 1;
                    }
                }
            }
        }
        debug_assert_eq!(col, self.n_trend_cols);
    }

    /// Proxy block: each active proxy's series sourced at the cell's
    /// coordinates, then expanded like the trend block (the harmonic
    /// phase here follows the row's index within the window).
    fn fill_proxy_block(
        &self,
        matrix: &mut Array2<f64>,
        valid: &[bool],
        proxies: &[Proxy],
        cell_coords: &HashMap<String, f64>,
    ) {
        let mut col = self.n_trend_cols;
        for proxy in proxies.iter().filter(|p| p.is_active()) {
            let width = proxy.column_count();
            if !proxy.applies_at(cell_coords) {
                // Out of the proxy's applicability bounds: leave NaN.
                col += width;
                continue;
            }
            let coord = proxy
                .tag
                .as_ref()
                .and_then(|tag| cell_coords.get(&tag.axis).copied());
            let series = proxy.series_at(coord);

            match proxy.method {
                TermMethod::Disabled => {}
                TermMethod::Single => {
                    for (row, &ok) in valid.iter().enumerate() {
                        if ok {
                            matrix[[row, col]] = series[row];
                        }
                    }
                    col += 1;
                }
                TermMethod::Harmonic => {
                    for (row, &ok) in valid.iter().enumerate() {
                        if ok {
                            matrix[[row, col]] = series[row];
                        }
                    }
                    col += 1;
                    for k in 1..=proxy.seas_comp {
                        for (row, &ok) in valid.iter().enumerate() {
                            if ok {
                                let angle =
                                    k as f64 * 2.0 * PI * row as f64 / SEASONAL_PERIOD;
                                matrix[[row, col]] = series[row] * angle.sin();
                                matrix[[row, col + 1]] = series[row] * angle.cos();
                            }
                        }
                        col += 2;
                    }
                }
                TermMethod::MonthOfYear => {
                    for month in 1..=12u32 {
                        for (row, &ok) in valid.iter().enumerate() {
                            if ok {
                                matrix[[row, col]] = if self.months[row] == month {
                                    series[row]
                                } else {
                                    0.0
                                };
                            }
                        }
                        col += 1;
                    }
                }
            }
        }
        debug_assert_eq!(col, self.n_columns());
    }

    /// Deactivate degenerate columns, drop all-NaN rows/columns, zero
    /// remaining NaNs, and rescale proxy columns into [-1, 1].
    fn cleanup(&self, mut matrix: Array2<f64>) -> CellDesign {
        let n_cols = self.n_columns();

        for col in 0..n_cols {
            // Entirely zero over the finite rows: inactive for this cell.
            let all_zero = matrix
                .column(col)
                .iter()
                .filter(|v| v.is_finite())
                .all(|&v| v == 0.0);
            // Fewer than three supporting samples cannot constrain a fit.
            let support = matrix
                .column(col)
                .iter()
                .filter(|v| v.is_finite() && **v != 0.0)
                .count();
            if all_zero || support <= 2 {
                matrix.column_mut(col).fill(f64::NAN);
            }
        }

        let row_kept: Vec<bool> = (0..matrix.nrows())
            .map(|r| matrix.row(r).iter().any(|v| v.is_finite()))
            .collect();
        let col_kept: Vec<bool> = (0..n_cols)
            .map(|c| matrix.column(c).iter().any(|v| v.is_finite()))
            .collect();

        let kept_rows: Vec<usize> = row_kept
            .iter()
            .enumerate()
            .filter(|(_, &k)| k)
            .map(|(r, _)| r)
            .collect();
        let kept_cols: Vec<usize> = col_kept
            .iter()
            .enumerate()
            .filter(|(_, &k)| k)
            .map(|(c, _)| c)
            .collect();

        let mut clean = Array2::zeros((kept_rows.len(), kept_cols.len()));
        for (i, &r) in kept_rows.iter().enumerate() {
            for (j, &c) in kept_cols.iter().enumerate() {
                let v = matrix[[r, c]];
                clean[[i, j]] = if v.is_finite() { v } else { 0.0 };
            }
        }

        let is_proxy: Vec<bool> = kept_cols.iter().map(|&c| self.tags[c].is_proxy()).collect();
        normalize_columns(&mut clean, &is_proxy);

        CellDesign {
            matrix: clean,
            row_kept,
            col_kept,
        }
    }

    /// Raw trend/intercept value columns for the configured inflection
    /// model, before method expansion.
    fn raw_terms(&self) -> Vec<RawTerm> {
        let n = self.n_rows;
        let ramp = |len: usize| (1..=len).map(|v| v as f64);

        match self.inflection {
            None => vec![
                RawTerm {
                    source: TermSource::Intercept,
                    values: vec![1.0; n],
                },
                RawTerm {
                    source: TermSource::Trend,
                    values: ramp(n).collect(),
                },
            ],
            Some((offset, InflectionMethod::PiecewiseLinear)) => {
                // Shared intercept, full-range first slope, and a second
                // slope that starts rising at the inflection point.
                let mut second = vec![0.0; n];
                for (k, v) in ramp(n - offset).enumerate() {
                    second[offset + k] = v;
                }
                vec![
                    RawTerm {
                        source: TermSource::Intercept,
                        values: vec![1.0; n],
                    },
                    RawTerm {
                        source: TermSource::Trend,
                        values: ramp(n).collect(),
                    },
                    RawTerm {
                        source: TermSource::Trend,
                        values: second,
                    },
                ]
            }
            Some((offset, InflectionMethod::Independent)) => {
                let mut intercept1 = vec![0.0; n];
                let mut intercept2 = vec![0.0; n];
                let mut trend1 = vec![0.0; n];
                let mut trend2 = vec![0.0; n];
                for row in 0..offset {
                    intercept1[row] = 1.0;
                    trend1[row] = (row + 1) as f64;
                }
                for row in offset..n {
                    intercept2[row] = 1.0;
                    trend2[row] = (row - offset + 1) as f64;
                }
                vec![
                    RawTerm {
                        source: TermSource::Intercept,
                        values: intercept1,
                    },
                    RawTerm {
                        source: TermSource::Trend,
                        values: trend1,
                    },
                    RawTerm {
                        source: TermSource::Intercept,
                        values: intercept2,
                    },
                    RawTerm {
                        source: TermSource::Trend,
                        values: trend2,
                    },
                ]
            }
        }
    }
}

/// The raw (pre-expansion) trend/intercept term layout for an
/// inflection model: `(source, segment)` pairs in column order.
fn raw_term_layout(method: Option<InflectionMethod>) -> Vec<(TermSource, Option<usize>)> {
    match method {
        None => vec![(TermSource::Intercept, None), (TermSource::Trend, None)],
        Some(InflectionMethod::PiecewiseLinear) => vec![
            (TermSource::Intercept, None),
            (TermSource::Trend, Some(0)),
            (TermSource::Trend, Some(1)),
        ],
        Some(InflectionMethod::Independent) => vec![
            (TermSource::Intercept, Some(0)),
            (TermSource::Trend, Some(0)),
            (TermSource::Intercept, Some(1)),
            (TermSource::Trend, Some(1)),
        ],
    }
}

/// Append the tags and labels of one term's expansion.
fn push_expansion_tags(
    tags: &mut Vec<ColumnTag>,
    labels: &mut Vec<String>,
    source: TermSource,
    segment: Option<usize>,
    method: TermMethod,
    seas_comp: usize,
) {
    let mut push = |expansion: Expansion| {
        let tag = ColumnTag {
            source: source.clone(),
            expansion,
            segment,
        };
        labels.push(tag.label(seas_comp));
        tags.push(tag);
    };
    match method {
        TermMethod::Disabled => {}
        TermMethod::Single => push(Expansion::Single),
        TermMethod::Harmonic => {
            push(Expansion::HarmonicBase);
            for k in 1..=seas_comp {
                push(Expansion::HarmonicSin(k));
                push(Expansion::HarmonicCos(k));
            }
        }
        TermMethod::MonthOfYear => {
            for month in 1..=12 {
                push(Expansion::MonthOfYear(month));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InflectionMethod, RegressionConfig, TermMethod};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn months(n: usize) -> Vec<u32> {
        (0..n).map(|k| (k % 12) as u32 + 1).collect()
    }

    fn simple_config() -> RegressionConfig {
        RegressionConfig::default()
    }

    fn proxy(name: &str, values: Vec<f64>) -> Proxy {
        let time: Vec<NaiveDate> = (0..values.len())
            .map(|k| {
                NaiveDate::from_ymd_opt(2000 + (k / 12) as i32, (k % 12) as u32 + 1, 15).unwrap()
            })
            .collect();
        Proxy::series(name, time, values).unwrap()
    }

    #[test]
    fn single_trend_layout_has_two_columns() {
        let builder = DesignBuilder::new(&simple_config(), months(24), None, &[]);
        assert_eq!(builder.n_columns(), 2);
        assert_eq!(builder.labels()[0], "intercept - single - 1");
        assert_eq!(builder.labels()[1], "trend - single - 1");

        let design = builder.build(&vec![true; 24], &[], &HashMap::new());
        assert_eq!(design.matrix.nrows(), 24);
        assert_relative_eq!(design.matrix[[0, 0]], 1.0);
        assert_relative_eq!(design.matrix[[5, 1]], 6.0);
        assert!(design.row_kept.iter().all(|&k| k));
        assert!(design.col_kept.iter().all(|&k| k));
    }

    #[test]
    fn piecewise_linear_second_ramp_starts_at_inflection() {
        let config = simple_config();
        let mut config = config;
        config.inflection = Some(crate::config::Inflection {
            date: NaiveDate::from_ymd_opt(2001, 1, 15).unwrap(),
            method: InflectionMethod::PiecewiseLinear,
        });
        let builder = DesignBuilder::new(&config, months(24), Some(12), &[]);
        assert_eq!(builder.n_columns(), 3);

        let design = builder.build(&vec![true; 24], &[], &HashMap::new());
        // First ramp runs the whole window.
        assert_relative_eq!(design.matrix[[23, 1]], 24.0);
        // Second ramp is zero before and counts from 1 after.
        assert_relative_eq!(design.matrix[[11, 2]], 0.0);
        assert_relative_eq!(design.matrix[[12, 2]], 1.0);
        assert_relative_eq!(design.matrix[[23, 2]], 12.0);
    }

    #[test]
    fn independent_segments_are_disjoint() {
        let mut config = simple_config();
        config.inflection = Some(crate::config::Inflection {
            date: NaiveDate::from_ymd_opt(2001, 1, 15).unwrap(),
            method: InflectionMethod::Independent,
        });
        let builder = DesignBuilder::new(&config, months(24), Some(12), &[]);
        assert_eq!(builder.n_columns(), 4);

        let design = builder.build(&vec![true; 24], &[], &HashMap::new());
        // Segment 1 active only before the inflection.
        assert_relative_eq!(design.matrix[[11, 0]], 1.0);
        assert_relative_eq!(design.matrix[[12, 0]], 0.0);
        assert_relative_eq!(design.matrix[[11, 1]], 12.0);
        assert_relative_eq!(design.matrix[[12, 1]], 0.0);
        // Segment 2 restarts at the inflection point.
        assert_relative_eq!(design.matrix[[12, 2]], 1.0);
        assert_relative_eq!(design.matrix[[12, 3]], 1.0);
        assert_relative_eq!(design.matrix[[23, 3]], 12.0);
    }

    #[test]
    fn harmonic_expansion_column_count_and_phase() {
        let mut config = simple_config();
        config.intercept_method = TermMethod::Harmonic;
        config.intercept_seasonal_component = 2;
        let builder = DesignBuilder::new(&config, months(36), None, &[]);
        // intercept: 1 + 2*2, trend: 1
        assert_eq!(builder.n_columns(), 6);

        let design = builder.build(&vec![true; 36], &[], &HashMap::new());
        // Row 2 (t = 3): sin(2*pi*3/12) = 1 for the first harmonic.
        assert_relative_eq!(design.matrix[[2, 1]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(design.matrix[[2, 2]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn month_of_year_rows_have_exactly_one_active_indicator() {
        let mut config = simple_config();
        config.intercept_method = TermMethod::MonthOfYear;
        let builder = DesignBuilder::new(&config, months(36), None, &[]);
        assert_eq!(builder.n_columns(), 13);

        let design = builder.build(&vec![true; 36], &[], &HashMap::new());
        for row in 0..36 {
            let active: Vec<usize> = (0..12)
                .filter(|&c| design.matrix[[row, c]] != 0.0)
                .collect();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0] as u32 + 1, (row % 12) as u32 + 1);
        }
    }

    #[test]
    fn proxy_columns_are_normalized_into_unit_range() {
        let config = simple_config();
        let p = proxy("solar", (0..24).map(|v| 50.0 + v as f64).collect());
        let builder = DesignBuilder::new(&config, months(24), None, &[p.clone()]);
        assert_eq!(builder.n_columns(), 3);

        let design = builder.build(&vec![true; 24], &[p], &HashMap::new());
        let col: Vec<f64> = design.matrix.column(2).to_vec();
        assert_relative_eq!(col.iter().cloned().fold(f64::INFINITY, f64::min), -1.0);
        assert_relative_eq!(col.iter().cloned().fold(f64::NEG_INFINITY, f64::max), 1.0);
    }

    #[test]
    fn out_of_bounds_proxy_is_dropped_for_the_cell() {
        let config = simple_config();
        let p = proxy("ehf_nh", (0..24).map(|v| v as f64 + 1.0).collect())
            .with_bounds("lat", Some(0.0), None);
        let builder = DesignBuilder::new(&config, months(24), None, &[p.clone()]);

        let mut coords = HashMap::new();
        coords.insert("lat".to_string(), -45.0);
        let design = builder.build(&vec![true; 24], &[p], &coords);
        // Proxy column dropped entirely; trend/intercept survive.
        assert_eq!(design.col_kept, vec![true, true, false]);
        assert_eq!(design.matrix.ncols(), 2);
    }

    #[test]
    fn invalid_rows_are_dropped() {
        let config = simple_config();
        let builder = DesignBuilder::new(&config, months(24), None, &[]);
        let mut valid = vec![true; 24];
        valid[3] = false;
        valid[10] = false;
        let design = builder.build(&valid, &[], &HashMap::new());
        assert_eq!(design.matrix.nrows(), 22);
        assert!(!design.row_kept[3]);
        assert!(!design.row_kept[10]);
    }

    #[test]
    fn low_support_column_is_deactivated() {
        let config = simple_config();
        // Proxy that is zero except in two samples.
        let mut values = vec![0.0; 24];
        values[4] = 1.0;
        values[9] = 2.0;
        let p = proxy("sparse", values);
        let builder = DesignBuilder::new(&config, months(24), None, &[p.clone()]);
        let design = builder.build(&vec![true; 24], &[p], &HashMap::new());
        assert_eq!(design.col_kept, vec![true, true, false]);
    }
}
