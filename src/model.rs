//! Run orchestration: the cell loop and output assembly.
//!
//! [`run`] validates inputs once, aligns dataset and proxies, builds
//! the run-wide design layout, then walks every grid cell in row-major
//! order: preprocess, build, fit, scatter the results into the global
//! NaN-initialized output arrays. A cell that cannot be fitted leaves
//! NaN behind and never aborts the run.

use crate::align::align;
use crate::config::RegressionConfig;
use crate::core::{GriddedDataset, Proxy};
use crate::design::DesignBuilder;
use crate::error::{Result, TrendError};
use crate::fit::{fit_cell, CellFit, FitContext, UnitScale};
use crate::preprocess::Preprocessor;
use chrono::NaiveDate;
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};

/// Diagnostic bundle handed to downstream reporting and serialization.
///
/// `column_labels.len()` always equals the last-axis size of `x_all`,
/// `beta_all`, and `betaa_all`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Per-cell design matrices, padded back to the full column layout:
    /// `(time, ...aux, column)`.
    pub x_all: ArrayD<f64>,
    /// OLS coefficients per cell: `(...aux, column)`.
    pub beta_all: ArrayD<f64>,
    /// AR1-corrected coefficients per cell: `(...aux, column)`.
    pub betaa_all: ArrayD<f64>,
    /// Dataset axis names, starting with `"time"`.
    pub dim_names: Vec<String>,
    /// One label per design-matrix column, post-expansion.
    pub column_labels: Vec<String>,
    /// Output time axis (monthly, or yearly after aggregation).
    pub time: Vec<NaiveDate>,
    /// The preprocessed response values the fits actually saw:
    /// `(time, ...aux)`.
    pub data_values: ArrayD<f64>,
}

/// Full result of one regression run.
#[derive(Debug, Clone)]
pub struct TrendAnalysis {
    /// Trend magnitude per cell, in %/decade (or raw units/decade for
    /// anomaly data). With an inflection point the trailing axis holds
    /// one value per segment; see [`crate::fit::SegmentTrend`] for the
    /// piecewise-linear segment semantics.
    pub trend: ArrayD<f64>,
    /// Significance ratio per cell, shaped like `trend`.
    pub significance: ArrayD<f64>,
    pub diagnostic: Diagnostic,
}

/// Run the regression over every cell of the dataset.
///
/// Sequential by design: each cell reads only shared immutable inputs
/// and writes only its own output slots, so failures never propagate
/// between cells.
pub fn run(
    dataset: &GriddedDataset,
    proxies: &[Proxy],
    config: &RegressionConfig,
) -> Result<TrendAnalysis> {
    config.validate()?;
    validate_proxy_axes(dataset, proxies)?;

    let window = align(dataset, proxies, config)?;
    let window_dates = dataset.time[window.date_start..window.date_end].to_vec();
    let preprocessor = Preprocessor::new(window_dates, config);

    let mut prepared = window.proxies.clone();
    for proxy in &mut prepared {
        preprocessor.apply_proxy(proxy);
    }

    let inflection_offset = match window.inflection_offset {
        Some(offset) => Some(preprocessor.remap_inflection(offset)?),
        None => None,
    };
    let builder = DesignBuilder::new(
        config,
        preprocessor.output_months(),
        inflection_offset,
        &prepared,
    );

    let aux_shape = dataset.aux_shape();
    let n_out = preprocessor.output_len();
    let n_cols = builder.n_columns();
    let n_segments = if config.inflection.is_some() { 2 } else { 1 };

    let trend_shape: Vec<usize> = if n_segments > 1 {
        aux_shape.iter().copied().chain([n_segments]).collect()
    } else {
        aux_shape.clone()
    };
    let mut trend = ArrayD::from_elem(IxDyn(&trend_shape), f64::NAN);
    let mut significance = ArrayD::from_elem(IxDyn(&trend_shape), f64::NAN);

    let x_all_shape: Vec<usize> = [n_out]
        .into_iter()
        .chain(aux_shape.iter().copied())
        .chain([n_cols])
        .collect();
    let coef_shape: Vec<usize> = aux_shape.iter().copied().chain([n_cols]).collect();
    let values_shape: Vec<usize> = [n_out].into_iter().chain(aux_shape.iter().copied()).collect();

    let mut x_all = ArrayD::from_elem(IxDyn(&x_all_shape), f64::NAN);
    let mut beta_all = ArrayD::from_elem(IxDyn(&coef_shape), f64::NAN);
    let mut betaa_all = ArrayD::from_elem(IxDyn(&coef_shape), f64::NAN);
    let mut data_values = ArrayD::from_elem(IxDyn(&values_shape), f64::NAN);

    let samples_per_decade = if preprocessor.is_yearly() { 10.0 } else { 120.0 };
    let unit_scale = unit_scale(config);

    for (index, series) in dataset.cells() {
        let windowed = &series[window.date_start..window.date_end];
        let processed = preprocessor.apply(windowed);
        let valid: Vec<bool> = processed.iter().map(|v| v.is_finite()).collect();

        for (row, &value) in processed.iter().enumerate() {
            let mut slot = Vec::with_capacity(index.len() + 1);
            slot.push(row);
            slot.extend_from_slice(&index);
            data_values[IxDyn(&slot)] = value;
        }

        let valid_count = valid.iter().filter(|&&v| v).count();
        if (valid_count as f64 / n_out as f64) <= config.skip_fraction {
            debug!("cell {index:?}: valid fraction below threshold, skipped");
            continue;
        }

        let design = builder.build(&valid, &prepared, &dataset.cell_coords(&index));
        let kept_rows: Vec<usize> = design
            .row_kept
            .iter()
            .enumerate()
            .filter(|(_, &k)| k)
            .map(|(r, _)| r)
            .collect();
        let kept_cols = design.kept_column_indices();

        let y: ndarray::Array1<f64> = kept_rows.iter().map(|&r| processed[r]).collect();
        let context = FitContext {
            tags: kept_cols
                .iter()
                .map(|&c| builder.tags()[c].clone())
                .collect(),
            valid_rows: kept_rows.clone(),
            samples_per_decade,
            unit_scale,
            n_segments,
        };

        // Recorded even when the fit fails, so collinear columns can be
        // inspected afterwards.
        for (i, &row) in kept_rows.iter().enumerate() {
            for (j, &col) in kept_cols.iter().enumerate() {
                let mut at = Vec::with_capacity(index.len() + 2);
                at.push(row);
                at.extend_from_slice(&index);
                at.push(col);
                x_all[IxDyn(&at)] = design.matrix[[i, j]];
            }
        }

        match fit_cell(&design.matrix, &y, &context) {
            CellFit::Singular => {
                warn!(
                    "cell {index:?}: singular normal equations (collinear terms), \
                     outputs set to NaN"
                );
            }
            CellFit::Fitted(output) => {
                for (slot, segment) in output.segments.iter().enumerate() {
                    let mut at = index.clone();
                    if n_segments > 1 {
                        at.push(slot);
                    }
                    trend[IxDyn(&at)] = segment.trend;
                    significance[IxDyn(&at)] = segment.significance;
                }

                for (j, &col) in kept_cols.iter().enumerate() {
                    let mut at = index.clone();
                    at.push(col);
                    beta_all[IxDyn(&at)] = output.beta[j];
                    betaa_all[IxDyn(&at)] = output.betaa[j];
                }
            }
        }
    }

    Ok(TrendAnalysis {
        trend,
        significance,
        diagnostic: Diagnostic {
            x_all,
            beta_all,
            betaa_all,
            dim_names: dataset.dim_names.clone(),
            column_labels: builder.labels().to_vec(),
            time: preprocessor.output_time(),
            data_values,
        },
    })
}

/// Unit conversion for the reported trend, from the anomaly settings.
fn unit_scale(config: &RegressionConfig) -> UnitScale {
    use crate::config::AnomalyMethod;
    match config.anomaly {
        Some(AnomalyMethod::Relative) => UnitScale::Percent,
        Some(AnomalyMethod::Absolute) => UnitScale::Raw,
        None => {
            if config.data_unit.starts_with("anom") {
                UnitScale::Raw
            } else {
                UnitScale::PercentOfMean
            }
        }
    }
}

/// Tagged proxies must reference an axis the dataset actually has;
/// catching this here keeps shape errors out of the cell loop.
fn validate_proxy_axes(dataset: &GriddedDataset, proxies: &[Proxy]) -> Result<()> {
    for proxy in proxies.iter().filter(|p| p.is_active()) {
        if let Some(tag) = &proxy.tag {
            if !dataset.dim_names.contains(&tag.axis) {
                return Err(TrendError::AxisNotFound(tag.axis.clone()));
            }
        }
    }
    Ok(())
}
