//! Ordinary least squares with AR1 (Cochrane-Orcutt) correction.
//!
//! Fits one cell's cleaned design matrix, estimates the lag-1
//! autocorrelation of the residuals while skipping pairs that straddle
//! missing-data gaps, whitens the system with a lower-bidiagonal
//! transform, refits, and reports one trend/significance pair per
//! logical trend segment, scaled to percent (or raw units) per decade.

mod linalg;

pub use linalg::{cholesky, inv_spd, solve_spd};

use crate::design::{group_columns, ColumnTag, ExpansionKind, TermGroup, TermSource};
use ndarray::{Array1, Array2};

/// Minimum contiguous run of trend samples for a meaningful rate.
const MIN_CONTINUOUS_SAMPLES: usize = 10;

/// Variance floor below which residuals count as an exact fit and the
/// autocorrelation is taken to be zero.
const VARIANCE_FLOOR: f64 = 1e-300;

/// How a trend coefficient converts into the reported unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnitScale {
    /// Data are relative anomalies: x100 gives %/decade.
    Percent,
    /// Data are absolute anomalies: raw units/decade.
    Raw,
    /// Absolute data: x100/mean(y) gives %/decade of the mean level.
    PercentOfMean,
}

/// Per-run context for fitting one cell.
#[derive(Debug, Clone)]
pub struct FitContext {
    /// Tags of the kept (surviving) columns, in matrix order.
    pub tags: Vec<ColumnTag>,
    /// Window-row index of each matrix row; adjacent rows with
    /// non-consecutive indices straddle a missing-data gap.
    pub valid_rows: Vec<usize>,
    /// Samples per decade: 120 for monthly data, 10 for yearly.
    pub samples_per_decade: f64,
    pub unit_scale: UnitScale,
    /// Expected number of trend segments (1, or 2 with an inflection).
    pub n_segments: usize,
}

/// One reported trend segment.
///
/// Segment slots follow the trend-column layout of the inflection
/// model. For independent segments each slot is an absolute slope. For
/// a piecewise-linear inflection the first slot is the full-range
/// slope and the second slot is the coefficient of the post-inflection
/// ramp, i.e. the *change* in slope at the inflection point; the
/// absolute post-inflection slope is the sum of the two.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentTrend {
    /// Trend magnitude in %/decade (or raw units/decade for anomalies).
    pub trend: f64,
    /// Significance ratio `|coef| / sqrt(var(coef))`; values of about 2
    /// or more are conventionally treated as significant.
    pub significance: f64,
}

impl SegmentTrend {
    fn nan() -> Self {
        Self {
            trend: f64::NAN,
            significance: f64::NAN,
        }
    }
}

/// Successful fit output for one cell.
#[derive(Debug, Clone)]
pub struct FitOutput {
    /// Plain OLS coefficients.
    pub beta: Array1<f64>,
    /// AR1-corrected coefficients.
    pub betaa: Array1<f64>,
    /// Diagonal of the whitened coefficient covariance.
    pub covbetaa_diag: Array1<f64>,
    /// Estimated lag-1 residual autocorrelation.
    pub phi: f64,
    /// One entry per trend segment.
    pub segments: Vec<SegmentTrend>,
}

/// Outcome of fitting one cell: a typed value, never a panic.
#[derive(Debug, Clone)]
pub enum CellFit {
    Fitted(Box<FitOutput>),
    /// The normal equations were singular (collinear columns); the
    /// cell's outputs stay NaN and the run continues.
    Singular,
}

/// Fit one cell: OLS, AR1 estimate, whitened refit, trend extraction.
pub fn fit_cell(x: &Array2<f64>, y: &Array1<f64>, ctx: &FitContext) -> CellFit {
    debug_assert_eq!(x.nrows(), y.len());
    debug_assert_eq!(x.ncols(), ctx.tags.len());
    debug_assert_eq!(x.nrows(), ctx.valid_rows.len());

    let xtx = x.t().dot(x);
    let xty = x.t().dot(y);
    let beta = match solve_spd(&xtx, &xty) {
        Some(beta) => beta,
        None => return CellFit::Singular,
    };

    let residuals = y - &x.dot(&beta);
    let phi = lag1_autocorrelation(&residuals, &ctx.valid_rows);

    let (xs, ys, epsilon) = whiten(x, y, &residuals, phi, &ctx.valid_rows);

    let xstx = xs.t().dot(&xs);
    let inv = match inv_spd(&xstx) {
        Some(inv) => inv,
        None => return CellFit::Singular,
    };
    let betaa = inv.dot(&xs.t().dot(&ys));
    let eps_var = population_variance(&epsilon);
    let covbetaa_diag: Array1<f64> = (0..inv.nrows()).map(|i| eps_var * inv[[i, i]]).collect();

    let segments = extract_segments(x, y, &betaa, &covbetaa_diag, ctx);

    CellFit::Fitted(Box::new(FitOutput {
        beta,
        betaa,
        covbetaa_diag,
        phi,
        segments,
    }))
}

/// Population variance (the `1/n` convention, matching the residual
/// normalization of the autocorrelation estimator).
fn population_variance(values: &Array1<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.sum() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

/// Lag-1 autocorrelation of the residuals, excluding every pair whose
/// two samples are not adjacent on the original time axis.
fn lag1_autocorrelation(residuals: &Array1<f64>, valid_rows: &[usize]) -> f64 {
    let n = residuals.len();
    if n < 2 {
        return 0.0;
    }
    let variance = population_variance(residuals);
    if variance < VARIANCE_FLOOR {
        // Exact fit: no autocorrelation to correct for.
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 1..n {
        if valid_rows[i] == valid_rows[i - 1] + 1 {
            sum += residuals[i] * residuals[i - 1];
        }
    }
    let phi = sum / ((n - 1) as f64 * variance);
    // Keep the whitening factor sqrt(1 - phi^2) real.
    phi.clamp(-0.999, 0.999)
}

/// Apply the lower-bidiagonal Cochrane-Orcutt whitening transform to
/// the design matrix, the response, and the residuals.
///
/// Rows that directly follow their predecessor in time are replaced by
/// `row - phi * previous`; the first row and every post-gap row are
/// scaled by `sqrt(1 - phi^2)`.
fn whiten(
    x: &Array2<f64>,
    y: &Array1<f64>,
    residuals: &Array1<f64>,
    phi: f64,
    valid_rows: &[usize],
) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
    let n = x.nrows();
    let k = x.ncols();
    let damp = (1.0 - phi * phi).sqrt();

    let mut xs = Array2::zeros((n, k));
    let mut ys = Array1::zeros(n);
    let mut epsilon = Array1::zeros(n);

    for i in 0..n {
        let contiguous = i > 0 && valid_rows[i] == valid_rows[i - 1] + 1;
        if contiguous {
            for j in 0..k {
                xs[[i, j]] = x[[i, j]] - phi * x[[i - 1, j]];
            }
            ys[i] = y[i] - phi * y[i - 1];
            epsilon[i] = residuals[i] - phi * residuals[i - 1];
        } else {
            for j in 0..k {
                xs[[i, j]] = damp * x[[i, j]];
            }
            ys[i] = damp * y[i];
            epsilon[i] = damp * residuals[i];
        }
    }
    (xs, ys, epsilon)
}

/// Trend groups of the kept columns, ordered by segment.
fn trend_groups(tags: &[ColumnTag]) -> Vec<TermGroup> {
    let mut groups: Vec<TermGroup> = group_columns(tags)
        .into_iter()
        .filter(|g| g.source == TermSource::Trend)
        .collect();
    groups.sort_by_key(|g| g.segment);
    groups
}

/// Trend ramp of the segment active at each fitted row: the
/// elementwise maximum over the group ramps. Independent segments are
/// disjoint, and the piecewise-linear secondary ramp never exceeds the
/// full-range one, so the maximum is the active ramp in both models.
fn combined_ramp(x: &Array2<f64>, groups: &[TermGroup]) -> Vec<f64> {
    (0..x.nrows())
        .map(|row| {
            groups
                .iter()
                .map(|g| match g.kind {
                    // Month-of-year sub-columns hold the ramp in exactly
                    // one column per row.
                    ExpansionKind::MonthOfYear => {
                        g.columns.iter().map(|&c| x[[row, c]]).sum::<f64>()
                    }
                    _ => x[[row, g.leading_column()]],
                })
                .fold(0.0_f64, f64::max)
        })
        .collect()
}

/// Length of the contiguous run usable for the trend rate: rows whose
/// ramp value grew by exactly 1, plus inflection resets back to 1.
fn continuous_run(ramp: &[f64], has_inflection: bool) -> usize {
    let mut count = 0;
    for (i, &value) in ramp.iter().enumerate() {
        if i == 0 {
            count += 1;
            continue;
        }
        let step = value - ramp[i - 1];
        if (step - 1.0).abs() < 1e-9 {
            count += 1;
        } else if has_inflection && (value - 1.0).abs() < 1e-9 {
            // The ramp resets to 1 where the second segment begins.
            count += 1;
        }
    }
    count
}

/// One trend/significance pair per configured segment, scaled per
/// decade. Missing groups (all columns dropped for this cell) and
/// under-supported fits report NaN.
fn extract_segments(
    x: &Array2<f64>,
    y: &Array1<f64>,
    betaa: &Array1<f64>,
    covbetaa_diag: &Array1<f64>,
    ctx: &FitContext,
) -> Vec<SegmentTrend> {
    let groups = trend_groups(&ctx.tags);
    let mut segments = vec![SegmentTrend::nan(); ctx.n_segments];

    if x.ncols() <= 1 || groups.is_empty() {
        return segments;
    }
    let ramp = combined_ramp(x, &groups);
    if continuous_run(&ramp, ctx.n_segments > 1) < MIN_CONTINUOUS_SAMPLES {
        return segments;
    }

    let unit_factor = match ctx.unit_scale {
        UnitScale::Percent => 100.0,
        UnitScale::Raw => 1.0,
        UnitScale::PercentOfMean => {
            let mean = y.sum() / y.len() as f64;
            if mean == 0.0 {
                f64::NAN
            } else {
                100.0 / mean
            }
        }
    };

    for group in &groups {
        let slot = group.segment.unwrap_or(0);
        if slot >= segments.len() {
            continue;
        }
        let (coef, variance) = match group.kind {
            ExpansionKind::MonthOfYear => {
                let coefs: Vec<f64> = group.columns.iter().map(|&c| betaa[c]).collect();
                let vars: Vec<f64> = group.columns.iter().map(|&c| covbetaa_diag[c]).collect();
                (mean(&coefs), mean(&vars))
            }
            _ => (
                betaa[group.leading_column()],
                covbetaa_diag[group.leading_column()],
            ),
        };
        segments[slot] = SegmentTrend {
            trend: coef * ctx.samples_per_decade * unit_factor,
            significance: (coef / variance.sqrt()).abs(),
        };
    }
    segments
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Expansion;
    use approx::assert_relative_eq;

    fn tag(source: TermSource, segment: Option<usize>) -> ColumnTag {
        ColumnTag {
            source,
            expansion: Expansion::Single,
            segment,
        }
    }

    /// Intercept + linear trend design over `n` samples.
    fn linear_design(n: usize) -> (Array2<f64>, Vec<ColumnTag>, Vec<usize>) {
        let mut x = Array2::zeros((n, 2));
        for row in 0..n {
            x[[row, 0]] = 1.0;
            x[[row, 1]] = (row + 1) as f64;
        }
        let tags = vec![
            tag(TermSource::Intercept, None),
            tag(TermSource::Trend, None),
        ];
        (x, tags, (0..n).collect())
    }

    fn ctx(tags: Vec<ColumnTag>, valid_rows: Vec<usize>, unit: UnitScale) -> FitContext {
        FitContext {
            tags,
            valid_rows,
            samples_per_decade: 120.0,
            unit_scale: unit,
            n_segments: 1,
        }
    }

    #[test]
    fn recovers_noise_free_slope() {
        let (x, tags, rows) = linear_design(120);
        let y: Array1<f64> = (0..120).map(|t| 10.0 + 0.5 * (t + 1) as f64).collect();
        let fit = fit_cell(&x, &y, &ctx(tags, rows, UnitScale::Raw));
        let out = match fit {
            CellFit::Fitted(out) => out,
            CellFit::Singular => panic!("unexpected singular fit"),
        };
        assert_relative_eq!(out.beta[1], 0.5, epsilon = 1e-9);
        assert_relative_eq!(out.betaa[1], 0.5, epsilon = 1e-9);
        // 0.5 units/month = 60 units/decade.
        assert_relative_eq!(out.segments[0].trend, 60.0, epsilon = 1e-6);
        // Zero residual variance: the significance ratio blows up.
        assert!(out.segments[0].significance > 1e3 || out.segments[0].significance.is_infinite());
    }

    #[test]
    fn whitening_with_zero_phi_matches_ols() {
        // Noise-free fit forces phi to 0, so betaa must equal beta.
        let (x, tags, rows) = linear_design(60);
        let y: Array1<f64> = (0..60).map(|t| 3.0 - 0.25 * (t + 1) as f64).collect();
        let out = match fit_cell(&x, &y, &ctx(tags, rows, UnitScale::Raw)) {
            CellFit::Fitted(out) => out,
            CellFit::Singular => panic!("unexpected singular fit"),
        };
        assert_relative_eq!(out.phi, 0.0);
        for j in 0..2 {
            assert_relative_eq!(out.beta[j], out.betaa[j], epsilon = 1e-9);
        }
    }

    #[test]
    fn collinear_columns_report_singular() {
        let n = 30;
        let mut x = Array2::zeros((n, 3));
        for row in 0..n {
            x[[row, 0]] = 1.0;
            x[[row, 1]] = (row + 1) as f64;
            x[[row, 2]] = 2.0 * (row + 1) as f64; // exact duplicate of the ramp
        }
        let tags = vec![
            tag(TermSource::Intercept, None),
            tag(TermSource::Trend, None),
            tag(TermSource::Proxy("dup".into()), None),
        ];
        let y: Array1<f64> = (0..n).map(|t| t as f64).collect();
        assert!(matches!(
            fit_cell(&x, &y, &ctx(tags, (0..n).collect(), UnitScale::Raw)),
            CellFit::Singular
        ));
    }

    #[test]
    fn autocorrelation_skips_gap_pairs() {
        // Residual pattern alternating around a gap; the pair across the
        // gap would dominate if it were counted.
        let residuals: Array1<f64> = vec![1.0, 1.0, 1.0, -5.0, 1.0].into();
        let contiguous: Vec<usize> = vec![0, 1, 2, 3, 4];
        let gapped: Vec<usize> = vec![0, 1, 2, 10, 11];
        let phi_contiguous = lag1_autocorrelation(&residuals, &contiguous);
        let phi_gapped = lag1_autocorrelation(&residuals, &gapped);
        assert!(phi_contiguous != phi_gapped);
    }

    #[test]
    fn percent_of_mean_scaling() {
        let (x, tags, rows) = linear_design(120);
        // Mean level 100, slope 0.1/month => 12 units/decade = 12 %/decade.
        let y: Array1<f64> = (0..120).map(|t| 94.0 + 0.1 * (t + 1) as f64).collect();
        let out = match fit_cell(&x, &y, &ctx(tags, rows, UnitScale::PercentOfMean)) {
            CellFit::Fitted(out) => out,
            CellFit::Singular => panic!("unexpected singular fit"),
        };
        let mean_y = 94.0 + 0.1 * 60.5;
        assert_relative_eq!(
            out.segments[0].trend,
            0.1 * 120.0 * 100.0 / mean_y,
            epsilon = 1e-6
        );
    }

    #[test]
    fn short_continuous_run_reports_nan_trend() {
        let (x, tags, _) = linear_design(8);
        let y: Array1<f64> = (0..8).map(|t| t as f64).collect();
        let out = match fit_cell(&x, &y, &ctx(tags, (0..8).collect(), UnitScale::Raw)) {
            CellFit::Fitted(out) => out,
            CellFit::Singular => panic!("unexpected singular fit"),
        };
        assert!(out.segments[0].trend.is_nan());
        // Coefficients are still reported for diagnostics.
        assert_relative_eq!(out.beta[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn ar1_noise_is_whitened() {
        // AR(1) noise with known phi; the estimator should land close
        // and the corrected coefficients should stay near the truth.
        let n = 240;
        let (x, tags, rows) = linear_design(n);
        let true_phi = 0.6;
        let mut noise = 0.0;
        let y: Array1<f64> = (0..n)
            .map(|t| {
                // Deterministic pseudo-noise sequence.
                let shock = ((t * 2654435761 % 1000) as f64 / 1000.0 - 0.5) * 2.0;
                noise = true_phi * noise + shock;
                20.0 + 0.05 * (t + 1) as f64 + noise
            })
            .collect();
        let out = match fit_cell(&x, &y, &ctx(tags, rows, UnitScale::Raw)) {
            CellFit::Fitted(out) => out,
            CellFit::Singular => panic!("unexpected singular fit"),
        };
        assert!(out.phi > 0.3, "phi = {}", out.phi);
        assert_relative_eq!(out.betaa[1], 0.05, epsilon = 0.02);
    }
}
