//! Temporal aggregation and anomaly conversion.
//!
//! A [`Preprocessor`] is built once per run from the aligned window's
//! monthly dates and the configuration, then applied identically to the
//! ozone series of every cell and to every active proxy column. The
//! same instance also owns the output time axis and the remapping of
//! the inflection offset into aggregated index space.

use crate::config::{AnomalyMethod, AveragingWindow, RegressionConfig};
use crate::core::Proxy;
use crate::error::{Result, TrendError};
use chrono::{Datelike, NaiveDate};
use ndarray::Array2;

/// Precomputed aggregation plan for one analysis window.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    averaging: AveragingWindow,
    anomaly: Option<AnomalyMethod>,
    skip_fraction: f64,
    /// Monthly dates of the analysis window.
    months: Vec<NaiveDate>,
    /// Calendar-year buckets over `months`, in order of appearance:
    /// `(representative date, member indices)`.
    buckets: Vec<(NaiveDate, Vec<usize>)>,
}

impl Preprocessor {
    /// Build the plan for a window given by its monthly dates.
    pub fn new(months: Vec<NaiveDate>, config: &RegressionConfig) -> Self {
        let mut buckets: Vec<(NaiveDate, Vec<usize>)> = Vec::new();
        for (k, date) in months.iter().enumerate() {
            match buckets.last_mut() {
                Some((rep, members)) if rep.year() == date.year() => members.push(k),
                _ => buckets.push((*date, vec![k])),
            }
        }
        Self {
            averaging: config.averaging.clone(),
            anomaly: config.anomaly,
            skip_fraction: config.skip_fraction,
            months,
            buckets,
        }
    }

    /// The time axis of the preprocessed series.
    pub fn output_time(&self) -> Vec<NaiveDate> {
        match self.averaging {
            AveragingWindow::None => self.months.clone(),
            _ => self.buckets.iter().map(|(rep, _)| *rep).collect(),
        }
    }

    /// Length of the preprocessed series.
    pub fn output_len(&self) -> usize {
        match self.averaging {
            AveragingWindow::None => self.months.len(),
            _ => self.buckets.len(),
        }
    }

    /// Calendar month (1-12) of each output sample, used by the
    /// month-of-year design-matrix expansion.
    pub fn output_months(&self) -> Vec<u32> {
        self.output_time().iter().map(|d| d.month()).collect()
    }

    /// Whether the output resolution is yearly rather than monthly.
    pub fn is_yearly(&self) -> bool {
        self.averaging.is_aggregating()
    }

    /// Aggregate and anomaly-convert one series over the window.
    ///
    /// NaN marks missing input months and aggregation buckets whose
    /// valid fraction is at or below the skip threshold.
    pub fn apply(&self, series: &[f64]) -> Vec<f64> {
        let aggregated = match &self.averaging {
            AveragingWindow::None => series.to_vec(),
            AveragingWindow::Yearly => self.aggregate(series, None),
            AveragingWindow::Months(months) => self.aggregate(series, Some(months)),
        };
        match self.anomaly {
            None => aggregated,
            Some(method) => {
                if self.averaging.is_aggregating() {
                    whole_series_anomaly(&aggregated, method)
                } else {
                    monthly_anomaly(&aggregated, &self.months, method)
                }
            }
        }
    }

    /// Apply the plan to every column of an active proxy, replacing its
    /// data and time axis with the aggregated versions.
    pub fn apply_proxy(&self, proxy: &mut Proxy) {
        if !proxy.is_active() {
            return;
        }
        let n_out = self.output_len();
        let mut data = Array2::zeros((n_out, proxy.data.ncols()));
        for col in 0..proxy.data.ncols() {
            let series: Vec<f64> = proxy.data.column(col).to_vec();
            let out = self.apply(&series);
            for (row, value) in out.into_iter().enumerate() {
                data[[row, col]] = value;
            }
        }
        proxy.data = data;
        proxy.time = self.output_time();
    }

    /// One bucket mean per calendar year. With `months` given, only the
    /// listed calendar months count, and the valid fraction is taken
    /// over the requested month count.
    fn aggregate(&self, series: &[f64], months: Option<&[u32]>) -> Vec<f64> {
        self.buckets
            .iter()
            .map(|(_, members)| {
                let selected: Vec<usize> = match months {
                    None => members.clone(),
                    Some(wanted) => members
                        .iter()
                        .copied()
                        .filter(|&k| wanted.contains(&self.months[k].month()))
                        .collect(),
                };
                let denominator = match months {
                    None => members.len(),
                    Some(wanted) => wanted.len(),
                };
                let valid: Vec<f64> = selected
                    .iter()
                    .map(|&k| series[k])
                    .filter(|v| v.is_finite())
                    .collect();
                if denominator == 0
                    || valid.len() as f64 / denominator as f64 <= self.skip_fraction
                {
                    f64::NAN
                } else {
                    valid.iter().sum::<f64>() / valid.len() as f64
                }
            })
            .collect()
    }

    /// Map a monthly inflection offset into the aggregated index space:
    /// the index of the year bucket containing the inflection month.
    ///
    /// The remapped offset must leave both segments non-empty, otherwise
    /// the inflection cannot be represented on the aggregated axis.
    pub fn remap_inflection(&self, offset: usize) -> Result<usize> {
        if !self.averaging.is_aggregating() {
            return Ok(offset);
        }
        let bucket = self
            .buckets
            .iter()
            .position(|(_, members)| members.contains(&offset))
            .ok_or_else(|| TrendError::InflectionOutOfRange(format!("month offset {offset}")))?;
        if bucket == 0 || bucket + 1 >= self.buckets.len() {
            return Err(TrendError::InflectionOutOfRange(format!(
                "month offset {offset} maps to the edge of the aggregated axis"
            )));
        }
        Ok(bucket)
    }
}

/// Remove the per-calendar-month climatology from a monthly series.
fn monthly_anomaly(series: &[f64], dates: &[NaiveDate], method: AnomalyMethod) -> Vec<f64> {
    let mut clim = [f64::NAN; 12];
    for month in 1..=12u32 {
        let values: Vec<f64> = series
            .iter()
            .zip(dates.iter())
            .filter(|(v, d)| d.month() == month && v.is_finite())
            .map(|(v, _)| *v)
            .collect();
        if !values.is_empty() {
            clim[month as usize - 1] = values.iter().sum::<f64>() / values.len() as f64;
        }
    }
    series
        .iter()
        .zip(dates.iter())
        .map(|(&v, d)| {
            let c = clim[d.month() as usize - 1];
            match method {
                AnomalyMethod::Absolute => v - c,
                AnomalyMethod::Relative => (v - c) / c,
            }
        })
        .collect()
}

/// Remove the overall mean from an aggregated series.
fn whole_series_anomaly(series: &[f64], method: AnomalyMethod) -> Vec<f64> {
    let valid: Vec<f64> = series.iter().copied().filter(|v| v.is_finite()).collect();
    if valid.is_empty() {
        return series.to_vec();
    }
    let mean = valid.iter().sum::<f64>() / valid.len() as f64;
    series
        .iter()
        .map(|&v| match method {
            AnomalyMethod::Absolute => v - mean,
            AnomalyMethod::Relative => (v - mean) / mean,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn monthly_dates(start_year: i32, start_month: u32, n: usize) -> Vec<NaiveDate> {
        (0..n)
            .map(|k| {
                let month0 = start_month as usize - 1 + k;
                NaiveDate::from_ymd_opt(
                    start_year + (month0 / 12) as i32,
                    (month0 % 12) as u32 + 1,
                    15,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn no_averaging_is_identity_without_anomaly() {
        let config = RegressionConfig::default();
        let pre = Preprocessor::new(monthly_dates(2000, 1, 24), &config);
        let series: Vec<f64> = (0..24).map(f64::from).collect();
        assert_eq!(pre.apply(&series), series);
        assert_eq!(pre.output_len(), 24);
    }

    #[test]
    fn yearly_mean_per_calendar_year() {
        let config = RegressionConfig::new().with_averaging(AveragingWindow::Yearly);
        let pre = Preprocessor::new(monthly_dates(2000, 1, 24), &config);
        let series: Vec<f64> = (0..24).map(f64::from).collect();
        let out = pre.apply(&series);
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0], 5.5);
        assert_relative_eq!(out[1], 17.5);
    }

    #[test]
    fn partial_first_year_uses_its_own_months() {
        // Window starting mid-year: the first bucket only holds Jul-Dec.
        let config = RegressionConfig::new()
            .with_averaging(AveragingWindow::Yearly)
            .with_skip_fraction(0.0);
        let pre = Preprocessor::new(monthly_dates(2000, 7, 18), &config);
        let series: Vec<f64> = (0..18).map(f64::from).collect();
        let out = pre.apply(&series);
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0], 2.5); // mean of 0..=5
        assert_relative_eq!(out[1], 11.5); // mean of 6..=17
    }

    #[test]
    fn sparse_year_is_skipped_at_threshold() {
        let config = RegressionConfig::new().with_averaging(AveragingWindow::Yearly);
        let pre = Preprocessor::new(monthly_dates(2000, 1, 24), &config);
        let mut series: Vec<f64> = (0..24).map(f64::from).collect();
        // 9 of 12 valid months = 0.75, which is <= 0.75: skip.
        for k in 0..3 {
            series[k] = f64::NAN;
        }
        let out = pre.apply(&series);
        assert!(out[0].is_nan());
        assert!(out[1].is_finite());

        // 10 of 12 = 0.833 survives.
        series[2] = 2.0;
        let out = pre.apply(&series);
        assert!(out[0].is_finite());
    }

    #[test]
    fn month_subset_averages_only_requested_months() {
        let config =
            RegressionConfig::new().with_averaging(AveragingWindow::Months(vec![6, 7, 8]));
        let pre = Preprocessor::new(monthly_dates(2000, 1, 12), &config);
        let series: Vec<f64> = (0..12).map(f64::from).collect();
        let out = pre.apply(&series);
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0], 6.0); // mean of indices 5, 6, 7
    }

    #[test]
    fn month_subset_missing_month_hits_threshold() {
        let config = RegressionConfig::new()
            .with_averaging(AveragingWindow::Months(vec![6, 7, 8]))
            .with_skip_fraction(0.75);
        let pre = Preprocessor::new(monthly_dates(2000, 1, 12), &config);
        let mut series: Vec<f64> = (0..12).map(f64::from).collect();
        series[6] = f64::NAN; // 2 of 3 = 0.667 <= 0.75: skip
        let out = pre.apply(&series);
        assert!(out[0].is_nan());
    }

    #[test]
    fn monthly_absolute_anomaly_removes_climatology() {
        let config = RegressionConfig::new().with_anomaly(AnomalyMethod::Absolute);
        let dates = monthly_dates(2000, 1, 24);
        let pre = Preprocessor::new(dates.clone(), &config);
        // Pure seasonal cycle: anomaly must be zero everywhere.
        let series: Vec<f64> = dates
            .iter()
            .map(|d| 300.0 + 10.0 * f64::from(d.month()))
            .collect();
        let out = pre.apply(&series);
        for v in out {
            assert_relative_eq!(v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn monthly_relative_anomaly_divides_by_climatology() {
        let config = RegressionConfig::new().with_anomaly(AnomalyMethod::Relative);
        let dates = monthly_dates(2000, 1, 24);
        let pre = Preprocessor::new(dates.clone(), &config);
        let mut series = vec![100.0; 24];
        series[12] = 110.0; // January of year 2: clim(Jan) = 105
        let out = pre.apply(&series);
        assert_relative_eq!(out[12], 5.0 / 105.0, epsilon = 1e-12);
        assert_relative_eq!(out[0], -5.0 / 105.0, epsilon = 1e-12);
        assert_relative_eq!(out[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn inflection_remap_to_year_bucket() {
        let config = RegressionConfig::new().with_averaging(AveragingWindow::Yearly);
        let pre = Preprocessor::new(monthly_dates(2000, 1, 48), &config);
        assert_eq!(pre.remap_inflection(13).unwrap(), 1);
        assert_eq!(pre.remap_inflection(25).unwrap(), 2);
        // First bucket would leave an empty leading segment.
        assert!(pre.remap_inflection(5).is_err());
        // Last bucket leaves no trailing segment.
        assert!(pre.remap_inflection(40).is_err());
    }

    #[test]
    fn inflection_identity_without_aggregation() {
        let config = RegressionConfig::default();
        let pre = Preprocessor::new(monthly_dates(2000, 1, 48), &config);
        assert_eq!(pre.remap_inflection(17).unwrap(), 17);
    }

    #[test]
    fn proxy_aggregation_matches_series_aggregation() {
        let config = RegressionConfig::new().with_averaging(AveragingWindow::Yearly);
        let dates = monthly_dates(2000, 1, 24);
        let pre = Preprocessor::new(dates.clone(), &config);
        let series: Vec<f64> = (0..24).map(f64::from).collect();
        let mut proxy = Proxy::series("solar", dates, series.clone()).unwrap();
        pre.apply_proxy(&mut proxy);
        assert_eq!(proxy.series_at(None), pre.apply(&series));
        assert_eq!(proxy.time.len(), 2);
    }
}
