//! Temporal alignment of dataset and proxy time ranges.
//!
//! Computes the analysis window as the intersection of the configured
//! start/end dates, the dataset's own extent, and the extent of every
//! active proxy, then trims proxy clones to exactly that window. All
//! comparisons happen on day-15 normalized monthly dates.

use crate::config::RegressionConfig;
use crate::core::{GriddedDataset, Proxy};
use crate::error::{Result, TrendError};
use chrono::{Datelike, NaiveDate};
use log::debug;

/// Result of temporal alignment: the active window on the dataset's
/// time axis plus proxy clones trimmed to it.
#[derive(Debug, Clone)]
pub struct AlignedWindow {
    /// Trimmed proxy clones; the caller's proxies are never mutated.
    pub proxies: Vec<Proxy>,
    /// First index of the analysis window on the dataset time axis.
    pub date_start: usize,
    /// One past the last index of the analysis window.
    pub date_end: usize,
    /// Inflection offset relative to `date_start`, when configured.
    pub inflection_offset: Option<usize>,
}

impl AlignedWindow {
    /// Number of time samples in the window.
    pub fn len(&self) -> usize {
        self.date_end - self.date_start
    }

    pub fn is_empty(&self) -> bool {
        self.date_end == self.date_start
    }
}

/// Intersect dataset, proxy, and configured time ranges and trim the
/// proxies to the surviving window.
///
/// Start = latest of all lower bounds, end = earliest of all relevant
/// upper bounds; disabled proxies constrain nothing. A configured bound
/// outside the data collapses to the dataset's own extent rather than
/// raising. Ranges that leave no overlap are a configuration error.
pub fn align(
    dataset: &GriddedDataset,
    proxies: &[Proxy],
    config: &RegressionConfig,
) -> Result<AlignedWindow> {
    let first = *dataset.time.first().ok_or(TrendError::EmptyData)?;
    let last = *dataset.time.last().ok_or(TrendError::EmptyData)?;

    let mut start = match config.start_date {
        Some(date) => date.clamp(first, last),
        None => first,
    };
    let mut end = match config.end_date {
        Some(date) => date.clamp(first, last),
        None => last,
    };

    for proxy in proxies.iter().filter(|p| p.is_active()) {
        let p_first = *proxy.time.first().ok_or(TrendError::EmptyData)?;
        let p_last = *proxy.time.last().ok_or(TrendError::EmptyData)?;
        if p_first > end || p_last < start {
            return Err(TrendError::NoOverlap(proxy.name.clone()));
        }
        start = start.max(p_first);
        end = end.min(p_last);
    }

    // Snap the window onto the dataset time axis.
    let date_start = dataset
        .time
        .iter()
        .position(|t| *t >= start)
        .ok_or_else(|| TrendError::NoOverlap(dataset.name.clone()))?;
    let date_end = dataset
        .time
        .iter()
        .rposition(|t| *t <= end)
        .map(|k| k + 1)
        .ok_or_else(|| TrendError::NoOverlap(dataset.name.clone()))?;
    if date_start >= date_end {
        return Err(TrendError::NoOverlap(dataset.name.clone()));
    }
    let window_start = dataset.time[date_start];
    let window_end = dataset.time[date_end - 1];
    debug!(
        "analysis window {window_start} .. {window_end} ({} samples)",
        date_end - date_start
    );

    let mut trimmed = Vec::with_capacity(proxies.len());
    for proxy in proxies {
        let mut clone = proxy.clone();
        if clone.is_active() {
            if let Some(lag) = config.enso_lag {
                if is_enso(&clone.name) {
                    apply_enso_lag(&mut clone, lag, window_start, window_end)?;
                }
            }
            clone.trim(window_start, window_end);
            if clone.time.len() != date_end - date_start {
                return Err(TrendError::DimensionMismatch {
                    expected: date_end - date_start,
                    got: clone.time.len(),
                });
            }
        }
        trimmed.push(clone);
    }

    let inflection_offset = match config.inflection {
        Some(inflection) => Some(locate_inflection(
            dataset,
            inflection.date,
            date_start,
            date_end,
        )?),
        None => None,
    };

    Ok(AlignedWindow {
        proxies: trimmed,
        date_start,
        date_end,
        inflection_offset,
    })
}

/// Find the inflection date on the dataset time axis; it must land
/// strictly inside the analysis window so both segments are non-empty.
fn locate_inflection(
    dataset: &GriddedDataset,
    date: NaiveDate,
    date_start: usize,
    date_end: usize,
) -> Result<usize> {
    let index = dataset
        .time
        .iter()
        .position(|t| t.year() == date.year() && t.month() == date.month())
        .ok_or_else(|| TrendError::InflectionOutOfRange(date.to_string()))?;
    if index <= date_start || index >= date_end - 1 {
        return Err(TrendError::InflectionOutOfRange(date.to_string()));
    }
    Ok(index - date_start)
}

fn is_enso(name: &str) -> bool {
    name.contains("ENSO") || name.contains("Nino")
}

/// Shift an ENSO-like proxy by `lag` months to model the delayed
/// influence of ENSO on ozone.
///
/// Every data column is shifted in place; the tag, bounds, and column
/// layout of the proxy are untouched. Each column is padded with a
/// 12-month guard band on both sides before shifting; where the band
/// runs off the end of the available proxy data, the nearest available
/// year is reused. A proxy shorter than the guard band cannot be
/// shifted and is a configuration error. Disabled unless `enso_lag` is
/// set in the configuration.
fn apply_enso_lag(
    proxy: &mut Proxy,
    lag: i32,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Result<()> {
    let ind_start = proxy
        .time
        .iter()
        .position(|t| *t == window_start)
        .ok_or_else(|| TrendError::NoOverlap(proxy.name.clone()))?;
    let ind_end = proxy
        .time
        .iter()
        .position(|t| *t == window_end)
        .ok_or_else(|| TrendError::NoOverlap(proxy.name.clone()))?;

    if proxy.time.len() < 12 {
        return Err(TrendError::InvalidConfig(format!(
            "proxy '{}' has {} samples, fewer than the 12-month ENSO lag \
             guard band",
            proxy.name,
            proxy.time.len()
        )));
    }

    let window_len = ind_end - ind_start + 1;
    let offset = (12 + lag) as usize;

    let mut data = ndarray::Array2::zeros((window_len, proxy.data.ncols()));
    for col in 0..proxy.data.ncols() {
        let series: Vec<f64> = proxy.data.column(col).to_vec();
        let padded = pad_guard_band(&series, ind_start, ind_end);
        for (row, &value) in padded[offset..offset + window_len].iter().enumerate() {
            data[[row, col]] = value;
        }
    }

    proxy.data = data;
    proxy.time = proxy.time[ind_start..=ind_end].to_vec();
    Ok(())
}

/// One column flanked by 12 guard samples on each side, reusing the
/// nearest available year where the band runs off the series.
///
/// Requires `series.len() >= 12`; the caller checks.
fn pad_guard_band(series: &[f64], ind_start: usize, ind_end: usize) -> Vec<f64> {
    let n = series.len();
    let mut padded = Vec::with_capacity(ind_end - ind_start + 25);
    if ind_start < 12 {
        let missing = 12 - ind_start;
        padded.extend_from_slice(&series[ind_start..ind_start + missing]);
        padded.extend_from_slice(&series[..ind_start]);
    } else {
        padded.extend_from_slice(&series[ind_start - 12..ind_start]);
    }
    padded.extend_from_slice(&series[ind_start..=ind_end]);
    if ind_end + 12 >= n {
        let missing = ind_end + 13 - n;
        padded.extend_from_slice(&series[ind_end + 1..]);
        padded.extend_from_slice(&series[ind_end + 1 - missing..=ind_end]);
    } else {
        padded.extend_from_slice(&series[ind_end + 1..ind_end + 13]);
    }
    padded
}
