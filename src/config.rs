//! Regression run configuration.
//!
//! [`RegressionConfig`] is an immutable value object handed to every
//! component of the engine. It can be built programmatically through the
//! `with_*` methods or parsed from a flat string map (the contract used
//! by the surrounding configuration loaders) via
//! [`RegressionConfig::from_map`].

use crate::error::{Result, TrendError};
use chrono::NaiveDate;
use std::collections::HashMap;

/// How a trend, intercept, or proxy term enters the design matrix.
///
/// The numeric codes (0-3) match the configuration file contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermMethod {
    /// The term contributes no columns.
    Disabled,
    /// One column holding the raw term value.
    #[default]
    Single,
    /// The raw column plus `2 * seas_comp` sine/cosine modulated columns.
    Harmonic,
    /// Twelve indicator columns, one per calendar month.
    MonthOfYear,
}

impl TermMethod {
    /// Parse a numeric method code (0-3).
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(TermMethod::Disabled),
            1 => Ok(TermMethod::Single),
            2 => Ok(TermMethod::Harmonic),
            3 => Ok(TermMethod::MonthOfYear),
            other => Err(TrendError::InvalidConfig(format!(
                "unknown term method code {other}: valid codes are 0 (disabled), \
                 1 (single), 2 (harmonic), 3 (month-of-the-year)"
            ))),
        }
    }

    /// Number of design-matrix columns this method expands into.
    pub fn column_count(&self, seas_comp: usize) -> usize {
        match self {
            TermMethod::Disabled => 0,
            TermMethod::Single => 1,
            TermMethod::Harmonic => 1 + 2 * seas_comp,
            TermMethod::MonthOfYear => 12,
        }
    }
}

/// How the trend model behaves at the configured inflection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflectionMethod {
    /// Piecewise-linear: shared intercept, two slopes, continuous at the
    /// inflection point.
    PiecewiseLinear,
    /// Two fully independent intercept/trend pairs with a discontinuity
    /// allowed at the inflection point.
    Independent,
}

impl InflectionMethod {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pwl" => Ok(InflectionMethod::PiecewiseLinear),
            "ind" => Ok(InflectionMethod::Independent),
            other => Err(TrendError::InvalidConfig(format!(
                "unrecognized inflection method '{other}': use \"pwl\" for \
                 piecewise-linear trends or \"ind\" for independent trends"
            ))),
        }
    }
}

/// Inflection point configuration: a date at which the trend changes.
///
/// Only a single inflection point is supported end-to-end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inflection {
    /// Month at which the trend segments switch (day-15 normalized).
    pub date: NaiveDate,
    pub method: InflectionMethod,
}

/// Temporal aggregation applied before fitting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AveragingWindow {
    /// Keep the monthly resolution.
    #[default]
    None,
    /// One mean value per calendar year.
    Yearly,
    /// One mean per calendar year over the listed months (1-12).
    Months(Vec<u32>),
}

impl AveragingWindow {
    /// Parse the user-facing averaging specification: empty for no
    /// averaging, `"yearly"`/`"all"` for yearly means, or a
    /// comma-separated month list such as `"6,7,8"`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(AveragingWindow::None);
        }
        if value == "yearly" || value == "all" {
            return Ok(AveragingWindow::Yearly);
        }
        let mut months = Vec::new();
        for part in value.split(',') {
            let month: u32 = part.trim().parse().map_err(|_| {
                TrendError::InvalidConfig(format!(
                    "averaging window '{value}' is neither 'yearly'/'all' nor a \
                     comma-separated list of months"
                ))
            })?;
            if !(1..=12).contains(&month) {
                return Err(TrendError::InvalidConfig(format!(
                    "averaging window month {month} is outside 1-12"
                )));
            }
            if months.contains(&month) {
                return Err(TrendError::InvalidConfig(format!(
                    "averaging window lists month {month} twice"
                )));
            }
            months.push(month);
        }
        Ok(AveragingWindow::Months(months))
    }

    /// Whether this window aggregates months into yearly buckets.
    pub fn is_aggregating(&self) -> bool {
        !matches!(self, AveragingWindow::None)
    }
}

/// How anomalies are computed from absolute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnomalyMethod {
    /// `(x - clim) / clim`: fractional deviation from the climatology.
    #[default]
    Relative,
    /// `x - clim`: deviation in the raw unit.
    Absolute,
}

impl AnomalyMethod {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "rel" => Ok(AnomalyMethod::Relative),
            "abs" => Ok(AnomalyMethod::Absolute),
            other => Err(TrendError::InvalidConfig(format!(
                "unrecognized anomaly method '{other}': use 'rel' or 'abs'"
            ))),
        }
    }
}

/// Immutable configuration for one regression run.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionConfig {
    pub trend_method: TermMethod,
    pub intercept_method: TermMethod,
    /// Harmonic pair count for the trend term (method 2).
    pub trend_seasonal_component: usize,
    /// Harmonic pair count for the intercept term (method 2).
    pub intercept_seasonal_component: usize,
    /// Optional inflection point; `None` means a single trend segment.
    pub inflection: Option<Inflection>,
    /// Optional analysis window bounds (clamped to the data extent).
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub averaging: AveragingWindow,
    /// `Some(method)` enables anomaly conversion of the response and proxies.
    pub anomaly: Option<AnomalyMethod>,
    /// A cell or aggregation bucket is skipped when its valid fraction is
    /// at or below this threshold.
    pub skip_fraction: f64,
    /// Unit of the response variable; an `anom` prefix marks data that
    /// are already anomalies and disables percent-of-mean scaling.
    pub data_unit: String,
    /// Lag in months applied to ENSO-like proxies. Disabled by default.
    pub enso_lag: Option<i32>,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            trend_method: TermMethod::Single,
            intercept_method: TermMethod::Single,
            trend_seasonal_component: 2,
            intercept_seasonal_component: 2,
            inflection: None,
            start_date: None,
            end_date: None,
            averaging: AveragingWindow::None,
            anomaly: None,
            skip_fraction: 0.75,
            data_unit: String::new(),
            enso_lag: None,
        }
    }
}

impl RegressionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trend_method(mut self, method: TermMethod) -> Self {
        self.trend_method = method;
        self
    }

    pub fn with_intercept_method(mut self, method: TermMethod) -> Self {
        self.intercept_method = method;
        self
    }

    pub fn with_seasonal_components(mut self, trend: usize, intercept: usize) -> Self {
        self.trend_seasonal_component = trend;
        self.intercept_seasonal_component = intercept;
        self
    }

    pub fn with_inflection(mut self, date: NaiveDate, method: InflectionMethod) -> Self {
        self.inflection = Some(Inflection {
            date: mid_month(date),
            method,
        });
        self
    }

    pub fn with_window(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start.map(mid_month);
        self.end_date = end.map(mid_month);
        self
    }

    pub fn with_averaging(mut self, averaging: AveragingWindow) -> Self {
        self.averaging = averaging;
        self
    }

    pub fn with_anomaly(mut self, method: AnomalyMethod) -> Self {
        self.anomaly = Some(method);
        self
    }

    pub fn with_skip_fraction(mut self, fraction: f64) -> Self {
        self.skip_fraction = fraction;
        self
    }

    pub fn with_data_unit(mut self, unit: impl Into<String>) -> Self {
        self.data_unit = unit.into();
        self
    }

    pub fn with_enso_lag(mut self, lag: i32) -> Self {
        self.enso_lag = Some(lag);
        self
    }

    /// Whether the response values are already anomalies, either through
    /// the anomaly preprocessor or because the input unit says so.
    pub fn data_is_anomaly(&self) -> bool {
        self.anomaly.is_some() || self.data_unit.starts_with("anom")
    }

    /// Build a configuration from the flat string map produced by the
    /// surrounding configuration loaders.
    ///
    /// Recognized keys: `trend_method`, `intercept_method`,
    /// `trend_seasonal_component`, `intercept_seasonal_component`,
    /// `default_seasonal_component`, `inflection_point`,
    /// `inflection_method`, `start_date`, `end_date`, `averaging_window`,
    /// `anomaly`, `anomaly_method`, `skip_percentage`, `o3_var_unit`,
    /// `enso_lag`. Unknown keys are ignored (they belong to the loaders).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = map.get("trend_method") {
            config.trend_method = TermMethod::from_code(parse_u32(v, "trend_method")?)?;
        }
        if let Some(v) = map.get("intercept_method") {
            config.intercept_method = TermMethod::from_code(parse_u32(v, "intercept_method")?)?;
        }

        let default_seas = match map.get("default_seasonal_component") {
            Some(v) => parse_u32(v, "default_seasonal_component")? as usize,
            None => 2,
        };
        config.trend_seasonal_component = match map.get("trend_seasonal_component") {
            Some(v) => parse_u32(v, "trend_seasonal_component")? as usize,
            None => default_seas,
        };
        config.intercept_seasonal_component = match map.get("intercept_seasonal_component") {
            Some(v) => parse_u32(v, "intercept_seasonal_component")? as usize,
            None => default_seas,
        };

        // An inflection point is only active when both the date and the
        // method are present, matching the loader contract.
        if let (Some(date), Some(method)) = (map.get("inflection_point"), map.get("inflection_method")) {
            config.inflection = Some(Inflection {
                date: parse_year_month(date)?,
                method: InflectionMethod::parse(method)?,
            });
        } else if let Some(method) = map.get("inflection_method") {
            // A method without a date is a misconfiguration worth naming.
            InflectionMethod::parse(method)?;
        }

        if let Some(v) = map.get("start_date") {
            config.start_date = Some(parse_year_month(v)?);
        }
        if let Some(v) = map.get("end_date") {
            config.end_date = Some(parse_year_month(v)?);
        }
        if let Some(v) = map.get("averaging_window") {
            config.averaging = AveragingWindow::parse(v)?;
        }
        if map.get("anomaly").map(String::as_str) == Some("True") {
            let method = match map.get("anomaly_method") {
                Some(v) => AnomalyMethod::parse(v)?,
                None => AnomalyMethod::Relative,
            };
            config.anomaly = Some(method);
        }
        if let Some(v) = map.get("skip_percentage") {
            config.skip_fraction = v.parse().map_err(|_| {
                TrendError::InvalidConfig(format!("skip_percentage '{v}' is not a number"))
            })?;
        }
        if let Some(v) = map.get("o3_var_unit") {
            config.data_unit = v.clone();
        }
        if let Some(v) = map.get("enso_lag") {
            config.enso_lag = Some(v.parse().map_err(|_| {
                TrendError::InvalidConfig(format!("enso_lag '{v}' is not an integer"))
            })?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency. Called by [`from_map`](Self::from_map)
    /// and again by the orchestrator before the cell loop.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.skip_fraction) {
            return Err(TrendError::InvalidConfig(format!(
                "skip fraction {} is outside [0, 1]",
                self.skip_fraction
            )));
        }
        if self.trend_method == TermMethod::Harmonic && self.trend_seasonal_component == 0 {
            return Err(TrendError::InvalidConfig(
                "harmonic trend method requires at least one seasonal component".into(),
            ));
        }
        if self.intercept_method == TermMethod::Harmonic && self.intercept_seasonal_component == 0 {
            return Err(TrendError::InvalidConfig(
                "harmonic intercept method requires at least one seasonal component".into(),
            ));
        }
        if let Some(lag) = self.enso_lag {
            if lag.abs() > 12 {
                return Err(TrendError::InvalidConfig(format!(
                    "ENSO lag {lag} exceeds the 12-month guard band"
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(TrendError::InvalidConfig(format!(
                    "start date {start} is after end date {end}"
                )));
            }
        }
        Ok(())
    }
}

/// Normalize any date to day 15 of its month, the common footing for
/// monthly series from heterogeneous sources.
pub fn mid_month(date: NaiveDate) -> NaiveDate {
    use chrono::Datelike;
    NaiveDate::from_ymd_opt(date.year(), date.month(), 15)
        .unwrap_or(date)
}

/// Parse a `YYYY-MM` string to the mid-month date.
pub fn parse_year_month(value: &str) -> Result<NaiveDate> {
    let full = format!("{}-15", value.trim());
    NaiveDate::parse_from_str(&full, "%Y-%m-%d").map_err(|_| TrendError::InvalidDate {
        value: value.to_string(),
        expected: "YYYY-MM",
    })
}

fn parse_u32(value: &str, key: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| {
        TrendError::InvalidConfig(format!("{key} '{value}' is not a non-negative integer"))
    })
}
