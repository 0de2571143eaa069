//! Structural column tags, display labels, term grouping, and proxy
//! column normalization.
//!
//! Every design-matrix column carries a [`ColumnTag`] attached at
//! construction time. Grouping and trend reporting work off these tags;
//! the human-readable labels exist only for the diagnostic bundle and
//! downstream display.

use ndarray::Array2;

/// What a design-matrix column represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TermSource {
    Intercept,
    Trend,
    /// A proxy column, by proxy name.
    Proxy(String),
}

/// Which sub-column of an expanded term this column is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expansion {
    /// The only column of a single-term expansion.
    Single,
    /// The unmodulated leading column of a harmonic expansion.
    HarmonicBase,
    /// Sine-modulated column at harmonic `k` (1-based).
    HarmonicSin(usize),
    /// Cosine-modulated column at harmonic `k` (1-based).
    HarmonicCos(usize),
    /// Indicator column for calendar month `m` (1-12).
    MonthOfYear(u32),
}

/// Expansion family, the grouping level at which one value is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpansionKind {
    Single,
    Harmonic,
    MonthOfYear,
}

impl Expansion {
    pub fn kind(&self) -> ExpansionKind {
        match self {
            Expansion::Single => ExpansionKind::Single,
            Expansion::HarmonicBase | Expansion::HarmonicSin(_) | Expansion::HarmonicCos(_) => {
                ExpansionKind::Harmonic
            }
            Expansion::MonthOfYear(_) => ExpansionKind::MonthOfYear,
        }
    }
}

/// Structural identity of one design-matrix column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnTag {
    pub source: TermSource,
    pub expansion: Expansion,
    /// Trend segment this column belongs to (0 = pre-inflection,
    /// 1 = post-inflection); `None` without an inflection point.
    pub segment: Option<usize>,
}

impl ColumnTag {
    pub fn is_trend(&self) -> bool {
        self.source == TermSource::Trend
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.source, TermSource::Proxy(_))
    }

    /// Display label, mirroring the naming used by downstream reports:
    /// `"trend - harmonic semi-annual - 3"`.
    pub fn label(&self, seas_comp: usize) -> String {
        let base = match (&self.source, self.segment) {
            (TermSource::Intercept, None) => "intercept".to_string(),
            (TermSource::Intercept, Some(s)) => format!("intercept segment {}", s + 1),
            (TermSource::Trend, None) => "trend".to_string(),
            (TermSource::Trend, Some(s)) => format!("trend segment {}", s + 1),
            (TermSource::Proxy(name), _) => name.clone(),
        };
        match self.expansion {
            Expansion::Single => format!("{base} - single - 1"),
            Expansion::HarmonicBase => {
                format!("{base} - harmonic {} - 1", seasonal_name(seas_comp))
            }
            Expansion::HarmonicSin(k) => {
                format!("{base} - harmonic {} - {}", seasonal_name(seas_comp), 2 * k)
            }
            Expansion::HarmonicCos(k) => format!(
                "{base} - harmonic {} - {}",
                seasonal_name(seas_comp),
                2 * k + 1
            ),
            Expansion::MonthOfYear(m) => format!("{base} - month-of-the-year - {m}"),
        }
    }
}

fn seasonal_name(seas_comp: usize) -> &'static str {
    match seas_comp {
        1 => "annual",
        2 => "semi-annual",
        3 => "tri-annual",
        _ => "quarter-annual",
    }
}

/// Columns that semantically represent one logical term.
#[derive(Debug, Clone, PartialEq)]
pub struct TermGroup {
    pub source: TermSource,
    pub kind: ExpansionKind,
    pub segment: Option<usize>,
    /// Member column indices, in matrix order.
    pub columns: Vec<usize>,
}

impl TermGroup {
    /// The column whose coefficient represents the group (its first,
    /// i.e. the unmodulated or single column).
    pub fn leading_column(&self) -> usize {
        self.columns[0]
    }
}

/// Partition column indices into logical term groups keyed by
/// `(source, expansion kind, segment)`, preserving matrix order.
pub fn group_columns(tags: &[ColumnTag]) -> Vec<TermGroup> {
    let mut groups: Vec<TermGroup> = Vec::new();
    for (index, tag) in tags.iter().enumerate() {
        let kind = tag.expansion.kind();
        match groups.iter_mut().find(|g| {
            g.source == tag.source && g.kind == kind && g.segment == tag.segment
        }) {
            Some(group) => group.columns.push(index),
            None => groups.push(TermGroup {
                source: tag.source.clone(),
                kind,
                segment: tag.segment,
                columns: vec![index],
            }),
        }
    }
    groups
}

/// Min-max rescale the flagged columns into `[-1, 1]`, computed over
/// each column's nonzero entries only. Zero entries (gap fill and
/// out-of-segment samples) stay zero.
pub fn normalize_columns(matrix: &mut Array2<f64>, is_proxy: &[bool]) {
    for col in 0..matrix.ncols() {
        if !is_proxy[col] {
            continue;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in matrix.column(col) {
            if v != 0.0 && v.is_finite() {
                min = min.min(v);
                max = max.max(v);
            }
        }
        if !min.is_finite() || max == min {
            continue;
        }
        for v in matrix.column_mut(col) {
            if *v != 0.0 && v.is_finite() {
                *v = (*v - min) / (max - min) * 2.0 - 1.0;
            }
        }
    }
}
