//! Design-matrix construction: trend/intercept block, proxy block,
//! column tagging, cleanup, and proxy normalization.

mod columns;
mod matrix;

pub use columns::{
    group_columns, normalize_columns, ColumnTag, Expansion, ExpansionKind, TermGroup, TermSource,
};
pub use matrix::{CellDesign, DesignBuilder};
