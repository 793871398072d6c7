//! Antigenic cartography: HI-assay titer tables, stress-minimization
//! layouts, merging, and the diagnostics built on top of a relaxed chart.
//!
//! See the per-module docs for the algorithms; this crate has no binary
//! front end, only the library surface.

pub mod antigen_serum;
pub mod avidity;
pub mod chart;
pub mod column_bases;
pub mod err;
pub mod grid_test;
pub mod io;
#[cfg(test)]
mod integration_tests;
pub mod layout;
pub mod merge;
pub mod optimize;
pub mod procrustes;
pub mod projection;
pub mod serum_circle;
pub mod stress;
pub mod table;
pub mod titer;

pub use antigen_serum::{Annotations, Antigen, Passage, PassageType, Sequence, Serum};
pub use chart::{Chart, Info, PlotSpec, PointStyle};
pub use column_bases::{ColumnBases, MinimumColumnBasis};
pub use err::{Error, Message, MessageChannel, Result};
pub use layout::{Layout, Transformation};
pub use projection::Projection;
pub use table::{Layer, MergeSymbol, TiterTable};
pub use titer::Titer;
