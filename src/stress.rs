//! Stress function and table-distance records — spec §4.E.
//!
//! Stress is the weighted sum, over non-dont-care titer cells, of squared
//! differences between map distance and table distance, with a smooth
//! one-sided penalty for inequality (less-than/more-than) titers.

use crate::column_bases::ColumnBases;
use crate::layout::Layout;
use crate::table::TiterTable;
use crate::titer::Titer;

/// The kind of penalty a cell's titer contributes under stress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Regular,
    LessThan,
    MoreThan,
    Dodgy,
}

/// A precomputed `(antigen_no, serum_no, table_distance, kind)` record,
/// built once per `relax` call to avoid re-parsing titers on every stress
/// evaluation (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableDistanceEntry {
    pub antigen_no: usize,
    pub serum_no: usize,
    pub table_distance: f64,
    pub kind: CellKind,
}

/// Smooth one-sided ramp with continuous derivative used to penalize
/// inequality titers only on the side of the threshold where they are
/// violated.
///
/// `sigmoid_step(x) -> 1` as `x -> -inf` (map closer than the table
/// threshold) and `-> 0` as `x -> +inf`.
pub fn sigmoid_step(x: f64) -> f64 {
    1.0 / (1.0 + x.exp())
}

/// Derivative of [`sigmoid_step`].
pub fn sigmoid_step_derivative(x: f64) -> f64 {
    let s = sigmoid_step(x);
    -s * (1.0 - s)
}

/// Stress function built from a chart's titers, column bases and optional
/// avidity adjusts, over a fixed set of disconnected points.
#[derive(Debug, Clone)]
pub struct StressFunction {
    num_antigens: usize,
    num_sera: usize,
    entries: Vec<TableDistanceEntry>,
    disconnected: Vec<bool>,
    dodgy_titer_is_regular: bool,
}

impl StressFunction {
    /// Build the table-distance table for `titers`/`column_bases`, applying
    /// `avidity_adjusts` (log2-additive per point) if given. Disconnected
    /// points' cells are precomputed but skipped during evaluation.
    pub fn build(
        titers: &TiterTable,
        column_bases: &ColumnBases,
        avidity_adjusts: Option<&[f64]>,
        disconnected: &[bool],
        dodgy_titer_is_regular: bool,
    ) -> Self {
        let num_antigens = titers.number_of_antigens();
        let num_sera = titers.number_of_sera();
        let mut entries = Vec::new();
        for (i, j, t) in titers.titers_existing() {
            let kind = match t {
                Titer::Regular(_) => CellKind::Regular,
                Titer::LessThan(_) => CellKind::LessThan,
                Titer::MoreThan(_) => CellKind::MoreThan,
                Titer::Dodgy(_) => CellKind::Dodgy,
                Titer::DontCare => unreachable!("titers_existing skips DontCare"),
            };
            if kind == CellKind::Dodgy && !dodgy_titer_is_regular {
                continue;
            }
            let logged = match t.logged_for_column_bases() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let adjust_i = avidity_adjusts.map(|a| a[i]).unwrap_or(0.0);
            let adjust_j = avidity_adjusts
                .map(|a| a[num_antigens + j])
                .unwrap_or(0.0);
            let table_distance = column_bases.get(j) - logged + adjust_i + adjust_j;
            entries.push(TableDistanceEntry {
                antigen_no: i,
                serum_no: j,
                table_distance,
                kind,
            });
        }
        Self {
            num_antigens,
            num_sera,
            entries,
            disconnected: disconnected.to_vec(),
            dodgy_titer_is_regular,
        }
    }

    pub fn entries(&self) -> &[TableDistanceEntry] {
        &self.entries
    }

    fn is_disconnected(&self, point: usize) -> bool {
        self.disconnected.get(point).copied().unwrap_or(false)
    }

    /// Total stress over `layout`.
    pub fn stress(&self, layout: &Layout) -> f64 {
        let mut total = 0.0;
        for entry in &self.entries {
            let ag = entry.antigen_no;
            let sr = self.num_antigens + entry.serum_no;
            if self.is_disconnected(ag) || self.is_disconnected(sr) {
                continue;
            }
            let map_distance = layout.distance(ag, sr);
            if !map_distance.is_finite() {
                continue;
            }
            let diff = map_distance - entry.table_distance;
            total += self.cell_contribution(entry.kind, diff);
        }
        total
    }

    fn cell_contribution(&self, kind: CellKind, diff: f64) -> f64 {
        match kind {
            CellKind::Regular => diff * diff,
            CellKind::LessThan => sigmoid_step(diff) * diff * diff,
            CellKind::MoreThan => sigmoid_step(-diff) * diff * diff,
            CellKind::Dodgy => {
                debug_assert!(self.dodgy_titer_is_regular);
                diff * diff
            }
        }
    }

    fn cell_contribution_derivative(&self, kind: CellKind, diff: f64) -> f64 {
        match kind {
            CellKind::Regular => 2.0 * diff,
            CellKind::LessThan => {
                sigmoid_step_derivative(diff) * diff * diff + sigmoid_step(diff) * 2.0 * diff
            }
            CellKind::MoreThan => {
                -sigmoid_step_derivative(-diff) * diff * diff + sigmoid_step(-diff) * 2.0 * diff
            }
            CellKind::Dodgy => 2.0 * diff,
        }
    }

    /// Gradient of [`Self::stress`] with respect to every coordinate of
    /// `layout`, flattened the same way `layout.as_slice()` is.
    pub fn gradient(&self, layout: &Layout) -> Vec<f64> {
        let dims = layout.num_dims();
        let mut grad = vec![0.0; layout.as_slice().len()];
        for entry in &self.entries {
            let ag = entry.antigen_no;
            let sr = self.num_antigens + entry.serum_no;
            if self.is_disconnected(ag) || self.is_disconnected(sr) {
                continue;
            }
            let map_distance = layout.distance(ag, sr);
            if !map_distance.is_finite() || map_distance == 0.0 {
                continue;
            }
            let diff = map_distance - entry.table_distance;
            let d_contribution = self.cell_contribution_derivative(entry.kind, diff);
            let pa = layout.point(ag).unwrap();
            let pb = layout.point(sr).unwrap();
            for d in 0..dims {
                let delta = (pa[d] - pb[d]) / map_distance;
                grad[ag * dims + d] += d_contribution * delta;
                grad[sr * dims + d] -= d_contribution * delta;
            }
        }
        grad
    }

    pub fn num_sera(&self) -> usize {
        self.num_sera
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_bases::MinimumColumnBasis;
    use float_cmp::approx_eq;

    #[test]
    fn perfect_fit_has_zero_stress() {
        let table = TiterTable::from_dense(vec![vec![Titer::Regular(80)]]).unwrap();
        let cb = ColumnBases::compute(&table, MinimumColumnBasis::None);
        let stress_fn = StressFunction::build(&table, &cb, None, &[false, false], false);
        let mut layout = Layout::new(2, 2);
        let table_distance = stress_fn.entries()[0].table_distance;
        layout.set_point(0, &[0.0, 0.0]);
        layout.set_point(1, &[table_distance, 0.0]);
        assert!(approx_eq!(f64, stress_fn.stress(&layout), 0.0, epsilon = 1e-9));
    }

    #[test]
    fn disconnected_contributes_nothing() {
        let table = TiterTable::from_dense(vec![vec![Titer::Regular(80)]]).unwrap();
        let cb = ColumnBases::compute(&table, MinimumColumnBasis::None);
        let stress_fn = StressFunction::build(&table, &cb, None, &[true, false], false);
        let mut layout = Layout::new(2, 2);
        layout.set_point(1, &[100.0, 0.0]);
        assert_eq!(stress_fn.stress(&layout), 0.0);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let table = TiterTable::from_dense(vec![
            vec![Titer::Regular(40), Titer::LessThan(20)],
        ])
        .unwrap();
        let cb = ColumnBases::compute(&table, MinimumColumnBasis::None);
        let stress_fn = StressFunction::build(&table, &cb, None, &[false, false, false], false);
        let mut layout = Layout::new(3, 2);
        layout.set_point(0, &[0.3, -0.2]);
        layout.set_point(1, &[1.5, 0.7]);
        layout.set_point(2, &[-0.4, 1.1]);

        let analytic = stress_fn.gradient(&layout);
        let eps = 1e-6;
        for idx in 0..layout.as_slice().len() {
            let mut plus = layout.clone();
            plus.as_mut_slice()[idx] += eps;
            let mut minus = layout.clone();
            minus.as_mut_slice()[idx] -= eps;
            let numeric = (stress_fn.stress(&plus) - stress_fn.stress(&minus)) / (2.0 * eps);
            assert!(
                approx_eq!(f64, analytic[idx], numeric, epsilon = 1e-4),
                "index {idx}: analytic {} vs numeric {}",
                analytic[idx],
                numeric
            );
        }
    }
}
