//! The chart aggregate — spec §3 "Chart", §4.G.

use crate::antigen_serum::{Antigen, Serum};
use crate::err::{Error, Result};
use crate::projection::Projection;
use crate::table::TiterTable;

/// Lab/assay/date/provenance metadata for a chart.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Info {
    pub name: Option<String>,
    pub virus: Option<String>,
    pub virus_type: Option<String>,
    pub assay: Option<String>,
    pub date: Option<String>,
    pub lab: Option<String>,
    pub rbc_species: Option<String>,
    pub subset: Option<String>,
    pub table_type: Option<String>,
    /// Provenance: when this chart is the result of a merge, the `Info` of
    /// each contributing chart (supplemented from `original_source`'s
    /// `chart/v3/info.hh`, which tracks a `sources` list for exactly this
    /// reason).
    pub sources: Vec<Info>,
}

impl Info {
    /// Combine two `Info`s the way `merge` does: identical fields are kept,
    /// differing non-empty fields are joined with `" + "`, and the
    /// resulting `sources` list records both inputs.
    pub fn merge(&self, other: &Info) -> Info {
        fn combine(a: &Option<String>, b: &Option<String>) -> Option<String> {
            match (a, b) {
                (Some(x), Some(y)) if x == y => Some(x.clone()),
                (Some(x), Some(y)) => Some(format!("{x} + {y}")),
                (Some(x), None) => Some(x.clone()),
                (None, Some(y)) => Some(y.clone()),
                (None, None) => None,
            }
        }
        Info {
            name: combine(&self.name, &other.name),
            virus: combine(&self.virus, &other.virus),
            virus_type: combine(&self.virus_type, &other.virus_type),
            assay: combine(&self.assay, &other.assay),
            date: combine(&self.date, &other.date),
            lab: combine(&self.lab, &other.lab),
            rbc_species: combine(&self.rbc_species, &other.rbc_species),
            subset: combine(&self.subset, &other.subset),
            table_type: combine(&self.table_type, &other.table_type),
            sources: vec![self.clone(), other.clone()],
        }
    }
}

/// A single point style in the legacy plot spec.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PointStyle {
    pub fill: Option<String>,
    pub outline: Option<String>,
    pub size: Option<f64>,
    pub shape: Option<String>,
}

/// Legacy plot-spec: drawing order, per-point style index, styles array,
/// error-line colors (spec §6, key `p`).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlotSpec {
    pub drawing_order: Vec<usize>,
    pub point_style_index: Vec<usize>,
    pub styles: Vec<PointStyle>,
    pub error_line_positive_color: Option<String>,
    pub error_line_negative_color: Option<String>,
}

impl PlotSpec {
    /// Extend the per-point style index with identity entries for newly
    /// appended points, and clear the drawing order (merge step 6).
    pub fn extend_for_new_points(&mut self, num_new_points: usize) {
        let base = self.styles.len().saturating_sub(1).max(0);
        for _ in 0..num_new_points {
            self.point_style_index.push(base);
        }
        self.drawing_order.clear();
    }
}

/// Aggregate of info, antigens, sera, titers, projections, plot-spec.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Chart {
    pub info: Info,
    antigens: Vec<Antigen>,
    sera: Vec<Serum>,
    titers: TiterTable,
    projections: Vec<Projection>,
    /// Chart-level forced column bases override (key `C`), distinct from a
    /// projection's own `forced_column_bases` which takes precedence over
    /// this when set.
    pub forced_column_bases: Option<Vec<f64>>,
    pub plot_spec: Option<PlotSpec>,
    /// Opaque semantic style library (key `R`); genuinely user-extensible,
    /// kept as a free-form value per the DESIGN NOTES guidance.
    pub styles: Option<serde_json::Value>,
    /// Opaque extension fields (key `x`), preserved verbatim on round-trip.
    pub extensions: serde_json::Value,
}

impl Chart {
    /// An empty chart with no antigens/sera; titers are sized to match once
    /// antigens/sera are appended.
    pub fn empty() -> Self {
        Self {
            info: Info::default(),
            antigens: Vec::new(),
            sera: Vec::new(),
            titers: TiterTable::new_sparse(0, 0),
            projections: Vec::new(),
            forced_column_bases: None,
            plot_spec: None,
            styles: None,
            extensions: serde_json::Value::Null,
        }
    }

    pub fn new(
        info: Info,
        antigens: Vec<Antigen>,
        sera: Vec<Serum>,
        titers: TiterTable,
    ) -> Result<Self> {
        if titers.number_of_antigens() != antigens.len() {
            return Err(Error::StructureInvalid(format!(
                "titers has {} antigen rows but {} antigens given",
                titers.number_of_antigens(),
                antigens.len()
            )));
        }
        if titers.number_of_sera() != sera.len() {
            return Err(Error::StructureInvalid(format!(
                "titers has {} sera columns but {} sera given",
                titers.number_of_sera(),
                sera.len()
            )));
        }
        Ok(Self {
            info,
            antigens,
            sera,
            titers,
            projections: Vec::new(),
            forced_column_bases: None,
            plot_spec: None,
            styles: None,
            extensions: serde_json::Value::Null,
        })
    }

    pub fn antigens(&self) -> &[Antigen] {
        &self.antigens
    }

    pub fn sera(&self) -> &[Serum] {
        &self.sera
    }

    pub fn titers(&self) -> &TiterTable {
        &self.titers
    }

    pub fn titers_mut(&mut self) -> &mut TiterTable {
        &mut self.titers
    }

    pub fn number_of_antigens(&self) -> usize {
        self.antigens.len()
    }

    pub fn number_of_sera(&self) -> usize {
        self.sera.len()
    }

    /// Total points in the chart's numbering: antigens `[0, A)` then sera
    /// `[A, A+S)`.
    pub fn number_of_points(&self) -> usize {
        self.antigens.len() + self.sera.len()
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn projections_mut(&mut self) -> &mut Vec<Projection> {
        &mut self.projections
    }

    pub fn push_projection(&mut self, projection: Projection) {
        self.projections.push(projection);
    }

    /// Order projections by ascending final stress; projections with no
    /// stress (`None`) sort last (spec §5).
    pub fn sort_projections(&mut self) {
        self.projections.sort_by(|a, b| {
            match (a.stress(), b.stress()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
    }

    /// "Best" projection after [`Self::sort_projections`]: index 0.
    pub fn best_projection(&self) -> Option<&Projection> {
        self.projections.first()
    }

    /// Append antigens; may only be called before titers are resized past
    /// construction (spec "Lifecycle").
    pub fn push_antigen(&mut self, antigen: Antigen) {
        self.antigens.push(antigen);
    }

    pub fn push_serum(&mut self, serum: Serum) {
        self.sera.push(serum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::titer::Titer;
    use pretty_assertions::assert_eq;

    #[test]
    fn sort_projections_orders_ascending_with_nan_last() {
        let mut chart = Chart::new(
            Info::default(),
            vec![Antigen::default()],
            vec![Serum::default()],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap();
        let mut p1 = Projection::new(2, 2);
        p1.set_stress(5.0);
        let mut p2 = Projection::new(2, 2);
        p2.set_stress(1.0);
        let p3 = Projection::new(2, 2); // no stress
        chart.push_projection(p1);
        chart.push_projection(p2);
        chart.push_projection(p3);
        chart.sort_projections();
        assert_eq!(chart.projections()[0].stress(), Some(1.0));
        assert_eq!(chart.projections()[1].stress(), Some(5.0));
        assert_eq!(chart.projections()[2].stress(), None);
    }

    #[test]
    fn new_rejects_shape_mismatch() {
        let result = Chart::new(
            Info::default(),
            vec![Antigen::default(), Antigen::default()],
            vec![Serum::default()],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn info_merge_combines_differing_fields() {
        let a = Info {
            lab: Some("CDC".into()),
            ..Default::default()
        };
        let b = Info {
            lab: Some("NIMR".into()),
            ..Default::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.lab, Some("CDC + NIMR".into()));
        assert_eq!(merged.sources.len(), 2);
    }
}
