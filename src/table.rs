//! Titer table, with optional layers for merged charts — spec §3 / §4.C.

use indexmap::IndexMap;

use crate::err::{Error, Result};
use crate::titer::Titer;

/// One source chart's contribution to a merged titer table: a sparse,
/// antigen-indexed map of serum index to titer.
pub type Layer = Vec<IndexMap<usize, Titer>>;

/// Dense or sparse antigen×serum titers, plus an ordered list of layers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TiterTable {
    number_of_antigens: usize,
    number_of_sera: usize,
    storage: Storage,
    /// Per-source-chart sparse maps; top-level `storage` is always the
    /// deterministic merge of these when non-empty (spec invariant).
    layers: Vec<Layer>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
enum Storage {
    Dense(Vec<Vec<Titer>>),
    Sparse(Vec<IndexMap<usize, Titer>>),
}

/// Outcome symbol for a single cell's layer merge (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSymbol {
    /// Numeric mean of regular/dodgy contributors.
    NumericMean,
    /// All contributors were less-than; smallest kept.
    AllLessThan,
    /// All contributors were more-than; largest kept.
    AllMoreThan,
    /// Conflicting less-than/more-than collapsed to a dodgy midpoint.
    DodgyMerge,
    /// All contributors were identical.
    AllEqual,
    /// Numeric contributors existed alongside ignored less-thans (lost low).
    LostLow,
    /// Numeric contributors existed alongside ignored more-thans (lost high).
    LostHigh,
    /// Unresolvable conflict.
    Conflict,
}

impl MergeSymbol {
    pub fn as_char(&self) -> char {
        match self {
            MergeSymbol::NumericMean => 'N',
            MergeSymbol::AllLessThan => '<',
            MergeSymbol::AllMoreThan => '>',
            MergeSymbol::DodgyMerge => '~',
            MergeSymbol::AllEqual => '=',
            MergeSymbol::LostLow => 'L',
            MergeSymbol::LostHigh => 'U',
            MergeSymbol::Conflict => 'X',
        }
    }
}

/// One entry of the layer-merge report (spec §4.C).
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReportEntry {
    pub antigen_no: usize,
    pub serum_no: usize,
    pub kinds_summary: String,
    pub merge_symbol: MergeSymbol,
}

impl TiterTable {
    /// Construct an empty dense table of the given shape.
    pub fn new_dense(number_of_antigens: usize, number_of_sera: usize) -> Self {
        Self {
            number_of_antigens,
            number_of_sera,
            storage: Storage::Dense(vec![
                vec![Titer::DontCare; number_of_sera];
                number_of_antigens
            ]),
            layers: Vec::new(),
        }
    }

    /// Construct an empty sparse table of the given shape.
    pub fn new_sparse(number_of_antigens: usize, number_of_sera: usize) -> Self {
        Self {
            number_of_antigens,
            number_of_sera,
            storage: Storage::Sparse(vec![IndexMap::new(); number_of_antigens]),
            layers: Vec::new(),
        }
    }

    pub fn from_dense(rows: Vec<Vec<Titer>>) -> Result<Self> {
        let number_of_antigens = rows.len();
        let number_of_sera = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != number_of_sera) {
            return Err(Error::StructureInvalid(
                "dense titer rows have inconsistent length".into(),
            ));
        }
        Ok(Self {
            number_of_antigens,
            number_of_sera,
            storage: Storage::Dense(rows),
            layers: Vec::new(),
        })
    }

    pub fn from_sparse(
        rows: Vec<IndexMap<usize, Titer>>,
        number_of_sera: usize,
    ) -> Result<Self> {
        let number_of_antigens = rows.len();
        for row in &rows {
            for &j in row.keys() {
                if j >= number_of_sera {
                    return Err(Error::StructureInvalid(format!(
                        "sparse titer row references serum {j} >= number_of_sera {number_of_sera}"
                    )));
                }
            }
        }
        Ok(Self {
            number_of_antigens,
            number_of_sera,
            storage: Storage::Sparse(rows),
            layers: Vec::new(),
        })
    }

    pub fn number_of_antigens(&self) -> usize {
        self.number_of_antigens
    }

    pub fn number_of_sera(&self) -> usize {
        self.number_of_sera
    }

    pub fn number_of_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, k: usize) -> Option<&Layer> {
        self.layers.get(k)
    }

    pub fn push_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Titer at `(antigen_no, serum_no)`; `DontCare` outside range.
    pub fn titer(&self, antigen_no: usize, serum_no: usize) -> Titer {
        match &self.storage {
            Storage::Dense(rows) => rows
                .get(antigen_no)
                .and_then(|row| row.get(serum_no))
                .copied()
                .unwrap_or(Titer::DontCare),
            Storage::Sparse(rows) => rows
                .get(antigen_no)
                .and_then(|row| row.get(&serum_no))
                .copied()
                .unwrap_or(Titer::DontCare),
        }
    }

    pub fn set_titer(&mut self, antigen_no: usize, serum_no: usize, titer: Titer) {
        match &mut self.storage {
            Storage::Dense(rows) => {
                if let Some(row) = rows.get_mut(antigen_no) {
                    if let Some(cell) = row.get_mut(serum_no) {
                        *cell = titer;
                    }
                }
            }
            Storage::Sparse(rows) => {
                if let Some(row) = rows.get_mut(antigen_no) {
                    if titer.is_dont_care() {
                        row.shift_remove(&serum_no);
                    } else {
                        row.insert(serum_no, titer);
                    }
                }
            }
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.storage, Storage::Dense(_))
    }

    /// Convert to the dense representation (idempotent if already dense).
    pub fn to_dense(&self) -> TiterTable {
        if let Storage::Dense(_) = &self.storage {
            return self.clone();
        }
        let mut rows = vec![vec![Titer::DontCare; self.number_of_sera]; self.number_of_antigens];
        for (i, j, t) in self.titers_existing() {
            rows[i][j] = t;
        }
        TiterTable {
            number_of_antigens: self.number_of_antigens,
            number_of_sera: self.number_of_sera,
            storage: Storage::Dense(rows),
            layers: self.layers.clone(),
        }
    }

    /// Convert to the sparse representation (idempotent if already sparse).
    pub fn to_sparse(&self) -> TiterTable {
        if let Storage::Sparse(_) = &self.storage {
            return self.clone();
        }
        let mut rows = vec![IndexMap::new(); self.number_of_antigens];
        for (i, j, t) in self.titers_existing() {
            rows[i].insert(j, t);
        }
        TiterTable {
            number_of_antigens: self.number_of_antigens,
            number_of_sera: self.number_of_sera,
            storage: Storage::Sparse(rows),
            layers: self.layers.clone(),
        }
    }

    /// Count of non-dont-care cells.
    pub fn number_of_non_dont_cares(&self) -> usize {
        self.titers_existing().count()
    }

    /// Number of non-dont-care titers involving `antigen_no`.
    pub fn titrations_for_antigen(&self, antigen_no: usize) -> usize {
        (0..self.number_of_sera)
            .filter(|&j| !self.titer(antigen_no, j).is_dont_care())
            .count()
    }

    /// Number of non-dont-care titers involving `serum_no`.
    pub fn titrations_for_serum(&self, serum_no: usize) -> usize {
        (0..self.number_of_antigens)
            .filter(|&i| !self.titer(i, serum_no).is_dont_care())
            .count()
    }

    /// All non-dont-care cells in row-major (antigen-first) order.
    pub fn titers_existing(&self) -> impl Iterator<Item = (usize, usize, Titer)> + '_ {
        TitersExisting {
            table: self,
            antigen_no: 0,
            serum_no: 0,
        }
    }

    /// This table's own cells as a single layer, for use when a source
    /// chart being merged has no layers of its own yet (spec §4.J step 4).
    pub fn as_layer(&self) -> Layer {
        let mut rows = vec![IndexMap::new(); self.number_of_antigens];
        for (i, j, t) in self.titers_existing() {
            rows[i].insert(j, t);
        }
        rows
    }

    /// Per-layer titers for a cell, skipping layers where the cell is
    /// unset.
    pub fn titers_for_layers(&self, antigen_no: usize, serum_no: usize) -> Vec<Titer> {
        self.layers
            .iter()
            .filter_map(|layer| layer.get(antigen_no).and_then(|row| row.get(&serum_no)))
            .copied()
            .collect()
    }

    /// Recompute every top-level titer as the merge of its layers (spec
    /// §4.C). Returns a report describing the merge outcome per cell that
    /// had more than one contributing layer.
    pub fn set_from_layers(&mut self) -> Vec<MergeReportEntry> {
        let mut report = Vec::new();
        let mut new_rows: Vec<IndexMap<usize, Titer>> =
            vec![IndexMap::new(); self.number_of_antigens];
        for i in 0..self.number_of_antigens {
            for j in 0..self.number_of_sera {
                let contributors = self.titers_for_layers(i, j);
                if contributors.is_empty() {
                    continue;
                }
                let (merged, symbol) = merge_layer_titers(&contributors);
                new_rows[i].insert(j, merged);
                if contributors.len() > 1 {
                    report.push(MergeReportEntry {
                        antigen_no: i,
                        serum_no: j,
                        kinds_summary: kinds_summary(&contributors),
                        merge_symbol: symbol,
                    });
                }
            }
        }
        self.storage = Storage::Sparse(new_rows);
        report
    }
}

fn kinds_summary(titers: &[Titer]) -> String {
    titers.iter().map(|t| t.format()).collect::<Vec<_>>().join(",")
}

/// Merge the per-layer contributors of a single cell (spec §4.C rules).
fn merge_layer_titers(contributors: &[Titer]) -> (Titer, MergeSymbol) {
    let non_dont_care: Vec<Titer> = contributors
        .iter()
        .copied()
        .filter(|t| !t.is_dont_care())
        .collect();
    if non_dont_care.is_empty() {
        return (Titer::DontCare, MergeSymbol::AllEqual);
    }
    if non_dont_care.iter().all(|t| *t == non_dont_care[0]) && non_dont_care.len() > 1 {
        return (non_dont_care[0], MergeSymbol::AllEqual);
    }

    let numeric: Vec<Titer> = non_dont_care
        .iter()
        .copied()
        .filter(|t| t.is_regular() || t.is_dodgy())
        .collect();
    if !numeric.is_empty() {
        let mean_log = numeric
            .iter()
            .map(|t| t.similarity().unwrap())
            .sum::<f64>()
            / numeric.len() as f64;
        let rounded = round_to_titer_step(mean_log);
        let all_regular = numeric.iter().all(|t| t.is_regular());
        let titer = if all_regular {
            Titer::Regular(rounded)
        } else {
            Titer::Dodgy(rounded)
        };
        let has_less = non_dont_care.iter().any(|t| t.is_less_than());
        let has_more = non_dont_care.iter().any(|t| t.is_more_than());
        let symbol = if has_less && !has_more {
            MergeSymbol::LostLow
        } else if has_more && !has_less {
            MergeSymbol::LostHigh
        } else if numeric.len() == non_dont_care.len() {
            MergeSymbol::NumericMean
        } else {
            MergeSymbol::NumericMean
        };
        return (titer, symbol);
    }

    let less_thans: Vec<u32> = non_dont_care
        .iter()
        .filter_map(|t| if t.is_less_than() { t.value() } else { None })
        .collect();
    let more_thans: Vec<u32> = non_dont_care
        .iter()
        .filter_map(|t| if t.is_more_than() { t.value() } else { None })
        .collect();

    match (less_thans.is_empty(), more_thans.is_empty()) {
        (false, true) => (
            Titer::LessThan(*less_thans.iter().min().unwrap()),
            MergeSymbol::AllLessThan,
        ),
        (true, false) => (
            Titer::MoreThan(*more_thans.iter().max().unwrap()),
            MergeSymbol::AllMoreThan,
        ),
        (false, false) => {
            let low = (*less_thans.iter().min().unwrap() as f64 / 10.0).log2();
            let high = (*more_thans.iter().max().unwrap() as f64 / 10.0).log2();
            let mid = (low + high) / 2.0;
            (Titer::Dodgy(round_to_titer_step(mid)), MergeSymbol::DodgyMerge)
        }
        (true, true) => (Titer::DontCare, MergeSymbol::Conflict),
    }
}

/// Round a log2-space similarity value to the nearest `2^n * 10` step.
fn round_to_titer_step(log_value: f64) -> u32 {
    let n = log_value.round();
    ((2f64.powf(n)) * 10.0).round() as u32
}

struct TitersExisting<'a> {
    table: &'a TiterTable,
    antigen_no: usize,
    serum_no: usize,
}

impl<'a> Iterator for TitersExisting<'a> {
    type Item = (usize, usize, Titer);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.antigen_no >= self.table.number_of_antigens {
                return None;
            }
            if self.serum_no >= self.table.number_of_sera {
                self.serum_no = 0;
                self.antigen_no += 1;
                continue;
            }
            let (i, j) = (self.antigen_no, self.serum_no);
            self.serum_no += 1;
            let t = self.table.titer(i, j);
            if !t.is_dont_care() {
                return Some((i, j, t));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn t(s: &str) -> Titer {
        Titer::parse(s).unwrap()
    }

    #[test]
    fn dense_to_sparse_and_back_round_trips() {
        let dense = TiterTable::from_dense(vec![
            vec![t("40"), t("<10")],
            vec![t("*"), t("160")],
        ])
        .unwrap();
        let sparse = dense.to_sparse();
        assert_eq!(sparse.number_of_non_dont_cares(), 3);
        let back = sparse.to_dense();
        assert_eq!(back, dense);
    }

    #[test]
    fn titers_existing_is_row_major() {
        let dense = TiterTable::from_dense(vec![
            vec![t("40"), t("*")],
            vec![t("80"), t("160")],
        ])
        .unwrap();
        let cells: Vec<_> = dense.titers_existing().map(|(i, j, _)| (i, j)).collect();
        assert_eq!(cells, vec![(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn layer_merge_all_equal() {
        let (merged, symbol) = merge_layer_titers(&[t("40"), t("40")]);
        assert_eq!(merged, t("40"));
        assert_eq!(symbol, MergeSymbol::AllEqual);
    }

    #[test]
    fn layer_merge_numeric_geometric_mean() {
        let (merged, symbol) = merge_layer_titers(&[t("40"), t("160")]);
        // geometric mean of 40, 160 in log2 space: log2(4)=2, log2(16)=4, mean=3 -> 2^3*10=80
        assert_eq!(merged, t("80"));
        assert_eq!(symbol, MergeSymbol::NumericMean);
    }

    #[test]
    fn layer_merge_all_less_than_takes_smallest() {
        let (merged, symbol) = merge_layer_titers(&[t("<10"), t("<40")]);
        assert_eq!(merged, t("<10"));
        assert_eq!(symbol, MergeSymbol::AllLessThan);
    }

    #[test]
    fn layer_merge_all_more_than_takes_largest() {
        let (merged, symbol) = merge_layer_titers(&[t(">40"), t(">160")]);
        assert_eq!(merged, t(">160"));
        assert_eq!(symbol, MergeSymbol::AllMoreThan);
    }

    #[test]
    fn layer_merge_conflicting_less_more_is_dodgy() {
        let (merged, symbol) = merge_layer_titers(&[t("<10"), t(">160")]);
        assert!(merged.is_dodgy());
        assert_eq!(symbol, MergeSymbol::DodgyMerge);
    }

    #[test]
    fn set_from_layers_is_deterministic() {
        let mut table = TiterTable::new_sparse(1, 1);
        let mut layer: Layer = vec![IndexMap::new()];
        layer[0].insert(0, t("40"));
        table.push_layer(layer.clone());
        table.push_layer(layer);
        let report1 = table.set_from_layers();
        let titer1 = table.titer(0, 0);
        let report2 = table.set_from_layers();
        let titer2 = table.titer(0, 0);
        assert_eq!(titer1, titer2);
        assert_eq!(report1.len(), report2.len());
    }
}
