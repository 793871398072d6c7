//! Per-serum column bases — spec §3 "ColumnBases" / §4.D.

use crate::table::TiterTable;

/// A floor applied uniformly to all raw column bases.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MinimumColumnBasis {
    None,
    /// A fixed titer value, e.g. 1280, 640, 320, ...
    Fixed(u32),
}

impl MinimumColumnBasis {
    pub fn as_log(&self) -> f64 {
        match self {
            MinimumColumnBasis::None => f64::NEG_INFINITY,
            MinimumColumnBasis::Fixed(v) => (*v as f64 / 10.0).log2(),
        }
    }

    pub fn parse(text: &str) -> Self {
        if text.eq_ignore_ascii_case("none") {
            MinimumColumnBasis::None
        } else {
            text.parse::<u32>()
                .map(MinimumColumnBasis::Fixed)
                .unwrap_or(MinimumColumnBasis::None)
        }
    }

    pub fn format(&self) -> String {
        match self {
            MinimumColumnBasis::None => "none".to_string(),
            MinimumColumnBasis::Fixed(v) => v.to_string(),
        }
    }
}

impl Default for MinimumColumnBasis {
    fn default() -> Self {
        MinimumColumnBasis::None
    }
}

/// Length-`S` vector of log2 column bases plus the floor that produced them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColumnBases {
    mcb: MinimumColumnBasis,
    values: Vec<f64>,
}

impl ColumnBases {
    /// Compute column bases for `titers` given a minimum column basis floor
    /// (spec §4.D).
    pub fn compute(titers: &TiterTable, mcb: MinimumColumnBasis) -> Self {
        let floor = mcb.as_log();
        let mut values = vec![f64::NEG_INFINITY; titers.number_of_sera()];
        for (_, j, t) in titers.titers_existing() {
            if let Ok(logged) = t.logged_for_column_bases() {
                if logged > values[j] {
                    values[j] = logged;
                }
            }
        }
        for v in values.iter_mut() {
            if *v < floor {
                *v = floor;
            }
        }
        Self { mcb, values }
    }

    pub fn minimum_column_basis(&self) -> MinimumColumnBasis {
        self.mcb
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, serum_no: usize) -> f64 {
        self.values.get(serum_no).copied().unwrap_or(f64::NEG_INFINITY)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn from_values(values: Vec<f64>, mcb: MinimumColumnBasis) -> Self {
        Self { mcb, values }
    }

    pub fn remove_sera(&mut self, indexes_desc: &[usize]) {
        for &idx in indexes_desc {
            if idx < self.values.len() {
                self.values.remove(idx);
            }
        }
    }
}
