//! Antigen and serum records — spec §3 "Antigen / Serum".

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Serum-side annotation tokens stripped when matching antigen-to-serum
/// homology (spec §3).
pub const SERUM_ANNOTATION_EXCLUSIONS: &[&str] =
    &["CONC", "RDE@", "BOOST", "BLEED", "LAIV", "CDC"];

/// Sorted, deduplicated set of short annotation strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Annotations(Vec<String>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set: BTreeSet<String> = iter.into_iter().collect();
        let marker = set.take("DISTINCT");
        let mut v: Vec<String> = set.into_iter().collect();
        if let Some(marker) = marker {
            v.push(marker);
            v.sort();
        }
        Self(v)
    }

    pub fn insert(&mut self, value: impl Into<String>) {
        let value = value.into();
        if let Err(pos) = self.0.binary_search(&value) {
            self.0.insert(pos, value);
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    /// `true` if the `DISTINCT` marker annotation is present (used by merge's
    /// `remove_distinct` option, spec §4.J).
    pub fn is_distinct(&self) -> bool {
        self.contains("DISTINCT")
    }

    /// Annotations with the serum-side exclusions stripped, for homology
    /// matching between an antigen and a serum.
    pub fn without_serum_exclusions(&self) -> Annotations {
        Annotations(
            self.0
                .iter()
                .filter(|a| !SERUM_ANNOTATION_EXCLUSIONS.contains(&a.as_str()))
                .cloned()
                .collect(),
        )
    }
}

/// Passage history of an antigen/serum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage(pub String);

/// Coarse passage type used by the "relaxed" match level (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassageType {
    Egg,
    Cell,
    None,
}

impl Passage {
    pub fn passage_type(&self) -> PassageType {
        let lower = self.0.to_lowercase();
        if lower.is_empty() {
            PassageType::None
        } else if lower.contains('e') && !lower.contains("mdck") && !lower.contains("siat") {
            PassageType::Egg
        } else {
            PassageType::Cell
        }
    }
}

/// Aligned sequence plus insertion records, optionally attached to an
/// antigen or serum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub aa: Option<String>,
    pub nuc: Option<String>,
    pub aa_insertions: Vec<String>,
    pub nuc_insertions: Vec<String>,
}

/// A single antigen (titer table row).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Antigen {
    pub name: String,
    pub reassortant: String,
    pub annotations: Annotations,
    pub passage: Passage,
    pub date: Option<String>,
    pub lab_ids: Vec<String>,
    pub sequence: Sequence,
    /// Free-form key/value tree for clades, vaccine status, etc.
    pub semantic_attributes: serde_json::Value,
}

impl Antigen {
    /// Fields compared for merge equality (spec §3): name, reassortant,
    /// annotations, passage.
    pub fn merge_key(&self) -> (&str, &str, &Annotations, &str) {
        (
            &self.name,
            &self.reassortant,
            &self.annotations,
            &self.passage.0,
        )
    }

    pub fn is_distinct(&self) -> bool {
        self.annotations.is_distinct()
    }
}

/// A single serum (titer table column).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Serum {
    pub name: String,
    pub reassortant: String,
    pub annotations: Annotations,
    pub passage: Passage,
    pub serum_id: String,
    pub serum_species: Option<String>,
    pub sequence: Sequence,
    pub semantic_attributes: serde_json::Value,
}

impl Serum {
    /// Fields compared for merge equality (spec §3): name, reassortant,
    /// annotations, passage, serum id.
    pub fn merge_key(&self) -> (&str, &str, &Annotations, &str, &str) {
        (
            &self.name,
            &self.reassortant,
            &self.annotations,
            &self.passage.0,
            &self.serum_id,
        )
    }

    pub fn is_distinct(&self) -> bool {
        self.annotations.is_distinct()
    }
}
