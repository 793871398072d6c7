//! Common antigen/serum matcher between two point lists — spec §4.I.
//!
//! Grounded on `original_source/cc/chart/v3/common.hh`'s `common_data_t` /
//! `common_antigens_sera_t`: build every primary/secondary pair's match
//! score, then greedily pick the highest-scoring pairs (ties broken by
//! primary index) until no pair that uses an unused primary and an unused
//! secondary remains.

use crate::antigen_serum::{Antigen, PassageType, Serum};

/// How strictly names/reassortant/passage/date must agree to call two
/// points "the same" across charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLevel {
    /// Name, reassortant, annotations, passage and (for sera) serum id must
    /// match exactly.
    Strict,
    /// Passage is compared only by [`PassageType`] (egg/cell), not its
    /// exact text, and serum ids are ignored.
    Relaxed,
    /// Passage is not compared at all.
    Ignored,
    /// Try [`MatchLevel::Strict`] first; if nothing above
    /// [`Score::NoMatch`] exists for a pair, retry with
    /// [`MatchLevel::Relaxed`].
    Automatic,
}

/// How well a single primary/secondary pair matched; ordered worst to best
/// so the greedy matcher can pick the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Score {
    NoMatch,
    PassageSerumIdIgnored,
    Egg,
    WithoutDate,
    FullMatch,
}

/// Anything that can be matched by name/reassortant/annotations/passage
/// (and, for sera, serum id).
pub trait Matchable {
    fn name(&self) -> &str;
    fn reassortant(&self) -> &str;
    fn annotations_match(&self, other: &Self) -> bool;
    fn passage_text(&self) -> &str;
    fn passage_type(&self) -> PassageType;
    fn serum_id(&self) -> Option<&str> {
        None
    }
    fn date(&self) -> Option<&str> {
        None
    }
}

impl Matchable for Antigen {
    fn name(&self) -> &str {
        &self.name
    }
    fn reassortant(&self) -> &str {
        &self.reassortant
    }
    fn annotations_match(&self, other: &Self) -> bool {
        self.annotations == other.annotations
    }
    fn passage_text(&self) -> &str {
        &self.passage.0
    }
    fn passage_type(&self) -> PassageType {
        self.passage.passage_type()
    }
    fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }
}

impl Matchable for Serum {
    fn name(&self) -> &str {
        &self.name
    }
    fn reassortant(&self) -> &str {
        &self.reassortant
    }
    fn annotations_match(&self, other: &Self) -> bool {
        self.annotations == other.annotations
    }
    fn passage_text(&self) -> &str {
        &self.passage.0
    }
    fn passage_type(&self) -> PassageType {
        self.passage.passage_type()
    }
    fn serum_id(&self) -> Option<&str> {
        Some(&self.serum_id)
    }
}

fn score_pair<T: Matchable>(primary: &T, secondary: &T, level: MatchLevel) -> Score {
    if primary.name() != secondary.name() || primary.reassortant() != secondary.reassortant() {
        return Score::NoMatch;
    }
    if !primary.annotations_match(secondary) {
        return Score::NoMatch;
    }

    match level {
        MatchLevel::Strict => {
            if primary.passage_text() != secondary.passage_text() {
                return Score::NoMatch;
            }
            if primary.serum_id() != secondary.serum_id() {
                return Score::NoMatch;
            }
            full_or_without_date(primary, secondary)
        }
        MatchLevel::Relaxed => {
            if primary.passage_type() != secondary.passage_type() {
                return Score::NoMatch;
            }
            if primary.serum_id() != secondary.serum_id() {
                return Score::PassageSerumIdIgnored;
            }
            match primary.passage_type() {
                PassageType::Egg => Score::Egg,
                _ => full_or_without_date(primary, secondary),
            }
        }
        MatchLevel::Ignored => {
            if primary.serum_id() != secondary.serum_id() {
                Score::PassageSerumIdIgnored
            } else {
                Score::Egg
            }
        }
        MatchLevel::Automatic => {
            let strict = score_pair(primary, secondary, MatchLevel::Strict);
            if strict != Score::NoMatch {
                strict
            } else {
                score_pair(primary, secondary, MatchLevel::Relaxed)
            }
        }
    }
}

fn full_or_without_date<T: Matchable>(primary: &T, secondary: &T) -> Score {
    match (primary.date(), secondary.date()) {
        (Some(a), Some(b)) if a == b => Score::FullMatch,
        (Some(_), Some(_)) => Score::WithoutDate,
        (None, None) => Score::FullMatch,
        _ => Score::WithoutDate,
    }
}

/// Primary-index / secondary-index mapping for a common-antigen or
/// common-serum match.
#[derive(Debug, Clone)]
pub struct CommonMapping {
    /// Indexed by secondary point number; `None` if the secondary point has
    /// no match in `primary`.
    primary_by_secondary: Vec<Option<usize>>,
    /// Indexed by primary point number; `None` if the primary point has no
    /// match in `secondary`.
    secondary_by_primary: Vec<Option<usize>>,
}

impl CommonMapping {
    pub fn primary_by_secondary(&self, secondary_no: usize) -> Option<usize> {
        self.primary_by_secondary.get(secondary_no).copied().flatten()
    }

    pub fn secondary_by_primary(&self, primary_no: usize) -> Option<usize> {
        self.secondary_by_primary.get(primary_no).copied().flatten()
    }

    pub fn number_of_common(&self) -> usize {
        self.secondary_by_primary.iter().filter(|m| m.is_some()).count()
    }

    /// `(primary_no, secondary_no)` pairs, ordered by ascending primary
    /// index.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        self.secondary_by_primary
            .iter()
            .enumerate()
            .filter_map(|(p, s)| s.map(|s| (p, s)))
            .collect()
    }
}

/// Greedily match every `primary`/`secondary` pair, highest score first,
/// ties broken by ascending `(primary_no, secondary_no)` (spec §4.I).
pub fn match_common<T: Matchable>(primary: &[T], secondary: &[T], level: MatchLevel) -> CommonMapping {
    let mut candidates: Vec<(Score, usize, usize)> = Vec::new();
    for (p_idx, p) in primary.iter().enumerate() {
        for (s_idx, s) in secondary.iter().enumerate() {
            let score = score_pair(p, s, level);
            if score != Score::NoMatch {
                candidates.push((score, p_idx, s_idx));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut primary_by_secondary = vec![None; secondary.len()];
    let mut secondary_by_primary = vec![None; primary.len()];
    let mut primary_used = vec![false; primary.len()];
    let mut secondary_used = vec![false; secondary.len()];

    for (_, p_idx, s_idx) in candidates {
        if primary_used[p_idx] || secondary_used[s_idx] {
            continue;
        }
        primary_used[p_idx] = true;
        secondary_used[s_idx] = true;
        primary_by_secondary[s_idx] = Some(p_idx);
        secondary_by_primary[p_idx] = Some(s_idx);
    }

    CommonMapping {
        primary_by_secondary,
        secondary_by_primary,
    }
}

/// Combined antigen + serum common-point mapping between two charts.
#[derive(Debug, Clone)]
pub struct CommonAntigensSera {
    pub antigens: CommonMapping,
    pub sera: CommonMapping,
}

impl CommonAntigensSera {
    pub fn build(
        primary_antigens: &[Antigen],
        secondary_antigens: &[Antigen],
        primary_sera: &[Serum],
        secondary_sera: &[Serum],
        level: MatchLevel,
    ) -> Self {
        Self {
            antigens: match_common(primary_antigens, secondary_antigens, level),
            sera: match_common(primary_sera, secondary_sera, level),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.antigens.number_of_common() == 0 && self.sera.number_of_common() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigen_serum::{Annotations, Passage};
    use pretty_assertions::assert_eq;

    fn antigen(name: &str, passage: &str) -> Antigen {
        Antigen {
            name: name.to_string(),
            passage: Passage(passage.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn strict_match_requires_identical_passage() {
        let primary = vec![antigen("A/X/1", "E3")];
        let secondary = vec![antigen("A/X/1", "E3"), antigen("A/X/1", "MDCK1")];
        let mapping = match_common(&primary, &secondary, MatchLevel::Strict);
        assert_eq!(mapping.primary_by_secondary(0), Some(0));
        assert_eq!(mapping.primary_by_secondary(1), None);
    }

    #[test]
    fn relaxed_match_ignores_exact_passage_text() {
        let primary = vec![antigen("A/X/1", "E3")];
        let secondary = vec![antigen("A/X/1", "E2")];
        let mapping = match_common(&primary, &secondary, MatchLevel::Relaxed);
        assert_eq!(mapping.primary_by_secondary(0), Some(0));
    }

    #[test]
    fn greedy_assignment_is_one_to_one() {
        let primary = vec![antigen("A/X/1", "E3"), antigen("A/X/1", "E3")];
        let secondary = vec![antigen("A/X/1", "E3")];
        let mapping = match_common(&primary, &secondary, MatchLevel::Strict);
        assert_eq!(mapping.number_of_common(), 1);
        assert_eq!(mapping.primary_by_secondary(0), Some(0));
    }

    #[test]
    fn different_names_never_match() {
        let primary = vec![antigen("A/X/1", "E3")];
        let secondary = vec![antigen("A/Y/2", "E3")];
        let mapping = match_common(&primary, &secondary, MatchLevel::Automatic);
        assert_eq!(mapping.number_of_common(), 0);
    }

    #[test]
    fn annotations_mismatch_blocks_match() {
        let mut primary = antigen("A/X/1", "E3");
        primary.annotations = Annotations::from_iter(["CONC".to_string()]);
        let secondary = antigen("A/X/1", "E3");
        let mapping = match_common(&[primary], &[secondary], MatchLevel::Strict);
        assert_eq!(mapping.number_of_common(), 0);
    }
}
