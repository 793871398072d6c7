//! A single HI (or similar) titer value — spec §4.A.
//!
//! Titers are stored as a kind tag plus an integer value that is always a
//! positive multiple of 10 (starting titer 10 corresponds to log2 0).

use std::fmt;

use crate::err::{Error, Result};

/// A single antigen/serum cross-reactivity measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Titer {
    /// Regular reading, e.g. `"40"`.
    Regular(u32),
    /// Less-than reading, e.g. `"<10"`.
    LessThan(u32),
    /// More-than reading, e.g. `">1280"`.
    MoreThan(u32),
    /// Dodgy (uncertain) reading, e.g. `"~20"`.
    Dodgy(u32),
    /// Don't-care / not measured, `"*"`.
    DontCare,
}

impl Titer {
    /// Parse the canonical text form of a titer.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidTiter(text.to_string()));
        }
        if text == "*" {
            return Ok(Titer::DontCare);
        }
        let (kind_char, rest): (Option<char>, &str) = match text.as_bytes()[0] {
            b'<' => (Some('<'), &text[1..]),
            b'>' => (Some('>'), &text[1..]),
            b'~' => (Some('~'), &text[1..]),
            _ => (None, text),
        };
        let value: u32 = rest
            .parse()
            .map_err(|_| Error::InvalidTiter(text.to_string()))?;
        if value == 0 || value % 10 != 0 {
            return Err(Error::InvalidTiter(text.to_string()));
        }
        Ok(match kind_char {
            Some('<') => Titer::LessThan(value),
            Some('>') => Titer::MoreThan(value),
            Some('~') => Titer::Dodgy(value),
            _ => Titer::Regular(value),
        })
    }

    pub fn is_regular(&self) -> bool {
        matches!(self, Titer::Regular(_))
    }

    pub fn is_less_than(&self) -> bool {
        matches!(self, Titer::LessThan(_))
    }

    pub fn is_more_than(&self) -> bool {
        matches!(self, Titer::MoreThan(_))
    }

    pub fn is_dodgy(&self) -> bool {
        matches!(self, Titer::Dodgy(_))
    }

    pub fn is_dont_care(&self) -> bool {
        matches!(self, Titer::DontCare)
    }

    /// The raw numeric value, if any (absent only for `DontCare`).
    pub fn value(&self) -> Option<u32> {
        match *self {
            Titer::Regular(v) | Titer::LessThan(v) | Titer::MoreThan(v) | Titer::Dodgy(v) => {
                Some(v)
            }
            Titer::DontCare => None,
        }
    }

    /// Contribution to column-basis computation (spec §4.A, §4.D).
    ///
    /// `<v` contributes `log2(v/10)`, `>v` contributes `log2(v/10)+1`,
    /// regular/dodgy contribute `log2(v/10)`; `DontCare` has none.
    pub fn logged_for_column_bases(&self) -> Result<f64> {
        match *self {
            Titer::LessThan(v) | Titer::Regular(v) | Titer::Dodgy(v) => Ok(log2_over_10(v)),
            Titer::MoreThan(v) => Ok(log2_over_10(v) + 1.0),
            Titer::DontCare => Err(Error::DataNotAvailable(
                "dont-care titer has no log value".into(),
            )),
        }
    }

    /// Similarity value used in avidity/serum-circle math (spec §4.A).
    ///
    /// `None` for `MoreThan` and `DontCare`.
    pub fn similarity(&self) -> Option<f64> {
        match *self {
            Titer::Regular(v) | Titer::Dodgy(v) | Titer::LessThan(v) => Some(log2_over_10(v)),
            Titer::MoreThan(_) | Titer::DontCare => None,
        }
    }

    /// Round-trip text form.
    pub fn format(&self) -> String {
        match *self {
            Titer::Regular(v) => format!("{v}"),
            Titer::LessThan(v) => format!("<{v}"),
            Titer::MoreThan(v) => format!(">{v}"),
            Titer::Dodgy(v) => format!("~{v}"),
            Titer::DontCare => "*".to_string(),
        }
    }
}

fn log2_over_10(v: u32) -> f64 {
    (v as f64 / 10.0).log2()
}

impl fmt::Display for Titer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::str::FromStr for Titer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Titer::parse(s)
    }
}

impl TryFrom<String> for Titer {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Titer::parse(&value)
    }
}

impl From<Titer> for String {
    fn from(value: Titer) -> Self {
        value.format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("40", Titer::Regular(40))]
    #[case("<10", Titer::LessThan(10))]
    #[case(">1280", Titer::MoreThan(1280))]
    #[case("~20", Titer::Dodgy(20))]
    #[case("*", Titer::DontCare)]
    fn parse_well_formed(#[case] text: &str, #[case] expected: Titer) {
        assert_eq!(Titer::parse(text).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("<abc")]
    #[case("15")] // not a multiple of 10
    fn parse_rejects(#[case] text: &str) {
        assert!(Titer::parse(text).is_err());
    }

    #[rstest]
    #[case(Titer::Regular(40))]
    #[case(Titer::LessThan(10))]
    #[case(Titer::MoreThan(1280))]
    #[case(Titer::Dodgy(20))]
    #[case(Titer::DontCare)]
    fn round_trip(#[case] titer: Titer) {
        assert_eq!(Titer::parse(&titer.format()).unwrap(), titer);
    }

    #[test]
    fn logged_for_column_bases_matches_kind() {
        assert_eq!(Titer::Regular(40).logged_for_column_bases().unwrap(), 2.0);
        assert_eq!(
            Titer::LessThan(40).logged_for_column_bases().unwrap(),
            2.0
        );
        assert_eq!(Titer::MoreThan(40).logged_for_column_bases().unwrap(), 3.0);
        assert!(Titer::DontCare.logged_for_column_bases().is_err());
    }

    #[test]
    fn similarity_excludes_more_than_and_dont_care() {
        assert_eq!(Titer::Regular(40).similarity(), Some(2.0));
        assert_eq!(Titer::LessThan(40).similarity(), Some(2.0));
        assert_eq!(Titer::MoreThan(40).similarity(), None);
        assert_eq!(Titer::DontCare.similarity(), None);
    }
}
