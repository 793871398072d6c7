//! Chart import/export across the three supported formats — spec §4.O.

pub mod ace;
pub mod acd1;
pub mod lispmds;
pub mod sniff;

pub use sniff::{sniff, Format};

use crate::chart::Chart;
use crate::err::{Error, Result};

/// Read-only mapping from location names to geography, used only for
/// display and lispmds name-parsing heuristics — never for chart identity
/// (spec §6 "Environment").
pub trait LocationDb {
    fn latitude_longitude(&self, name: &str) -> Option<(f64, f64)>;
    fn country(&self, name: &str) -> Option<&str>;
    fn continent(&self, name: &str) -> Option<&str>;
    fn cdc_abbreviation(&self, name: &str) -> Option<&str>;
}

/// No-op [`LocationDb`]: every lookup returns `None`. The default when no
/// location file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLocationDb;

impl LocationDb for NullLocationDb {
    fn latitude_longitude(&self, _name: &str) -> Option<(f64, f64)> {
        None
    }

    fn country(&self, _name: &str) -> Option<&str> {
        None
    }

    fn continent(&self, _name: &str) -> Option<&str> {
        None
    }

    fn cdc_abbreviation(&self, _name: &str) -> Option<&str> {
        None
    }
}

/// Sniff `bytes` and import with whichever of the three parsers applies
/// (spec §4.O). `locations` feeds the lispmds display-name heuristics
/// only; pass `None` (or [`NullLocationDb`]) when no location file is
/// configured.
pub fn import(bytes: &[u8], locations: Option<&dyn LocationDb>) -> Result<Chart> {
    match sniff(bytes)? {
        Format::Ace => ace::import(bytes),
        Format::Acd1 => acd1::import(bytes),
        Format::Lispmds => lispmds::import(bytes, locations),
    }
}

/// Export to the canonical JSON form; the only format this crate writes
/// (spec §4.O: "the exporter writes only the canonical JSON form").
pub fn export(chart: &Chart) -> Result<Vec<u8>> {
    ace::export(chart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigen_serum::Antigen;
    use crate::table::TiterTable;
    use crate::titer::Titer;

    #[test]
    fn import_dispatches_on_sniffed_format() {
        let chart = Chart::new(
            Default::default(),
            vec![Antigen::default()],
            vec![Default::default()],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap();
        let bytes = export(&chart).unwrap();
        let reimported = import(&bytes, None).unwrap();
        assert_eq!(reimported.titers().titer(0, 0), Titer::Regular(40));
    }

    #[test]
    fn import_rejects_unrecognized_bytes() {
        assert!(import(b"not a chart", None).is_err());
    }
}
