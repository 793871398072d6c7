//! Format detection for chart import — spec §4.O "Sniffing".

use crate::err::{Error, Result};

/// Which on-disk chart format a byte buffer looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Format {
    /// Canonical JSON, `"acmacs-ace-v1"`.
    Ace,
    /// Legacy-key JSON embedding Python-literal data (`"acd1"`).
    Acd1,
    /// S-expression MDS format (`"lispmds"`).
    Lispmds,
}

/// Detect the format of `bytes` (spec §4.O "Sniffing"). Errors with
/// [`Error::UnsupportedFormat`] if none of the three markers are found.
pub fn sniff(bytes: &[u8]) -> Result<Format> {
    let head_len = bytes.len().min(100);
    let head = String::from_utf8_lossy(&bytes[..head_len]);
    if bytes.first() == Some(&b'{') && head.contains("acmacs-ace-v1") {
        return Ok(Format::Ace);
    }

    let text = String::from_utf8_lossy(bytes);
    if text.contains("data = {") {
        return Ok(Format::Acd1);
    }
    if let Some(make_pos) = text.find("(MAKE-MASTER-MDS-WINDOW") {
        if text[make_pos..].contains("(HI-IN") {
            return Ok(Format::Lispmds);
        }
    }

    Err(Error::UnsupportedFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ace() {
        let bytes = br#"{"  version": "acmacs-ace-v1", "c": {}}"#;
        assert_eq!(sniff(bytes).unwrap(), Format::Ace);
    }

    #[test]
    fn recognizes_acd1() {
        let bytes = b"some header\ndata = {'version': 4}\n";
        assert_eq!(sniff(bytes).unwrap(), Format::Acd1);
    }

    #[test]
    fn recognizes_lispmds() {
        let bytes = b"(MAKE-MASTER-MDS-WINDOW :SOMETHING (HI-IN 1 2 3))";
        assert_eq!(sniff(bytes).unwrap(), Format::Lispmds);
    }

    #[test]
    fn rejects_unknown() {
        let bytes = b"not a chart at all";
        assert!(sniff(bytes).is_err());
    }
}
