//! S-expression ("lispmds") import — spec §4.O.
//!
//! Tokenizes and parses the Lisp-ish text MDS windows are saved as, then
//! walks the parsed tree structurally (searching for the `HI-IN` titer
//! table rather than mirroring the original's full index-chain navigation)
//! to build a [`Chart`].

use std::collections::BTreeSet;

use crate::antigen_serum::{Annotations, Antigen, Passage, Sequence, Serum};
use crate::chart::{Chart, Info};
use crate::err::{Error, Result};
use crate::io::LocationDb;
use crate::layout::Layout;
use crate::projection::Projection;
use crate::table::TiterTable;
use crate::titer::Titer;

/// A lexical token of the s-expression grammar (spec §4.O).
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Symbol(String),
    Keyword(String),
    Number(f64),
    Str(String),
    /// `'symbol` — a quoted symbol, distinct from an escaped `|symbol|`.
    QuotedSymbol(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_whitespace() => {
                i += 1;
            }
            ';' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '|' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '|' {
                    s.push(chars[i]);
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Symbol(s));
            }
            ':' => {
                let mut s = String::from(':');
                i += 1;
                while i < chars.len() && is_symbol_char(chars[i]) {
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Keyword(s));
            }
            '\'' => {
                i += 1;
                let mut s = String::new();
                while i < chars.len() && is_symbol_char(chars[i]) {
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::QuotedSymbol(s));
            }
            c if is_number_start(c, chars.get(i + 1).copied()) => {
                let start = i;
                while i < chars.len() && is_number_char(chars[i]) {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let normalized = raw.replace(['d', 'D'], "e");
                let value: f64 = normalized
                    .parse()
                    .map_err(|_| Error::malformed_at(text, start))?;
                tokens.push(Token::Number(value));
            }
            _ => {
                let start = i;
                while i < chars.len() && is_symbol_char(chars[i]) {
                    i += 1;
                }
                if i == start {
                    return Err(Error::malformed_at(text, start));
                }
                let raw: String = chars[start..i].iter().collect();
                tokens.push(Token::Symbol(raw));
            }
        }
    }
    Ok(tokens)
}

fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && c != '(' && c != ')' && c != '"' && c != '\''
}

fn is_number_start(c: char, next: Option<char>) -> bool {
    c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit()))
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E' | 'd' | 'D')
}

/// A parsed s-expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Symbol(String),
    Keyword(String),
    Number(f64),
    Str(String),
    List(Vec<SExpr>),
}

fn parse_tokens(tokens: &[Token], pos: &mut usize) -> Result<SExpr> {
    match tokens.get(*pos) {
        Some(Token::Open) => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Close) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => items.push(parse_tokens(tokens, pos)?),
                    None => return Err(Error::StructureInvalid("unterminated list".into())),
                }
            }
            Ok(SExpr::List(items))
        }
        Some(Token::Close) => Err(Error::StructureInvalid("unexpected ')'".into())),
        Some(Token::Symbol(s)) | Some(Token::QuotedSymbol(s)) => {
            let s = s.clone();
            *pos += 1;
            Ok(SExpr::Symbol(s))
        }
        Some(Token::Keyword(s)) => {
            let s = s.clone();
            *pos += 1;
            Ok(SExpr::Keyword(s))
        }
        Some(Token::Number(n)) => {
            let n = *n;
            *pos += 1;
            Ok(SExpr::Number(n))
        }
        Some(Token::Str(s)) => {
            let s = s.clone();
            *pos += 1;
            Ok(SExpr::Str(s))
        }
        None => Err(Error::StructureInvalid("unexpected end of input".into())),
    }
}

/// Parse a complete s-expression document (spec §4.O tokens).
pub fn parse(text: &str) -> Result<SExpr> {
    let tokens = tokenize(text)?;
    let mut pos = 0;
    let expr = parse_tokens(&tokens, &mut pos)?;
    Ok(expr)
}

impl SExpr {
    fn as_list(&self) -> Option<&[SExpr]> {
        match self {
            SExpr::List(items) => Some(items),
            _ => None,
        }
    }

    fn as_name(&self) -> Option<&str> {
        match self {
            SExpr::Symbol(s) => Some(s.as_str()),
            SExpr::Keyword(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            SExpr::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn as_str_like(&self) -> Option<&str> {
        match self {
            SExpr::Str(s) => Some(s.as_str()),
            SExpr::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Depth-first search for the first list whose head element names `head`
/// (case-sensitive, as lispmds symbols are always upper-case).
fn find_list_headed<'a>(expr: &'a SExpr, head: &str) -> Option<&'a [SExpr]> {
    if let SExpr::List(items) = expr {
        if items.first().and_then(|i| i.as_name()) == Some(head) {
            return Some(items);
        }
        for item in items {
            if let Some(found) = find_list_headed(item, head) {
                return Some(found);
            }
        }
    }
    None
}

/// lispmds titer cell -> [`Titer`]. Numeric cells are log2·10 units
/// (spec §4.O); `*`/`NIL` mean dont-care.
fn decode_titer_cell(expr: &SExpr) -> Titer {
    match expr {
        SExpr::Number(n) => {
            let raw = 10.0 * 2f64.powf(n / 10.0);
            Titer::Regular(raw.round().max(10.0) as u32)
        }
        SExpr::Symbol(s) if s == "*" || s.eq_ignore_ascii_case("NIL") => Titer::DontCare,
        _ => Titer::DontCare,
    }
}

/// Decode a lispmds antigen/serum display name into `(name, reassortant,
/// passage, annotations)`. Names look like `A/SINGAPORE/1/2020 (egg) DISTINCT`:
/// a slash-delimited virus name, an optional parenthesized passage, and
/// trailing space-separated annotation tokens.
fn decode_display_name(raw: &str, _locations: Option<&dyn LocationDb>) -> (String, String, Passage, Annotations) {
    let mut rest = raw.trim();
    let mut passage = String::new();
    let mut annotations = Vec::new();

    if let Some(open) = rest.find('(') {
        if let Some(close) = rest[open..].find(')') {
            passage = rest[open + 1..open + close].trim().to_string();
            let after = &rest[open + close + 1..];
            let before = &rest[..open];
            annotations.extend(after.split_whitespace().map(|s| s.to_string()));
            rest = before.trim_end();
            let name = rest.to_string();
            return (name, String::new(), Passage(passage), Annotations::from_iter(annotations));
        }
    }

    let mut parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() > 1 {
        annotations = parts.split_off(1).into_iter().map(|s| s.to_string()).collect();
    }
    let name = parts.first().copied().unwrap_or(rest).to_string();
    (name, String::new(), Passage(passage), Annotations::from_iter(annotations))
}

fn decode_names(list: &SExpr, locations: Option<&dyn LocationDb>) -> Vec<(String, String, Passage, Annotations)> {
    list.as_list()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str_like())
                .map(|s| decode_display_name(s, locations))
                .collect()
        })
        .unwrap_or_default()
}

/// Import a chart from lispmds bytes (already identified via [`super::sniff`]).
pub fn import(bytes: &[u8], locations: Option<&dyn LocationDb>) -> Result<Chart> {
    let text = String::from_utf8_lossy(bytes);
    let root = parse(&text)?;

    let hi_in = find_list_headed(&root, "HI-IN")
        .ok_or_else(|| Error::StructureInvalid("no HI-IN table found".into()))?;
    if hi_in.len() < 4 {
        return Err(Error::StructureInvalid("HI-IN table missing fields".into()));
    }
    let antigen_names = decode_names(&hi_in[1], locations);
    let serum_names = decode_names(&hi_in[2], locations);

    let titer_rows = hi_in[3]
        .as_list()
        .ok_or_else(|| Error::StructureInvalid("HI-IN titer table is not a list".into()))?;

    let number_of_sera = serum_names.len();
    let mut table = TiterTable::new_dense(antigen_names.len(), number_of_sera);
    for (ag, row) in titer_rows.iter().enumerate() {
        let cells = row
            .as_list()
            .ok_or_else(|| Error::StructureInvalid("HI-IN row is not a list".into()))?;
        for (sr, cell) in cells.iter().enumerate() {
            if sr >= number_of_sera {
                break;
            }
            table.set_titer(ag, sr, decode_titer_cell(cell));
        }
    }

    let antigens: Vec<Antigen> = antigen_names
        .into_iter()
        .map(|(name, reassortant, passage, annotations)| Antigen {
            name,
            reassortant,
            annotations,
            passage,
            date: None,
            lab_ids: Vec::new(),
            sequence: Sequence::default(),
            semantic_attributes: serde_json::Value::Null,
        })
        .collect();
    let sera: Vec<Serum> = serum_names
        .into_iter()
        .map(|(name, reassortant, passage, annotations)| Serum {
            name,
            reassortant,
            annotations,
            passage,
            serum_id: String::new(),
            serum_species: None,
            sequence: Sequence::default(),
            semantic_attributes: serde_json::Value::Null,
        })
        .collect();

    let mut chart = Chart::new(Info::default(), antigens, sera, table)?;

    if let Some(projection) = decode_projection(&root, chart.number_of_points())? {
        chart.push_projection(projection);
    }

    Ok(chart)
}

/// Column bases and layout sit in a `(STARTING-COORDSS ...)` or
/// `(BATCH-RUNS ...)` list: the first `num_points` entries are point
/// coordinates, and the entry right after them holds the column bases at
/// a fixed nested position (spec §4.O: "embedded at a fixed position
/// after the layout").
fn decode_projection(root: &SExpr, num_points: usize) -> Result<Option<Projection>> {
    let coords_list = match find_list_headed(root, ":STARTING-COORDSS")
        .or_else(|| find_list_headed(root, ":BATCH-RUNS"))
    {
        Some(l) => l,
        None => return Ok(None),
    };
    // Skip the head symbol itself.
    let entries = &coords_list[1..];
    if entries.len() < num_points {
        return Ok(None);
    }
    let num_dims = entries[0]
        .as_list()
        .map(|point| point.iter().filter_map(|c| c.as_number()).count())
        .unwrap_or(0);
    if num_dims == 0 {
        return Ok(None);
    }
    let mut layout = Layout::new(num_points, num_dims);
    for (p, point) in entries.iter().take(num_points).enumerate() {
        if let Some(coords) = point.as_list() {
            let values: Vec<f64> = coords.iter().filter_map(|c| c.as_number()).collect();
            if values.len() == num_dims {
                layout.set_point(p, &values);
            }
        }
    }

    let mut projection = Projection::from_layout(layout);
    let unmovable: BTreeSet<usize> = find_list_headed(root, ":UNMOVEABLE-COORDS")
        .map(|items| {
            items[1..]
                .iter()
                .filter_map(|i| i.as_number())
                .map(|n| n as usize)
                .collect()
        })
        .unwrap_or_default();
    *projection.unmovable_mut() = unmovable;

    if let Some(trailing) = entries.get(num_points).and_then(|e| e.as_list()) {
        if let Some(cb_holder) = trailing.first().and_then(|e| e.as_list()) {
            if let Some(cb_list) = cb_holder.get(1).and_then(|e| e.as_list()) {
                let cb: Vec<f64> = cb_list.iter().filter_map(|c| c.as_number()).collect();
                if !cb.is_empty() {
                    projection.set_forced_column_bases(Some(cb));
                }
            }
        }
    }

    Ok(Some(projection))
}
