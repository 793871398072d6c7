//! Legacy-key JSON ("acd1") import — spec §4.O.
//!
//! The acd1 text form embeds Python-literal data after a `data = {`
//! marker. [`rewrite`] turns that literal into valid JSON text; [`import`]
//! then parses it and maps the legacy full-word keys onto [`Chart`].

use indexmap::IndexMap;
use serde_json::Value;

use crate::antigen_serum::{Annotations, Antigen, Passage, Sequence, Serum};
use crate::chart::{Chart, Info};
use crate::column_bases::MinimumColumnBasis;
use crate::err::{Error, Result};
use crate::projection::Projection;
use crate::table::TiterTable;
use crate::titer::Titer;

const MARKER: &str = "data = {";

/// Normalize a legacy date string to ISO 8601 (`YYYY-MM-DD`), trying the
/// `YYYYMMDD` and `YYYY-MM-DD` forms seen in acd1 tables. Falls back to
/// the raw text, with a warning, when neither parses.
fn normalize_date(raw: &str) -> String {
    for format in ["%Y%m%d", "%Y-%m-%d"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    tracing::warn!("unrecognized acd1 date {raw:?}, keeping as-is");
    raw.to_string()
}

/// Rewrite a Python-literal object (everything following [`MARKER`]) into
/// JSON text, applying the textual transforms spec.md enumerates.
///
/// Runs as a single pass over characters with small lookback/lookahead,
/// tracking whether the cursor is inside a (post-rewrite) JSON string so
/// quote and comment handling don't fire on quoted text.
pub fn rewrite(literal: &str) -> String {
    let chars: Vec<char> = literal.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut in_string = false;
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if c == '\'' {
                let prev_alnum = i > 0 && chars[i - 1].is_alphanumeric();
                let next_alnum = chars.get(i + 1).is_some_and(|c| c.is_alphanumeric());
                if prev_alnum && next_alnum {
                    out.push('\''); // apostrophe inside a word, e.g. COTE D'IVOIR
                } else {
                    out.push('"'); // closing delimiter
                    in_string = false;
                }
            } else {
                out.push(c);
            }
            i += 1;
            continue;
        }
        match c {
            '#' => {
                // Outside any string, `#` always starts a Python comment.
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' => {
                out.push('"');
                in_string = true;
                i += 1;
            }
            _ => {
                // `: True`/`: False`/`: None` -> `: true`/`: false`/`: null`
                if c == ':' && chars.get(i + 1) == Some(&' ') {
                    if let Some(replacement) = match_keyword(&chars, i + 2) {
                        out.push(':');
                        out.push(' ');
                        out.push_str(replacement.1);
                        i += 2 + replacement.0;
                        continue;
                    }
                }
                out.push(c);
                i += 1;
            }
        }
    }
    let out = out.replace("[nan, nan]", "[]").replace("[nan,nan]", "[]");
    let out = quote_bare_numeric_keys(&out);
    let out = tuples_to_arrays(&out);
    let out = singleton_sets_to_arrays(&out);
    strip_trailing_commas(&out)
}

/// If `chars[pos..]` starts with `True`, `False`, or `None`, return the
/// matched length and its JSON replacement.
fn match_keyword(chars: &[char], pos: usize) -> Option<(usize, &'static str)> {
    const KEYWORDS: &[(&str, &str)] = &[("True", "true"), ("False", "false"), ("None", "null")];
    for (word, replacement) in KEYWORDS {
        let len = word.chars().count();
        if chars[pos..].iter().take(len).collect::<String>() == *word {
            return Some((len, replacement));
        }
    }
    None
}

/// `{1: x}` -> `{"1": x}`: quote a run of digits that directly precedes a
/// top-level `:` inside an object, when not already inside quotes.
fn quote_bare_numeric_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if (c == '{' || c == ',') && out.chars().last().map(|last| last == c).unwrap_or(false) {
            // unreachable guard kept simple; fallthrough below handles it
        }
        if c.is_ascii_digit() {
            let mut digits = String::new();
            digits.push(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() {
                    digits.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek() == Some(&':') {
                out.push('"');
                out.push_str(&digits);
                out.push('"');
            } else {
                out.push_str(&digits);
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// `{( a,b ), ( c,d )}` -> `[[a,b],[c,d]]`: a set-of-tuples literal. Since
/// the preprocessor does not track full brace nesting depth, this handles
/// the common case of tuple elements containing no nested braces.
fn tuples_to_arrays(text: &str) -> String {
    text.replace('(', "[").replace(')', "]")
}

/// Detect `{x}` where `x` is a single bare string or number (a Python
/// `set` literal) and rewrite it as `[x]`. Objects (`{"k": v}`) and empty
/// objects (`{}`) are left untouched.
fn singleton_sets_to_arrays(text: &str) -> String {
    let bytes: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == '{' {
            if let Some(close) = find_matching_brace(&bytes, i) {
                let inner: String = bytes[i + 1..close].iter().collect();
                let trimmed = inner.trim();
                let looks_like_set = !trimmed.is_empty()
                    && !trimmed.contains(':')
                    && !trimmed.contains(',')
                    && (trimmed.starts_with('"') || trimmed.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-'));
                if looks_like_set {
                    out.push('[');
                    out.push_str(trimmed);
                    out.push(']');
                    i = close + 1;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn find_matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    for (idx, &c) in chars.iter().enumerate().skip(open) {
        if in_string {
            if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Delete the trailing comma before a closing `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn field_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn field_array_strings(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn decode_passage(value: &Value) -> Passage {
    match value.get("passage") {
        Some(Value::Object(dict)) => {
            let mut p = dict.get("passage").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if let Some(date) = dict.get("date").and_then(|v| v.as_str()) {
                if !date.is_empty() {
                    p.push_str(" (");
                    p.push_str(date);
                    p.push(')');
                }
            }
            Passage(p)
        }
        Some(Value::String(s)) => Passage(s.clone()),
        _ => Passage::default(),
    }
}

fn decode_reassortant(value: &Value) -> String {
    match value.get("reassortant") {
        Some(Value::Object(dict)) => dict
            .get("reassortant")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn decode_serum_id(value: &Value) -> String {
    match value.get("serum_id") {
        Some(Value::Object(dict)) => dict
            .get("serum_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn decode_antigen(value: &Value) -> Antigen {
    let mut annotations: Vec<String> = field_array_strings(value, "annotations");
    annotations.extend(field_array_strings(value, "mutations"));
    let distinct = value.get("distinct").and_then(|v| v.as_bool()).unwrap_or(false)
        || value.get("DISTINCT").and_then(|v| v.as_bool()).unwrap_or(false);
    if distinct && !annotations.iter().any(|a| a == "DISTINCT") {
        annotations.push("DISTINCT".to_string());
    }
    Antigen {
        name: field_str(value, "name").unwrap_or_default(),
        reassortant: decode_reassortant(value),
        annotations: Annotations::from_iter(annotations),
        passage: decode_passage(value),
        date: field_str(value, "date").map(|d| normalize_date(&d)),
        lab_ids: field_array_strings(value, "lab_id"),
        sequence: Sequence::default(),
        semantic_attributes: Value::Null,
    }
}

fn decode_serum(value: &Value) -> Serum {
    Serum {
        name: field_str(value, "name").unwrap_or_default(),
        reassortant: decode_reassortant(value),
        annotations: Annotations::from_iter(field_array_strings(value, "annotations")),
        passage: decode_passage(value),
        serum_id: decode_serum_id(value),
        serum_species: field_str(value, "serum_species"),
        sequence: Sequence::default(),
        semantic_attributes: Value::Null,
    }
}

fn decode_titers(
    titers: &Value,
    number_of_antigens: usize,
    number_of_sera: usize,
) -> Result<TiterTable> {
    if let Some(list) = titers.get("list").and_then(|v| v.as_array()) {
        let rows = list
            .iter()
            .map(|row| {
                row.as_array()
                    .ok_or_else(|| Error::StructureInvalid("titer row is not a list".into()))?
                    .iter()
                    .map(|cell| {
                        Titer::parse(cell.as_str().ok_or_else(|| {
                            Error::StructureInvalid("titer cell is not a string".into())
                        })?)
                    })
                    .collect::<Result<Vec<Titer>>>()
            })
            .collect::<Result<Vec<Vec<Titer>>>>()?;
        return TiterTable::from_dense(rows);
    }
    if let Some(dict) = titers.get("dict").and_then(|v| v.as_array()) {
        let rows = dict
            .iter()
            .map(|row| {
                let obj = row
                    .as_object()
                    .ok_or_else(|| Error::StructureInvalid("titer row is not an object".into()))?;
                let mut map = IndexMap::new();
                for (k, v) in obj {
                    let idx: usize = k
                        .parse()
                        .map_err(|_| Error::StructureInvalid(format!("bad serum index {k:?}")))?;
                    let text = v
                        .as_str()
                        .ok_or_else(|| Error::StructureInvalid("titer is not a string".into()))?;
                    map.insert(idx, Titer::parse(text)?);
                }
                Ok(map)
            })
            .collect::<Result<Vec<_>>>()?;
        return TiterTable::from_sparse(rows, number_of_sera);
    }
    Err(Error::StructureInvalid(format!(
        "acd1 titers has neither list nor dict (antigens={number_of_antigens}, sera={number_of_sera})"
    )))
}

fn decode_info(value: &Value) -> Info {
    Info {
        name: field_str(value, "name"),
        virus: field_str(value, "virus"),
        virus_type: field_str(value, "virus_type"),
        assay: field_str(value, "assay"),
        date: field_str(value, "date").map(|d| normalize_date(&d)),
        lab: field_str(value, "lab"),
        rbc_species: field_str(value, "rbc_species"),
        subset: field_str(value, "subset"),
        table_type: field_str(value, "virus_type"),
        sources: Vec::new(),
    }
}

/// Import a chart from acd1 bytes (already identified via [`super::sniff`]).
pub fn import(bytes: &[u8]) -> Result<Chart> {
    let text = String::from_utf8_lossy(bytes);
    let marker_pos = text
        .find(MARKER)
        .ok_or(Error::UnsupportedFormat)?;
    let literal_start = marker_pos + "data = ".len();
    let literal = &text[literal_start..];
    let rewritten = rewrite(literal);
    let root: Value = serde_json::from_str(&rewritten)
        .map_err(|e| Error::malformed_at(&rewritten, e.column()))?;

    let table = root
        .get("table")
        .ok_or_else(|| Error::StructureInvalid("acd1 data has no \"table\" key".into()))?;
    let antigens_value = table.get("antigens").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let sera_value = table.get("sera").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let antigens: Vec<Antigen> = antigens_value.iter().map(decode_antigen).collect();
    let sera: Vec<Serum> = sera_value.iter().map(decode_serum).collect();

    let titers_value = table
        .get("titers")
        .ok_or_else(|| Error::StructureInvalid("acd1 data has no \"table.titers\" key".into()))?;
    let titers = decode_titers(titers_value, antigens.len(), sera.len())?;

    let info = root
        .get("chart_info")
        .map(decode_info)
        .unwrap_or_default();
    let mut chart = Chart::new(info, antigens, sera, titers)?;

    if let Some(cb) = table.get("column_bases").and_then(|v| v.as_array()) {
        let values: Vec<f64> = cb.iter().filter_map(|v| v.as_f64()).collect();
        if !values.is_empty() {
            chart.forced_column_bases = Some(values);
        }
    }

    if let Some(projections) = root.get("projections").and_then(|v| v.as_array()) {
        for p in projections {
            chart.push_projection(decode_projection(p, &chart)?);
        }
    }

    Ok(chart)
}

fn decode_projection(value: &Value, chart: &Chart) -> Result<Projection> {
    let layout_value = value
        .get("layout")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::StructureInvalid("acd1 projection has no layout".into()))?;
    let num_dims = layout_value
        .iter()
        .find_map(|p| p.as_array().filter(|a| !a.is_empty()))
        .map(|a| a.len())
        .unwrap_or(2);
    let mut layout = crate::layout::Layout::new(chart.number_of_points(), num_dims);
    for (p, point) in layout_value.iter().enumerate() {
        if let Some(coords) = point.as_array() {
            if !coords.is_empty() {
                let parsed: Vec<f64> = coords.iter().filter_map(|c| c.as_f64()).collect();
                if parsed.len() == num_dims {
                    layout.set_point(p, &parsed);
                }
            }
        }
    }
    let mut projection = Projection::from_layout(layout);
    if let Some(stress) = value.get("stress").and_then(|v| v.as_f64()) {
        projection.set_stress(stress);
    }
    if let Some(comment) = field_str(value, "comment") {
        projection.set_comment(comment);
    }
    if let Some(mcb) = value.get("minimum_column_basis").and_then(|v| v.as_str()) {
        projection.set_minimum_column_basis(MinimumColumnBasis::parse(mcb));
    }
    Ok(projection)
}
