//! Canonical JSON ("acmacs-ace-v1") import/export — spec §4.O, §6.
//!
//! Wire structs mirror the bit-exact one-letter key schema; conversion to
//! and from the in-memory [`Chart`] happens in `from_wire`/`to_wire`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::antigen_serum::{Annotations, Antigen, Sequence, Serum};
use crate::chart::{Chart, Info, PlotSpec, PointStyle};
use crate::column_bases::MinimumColumnBasis;
use crate::err::{Error, Result};
use crate::layout::{Layout, Transformation};
use crate::projection::Projection;
use crate::table::TiterTable;
use crate::titer::Titer;

const VERSION: &str = "acmacs-ace-v1";

#[derive(Debug, Serialize, Deserialize)]
struct WireTop {
    #[serde(rename = "  version")]
    version: String,
    c: WireChart,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireChart {
    #[serde(default)]
    i: Option<WireInfo>,
    #[serde(default)]
    a: Vec<WireAntigen>,
    #[serde(default)]
    s: Vec<WireSerum>,
    t: WireTiters,
    #[serde(rename = "C", default)]
    forced_column_bases: Option<Vec<f64>>,
    #[serde(rename = "P", default, skip_serializing_if = "Vec::is_empty")]
    projections: Vec<WireProjection>,
    #[serde(default)]
    p: Option<WirePlotSpec>,
    #[serde(rename = "R", default)]
    styles: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    x: serde_json::Value,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireInfo {
    #[serde(rename = "N", default)]
    name: Option<String>,
    #[serde(rename = "v", default)]
    virus: Option<String>,
    #[serde(rename = "V", default)]
    virus_type: Option<String>,
    #[serde(rename = "A", default)]
    assay: Option<String>,
    #[serde(rename = "D", default)]
    date: Option<String>,
    #[serde(rename = "l", default)]
    lab: Option<String>,
    #[serde(rename = "r", default)]
    rbc_species: Option<String>,
    #[serde(rename = "s", default)]
    subset: Option<String>,
    #[serde(rename = "T", default)]
    table_type: Option<String>,
    #[serde(rename = "S", default, skip_serializing_if = "Vec::is_empty")]
    sources: Vec<WireInfo>,
}

impl From<&Info> for WireInfo {
    fn from(info: &Info) -> Self {
        WireInfo {
            name: info.name.clone(),
            virus: info.virus.clone(),
            virus_type: info.virus_type.clone(),
            assay: info.assay.clone(),
            date: info.date.clone(),
            lab: info.lab.clone(),
            rbc_species: info.rbc_species.clone(),
            subset: info.subset.clone(),
            table_type: info.table_type.clone(),
            sources: info.sources.iter().map(WireInfo::from).collect(),
        }
    }
}

impl From<WireInfo> for Info {
    fn from(w: WireInfo) -> Self {
        Info {
            name: w.name,
            virus: w.virus,
            virus_type: w.virus_type,
            assay: w.assay,
            date: w.date,
            lab: w.lab,
            rbc_species: w.rbc_species,
            subset: w.subset,
            table_type: w.table_type,
            sources: w.sources.into_iter().map(Info::from).collect(),
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireAntigen {
    #[serde(rename = "N")]
    name: String,
    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<String>,
    #[serde(rename = "R", default, skip_serializing_if = "String::is_empty")]
    reassortant: String,
    #[serde(rename = "D", default)]
    date: Option<String>,
    #[serde(rename = "P", default, skip_serializing_if = "String::is_empty")]
    passage: String,
    #[serde(rename = "l", default, skip_serializing_if = "Vec::is_empty")]
    lab_ids: Vec<String>,
    #[serde(rename = "A", default)]
    aa: Option<String>,
    #[serde(rename = "B", default)]
    nuc: Option<String>,
    #[serde(rename = "Ai", default, skip_serializing_if = "Vec::is_empty")]
    aa_insertions: Vec<String>,
    #[serde(rename = "Bi", default, skip_serializing_if = "Vec::is_empty")]
    nuc_insertions: Vec<String>,
    #[serde(rename = "T", default, skip_serializing_if = "serde_json::Value::is_null")]
    semantic_attributes: serde_json::Value,
}

impl From<&Antigen> for WireAntigen {
    fn from(a: &Antigen) -> Self {
        WireAntigen {
            name: a.name.clone(),
            annotations: a.annotations.as_slice().to_vec(),
            reassortant: a.reassortant.clone(),
            date: a.date.clone(),
            passage: a.passage.0.clone(),
            lab_ids: a.lab_ids.clone(),
            aa: a.sequence.aa.clone(),
            nuc: a.sequence.nuc.clone(),
            aa_insertions: a.sequence.aa_insertions.clone(),
            nuc_insertions: a.sequence.nuc_insertions.clone(),
            semantic_attributes: a.semantic_attributes.clone(),
        }
    }
}

impl From<WireAntigen> for Antigen {
    fn from(w: WireAntigen) -> Self {
        Antigen {
            name: w.name,
            reassortant: w.reassortant,
            annotations: Annotations::from_iter(w.annotations),
            passage: crate::antigen_serum::Passage(w.passage),
            date: w.date,
            lab_ids: w.lab_ids,
            sequence: Sequence {
                aa: w.aa,
                nuc: w.nuc,
                aa_insertions: w.aa_insertions,
                nuc_insertions: w.nuc_insertions,
            },
            semantic_attributes: w.semantic_attributes,
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireSerum {
    #[serde(rename = "N")]
    name: String,
    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<String>,
    #[serde(rename = "R", default, skip_serializing_if = "String::is_empty")]
    reassortant: String,
    #[serde(rename = "P", default, skip_serializing_if = "String::is_empty")]
    passage: String,
    #[serde(rename = "I", default, skip_serializing_if = "String::is_empty")]
    serum_id: String,
    #[serde(rename = "s", default)]
    serum_species: Option<String>,
    #[serde(rename = "A", default)]
    aa: Option<String>,
    #[serde(rename = "B", default)]
    nuc: Option<String>,
    #[serde(rename = "T", default, skip_serializing_if = "serde_json::Value::is_null")]
    semantic_attributes: serde_json::Value,
}

impl From<&Serum> for WireSerum {
    fn from(s: &Serum) -> Self {
        WireSerum {
            name: s.name.clone(),
            annotations: s.annotations.as_slice().to_vec(),
            reassortant: s.reassortant.clone(),
            passage: s.passage.0.clone(),
            serum_id: s.serum_id.clone(),
            serum_species: s.serum_species.clone(),
            aa: s.sequence.aa.clone(),
            nuc: s.sequence.nuc.clone(),
            semantic_attributes: s.semantic_attributes.clone(),
        }
    }
}

impl From<WireSerum> for Serum {
    fn from(w: WireSerum) -> Self {
        Serum {
            name: w.name,
            reassortant: w.reassortant,
            annotations: Annotations::from_iter(w.annotations),
            passage: crate::antigen_serum::Passage(w.passage),
            serum_id: w.serum_id,
            serum_species: w.serum_species,
            sequence: Sequence {
                aa: w.aa,
                nuc: w.nuc,
                ..Sequence::default()
            },
            semantic_attributes: w.semantic_attributes,
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireTiters {
    #[serde(default)]
    l: Option<Vec<Vec<String>>>,
    #[serde(default)]
    d: Option<Vec<IndexMap<String, String>>>,
    #[serde(rename = "L", default)]
    layers: Option<Vec<serde_json::Value>>,
}

fn titers_to_wire(table: &TiterTable) -> WireTiters {
    let num_antigens = table.number_of_antigens();
    let num_sera = table.number_of_sera();
    let mut wire = if table.is_dense() {
        let mut rows = Vec::with_capacity(num_antigens);
        for ag in 0..num_antigens {
            let mut row = Vec::with_capacity(num_sera);
            for sr in 0..num_sera {
                row.push(table.titer(ag, sr).format());
            }
            rows.push(row);
        }
        WireTiters {
            l: Some(rows),
            d: None,
            layers: None,
        }
    } else {
        let mut rows = Vec::with_capacity(num_antigens);
        for ag in 0..num_antigens {
            let mut row = IndexMap::new();
            for sr in 0..num_sera {
                let titer = table.titer(ag, sr);
                if !titer.is_dont_care() {
                    row.insert(sr.to_string(), titer.format());
                }
            }
            rows.push(row);
        }
        WireTiters {
            l: None,
            d: Some(rows),
            layers: None,
        }
    };
    if table.number_of_layers() > 0 {
        let mut layers = Vec::with_capacity(table.number_of_layers());
        for k in 0..table.number_of_layers() {
            let layer = table.layer(k).expect("layer index in range");
            let rows: Vec<IndexMap<String, String>> = layer
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|(&sr, titer)| (sr.to_string(), titer.format()))
                        .collect()
                })
                .collect();
            layers.push(serde_json::to_value(rows).expect("layer row serializes"));
        }
        wire.layers = Some(layers);
    }
    wire
}

fn titers_from_wire(wire: WireTiters, num_antigens: usize, num_sera: usize) -> Result<TiterTable> {
    let mut table = if let Some(rows) = wire.l {
        let parsed: Vec<Vec<Titer>> = rows
            .into_iter()
            .map(|row| row.iter().map(|s| Titer::parse(s)).collect::<Result<_>>())
            .collect::<Result<_>>()?;
        TiterTable::from_dense(parsed)?
    } else if let Some(rows) = wire.d {
        let mut parsed: Vec<IndexMap<usize, Titer>> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut map = IndexMap::new();
            for (k, v) in row {
                let idx: usize = k
                    .parse()
                    .map_err(|_| Error::StructureInvalid(format!("bad serum index {k:?}")))?;
                map.insert(idx, Titer::parse(&v)?);
            }
            parsed.push(map);
        }
        TiterTable::from_sparse(parsed, num_sera)?
    } else {
        return Err(Error::StructureInvalid("titers missing both l and d".into()));
    };

    if table.number_of_antigens() != num_antigens {
        return Err(Error::StructureInvalid(format!(
            "titers has {} antigen rows but {} antigens given",
            table.number_of_antigens(),
            num_antigens
        )));
    }

    if let Some(layers) = wire.layers {
        for layer_value in layers {
            let layer = parse_layer_value(layer_value, num_sera)?;
            table.push_layer(layer);
        }
    }
    Ok(table)
}

fn parse_layer_value(
    value: serde_json::Value,
    _num_sera: usize,
) -> Result<crate::table::Layer> {
    match value {
        serde_json::Value::Array(rows) => rows
            .into_iter()
            .map(|row| match row {
                serde_json::Value::Array(cells) => {
                    let mut map = IndexMap::new();
                    for (sr, cell) in cells.into_iter().enumerate() {
                        if let serde_json::Value::String(s) = &cell {
                            if s != "*" {
                                map.insert(sr, Titer::parse(s)?);
                            }
                        }
                    }
                    Ok(map)
                }
                serde_json::Value::Object(fields) => {
                    let mut map = IndexMap::new();
                    for (k, v) in fields {
                        let idx: usize = k.parse().map_err(|_| {
                            Error::StructureInvalid(format!("bad serum index {k:?}"))
                        })?;
                        if let serde_json::Value::String(s) = v {
                            map.insert(idx, Titer::parse(&s)?);
                        }
                    }
                    Ok(map)
                }
                other => Err(Error::StructureInvalid(format!(
                    "unexpected layer row shape: {other:?}"
                ))),
            })
            .collect(),
        other => Err(Error::StructureInvalid(format!(
            "unexpected layer shape: {other:?}"
        ))),
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireProjection {
    #[serde(rename = "c", default, skip_serializing_if = "String::is_empty")]
    comment: String,
    #[serde(rename = "s", default)]
    stress: Option<f64>,
    #[serde(rename = "m", default, skip_serializing_if = "String::is_empty")]
    minimum_column_basis: String,
    #[serde(rename = "C", default)]
    forced_column_bases: Option<Vec<f64>>,
    #[serde(rename = "t", default)]
    transformation: Option<Vec<f64>>,
    #[serde(rename = "U", default, skip_serializing_if = "Vec::is_empty")]
    unmovable: Vec<usize>,
    #[serde(rename = "D", default, skip_serializing_if = "Vec::is_empty")]
    disconnected: Vec<usize>,
    #[serde(rename = "u", default, skip_serializing_if = "Vec::is_empty")]
    unmovable_in_last_dimension: Vec<usize>,
    #[serde(rename = "l")]
    layout: Vec<Vec<f64>>,
    #[serde(rename = "f", default)]
    avidity_adjusts: Option<Vec<f64>>,
}

fn projection_to_wire(projection: &Projection) -> WireProjection {
    let num_dims = projection.num_dims();
    let layout = (0..projection.num_points())
        .map(|p| match projection.layout().point(p) {
            Some(coords) if projection.layout().point_has_coordinates(p) => coords.to_vec(),
            _ => Vec::new(),
        })
        .collect();
    let identity = Transformation::identity(num_dims);
    let transformation = if projection.transformation() == &identity {
        None
    } else {
        Some(projection.transformation().matrix().to_vec())
    };
    WireProjection {
        comment: projection.comment().to_string(),
        stress: projection.stress(),
        minimum_column_basis: projection.minimum_column_basis().format(),
        forced_column_bases: projection.forced_column_bases().map(|v| v.to_vec()),
        transformation,
        unmovable: projection.unmovable().iter().copied().collect(),
        disconnected: projection.disconnected().iter().copied().collect(),
        unmovable_in_last_dimension: projection
            .unmovable_in_last_dimension()
            .iter()
            .copied()
            .collect(),
        layout,
        avidity_adjusts: projection.avidity_adjusts().map(|v| v.to_vec()),
    }
}

fn projection_from_wire(wire: WireProjection) -> Result<Projection> {
    let num_points = wire.layout.len();
    let num_dims = wire
        .layout
        .iter()
        .find(|p| !p.is_empty())
        .map(|p| p.len())
        .unwrap_or(0);
    let mut layout = Layout::new(num_points, num_dims);
    for (p, coords) in wire.layout.iter().enumerate() {
        if !coords.is_empty() {
            layout.set_point(p, coords);
        }
    }
    let mut projection = Projection::from_layout(layout);
    projection.set_comment(wire.comment);
    if let Some(stress) = wire.stress {
        projection.set_stress(stress);
    }
    projection.set_minimum_column_basis(MinimumColumnBasis::parse(&wire.minimum_column_basis));
    projection.set_forced_column_bases(wire.forced_column_bases);
    if let Some(matrix) = wire.transformation {
        projection.set_transformation(Transformation::new(matrix, vec![0.0; num_dims])?);
    }
    for p in wire.unmovable {
        projection.unmovable_mut().insert(p);
    }
    for p in wire.disconnected {
        projection.disconnected_mut().insert(p);
    }
    projection.set_avidity_adjusts(wire.avidity_adjusts);
    Ok(projection)
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WirePointStyle {
    #[serde(default)]
    fill: Option<String>,
    #[serde(default)]
    outline: Option<String>,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    shape: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Default, Serialize, Deserialize)]
struct WirePlotSpec {
    #[serde(rename = "d", default, skip_serializing_if = "Vec::is_empty")]
    drawing_order: Vec<usize>,
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    point_style_index: Vec<usize>,
    #[serde(rename = "P", default, skip_serializing_if = "Vec::is_empty")]
    styles: Vec<WirePointStyle>,
    #[serde(rename = "E", default)]
    error_line_positive_color: Option<String>,
    #[serde(rename = "e", default)]
    error_line_negative_color: Option<String>,
}

impl From<&PlotSpec> for WirePlotSpec {
    fn from(p: &PlotSpec) -> Self {
        WirePlotSpec {
            drawing_order: p.drawing_order.clone(),
            point_style_index: p.point_style_index.clone(),
            styles: p
                .styles
                .iter()
                .map(|s| WirePointStyle {
                    fill: s.fill.clone(),
                    outline: s.outline.clone(),
                    size: s.size,
                    shape: s.shape.clone(),
                })
                .collect(),
            error_line_positive_color: p.error_line_positive_color.clone(),
            error_line_negative_color: p.error_line_negative_color.clone(),
        }
    }
}

impl From<WirePlotSpec> for PlotSpec {
    fn from(w: WirePlotSpec) -> Self {
        PlotSpec {
            drawing_order: w.drawing_order,
            point_style_index: w.point_style_index,
            styles: w
                .styles
                .into_iter()
                .map(|s| PointStyle {
                    fill: s.fill,
                    outline: s.outline,
                    size: s.size,
                    shape: s.shape,
                })
                .collect(),
            error_line_positive_color: w.error_line_positive_color,
            error_line_negative_color: w.error_line_negative_color,
        }
    }
}

/// Import a chart from canonical-JSON bytes (spec §4.O, §6).
pub fn import(bytes: &[u8]) -> Result<Chart> {
    let top: WireTop = serde_json::from_slice(bytes)
        .map_err(|e| Error::malformed_at(&String::from_utf8_lossy(bytes), e.column()))?;
    if top.version != VERSION {
        return Err(Error::UnsupportedVersion(top.version));
    }
    let c = top.c;
    let antigens: Vec<Antigen> = c.a.into_iter().map(Antigen::from).collect();
    let sera: Vec<Serum> = c.s.into_iter().map(Serum::from).collect();
    let titers = titers_from_wire(c.t, antigens.len(), sera.len())?;

    let info = c.i.map(Info::from).unwrap_or_default();
    let mut chart = Chart::new(info, antigens, sera, titers)?;
    chart.forced_column_bases = c.forced_column_bases;
    chart.plot_spec = c.p.map(PlotSpec::from);
    chart.styles = c.styles;
    chart.extensions = c.x;
    for wire_projection in c.projections {
        chart.push_projection(projection_from_wire(wire_projection)?);
    }
    Ok(chart)
}

/// Export a chart to canonical-JSON bytes. The exporter never emits the
/// deprecated legacy keys (`L`/`C`/`c`/`S`/`h`) accepted on import.
pub fn export(chart: &Chart) -> Result<Vec<u8>> {
    let wire = WireChart {
        i: Some(WireInfo::from(&chart.info)),
        a: chart.antigens().iter().map(WireAntigen::from).collect(),
        s: chart.sera().iter().map(WireSerum::from).collect(),
        t: titers_to_wire(chart.titers()),
        forced_column_bases: chart.forced_column_bases.clone(),
        projections: chart.projections().iter().map(projection_to_wire).collect(),
        p: chart.plot_spec.as_ref().map(WirePlotSpec::from),
        styles: chart.styles.clone(),
        x: chart.extensions.clone(),
    };
    let top = WireTop {
        version: VERSION.to_string(),
        c: wire,
    };
    serde_json::to_vec(&top).map_err(|e| Error::StructureInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TiterTable;

    fn sample_chart() -> Chart {
        let mut chart = Chart::new(
            Info {
                name: Some("TEST".into()),
                ..Info::default()
            },
            vec![Antigen {
                name: "A/TEST/1/2020".into(),
                ..Antigen::default()
            }],
            vec![Serum {
                name: "A/TEST/2/2020".into(),
                serum_id: "S1".into(),
                ..Serum::default()
            }],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap();
        chart.forced_column_bases = Some(vec![4.0]);
        chart
    }

    #[test]
    fn round_trips_antigens_sera_titers() {
        let chart = sample_chart();
        let bytes = export(&chart).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("acmacs-ace-v1"));

        let reimported = import(&bytes).unwrap();
        assert_eq!(reimported.antigens()[0].name, "A/TEST/1/2020");
        assert_eq!(reimported.sera()[0].serum_id, "S1");
        assert_eq!(reimported.titers().titer(0, 0), Titer::Regular(40));
        assert_eq!(reimported.forced_column_bases, Some(vec![4.0]));
    }

    #[test]
    fn rejects_wrong_version() {
        let bytes = br#"{"  version": "acmacs-ace-v2", "c": {"a": [], "s": [], "t": {"l": []}}}"#;
        assert!(matches!(import(bytes), Err(Error::UnsupportedVersion(_))));
    }

    #[test]
    fn sparse_titers_round_trip_with_dont_cares_omitted() {
        let mut chart = Chart::new(
            Info::default(),
            vec![Antigen::default(), Antigen::default()],
            vec![Serum::default()],
            TiterTable::new_sparse(2, 1),
        )
        .unwrap();
        chart.titers_mut().set_titer(0, 0, Titer::Regular(80));
        let bytes = export(&chart).unwrap();
        let reimported = import(&bytes).unwrap();
        assert_eq!(reimported.titers().titer(0, 0), Titer::Regular(80));
        assert_eq!(reimported.titers().titer(1, 0), Titer::DontCare);
    }
}
