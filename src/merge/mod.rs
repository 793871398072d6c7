//! Combining two charts into one — spec §4.J.

pub mod common;

use std::collections::{BTreeSet, HashSet};

use crate::antigen_serum::{Antigen, Serum};
use crate::chart::Chart;
use crate::err::{Message, MessageChannel, Result};
use crate::layout::Layout;
use crate::optimize::{self, OptimizationOptions};
use crate::procrustes;
use crate::projection::Projection;
use crate::table::{Layer, MergeReportEntry, TiterTable};

use common::{CommonAntigensSera, MatchLevel};

/// Which of the five legacy projection-merge policies to apply (spec
/// §4.J step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMergeType {
    /// No projections carried into the merged chart.
    Type1,
    /// Copy primary's best projection; secondary-only points are NaN.
    Type2,
    /// Procrustes-overlay; common points land at the midpoint.
    Type3,
    /// Type3, then relax with primary points fixed.
    Type4,
    /// Type3 without midpointing common points, then relax with primary
    /// points fixed.
    Type5,
}

/// Inputs controlling a [`merge`] call.
#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub match_level: MatchLevel,
    pub projection_merge: ProjectionMergeType,
    pub combine_cheating_assays: bool,
    pub remove_distinct: bool,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            match_level: MatchLevel::Automatic,
            projection_merge: ProjectionMergeType::Type2,
            combine_cheating_assays: false,
            remove_distinct: false,
        }
    }
}

/// Target-index assignment for one side (antigens or sera) of a merge
/// (spec §4.J step 2). `primary_target[i]` is `None` when `remove_distinct`
/// dropped that primary point.
#[derive(Debug, Clone)]
pub struct IndexMapping {
    pub primary_target: Vec<Option<usize>>,
    pub secondary_target: Vec<usize>,
    pub count: usize,
}

fn assign_targets<T>(
    primary: &[T],
    secondary: &[T],
    common: &common::CommonMapping,
    remove_distinct: bool,
    is_distinct: impl Fn(&T) -> bool,
) -> IndexMapping {
    let mut primary_target = vec![None; primary.len()];
    let mut next = 0usize;
    for (i, p) in primary.iter().enumerate() {
        if remove_distinct && is_distinct(p) {
            continue;
        }
        primary_target[i] = Some(next);
        next += 1;
    }

    let mut secondary_target = vec![0usize; secondary.len()];
    for s_idx in 0..secondary.len() {
        let reused = common
            .primary_by_secondary(s_idx)
            .and_then(|p_idx| primary_target[p_idx]);
        secondary_target[s_idx] = match reused {
            Some(t) => t,
            None => {
                let t = next;
                next += 1;
                t
            }
        };
    }

    IndexMapping {
        primary_target,
        secondary_target,
        count: next,
    }
}

fn to_option(values: &[usize]) -> Vec<Option<usize>> {
    values.iter().map(|&v| Some(v)).collect()
}

fn build_points<T: Clone + Default>(
    mapping: &IndexMapping,
    primary_items: &[T],
    secondary_items: &[T],
    mut merge_fields: impl FnMut(&mut T, &T, &mut MessageChannel, usize),
    messages: &mut MessageChannel,
) -> Vec<T> {
    let mut merged = vec![T::default(); mapping.count];
    let mut filled = vec![false; mapping.count];
    for (i, target) in mapping.primary_target.iter().enumerate() {
        if let Some(t) = target {
            merged[*t] = primary_items[i].clone();
            filled[*t] = true;
        }
    }
    for (i, &t) in mapping.secondary_target.iter().enumerate() {
        if filled[t] {
            let secondary_item = secondary_items[i].clone();
            merge_fields(&mut merged[t], &secondary_item, messages, t);
        } else {
            merged[t] = secondary_items[i].clone();
            filled[t] = true;
        }
    }
    merged
}

fn merge_antigen_fields(primary: &mut Antigen, secondary: &Antigen, messages: &mut MessageChannel, target: usize) {
    if primary.date.is_none() {
        primary.date = secondary.date.clone();
    } else if secondary.date.is_some() && primary.date != secondary.date {
        messages.warn(format!(
            "antigen {target}: date differs between primary ({:?}) and secondary ({:?}) on merge",
            primary.date, secondary.date
        ));
    }
    for id in &secondary.lab_ids {
        if !primary.lab_ids.contains(id) {
            primary.lab_ids.push(id.clone());
        }
    }
    if primary.sequence.aa.is_none() {
        primary.sequence.aa = secondary.sequence.aa.clone();
    }
    if primary.sequence.nuc.is_none() {
        primary.sequence.nuc = secondary.sequence.nuc.clone();
    }
    if primary.semantic_attributes.is_null() {
        primary.semantic_attributes = secondary.semantic_attributes.clone();
    }
}

fn merge_serum_fields(primary: &mut Serum, secondary: &Serum, _messages: &mut MessageChannel, _target: usize) {
    if primary.serum_species.is_none() {
        primary.serum_species = secondary.serum_species.clone();
    }
    if primary.sequence.aa.is_none() {
        primary.sequence.aa = secondary.sequence.aa.clone();
    }
    if primary.sequence.nuc.is_none() {
        primary.sequence.nuc = secondary.sequence.nuc.clone();
    }
    if primary.semantic_attributes.is_null() {
        primary.semantic_attributes = secondary.semantic_attributes.clone();
    }
}

fn source_layers(chart: &Chart) -> Vec<Layer> {
    if chart.titers().number_of_layers() > 0 {
        chart.titers().layers().to_vec()
    } else {
        vec![chart.titers().as_layer()]
    }
}

fn remap_layer(
    layer: &Layer,
    antigen_target: &[Option<usize>],
    serum_target: &[Option<usize>],
    merged_na: usize,
    restrict_to: Option<&HashSet<usize>>,
) -> Layer {
    let mut out = vec![indexmap::IndexMap::new(); merged_na];
    for (old_ag, row) in layer.iter().enumerate() {
        let Some(target_ag) = antigen_target.get(old_ag).copied().flatten() else {
            continue;
        };
        if let Some(restrict) = restrict_to {
            if !restrict.contains(&old_ag) {
                continue;
            }
        }
        for (&old_sr, &titer) in row {
            if let Some(target_sr) = serum_target.get(old_sr).copied().flatten() {
                out[target_ag].insert(target_sr, titer);
            }
        }
    }
    out
}

/// Detects a "cheating assay" secondary chart (spec §4.J step 2): every
/// secondary serum is common with primary, secondary introduces at least
/// one new antigen, and every secondary titer against a common antigen
/// matches the corresponding primary titer exactly.
fn detect_cheating_assay(primary: &Chart, secondary: &Chart, common: &CommonAntigensSera) -> bool {
    for s in 0..secondary.number_of_sera() {
        if common.sera.primary_by_secondary(s).is_none() {
            return false;
        }
    }
    let has_test_antigen =
        (0..secondary.number_of_antigens()).any(|a| common.antigens.primary_by_secondary(a).is_none());
    if !has_test_antigen {
        return false;
    }
    for a in 0..secondary.number_of_antigens() {
        let Some(primary_a) = common.antigens.primary_by_secondary(a) else {
            continue;
        };
        for s in 0..secondary.number_of_sera() {
            let Some(primary_s) = common.sera.primary_by_secondary(s) else {
                continue;
            };
            let secondary_titer = secondary.titers().titer(a, s);
            if secondary_titer.is_dont_care() {
                continue;
            }
            if primary.titers().titer(primary_a, primary_s) != secondary_titer {
                return false;
            }
        }
    }
    true
}

fn best_projection(chart: &Chart) -> Option<&Projection> {
    chart
        .projections()
        .iter()
        .min_by(|a, b| {
            let sa = a.stress().unwrap_or(f64::INFINITY);
            let sb = b.stress().unwrap_or(f64::INFINITY);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn primary_point_to_merged(p: usize, primary_na: usize, antigen_mapping: &IndexMapping, serum_mapping: &IndexMapping, merged_na: usize) -> Option<usize> {
    if p < primary_na {
        antigen_mapping.primary_target[p]
    } else {
        serum_mapping.primary_target[p - primary_na].map(|t| t + merged_na)
    }
}

fn secondary_point_to_merged(p: usize, secondary_na: usize, antigen_mapping: &IndexMapping, serum_mapping: &IndexMapping, merged_na: usize) -> usize {
    if p < secondary_na {
        antigen_mapping.secondary_target[p]
    } else {
        serum_mapping.secondary_target[p - secondary_na] + merged_na
    }
}

fn build_projection_type2(
    primary: &Chart,
    primary_best: &Projection,
    antigen_mapping: &IndexMapping,
    serum_mapping: &IndexMapping,
    merged_na: usize,
    merged_points: usize,
) -> Projection {
    let primary_na = primary.number_of_antigens();
    let mut layout = Layout::new(merged_points, primary_best.num_dims());
    let mut disconnected = BTreeSet::new();
    for p in 0..primary.number_of_points() {
        if let Some(target) = primary_point_to_merged(p, primary_na, antigen_mapping, serum_mapping, merged_na) {
            if primary_best.layout().point_has_coordinates(p) {
                layout.set_point(target, primary_best.layout().point(p).unwrap());
            }
            if primary_best.disconnected().contains(&p) {
                disconnected.insert(target);
            }
        }
    }
    let mut projection = Projection::from_layout(layout);
    *projection.disconnected_mut() = disconnected;
    projection.set_minimum_column_basis(primary_best.minimum_column_basis());
    projection
}

#[allow(clippy::too_many_arguments)]
fn build_projection_type3(
    primary: &Chart,
    secondary: &Chart,
    primary_best: &Projection,
    secondary_best: &Projection,
    common: &CommonAntigensSera,
    antigen_mapping: &IndexMapping,
    serum_mapping: &IndexMapping,
    merged_na: usize,
    merged_points: usize,
    midpoint_common: bool,
) -> Result<Projection> {
    let primary_na = primary.number_of_antigens();
    let secondary_na = secondary.number_of_antigens();
    let num_dims = primary_best.num_dims();

    let mut common_pairs: Vec<(usize, usize)> = common.antigens.pairs();
    for (p, s) in common.sera.pairs() {
        common_pairs.push((primary_na + p, secondary_na + s));
    }

    let procrustes_result = procrustes::align(primary_best.layout(), secondary_best.layout(), &common_pairs, false)?;
    let aligned_secondary = secondary_best.layout().transform(&procrustes_result.transformation)?;

    let mut layout = Layout::new(merged_points, num_dims);
    let mut disconnected = BTreeSet::new();
    let mut filled_by_primary = vec![false; merged_points];

    for p in 0..primary.number_of_points() {
        if let Some(target) = primary_point_to_merged(p, primary_na, antigen_mapping, serum_mapping, merged_na) {
            if primary_best.layout().point_has_coordinates(p) {
                layout.set_point(target, primary_best.layout().point(p).unwrap());
                filled_by_primary[target] = true;
            }
            if primary_best.disconnected().contains(&p) {
                disconnected.insert(target);
            }
        }
    }

    for p in 0..secondary.number_of_points() {
        let target = secondary_point_to_merged(p, secondary_na, antigen_mapping, serum_mapping, merged_na);
        if secondary_best.disconnected().contains(&p) {
            disconnected.insert(target);
        }
        if !aligned_secondary.point_has_coordinates(p) {
            continue;
        }
        if filled_by_primary[target] {
            if midpoint_common {
                let primary_coords = layout.point(target).unwrap().to_vec();
                let secondary_coords = aligned_secondary.point(p).unwrap();
                let mid: Vec<f64> = primary_coords
                    .iter()
                    .zip(secondary_coords)
                    .map(|(a, b)| (a + b) / 2.0)
                    .collect();
                layout.set_point(target, &mid);
            }
            // else: keep primary's position as-is (type5).
        } else {
            layout.set_point(target, aligned_secondary.point(p).unwrap());
        }
    }

    let mut projection = Projection::from_layout(layout);
    *projection.disconnected_mut() = disconnected;
    projection.set_minimum_column_basis(primary_best.minimum_column_basis());
    Ok(projection)
}

fn mark_primary_unmovable(projection: &mut Projection, primary: &Chart, antigen_mapping: &IndexMapping, serum_mapping: &IndexMapping, merged_na: usize) {
    let primary_na = primary.number_of_antigens();
    for p in 0..primary.number_of_points() {
        if let Some(target) = primary_point_to_merged(p, primary_na, antigen_mapping, serum_mapping, merged_na) {
            projection.unmovable_mut().insert(target);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_projection_merge(
    merged: &mut Chart,
    primary: &Chart,
    secondary: &Chart,
    common: &CommonAntigensSera,
    antigen_mapping: &IndexMapping,
    serum_mapping: &IndexMapping,
    kind: ProjectionMergeType,
    messages: &mut MessageChannel,
) -> Result<()> {
    if kind == ProjectionMergeType::Type1 {
        return Ok(());
    }
    let Some(primary_best) = best_projection(primary) else {
        messages.warn("primary chart has no projection; merged chart has no projections");
        return Ok(());
    };
    let merged_na = antigen_mapping.count;
    let merged_points = merged.number_of_points();

    if kind == ProjectionMergeType::Type2 {
        merged.push_projection(build_projection_type2(
            primary,
            primary_best,
            antigen_mapping,
            serum_mapping,
            merged_na,
            merged_points,
        ));
        return Ok(());
    }

    let Some(secondary_best) = best_projection(secondary) else {
        messages.warn("secondary chart has no projection; merged chart has no projections");
        return Ok(());
    };

    let midpoint_common = kind != ProjectionMergeType::Type5;
    let mut projection = build_projection_type3(
        primary,
        secondary,
        primary_best,
        secondary_best,
        common,
        antigen_mapping,
        serum_mapping,
        merged_na,
        merged_points,
        midpoint_common,
    )?;

    if matches!(kind, ProjectionMergeType::Type4 | ProjectionMergeType::Type5) {
        mark_primary_unmovable(&mut projection, primary, antigen_mapping, serum_mapping, merged_na);
        let options = OptimizationOptions {
            incremental: true,
            ..OptimizationOptions::default()
        };
        optimize::relax(merged, &mut projection, &options, None)?;
    }

    merged.push_projection(projection);
    Ok(())
}

/// Outcome of [`merge`]: diagnostics and the index mappings used to build
/// the new chart (spec §4.J).
#[derive(Debug, Clone)]
pub struct MergeData {
    pub messages: Vec<Message>,
    pub layer_merge_report: Vec<MergeReportEntry>,
    pub antigen_mapping: IndexMapping,
    pub serum_mapping: IndexMapping,
}

/// Combine `primary` and `secondary` into a new chart (spec §4.J). Never
/// mutates either input.
pub fn merge(primary: &Chart, secondary: &Chart, settings: &MergeSettings) -> Result<(Chart, MergeData)> {
    let mut messages = MessageChannel::new();

    let common = CommonAntigensSera::build(
        primary.antigens(),
        secondary.antigens(),
        primary.sera(),
        secondary.sera(),
        settings.match_level,
    );

    let antigen_mapping = assign_targets(
        primary.antigens(),
        secondary.antigens(),
        &common.antigens,
        settings.remove_distinct,
        |a: &Antigen| a.is_distinct(),
    );
    let serum_mapping = assign_targets(
        primary.sera(),
        secondary.sera(),
        &common.sera,
        settings.remove_distinct,
        |s: &Serum| s.is_distinct(),
    );

    let cheating = settings.combine_cheating_assays && detect_cheating_assay(primary, secondary, &common);
    if settings.combine_cheating_assays && !cheating {
        messages.warn(
            "combine_cheating_assays requested but secondary chart does not qualify; falling back to a normal merge",
        );
    }

    let merged_antigens = build_points(
        &antigen_mapping,
        primary.antigens(),
        secondary.antigens(),
        merge_antigen_fields,
        &mut messages,
    );
    let merged_sera = build_points(
        &serum_mapping,
        primary.sera(),
        secondary.sera(),
        merge_serum_fields,
        &mut messages,
    );

    let merged_na = antigen_mapping.count;
    let merged_ns = serum_mapping.count;
    let mut merged_titers = TiterTable::new_sparse(merged_na, merged_ns);

    let secondary_restrict: Option<HashSet<usize>> = if cheating {
        Some(
            (0..secondary.number_of_antigens())
                .filter(|&a| common.antigens.primary_by_secondary(a).is_none())
                .collect(),
        )
    } else {
        None
    };

    for layer in source_layers(primary) {
        let remapped = remap_layer(&layer, &antigen_mapping.primary_target, &serum_mapping.primary_target, merged_na, None);
        merged_titers.push_layer(remapped);
    }
    let secondary_antigen_target = to_option(&antigen_mapping.secondary_target);
    let secondary_serum_target = to_option(&serum_mapping.secondary_target);
    for layer in source_layers(secondary) {
        let remapped = remap_layer(
            &layer,
            &secondary_antigen_target,
            &secondary_serum_target,
            merged_na,
            secondary_restrict.as_ref(),
        );
        merged_titers.push_layer(remapped);
    }

    let layer_merge_report = merged_titers.set_from_layers();

    let info = primary.info.merge(&secondary.info);
    let mut merged_chart = Chart::new(info, merged_antigens, merged_sera, merged_titers)?;

    apply_projection_merge(
        &mut merged_chart,
        primary,
        secondary,
        &common,
        &antigen_mapping,
        &serum_mapping,
        settings.projection_merge,
        &mut messages,
    )?;

    if let Some(primary_plot_spec) = &primary.plot_spec {
        let mut plot_spec = primary_plot_spec.clone();
        let new_points = merged_chart.number_of_points().saturating_sub(primary.number_of_points());
        plot_spec.extend_for_new_points(new_points);
        merged_chart.plot_spec = Some(plot_spec);
    }

    Ok((
        merged_chart,
        MergeData {
            messages: messages.into_messages(),
            layer_merge_report,
            antigen_mapping,
            serum_mapping,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::Info;
    use crate::titer::Titer;
    use pretty_assertions::assert_eq;

    fn antigen(name: &str) -> Antigen {
        Antigen {
            name: name.to_string(),
            ..Default::default()
        }
    }
    fn serum(name: &str) -> Serum {
        Serum {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn merge_with_self_is_idempotent_for_type1() {
        let chart = Chart::new(
            Info::default(),
            vec![antigen("AG1")],
            vec![serum("SR1")],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap();
        let settings = MergeSettings {
            projection_merge: ProjectionMergeType::Type1,
            ..MergeSettings::default()
        };
        let (merged, data) = merge(&chart, &chart, &settings).unwrap();
        assert_eq!(merged.number_of_antigens(), 1);
        assert_eq!(merged.number_of_sera(), 1);
        assert_eq!(merged.titers().number_of_layers(), 2);
        assert_eq!(merged.titers().titer(0, 0), Titer::Regular(40));
        assert!(merged.projections().is_empty());
        assert_eq!(data.antigen_mapping.count, 1);
    }

    #[test]
    fn merge_type2_preserves_primary_coordinates() {
        let chart1 = Chart::new(
            Info::default(),
            vec![antigen("AG1")],
            vec![serum("SR1")],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap();
        let mut chart1 = chart1;
        let mut projection = Projection::new(2, 2);
        projection.layout_mut().set_point(0, &[1.0, 2.0]);
        projection.layout_mut().set_point(1, &[3.0, 4.0]);
        projection.set_stress(0.0);
        chart1.push_projection(projection);

        let chart2 = Chart::new(
            Info::default(),
            vec![antigen("AG2")],
            vec![serum("SR1")],
            TiterTable::from_dense(vec![vec![Titer::Regular(80)]]).unwrap(),
        )
        .unwrap();

        let settings = MergeSettings {
            projection_merge: ProjectionMergeType::Type2,
            ..MergeSettings::default()
        };
        let (merged, _data) = merge(&chart1, &chart2, &settings).unwrap();
        assert_eq!(merged.number_of_antigens(), 2);
        let best = merged.projections()[0].layout();
        assert_eq!(best.point(0).unwrap(), &[1.0, 2.0]);
        assert_eq!(best.point(2).unwrap(), &[3.0, 4.0]); // serum SR1 at index merged_na(2)+0
        assert!(!best.point_has_coordinates(1)); // AG2 is secondary-only, NaN
    }

    #[test]
    fn distinct_antigens_dropped_when_remove_distinct() {
        use crate::antigen_serum::Annotations;
        let mut distinct_antigen = antigen("AG1");
        distinct_antigen.annotations = Annotations::from_iter(["DISTINCT".to_string()]);
        let chart1 = Chart::new(
            Info::default(),
            vec![distinct_antigen, antigen("AG2")],
            vec![serum("SR1")],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)], vec![Titer::Regular(80)]]).unwrap(),
        )
        .unwrap();
        let chart2 = Chart::new(
            Info::default(),
            vec![antigen("AG3")],
            vec![serum("SR1")],
            TiterTable::from_dense(vec![vec![Titer::Regular(160)]]).unwrap(),
        )
        .unwrap();
        let settings = MergeSettings {
            projection_merge: ProjectionMergeType::Type1,
            remove_distinct: true,
            ..MergeSettings::default()
        };
        let (merged, _data) = merge(&chart1, &chart2, &settings).unwrap();
        // AG1 dropped, AG2 and AG3 remain.
        assert_eq!(merged.number_of_antigens(), 2);
        assert_eq!(merged.antigens()[0].name, "AG2");
        assert_eq!(merged.antigens()[1].name, "AG3");
    }
}
