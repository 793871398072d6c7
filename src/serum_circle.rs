//! Serum circle / coverage — spec §4.N.
//!
//! A serum circle approximates the region of antigen-space a serum
//! protects: a theoretical radius derived purely from titers and column
//! bases, and an empirical radius fit to the actual map distances.

use std::collections::BTreeSet;

use crate::antigen_serum::{Antigen, PassageType, Serum};
use crate::chart::Chart;
use crate::column_bases::ColumnBases;
use crate::projection::Projection;
use crate::titer::Titer;

/// Radius floor applied to both theoretical and empirical radii.
pub const MIN_RADIUS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerumCircleStatus {
    Good,
    NonRegularHomologousTiter,
    TiterTooLow,
    SerumDisconnected,
    AntigenDisconnected,
    NoHomologousAntigen,
}

/// The theoretical radius for one serum (spec §4.N).
#[derive(Debug, Clone)]
pub struct TheoreticalRadius {
    pub serum_no: usize,
    pub homologous_antigen: Option<usize>,
    pub radius: Option<f64>,
    pub status: SerumCircleStatus,
}

/// The empirical radius for one serum, plus the per-antigen distances it
/// was fit against.
#[derive(Debug, Clone)]
pub struct EmpiricalRadius {
    pub serum_no: usize,
    pub homologous_antigen: Option<usize>,
    pub radius: Option<f64>,
    pub status: SerumCircleStatus,
}

/// Antigen partition relative to a serum's protection boundary (spec
/// §4.N "Coverage").
#[derive(Debug, Clone)]
pub struct Coverage {
    pub within: BTreeSet<usize>,
    pub outside: BTreeSet<usize>,
    pub homologous_antigen: Option<usize>,
}

fn match_passage(antigen: &Antigen, serum: &Serum) -> bool {
    let antigen_is_egg = antigen.passage.passage_type() == PassageType::Egg;
    if serum.passage.0.is_empty() {
        antigen_is_egg == serum.serum_id.contains("EGG")
    } else {
        antigen_is_egg == (serum.passage.passage_type() == PassageType::Egg)
    }
}

/// Antigens homologous to `serum_no`: same name and reassortant, matching
/// egg/cell passage type, preferring an exact annotation match and
/// falling back to ignoring annotations if nothing matched (spec §4.N;
/// grounded on the "homologous" resolution in the reference model).
pub fn homologous_antigens(chart: &Chart, serum_no: usize) -> Vec<usize> {
    let serum = &chart.sera()[serum_no];
    let candidates = |respect_annotations: bool| -> Vec<usize> {
        chart
            .antigens()
            .iter()
            .enumerate()
            .filter(|(_, ag)| {
                ag.name == serum.name
                    && ag.reassortant == serum.reassortant
                    && (!respect_annotations || ag.annotations == serum.annotations)
                    && match_passage(ag, serum)
            })
            .map(|(i, _)| i)
            .collect()
    };
    let strict = candidates(true);
    if !strict.is_empty() {
        strict
    } else {
        candidates(false)
    }
}

/// The first homologous antigen with a usable (non-dont-care) titer
/// against `serum_no`, matching the reference behaviour of considering
/// just the first suitable homologous antigen.
fn first_homologous_with_titer(chart: &Chart, serum_no: usize) -> Option<(usize, Titer)> {
    homologous_antigens(chart, serum_no).into_iter().find_map(|ag_no| {
        let titer = chart.titers().titer(ag_no, serum_no);
        if titer.is_dont_care() {
            None
        } else {
            Some((ag_no, titer))
        }
    })
}

/// Theoretical radius: `max(2.0, fold + cb[s] - homologous_titer.logged)`
/// (spec §4.N).
pub fn theoretical_radius(
    chart: &Chart,
    column_bases: &ColumnBases,
    serum_no: usize,
    fold: f64,
) -> TheoreticalRadius {
    let Some((homologous_antigen, titer)) = first_homologous_with_titer(chart, serum_no) else {
        return TheoreticalRadius {
            serum_no,
            homologous_antigen: None,
            radius: None,
            status: SerumCircleStatus::NoHomologousAntigen,
        };
    };
    if !titer.is_regular() {
        return TheoreticalRadius {
            serum_no,
            homologous_antigen: Some(homologous_antigen),
            radius: None,
            status: SerumCircleStatus::NonRegularHomologousTiter,
        };
    }
    let logged = titer.logged_for_column_bases().expect("regular titer always logs");
    let radius = (fold + column_bases.get(serum_no) - logged).max(MIN_RADIUS);
    TheoreticalRadius {
        serum_no,
        homologous_antigen: Some(homologous_antigen),
        radius: Some(radius),
        status: SerumCircleStatus::Good,
    }
}

struct TiterDistance {
    antigen_no: usize,
    titer: Titer,
    distance: f64,
    final_similarity: f64,
}

fn titers_and_distances(
    chart: &Chart,
    projection: &Projection,
    column_bases: &ColumnBases,
    serum_no: usize,
) -> Vec<TiterDistance> {
    let num_antigens = chart.number_of_antigens();
    let serum_point = num_antigens + serum_no;
    let cb = column_bases.get(serum_no);
    (0..num_antigens)
        .filter_map(|ag_no| {
            let titer = chart.titers().titer(ag_no, serum_no);
            if titer.is_dont_care() {
                return None;
            }
            let distance = projection.layout().distance(ag_no, serum_point);
            if !distance.is_finite() {
                return None;
            }
            let similarity = titer.logged_for_column_bases().unwrap_or(0.0);
            Some(TiterDistance {
                antigen_no: ag_no,
                titer,
                distance,
                final_similarity: similarity.min(cb),
            })
        })
        .collect()
}

/// Find the radius minimizing `protected_outside + not_protected_inside`
/// over candidate radii at the midpoints between successive sorted
/// distances, averaging ties (spec §4.N).
fn search_best_radius(entries: &[TiterDistance], protection_boundary: f64) -> f64 {
    let mut by_distance: Vec<&TiterDistance> = entries.iter().collect();
    by_distance.sort_by_key(|e| ordered_float::OrderedFloat(e.distance));

    let is_protected = |e: &TiterDistance| {
        if e.titer.is_regular() {
            e.final_similarity >= protection_boundary
        } else {
            e.final_similarity > protection_boundary
        }
    };

    let mut best_sum: Option<usize> = None;
    let mut previous: Option<f64> = None;
    let mut sum_radii = 0.0;
    let mut num_radii = 0usize;

    for e in &by_distance {
        let radius = match previous {
            None => e.distance,
            Some(p) => (e.distance + p) / 2.0,
        };
        let mut protected_outside = 0usize;
        let mut not_protected_inside = 0usize;
        for other in &by_distance {
            let inside = other.distance <= radius;
            let protected = is_protected(other);
            if protected && !inside {
                protected_outside += 1;
            } else if !protected && inside {
                not_protected_inside += 1;
            }
        }
        let summa = protected_outside + not_protected_inside;
        match best_sum {
            None => {
                best_sum = Some(summa);
                sum_radii = radius;
                num_radii = 1;
            }
            Some(best) if summa < best => {
                best_sum = Some(summa);
                sum_radii = radius;
                num_radii = 1;
            }
            Some(best) if summa == best => {
                sum_radii += radius;
                num_radii += 1;
            }
            _ => {}
        }
        previous = Some(e.distance);
    }

    if num_radii > 0 {
        sum_radii / num_radii as f64
    } else {
        MIN_RADIUS
    }
}

/// Empirical radius for one serum (spec §4.N).
pub fn empirical_radius(
    chart: &Chart,
    projection: &Projection,
    column_bases: &ColumnBases,
    serum_no: usize,
    fold: f64,
) -> EmpiricalRadius {
    let num_antigens = chart.number_of_antigens();
    let serum_point = num_antigens + serum_no;

    let Some((homologous_antigen, homologous_titer)) = first_homologous_with_titer(chart, serum_no) else {
        return EmpiricalRadius {
            serum_no,
            homologous_antigen: None,
            radius: None,
            status: SerumCircleStatus::NoHomologousAntigen,
        };
    };
    if !projection.layout().point_has_coordinates(serum_point) {
        return EmpiricalRadius {
            serum_no,
            homologous_antigen: Some(homologous_antigen),
            radius: None,
            status: SerumCircleStatus::SerumDisconnected,
        };
    }
    if !projection.layout().point_has_coordinates(homologous_antigen) {
        return EmpiricalRadius {
            serum_no,
            homologous_antigen: Some(homologous_antigen),
            radius: None,
            status: SerumCircleStatus::AntigenDisconnected,
        };
    }
    let Ok(homologous_logged) = homologous_titer.logged_for_column_bases() else {
        return EmpiricalRadius {
            serum_no,
            homologous_antigen: Some(homologous_antigen),
            radius: None,
            status: SerumCircleStatus::NonRegularHomologousTiter,
        };
    };

    let protection_boundary = column_bases.get(serum_no).min(homologous_logged) - fold;
    if protection_boundary < 1.0 {
        return EmpiricalRadius {
            serum_no,
            homologous_antigen: Some(homologous_antigen),
            radius: None,
            status: SerumCircleStatus::TiterTooLow,
        };
    }

    let entries = titers_and_distances(chart, projection, column_bases, serum_no);
    let radius = search_best_radius(&entries, protection_boundary).max(MIN_RADIUS);
    EmpiricalRadius {
        serum_no,
        homologous_antigen: Some(homologous_antigen),
        radius: Some(radius),
        status: SerumCircleStatus::Good,
    }
}

/// Partition antigens by whether their titer against `serum_no` exceeds
/// `homologous.logged - fold` (spec §4.N "Coverage").
pub fn coverage(chart: &Chart, column_bases: &ColumnBases, serum_no: usize, fold: f64) -> Coverage {
    let Some((homologous_antigen, homologous_titer)) = first_homologous_with_titer(chart, serum_no) else {
        return Coverage {
            within: BTreeSet::new(),
            outside: BTreeSet::new(),
            homologous_antigen: None,
        };
    };
    let Ok(homologous_logged) = homologous_titer.logged_for_column_bases() else {
        return Coverage {
            within: BTreeSet::new(),
            outside: BTreeSet::new(),
            homologous_antigen: Some(homologous_antigen),
        };
    };
    let boundary = homologous_logged - fold;
    let cb = column_bases.get(serum_no);

    let mut within = BTreeSet::new();
    let mut outside = BTreeSet::new();
    for ag_no in 0..chart.number_of_antigens() {
        let titer = chart.titers().titer(ag_no, serum_no);
        if titer.is_dont_care() {
            continue;
        }
        let similarity = titer.logged_for_column_bases().unwrap_or(0.0).min(cb);
        let protected = if titer.is_regular() {
            similarity >= boundary
        } else {
            similarity > boundary
        };
        if protected {
            within.insert(ag_no);
        } else {
            outside.insert(ag_no);
        }
    }
    Coverage {
        within,
        outside,
        homologous_antigen: Some(homologous_antigen),
    }
}

/// Multi-serum serum circle: average the serum coordinates, classify
/// antigens by majority/perfect protection across `sera`, and run the
/// same empirical radius search around the averaged center (spec §4.N).
pub fn serum_circle_for_multiple_sera(
    chart: &Chart,
    projection: &Projection,
    column_bases: &ColumnBases,
    sera: &[usize],
    fold: f64,
    conservative: bool,
) -> Option<f64> {
    let num_antigens = chart.number_of_antigens();
    let mut protected_yes = vec![0usize; num_antigens];
    let mut protected_no = vec![0usize; num_antigens];
    let mut center = vec![0.0; projection.num_dims()];
    let mut num_connected = 0usize;

    for &serum_no in sera {
        let serum_point = num_antigens + serum_no;
        let Some(serum_coords) = projection.layout().point(serum_point) else {
            continue;
        };
        if !projection.layout().point_has_coordinates(serum_point) {
            continue;
        }
        for (i, c) in serum_coords.iter().enumerate() {
            center[i] += c;
        }
        num_connected += 1;

        for ag_no in homologous_antigens(chart, serum_no) {
            let titer = chart.titers().titer(ag_no, serum_no);
            if titer.is_dont_care() || !projection.layout().point_has_coordinates(ag_no) {
                continue;
            }
            let Ok(homologous_logged) = titer.logged_for_column_bases() else {
                continue;
            };
            let boundary = column_bases.get(serum_no).min(homologous_logged) - fold;
            if boundary < 1.0 {
                continue;
            }
            for other_ag in 0..num_antigens {
                let other_titer = chart.titers().titer(other_ag, serum_no);
                let similarity = if other_titer.is_dont_care() {
                    0.0
                } else {
                    other_titer.logged_for_column_bases().unwrap_or(0.0)
                }
                .min(column_bases.get(serum_no));
                let protected = if other_titer.is_regular() {
                    similarity >= boundary
                } else {
                    similarity > boundary
                };
                if protected {
                    protected_yes[other_ag] += 1;
                } else {
                    protected_no[other_ag] += 1;
                }
            }
            break; // only the first suitable homologous antigen.
        }
    }

    if num_connected == 0 {
        return None;
    }
    for c in center.iter_mut() {
        *c /= num_connected as f64;
    }

    let mut distances: Vec<(bool, f64)> = Vec::new();
    for ag_no in 0..num_antigens {
        let yes = protected_yes[ag_no];
        let no = protected_no[ag_no];
        if yes == 0 && no == 0 {
            continue;
        }
        let dominates = yes != no;
        if !dominates {
            continue;
        }
        if conservative && !(yes == 0 || no == 0) {
            continue;
        }
        let Some(coords) = projection.layout().point(ag_no) else {
            continue;
        };
        if !projection.layout().point_has_coordinates(ag_no) {
            continue;
        }
        let dist = coords
            .iter()
            .zip(&center)
            .map(|(x, c)| (x - c).powi(2))
            .sum::<f64>()
            .sqrt();
        distances.push((yes > no, dist));
    }

    let num_protected = distances.iter().filter(|(p, _)| *p).count();
    if num_protected == 0 || num_protected == distances.len() {
        return None;
    }

    distances.sort_by_key(|(_, d)| ordered_float::OrderedFloat(*d));
    let mut best_sum: Option<usize> = None;
    let mut previous: Option<f64> = None;
    let mut sum_radii = 0.0;
    let mut num_radii = 0usize;
    for &(_, dist0) in &distances {
        let radius = match previous {
            None => dist0,
            Some(p) => (dist0 + p) / 2.0,
        };
        let mut protected_outside = 0usize;
        let mut not_protected_inside = 0usize;
        for &(protected, dist) in &distances {
            let inside = dist <= radius;
            if protected && !inside {
                protected_outside += 1;
            } else if !protected && inside {
                not_protected_inside += 1;
            }
        }
        let summa = protected_outside + not_protected_inside;
        match best_sum {
            None => {
                best_sum = Some(summa);
                sum_radii = radius;
                num_radii = 1;
            }
            Some(best) if summa < best => {
                best_sum = Some(summa);
                sum_radii = radius;
                num_radii = 1;
            }
            Some(best) if summa == best => {
                sum_radii += radius;
                num_radii += 1;
            }
            _ => {}
        }
        previous = Some(dist0);
    }
    Some((sum_radii / num_radii.max(1) as f64).max(MIN_RADIUS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigen_serum::{Antigen, Serum};
    use crate::chart::Info;
    use crate::column_bases::MinimumColumnBasis;
    use crate::layout::Layout;
    use crate::table::TiterTable;
    use float_cmp::approx_eq;

    fn chart_with_homologous_serum() -> Chart {
        let antigen = Antigen {
            name: "A/VIRUS/1/2020".into(),
            ..Default::default()
        };
        let serum = Serum {
            name: "A/VIRUS/1/2020".into(),
            ..Default::default()
        };
        Chart::new(
            Info::default(),
            vec![antigen],
            vec![serum],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn homologous_matches_by_name_and_reassortant() {
        let chart = chart_with_homologous_serum();
        assert_eq!(homologous_antigens(&chart, 0), vec![0]);
    }

    #[test]
    fn theoretical_radius_matches_spec_example() {
        // "40" homologous titer, cb=log2(160)=4, fold=2: max(2, 2+4-log2(4)) = max(2,4) = 4.
        let antigen = Antigen {
            name: "A/X".into(),
            ..Default::default()
        };
        let serum = Serum {
            name: "A/X".into(),
            ..Default::default()
        };
        let chart = Chart::new(
            Info::default(),
            vec![antigen.clone(), Antigen::default()],
            vec![serum],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)], vec![Titer::Regular(160)]]).unwrap(),
        )
        .unwrap();
        let cb = ColumnBases::compute(chart.titers(), MinimumColumnBasis::None);
        let result = theoretical_radius(&chart, &cb, 0, 2.0);
        assert_eq!(result.status, SerumCircleStatus::Good);
        assert!(approx_eq!(f64, result.radius.unwrap(), 4.0, epsilon = 1e-9));
    }

    #[test]
    fn non_regular_homologous_titer_reports_status() {
        let antigen = Antigen {
            name: "A/X".into(),
            ..Default::default()
        };
        let serum = Serum {
            name: "A/X".into(),
            ..Default::default()
        };
        let chart = Chart::new(
            Info::default(),
            vec![antigen],
            vec![serum],
            TiterTable::from_dense(vec![vec![Titer::LessThan(40)]]).unwrap(),
        )
        .unwrap();
        let cb = ColumnBases::compute(chart.titers(), MinimumColumnBasis::None);
        let result = theoretical_radius(&chart, &cb, 0, 2.0);
        assert_eq!(result.status, SerumCircleStatus::NonRegularHomologousTiter);
        assert!(result.radius.is_none());
    }

    #[test]
    fn empirical_radius_is_at_least_min_radius() {
        let antigen = Antigen {
            name: "A/X".into(),
            ..Default::default()
        };
        let serum = Serum {
            name: "A/X".into(),
            ..Default::default()
        };
        let chart = Chart::new(
            Info::default(),
            vec![antigen, Antigen::default()],
            vec![serum],
            TiterTable::from_dense(vec![vec![Titer::Regular(160)], vec![Titer::Regular(40)]]).unwrap(),
        )
        .unwrap();
        let cb = ColumnBases::compute(chart.titers(), MinimumColumnBasis::None);
        let mut projection = Projection::new(3, 2);
        let mut layout = Layout::new(3, 2);
        layout.set_point(0, &[0.0, 0.0]);
        layout.set_point(1, &[3.0, 0.0]);
        layout.set_point(2, &[0.0, 0.0]);
        projection.set_layout(layout);

        let result = empirical_radius(&chart, &projection, &cb, 0, 2.0);
        assert_eq!(result.status, SerumCircleStatus::Good);
        assert!(result.radius.unwrap() >= MIN_RADIUS);
    }

    #[test]
    fn coverage_partitions_by_protection_boundary() {
        let antigen = Antigen {
            name: "A/X".into(),
            ..Default::default()
        };
        let serum = Serum {
            name: "A/X".into(),
            ..Default::default()
        };
        let chart = Chart::new(
            Info::default(),
            vec![antigen, Antigen::default()],
            vec![serum],
            TiterTable::from_dense(vec![vec![Titer::Regular(160)], vec![Titer::Regular(10)]]).unwrap(),
        )
        .unwrap();
        let cb = ColumnBases::compute(chart.titers(), MinimumColumnBasis::None);
        let result = coverage(&chart, &cb, 0, 2.0);
        assert!(result.within.contains(&0));
        assert!(result.outside.contains(&1));
    }
}
