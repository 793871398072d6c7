//! Grid test: per-point local-minimum diagnostic — spec §4.L.
//!
//! For each movable, connected point, probe a regular mesh of offsets
//! around its current location with every other point held fixed, and
//! classify whether the point sits in a genuine local minimum, is
//! `trapped` (a nearby location clearly improves stress), or is
//! `hemisphering` (a nearby location ties the current stress, indicating
//! a flat direction — the hallmark of a point stuck on the wrong side of
//! a hemisphere).

use itertools::Itertools;
use rayon::prelude::*;

use crate::chart::Chart;
use crate::err::Result;
use crate::layout::Layout;
use crate::optimize::{effective_column_bases, OptimizationOptions, OptimizationStatus};
use crate::projection::Projection;
use crate::stress::StressFunction;

/// Options controlling a [`grid_test`] run (spec §4.L).
#[derive(Debug, Clone)]
pub struct GridTestOptions {
    pub grid_step: f64,
    /// Search radius per axis; `None` derives it from the chart's diameter.
    pub radius: Option<f64>,
    pub trap_threshold: f64,
    pub epsilon: f64,
    /// 0 means "all available", consumed via rayon's global pool.
    pub threads: usize,
    pub dodgy_titer_is_regular: bool,
}

impl Default for GridTestOptions {
    fn default() -> Self {
        Self {
            grid_step: 0.25,
            radius: None,
            trap_threshold: 1e-4,
            epsilon: 1e-4,
            threads: 0,
            dodgy_titer_is_regular: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointClassification {
    Normal,
    Trapped,
    Hemisphering,
}

/// Outcome of probing a single point's neighbourhood.
#[derive(Debug, Clone)]
pub struct GridTestResult {
    pub point: usize,
    pub classification: PointClassification,
    pub original_stress: f64,
    pub best_stress: f64,
    pub best_location: Vec<f64>,
}

fn chart_diameter(layout: &Layout) -> f64 {
    let n = layout.num_points();
    let mut max = 0.0_f64;
    for i in 0..n {
        for j in (i + 1)..n {
            let d = layout.distance(i, j);
            if d.is_finite() && d > max {
                max = d;
            }
        }
    }
    max
}

fn effective_radius(layout: &Layout, options: &GridTestOptions) -> f64 {
    match options.radius {
        Some(r) => r,
        None => chart_diameter(layout).max(1.0) * 1.5,
    }
}

/// Offsets on a regular mesh, one axis value per dimension, spanning
/// `[-radius, radius]` in steps of `step`. Includes the zero offset.
fn grid_offsets(num_dims: usize, radius: f64, step: f64) -> Vec<Vec<f64>> {
    if step <= 0.0 || radius <= 0.0 || num_dims == 0 {
        return vec![vec![0.0; num_dims]];
    }
    let count = (radius / step).floor() as i64;
    let axis_values: Vec<f64> = (-count..=count).map(|k| k as f64 * step).collect();
    (0..num_dims)
        .map(|_| axis_values.iter().copied())
        .multi_cartesian_product()
        .collect()
}

fn grid_test_point(
    layout: &Layout,
    stress_fn: &StressFunction,
    point: usize,
    offsets: &[Vec<f64>],
    options: &GridTestOptions,
) -> GridTestResult {
    let original_stress = stress_fn.stress(layout);
    let original_coords = layout.point(point).expect("point index in range").to_vec();

    let mut best_stress = original_stress;
    let mut best_location = original_coords.clone();
    let mut trapped = false;
    let mut hemisphering = false;

    for offset in offsets {
        if offset.iter().all(|&v| v == 0.0) {
            continue;
        }
        let candidate: Vec<f64> = original_coords
            .iter()
            .zip(offset)
            .map(|(c, o)| c + o)
            .collect();
        let mut trial = layout.clone();
        trial.set_point(point, &candidate);
        let stress_at = stress_fn.stress(&trial);

        if stress_at < best_stress {
            best_stress = stress_at;
            best_location = candidate;
        }
        if original_stress - stress_at > options.trap_threshold {
            trapped = true;
        }
        if (original_stress - stress_at).abs() <= options.epsilon {
            hemisphering = true;
        }
    }

    let classification = if trapped {
        PointClassification::Trapped
    } else if hemisphering {
        PointClassification::Hemisphering
    } else {
        PointClassification::Normal
    };

    GridTestResult {
        point,
        classification,
        original_stress,
        best_stress,
        best_location,
    }
}

/// Probe every non-fixed, connected point of `projection` on a regular
/// mesh (spec §4.L). Embarrassingly parallel over points; `options.threads`
/// selects the rayon pool the same way [`crate::optimize::relax_many`]
/// does.
pub fn grid_test(
    chart: &Chart,
    projection: &Projection,
    options: &GridTestOptions,
) -> Vec<GridTestResult> {
    let layout = projection.layout();
    let num_points = layout.num_points();

    let mut disconnected = vec![false; num_points];
    for &p in projection.disconnected() {
        if p < num_points {
            disconnected[p] = true;
        }
    }

    let column_bases = effective_column_bases(chart, projection);
    let stress_fn = StressFunction::build(
        chart.titers(),
        &column_bases,
        projection.avidity_adjusts(),
        &disconnected,
        options.dodgy_titer_is_regular,
    );

    let targets: Vec<usize> = (0..num_points)
        .filter(|p| !projection.unmovable().contains(p))
        .filter(|&p| !disconnected[p])
        .filter(|&p| layout.point_has_coordinates(p))
        .collect();

    let radius = effective_radius(layout, options);
    let offsets = grid_offsets(layout.num_dims(), radius, options.grid_step);

    let run = |&p: &usize| grid_test_point(layout, &stress_fn, p, &offsets, options);

    if options.threads == 1 {
        targets.iter().map(run).collect()
    } else if options.threads == 0 {
        targets.par_iter().map(run).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads)
            .build()
            .expect("thread pool builds");
        pool.install(|| targets.par_iter().map(run).collect())
    }
}

/// Move every `trapped`/`hemisphering` point to its best grid location and
/// re-relax the projection (spec §4.L step 4).
pub fn apply(
    chart: &Chart,
    projection: &mut Projection,
    results: &[GridTestResult],
    relax_options: &OptimizationOptions,
) -> Result<OptimizationStatus> {
    for result in results {
        if matches!(
            result.classification,
            PointClassification::Trapped | PointClassification::Hemisphering
        ) {
            projection
                .layout_mut()
                .set_point(result.point, &result.best_location);
        }
    }
    let mut incremental_options = relax_options.clone();
    incremental_options.incremental = true;
    crate::optimize::relax(chart, projection, &incremental_options, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigen_serum::{Antigen, Serum};
    use crate::chart::Info;
    use crate::optimize::relax;
    use crate::table::TiterTable;
    use crate::titer::Titer;

    fn trivial_chart() -> Chart {
        Chart::new(
            Info::default(),
            vec![Antigen::default()],
            vec![Serum::default()],
            TiterTable::from_dense(vec![vec![Titer::Regular(80)]]).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn relaxed_point_is_classified_normal() {
        let chart = trivial_chart();
        let mut projection = Projection::new(2, 2);
        relax(&chart, &mut projection, &OptimizationOptions::default(), Some(11)).unwrap();

        let options = GridTestOptions {
            grid_step: 0.1,
            radius: Some(1.0),
            trap_threshold: 1e-6,
            epsilon: 1e-9,
            threads: 1,
            dodgy_titer_is_regular: false,
        };
        let results = grid_test(&chart, &projection, &options);
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.classification, PointClassification::Normal);
        }
    }

    #[test]
    fn point_far_from_optimum_is_trapped() {
        let chart = trivial_chart();
        let mut projection = Projection::new(2, 2);
        let mut layout = Layout::new(2, 2);
        layout.set_point(0, &[5.0, 5.0]);
        layout.set_point(1, &[0.0, 0.0]);
        projection.set_layout(layout);
        projection.unmovable_mut().insert(1);

        let options = GridTestOptions {
            grid_step: 1.0,
            radius: Some(8.0),
            trap_threshold: 0.01,
            epsilon: 1e-9,
            threads: 1,
            dodgy_titer_is_regular: false,
        };
        let results = grid_test(&chart, &projection, &options);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].point, 0);
        assert_eq!(results[0].classification, PointClassification::Trapped);
    }

    #[test]
    fn apply_moves_trapped_point_and_reduces_stress() {
        let chart = trivial_chart();
        let mut projection = Projection::new(2, 2);
        let mut layout = Layout::new(2, 2);
        layout.set_point(0, &[5.0, 5.0]);
        layout.set_point(1, &[0.0, 0.0]);
        projection.set_layout(layout);
        projection.unmovable_mut().insert(1);

        let options = GridTestOptions {
            grid_step: 1.0,
            radius: Some(8.0),
            trap_threshold: 0.01,
            epsilon: 1e-9,
            threads: 1,
            dodgy_titer_is_regular: false,
        };
        let results = grid_test(&chart, &projection, &options);
        let relax_options = OptimizationOptions {
            incremental: true,
            ..OptimizationOptions::default()
        };
        let status = apply(&chart, &mut projection, &results, &relax_options).unwrap();
        assert!(status.final_stress < 1.0, "stress={}", status.final_stress);
    }
}
