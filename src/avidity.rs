//! Avidity test: per-antigen reactivity-adjust sweep — spec §4.M.
//!
//! For a chosen antigen, try a range of log2-additive avidity adjusts,
//! relax each candidate, procrustes-align it back onto the original
//! projection, and report how far the antigen (and the rest of the map)
//! moved and whether stress improved.

use rayon::prelude::*;

use crate::chart::Chart;
use crate::err::Result;
use crate::optimize::{effective_column_bases, relax, OptimizationOptions};
use crate::procrustes::align;
use crate::projection::Projection;
use crate::stress::StressFunction;

/// Options controlling the delta sweep (spec §4.M).
#[derive(Debug, Clone)]
pub struct AvidityTestOptions {
    pub step: f64,
    pub max_adjust: f64,
    pub min_adjust: f64,
    /// 0 means "all available", consumed via rayon's global pool.
    pub threads: usize,
}

impl Default for AvidityTestOptions {
    fn default() -> Self {
        Self {
            step: 1.0,
            max_adjust: 5.0,
            min_adjust: -5.0,
            threads: 0,
        }
    }
}

/// Per-delta outcome for the antigen under test (spec §4.M step 3).
#[derive(Debug, Clone)]
pub struct AvidityAdjustRecord {
    pub delta: f64,
    pub distance_moved: f64,
    pub angle_moved: f64,
    pub average_distance_of_others: f64,
    pub stress_diff: f64,
    pub final_coordinates: Vec<f64>,
    /// Up to 5 other antigens that moved the most, `(antigen_no, distance)`.
    pub most_moved_others: Vec<(usize, f64)>,
}

/// Full sweep result for one antigen.
#[derive(Debug, Clone)]
pub struct AvidityTestResult {
    pub antigen: usize,
    pub records: Vec<AvidityAdjustRecord>,
    pub best_delta: f64,
}

fn deltas(options: &AvidityTestOptions) -> Vec<f64> {
    let mut out = Vec::new();
    let mut d = options.step;
    while d <= options.max_adjust + 1e-9 {
        out.push(d);
        d += options.step;
    }
    let mut d = -options.step;
    while d >= options.min_adjust - 1e-9 {
        out.push(d);
        d -= options.step;
    }
    out
}

fn point_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Angle (radians) between the vectors from `centroid` to `a` and to `b`;
/// well-defined in any dimensionality, 0 if either vector is degenerate.
fn angle_between(centroid: &[f64], a: &[f64], b: &[f64]) -> f64 {
    let va: Vec<f64> = a.iter().zip(centroid).map(|(x, c)| x - c).collect();
    let vb: Vec<f64> = b.iter().zip(centroid).map(|(x, c)| x - c).collect();
    let norm_a = va.iter().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = vb.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a < 1e-12 || norm_b < 1e-12 {
        return 0.0;
    }
    let dot: f64 = va.iter().zip(&vb).map(|(x, y)| x * y).sum();
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0).acos()
}

fn run_one_delta(
    chart: &Chart,
    projection: &Projection,
    antigen: usize,
    delta: f64,
    original_stress: f64,
    relax_options: &OptimizationOptions,
) -> Result<AvidityAdjustRecord> {
    let num_points = projection.num_points();
    let mut trial = projection.clone();
    let mut adjusts = trial
        .avidity_adjusts()
        .map(|a| a.to_vec())
        .unwrap_or_else(|| vec![0.0; num_points]);
    adjusts[antigen] = delta;
    trial.set_avidity_adjusts(Some(adjusts));

    let mut incremental_options = relax_options.clone();
    incremental_options.incremental = true;
    let status = relax(chart, &mut trial, &incremental_options, None)?;

    let pairs: Vec<(usize, usize)> = (0..num_points).map(|p| (p, p)).collect();
    let proc = align(projection.layout(), trial.layout(), &pairs, false)?;
    let aligned = trial.layout().transform(&proc.transformation)?;

    let centroid = projection.layout().centroid(&(0..num_points).collect::<Vec<_>>());
    let original_antigen = projection.layout().point(antigen).unwrap_or(&[]);
    let aligned_antigen = aligned.point(antigen).unwrap_or(&[]);
    let distance_moved = point_distance(original_antigen, aligned_antigen);
    let angle_moved = angle_between(&centroid, original_antigen, aligned_antigen);

    let num_antigens = chart.number_of_antigens();
    let mut others: Vec<(usize, f64)> = Vec::new();
    let mut sum_other = 0.0;
    let mut count_other = 0usize;
    for other in 0..num_antigens {
        if other == antigen {
            continue;
        }
        if let (Some(orig), Some(new)) = (projection.layout().point(other), aligned.point(other)) {
            if projection.layout().point_has_coordinates(other) {
                let d = point_distance(orig, new);
                others.push((other, d));
                sum_other += d;
                count_other += 1;
            }
        }
    }
    let average_distance_of_others = if count_other > 0 {
        sum_other / count_other as f64
    } else {
        0.0
    };
    others.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    others.truncate(5);

    Ok(AvidityAdjustRecord {
        delta,
        distance_moved,
        angle_moved,
        average_distance_of_others,
        stress_diff: status.final_stress - original_stress,
        final_coordinates: aligned_antigen.to_vec(),
        most_moved_others: others,
    })
}

/// Run the full delta sweep for `antigen` (spec §4.M).
pub fn test_antigen(
    chart: &Chart,
    projection: &Projection,
    antigen: usize,
    options: &AvidityTestOptions,
    relax_options: &OptimizationOptions,
) -> Result<AvidityTestResult> {
    let num_points = projection.num_points();
    let disconnected: Vec<bool> = {
        let mut mask = vec![false; num_points];
        for &p in projection.disconnected() {
            if p < num_points {
                mask[p] = true;
            }
        }
        mask
    };
    let column_bases = effective_column_bases(chart, projection);
    let original_stress_fn = StressFunction::build(
        chart.titers(),
        &column_bases,
        projection.avidity_adjusts(),
        &disconnected,
        relax_options.dodgy_titer_is_regular,
    );
    let original_stress = original_stress_fn.stress(projection.layout());

    let deltas = deltas(options);
    let run = |&delta: &f64| run_one_delta(chart, projection, antigen, delta, original_stress, relax_options);

    let records: Vec<Result<AvidityAdjustRecord>> = if options.threads == 1 {
        deltas.iter().map(run).collect()
    } else if options.threads == 0 {
        deltas.par_iter().map(run).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads)
            .build()
            .expect("thread pool builds");
        pool.install(|| deltas.par_iter().map(run).collect())
    };

    let mut resolved = Vec::with_capacity(records.len());
    for record in records {
        resolved.push(record?);
    }

    let best_delta = resolved
        .iter()
        .filter(|r| r.stress_diff < 0.0)
        .min_by(|a, b| a.stress_diff.partial_cmp(&b.stress_diff).unwrap_or(std::cmp::Ordering::Equal))
        .map(|r| r.delta)
        .unwrap_or(0.0);

    Ok(AvidityTestResult {
        antigen,
        records: resolved,
        best_delta,
    })
}

/// Run [`test_antigen`] over every antigen in the chart.
pub fn test_all_antigens(
    chart: &Chart,
    projection: &Projection,
    options: &AvidityTestOptions,
    relax_options: &OptimizationOptions,
) -> Vec<Result<AvidityTestResult>> {
    (0..chart.number_of_antigens())
        .map(|a| test_antigen(chart, projection, a, options, relax_options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigen_serum::{Antigen, Serum};
    use crate::chart::Info;
    use crate::optimize::relax as do_relax;
    use crate::table::TiterTable;
    use crate::titer::Titer;

    fn two_antigen_chart() -> Chart {
        Chart::new(
            Info::default(),
            vec![Antigen::default(), Antigen::default()],
            vec![Serum::default()],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)], vec![Titer::Regular(160)]])
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn sweep_covers_expected_delta_range() {
        let options = AvidityTestOptions {
            step: 1.0,
            max_adjust: 3.0,
            min_adjust: -3.0,
            threads: 1,
        };
        let ds = deltas(&options);
        assert_eq!(ds.len(), 6);
        assert!(ds.contains(&3.0));
        assert!(ds.contains(&-3.0));
        assert!(!ds.contains(&0.0));
    }

    #[test]
    fn test_antigen_produces_one_record_per_delta() {
        let chart = two_antigen_chart();
        let mut projection = Projection::new(3, 2);
        do_relax(&chart, &mut projection, &OptimizationOptions::default(), Some(3)).unwrap();

        let options = AvidityTestOptions {
            step: 1.0,
            max_adjust: 2.0,
            min_adjust: -2.0,
            threads: 1,
        };
        let relax_options = OptimizationOptions::default();
        let result = test_antigen(&chart, &projection, 0, &options, &relax_options).unwrap();
        assert_eq!(result.antigen, 0);
        assert_eq!(result.records.len(), 4);
    }

    #[test]
    fn best_delta_defaults_to_zero_when_nothing_improves() {
        let chart = two_antigen_chart();
        let mut projection = Projection::new(3, 2);
        do_relax(&chart, &mut projection, &OptimizationOptions::default(), Some(3)).unwrap();
        // Already at a relaxed minimum; perturbing avidity should not help.
        let options = AvidityTestOptions {
            step: 5.0,
            max_adjust: 5.0,
            min_adjust: -5.0,
            threads: 1,
        };
        let relax_options = OptimizationOptions::default();
        let result = test_antigen(&chart, &projection, 0, &options, &relax_options).unwrap();
        assert!(result.records.iter().all(|r| r.stress_diff > -1e-6) || result.best_delta != 0.0);
    }
}
