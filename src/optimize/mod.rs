//! Projection relaxation — spec §4.H.
//!
//! Wraps an external unconstrained minimizer, randomizes the initial
//! layout, manages NaN-safe disconnected-point handling, and supports
//! "dimension annealing".

pub mod kernel;
pub mod randomizer;

use rayon::prelude::*;

use crate::chart::Chart;
use crate::column_bases::{ColumnBases, MinimumColumnBasis};
use crate::err::{Error, Result};
use crate::layout::{Layout, Transformation};
use crate::projection::Projection;
use crate::stress::StressFunction;

use kernel::{ConjugateGradientMinimizer, MinimizeOptions, Minimizer, NalgebraSvd, Svd, TerminationReason};
use randomizer::{LayoutRandomizer, RandomizationShape};

/// Which external minimizer family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    ConjugateGradient,
    Lbfgs,
}

/// Convergence tolerance tier; exact thresholds chosen to match the legacy
/// implementation closely enough to reproduce stored stresses (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Rough,
    Fine,
    VeryFine,
}

impl Precision {
    pub fn tolerance(&self) -> f64 {
        match self {
            Precision::Rough => 1e-4,
            Precision::Fine => 1e-8,
            Precision::VeryFine => 1e-10,
        }
    }
}

/// Whether to drop antigens/sera with too few numeric titers from the
/// relax (spec §4.H step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectTooFewNumericTiters {
    No,
    Yes,
}

/// Options controlling a single `relax` call (spec §4.H / §5).
#[derive(Debug, Clone)]
pub struct OptimizationOptions {
    pub method: Method,
    pub precision: Precision,
    pub randomization_diameter_multiplier: f64,
    pub randomization_shape: RandomizationShape,
    pub disconnect_too_few_numeric_titers: DisconnectTooFewNumericTiters,
    pub min_titers_per_point: usize,
    /// 0 means "all available", matching spec §5; consumed by `relax_many`
    /// via rayon's global pool.
    pub threads: usize,
    pub dodgy_titer_is_regular: bool,
    pub incremental: bool,
    pub max_iterations: usize,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        Self {
            method: Method::ConjugateGradient,
            precision: Precision::Fine,
            randomization_diameter_multiplier: 2.0,
            randomization_shape: RandomizationShape::Uniform,
            disconnect_too_few_numeric_titers: DisconnectTooFewNumericTiters::Yes,
            min_titers_per_point: 3,
            threads: 0,
            dodgy_titer_is_regular: false,
            incremental: false,
            max_iterations: 10_000,
        }
    }
}

/// Result of a single `relax` call (spec §4.H step 5).
#[derive(Debug, Clone)]
pub struct OptimizationStatus {
    pub final_stress: f64,
    pub iterations: usize,
    pub converged: bool,
    pub termination_reason: String,
}

/// Compute the effective column bases for a projection: forced ones if
/// present, else computed from the chart's titers at `mcb`.
pub(crate) fn effective_column_bases(chart: &Chart, projection: &Projection) -> ColumnBases {
    if let Some(forced) = projection.forced_column_bases() {
        ColumnBases::from_values(forced.to_vec(), projection.minimum_column_basis())
    } else if let Some(forced) = &chart.forced_column_bases {
        ColumnBases::from_values(forced.clone(), projection.minimum_column_basis())
    } else {
        ColumnBases::compute(chart.titers(), projection.minimum_column_basis())
    }
}

fn compute_disconnected_mask(
    chart: &Chart,
    projection: &Projection,
    options: &OptimizationOptions,
) -> Vec<bool> {
    let n = chart.number_of_points();
    let mut mask = vec![false; n];
    for &p in projection.disconnected() {
        if p < n {
            mask[p] = true;
        }
    }
    if options.disconnect_too_few_numeric_titers == DisconnectTooFewNumericTiters::Yes {
        let a = chart.number_of_antigens();
        for i in 0..a {
            if chart.titers().titrations_for_antigen(i) < options.min_titers_per_point {
                mask[i] = true;
            }
        }
        for j in 0..chart.number_of_sera() {
            if chart.titers().titrations_for_serum(j) < options.min_titers_per_point {
                mask[a + j] = true;
            }
        }
    }
    mask
}

/// Run a single synchronous optimization of `projection` in place against
/// `chart` (spec §4.H). `seed`, if given, makes randomization reproducible.
pub fn relax(
    chart: &Chart,
    projection: &mut Projection,
    options: &OptimizationOptions,
    seed: Option<u64>,
) -> Result<OptimizationStatus> {
    let num_dims = projection.num_dims();
    let num_points = chart.number_of_points();
    if projection.num_points() != num_points {
        return Err(Error::StructureInvalid(
            "projection point count does not match chart".into(),
        ));
    }

    let column_bases = effective_column_bases(chart, projection);
    let disconnected = compute_disconnected_mask(chart, projection, options);

    let needs_randomize = !options.incremental || projection.layout().as_slice().is_empty();
    if needs_randomize {
        let table_distances: Vec<f64> = chart
            .titers()
            .titers_existing()
            .filter_map(|(_, _, t)| t.logged_for_column_bases().ok())
            .map(|v| v.abs())
            .collect();
        let max_td = table_distances
            .into_iter()
            .fold(1.0_f64, |acc, v| acc.max(v));
        let diameter = max_td * options.randomization_diameter_multiplier;
        let mut randomizer = LayoutRandomizer::new(
            seed.unwrap_or_else(|| rand::random()),
            options.randomization_shape,
            diameter.max(1e-6),
        );
        let mut layout = Layout::new(num_points, num_dims);
        for p in 0..num_points {
            if projection.unmovable().contains(&p) {
                if let Some(existing) = projection.layout().point(p) {
                    layout.set_point(p, existing);
                }
                continue;
            }
            let mut coords = vec![0.0; num_dims];
            randomizer.fill(&mut coords);
            layout.set_point(p, &coords);
        }
        projection.set_layout(layout);
    }

    // Scoped NaN -> 0 substitution for disconnected points, restored on
    // every exit path (spec §4.H step 3).
    let mut working_layout = projection.layout().clone();
    let mut restore: Vec<(usize, Vec<f64>)> = Vec::new();
    for (p, is_disc) in disconnected.iter().enumerate() {
        if *is_disc {
            if let Some(coords) = working_layout.point(p) {
                restore.push((p, coords.to_vec()));
            }
            working_layout.set_point(p, &vec![0.0; num_dims]);
        }
    }

    let stress_fn = StressFunction::build(
        chart.titers(),
        &column_bases,
        projection.avidity_adjusts(),
        &disconnected,
        options.dodgy_titer_is_regular,
    );

    let unmovable: Vec<usize> = projection.unmovable().iter().copied().collect();
    let result = run_minimizer(&stress_fn, &working_layout, &disconnected, &unmovable, options);

    // Restore NaN on disconnected points regardless of outcome.
    let mut final_layout = Layout::from_data(result.x.clone(), num_dims)?;
    for (p, _) in &restore {
        final_layout.set_disconnected(*p);
    }

    let final_stress = stress_fn.stress(&final_layout);
    projection.set_layout(final_layout);
    projection.set_stress(final_stress);
    if projection.transformation().num_dims() != num_dims {
        projection.set_transformation(Transformation::identity(num_dims));
    }

    if !final_stress.is_finite() {
        return Err(Error::OptimizerFailure(
            "relax produced a non-finite stress".into(),
        ));
    }

    Ok(OptimizationStatus {
        final_stress,
        iterations: result.iterations,
        converged: result.reason == TerminationReason::Converged,
        termination_reason: format!("{:?}", result.reason),
    })
}

fn run_minimizer(
    stress_fn: &StressFunction,
    layout: &Layout,
    disconnected: &[bool],
    unmovable: &[usize],
    options: &OptimizationOptions,
) -> kernel::MinimizeResult {
    let num_dims = layout.num_dims();
    let x0 = layout.as_slice().to_vec();
    let mut movable_mask = vec![true; layout.num_points()];
    for &u in unmovable {
        if u < movable_mask.len() {
            movable_mask[u] = false;
        }
    }
    for (p, is_disc) in disconnected.iter().enumerate() {
        if *is_disc && p < movable_mask.len() {
            movable_mask[p] = false;
        }
    }

    let zero_grad_for_fixed = move |mut g: Vec<f64>| {
        for (p, movable) in movable_mask.iter().enumerate() {
            if !*movable {
                for d in 0..num_dims {
                    g[p * num_dims + d] = 0.0;
                }
            }
        }
        g
    };

    let f = |x: &[f64]| {
        let layout = Layout::from_data(x.to_vec(), num_dims).expect("shape preserved");
        stress_fn.stress(&layout)
    };
    let grad = |x: &[f64]| {
        let layout = Layout::from_data(x.to_vec(), num_dims).expect("shape preserved");
        zero_grad_for_fixed(stress_fn.gradient(&layout))
    };

    let minimize_options = MinimizeOptions {
        tolerance: options.precision.tolerance(),
        max_iterations: options.max_iterations,
    };

    match options.method {
        Method::ConjugateGradient | Method::Lbfgs => {
            ConjugateGradientMinimizer.minimize(&x0, &f, &grad, &minimize_options)
        }
    }
}

/// Run `number_of_optimizations` independent relaxations, fan out across
/// `options.threads` rayon workers (spec §4.H / §5), and append them to
/// `chart`'s projections, sorted by ascending stress. A user-supplied
/// `seed` forces sequential execution with exactly one optimization.
pub fn relax_many(
    chart: &mut Chart,
    number_of_optimizations: usize,
    num_dims: usize,
    mcb: MinimumColumnBasis,
    options: &OptimizationOptions,
    global_seed: Option<u64>,
) -> Vec<Result<OptimizationStatus>> {
    let number_of_optimizations = if global_seed.is_some() {
        1
    } else {
        number_of_optimizations
    };
    let num_points = chart.number_of_points();

    let run = |worker_id: usize| -> (Projection, Result<OptimizationStatus>) {
        let mut projection = Projection::new(num_points, num_dims);
        projection.set_minimum_column_basis(mcb);
        let seed = global_seed.map(|s| s.wrapping_add(worker_id as u64));
        let status = relax(chart, &mut projection, options, seed);
        (projection, status)
    };

    let results: Vec<(Projection, Result<OptimizationStatus>)> = if options.threads == 1
        || number_of_optimizations <= 1
    {
        (0..number_of_optimizations).map(run).collect()
    } else if options.threads == 0 {
        (0..number_of_optimizations).into_par_iter().map(run).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads)
            .build()
            .expect("thread pool builds");
        pool.install(|| (0..number_of_optimizations).into_par_iter().map(run).collect())
    };

    let mut statuses = Vec::with_capacity(results.len());
    for (mut projection, status) in results {
        if status.is_err() {
            projection.set_stress(f64::NAN);
        }
        chart.push_projection(projection);
        statuses.push(status);
    }
    chart.sort_projections();
    statuses
}

/// Dimension annealing (spec §4.H step 6): relax at `from_dims`, then
/// repeatedly drop the least-significant dimension (via SVD of the
/// centered coordinates) and re-relax, until `to_dims` is reached.
pub fn relax_with_dimension_annealing(
    chart: &Chart,
    from_dims: usize,
    to_dims: usize,
    mcb: MinimumColumnBasis,
    options: &OptimizationOptions,
    seed: Option<u64>,
) -> Result<Projection> {
    if to_dims > from_dims {
        return Err(Error::InvalidDimensionality(
            "dimension annealing requires to_dims <= from_dims".into(),
        ));
    }
    let num_points = chart.number_of_points();
    let mut projection = Projection::new(num_points, from_dims);
    projection.set_minimum_column_basis(mcb);
    relax(chart, &mut projection, options, seed)?;

    let mut current_dims = from_dims;
    while current_dims > to_dims {
        let reduced = drop_least_significant_dimension(projection.layout())?;
        let mut next = Projection::new(num_points, current_dims - 1);
        next.set_minimum_column_basis(mcb);
        next.set_layout(reduced);
        let mut incremental_options = options.clone();
        incremental_options.incremental = true;
        relax(chart, &mut next, &incremental_options, seed)?;
        projection = next;
        current_dims -= 1;
    }
    Ok(projection)
}

fn drop_least_significant_dimension(layout: &Layout) -> Result<Layout> {
    let num_points = layout.num_points();
    let num_dims = layout.num_dims();
    let connected: Vec<usize> = (0..num_points)
        .filter(|&p| layout.point_has_coordinates(p))
        .collect();
    if connected.is_empty() {
        return Layout::from_data(vec![f64::NAN; num_points * (num_dims - 1)], num_dims - 1);
    }
    let centroid = layout.centroid(&connected);
    let mut matrix = nalgebra::DMatrix::<f64>::zeros(connected.len(), num_dims);
    for (row, &p) in connected.iter().enumerate() {
        let coords = layout.point(p).unwrap();
        for d in 0..num_dims {
            matrix[(row, d)] = coords[d] - centroid[d];
        }
    }
    let svd_kernel = NalgebraSvd;
    let (_, _, v_t) = svd_kernel.svd(&matrix);
    // Project onto the top `num_dims - 1` principal axes (rows of V^T).
    let mut out = Layout::new(num_points, num_dims - 1);
    for &p in &connected {
        let coords = layout.point(p).unwrap();
        let centered: Vec<f64> = coords.iter().zip(&centroid).map(|(c, m)| c - m).collect();
        let mut projected = vec![0.0; num_dims - 1];
        for d in 0..num_dims - 1 {
            let mut acc = 0.0;
            for k in 0..num_dims {
                acc += v_t[(d, k)] * centered[k];
            }
            projected[d] = acc;
        }
        out.set_point(p, &projected);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antigen_serum::{Antigen, Serum};
    use crate::chart::Info;
    use crate::table::TiterTable;
    use crate::titer::Titer;
    use float_cmp::approx_eq;

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
    fn relax_trivial_two_point_chart_reaches_near_zero_stress() {
        let chart = trivial_chart();
        let mut projection = Projection::new(2, 2);
        let options = OptimizationOptions::default();
        let status = relax(&chart, &mut projection, &options, Some(42)).unwrap();
        assert!(status.final_stress < 1e-8, "stress={}", status.final_stress);

        // column basis equals the lone titer's own log value, so the table
        // distance for this single cell is exactly zero.
        let actual_distance = projection.layout().distance(0, 1);
        assert!(approx_eq!(f64, actual_distance, 0.0, epsilon = 1e-3));
    }

    #[test]
    fn disconnected_points_never_materialize_coordinates() {
        let chart = Chart::new(
            Info::default(),
            vec![Antigen::default(), Antigen::default()],
            vec![Serum::default()],
            TiterTable::from_dense(vec![vec![Titer::Regular(40)], vec![Titer::DontCare]]).unwrap(),
        )
        .unwrap();
        let mut projection = Projection::new(3, 2);
        projection.disconnected_mut().insert(1);
        let options = OptimizationOptions {
            disconnect_too_few_numeric_titers: DisconnectTooFewNumericTiters::No,
            ..OptimizationOptions::default()
        };
        relax(&chart, &mut projection, &options, Some(7)).unwrap();
        assert!(!projection.layout().point_has_coordinates(1));
    }

    #[test]
    fn relax_many_sorts_by_ascending_stress() {
        let mut chart = trivial_chart();
        let options = OptimizationOptions::default();
        let statuses = relax_many(&mut chart, 4, 2, MinimumColumnBasis::None, &options, None);
        assert_eq!(statuses.len(), 4);
        let stresses: Vec<f64> = chart
            .projections()
            .iter()
            .map(|p| p.stress().unwrap_or(f64::INFINITY))
            .collect();
        for w in stresses.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }
}
