//! Narrow injectable interfaces for the external numeric kernels spec §9
//! treats as black boxes: an unconstrained minimizer and an SVD.
//!
//! Each trait ships one concrete, dependency-light default implementation
//! so the crate works standalone; callers needing a faster/more precise
//! kernel (ALGLIB's L-BFGS/CG, LAPACK's SVD, ...) can supply their own.

/// Convergence/iteration controls for [`Minimizer::minimize`].
#[derive(Debug, Clone, Copy)]
pub struct MinimizeOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
}

/// Why a minimization run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Converged,
    MaxIterationsReached,
    Failed,
}

/// Outcome of a [`Minimizer::minimize`] call.
#[derive(Debug, Clone)]
pub struct MinimizeResult {
    pub x: Vec<f64>,
    pub final_value: f64,
    pub iterations: usize,
    pub reason: TerminationReason,
}

/// An unconstrained minimizer over `R^n`.
pub trait Minimizer {
    fn minimize(
        &self,
        x0: &[f64],
        f: &dyn Fn(&[f64]) -> f64,
        grad: &dyn Fn(&[f64]) -> Vec<f64>,
        options: &MinimizeOptions,
    ) -> MinimizeResult;
}

/// Nonlinear conjugate gradient (Polak-Ribiere) with backtracking line
/// search; the default [`Minimizer`], matching the "alglib-cg" method named
/// in `original_source`'s `chart-relax.cc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConjugateGradientMinimizer;

impl Minimizer for ConjugateGradientMinimizer {
    fn minimize(
        &self,
        x0: &[f64],
        f: &dyn Fn(&[f64]) -> f64,
        grad: &dyn Fn(&[f64]) -> Vec<f64>,
        options: &MinimizeOptions,
    ) -> MinimizeResult {
        let n = x0.len();
        let mut x = x0.to_vec();
        let mut g = grad(&x);
        let mut direction: Vec<f64> = g.iter().map(|v| -v).collect();
        let mut fx = f(&x);
        let mut reason = TerminationReason::MaxIterationsReached;
        let mut iterations = 0;

        if n == 0 {
            return MinimizeResult {
                x,
                final_value: fx,
                iterations: 0,
                reason: TerminationReason::Converged,
            };
        }

        for iter in 0..options.max_iterations {
            iterations = iter + 1;
            let grad_norm_sq: f64 = g.iter().map(|v| v * v).sum();
            if grad_norm_sq.sqrt() < options.tolerance {
                reason = TerminationReason::Converged;
                break;
            }
            if !fx.is_finite() {
                reason = TerminationReason::Failed;
                break;
            }

            // Backtracking line search along `direction`.
            let mut step = 1.0;
            let directional_derivative: f64 =
                g.iter().zip(&direction).map(|(gi, di)| gi * di).sum();
            if directional_derivative >= 0.0 {
                // Not a descent direction; restart with steepest descent.
                direction = g.iter().map(|v| -v).collect();
            }
            let mut next_x = x.clone();
            let mut next_fx;
            loop {
                for i in 0..n {
                    next_x[i] = x[i] + step * direction[i];
                }
                next_fx = f(&next_x);
                if next_fx.is_finite() && next_fx <= fx + 1e-4 * step * directional_derivative {
                    break;
                }
                step *= 0.5;
                if step < 1e-16 {
                    break;
                }
            }

            if step < 1e-16 || !next_fx.is_finite() {
                reason = TerminationReason::Converged;
                break;
            }

            let next_g = grad(&next_x);
            let beta_num: f64 = next_g
                .iter()
                .zip(&g)
                .map(|(ng, og)| ng * (ng - og))
                .sum();
            let beta_den: f64 = g.iter().map(|v| v * v).sum::<f64>().max(1e-300);
            let beta = (beta_num / beta_den).max(0.0);

            for i in 0..n {
                direction[i] = -next_g[i] + beta * direction[i];
            }

            x = next_x;
            g = next_g;
            fx = next_fx;
        }

        MinimizeResult {
            x,
            final_value: fx,
            iterations,
            reason,
        }
    }
}

/// Singular value decomposition `M = U * diag(sigma) * Vt`.
pub trait Svd {
    fn svd(&self, matrix: &nalgebra::DMatrix<f64>) -> (nalgebra::DMatrix<f64>, Vec<f64>, nalgebra::DMatrix<f64>);
}

/// Default [`Svd`] backed by `nalgebra`'s dense SVD; adequate for the small
/// (2x2/3x3) matrices procrustes and dimension annealing need.
#[derive(Debug, Clone, Copy, Default)]
pub struct NalgebraSvd;

impl Svd for NalgebraSvd {
    fn svd(&self, matrix: &nalgebra::DMatrix<f64>) -> (nalgebra::DMatrix<f64>, Vec<f64>, nalgebra::DMatrix<f64>) {
        let svd = nalgebra::linalg::SVD::new(matrix.clone(), true, true);
        let u = svd.u.expect("SVD requested u");
        let v_t = svd.v_t.expect("SVD requested v_t");
        let singular_values = svd.singular_values.iter().copied().collect();
        (u, singular_values, v_t)
    }
}
