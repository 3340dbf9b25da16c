//! Nested point estimate of the ARD precision reparametrization.
//!
//! The per-group-per-factor precision matrix is `alpha = exp(U V' +
//! u 1' + 1 v')`, a low-rank bilinear form kept as a point estimate
//! inside the otherwise fully variational outer loop. Given fixed
//! loading second-moments, the alpha-dependent slice of the lower
//! bound is maximized with L-BFGS using the analytic gradient.

use crate::common::*;

use argmin::core::{CostFunction, Executor, Gradient, IterState, State};
use argmin::core::{TerminationReason, TerminationStatus};
use argmin::solver::linesearch::{HagerZhangLineSearch, MoreThuenteLineSearch};
use argmin::solver::quasinewton::LBFGS;
use gfa_util::dmatrix_util::{flatten_matrices, rnorm_with, split_and_reshape};
use rand::Rng;

/// Flat parameter vector handed to the solver
pub type Theta = Vec<f64>;

type LbfgsMoreThuente = LBFGS<MoreThuenteLineSearch<Theta, Theta, f64>, Theta, Theta, f64>;
type LbfgsHagerZhang = LBFGS<HagerZhangLineSearch<Theta, Theta, f64>, Theta, Theta, f64>;

const LBFGS_MEM: usize = 7;

/// Line-search strategy for the nested L-BFGS solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSearch {
    #[default]
    MoreThuente,
    HagerZhang,
}

/// Solver configuration, each knob independent of the others
#[derive(Debug, Clone)]
pub struct ArdConfig {
    pub line_search: LineSearch,
    /// Iteration cap for one nested solve
    pub max_iter: u64,
    /// Cost-change tolerance
    pub ftol: f64,
}

impl Default for ArdConfig {
    fn default() -> Self {
        ArdConfig {
            line_search: LineSearch::default(),
            max_iter: 100_000,
            ftol: 1e10 * f64::EPSILON,
        }
    }
}

/// Low-rank bilinear parametrization of the ARD precisions.
///
/// `alpha[m,k] = exp(row_factors[m,:] . col_factors[k,:] +
/// row_bias[m] + col_bias[k])`, strictly positive by construction.
/// The two bias terms are kept as single-column matrices so the whole
/// estimate flattens into one solver vector and back.
#[derive(Debug, Clone)]
pub struct ArdBasis {
    row_factors: Mat, // groups x rank
    col_factors: Mat, // factors x rank
    row_bias: Mat,    // groups x 1
    col_bias: Mat,    // factors x 1
}

impl ArdBasis {
    /// Standard-normal factor matrices, zero biases
    pub fn random<R: Rng>(groups: usize, factors: usize, rank: usize, rng: &mut R) -> Self {
        Self {
            row_factors: rnorm_with(groups, rank, rng),
            col_factors: rnorm_with(factors, rank, rng),
            row_bias: Mat::zeros(groups, 1),
            col_bias: Mat::zeros(factors, 1),
        }
    }

    pub fn ln_alpha(&self) -> Mat {
        let mut ret = &self.row_factors * self.col_factors.transpose();
        for j in 0..ret.ncols() {
            for i in 0..ret.nrows() {
                ret[(i, j)] += self.row_bias[(i, 0)] + self.col_bias[(j, 0)];
            }
        }
        ret
    }

    pub fn alpha(&self) -> Mat {
        self.ln_alpha().map(f64::exp)
    }

    pub fn row_factors(&self) -> &Mat {
        &self.row_factors
    }

    pub fn col_factors(&self) -> &Mat {
        &self.col_factors
    }

    pub fn groups(&self) -> usize {
        self.row_factors.nrows()
    }

    pub fn factors(&self) -> usize {
        self.col_factors.nrows()
    }

    pub fn rank(&self) -> usize {
        self.row_factors.ncols()
    }

    fn shapes(&self) -> [(usize, usize); 4] {
        [
            (self.groups(), self.rank()),
            (self.factors(), self.rank()),
            (self.groups(), 1),
            (self.factors(), 1),
        ]
    }

    fn to_theta(&self) -> Theta {
        flatten_matrices(&[
            &self.row_factors,
            &self.col_factors,
            &self.row_bias,
            &self.col_bias,
        ])
    }

    fn from_theta(theta: &[f64], shapes: &[(usize, usize); 4]) -> anyhow::Result<Self> {
        let [row_factors, col_factors, row_bias, col_bias] =
            <[Mat; 4]>::try_from(split_and_reshape(theta, shapes)?)
                .map_err(|_| anyhow::anyhow!("expected four parameter blocks"))?;
        Ok(Self {
            row_factors,
            col_factors,
            row_bias,
            col_bias,
        })
    }
}

/// Result of one nested solve. `converged` is the solver's own
/// verdict; the caller decides whether a non-success aborts the fit.
#[derive(Debug, Clone)]
pub struct ArdOutcome {
    pub basis: ArdBasis,
    pub converged: bool,
    pub iterations: u64,
    pub final_cost: f64,
}

/// The alpha-dependent slice of the lower bound, negated and halved,
/// as a function of the flattened basis
struct ArdProblem<'a> {
    group_dims: &'a DVec,       // groups
    loading_sq_diag: &'a Mat,   // groups x factors
    lamb: f64,
    shapes: [(usize, usize); 4],
}

impl CostFunction for ArdProblem<'_> {
    type Param = Theta;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let basis = ArdBasis::from_theta(theta, &self.shapes)?;
        let ln_alpha = basis.ln_alpha();

        let mut bound = 0.0;
        for k in 0..ln_alpha.ncols() {
            for m in 0..ln_alpha.nrows() {
                bound += self.group_dims[m] * ln_alpha[(m, k)]
                    - self.loading_sq_diag[(m, k)] * ln_alpha[(m, k)].exp();
            }
        }
        bound -= self.lamb
            * (basis.row_factors.norm_squared() + basis.col_factors.norm_squared());

        let cost = -bound / 2.0;
        if !cost.is_finite() {
            return Err(anyhow::anyhow!("non-finite ARD objective: {}", cost));
        }
        Ok(cost)
    }
}

impl Gradient for ArdProblem<'_> {
    type Param = Theta;
    type Gradient = Theta;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let basis = ArdBasis::from_theta(theta, &self.shapes)?;
        let alpha = basis.alpha();

        // residual[m,k] = D_m - alpha[m,k] * E[w w']_kk
        let mut residual = alpha.component_mul(self.loading_sq_diag);
        for k in 0..residual.ncols() {
            for m in 0..residual.nrows() {
                residual[(m, k)] = self.group_dims[m] - residual[(m, k)];
            }
        }

        let grad_row = -(&residual * &basis.col_factors
            - &basis.row_factors * (2.0 * self.lamb))
            / 2.0;
        let grad_col = -(residual.transpose() * &basis.row_factors
            - &basis.col_factors * (2.0 * self.lamb))
            / 2.0;
        let grad_row_bias = Mat::from_column_slice(
            residual.nrows(),
            1,
            (-residual.column_sum() / 2.0).as_slice(),
        );
        let grad_col_bias = Mat::from_column_slice(
            residual.ncols(),
            1,
            (-residual.row_sum().transpose() / 2.0).as_slice(),
        );

        let grad = flatten_matrices(&[&grad_row, &grad_col, &grad_row_bias, &grad_col_bias]);
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(anyhow::anyhow!("non-finite ARD gradient"));
        }
        Ok(grad)
    }
}

/// Maximize the alpha slice of the bound starting from the current
/// basis. Solver failure falls back to the starting basis with
/// `converged = false`; it never takes the caller down with it.
pub fn optimize_ard(
    basis: &ArdBasis,
    group_dims: &DVec,
    loading_sq_diag: &Mat,
    lamb: f64,
    config: &ArdConfig,
) -> anyhow::Result<ArdOutcome> {
    let shapes = basis.shapes();
    let problem = ArdProblem {
        group_dims,
        loading_sq_diag,
        lamb,
        shapes,
    };
    let x0 = basis.to_theta();

    let run = match config.line_search {
        LineSearch::MoreThuente => {
            let solver: LbfgsMoreThuente = LBFGS::new(MoreThuenteLineSearch::new(), LBFGS_MEM)
                .with_tolerance_cost(config.ftol)?;
            run_lbfgs(problem, solver, x0, config.max_iter)
        }
        LineSearch::HagerZhang => {
            let solver: LbfgsHagerZhang = LBFGS::new(HagerZhangLineSearch::new(), LBFGS_MEM)
                .with_tolerance_cost(config.ftol)?;
            run_lbfgs(problem, solver, x0, config.max_iter)
        }
    };

    match run {
        Ok((best, converged, iterations, final_cost)) => Ok(ArdOutcome {
            basis: ArdBasis::from_theta(&best, &shapes)?,
            converged,
            iterations,
            final_cost,
        }),
        Err(e) => {
            warn!("ARD solver failed: {}", e);
            Ok(ArdOutcome {
                basis: basis.clone(),
                converged: false,
                iterations: 0,
                final_cost: f64::NAN,
            })
        }
    }
}

fn run_lbfgs<'a, S>(
    problem: ArdProblem<'a>,
    solver: S,
    x0: Theta,
    max_iter: u64,
) -> anyhow::Result<(Theta, bool, u64, f64)>
where
    S: argmin::core::Solver<ArdProblem<'a>, IterState<Theta, Theta, (), (), (), f64>> + Send,
{
    let executor = Executor::new(problem, solver)
        .configure(|state| state.param(x0).max_iters(max_iter));

    let mut state = executor.run()?.state().clone();
    let iterations = state.get_iter();
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    );
    let final_cost = state.get_best_cost();
    let best = state
        .take_best_param()
        .ok_or(anyhow::anyhow!("solver returned no parameters"))?;
    Ok((best, converged, iterations, final_cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn toy_problem() -> (ArdBasis, DVec, Mat) {
        let mut rng = SmallRng::seed_from_u64(7);
        let basis = ArdBasis::random(3, 4, 2, &mut rng);
        let group_dims = DVec::from_vec(vec![2.0, 5.0, 3.0]);
        let wsq = Mat::from_fn(3, 4, |m, k| 0.5 + (m + k) as f64);
        (basis, group_dims, wsq)
    }

    #[test]
    fn theta_roundtrip() -> anyhow::Result<()> {
        let (basis, _, _) = toy_problem();
        let theta = basis.to_theta();
        let back = ArdBasis::from_theta(&theta, &basis.shapes())?;
        assert_eq!(basis.row_factors(), back.row_factors());
        assert_eq!(basis.col_factors(), back.col_factors());
        Ok(())
    }

    #[test]
    fn analytic_gradient_matches_finite_difference() -> anyhow::Result<()> {
        let (basis, group_dims, wsq) = toy_problem();
        let problem = ArdProblem {
            group_dims: &group_dims,
            loading_sq_diag: &wsq,
            lamb: 0.1,
            shapes: basis.shapes(),
        };

        let theta = basis.to_theta();
        let grad = problem.gradient(&theta)?;

        let h = 1e-6;
        for i in 0..theta.len() {
            let mut hi = theta.clone();
            let mut lo = theta.clone();
            hi[i] += h;
            lo[i] -= h;
            let fd = (problem.cost(&hi)? - problem.cost(&lo)?) / (2.0 * h);
            assert_relative_eq!(grad[i], fd, epsilon = 1e-4, max_relative = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn optimizer_improves_the_objective() -> anyhow::Result<()> {
        let (basis, group_dims, wsq) = toy_problem();
        let config = ArdConfig {
            max_iter: 200,
            ..Default::default()
        };

        let problem = ArdProblem {
            group_dims: &group_dims,
            loading_sq_diag: &wsq,
            lamb: 0.1,
            shapes: basis.shapes(),
        };
        let before = problem.cost(&basis.to_theta())?;

        let out = optimize_ard(&basis, &group_dims, &wsq, 0.1, &config)?;
        let after = problem.cost(&out.basis.to_theta())?;

        assert!(after <= before + 1e-9);
        assert!(out.basis.alpha().iter().all(|&a| a > 0.0));
        Ok(())
    }

    #[test]
    fn stationary_point_of_unpenalized_slice() -> anyhow::Result<()> {
        // at any stationary point the row-bias gradient vanishes:
        // sum_k alpha[m,k] * wsq[m,k] == K * D_m for every group
        let (_, group_dims, wsq) = toy_problem();
        let mut rng = SmallRng::seed_from_u64(13);
        let basis = ArdBasis::random(3, 4, 1, &mut rng);

        let out = optimize_ard(&basis, &group_dims, &wsq, 0.0, &ArdConfig::default())?;
        let alpha = out.basis.alpha();
        for m in 0..3 {
            // zero row-bias gradient: sum_k (D_m - alpha * wsq) == 0
            let fitted: f64 = (0..4).map(|k| alpha[(m, k)] * wsq[(m, k)]).sum();
            assert_relative_eq!(fitted, 4.0 * group_dims[m], max_relative = 1e-2);
        }
        Ok(())
    }
}
