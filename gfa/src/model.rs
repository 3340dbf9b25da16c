//! Mean-field variational inference for the GFA model.
//!
//! One update cycle runs, in fixed order: loading posteriors (per
//! group), the shared latent-factor posterior, the nested ARD point
//! estimate, and the per-group noise-precision posteriors. Each step
//! is an exact conditional update except the ARD step, which is a
//! quasi-Newton point estimate (see [`crate::ard`]).

use crate::ard::{optimize_ard, ArdBasis, ArdConfig, ArdOutcome};
use crate::common::*;

use gfa_param::{GammaVec, GaussianMatrix};
use gfa_util::dmatrix_util::{concatenate_horizontal, rnorm_with, trace_product};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Options for one GFA fit.
#[derive(Debug, Clone)]
pub struct GfaOptions {
    /// Rank of the bilinear ARD reparametrization. Default: 4
    pub rank: usize,
    /// Number of shared latent factors. Default: 7
    pub factors: usize,
    /// Maximum number of update cycles. Default: 1000
    pub max_iter: usize,
    /// L2 precision on the ARD factor matrices. Default: 0.1
    pub lamb: f64,
    /// Noise-precision Gamma prior shape. Default: 1e-14
    pub a0: f64,
    /// Noise-precision Gamma prior rate. Default: 1e-14
    pub b0: f64,
    /// Convergence tolerance on the bound delta. Default: 1e-2
    pub tol: f64,
    /// Noise precision assumed during the bootstrap cycle. Default: 1e3
    pub init_tau: f64,
    /// Random seed; restarts must supply distinct seeds. Default: 42
    pub seed: u64,
    /// Nested ARD solver settings
    pub ard: ArdConfig,
    /// Abort the fit when the nested solver does not converge. Default: false
    pub strict_ard: bool,
    /// Hand a parameter snapshot to the per-cycle observer. Default: false
    pub snapshot_params: bool,
}

impl Default for GfaOptions {
    fn default() -> Self {
        GfaOptions {
            rank: 4,
            factors: 7,
            max_iter: 1000,
            lamb: 0.1,
            a0: 1e-14,
            b0: 1e-14,
            tol: 1e-2,
            init_tau: 1e3,
            seed: 42,
            ard: ArdConfig::default(),
            strict_ard: false,
            snapshot_params: false,
        }
    }
}

/// How a fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Bound delta fell below the tolerance
    Converged,
    /// Update-cycle cap exhausted; parameters are still valid
    MaxIterReached,
    /// Cooperative cancellation; parameters reflect the last full cycle
    Cancelled,
}

/// Shared flag checked between update cycles and between restarts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Expectation estimates frozen at the end of a fit.
#[derive(Debug, Clone)]
pub struct GfaParameters {
    /// Concatenated loading means, factors x total variables
    pub loading: Mat,
    /// Latent factor means, factors x samples
    pub latent: Mat,
    /// Per-group noise-precision expectations
    pub noise_precision: DVec,
    /// ARD precisions, groups x factors
    pub alpha: Mat,
}

/// Append-only training diagnostics, kept apart from the parameters.
#[derive(Debug, Clone)]
pub struct FitDiagnostics {
    /// One bound value per completed update cycle
    pub bound_trace: Vec<f64>,
    pub termination: Termination,
    /// Completed update cycles, bootstrap included
    pub cycles: usize,
    /// Nested solves that ended without converging
    pub ard_failures: usize,
}

/// Per-cycle report handed to the observer callback.
#[derive(Debug, Clone)]
pub struct CycleInfo {
    pub cycle: usize,
    pub bound: f64,
    /// Change against the previous cycle; `None` for the bootstrap cycle
    pub delta: Option<f64>,
    /// Present when [`GfaOptions::snapshot_params`] is set
    pub params: Option<GfaParameters>,
}

/// A finished fit: immutable parameters plus diagnostics.
#[derive(Debug, Clone)]
pub struct GfaFit {
    params: GfaParameters,
    diagnostics: FitDiagnostics,
}

impl GfaFit {
    pub fn params(&self) -> &GfaParameters {
        &self.params
    }

    pub fn diagnostics(&self) -> &FitDiagnostics {
        &self.diagnostics
    }

    /// Concatenated loading matrix, factors x total variables
    pub fn loading(&self) -> &Mat {
        &self.params.loading
    }

    /// Latent factor matrix, factors x samples
    pub fn latent(&self) -> &Mat {
        &self.params.latent
    }

    /// Noise-precision expectation for one group
    pub fn noise_precision(&self, group: usize) -> f64 {
        self.params.noise_precision[group]
    }

    pub fn bound_trace(&self) -> &[f64] {
        &self.diagnostics.bound_trace
    }

    /// The last bound in the trace
    pub fn final_bound(&self) -> f64 {
        *self
            .diagnostics
            .bound_trace
            .last()
            .expect("a finished fit always has a bound trace")
    }

    pub fn termination(&self) -> Termination {
        self.diagnostics.termination
    }
}

/// The GFA inference engine. One instance fits many datasets; every
/// `fit` call builds fresh state from the configured seed.
pub struct Gfa {
    opts: GfaOptions,
}

impl Gfa {
    pub fn new(opts: GfaOptions) -> Self {
        Gfa { opts }
    }

    pub fn options(&self) -> &GfaOptions {
        &self.opts
    }

    /// Fit the model to `data` (variables x samples) partitioned into
    /// row blocks of the given sizes.
    pub fn fit(&self, data: &Mat, group_dims: &[usize]) -> anyhow::Result<GfaFit> {
        self.fit_observed(data, group_dims, None, &mut |_| {})
    }

    pub fn fit_with_cancel(
        &self,
        data: &Mat,
        group_dims: &[usize],
        cancel: Option<&CancelToken>,
    ) -> anyhow::Result<GfaFit> {
        self.fit_observed(data, group_dims, cancel, &mut |_| {})
    }

    /// Full-control fit: cooperative cancellation between cycles and a
    /// per-cycle observer decoupled from the update math.
    pub fn fit_observed(
        &self,
        data: &Mat,
        group_dims: &[usize],
        cancel: Option<&CancelToken>,
        observer: &mut dyn FnMut(&CycleInfo),
    ) -> anyhow::Result<GfaFit> {
        let opts = &self.opts;

        // caller-contract checks before any state is built
        if group_dims.is_empty() {
            anyhow::bail!("no groups given");
        }
        if group_dims.iter().any(|&d| d == 0) {
            anyhow::bail!("group sizes must be positive");
        }
        let total: usize = group_dims.iter().sum();
        if total != data.nrows() {
            anyhow::bail!(
                "group sizes sum to {} but the data has {} rows",
                total,
                data.nrows()
            );
        }
        if data.ncols() == 0 {
            anyhow::bail!("no samples in the data");
        }

        let mut rng = SmallRng::seed_from_u64(opts.seed);
        let mut state = GfaState::init(data, group_dims, opts, &mut rng);

        let mut ard_failures = 0;
        let mut track_ard = |outcome: &ArdOutcome| -> anyhow::Result<()> {
            if !outcome.converged {
                ard_failures += 1;
                if opts.strict_ard {
                    anyhow::bail!(
                        "ARD optimization did not converge after {} iterations",
                        outcome.iterations
                    );
                }
            }
            Ok(())
        };

        // bootstrap cycle: steps 1-2 use the configured init_tau
        // because the Gamma rate is not defined yet
        let ard = state.update_cycle(&opts.ard)?;
        track_ard(&ard)?;

        let mut trace = vec![state.bound()];
        observer(&self.cycle_info(&state, 0, trace[0], None)?);

        let mut termination = Termination::MaxIterReached;
        for i in 0..opts.max_iter {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                termination = Termination::Cancelled;
                break;
            }

            let ard = state.update_cycle(&opts.ard)?;
            track_ard(&ard)?;

            let bound = state.bound();
            let prev = *trace.last().unwrap();
            trace.push(bound);

            if !bound.is_finite() {
                warn!("non-finite bound at cycle {}", i + 1);
            }
            let delta = bound - prev;
            if delta < -1e-6 * (1.0 + prev.abs()) {
                warn!("bound decreased by {:.3e} at cycle {}", -delta, i + 1);
            }

            observer(&self.cycle_info(&state, i + 1, bound, Some(delta))?);

            if delta.abs() < opts.tol {
                termination = Termination::Converged;
                break;
            }
        }

        let cycles = trace.len();
        match termination {
            Termination::Converged => {
                info!("converged after {} cycles", cycles)
            }
            Termination::MaxIterReached => {
                warn!("reached the maximum number of update cycles")
            }
            Termination::Cancelled => {
                warn!("fit cancelled after {} cycles", cycles)
            }
        }

        Ok(GfaFit {
            params: state.snapshot()?,
            diagnostics: FitDiagnostics {
                bound_trace: trace,
                termination,
                cycles,
                ard_failures,
            },
        })
    }

    fn cycle_info(
        &self,
        state: &GfaState,
        cycle: usize,
        bound: f64,
        delta: Option<f64>,
    ) -> anyhow::Result<CycleInfo> {
        let params = if self.opts.snapshot_params {
            Some(state.snapshot()?)
        } else {
            None
        };
        Ok(CycleInfo {
            cycle,
            bound,
            delta,
            params,
        })
    }
}

/// All mutable inference state for one fit.
struct GfaState {
    group_dims: Vec<usize>,
    group_dims_f: DVec,
    x_groups: Vec<Mat>, // d_m x N row blocks, contiguous and disjoint
    num_samples: usize,
    num_variables: usize,
    factors: usize,
    lamb: f64,
    basis: ArdBasis,
    alpha: Mat, // groups x factors
    loading: Vec<GaussianMatrix>,
    latent: GaussianMatrix,
    noise: GammaVec,
    /// `Some(init_tau)` until the first noise update defines the rate
    bootstrap_tau: Option<f64>,
}

impl GfaState {
    fn init(data: &Mat, group_dims: &[usize], opts: &GfaOptions, rng: &mut SmallRng) -> Self {
        let groups = group_dims.len();
        let num_samples = data.ncols();
        let num_variables = data.nrows();
        let kk = opts.factors;

        // contiguous, non-overlapping row blocks
        let mut x_groups = Vec::with_capacity(groups);
        let mut lb = 0;
        for &dm in group_dims {
            x_groups.push(data.rows(lb, dm).into_owned());
            lb += dm;
        }

        let basis = ArdBasis::random(groups, kk, opts.rank, rng);

        // alpha starts from the per-group data variance, not from the
        // random basis; the first ARD solve reconciles the two
        let datavar: Vec<f64> = x_groups.iter().map(|x| variance(x).max(1e-12)).collect();
        let alpha = Mat::from_fn(groups, kk, |m, _| kk as f64 / datavar[m]);

        let mut noise = GammaVec::new(groups, opts.a0, opts.b0);
        let shape_stat = DVec::from_fn(groups, |m, _| {
            group_dims[m] as f64 * num_samples as f64 / 2.0
        });
        noise.update_shape_stat(&shape_stat);
        noise.reset_rate_to_shape();
        noise.calibrate();

        let latent = GaussianMatrix::new(rnorm_with(kk, num_samples, rng));
        let loading = group_dims
            .iter()
            .map(|&dm| GaussianMatrix::new(Mat::zeros(kk, dm)))
            .collect();

        GfaState {
            group_dims: group_dims.to_vec(),
            group_dims_f: DVec::from_fn(groups, |m, _| group_dims[m] as f64),
            x_groups,
            num_samples,
            num_variables,
            factors: kk,
            lamb: opts.lamb,
            basis,
            alpha,
            loading,
            latent,
            noise,
            bootstrap_tau: Some(opts.init_tau),
        }
    }

    fn groups(&self) -> usize {
        self.group_dims.len()
    }

    /// Noise-precision expectation; the bootstrap constant stands in
    /// until the first rate update
    fn tau(&self, m: usize) -> f64 {
        self.bootstrap_tau
            .unwrap_or_else(|| self.noise.posterior_mean()[m])
    }

    fn update_cycle(&mut self, ard: &ArdConfig) -> anyhow::Result<ArdOutcome> {
        self.update_loading()?;
        self.update_latent()?;
        let outcome = self.update_alpha(ard)?;
        self.update_noise();
        Ok(outcome)
    }

    /// Ridge-style Gaussian posterior per group, conditioned on the
    /// current latent second moment and ARD precisions
    fn update_loading(&mut self) -> anyhow::Result<()> {
        let e_zz = self.latent.second_moment();
        for m in 0..self.groups() {
            let tau_m = self.tau(m);
            let mut precision = &e_zz * tau_m;
            for k in 0..self.factors {
                precision[(k, k)] += self.alpha[(m, k)];
            }
            let rhs = self.latent.mean() * self.x_groups[m].transpose() * tau_m;
            self.loading[m].update_from_precision(precision, &rhs)?;
        }
        Ok(())
    }

    fn update_latent(&mut self) -> anyhow::Result<()> {
        let kk = self.factors;
        let mut precision = Mat::identity(kk, kk);
        let mut rhs = Mat::zeros(kk, self.num_samples);
        for m in 0..self.groups() {
            let tau_m = self.tau(m);
            precision += self.loading[m].second_moment() * tau_m;
            rhs += self.loading[m].mean() * &self.x_groups[m] * tau_m;
        }
        self.latent.update_from_precision(precision, &rhs)
    }

    fn update_alpha(&mut self, config: &ArdConfig) -> anyhow::Result<ArdOutcome> {
        let wsq = self.loading_second_moment_diag();
        let outcome = optimize_ard(&self.basis, &self.group_dims_f, &wsq, self.lamb, config)?;
        self.basis = outcome.basis.clone();
        self.alpha = self.basis.alpha();
        Ok(outcome)
    }

    fn update_noise(&mut self) {
        let rate_stat = DVec::from_fn(self.groups(), |m, _| 0.5 * self.expected_residual(m));
        self.noise.update_rate_stat(&rate_stat);
        self.noise.calibrate();
        self.bootstrap_tau = None;
    }

    /// `sum_i E[(x_i - W' z_i)^2]` for one group: the plain squared
    /// reconstruction error plus both posterior-covariance cross terms
    fn expected_residual(&self, m: usize) -> f64 {
        let w = &self.loading[m];
        let z = &self.latent;
        let z_mean_sq = z.mean() * z.mean().transpose();
        trace_product(&w.second_moment(), &z.covariance_total())
            + trace_product(&w.covariance_total(), &z_mean_sq)
            + (w.mean().transpose() * z.mean() - &self.x_groups[m]).norm_squared()
    }

    /// Diagonals of the per-group loading second moments, groups x factors
    fn loading_second_moment_diag(&self) -> Mat {
        let mut ret = Mat::zeros(self.groups(), self.factors);
        for m in 0..self.groups() {
            let ww = self.loading[m].second_moment();
            for k in 0..self.factors {
                ret[(m, k)] = ww[(k, k)];
            }
        }
        ret
    }

    /// Evidence lower bound under the current posteriors; constants
    /// shared across calls are kept so traces are comparable between
    /// restarts
    fn bound(&self) -> f64 {
        let nn = self.num_samples as f64;
        let kk = self.factors as f64;
        let ln_2pi = (2.0 * PI).ln();

        let e_logtau = self.noise.posterior_log_mean();

        let p_x: f64 = (0..self.groups())
            .map(|m| {
                let dm = self.group_dims_f[m];
                nn * dm / 2.0 * (e_logtau[m] - ln_2pi)
                    - self.tau(m) / 2.0 * self.expected_residual(m)
            })
            .sum();

        let p_z = -nn * kk / 2.0 * ln_2pi - 0.5 * self.latent.second_moment().trace();

        let p_tau = self.noise.log_prior();

        let wsq = self.loading_second_moment_diag();
        let ln_alpha_sum: f64 = (0..self.groups())
            .map(|m| {
                self.group_dims_f[m] * (0..self.factors).map(|k| self.alpha[(m, k)].ln()).sum::<f64>()
            })
            .sum();
        let p_w = 0.5
            * (ln_alpha_sum
                - kk * self.num_variables as f64 * ln_2pi
                - self.alpha.component_mul(&wsq).sum());

        let gg = self.groups() as f64;
        let rr = self.basis.rank() as f64;
        let p_u = gg * rr / 2.0 * (self.lamb.ln() - ln_2pi)
            - self.lamb / 2.0 * self.basis.row_factors().norm_squared();
        let p_v = kk * rr / 2.0 * (self.lamb.ln() - ln_2pi)
            - self.lamb / 2.0 * self.basis.col_factors().norm_squared();

        let entropy = self.latent.entropy()
            + self.noise.entropy()
            + self.loading.iter().map(|w| w.entropy()).sum::<f64>();

        p_x + p_z + p_tau + p_w + p_u + p_v + entropy
    }

    fn snapshot(&self) -> anyhow::Result<GfaParameters> {
        let means: Vec<&Mat> = self.loading.iter().map(|w| w.mean()).collect();
        Ok(GfaParameters {
            loading: concatenate_horizontal(&means)?,
            latent: self.latent.mean().clone(),
            noise_precision: DVec::from_fn(self.groups(), |m, _| self.tau(m)),
            alpha: self.alpha.clone(),
        })
    }
}

/// Population variance of all entries of a matrix
fn variance(x: &Mat) -> f64 {
    let n = (x.nrows() * x.ncols()) as f64;
    let mean = x.sum() / n;
    x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variance_of_constant_matrix_is_zero() {
        let x = Mat::from_element(3, 4, 2.5);
        assert!(variance(&x).abs() < 1e-12);
    }

    #[test]
    fn group_size_validation_fails_fast() {
        let data = Mat::zeros(6, 10);
        let gfa = Gfa::new(GfaOptions::default());

        assert!(gfa.fit(&data, &[]).is_err());
        assert!(gfa.fit(&data, &[2, 0, 4]).is_err());
        assert!(gfa.fit(&data, &[2, 3]).is_err());
        assert!(gfa.fit(&data, &[2, 3, 2]).is_err());
    }

    #[test]
    fn row_partition_is_contiguous_and_disjoint() {
        // encode the row index in the data so block membership is visible
        let data = Mat::from_fn(9, 3, |i, _| i as f64);
        let dims = [2usize, 4, 3];
        let opts = GfaOptions::default();
        let mut rng = SmallRng::seed_from_u64(opts.seed);
        let state = GfaState::init(&data, &dims, &opts, &mut rng);

        assert_eq!(state.x_groups.len(), 3);
        let mut next_row = 0.0;
        for (m, &dm) in dims.iter().enumerate() {
            let x = &state.x_groups[m];
            assert_eq!(x.nrows(), dm);
            assert_eq!(x.ncols(), 3);
            for i in 0..dm {
                assert_eq!(x[(i, 0)], next_row);
                next_row += 1.0;
            }
        }
        assert_eq!(next_row as usize, 9);
    }

    #[test]
    fn prior_noise_precision_expectation_is_one() {
        // shape == rate right after initialization
        let data = Mat::from_fn(4, 8, |i, j| ((i * 7 + j * 3) % 5) as f64);
        let opts = GfaOptions::default();
        let mut rng = SmallRng::seed_from_u64(1);
        let state = GfaState::init(&data, &[4], &opts, &mut rng);

        assert!((state.noise.posterior_mean()[0] - 1.0).abs() < 1e-12);
        // but steps 1-2 of the bootstrap cycle still see init_tau
        assert_eq!(state.tau(0), opts.init_tau);
    }
}
