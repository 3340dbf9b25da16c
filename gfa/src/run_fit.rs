use gfa::common::*;
use gfa::model::{CycleInfo, GfaOptions};
use gfa::restart::fit_restarts;
use gfa::simulate::{simulate, SimulateConfig};
use gfa::{ArdConfig, LineSearch};

use clap::{Parser, ValueEnum};
use gfa_util::dmatrix_io::{read_tsv, write_tsv};
use gfa_util::dmatrix_util::DMatrix;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum LineSearchArg {
    MoreThuente,
    HagerZhang,
}

impl From<LineSearchArg> for LineSearch {
    fn from(arg: LineSearchArg) -> Self {
        match arg {
            LineSearchArg::MoreThuente => LineSearch::MoreThuente,
            LineSearchArg::HagerZhang => LineSearch::HagerZhang,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct FitArgs {
    /// data file: tab-separated matrix of variables x samples
    #[arg(required = true)]
    data_file: Box<str>,

    /// group sizes (comma-separated); must sum to the variable count
    #[arg(long, short = 'g', value_delimiter(','), required = true)]
    group_sizes: Vec<usize>,

    /// number of latent factors
    #[arg(long, short = 'k', default_value_t = 7)]
    factors: usize,

    /// rank of the ARD reparametrization
    #[arg(long, short = 'r', default_value_t = 4)]
    rank: usize,

    /// maximum number of update cycles
    #[arg(long, default_value_t = 1000)]
    max_iter: usize,

    /// L2 precision on the ARD factor matrices
    #[arg(long, default_value_t = 0.1)]
    lamb: f64,

    /// hyperparameter a0 in Gamma(a0,b0) noise prior
    #[arg(long, default_value_t = 1e-14)]
    a0: f64,

    /// hyperparameter b0 in Gamma(a0,b0) noise prior
    #[arg(long, default_value_t = 1e-14)]
    b0: f64,

    /// convergence tolerance on the bound delta
    #[arg(long, default_value_t = 1e-2)]
    tol: f64,

    /// noise precision assumed during the bootstrap cycle
    #[arg(long, default_value_t = 1e3)]
    init_tau: f64,

    /// number of independently initialized restarts
    #[arg(long, short = 'n', default_value_t = 5)]
    restarts: usize,

    /// random seed; restart i runs with seed + i
    #[arg(long, short = 's', default_value_t = 42)]
    seed: u64,

    /// line search used by the nested ARD solver
    #[arg(long, value_enum, default_value_t = LineSearchArg::MoreThuente)]
    ard_line_search: LineSearchArg,

    /// iteration cap of the nested ARD solver
    #[arg(long, default_value_t = 100_000)]
    ard_max_iter: u64,

    /// cost tolerance of the nested ARD solver
    #[arg(long, default_value_t = 1e10 * f64::EPSILON)]
    ard_ftol: f64,

    /// abort a fit when the nested ARD solver does not converge
    #[arg(long, default_value_t = false)]
    strict_ard: bool,

    /// output header: writes {out}.loading.tsv, {out}.latent.tsv,
    /// {out}.tau.tsv, {out}.bound.tsv
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_gfa_fit(args: FitArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let data = read_tsv(&args.data_file)?;
    info!(
        "read {} variables x {} samples from {}",
        data.nrows(),
        data.ncols(),
        args.data_file
    );

    let opts = GfaOptions {
        rank: args.rank,
        factors: args.factors,
        max_iter: args.max_iter,
        lamb: args.lamb,
        a0: args.a0,
        b0: args.b0,
        tol: args.tol,
        init_tau: args.init_tau,
        seed: args.seed,
        ard: ArdConfig {
            line_search: args.ard_line_search.into(),
            max_iter: args.ard_max_iter,
            ftol: args.ard_ftol,
        },
        strict_ard: args.strict_ard,
        snapshot_params: false,
    };

    let best = if args.restarts == 1 {
        let fit = gfa::Gfa::new(opts).fit_observed(&data, &args.group_sizes, None, &mut log_cycle)?;
        info!(
            "{:?} after {} cycles, bound {:.4}",
            fit.termination(),
            fit.diagnostics().cycles,
            fit.final_bound()
        );
        fit
    } else {
        info!("fitting {} restarts...", args.restarts);
        let outcome = fit_restarts(&data, &args.group_sizes, &opts, args.restarts, None)?;
        info!(
            "best restart: {} ({:?} after {} cycles, bound {:.4})",
            outcome.best_index,
            outcome.best.termination(),
            outcome.best.diagnostics().cycles,
            outcome.best.final_bound()
        );
        outcome.best
    };

    write_tsv(best.loading(), &format!("{}.loading.tsv", args.out))?;
    write_tsv(best.latent(), &format!("{}.latent.tsv", args.out))?;

    let groups = args.group_sizes.len();
    let tau = DMatrix::from_fn(groups, 1, |m, _| best.noise_precision(m));
    write_tsv(&tau, &format!("{}.tau.tsv", args.out))?;

    let trace = best.bound_trace();
    let bounds = DMatrix::from_fn(trace.len(), 1, |i, _| trace[i]);
    write_tsv(&bounds, &format!("{}.bound.tsv", args.out))?;

    info!("Done");
    Ok(())
}

/// Logging observer for single-fit runs; reports every tenth cycle
fn log_cycle(cycle_info: &CycleInfo) {
    if cycle_info.cycle % 10 == 0 {
        info!(
            "cycle {}: bound {:.4}",
            cycle_info.cycle, cycle_info.bound
        );
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SimArgs {
    /// group sizes (comma-separated)
    #[arg(long, short = 'g', value_delimiter(','), default_values_t = vec![7, 7, 7, 7])]
    group_sizes: Vec<usize>,

    /// number of samples
    #[arg(long, short = 'n', default_value_t = 30)]
    samples: usize,

    /// number of latent factors
    #[arg(long, short = 'k', default_value_t = 6)]
    factors: usize,

    /// probability that a factor is active in a group
    #[arg(long, default_value_t = 0.5)]
    activity: f64,

    /// noise precision shared by all groups
    #[arg(long, default_value_t = 10.0)]
    tau: f64,

    /// random seed
    #[arg(long, short = 's', default_value_t = 42)]
    seed: u64,

    /// output header: writes {out}.data.tsv, {out}.loading.tsv,
    /// {out}.latent.tsv
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_gfa_simulate(args: SimArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = SimulateConfig {
        group_dims: args.group_sizes.clone(),
        samples: args.samples,
        factors: args.factors,
        activity: args.activity,
        tau: args.tau,
        seed: args.seed,
    };

    let sim = simulate(&config)?;
    info!(
        "simulated {} variables x {} samples in {} groups",
        sim.data.nrows(),
        sim.data.ncols(),
        args.group_sizes.len()
    );

    write_tsv(&sim.data, &format!("{}.data.tsv", args.out))?;
    write_tsv(&sim.loading, &format!("{}.loading.tsv", args.out))?;
    write_tsv(&sim.latent, &format!("{}.latent.tsv", args.out))?;

    info!("Done");
    Ok(())
}
