//! Group Factor Analysis (GFA) by mean-field variational Bayes.
//!
//! Several co-observed data groups (views) share one latent factor
//! representation; per-group-per-factor ARD precisions decide which
//! factors each group actually uses. Inference alternates closed-form
//! coordinate-ascent updates of the loading, factor, and noise
//! posteriors with a nested quasi-Newton point estimate of the
//! low-rank ARD reparametrization.

pub mod ard;
pub mod common;
pub mod model;
pub mod restart;
pub mod simulate;

pub use ard::{ArdBasis, ArdConfig, ArdOutcome, LineSearch};
pub use model::{
    CancelToken, CycleInfo, FitDiagnostics, Gfa, GfaFit, GfaOptions, GfaParameters, Termination,
};
pub use restart::{fit_restarts, RestartOutcome};
