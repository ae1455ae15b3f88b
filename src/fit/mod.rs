//! # Curve Fitting
//!
//! Per-pixel S-curve estimation for threshold scans: initial guess from the occupancy
//! curve, a two-parameter Levenberg-Marquardt refinement, and a fixed-size thread pool
//! the per-pixel fits are fanned out to.

pub mod lm;
pub mod pool;
pub mod scurve;

use serde::{Deserialize, Serialize};

pub use pool::FitPool;
pub use scurve::{FitCounters, ValidBins, analyze_bins, fit_fragment};

/// Outcome reported by the solver for one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    /// Iteration limit reached before the convergence criteria were met.
    Exhausted,
    /// Damping grew without finding a better point.
    Trapped,
    /// Normal equations could not be solved (a parameter has no influence on the residuals).
    SingularOrZero,
}

/// Fitter settings taken from the `fitter` configuration section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    /// Pool size; 0 means one thread per logical CPU.
    pub threads: usize,
    pub max_iterations: usize,
    /// Treat converged fits with a negative mean as failures.
    pub reject_negative_mean: bool,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_iterations: 100,
            reject_negative_mean: true,
        }
    }
}

impl FitterConfig {
    pub fn thread_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}
