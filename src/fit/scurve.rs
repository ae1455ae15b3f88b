//! S-curve model `occ(x) = 0.5·N·(2 − erfc((x − μ)/(σ·√2)))` and per-fragment fitting.

use std::f64::consts::{PI, SQRT_2};

use statrs::function::erf::erfc;
use tracing::info;

use crate::fragment::Fragment;

use super::lm::{self, CurveModel, LmConfig};
use super::{FitPool, FitStatus, FitterConfig};

/// Output written for pixels that could not be fitted.
pub const SENTINEL: f64 = -1.0;

/// `1/√6`: σ of the two-point closed form, per bin of separation.
const TWO_POINT_SIGMA: f64 = 0.408_248_290_463_863;

/// Bin range selected for fitting and the seeds derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidBins {
    pub start: usize,
    pub end: usize,
    pub valid: usize,
    pub start_sigma: usize,
    pub end_sigma: usize,
}

impl ValidBins {
    pub fn mean_seed(&self) -> f64 {
        (self.start + self.valid / 2) as f64
    }

    pub fn sigma_seed(&self) -> f64 {
        let sigma = (self.end_sigma as f64 - self.start_sigma as f64) / SQRT_2;
        if sigma > 0.0 { sigma } else { 1.0 }
    }
}

/// Locate the rising edge of an occupancy curve.
pub fn analyze_bins(curve: &[f64]) -> ValidBins {
    let size = curve.len();
    if size == 0 {
        return ValidBins {
            start: 0,
            end: 0,
            valid: 0,
            start_sigma: 0,
            end_sigma: 0,
        };
    }

    let start = curve
        .iter()
        .position(|&v| v != 0.0)
        .map_or(0, |first| first.saturating_sub(1));

    let plateau = 0.999 * curve[size - 1];
    let end = (start..size)
        .find(|&i| curve[i] >= plateau)
        .unwrap_or(size - 1);

    // Sigma bracket: first rising crossing after bin 0 and last bin still below each level.
    let low = 0.16 * curve[size - 1];
    let high = 0.84 * curve[size - 1];
    let lo1 = (1..size).find(|&k| curve[k] >= low).unwrap_or(0);
    let lo2 = (1..size).find(|&k| curve[k] >= high).unwrap_or(0);
    let hi1 = (0..size).rev().find(|&j| curve[j] <= low).unwrap_or(0);
    let hi2 = (0..size).rev().find(|&j| curve[j] <= high).unwrap_or(0);

    let start_sigma = ((lo1 + hi1) as f64 * 0.5) as usize;
    let end_sigma = ((lo2 + hi2) as f64 * 0.5) as usize;

    let valid = if end > start || (end == start && end != 0) {
        end - start + 1
    } else {
        0
    };

    ValidBins {
        start,
        end,
        valid,
        start_sigma,
        end_sigma,
    }
}

/// Cumulative-Gaussian response for `injections` pulses; parameters are `[μ, σ]`.
#[derive(Debug, Clone, Copy)]
pub struct SCurve {
    pub injections: f64,
}

impl CurveModel for SCurve {
    fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
        let z = (x - params[0]) / (params[1] * SQRT_2);
        0.5 * self.injections * (2.0 - erfc(z))
    }

    fn jacobian_row(&self, x: f64, params: &[f64; 2]) -> [f64; 2] {
        let sigma = params[1];
        let z = (x - params[0]) / (sigma * SQRT_2);
        let gauss = self.injections * (-z * z).exp();
        let d_mean = -gauss / (sigma * (2.0 * PI).sqrt());
        let d_sigma = -gauss * z / (sigma * PI.sqrt());
        [d_mean, d_sigma]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOutcome {
    Fitted(FitStatus),
    /// Converged to a negative mean.
    ConvergedBad,
    /// Exactly two valid bins: closed form, no solver run.
    ClosedForm,
    SinglePoint,
    Unfittable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelFit {
    pub mean: f64,
    pub sigma: f64,
    pub chi2: f64,
    pub outcome: PixelOutcome,
}

impl PixelFit {
    fn sentinel(outcome: PixelOutcome, chi2: f64) -> Self {
        Self {
            mean: SENTINEL,
            sigma: SENTINEL,
            chi2,
            outcome,
        }
    }
}

/// Fit one pixel's occupancy curve.
pub fn fit_pixel(curve: &[f64], injections: f64, config: &FitterConfig) -> PixelFit {
    let bins = analyze_bins(curve);
    match bins.valid {
        0 => PixelFit::sentinel(PixelOutcome::Unfittable, SENTINEL),
        1 => PixelFit::sentinel(PixelOutcome::SinglePoint, SENTINEL),
        2 => PixelFit {
            mean: (bins.start + bins.end) as f64 / 2.0,
            sigma: (bins.end - bins.start) as f64 * TWO_POINT_SIGMA,
            chi2: SENTINEL,
            outcome: PixelOutcome::ClosedForm,
        },
        _ => {
            let xs: Vec<f64> = (bins.start..=bins.end).map(|x| x as f64).collect();
            let ys = &curve[bins.start..=bins.end];
            let lm_config = LmConfig {
                max_iterations: config.max_iterations,
                ..LmConfig::default()
            };
            let out = lm::optimize(
                &SCurve { injections },
                &xs,
                ys,
                [bins.mean_seed(), bins.sigma_seed()],
                &lm_config,
            );
            let dof = curve.len().saturating_sub(3).max(1) as f64;
            let chi2 = out.fnorm / dof;
            match out.status {
                FitStatus::Converged if config.reject_negative_mean && out.params[0] < 0.0 => {
                    PixelFit::sentinel(PixelOutcome::ConvergedBad, chi2)
                }
                FitStatus::Converged => PixelFit {
                    mean: out.params[0],
                    sigma: out.params[1],
                    chi2,
                    outcome: PixelOutcome::Fitted(FitStatus::Converged),
                },
                status => PixelFit::sentinel(PixelOutcome::Fitted(status), chi2),
            }
        }
    }
}

/// Per-fragment tally of fit outcomes. `converged` includes fits rejected for a negative
/// mean, which are also tallied in `converged_bad`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitCounters {
    pub converged: u64,
    pub exhausted: u64,
    pub trapped: u64,
    pub converged_bad: u64,
    pub zero: u64,
}

impl FitCounters {
    pub fn record(&mut self, outcome: PixelOutcome) {
        match outcome {
            PixelOutcome::Fitted(FitStatus::Converged) => self.converged += 1,
            PixelOutcome::Fitted(FitStatus::Exhausted) => self.exhausted += 1,
            PixelOutcome::Fitted(FitStatus::Trapped) => self.trapped += 1,
            PixelOutcome::Fitted(FitStatus::SingularOrZero) | PixelOutcome::Unfittable => {
                self.zero += 1
            }
            PixelOutcome::ConvergedBad => {
                self.converged += 1;
                self.converged_bad += 1;
            }
            PixelOutcome::ClosedForm | PixelOutcome::SinglePoint => {}
        }
    }

    /// Converged fits whose parameters were kept.
    pub fn good(&self) -> u64 {
        self.converged - self.converged_bad
    }

    pub fn total_bad(&self) -> u64 {
        self.exhausted + self.trapped + self.converged_bad
    }
}

/// Fit every pixel of a threshold fragment on `pool`.
///
/// Returns `[μ0, σ0, μ1, σ1, …, χ²0, χ²1, …]`: means and sigmas interleaved, followed by
/// one χ²/dof per pixel.
pub fn fit_fragment(
    fragment: &Fragment,
    pool: &FitPool,
    config: &FitterConfig,
) -> (Vec<f64>, FitCounters) {
    let pixels = fragment.pixels();
    let injections = f64::from(fragment.descriptor().injections);
    let (tx, rx) = crossbeam_channel::unbounded();

    for pixel in 0..pixels {
        let curve = fragment.occupancy_curve(pixel);
        let tx = tx.clone();
        let config = *config;
        pool.execute(move || {
            let fit = fit_pixel(&curve, injections, &config);
            // Receiver outlives every job of this fragment.
            let _ = tx.send((pixel, fit));
        });
    }
    drop(tx);

    let mut params = vec![SENTINEL; 3 * pixels];
    let mut counters = FitCounters::default();
    for (pixel, fit) in rx {
        params[2 * pixel] = fit.mean;
        params[2 * pixel + 1] = fit.sigma;
        params[2 * pixels + pixel] = fit.chi2;
        counters.record(fit.outcome);
    }

    let desc = fragment.descriptor();
    info!(
        "fit done scan_id={} unit={} mask_id={} converged={} total_bad={} exhausted={} trapped={} converged_bad={} zero={}",
        desc.scan_id,
        desc.unit,
        desc.mask_id,
        counters.converged,
        counters.total_bad(),
        counters.exhausted,
        counters.trapped,
        counters.converged_bad,
        counters.zero
    );
    (params, counters)
}
