//! # Reassembly
//!
//! Mask-stepped results are held per (scan id, bin) and histogram unit until every mask
//! step has arrived, then decoded into per-chip artifacts.
//!
//! Pixel addressing follows the histogrammer's interleaved readout order: within a mask
//! step, flat pixel `j` belongs to chip `j / (rows·cols / totalMaskSteps)`; its row is the
//! row group times `totalMaskSteps`, offset by the mask id on even pixels and by
//! `totalMaskSteps − 1 − maskId` on odd pixels.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::artifact::{ArtifactBuilderLock, ChipArtifacts};
use crate::queue::WorkQueue;
use crate::registry::Cancellation;
use crate::result::{FitResult, ResultPayload};
use crate::scan::{HistoUnit, IntermediateKind, PIXELS_PER_CHIP, ScanDescriptor, ScanId, ScanKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelAddress {
    pub chip: usize,
    pub row: usize,
    pub col: usize,
}

/// Chip, row and column of flat pixel `pixel` of a fragment described by `desc`.
pub fn locate(desc: &ScanDescriptor, pixel: usize) -> Option<PixelAddress> {
    let steps = desc.total_mask_steps;
    if steps == 0 || desc.cols == 0 {
        return None;
    }
    let per_step = desc.rows * desc.cols / steps;
    if per_step == 0 {
        return None;
    }
    let chip = pixel / per_step;
    let offset = pixel.checked_sub(chip * PIXELS_PER_CHIP / steps)?;
    let base = (offset / desc.cols) * steps;
    let row = if pixel % 2 == 0 {
        base + desc.mask_id
    } else {
        base + steps - 1 - desc.mask_id
    };
    let col = pixel % desc.cols;
    if chip >= desc.chips || row >= desc.rows {
        return None;
    }
    Some(PixelAddress { chip, row, col })
}

/// Mean and sigma of a pixel's ToT from its hit count and accumulated ToT and ToT².
pub fn tot_moments(occ: u32, tot: u32, tot2: u32) -> (f64, f64) {
    match occ {
        0 => (0.0, 0.0),
        1 => (f64::from(tot), 0.0),
        n => {
            let n = f64::from(n);
            let mean = f64::from(tot) / n;
            let sigma = if tot2 > 0 {
                ((f64::from(tot2) / n - mean * mean).max(0.0) / (n - 1.0)).sqrt()
            } else {
                0.0
            };
            (mean, sigma)
        }
    }
}

type HoldKey = (ScanId, Option<usize>);
type Slots = Vec<Option<Arc<FitResult>>>;

pub struct Assembler {
    hold: Mutex<HashMap<HoldKey, BTreeMap<HistoUnit, Slots>>>,
    cancellation: Arc<Cancellation>,
    builder_lock: Arc<ArtifactBuilderLock>,
}

impl Assembler {
    pub fn new(cancellation: Arc<Cancellation>, builder_lock: Arc<ArtifactBuilderLock>) -> Self {
        Self {
            hold: Mutex::new(HashMap::new()),
            cancellation,
            builder_lock,
        }
    }

    /// Number of (scan, bin) entries waiting for mask steps.
    pub fn pending(&self) -> usize {
        self.lock_hold().len()
    }

    /// Store `result`; returns the per-chip results once its unit is complete.
    pub fn accept(&self, result: Arc<FitResult>) -> Vec<FitResult> {
        let desc = result.descriptor.clone();
        if self.cancellation.is_cancelled(desc.scan_id) {
            debug!("scan_id={} is cancelled, dropping result", desc.scan_id);
            return Vec::new();
        }
        if desc.mask_id >= desc.mask_steps {
            warn!(
                "unit={} mask_id={} outside {} mask steps, dropping result",
                desc.unit, desc.mask_id, desc.mask_steps
            );
            return Vec::new();
        }

        let key = (desc.scan_id, desc.bin_number);
        let complete = {
            let mut hold = self.lock_hold();
            let units = hold.entry(key).or_default();
            let slots = units
                .entry(desc.unit.clone())
                .or_insert_with(|| vec![None; desc.mask_steps]);

            if slots.len() != desc.mask_steps {
                warn!(
                    "unit={} scan_id={} expects {} mask steps but {} are held, dropping result",
                    desc.unit,
                    desc.scan_id,
                    desc.mask_steps,
                    slots.len()
                );
                return Vec::new();
            }
            let Some(slot) = slots.get_mut(desc.mask_id) else {
                return Vec::new();
            };
            if slot.is_some() {
                warn!(
                    "unit={} scan_id={} mask_id={} received twice, abandoning merge",
                    desc.unit, desc.scan_id, desc.mask_id
                );
                units.remove(&desc.unit);
                if units.is_empty() {
                    hold.remove(&key);
                }
                return Vec::new();
            }
            *slot = Some(result);

            if slots.iter().any(Option::is_none) {
                debug!(
                    "unit={} scan_id={} waiting for {} more mask steps",
                    desc.unit,
                    desc.scan_id,
                    slots.iter().filter(|slot| slot.is_none()).count()
                );
                return Vec::new();
            }

            let slots = units.remove(&desc.unit).unwrap_or_default();
            if units.is_empty() {
                hold.remove(&key);
            }
            slots.into_iter().flatten().collect::<Vec<_>>()
        };

        self.reassemble(&desc, &complete)
    }

    /// Drop held entries of every cancelled scan.
    pub fn purge_cancelled(&self) -> usize {
        let mut hold = self.lock_hold();
        let before = hold.len();
        hold.retain(|(scan_id, _), _| !self.cancellation.is_cancelled(*scan_id));
        let dropped = before - hold.len();
        if dropped > 0 {
            info!("purged {dropped} reassembly entries of cancelled scans");
        }
        dropped
    }

    pub fn run(&self, input: &WorkQueue<FitResult>, output: &WorkQueue<FitResult>) {
        while let Some(result) = input.pop() {
            for chip_result in self.accept(result) {
                output.push(Arc::new(chip_result));
            }
        }
        debug!("assembler exiting");
    }

    fn reassemble(&self, desc: &Arc<ScanDescriptor>, steps: &[Arc<FitResult>]) -> Vec<FitResult> {
        let per_step = desc.pixels() / desc.chips.max(1);
        let mut out = Vec::with_capacity(desc.chips);
        for chip in 0..desc.chips {
            let _guard = self.builder_lock.acquire();
            let mut artifacts = new_artifacts(desc);
            for step in steps {
                let pixels = chip * per_step..(chip + 1) * per_step;
                if let Err(err) = fill_chip(&mut artifacts, chip, step, pixels) {
                    warn!("unit={} chip={chip} dropped: {err}", desc.unit);
                    return Vec::new();
                }
            }
            out.push(FitResult::for_chip(desc.clone(), chip, artifacts));
        }
        info!(
            "unit={} scan_id={} bin={:?} reassembled {} chips",
            desc.unit,
            desc.scan_id,
            desc.bin_number,
            out.len()
        );
        out
    }

    fn lock_hold(&self) -> MutexGuard<'_, HashMap<HoldKey, BTreeMap<HistoUnit, Slots>>> {
        self.hold.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_artifacts(desc: &ScanDescriptor) -> ChipArtifacts {
    let (cols, rows) = (desc.cols, desc.rows);
    match desc.intermediate {
        IntermediateKind::Analog => return ChipArtifacts::occupancy(cols, rows),
        IntermediateKind::Tot => return ChipArtifacts::tot(cols, rows),
        IntermediateKind::None => {}
    }
    match desc.kind {
        ScanKind::Analog | ScanKind::Digital => ChipArtifacts::occupancy(cols, rows),
        ScanKind::Threshold => ChipArtifacts::threshold(cols, rows, desc.loop_bins),
        ScanKind::Tot => ChipArtifacts::tot(cols, rows),
        ScanKind::TotCalib => ChipArtifacts::Empty,
    }
}

fn fill_chip(
    artifacts: &mut ChipArtifacts,
    chip: usize,
    step: &FitResult,
    pixels: std::ops::Range<usize>,
) -> Result<(), String> {
    let desc = &step.descriptor;
    match (artifacts, &step.payload) {
        (ChipArtifacts::Empty, _) => {}
        (ChipArtifacts::Occupancy { occupancy }, ResultPayload::Raw(fragment)) => {
            for pixel in pixels {
                let Some(addr) = locate_on(desc, pixel, chip) else {
                    continue;
                };
                occupancy.set(addr.col, addr.row, f64::from(fragment[(pixel, 0, 0)]));
            }
        }
        (
            ChipArtifacts::Tot {
                mean,
                sum,
                sum2,
                sigma,
                occupancy,
            },
            ResultPayload::Raw(fragment),
        ) => {
            if fragment.words_per_pixel() < 3 {
                return Err(format!("{} words per pixel, ToT needs 3", fragment.words_per_pixel()));
            }
            for pixel in pixels {
                let Some(addr) = locate_on(desc, pixel, chip) else {
                    continue;
                };
                let occ = fragment[(pixel, 0, 0)];
                let tot = fragment[(pixel, 0, 1)];
                let tot2 = fragment[(pixel, 0, 2)];
                let (m, s) = tot_moments(occ, tot, tot2);
                mean.set(addr.col, addr.row, m);
                sum.set(addr.col, addr.row, f64::from(tot));
                sum2.set(addr.col, addr.row, f64::from(tot2));
                sigma.set(addr.col, addr.row, s);
                occupancy.set(addr.col, addr.row, f64::from(occ));
            }
        }
        (
            ChipArtifacts::Threshold {
                threshold,
                noise,
                chi2,
                threshold_map,
                noise_map,
                chi2_map,
            },
            ResultPayload::Params(_),
        ) => {
            for pixel in pixels {
                let Some(addr) = locate_on(desc, pixel, chip) else {
                    continue;
                };
                let Some((mu, sig, chi)) = step.pixel_params(pixel) else {
                    continue;
                };
                threshold.fill(mu);
                noise.fill(sig);
                chi2.fill(chi);
                threshold_map.set(addr.col, addr.row, to_vcal(desc, mu, false));
                noise_map.set(addr.col, addr.row, to_vcal(desc, sig, true));
                chi2_map.set(addr.col, addr.row, chi);
            }
        }
        (_, payload) => {
            return Err(format!(
                "payload {} does not match {:?} scan",
                payload_name(payload),
                desc.kind
            ));
        }
    }
    Ok(())
}

fn locate_on(desc: &ScanDescriptor, pixel: usize, chip: usize) -> Option<PixelAddress> {
    locate(desc, pixel).filter(|addr| addr.chip == chip)
}

/// Sentinels stay negative instead of being mapped into the Vcal range.
fn to_vcal(desc: &ScanDescriptor, value: f64, is_noise: bool) -> f64 {
    if value < 0.0 {
        value
    } else {
        desc.vcal_from_bin(value, is_noise)
    }
}

fn payload_name(payload: &ResultPayload) -> &'static str {
    match payload {
        ResultPayload::Raw(_) => "raw",
        ResultPayload::Params(_) => "params",
        ResultPayload::Empty => "empty",
        ResultPayload::Artifacts(_) => "artifacts",
    }
}
