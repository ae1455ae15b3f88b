//! # Scan Descriptors
//!
//! Immutable per-fragment scan parameters shared by every pipeline stage, together with
//! the histogram-unit address of the readout channel that produces the data.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scan identifier as assigned by the run control and echoed by the readout slaves.
pub type ScanId = u32;

/// Internal per-attempt identifier; distinguishes retries of the same scan id.
pub type AttemptId = u32;

/// Pixels served by one front-end chip (FE-I4: 336 rows x 80 columns).
pub const PIXELS_PER_CHIP: usize = 26880;
pub const FEI4_ROWS: usize = 336;
pub const FEI4_COLS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    Threshold,
    Analog,
    Digital,
    Tot,
    TotCalib,
}

impl ScanKind {
    /// Words kept per pixel and bin in a fragment: occupancy only, or occupancy/ToT/ToT².
    pub fn words_per_pixel(self) -> usize {
        match self {
            ScanKind::Tot | ScanKind::TotCalib => 3,
            ScanKind::Threshold | ScanKind::Analog | ScanKind::Digital => 1,
        }
    }

    pub fn is_occupancy(self) -> bool {
        matches!(
            self,
            ScanKind::Threshold | ScanKind::Analog | ScanKind::Digital
        )
    }
}

/// Data format the histogramming unit ships over the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    OnlineOccupancy,
    OfflineOccupancy,
    ShortTot,
    LongTot,
}

impl ReadoutMode {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ReadoutMode::OnlineOccupancy => 4,
            ReadoutMode::OfflineOccupancy => 1,
            ReadoutMode::ShortTot => 4,
            ReadoutMode::LongTot => 8,
        }
    }
}

/// Marks single-bin snapshots forwarded while a multi-bin scan is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntermediateKind {
    None,
    Analog,
    Tot,
}

/// One histogramming channel: crate, readout module (ROD), slave FPGA and unit on the slave.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HistoUnit {
    pub crate_letter: char,
    pub crate_id: u32,
    pub rod: u32,
    pub slave: u32,
    pub histo: u32,
}

impl HistoUnit {
    /// `ROD_<letter><crate>_S<rod>`, the name the run control uses for the readout module.
    pub fn rod_string(&self) -> String {
        format!("ROD_{}{}_S{}", self.crate_letter, self.crate_id, self.rod)
    }

    pub fn serves(&self, crate_id: u32, rod: u32) -> bool {
        self.crate_id == crate_id && self.rod == rod
    }

    /// Receiver channel index of a chip behind this unit.
    pub fn rx_channel(&self, chip: usize) -> usize {
        16 * self.slave as usize + 8 * self.histo as usize + chip
    }
}

impl fmt::Display for HistoUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/slave{}/histo{}",
            self.rod_string(),
            self.slave,
            self.histo
        )
    }
}

/// Range of the scanned injection parameter, used to express fit results in Vcal units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VcalRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("total mask steps must divide {PIXELS_PER_CHIP}, got {0}")]
    TotalMaskSteps(usize),
    #[error("mask steps ({steps}) exceed total mask steps ({total})")]
    MaskStepsExceedTotal { steps: usize, total: usize },
    #[error("mask id {mask_id} outside [0, {steps})")]
    MaskIdOutOfRange { mask_id: usize, steps: usize },
    #[error("geometry {rows}x{cols} does not match {PIXELS_PER_CHIP} pixels per chip")]
    Geometry { rows: usize, cols: usize },
    #[error("readout mode {readout:?} cannot carry {kind:?} data")]
    Readout { kind: ScanKind, readout: ReadoutMode },
}

/// Parameters of one (scan, histogram unit, mask step) fragment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanDescriptor {
    pub scan_id: ScanId,
    pub attempt_id: AttemptId,
    pub kind: ScanKind,
    pub readout: ReadoutMode,
    /// Steps of the scanned parameter; only threshold and ToT-calibration scans loop.
    pub loop_bins: usize,
    pub injections: u32,
    /// Number of passes the data is shipped in.
    pub mask_steps: usize,
    /// Mask-stage layout of the histogrammer (1, 2, 4 or 8 for FE-I4).
    pub total_mask_steps: usize,
    pub chips: usize,
    pub rows: usize,
    pub cols: usize,
    pub mask_id: usize,
    pub unit: HistoUnit,
    pub module_mask: u32,
    /// Whether per-bin snapshots were requested alongside the final result.
    pub intermediate_histos: bool,
    pub intermediate: IntermediateKind,
    /// Bin a snapshot was taken at; `None` for full histograms.
    pub bin_number: Option<usize>,
    pub vcal: Option<VcalRange>,
}

impl ScanDescriptor {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.total_mask_steps == 0 || PIXELS_PER_CHIP % self.total_mask_steps != 0 {
            return Err(DescriptorError::TotalMaskSteps(self.total_mask_steps));
        }
        if self.mask_steps > self.total_mask_steps {
            return Err(DescriptorError::MaskStepsExceedTotal {
                steps: self.mask_steps,
                total: self.total_mask_steps,
            });
        }
        if self.mask_id >= self.mask_steps {
            return Err(DescriptorError::MaskIdOutOfRange {
                mask_id: self.mask_id,
                steps: self.mask_steps,
            });
        }
        if self.rows * self.cols != PIXELS_PER_CHIP {
            return Err(DescriptorError::Geometry {
                rows: self.rows,
                cols: self.cols,
            });
        }
        let tot_readout = matches!(self.readout, ReadoutMode::ShortTot | ReadoutMode::LongTot);
        if !self.kind.is_occupancy() && !tot_readout {
            return Err(DescriptorError::Readout {
                kind: self.kind,
                readout: self.readout,
            });
        }
        Ok(())
    }

    /// Bins held by a fragment of this descriptor.
    pub fn bins(&self) -> usize {
        if self.intermediate != IntermediateKind::None {
            return 1;
        }
        match self.kind {
            ScanKind::Threshold | ScanKind::TotCalib => self.loop_bins.max(1),
            ScanKind::Analog | ScanKind::Digital | ScanKind::Tot => 1,
        }
    }

    /// Pixels shipped per mask step.
    pub fn pixels(&self) -> usize {
        PIXELS_PER_CHIP * self.chips / self.total_mask_steps.max(1)
    }

    pub fn words_per_pixel(&self) -> usize {
        self.kind.words_per_pixel()
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.readout.bytes_per_pixel()
    }

    /// Payload size of one bin on the wire.
    pub fn payload_len(&self) -> usize {
        self.pixels() * self.bytes_per_pixel()
    }

    pub fn fragment_len(&self) -> usize {
        self.pixels() * self.words_per_pixel() * self.bins()
    }

    pub fn is_intermediate(&self) -> bool {
        self.intermediate != IntermediateKind::None
    }

    /// Threshold scans with occupancy snapshots requested, and every ToT calibration.
    pub fn wants_intermediate(&self) -> bool {
        match self.kind {
            ScanKind::Threshold => self.intermediate_histos,
            ScanKind::TotCalib => true,
            _ => false,
        }
    }

    /// Copy describing the single-bin snapshot taken at `bin`.
    pub fn intermediate_for_bin(&self, bin: usize) -> Option<ScanDescriptor> {
        let intermediate = match self.kind {
            ScanKind::Threshold => IntermediateKind::Analog,
            ScanKind::TotCalib => IntermediateKind::Tot,
            _ => return None,
        };
        let mut snapshot = self.clone();
        snapshot.intermediate = intermediate;
        snapshot.bin_number = Some(bin);
        Some(snapshot)
    }

    /// Convert a (fractional) bin position to Vcal. Noise values are widths, so the
    /// range start is not added for them. Without a Vcal range the bin value is returned.
    pub fn vcal_from_bin(&self, value: f64, is_noise: bool) -> f64 {
        match self.vcal {
            Some(range) if self.loop_bins > 1 => {
                let step = (range.max - range.min) / (self.loop_bins - 1) as f64;
                let vcal = range.min + step * value;
                if is_noise { vcal - range.min } else { vcal }
            }
            _ => value,
        }
    }
}

/// Items that belong to one scan and can be dropped once that scan is cancelled.
pub trait ScanScoped {
    fn scan_id(&self) -> ScanId;
}

impl ScanScoped for ScanDescriptor {
    fn scan_id(&self) -> ScanId {
        self.scan_id
    }
}
