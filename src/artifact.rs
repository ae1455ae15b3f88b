//! # Chip Artifacts
//!
//! Histograms built per chip once a unit's mask steps are complete. Construction and
//! filling happen under the [`ArtifactBuilderLock`], which the publisher also holds while
//! serialising them.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Fixed-binning 1-D histogram with under- and overflow counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hist1D {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<u64>,
    pub underflow: u64,
    pub overflow: u64,
}

impl Hist1D {
    pub fn new(bins: usize, min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            counts: vec![0; bins.max(1)],
            underflow: 0,
            overflow: 0,
        }
    }

    pub fn fill(&mut self, value: f64) {
        if value.is_nan() || value < self.min {
            self.underflow += 1;
            return;
        }
        if value >= self.max {
            self.overflow += 1;
            return;
        }
        let width = (self.max - self.min) / self.counts.len() as f64;
        let bin = (((value - self.min) / width) as usize).min(self.counts.len() - 1);
        self.counts[bin] += 1;
    }

    /// Entries inside the axis range.
    pub fn entries(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Column-by-row map of one chip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hist2D {
    pub cols: usize,
    pub rows: usize,
    /// Row-major values, `row * cols + col`.
    pub values: Vec<f64>,
}

impl Hist2D {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            values: vec![0.0; cols * rows],
        }
    }

    /// Returns `false` when the cell is outside the map.
    pub fn set(&mut self, col: usize, row: usize, value: f64) -> bool {
        if col >= self.cols || row >= self.rows {
            return false;
        }
        self.values[row * self.cols + col] = value;
        true
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f64> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        Some(self.values[row * self.cols + col])
    }
}

/// Aggregates produced for one chip, by scan kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChipArtifacts {
    Occupancy {
        occupancy: Hist2D,
    },
    Threshold {
        threshold: Hist1D,
        noise: Hist1D,
        chi2: Hist1D,
        threshold_map: Hist2D,
        noise_map: Hist2D,
        chi2_map: Hist2D,
    },
    Tot {
        mean: Hist2D,
        sum: Hist2D,
        sum2: Hist2D,
        sigma: Hist2D,
        occupancy: Hist2D,
    },
    /// Nothing to publish; the result only counts towards completion.
    Empty,
}

impl ChipArtifacts {
    pub fn occupancy(cols: usize, rows: usize) -> Self {
        ChipArtifacts::Occupancy {
            occupancy: Hist2D::new(cols, rows),
        }
    }

    /// Threshold set; the threshold axis spans the scanned bins.
    pub fn threshold(cols: usize, rows: usize, bins: usize) -> Self {
        ChipArtifacts::Threshold {
            threshold: Hist1D::new(1000, 0.0, bins as f64),
            noise: Hist1D::new(100, 0.0, 10.0),
            chi2: Hist1D::new(25, 0.0, 50.0),
            threshold_map: Hist2D::new(cols, rows),
            noise_map: Hist2D::new(cols, rows),
            chi2_map: Hist2D::new(cols, rows),
        }
    }

    pub fn tot(cols: usize, rows: usize) -> Self {
        ChipArtifacts::Tot {
            mean: Hist2D::new(cols, rows),
            sum: Hist2D::new(cols, rows),
            sum2: Hist2D::new(cols, rows),
            sigma: Hist2D::new(cols, rows),
            occupancy: Hist2D::new(cols, rows),
        }
    }
}

/// Serialises all artifact construction and publication.
#[derive(Debug, Default)]
pub struct ArtifactBuilderLock {
    inner: Mutex<()>,
}

impl ArtifactBuilderLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
