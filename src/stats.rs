use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by all stages of one farm instance.
#[derive(Debug, Default)]
pub struct FarmCounters {
    pub frames_received: Arc<AtomicU64>,
    pub frames_dropped: Arc<AtomicU64>,
    pub histograms_completed: Arc<AtomicU64>,
    pub intermediates_forwarded: Arc<AtomicU64>,
    pub fits_converged: Arc<AtomicU64>,
    pub fits_failed: Arc<AtomicU64>,
    pub results_published: Arc<AtomicU64>,
    pub scans_finished: Arc<AtomicU64>,
}

impl FarmCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FarmStats {
        FarmStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            histograms_completed: self.histograms_completed.load(Ordering::Relaxed),
            intermediates_forwarded: self.intermediates_forwarded.load(Ordering::Relaxed),
            fits_converged: self.fits_converged.load(Ordering::Relaxed),
            fits_failed: self.fits_failed.load(Ordering::Relaxed),
            results_published: self.results_published.load(Ordering::Relaxed),
            scans_finished: self.scans_finished.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FarmCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FarmStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub histograms_completed: u64,
    pub intermediates_forwarded: u64,
    pub fits_converged: u64,
    pub fits_failed: u64,
    pub results_published: u64,
    pub scans_finished: u64,
}
