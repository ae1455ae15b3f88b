//! # Fit Stage
//!
//! Pops completed fragments, fits threshold scans and forwards everything else.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use tracing::{debug, info};

use crate::fit::{self, FitPool, FitterConfig};
use crate::fragment::Fragment;
use crate::queue::WorkQueue;
use crate::result::{FitResult, ResultPayload};
use crate::scan::ScanKind;
use crate::stats::FarmCounters;

pub struct FitWorker {
    pool: FitPool,
    config: FitterConfig,
    counters: Arc<FarmCounters>,
}

impl FitWorker {
    pub fn new(config: FitterConfig, counters: Arc<FarmCounters>) -> Self {
        let pool = FitPool::new(config.thread_count());
        info!("fit pool started threads={}", pool.size());
        Self {
            pool,
            config,
            counters,
        }
    }

    /// Turn one fragment into its fit-stage result.
    pub fn process(&self, fragment: Arc<Fragment>) -> FitResult {
        let descriptor = fragment.descriptor().clone();
        if descriptor.is_intermediate() {
            return FitResult::new(descriptor, ResultPayload::Raw(fragment));
        }
        match descriptor.kind {
            ScanKind::Analog | ScanKind::Digital | ScanKind::Tot => {
                FitResult::new(descriptor, ResultPayload::Raw(fragment))
            }
            ScanKind::Threshold => {
                let (params, counts) = fit::fit_fragment(&fragment, &self.pool, &self.config);
                self.counters
                    .fits_converged
                    .fetch_add(counts.good(), Ordering::Relaxed);
                self.counters
                    .fits_failed
                    .fetch_add(counts.total_bad() + counts.zero, Ordering::Relaxed);
                FitResult::new(descriptor, ResultPayload::Params(params))
            }
            ScanKind::TotCalib => FitResult::new(descriptor, ResultPayload::Empty),
        }
    }

    pub fn run(&self, input: &WorkQueue<Fragment>, output: &WorkQueue<FitResult>) {
        while let Some(fragment) = input.pop() {
            let desc = fragment.descriptor();
            debug!(
                "fit worker picked up scan_id={} unit={} mask_id={} bins={}",
                desc.scan_id,
                desc.unit,
                desc.mask_id,
                fragment.bins()
            );
            let result = self.process(fragment);
            output.push(Arc::new(result));
        }
        debug!("fit worker exiting");
    }
}

pub fn spawn_fit_worker(
    worker: Arc<FitWorker>,
    input: Arc<WorkQueue<Fragment>>,
    output: Arc<WorkQueue<FitResult>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || worker.run(&input, &output))
}
