//! # Farm Manager
//!
//! Owns the shared registries and queues, binds one endpoint per histogram unit of every
//! configured ROD, and runs the pipeline threads:
//!
//! ```text
//! endpoints (4 per ROD) -> fit queue -> FitWorker -> result queue -> Assembler -> publish queue -> Publisher
//! ```
//!
//! Scan start and abort requests arrive through [`Manager::setup_scan`] and
//! [`Manager::cancel_scan`].

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};

use crate::artifact::ArtifactBuilderLock;
use crate::assembler::Assembler;
use crate::config::{Config, ScanTemplate};
use crate::fragment::Fragment;
use crate::net::{Endpoint, EndpointOptions, ResetMode};
use crate::publisher::{ArtifactSink, PublishError, Publisher};
use crate::queue::WorkQueue;
use crate::registry::{Cancellation, CompletionTracker};
use crate::result::FitResult;
use crate::scan::{AttemptId, HistoUnit, ScanId};
use crate::stats::{FarmCounters, FarmStats};
use crate::worker::{self, FitWorker};

/// Histogram units behind one ROD: two slaves with two units each.
pub const UNITS_PER_ROD: usize = 4;
const PORT_SEARCH_LIMIT: u16 = 1000;

static ROD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ROD_([CIL])([0-9]{1,2})_S([0-9]{1,2})$").expect("valid ROD pattern")
});

/// Split `ROD_<letter><crate>_S<rod>` into its parts.
pub fn parse_rod_string(rod: &str) -> Option<(char, u32, u32)> {
    let caps = ROD_PATTERN.captures(rod)?;
    let letter = caps.get(1)?.as_str().chars().next()?;
    let crate_id = caps.get(2)?.as_str().parse().ok()?;
    let rod = caps.get(3)?.as_str().parse().ok()?;
    Some((letter, crate_id, rod))
}

/// Active (slave, histo) pairs of a module mask. Byte `n` covers slave `n / 2`, unit `n % 2`.
pub fn translate_module_mask(mask: u32) -> Vec<(u32, u32)> {
    mask.to_le_bytes()
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte != 0)
        .map(|(idx, _)| (idx as u32 / 2, idx as u32 % 2))
        .collect()
}

/// First run of `count` consecutive bindable ports at or above `start`. A zero start
/// leaves the choice to the OS.
pub fn find_free_ports(ip: IpAddr, start: u16, count: usize) -> io::Result<Vec<u16>> {
    if start == 0 {
        return Ok(vec![0; count]);
    }
    let count_u16 = u16::try_from(count)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many ports requested"))?;
    for offset in 0..PORT_SEARCH_LIMIT {
        let Some(base) = start.checked_add(offset) else {
            break;
        };
        let Some(end) = base.checked_add(count_u16) else {
            break;
        };
        let free = (base..end).all(|port| TcpListener::bind(SocketAddr::new(ip, port)).is_ok());
        if free {
            return Ok((base..end).collect());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no {count} consecutive free ports above {start}"),
    ))
}

pub struct Manager {
    template: ScanTemplate,
    cancellation: Arc<Cancellation>,
    tracker: Arc<CompletionTracker>,
    assembler: Arc<Assembler>,
    endpoints: Vec<Arc<Endpoint>>,
    fit_queue: Arc<WorkQueue<Fragment>>,
    result_queue: Arc<WorkQueue<FitResult>>,
    publish_queue: Arc<WorkQueue<FitResult>>,
    next_attempt: AtomicU32,
    counters: Arc<FarmCounters>,
    endpoint_handles: Vec<thread::JoinHandle<()>>,
    worker_handle: Option<thread::JoinHandle<()>>,
    assembler_handle: Option<thread::JoinHandle<()>>,
    publisher_handle: Option<thread::JoinHandle<Result<(), PublishError>>>,
}

impl Manager {
    /// Bind all endpoints and start the pipeline threads.
    pub fn start(config: &Config, sink: Arc<dyn ArtifactSink>) -> Result<Self> {
        let cancellation = Arc::new(Cancellation::new());
        let tracker = Arc::new(CompletionTracker::new());
        let builder_lock = Arc::new(ArtifactBuilderLock::new());
        let counters = Arc::new(FarmCounters::new());

        let fit_queue = Arc::new(WorkQueue::with_cancellation("FitQueue", cancellation.clone()));
        let result_queue = Arc::new(WorkQueue::with_cancellation(
            "ResultQueue",
            cancellation.clone(),
        ));
        let publish_queue = Arc::new(WorkQueue::with_cancellation(
            "PublishQueue",
            cancellation.clone(),
        ));

        let units = configured_units(&config.rods)?;
        let ports = find_free_ports(config.listen_ip, config.start_port, units.len())
            .context("allocating endpoint ports")?;
        let options = EndpointOptions {
            emulator: config.emulator,
            dump_dir: config.dump_network.then(|| config.dump_dir.clone()),
            ..EndpointOptions::default()
        };
        if let Some(dir) = &options.dump_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating dump directory {}", dir.display()))?;
        }

        let mut endpoints = Vec::with_capacity(units.len());
        for (unit, port) in units.into_iter().zip(ports) {
            let addr = SocketAddr::new(config.listen_ip, port);
            let endpoint = Endpoint::bind(
                unit.clone(),
                addr,
                fit_queue.clone(),
                cancellation.clone(),
                options.clone(),
                counters.clone(),
            )
            .with_context(|| format!("binding endpoint for {unit} on {addr}"))?;
            info!("endpoint unit={unit} bound to {}", endpoint.local_addr());
            endpoints.push(Arc::new(endpoint));
        }

        let endpoint_handles = endpoints
            .iter()
            .map(|endpoint| {
                let endpoint = endpoint.clone();
                thread::spawn(move || endpoint.run())
            })
            .collect();

        let fit_worker = Arc::new(FitWorker::new(config.fitter, counters.clone()));
        let worker_handle =
            worker::spawn_fit_worker(fit_worker, fit_queue.clone(), result_queue.clone());

        let assembler = Arc::new(Assembler::new(cancellation.clone(), builder_lock.clone()));
        let assembler_handle = {
            let assembler = assembler.clone();
            let input = result_queue.clone();
            let output = publish_queue.clone();
            thread::spawn(move || assembler.run(&input, &output))
        };

        let publisher = Publisher::new(
            sink,
            tracker.clone(),
            cancellation.clone(),
            builder_lock,
            counters.clone(),
        );
        let publisher_handle = {
            let input = publish_queue.clone();
            thread::spawn(move || publisher.run(&input))
        };

        Ok(Self {
            template: config.scan.clone(),
            cancellation,
            tracker,
            assembler,
            endpoints,
            fit_queue,
            result_queue,
            publish_queue,
            next_attempt: AtomicU32::new(0),
            counters,
            endpoint_handles,
            worker_handle: Some(worker_handle),
            assembler_handle: Some(assembler_handle),
            publisher_handle: Some(publisher_handle),
        })
    }

    pub fn endpoint_addrs(&self) -> Vec<(HistoUnit, SocketAddr)> {
        self.endpoints
            .iter()
            .map(|endpoint| (endpoint.unit().clone(), endpoint.local_addr()))
            .collect()
    }

    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    pub fn cancellation(&self) -> &Arc<Cancellation> {
        &self.cancellation
    }

    pub fn stats(&self) -> FarmStats {
        self.counters.snapshot()
    }

    /// Queue one descriptor per mask step on every local endpoint the module mask selects
    /// and register the expected number of published results.
    pub fn setup_scan(
        &self,
        scan_id: ScanId,
        crate_id: u32,
        rod: u32,
        module_mask: u32,
    ) -> Result<AttemptId> {
        let active = translate_module_mask(module_mask);
        let targets: Vec<&Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|endpoint| {
                let unit = endpoint.unit();
                unit.serves(crate_id, rod) && active.contains(&(unit.slave, unit.histo))
            })
            .collect();
        let Some(first) = targets.first() else {
            bail!(
                "no local endpoint serves crate={crate_id} rod={rod} mask=0x{module_mask:08x}"
            );
        };
        self.template
            .validate(first.unit())
            .context("invalid scan template")?;

        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        let expected = u32::try_from(targets.len() * self.template.chips)
            .map_err(|_| anyhow!("expected result count overflows"))?;
        // Registered before any data can flow so the publisher never sees an unknown attempt.
        self.tracker.set_expected(attempt, scan_id, expected)?;

        for endpoint in &targets {
            for mask_id in 0..self.template.mask_steps {
                let descriptor = self.template.descriptor(
                    scan_id,
                    attempt,
                    endpoint.unit().clone(),
                    module_mask,
                    mask_id,
                );
                if !endpoint.put_scan_config(Arc::new(descriptor)) {
                    warn!(
                        "unit={} rejected descriptor scan_id={scan_id} mask_id={mask_id}",
                        endpoint.unit()
                    );
                }
            }
        }
        info!(
            "scan_id={scan_id} attempt={attempt} set up on {} units, expecting {expected} results",
            targets.len()
        );
        Ok(attempt)
    }

    /// Blacklist `scan_id`, reset the endpoints of the ROD, drop everything held for it and
    /// retire its pending attempts.
    pub fn cancel_scan(&self, scan_id: ScanId, crate_id: u32, rod: u32) {
        self.cancellation.cancel(scan_id);
        for endpoint in &self.endpoints {
            if endpoint.unit().serves(crate_id, rod) {
                endpoint.reset_network(ResetMode::Unconditional);
            }
        }
        let held = self.assembler.purge_cancelled();
        let mut queued = self.fit_queue.purge() + self.result_queue.purge();
        queued += self.publish_queue.purge();
        for endpoint in &self.endpoints {
            queued += endpoint.purge_cancelled();
        }
        let retired = self.tracker.retire_scan(scan_id);
        info!(
            "scan_id={scan_id} cancelled crate={crate_id} rod={rod} held_dropped={held} queued_dropped={queued} attempts_retired={retired}"
        );
    }

    /// Stop the endpoints, drain every stage in order and join all threads.
    pub fn shutdown(mut self) -> Result<FarmStats> {
        for endpoint in &self.endpoints {
            endpoint.shutdown();
        }
        for handle in self.endpoint_handles.drain(..) {
            join_stage("endpoint", handle);
        }

        self.fit_queue.close();
        if let Some(handle) = self.worker_handle.take() {
            join_stage("fit worker", handle);
        }
        self.result_queue.close();
        if let Some(handle) = self.assembler_handle.take() {
            join_stage("assembler", handle);
        }
        self.publish_queue.close();
        let published = match self.publisher_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("publisher thread panicked"))?,
            None => Ok(()),
        };
        if let Err(err) = &published {
            error!("publisher stopped: {err}");
        }

        let stats = self.counters.snapshot();
        info!(
            "farm stopped frames_received={} frames_dropped={} histograms={} fits_converged={} fits_failed={} published={} scans_finished={}",
            stats.frames_received,
            stats.frames_dropped,
            stats.histograms_completed,
            stats.fits_converged,
            stats.fits_failed,
            stats.results_published,
            stats.scans_finished
        );
        published?;
        Ok(stats)
    }
}

fn join_stage(name: &str, handle: thread::JoinHandle<()>) {
    if handle.join().is_err() {
        error!("{name} thread panicked");
    }
}

/// Four histogram units per configured ROD.
fn configured_units(rods: &[String]) -> Result<Vec<HistoUnit>> {
    let mut units = Vec::with_capacity(rods.len() * UNITS_PER_ROD);
    for rod_name in rods {
        let (crate_letter, crate_id, rod) = parse_rod_string(rod_name)
            .ok_or_else(|| anyhow!("invalid ROD name {rod_name:?}"))?;
        for j in 0..UNITS_PER_ROD as u32 {
            units.push(HistoUnit {
                crate_letter,
                crate_id,
                rod,
                slave: j / 2,
                histo: j % 2,
            });
        }
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::publisher::MemorySink;

    fn test_config() -> Config {
        let mut config = load_config(None).expect("default config").config;
        config.start_port = 0;
        config.listen_ip = IpAddr::from([127, 0, 0, 1]);
        config.fitter.threads = 1;
        config
    }

    #[test]
    fn rod_strings_parse() {
        assert_eq!(parse_rod_string("ROD_C1_S5"), Some(('C', 1, 5)));
        assert_eq!(parse_rod_string("ROD_L12_S21"), Some(('L', 12, 21)));
        assert_eq!(parse_rod_string("ROD_X1_S5"), None);
        assert_eq!(parse_rod_string("ROD_C_S5"), None);
        assert_eq!(parse_rod_string("ROD_C1_S567"), None);
        assert_eq!(parse_rod_string("xROD_C1_S5_junk"), None);
    }

    #[test]
    fn module_mask_bytes_map_to_units() {
        assert_eq!(translate_module_mask(0), Vec::<(u32, u32)>::new());
        assert_eq!(translate_module_mask(0x0000_0001), vec![(0, 0)]);
        assert_eq!(translate_module_mask(0x0000_FF00), vec![(0, 1)]);
        assert_eq!(
            translate_module_mask(0xFF01_0000),
            vec![(1, 0), (1, 1)]
        );
    }

    #[test]
    fn os_assigned_ports_when_start_is_zero() {
        let ports = find_free_ports(IpAddr::from([127, 0, 0, 1]), 0, 4).expect("ports");
        assert_eq!(ports, vec![0; 4]);
    }

    #[test]
    fn concurrent_setups_get_distinct_attempts() {
        let manager = Manager::start(&test_config(), Arc::new(MemorySink::new())).expect("start");
        let mut attempts: Vec<AttemptId> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let manager = &manager;
                    scope.spawn(move || manager.setup_scan(100 + i, 1, 5, 0xFF).expect("setup"))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("setup thread"))
                .collect()
        });
        attempts.sort_unstable();
        assert_eq!(attempts, (0..8).collect::<Vec<_>>());
        manager.shutdown().expect("shutdown");
    }

    #[test]
    fn setup_registers_expected_results() {
        let config = test_config();
        let manager = Manager::start(&config, Arc::new(MemorySink::new())).expect("start");
        assert_eq!(manager.endpoint_addrs().len(), UNITS_PER_ROD);

        let attempt = manager.setup_scan(33, 1, 5, 0x0000_01FF).expect("setup");
        assert_eq!(attempt, 0);
        assert_eq!(manager.tracker().remaining(0), Some(2 * config.scan.chips as u32));
        assert!(manager.setup_scan(34, 2, 5, 0xFF).is_err());
        assert_eq!(manager.setup_scan(35, 1, 5, 0xFF00_0000).expect("setup"), 1);

        manager.cancel_scan(33, 1, 5);
        assert!(manager.cancellation().is_cancelled(33));
        assert_eq!(manager.tracker().remaining(0), None);
        assert_eq!(manager.tracker().remaining(1), Some(config.scan.chips as u32));
        manager.shutdown().expect("shutdown");
    }
}
