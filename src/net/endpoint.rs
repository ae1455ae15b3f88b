//! # Ingestion Endpoint
//!
//! One endpoint per histogramming unit. It listens for the slave's TCP connection, takes
//! the next scan descriptor from its own config queue, and rebuilds the fragment bin by
//! bin from histogram-data commands. Completed fragments (and per-bin snapshots, where
//! requested) are pushed to the fit queue.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::fragment::Fragment;
use crate::queue::WorkQueue;
use crate::registry::Cancellation;
use crate::scan::{HistoUnit, ScanDescriptor, ScanId};
use crate::stats::FarmCounters;

use super::protocol::{
    self, CommandHeader, HEADER_LEN, HIST_DATA_CMD, MAX_PAYLOAD, ProtocolError,
};

/// Receive timeout; each expiry is a chance to honour a pending reset.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Abort whatever scan is in progress.
    Unconditional,
    /// Abort only if the scan in progress has been cancelled.
    IfCancelled,
}

/// Pending reset request, polled by the endpoint thread.
#[derive(Debug, Default)]
pub struct ResetToken {
    state: AtomicU8,
}

impl ResetToken {
    const NONE: u8 = 0;
    const UNCONDITIONAL: u8 = 1;
    const IF_CANCELLED: u8 = 2;

    pub fn request(&self, mode: ResetMode) {
        let value = match mode {
            ResetMode::Unconditional => Self::UNCONDITIONAL,
            ResetMode::IfCancelled => Self::IF_CANCELLED,
        };
        self.state.store(value, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.state.store(Self::NONE, Ordering::SeqCst);
    }

    pub fn pending(&self) -> Option<ResetMode> {
        match self.state.load(Ordering::SeqCst) {
            Self::UNCONDITIONAL => Some(ResetMode::Unconditional),
            Self::IF_CANCELLED => Some(ResetMode::IfCancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Synthetic data source: the scan id echoed in headers is not checked.
    pub emulator: bool,
    /// Directory for raw network dumps; `None` disables dumping.
    pub dump_dir: Option<PathBuf>,
    pub poll_timeout: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            emulator: false,
            dump_dir: None,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

pub struct Endpoint {
    unit: HistoUnit,
    listener: TcpListener,
    local_addr: SocketAddr,
    configs: WorkQueue<ScanDescriptor>,
    fit_queue: Arc<WorkQueue<Fragment>>,
    cancellation: Arc<Cancellation>,
    reset: ResetToken,
    shutdown: AtomicBool,
    options: EndpointOptions,
    counters: Arc<FarmCounters>,
}

/// Scan being received on the current connection.
struct ActiveScan {
    descriptor: Arc<ScanDescriptor>,
    fragment: Fragment,
    bin: usize,
    dump: Option<BufWriter<File>>,
}

enum ReadStatus {
    Complete,
    Reset,
    Closed,
}

enum Step {
    Continue,
    Disconnect,
}

impl Endpoint {
    pub fn bind(
        unit: HistoUnit,
        addr: SocketAddr,
        fit_queue: Arc<WorkQueue<Fragment>>,
        cancellation: Arc<Cancellation>,
        options: EndpointOptions,
        counters: Arc<FarmCounters>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let configs = WorkQueue::with_cancellation(
            format!("ScanConfigQueue[{unit}]"),
            cancellation.clone(),
        );
        Ok(Self {
            unit,
            listener,
            local_addr,
            configs,
            fit_queue,
            cancellation,
            reset: ResetToken::default(),
            shutdown: AtomicBool::new(false),
            options,
            counters,
        })
    }

    pub fn unit(&self) -> &HistoUnit {
        &self.unit
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a descriptor; the endpoint starts on it once the previous scan completes.
    pub fn put_scan_config(&self, descriptor: Arc<ScanDescriptor>) -> bool {
        self.configs.push(descriptor)
    }

    /// Drop queued descriptors of cancelled scans.
    pub fn purge_cancelled(&self) -> usize {
        self.configs.purge()
    }

    pub fn reset_network(&self, mode: ResetMode) {
        self.reset.request(mode);
        debug!("unit={} network reset requested mode={mode:?}", self.unit);
    }

    /// Stop accepting connections and release a thread blocked on the config queue.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.configs.close();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Accept loop; run on a dedicated thread until [`Endpoint::shutdown`].
    pub fn run(&self) {
        info!("unit={} listening on {}", self.unit, self.local_addr);
        while !self.is_shutdown() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("unit={} connection from {peer}", self.unit);
                    if let Err(err) = self.prepare_stream(&stream) {
                        warn!("unit={} failed to configure socket: {err}", self.unit);
                        continue;
                    }
                    // Requests raised before the connection existed are stale.
                    self.reset.clear();
                    self.serve(stream);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => {
                    warn!("unit={} accept failed: {err}", self.unit);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        info!("unit={} endpoint stopped", self.unit);
    }

    fn prepare_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.options.poll_timeout))?;
        stream.set_nodelay(true)
    }

    /// Process commands on one connection until it fails, is reset, or the farm stops.
    fn serve(&self, mut stream: TcpStream) {
        let mut active: Option<ActiveScan> = None;
        let mut payload = Vec::new();
        loop {
            if active.is_none() {
                let Some(descriptor) = self.configs.pop() else {
                    break;
                };
                active = Some(self.start_scan(descriptor));
            }
            let Some(scan) = active.as_mut() else {
                break;
            };

            match self.process_command(&mut stream, scan, &mut payload) {
                Ok((Step::Continue, true)) => {
                    if let Some(done) = active.take() {
                        self.finish_scan(done);
                    }
                }
                Ok((Step::Continue, false)) => {}
                Ok((Step::Disconnect, _)) => break,
                Err(err) => {
                    warn!("unit={} connection error: {err}", self.unit);
                    break;
                }
            }
        }

        if let Some(scan) = active {
            info!(
                "unit={} discarding scan_id={} mask_id={} at bin {}",
                self.unit, scan.descriptor.scan_id, scan.descriptor.mask_id, scan.bin
            );
        }
        if let Err(err) = stream.shutdown(Shutdown::Write) {
            debug!("unit={} error on socket shutdown: {err}", self.unit);
        }
    }

    fn start_scan(&self, descriptor: Arc<ScanDescriptor>) -> ActiveScan {
        self.reset.clear();
        let fragment = Fragment::new(descriptor.clone());
        debug!(
            "unit={} allocated {} words for scan_id={} mask_id={}",
            self.unit,
            fragment.len(),
            descriptor.scan_id,
            descriptor.mask_id
        );
        let dump = self.open_dump(&descriptor);
        ActiveScan {
            descriptor,
            fragment,
            bin: 0,
            dump,
        }
    }

    fn open_dump(&self, descriptor: &ScanDescriptor) -> Option<BufWriter<File>> {
        let dir = self.options.dump_dir.as_ref()?;
        let path = dir.join(dump_file_name(descriptor));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                warn!("unit={} cannot open dump {}: {err}", self.unit, path.display());
                None
            }
        }
    }

    fn finish_scan(&self, mut scan: ActiveScan) {
        if let Some(dump) = scan.dump.as_mut() {
            if let Err(err) = dump.flush() {
                warn!("unit={} dump flush failed: {err}", self.unit);
            }
        }
        info!(
            "unit={} histogram complete scan_id={} mask_id={}",
            self.unit, scan.descriptor.scan_id, scan.descriptor.mask_id
        );
        FarmCounters::bump(&self.counters.histograms_completed);
        self.fit_queue.push(Arc::new(scan.fragment));
    }

    /// Read and handle one command. The flag is `true` when the last bin was stored.
    fn process_command(
        &self,
        stream: &mut TcpStream,
        scan: &mut ActiveScan,
        payload: &mut Vec<u8>,
    ) -> Result<(Step, bool), ProtocolError> {
        let scan_id = scan.descriptor.scan_id;
        let mut header_buf = [0u8; HEADER_LEN];
        match self.read_polled(stream, &mut header_buf, scan_id)? {
            ReadStatus::Complete => {}
            ReadStatus::Reset | ReadStatus::Closed => return Ok((Step::Disconnect, false)),
        }
        write_dump(&mut scan.dump, &header_buf);
        FarmCounters::bump(&self.counters.frames_received);

        let header = CommandHeader::from_be_bytes(&header_buf);
        if let Err(err) = header.check_magic() {
            FarmCounters::bump(&self.counters.frames_dropped);
            warn!("unit={} skipping frame: {err} header={:02x?}", self.unit, header_buf);
            return Ok((Step::Continue, false));
        }
        if header.command != HIST_DATA_CMD {
            warn!("unit={} invalid command: 0x{:x}", self.unit, header.command);
            return Ok((Step::Continue, false));
        }

        info!(
            "unit={} histogram data for bin={} ({})",
            self.unit, header.bins, scan.bin
        );
        let size = header.payload_size as usize;
        if size > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(size));
        }
        if size > 0 {
            payload.resize(size, 0);
            match self.read_polled(stream, payload, scan_id)? {
                ReadStatus::Complete => {}
                ReadStatus::Reset | ReadStatus::Closed => return Ok((Step::Disconnect, false)),
            }
            write_dump(&mut scan.dump, payload);

            if let Err(err) = self.accept_payload(scan, &header, payload) {
                FarmCounters::bump(&self.counters.frames_dropped);
                warn!("unit={} dropping frame for bin {}: {err}", self.unit, scan.bin);
                return Ok((Step::Continue, false));
            }
        }

        let bins = scan.fragment.bins();
        if scan.bin + 1 != bins {
            info!("unit={} is at bin {} of {}", self.unit, scan.bin + 1, bins);
            scan.bin += 1;
            return Ok((Step::Continue, false));
        }
        Ok((Step::Continue, true))
    }

    fn accept_payload(
        &self,
        scan: &mut ActiveScan,
        header: &CommandHeader,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let descriptor = scan.descriptor.clone();
        protocol::check_payload_len(&descriptor, payload.len())?;
        if !self.options.emulator && header.scan_id != descriptor.scan_id {
            return Err(ProtocolError::ScanIdMismatch {
                expected: descriptor.scan_id,
                got: header.scan_id,
            });
        }
        protocol::decode_bin(&mut scan.fragment, scan.bin, payload)?;

        if descriptor.wants_intermediate() {
            if let Some(snapshot) = descriptor.intermediate_for_bin(scan.bin) {
                let fragment = scan.fragment.bin_snapshot(scan.bin, Arc::new(snapshot));
                debug!(
                    "unit={} created intermediate histogram for bin {}",
                    self.unit, scan.bin
                );
                FarmCounters::bump(&self.counters.intermediates_forwarded);
                self.fit_queue.push(Arc::new(fragment));
            }
        }
        Ok(())
    }

    /// Fill `buf` from the socket, checking for resets whenever the receive times out.
    fn read_polled(
        &self,
        stream: &mut TcpStream,
        buf: &mut [u8],
        scan_id: ScanId,
    ) -> Result<ReadStatus, ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    info!("unit={} socket closed from remote", self.unit);
                    return Ok(ReadStatus::Closed);
                }
                Ok(n) => filled += n,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.reset_check(scan_id) {
                        return Ok(ReadStatus::Reset);
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(ReadStatus::Complete)
    }

    fn reset_check(&self, scan_id: ScanId) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let abort = match self.reset.pending() {
            Some(ResetMode::Unconditional) => true,
            Some(ResetMode::IfCancelled) => self.cancellation.is_cancelled(scan_id),
            None => false,
        };
        if abort {
            info!("unit={} resetting network connection scan_id={scan_id}", self.unit);
            self.reset.clear();
        }
        abort
    }
}

fn write_dump(dump: &mut Option<BufWriter<File>>, bytes: &[u8]) {
    if let Some(writer) = dump.as_mut() {
        if let Err(err) = writer.write_all(bytes) {
            warn!("raw dump write failed, disabling dump: {err}");
            *dump = None;
        }
    }
}

/// `FitServer-{scanId}-m{maskId}-{crate}_{rod}_{slave}_{histo}.dump`
pub fn dump_file_name(descriptor: &ScanDescriptor) -> String {
    let unit = &descriptor.unit;
    format!(
        "FitServer-{}-m{}-{}_{}_{}_{}.dump",
        descriptor.scan_id, descriptor.mask_id, unit.crate_id, unit.rod, unit.slave, unit.histo
    )
}
