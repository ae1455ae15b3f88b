//! Shared test infrastructure: scan templates, a loopback ROD-slave client that speaks
//! the histogram protocol, and polling helpers for the threaded pipeline.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fitfarm::config::{self, Config, ScanTemplate};
use fitfarm::manager::Manager;
use fitfarm::net::protocol::{self, CommandHeader, PixelSample};
use fitfarm::publisher::MemorySink;
use fitfarm::scan::{HistoUnit, ReadoutMode, ScanDescriptor, ScanKind};

pub const SCAN_ID: u32 = 33;

pub fn unit(slave: u32, histo: u32) -> HistoUnit {
    HistoUnit {
        crate_letter: 'C',
        crate_id: 1,
        rod: 5,
        slave,
        histo,
    }
}

/// One-chip FE-I4 template.
pub fn template(kind: ScanKind, readout: ReadoutMode, bins: usize, mask_steps: usize) -> ScanTemplate {
    ScanTemplate {
        kind,
        readout,
        bins,
        injections: 100,
        mask_steps,
        total_mask_steps: mask_steps.max(1),
        chips: 1,
        rows: 336,
        cols: 80,
        intermediate_histos: false,
        vcal: None,
    }
}

pub fn descriptor(template: &ScanTemplate, mask_id: usize) -> Arc<ScanDescriptor> {
    Arc::new(template.descriptor(SCAN_ID, 0, unit(0, 0), 0xFF, mask_id))
}

/// Default configuration on loopback with OS-assigned ports.
pub fn test_config(template: ScanTemplate) -> Config {
    let mut config = config::load_config(None).expect("default config").config;
    config.instance_id = "test".to_string();
    config.listen_ip = IpAddr::from([127, 0, 0, 1]);
    config.start_port = 0;
    config.rods = vec!["ROD_C1_S5".to_string()];
    config.fitter.threads = 2;
    config.scan = template;
    config
}

pub fn start_farm(config: &Config) -> (Manager, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let manager = Manager::start(config, sink.clone()).expect("start farm");
    (manager, sink)
}

pub fn endpoint_addr(manager: &Manager, slave: u32, histo: u32) -> SocketAddr {
    manager
        .endpoint_addrs()
        .into_iter()
        .find(|(unit, _)| unit.slave == slave && unit.histo == histo)
        .map(|(_, addr)| addr)
        .expect("endpoint for unit")
}

/// Synthetic readout slave.
pub struct SlaveClient {
    stream: TcpStream,
}

impl SlaveClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to endpoint");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        Self { stream }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send");
        self.stream.flush().expect("flush");
    }

    pub fn send_header(&mut self, header: CommandHeader) {
        self.send_raw(&header.to_be_bytes());
    }

    pub fn send_bin(&mut self, bin: u32, scan_id: u32, readout: ReadoutMode, samples: &[PixelSample]) {
        let payload = protocol::encode_payload(readout, samples);
        self.send_raw(&protocol::encode_hist_frame(bin, scan_id, &payload));
    }

    /// True once the endpoint has closed its side of the connection.
    pub fn closed_by_peer(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.stream.read(&mut buf), Ok(0))
    }
}

/// Occupancy-only samples with `occ(pixel)` counts.
pub fn occupancy_samples(pixels: usize, occ: impl Fn(usize) -> u32) -> Vec<PixelSample> {
    (0..pixels)
        .map(|pixel| PixelSample {
            occ: occ(pixel),
            ..PixelSample::default()
        })
        .collect()
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
