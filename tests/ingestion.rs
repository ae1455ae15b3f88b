mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fitfarm::fragment::Fragment;
use fitfarm::net::protocol::{CommandHeader, PixelSample};
use fitfarm::net::{Endpoint, EndpointOptions, ResetMode};
use fitfarm::queue::WorkQueue;
use fitfarm::registry::Cancellation;
use fitfarm::scan::{IntermediateKind, ReadoutMode, ScanKind, ScanScoped};
use fitfarm::stats::FarmCounters;

use common::{SCAN_ID, SlaveClient, descriptor, occupancy_samples, template, unit, wait_for};

struct Harness {
    endpoint: Arc<Endpoint>,
    fit_queue: Arc<WorkQueue<Fragment>>,
    cancellation: Arc<Cancellation>,
    counters: Arc<FarmCounters>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn start(options: EndpointOptions) -> Self {
        let cancellation = Arc::new(Cancellation::new());
        let fit_queue = Arc::new(WorkQueue::with_cancellation("fit", cancellation.clone()));
        let counters = Arc::new(FarmCounters::new());
        let endpoint = Arc::new(
            Endpoint::bind(
                unit(0, 0),
                "127.0.0.1:0".parse::<SocketAddr>().expect("addr"),
                fit_queue.clone(),
                cancellation.clone(),
                options,
                counters.clone(),
            )
            .expect("bind"),
        );
        let handle = {
            let endpoint = endpoint.clone();
            thread::spawn(move || endpoint.run())
        };
        Self {
            endpoint,
            fit_queue,
            cancellation,
            counters,
            handle: Some(handle),
        }
    }

    fn next_fragment(&self) -> Arc<Fragment> {
        let mut found = None;
        assert!(
            wait_for(Duration::from_secs(5), || {
                found = self.fit_queue.try_pop();
                found.is_some()
            }),
            "no fragment arrived"
        );
        found.expect("fragment")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.endpoint.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn bad_magic_is_skipped_and_connection_stays_usable() {
    let harness = Harness::start(EndpointOptions::default());
    let tmpl = template(ScanKind::Threshold, ReadoutMode::OnlineOccupancy, 3, 8);
    let desc = descriptor(&tmpl, 0);
    let pixels = desc.pixels();
    assert!(harness.endpoint.put_scan_config(desc));

    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    let mut bad = CommandHeader::hist_data(0, 0, SCAN_ID);
    bad.magic = 0xDEAD_BEEF;
    client.send_header(bad);
    for bin in 0..3u32 {
        let samples = occupancy_samples(pixels, |pixel| pixel as u32 + bin);
        client.send_bin(bin, SCAN_ID, ReadoutMode::OnlineOccupancy, &samples);
    }

    let fragment = harness.next_fragment();
    assert_eq!(fragment.bins(), 3);
    assert_eq!(fragment[(10, 0, 0)], 10);
    assert_eq!(fragment[(10, 2, 0)], 12);
    let stats = harness.counters.snapshot();
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.histograms_completed, 1);
}

#[test]
fn mismatched_frames_are_dropped_without_advancing() {
    let harness = Harness::start(EndpointOptions::default());
    let tmpl = template(ScanKind::Digital, ReadoutMode::OnlineOccupancy, 1, 8);
    let desc = descriptor(&tmpl, 0);
    let pixels = desc.pixels();
    harness.endpoint.put_scan_config(desc);

    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    let good = occupancy_samples(pixels, |_| 7);
    client.send_bin(0, SCAN_ID + 1, ReadoutMode::OnlineOccupancy, &good);
    let short = occupancy_samples(pixels - 1, |_| 9);
    client.send_bin(0, SCAN_ID, ReadoutMode::OnlineOccupancy, &short);
    client.send_bin(0, SCAN_ID, ReadoutMode::OnlineOccupancy, &good);

    let fragment = harness.next_fragment();
    assert_eq!(fragment[(0, 0, 0)], 7);
    assert_eq!(harness.counters.snapshot().frames_dropped, 2);
}

#[test]
fn emulator_ignores_scan_id_in_header() {
    let harness = Harness::start(EndpointOptions {
        emulator: true,
        ..EndpointOptions::default()
    });
    let tmpl = template(ScanKind::Analog, ReadoutMode::OfflineOccupancy, 1, 8);
    let desc = descriptor(&tmpl, 0);
    let pixels = desc.pixels();
    harness.endpoint.put_scan_config(desc);

    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    client.send_bin(0, 0, ReadoutMode::OfflineOccupancy, &occupancy_samples(pixels, |_| 3));
    assert_eq!(harness.next_fragment()[(5, 0, 0)], 3);
}

#[test]
fn tot_calibration_forwards_snapshot_per_bin() {
    let harness = Harness::start(EndpointOptions::default());
    let tmpl = template(ScanKind::TotCalib, ReadoutMode::LongTot, 2, 8);
    let desc = descriptor(&tmpl, 0);
    let pixels = desc.pixels();
    harness.endpoint.put_scan_config(desc);

    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    for bin in 0..2u32 {
        let samples: Vec<PixelSample> = (0..pixels)
            .map(|_| PixelSample {
                occ: 4,
                tot: 20 + bin,
                tot2: 100,
            })
            .collect();
        client.send_bin(bin, SCAN_ID, ReadoutMode::LongTot, &samples);
    }

    let first = harness.next_fragment();
    assert_eq!(first.descriptor().intermediate, IntermediateKind::Tot);
    assert_eq!(first.descriptor().bin_number, Some(0));
    assert_eq!(first[(0, 0, 1)], 20);
    let second = harness.next_fragment();
    assert_eq!(second.descriptor().bin_number, Some(1));
    let full = harness.next_fragment();
    assert_eq!(full.descriptor().intermediate, IntermediateKind::None);
    assert_eq!(full[(0, 1, 1)], 21);
    assert_eq!(harness.counters.snapshot().intermediates_forwarded, 2);
}

#[test]
fn reset_of_cancelled_scan_drops_connection() {
    let harness = Harness::start(EndpointOptions {
        poll_timeout: Duration::from_millis(100),
        ..EndpointOptions::default()
    });
    let tmpl = template(ScanKind::Threshold, ReadoutMode::OnlineOccupancy, 3, 8);
    let desc = descriptor(&tmpl, 0);
    let pixels = desc.pixels();
    harness.endpoint.put_scan_config(desc.clone());

    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    client.send_bin(0, SCAN_ID, ReadoutMode::OnlineOccupancy, &occupancy_samples(pixels, |_| 1));
    assert!(wait_for(Duration::from_secs(5), || {
        harness.counters.snapshot().frames_received == 1
    }));

    harness.endpoint.reset_network(ResetMode::IfCancelled);
    thread::sleep(Duration::from_millis(300));
    harness.cancellation.cancel(SCAN_ID);
    assert!(client.closed_by_peer());
    assert!(harness.fit_queue.try_pop().is_none());

    // A fresh scan on a new connection is served normally.
    let mut next = tmpl.descriptor(SCAN_ID + 1, 1, unit(0, 0), 0xFF, 0);
    next.loop_bins = 1;
    next.kind = ScanKind::Digital;
    harness.endpoint.put_scan_config(Arc::new(next));
    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    client.send_bin(0, SCAN_ID + 1, ReadoutMode::OnlineOccupancy, &occupancy_samples(pixels, |_| 2));
    assert_eq!(harness.next_fragment().scan_id(), SCAN_ID + 1);
}

#[test]
fn dump_captures_raw_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let harness = Harness::start(EndpointOptions {
        dump_dir: Some(dir.path().to_path_buf()),
        ..EndpointOptions::default()
    });
    let tmpl = template(ScanKind::Digital, ReadoutMode::OfflineOccupancy, 1, 8);
    let desc = descriptor(&tmpl, 0);
    let pixels = desc.pixels();
    harness.endpoint.put_scan_config(desc);

    let mut client = SlaveClient::connect(harness.endpoint.local_addr());
    client.send_bin(0, SCAN_ID, ReadoutMode::OfflineOccupancy, &occupancy_samples(pixels, |_| 1));
    harness.next_fragment();

    let dump = dir.path().join("FitServer-33-m0-1_5_0_0.dump");
    let bytes = std::fs::read(dump).expect("dump file");
    assert_eq!(bytes.len(), 20 + pixels);
}
