//! # Publishing
//!
//! Drains per-chip results, hands their artifacts to an [`ArtifactSink`] under the
//! artifact builder lock, and signals scan completion once an attempt's expected results
//! have all been published.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactBuilderLock, ChipArtifacts, Hist1D, Hist2D};
use crate::queue::WorkQueue;
use crate::registry::{Cancellation, CompletionTracker, TrackerError};
use crate::result::{FitResult, ResultPayload};
use crate::scan::{AttemptId, IntermediateKind, ScanDescriptor, ScanId};
use crate::stats::FarmCounters;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("completion accounting: {0}")]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum ArtifactData<'a> {
    Hist1D(&'a Hist1D),
    Hist2D(&'a Hist2D),
}

/// One named artifact as handed to a sink.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact<'a> {
    pub folder: &'a str,
    pub name: &'a str,
    pub scan_id: ScanId,
    pub attempt_id: AttemptId,
    pub data: ArtifactData<'a>,
}

/// Destination of published artifacts and completion signals.
pub trait ArtifactSink: Send + Sync {
    fn publish(&self, artifact: &PublishedArtifact<'_>) -> Result<(), PublishError>;
    fn finish_scan(&self, name: &str, attempt: AttemptId) -> Result<(), PublishError>;
    fn flush(&self) -> Result<(), PublishError>;
}

/// Writes one JSON record per line to `artifacts.jsonl`.
pub struct JsonlSink {
    instance_id: String,
    writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum JsonlRecord<'a> {
    Artifact {
        timestamp: String,
        instance_id: &'a str,
        #[serde(flatten)]
        artifact: &'a PublishedArtifact<'a>,
    },
    Finished {
        timestamp: String,
        instance_id: &'a str,
        name: &'a str,
        attempt_id: AttemptId,
    },
}

impl JsonlSink {
    pub fn new(instance_id: &str, output_dir: &Path) -> Result<Self, PublishError> {
        std::fs::create_dir_all(output_dir)?;
        let file = File::create(output_dir.join("artifacts.jsonl"))?;
        Ok(Self {
            instance_id: instance_id.to_string(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_record(&self, record: &JsonlRecord<'_>) -> Result<(), PublishError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *guard, record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ArtifactSink for JsonlSink {
    fn publish(&self, artifact: &PublishedArtifact<'_>) -> Result<(), PublishError> {
        self.write_record(&JsonlRecord::Artifact {
            timestamp: timestamp(),
            instance_id: &self.instance_id,
            artifact,
        })
    }

    fn finish_scan(&self, name: &str, attempt: AttemptId) -> Result<(), PublishError> {
        self.write_record(&JsonlRecord::Finished {
            timestamp: timestamp(),
            instance_id: &self.instance_id,
            name,
            attempt_id: attempt,
        })?;
        // Completion must be visible to readers of the file without waiting for shutdown.
        self.flush()
    }

    fn flush(&self) -> Result<(), PublishError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub folder: String,
    pub name: String,
    pub scan_id: ScanId,
    pub data: serde_json::Value,
}

/// Keeps everything in memory; used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<StoredArtifact>>,
    finished: Mutex<Vec<(String, AttemptId)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<StoredArtifact> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn finished(&self) -> Vec<(String, AttemptId)> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ArtifactSink for MemorySink {
    fn publish(&self, artifact: &PublishedArtifact<'_>) -> Result<(), PublishError> {
        let stored = StoredArtifact {
            folder: artifact.folder.to_string(),
            name: artifact.name.to_string(),
            scan_id: artifact.scan_id,
            data: serde_json::to_value(artifact.data)?,
        };
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stored);
        Ok(())
    }

    fn finish_scan(&self, name: &str, attempt: AttemptId) -> Result<(), PublishError> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), attempt));
        Ok(())
    }

    fn flush(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// `/{scanId}/ROD_{letter}{crate}_S{rod}/Rx{channel}`
pub fn folder_name(desc: &ScanDescriptor, chip: usize) -> String {
    format!(
        "/{}/{}/Rx{}",
        desc.scan_id,
        desc.unit.rod_string(),
        desc.unit.rx_channel(chip)
    )
}

/// Named artifacts of a per-chip result, in publication order.
pub fn named_artifacts<'a>(
    desc: &ScanDescriptor,
    chip: usize,
    artifacts: &'a ChipArtifacts,
) -> Vec<(String, ArtifactData<'a>)> {
    let bin_suffix = match (desc.intermediate, desc.bin_number) {
        (IntermediateKind::None, _) | (_, None) => String::new(),
        (_, Some(bin)) => format!("-{bin}"),
    };
    match artifacts {
        ChipArtifacts::Occupancy { occupancy } => {
            let name = if desc.intermediate == IntermediateKind::Analog {
                format!(
                    "Occup_intermediate_{}_{}_{}{}",
                    desc.unit.slave, desc.unit.histo, chip, bin_suffix
                )
            } else {
                "Occup_0".to_string()
            };
            vec![(name, ArtifactData::Hist2D(occupancy))]
        }
        ChipArtifacts::Threshold {
            threshold,
            noise,
            chi2,
            threshold_map,
            noise_map,
            chi2_map,
        } => vec![
            (format!("1DTh_{chip}"), ArtifactData::Hist1D(threshold)),
            (format!("1DNoi_{chip}"), ArtifactData::Hist1D(noise)),
            (format!("1DChi2_{chip}"), ArtifactData::Hist1D(chi2)),
            (format!("Thr_{chip}"), ArtifactData::Hist2D(threshold_map)),
            (format!("Noise_{chip}"), ArtifactData::Hist2D(noise_map)),
            (format!("Chi2_{chip}"), ArtifactData::Hist2D(chi2_map)),
        ],
        ChipArtifacts::Tot {
            mean,
            sum,
            sum2,
            sigma,
            occupancy,
        } => vec![
            (format!("ToTMean_{chip}{bin_suffix}"), ArtifactData::Hist2D(mean)),
            (format!("ToTSum_{chip}{bin_suffix}"), ArtifactData::Hist2D(sum)),
            (format!("ToTSum2_{chip}{bin_suffix}"), ArtifactData::Hist2D(sum2)),
            (format!("ToTSigma_{chip}{bin_suffix}"), ArtifactData::Hist2D(sigma)),
            (format!("Occ_{chip}{bin_suffix}"), ArtifactData::Hist2D(occupancy)),
        ],
        ChipArtifacts::Empty => Vec::new(),
    }
}

pub struct Publisher {
    sink: Arc<dyn ArtifactSink>,
    tracker: Arc<CompletionTracker>,
    cancellation: Arc<Cancellation>,
    builder_lock: Arc<ArtifactBuilderLock>,
    counters: Arc<FarmCounters>,
}

impl Publisher {
    pub fn new(
        sink: Arc<dyn ArtifactSink>,
        tracker: Arc<CompletionTracker>,
        cancellation: Arc<Cancellation>,
        builder_lock: Arc<ArtifactBuilderLock>,
        counters: Arc<FarmCounters>,
    ) -> Self {
        Self {
            sink,
            tracker,
            cancellation,
            builder_lock,
            counters,
        }
    }

    /// Publish one per-chip result. Returns `true` when it completed its scan attempt.
    ///
    /// Sink failures are logged and do not stop accounting; tracker violations are
    /// returned. Results of cancelled scans are dropped.
    pub fn publish(&self, result: &FitResult) -> Result<bool, PublishError> {
        let desc = &result.descriptor;
        if self.cancellation.is_cancelled(desc.scan_id) {
            debug!("scan_id={} is cancelled, not publishing", desc.scan_id);
            return Ok(false);
        }
        let chip = result.chip.unwrap_or(0);
        match &result.payload {
            ResultPayload::Artifacts(artifacts) => {
                let folder = folder_name(desc, chip);
                let _guard = self.builder_lock.acquire();
                for (name, data) in named_artifacts(desc, chip, artifacts) {
                    let artifact = PublishedArtifact {
                        folder: &folder,
                        name: &name,
                        scan_id: desc.scan_id,
                        attempt_id: desc.attempt_id,
                        data,
                    };
                    if let Err(err) = self.sink.publish(&artifact) {
                        warn!("publish of {folder}/{name} failed: {err}");
                    }
                }
            }
            _ => warn!(
                "unit={} scan_id={} result reached publisher without artifacts",
                desc.unit, desc.scan_id
            ),
        }
        FarmCounters::bump(&self.counters.results_published);

        if desc.is_intermediate() {
            return Ok(false);
        }
        match self.tracker.decrement_and_check(desc.attempt_id) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            // Cancelled while this result was being published; its attempt is retired.
            Err(TrackerError::Unknown(_)) if self.cancellation.is_cancelled(desc.scan_id) => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        let name = format!("{}_FinishScan", desc.unit.rod_string());
        info!(
            "scan_id={} attempt={} finished, signalling {name}",
            desc.scan_id, desc.attempt_id
        );
        if let Err(err) = self.sink.finish_scan(&name, desc.attempt_id) {
            warn!("finish signal {name} failed: {err}");
        }
        FarmCounters::bump(&self.counters.scans_finished);
        Ok(true)
    }

    pub fn run(&self, input: &WorkQueue<FitResult>) -> Result<(), PublishError> {
        while let Some(result) = input.pop() {
            self.publish(&result)?;
        }
        debug!("publisher exiting");
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::tests::descriptor;
    use crate::scan::{ReadoutMode, ScanKind};

    fn publisher(sink: Arc<MemorySink>, tracker: Arc<CompletionTracker>) -> Publisher {
        publisher_with(sink, tracker, Arc::new(Cancellation::new()))
    }

    fn publisher_with(
        sink: Arc<MemorySink>,
        tracker: Arc<CompletionTracker>,
        cancellation: Arc<Cancellation>,
    ) -> Publisher {
        Publisher::new(
            sink,
            tracker,
            cancellation,
            Arc::new(ArtifactBuilderLock::new()),
            Arc::new(FarmCounters::new()),
        )
    }

    #[test]
    fn names_follow_kind_and_bin() {
        let desc = descriptor(ScanKind::Threshold, ReadoutMode::OnlineOccupancy);
        assert_eq!(folder_name(&desc, 2), "/33/ROD_C1_S5/Rx18");

        let threshold = ChipArtifacts::threshold(80, 336, 5);
        let names: Vec<String> = named_artifacts(&desc, 2, &threshold)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            ["1DTh_2", "1DNoi_2", "1DChi2_2", "Thr_2", "Noise_2", "Chi2_2"]
        );

        let snap = desc.intermediate_for_bin(4).expect("snapshot");
        let occ = ChipArtifacts::occupancy(80, 336);
        let named = named_artifacts(&snap, 1, &occ);
        assert_eq!(named[0].0, "Occup_intermediate_1_0_1-4");

        let calib = descriptor(ScanKind::TotCalib, ReadoutMode::LongTot);
        let snap = calib.intermediate_for_bin(3).expect("snapshot");
        let tot = ChipArtifacts::tot(80, 336);
        let named = named_artifacts(&snap, 0, &tot);
        assert_eq!(named[0].0, "ToTMean_0-3");
        assert_eq!(named[4].0, "Occ_0-3");
        assert!(named_artifacts(&calib, 0, &ChipArtifacts::Empty).is_empty());
    }

    #[test]
    fn signals_finish_after_last_expected_result() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Arc::new(CompletionTracker::new());
        tracker.set_expected(0, 33, 2).expect("register");
        let publisher = publisher(sink.clone(), tracker);

        let desc = Arc::new(descriptor(ScanKind::Digital, ReadoutMode::OnlineOccupancy));
        let result = FitResult::for_chip(desc.clone(), 0, ChipArtifacts::occupancy(80, 336));
        assert!(!publisher.publish(&result).expect("publish"));

        let mut snap = (*desc).clone();
        snap.intermediate = IntermediateKind::Analog;
        snap.bin_number = Some(0);
        let intermediate = FitResult::for_chip(Arc::new(snap), 0, ChipArtifacts::occupancy(80, 336));
        assert!(!publisher.publish(&intermediate).expect("publish"));

        assert!(publisher.publish(&result).expect("publish"));
        assert_eq!(sink.finished(), vec![("ROD_C1_S5_FinishScan".to_string(), 0)]);
        assert_eq!(sink.artifacts().len(), 3);
        assert_eq!(sink.artifacts()[0].folder, "/33/ROD_C1_S5/Rx16");
    }

    #[test]
    fn unknown_attempt_is_an_error() {
        let publisher = publisher(Arc::new(MemorySink::new()), Arc::new(CompletionTracker::new()));
        let desc = Arc::new(descriptor(ScanKind::TotCalib, ReadoutMode::LongTot));
        let result = FitResult::for_chip(desc, 0, ChipArtifacts::Empty);
        assert!(matches!(
            publisher.publish(&result),
            Err(PublishError::Tracker(TrackerError::Unknown(0)))
        ));
    }

    #[test]
    fn retired_attempt_of_cancelled_scan_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let tracker = Arc::new(CompletionTracker::new());
        let cancellation = Arc::new(Cancellation::new());
        tracker.set_expected(0, 33, 2).expect("register");
        let publisher = publisher_with(sink.clone(), tracker.clone(), cancellation.clone());

        cancellation.cancel(33);
        assert_eq!(tracker.retire_scan(33), 1);
        let desc = Arc::new(descriptor(ScanKind::Digital, ReadoutMode::OnlineOccupancy));
        let result = FitResult::for_chip(desc, 0, ChipArtifacts::occupancy(80, 336));
        assert!(!publisher.publish(&result).expect("cancelled result is not an error"));
        assert!(sink.artifacts().is_empty());
        assert!(sink.finished().is_empty());
    }

    #[test]
    fn jsonl_sink_writes_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonlSink::new("farm-1", dir.path()).expect("sink");
        let hist = Hist1D::new(4, 0.0, 4.0);
        sink.publish(&PublishedArtifact {
            folder: "/1/ROD_C1_S5/Rx0",
            name: "1DTh_0",
            scan_id: 1,
            attempt_id: 0,
            data: ArtifactData::Hist1D(&hist),
        })
        .expect("publish");
        sink.finish_scan("ROD_C1_S5_FinishScan", 0).expect("finish");

        let text = std::fs::read_to_string(dir.path().join("artifacts.jsonl")).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["record"], "artifact");
        assert_eq!(lines[0]["name"], "1DTh_0");
        assert_eq!(lines[0]["data"]["counts"].as_array().map(Vec::len), Some(4));
        assert_eq!(lines[1]["record"], "finished");
        assert_eq!(lines[1]["instance_id"], "farm-1");
    }
}
