use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fit::FitterConfig;
use crate::scan::{
    AttemptId, DescriptorError, HistoUnit, IntermediateKind, ReadoutMode, ScanDescriptor, ScanId,
    ScanKind, VcalRange,
};

/// Scan parameters applied to every scan this instance sets up.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScanTemplate {
    pub kind: ScanKind,
    pub readout: ReadoutMode,
    pub bins: usize,
    pub injections: u32,
    pub mask_steps: usize,
    pub total_mask_steps: usize,
    pub chips: usize,
    pub rows: usize,
    pub cols: usize,
    #[serde(default)]
    pub intermediate_histos: bool,
    #[serde(default)]
    pub vcal: Option<VcalRange>,
}

impl ScanTemplate {
    /// Descriptor of mask step `mask_id` for one histogram unit.
    pub fn descriptor(
        &self,
        scan_id: ScanId,
        attempt_id: AttemptId,
        unit: HistoUnit,
        module_mask: u32,
        mask_id: usize,
    ) -> ScanDescriptor {
        ScanDescriptor {
            scan_id,
            attempt_id,
            kind: self.kind,
            readout: self.readout,
            loop_bins: self.bins,
            injections: self.injections,
            mask_steps: self.mask_steps,
            total_mask_steps: self.total_mask_steps,
            chips: self.chips,
            rows: self.rows,
            cols: self.cols,
            mask_id,
            unit,
            module_mask,
            intermediate_histos: self.intermediate_histos,
            intermediate: IntermediateKind::None,
            bin_number: None,
            vcal: self.vcal,
        }
    }

    pub fn validate(&self, unit: &HistoUnit) -> Result<(), DescriptorError> {
        self.descriptor(0, 0, unit.clone(), 0, 0).validate()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub instance_id: String,
    pub listen_ip: IpAddr,
    pub start_port: u16,
    pub rods: Vec<String>,
    #[serde(default)]
    pub emulator: bool,
    #[serde(default)]
    pub dump_network: bool,
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
    #[serde(default)]
    pub fitter: FitterConfig,
    pub scan: ScanTemplate,
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("./dumps")
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p).with_context(|| format!("reading config {}", p.display()))?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes).context("parsing config")?;
    if config.instance_id.trim().is_empty() {
        config.instance_id = generate_instance_id();
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig {
        config,
        config_hash,
    })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn generate_instance_id() -> String {
    let now = chrono::Utc::now();
    format!(
        "fitfarm_{}_{:08x}",
        now.format("%Y%m%dT%H%M%SZ"),
        now.timestamp_subsec_nanos()
    )
}
