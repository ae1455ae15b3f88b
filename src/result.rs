use std::sync::Arc;

use crate::artifact::ChipArtifacts;
use crate::fragment::Fragment;
use crate::scan::{ScanDescriptor, ScanId, ScanScoped};

#[derive(Debug)]
pub enum ResultPayload {
    /// Fragment forwarded without fitting.
    Raw(Arc<Fragment>),
    /// `[μ0, σ0, μ1, σ1, …, χ²0, χ²1, …]`, three values per pixel.
    Params(Vec<f64>),
    /// Kinds that produce nothing at the fit stage.
    Empty,
    /// Per-chip aggregates after reassembly.
    Artifacts(ChipArtifacts),
}

/// Output of the fit stage for one fragment, or of the assembler for one chip.
#[derive(Debug)]
pub struct FitResult {
    pub descriptor: Arc<ScanDescriptor>,
    /// Set once the assembler has split the result per chip.
    pub chip: Option<usize>,
    pub payload: ResultPayload,
}

impl FitResult {
    pub fn new(descriptor: Arc<ScanDescriptor>, payload: ResultPayload) -> Self {
        Self {
            descriptor,
            chip: None,
            payload,
        }
    }

    pub fn for_chip(descriptor: Arc<ScanDescriptor>, chip: usize, artifacts: ChipArtifacts) -> Self {
        Self {
            descriptor,
            chip: Some(chip),
            payload: ResultPayload::Artifacts(artifacts),
        }
    }

    /// Mean, sigma and χ²/dof of `pixel` for fitted results.
    pub fn pixel_params(&self, pixel: usize) -> Option<(f64, f64, f64)> {
        let ResultPayload::Params(params) = &self.payload else {
            return None;
        };
        let pixels = params.len() / 3;
        if pixel >= pixels {
            return None;
        }
        Some((
            params[2 * pixel],
            params[2 * pixel + 1],
            params[2 * pixels + pixel],
        ))
    }
}

impl ScanScoped for FitResult {
    fn scan_id(&self) -> ScanId {
        self.descriptor.scan_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::tests::descriptor;
    use crate::scan::{ReadoutMode, ScanKind};

    #[test]
    fn params_are_read_per_pixel() {
        let desc = Arc::new(descriptor(ScanKind::Threshold, ReadoutMode::OnlineOccupancy));
        let result = FitResult::new(
            desc,
            ResultPayload::Params(vec![1.0, 0.5, 2.0, 0.25, 0.1, 0.2]),
        );
        assert_eq!(result.pixel_params(1), Some((2.0, 0.25, 0.2)));
        assert_eq!(result.pixel_params(2), None);
        assert_eq!(result.scan_id(), 33);
    }
}
