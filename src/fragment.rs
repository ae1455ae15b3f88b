//! Flat histogram storage for one (scan, unit, mask step): words are laid out pixel-major,
//! then bin, then word within the pixel.

use std::ops::{Index, IndexMut};
use std::sync::Arc;

use thiserror::Error;

use crate::scan::{ScanDescriptor, ScanId, ScanScoped};

/// Storage type of one histogram word.
pub type HistoWord = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("index out of range: pixel={pixel} bin={bin} word={word}")]
    OutOfRange {
        pixel: usize,
        bin: usize,
        word: usize,
    },
}

/// Flat per-pixel histogram of one scan fragment.
///
/// Layout is pixel-major: `pixel * bins * words + bin * words + word`. The buffer is sized
/// once from the descriptor and never reallocated.
#[derive(Debug)]
pub struct Fragment {
    descriptor: Arc<ScanDescriptor>,
    pixels: usize,
    bins: usize,
    words: usize,
    data: Box<[HistoWord]>,
}

impl Fragment {
    pub fn new(descriptor: Arc<ScanDescriptor>) -> Self {
        let pixels = descriptor.pixels();
        let bins = descriptor.bins();
        let words = descriptor.words_per_pixel();
        let data = vec![0; pixels * bins * words].into_boxed_slice();
        Self {
            descriptor,
            pixels,
            bins,
            words,
            data,
        }
    }

    pub fn descriptor(&self) -> &Arc<ScanDescriptor> {
        &self.descriptor
    }

    pub fn pixels(&self) -> usize {
        self.pixels
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn words_per_pixel(&self) -> usize {
        self.words
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn index_of(&self, pixel: usize, bin: usize, word: usize) -> Option<usize> {
        if pixel >= self.pixels || bin >= self.bins || word >= self.words {
            return None;
        }
        Some(pixel * self.bins * self.words + bin * self.words + word)
    }

    pub fn get(&self, pixel: usize, bin: usize, word: usize) -> Option<HistoWord> {
        self.index_of(pixel, bin, word).map(|idx| self.data[idx])
    }

    pub fn set(
        &mut self,
        pixel: usize,
        bin: usize,
        word: usize,
        value: HistoWord,
    ) -> Result<(), FragmentError> {
        let idx = self
            .index_of(pixel, bin, word)
            .ok_or(FragmentError::OutOfRange { pixel, bin, word })?;
        self.data[idx] = value;
        Ok(())
    }

    /// Occupancy word of `pixel` at every bin, as floating point for fitting.
    pub fn occupancy_curve(&self, pixel: usize) -> Vec<f64> {
        (0..self.bins)
            .map(|bin| self[(pixel, bin, 0)] as f64)
            .collect()
    }

    /// Copy every word of `bin` into a single-bin fragment described by `snapshot`.
    pub fn bin_snapshot(&self, bin: usize, snapshot: Arc<ScanDescriptor>) -> Fragment {
        let mut out = Fragment::new(snapshot);
        let words = self.words.min(out.words);
        for pixel in 0..self.pixels.min(out.pixels) {
            for word in 0..words {
                out[(pixel, 0, word)] = self[(pixel, bin, word)];
            }
        }
        out
    }

    pub fn as_slice(&self) -> &[HistoWord] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [HistoWord] {
        &mut self.data
    }
}

impl Index<(usize, usize, usize)> for Fragment {
    type Output = HistoWord;

    fn index(&self, (pixel, bin, word): (usize, usize, usize)) -> &HistoWord {
        match self.index_of(pixel, bin, word) {
            Some(idx) => &self.data[idx],
            None => panic!("fragment index out of range: pixel={pixel} bin={bin} word={word}"),
        }
    }
}

impl IndexMut<(usize, usize, usize)> for Fragment {
    fn index_mut(&mut self, (pixel, bin, word): (usize, usize, usize)) -> &mut HistoWord {
        match self.index_of(pixel, bin, word) {
            Some(idx) => &mut self.data[idx],
            None => panic!("fragment index out of range: pixel={pixel} bin={bin} word={word}"),
        }
    }
}

impl ScanScoped for Fragment {
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
    fn sizes_follow_descriptor() {
        let desc = Arc::new(descriptor(ScanKind::TotCalib, ReadoutMode::LongTot));
        let fragment = Fragment::new(desc.clone());
        assert_eq!(fragment.len(), desc.pixels() * 5 * 3);
        assert_eq!(fragment.index_of(1, 2, 1), Some(15 + 6 + 1));
    }

    #[test]
    fn accessors_are_bounds_checked() {
        let desc = Arc::new(descriptor(ScanKind::Threshold, ReadoutMode::OnlineOccupancy));
        let mut fragment = Fragment::new(desc);
        fragment.set(7, 4, 0, 42).expect("in range");
        assert_eq!(fragment.get(7, 4, 0), Some(42));
        assert_eq!(fragment[(7, 4, 0)], 42);
        assert_eq!(fragment.get(7, 5, 0), None);
        assert_eq!(fragment.get(7, 0, 1), None);
        assert_eq!(
            fragment.set(3360, 0, 0, 1),
            Err(FragmentError::OutOfRange {
                pixel: 3360,
                bin: 0,
                word: 0
            })
        );
    }

    #[test]
    fn snapshot_copies_one_bin() {
        let desc = Arc::new(descriptor(ScanKind::TotCalib, ReadoutMode::LongTot));
        let mut fragment = Fragment::new(desc.clone());
        fragment[(9, 2, 0)] = 4;
        fragment[(9, 2, 2)] = 80;
        fragment[(9, 3, 0)] = 7;
        let snapshot = desc.intermediate_for_bin(2).expect("snapshot");
        let single = fragment.bin_snapshot(2, Arc::new(snapshot));
        assert_eq!(single.bins(), 1);
        assert_eq!(single[(9, 0, 0)], 4);
        assert_eq!(single[(9, 0, 2)], 80);
        assert_eq!(single.descriptor().bin_number, Some(2));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_panics_outside_buffer() {
        let desc = Arc::new(descriptor(ScanKind::Digital, ReadoutMode::OnlineOccupancy));
        let fragment = Fragment::new(desc);
        let _ = fragment[(0, 1, 0)];
    }
}
