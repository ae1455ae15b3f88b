//! # Slave Network Protocol
//!
//! Command header and payload layout of the histogram stream sent by the readout slaves.
//! Header fields travel in network byte order; payload words are in the receiving host's
//! little-endian order, as the slaves write them.

use thiserror::Error;

use crate::fragment::Fragment;
use crate::scan::{ReadoutMode, ScanDescriptor, ScanId, ScanKind};

pub const SLAVE_NET_MAGIC: u32 = 0x1B1F_A57E;
pub const HIST_DATA_CMD: u32 = 0x0000_0001;
pub const HEADER_LEN: usize = 20;
/// Receive buffer limit for one payload.
pub const MAX_PAYLOAD: usize = 4_000_000;

/// Unsigned field of a packed 32-bit histogram word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub shift: u32,
    pub bits: u32,
}

impl BitField {
    pub const fn new(shift: u32, bits: u32) -> Self {
        Self { shift, bits }
    }

    pub const fn mask(self) -> u32 {
        ((1u64 << self.bits) - 1) as u32
    }

    pub fn extract(self, word: u32) -> u32 {
        (word >> self.shift) & self.mask()
    }

    /// Place `value` (truncated to the field width) at the field position.
    pub fn pack(self, value: u32) -> u32 {
        (value & self.mask()) << self.shift
    }
}

pub const MISSING_TRIGGERS_BITS: u32 = 4;
pub const OCC_BITS: u32 = 8;
pub const TOT_BITS: u32 = 12;
pub const TOTSQR_BITS: u32 = 16;

/// Short ToT readout: one word per pixel.
pub mod one_word {
    use super::*;

    pub const MISSING_TRIGGERS: BitField = BitField::new(0, MISSING_TRIGGERS_BITS);
    pub const TOT: BitField = BitField::new(4, TOT_BITS);
    pub const TOTSQR: BitField = BitField::new(16, TOTSQR_BITS);
}

/// Long ToT readout: an occupancy word followed by a ToT/ToT² word per pixel.
pub mod two_word {
    use super::*;

    pub const OCC: BitField = BitField::new(0, OCC_BITS);
    pub const TOT: BitField = BitField::new(0, TOT_BITS);
    pub const TOTSQR: BitField = BitField::new(12, TOTSQR_BITS);
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic word 0x{0:08x}")]
    BadMagic(u32),
    #[error("mismatch in number of pixels: expected {expected}, got {got}")]
    PixelMismatch { expected: usize, got: usize },
    #[error("mismatch in scan id: slave says {got}, expected {expected}")]
    ScanIdMismatch { expected: ScanId, got: ScanId },
    #[error("payload of {0} bytes exceeds receive buffer")]
    PayloadTooLarge(usize),
    #[error("readout mode {readout:?} cannot carry {kind:?} data")]
    UnsupportedReadout { kind: ScanKind, readout: ReadoutMode },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub magic: u32,
    pub command: u32,
    pub bins: u32,
    pub payload_size: u32,
    pub scan_id: ScanId,
}

impl CommandHeader {
    pub fn hist_data(bin: u32, payload_size: u32, scan_id: ScanId) -> Self {
        Self {
            magic: SLAVE_NET_MAGIC,
            command: HIST_DATA_CMD,
            bins: bin,
            payload_size,
            scan_id,
        }
    }

    pub fn from_be_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        let field = |idx: usize| {
            let start = idx * 4;
            u32::from_be_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]])
        };
        Self {
            magic: field(0),
            command: field(1),
            bins: field(2),
            payload_size: field(3),
            scan_id: field(4),
        }
    }

    pub fn to_be_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let fields = [
            self.magic,
            self.command,
            self.bins,
            self.payload_size,
            self.scan_id,
        ];
        for (chunk, value) in buf.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
        buf
    }

    pub fn check_magic(&self) -> Result<(), ProtocolError> {
        if self.magic == SLAVE_NET_MAGIC {
            Ok(())
        } else {
            Err(ProtocolError::BadMagic(self.magic))
        }
    }
}

fn le_words(payload: &[u8]) -> impl Iterator<Item = u32> + '_ {
    payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

/// Check that a payload carries exactly one value set per pixel of `desc`.
pub fn check_payload_len(desc: &ScanDescriptor, len: usize) -> Result<(), ProtocolError> {
    let expected = desc.pixels();
    if len != desc.payload_len() {
        return Err(ProtocolError::PixelMismatch {
            expected,
            got: len / desc.bytes_per_pixel(),
        });
    }
    Ok(())
}

/// Decode one bin of payload into `fragment` according to its scan kind and readout mode.
pub fn decode_bin(fragment: &mut Fragment, bin: usize, payload: &[u8]) -> Result<(), ProtocolError> {
    let desc = fragment.descriptor().clone();
    check_payload_len(&desc, payload.len())?;

    match (desc.kind.is_occupancy(), desc.readout) {
        (true, ReadoutMode::OfflineOccupancy) => {
            for (pixel, &count) in payload.iter().enumerate() {
                fragment[(pixel, bin, 0)] = u32::from(count);
            }
        }
        (true, ReadoutMode::OnlineOccupancy) => {
            for (pixel, count) in le_words(payload).enumerate() {
                fragment[(pixel, bin, 0)] = count;
            }
        }
        (true, ReadoutMode::ShortTot) => {
            for (pixel, word) in le_words(payload).enumerate() {
                fragment[(pixel, bin, 0)] = one_word::MISSING_TRIGGERS.extract(word);
            }
        }
        (true, ReadoutMode::LongTot) => {
            for (pixel, word) in le_words(payload).step_by(2).enumerate() {
                fragment[(pixel, bin, 0)] = two_word::OCC.extract(word);
            }
        }
        (false, ReadoutMode::ShortTot) => {
            for (pixel, word) in le_words(payload).enumerate() {
                fragment[(pixel, bin, 0)] = one_word::MISSING_TRIGGERS.extract(word);
                fragment[(pixel, bin, 1)] = one_word::TOT.extract(word);
                fragment[(pixel, bin, 2)] = one_word::TOTSQR.extract(word);
            }
        }
        (false, ReadoutMode::LongTot) => {
            for (j, word) in le_words(payload).enumerate() {
                if j % 2 == 0 {
                    fragment[(j / 2, bin, 0)] = two_word::OCC.extract(word);
                } else {
                    let pixel = (j - 1) / 2;
                    fragment[(pixel, bin, 1)] = two_word::TOT.extract(word);
                    fragment[(pixel, bin, 2)] = two_word::TOTSQR.extract(word);
                }
            }
        }
        (false, readout) => {
            return Err(ProtocolError::UnsupportedReadout {
                kind: desc.kind,
                readout,
            });
        }
    }
    Ok(())
}

/// Per-pixel values a slave accumulates for one bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelSample {
    pub occ: u32,
    pub tot: u32,
    pub tot2: u32,
}

/// Pack samples the way a slave ships them for `readout`. Inverse of [`decode_bin`].
pub fn encode_payload(readout: ReadoutMode, samples: &[PixelSample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * readout.bytes_per_pixel());
    for sample in samples {
        match readout {
            ReadoutMode::OfflineOccupancy => out.push(sample.occ.min(u32::from(u8::MAX)) as u8),
            ReadoutMode::OnlineOccupancy => out.extend_from_slice(&sample.occ.to_le_bytes()),
            ReadoutMode::ShortTot => {
                let word = one_word::MISSING_TRIGGERS.pack(sample.occ)
                    | one_word::TOT.pack(sample.tot)
                    | one_word::TOTSQR.pack(sample.tot2);
                out.extend_from_slice(&word.to_le_bytes());
            }
            ReadoutMode::LongTot => {
                out.extend_from_slice(&two_word::OCC.pack(sample.occ).to_le_bytes());
                let word = two_word::TOT.pack(sample.tot) | two_word::TOTSQR.pack(sample.tot2);
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
    }
    out
}

/// Header plus payload of one histogram-data command.
pub fn encode_hist_frame(bin: u32, scan_id: ScanId, payload: &[u8]) -> Vec<u8> {
    let header = CommandHeader::hist_data(bin, payload.len() as u32, scan_id);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
