//! Heap and spectrum block layouts.
//!
//! A heap block carries `K` heaps laid out as
//!
//! ```text
//! [K x HeapIndexEntry][K x HeapHeader][K x payload]
//! payload = nchannels x nsubbands x 4 f32, [channel][subband][stokes] order
//! ```
//!
//! and a spectrum block carries one integrated spectrum:
//!
//! ```text
//! [SpectrumHeader][nsubbands x 4 x nchannels f32, [subband][stokes][channel] order]
//! ```
//!
//! Both are plain `bytemuck::Pod` records so stages can view ring buffer blocks in
//! place without copying.

use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Number of Stokes parameters per channel and subband.
pub const STOKES: usize = 4;

/// MJD of the Unix epoch (1970-01-01T00:00:00Z).
pub const MJD_UNIX_EPOCH: f64 = 40_587.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Heap status bits as written by the receiver.
pub mod status {
    /// Switching/calibration phase, two low bits
    pub const PHASE_MASK: u32 = 0x3;
    /// Blanking asserted: samples are known bad
    pub const BLANKING: u32 = 0x4;
    /// Scan has not started yet
    pub const SCAN_NOT_STARTED: u32 = 0x8;
    /// Last heap of an integration interval
    pub const INTERVAL_END: u32 = 0x10;
}

/// Per-heap bookkeeping: receipt time and validity.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct HeapIndexEntry {
    /// Receipt time, Modified Julian Day
    pub mjd: f64,
    /// Non-zero when the heap arrived intact
    pub valid: u32,
    _pad: u32,
}

impl HeapIndexEntry {
    /// Entry for a heap received at `mjd`.
    pub fn new(mjd: f64, valid: bool) -> Self {
        Self {
            mjd,
            valid: u32::from(valid),
            _pad: 0,
        }
    }

    /// Whether the heap arrived intact.
    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }
}

/// Per-heap status word plus the receiver's heap counter.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HeapHeader {
    /// Monotonic heap counter from the receiver
    pub counter: u64,
    /// Status bits, see [`status`]
    pub status: u32,
    _pad: u32,
}

impl HeapHeader {
    /// Header for heap `counter` with the given status bits.
    pub fn new(counter: u64, status: u32) -> Self {
        Self {
            counter,
            status,
            _pad: 0,
        }
    }

    /// Switching/calibration phase (0..=3).
    pub fn phase(&self) -> u32 {
        self.status & status::PHASE_MASK
    }

    /// Blanking asserted or scan not yet started.
    pub fn is_blanking(&self) -> bool {
        self.status & (status::BLANKING | status::SCAN_NOT_STARTED) != 0
    }

    /// Last heap of an integration interval.
    pub fn is_interval_end(&self) -> bool {
        self.status & status::INTERVAL_END != 0
    }
}

/// Header of an integrated spectrum block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SpectrumHeader {
    /// MJD of the first non-blanked heap of the integration
    pub mjd: f64,
    /// Integration sequence number
    pub integration: u64,
    /// Heaps summed into the spectrum, blanked heaps excluded
    pub heaps: u32,
    /// Phase in the low bits, [`status::INTERVAL_END`] if the run closed an interval,
    /// [`status::BLANKING`] if blanked heaps were left out of the sum
    pub status: u32,
    /// Channels per subband
    pub nchannels: u32,
    /// Subbands
    pub nsubbands: u32,
}

/// A block's bytes do not fit the expected layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Block smaller than the layout requires
    #[error("Block holds {got} bytes, layout requires {needed}")]
    TooShort {
        /// Required size
        needed: usize,
        /// Actual size
        got: usize,
    },
    /// Region start not aligned for its record type
    #[error("Block region misaligned for {0}")]
    Misaligned(&'static str),
}

fn cast<'a, T: Pod>(bytes: &'a [u8], what: &'static str) -> Result<&'a [T], LayoutError> {
    bytemuck::try_cast_slice(bytes).map_err(|_| LayoutError::Misaligned(what))
}

fn cast_mut<'a, T: Pod>(bytes: &'a mut [u8], what: &'static str) -> Result<&'a mut [T], LayoutError> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|_| LayoutError::Misaligned(what))
}

/// Geometry of a heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlockLayout {
    /// Heaps per block (K)
    pub heaps_per_block: usize,
    /// Channels per subband
    pub nchannels: usize,
    /// Subbands
    pub nsubbands: usize,
}

impl HeapBlockLayout {
    /// `f32` values in one heap payload.
    pub fn payload_len(&self) -> usize {
        self.nchannels * self.nsubbands * STOKES
    }

    fn index_bytes(&self) -> usize {
        self.heaps_per_block * std::mem::size_of::<HeapIndexEntry>()
    }

    fn header_bytes(&self) -> usize {
        self.heaps_per_block * std::mem::size_of::<HeapHeader>()
    }

    /// Bytes one heap block occupies.
    pub fn block_size(&self) -> usize {
        self.index_bytes()
            + self.header_bytes()
            + self.heaps_per_block * self.payload_len() * std::mem::size_of::<f32>()
    }

    fn check(&self, len: usize) -> Result<(), LayoutError> {
        let needed = self.block_size();
        if len < needed {
            return Err(LayoutError::TooShort { needed, got: len });
        }
        Ok(())
    }

    /// Read-only view over a heap block.
    pub fn view<'a>(&self, bytes: &'a [u8]) -> Result<HeapBlock<'a>, LayoutError> {
        self.check(bytes.len())?;
        let (index, rest) = bytes.split_at(self.index_bytes());
        let (headers, rest) = rest.split_at(self.header_bytes());
        let payload_bytes = self.block_size() - self.index_bytes() - self.header_bytes();
        Ok(HeapBlock {
            index: cast(index, "heap index")?,
            headers: cast(headers, "heap headers")?,
            payloads: cast(&rest[..payload_bytes], "heap payload")?,
            payload_len: self.payload_len(),
        })
    }

    /// Mutable view over a heap block.
    pub fn view_mut<'a>(&self, bytes: &'a mut [u8]) -> Result<HeapBlockMut<'a>, LayoutError> {
        self.check(bytes.len())?;
        let index_bytes = self.index_bytes();
        let header_bytes = self.header_bytes();
        let payload_bytes = self.block_size() - index_bytes - header_bytes;
        let (index, rest) = bytes.split_at_mut(index_bytes);
        let (headers, rest) = rest.split_at_mut(header_bytes);
        Ok(HeapBlockMut {
            index: cast_mut(index, "heap index")?,
            headers: cast_mut(headers, "heap headers")?,
            payloads: cast_mut(&mut rest[..payload_bytes], "heap payload")?,
            payload_len: self.payload_len(),
        })
    }
}

/// Borrowed heap block.
#[derive(Debug)]
pub struct HeapBlock<'a> {
    /// Per-heap validity and timestamps
    pub index: &'a [HeapIndexEntry],
    /// Per-heap status words
    pub headers: &'a [HeapHeader],
    payloads: &'a [f32],
    payload_len: usize,
}

impl<'a> HeapBlock<'a> {
    /// Payload of heap `i`, `[channel][subband][stokes]`.
    pub fn payload(&self, i: usize) -> &'a [f32] {
        &self.payloads[i * self.payload_len..(i + 1) * self.payload_len]
    }
}

/// Mutably borrowed heap block.
#[derive(Debug)]
pub struct HeapBlockMut<'a> {
    /// Per-heap validity and timestamps
    pub index: &'a mut [HeapIndexEntry],
    /// Per-heap status words
    pub headers: &'a mut [HeapHeader],
    payloads: &'a mut [f32],
    payload_len: usize,
}

impl HeapBlockMut<'_> {
    /// Payload of heap `i`.
    pub fn payload_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.payloads[i * self.payload_len..(i + 1) * self.payload_len]
    }

    /// Mark every heap from `from` onwards as missing.
    pub fn invalidate_from(&mut self, from: usize) {
        for entry in self.index.iter_mut().skip(from) {
            *entry = HeapIndexEntry::default();
        }
        for header in self.headers.iter_mut().skip(from) {
            *header = HeapHeader::default();
        }
    }
}

/// Geometry of a spectrum block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrumBlockLayout {
    /// Channels per subband
    pub nchannels: usize,
    /// Subbands
    pub nsubbands: usize,
}

impl SpectrumBlockLayout {
    /// `f32` values in one spectrum.
    pub fn payload_len(&self) -> usize {
        self.nchannels * self.nsubbands * STOKES
    }

    /// Bytes one spectrum block occupies.
    pub fn block_size(&self) -> usize {
        std::mem::size_of::<SpectrumHeader>() + self.payload_len() * std::mem::size_of::<f32>()
    }

    /// Read-only view: header and `[subband][stokes][channel]` payload.
    pub fn view<'a>(&self, bytes: &'a [u8]) -> Result<(&'a SpectrumHeader, &'a [f32]), LayoutError> {
        let needed = self.block_size();
        if bytes.len() < needed {
            return Err(LayoutError::TooShort {
                needed,
                got: bytes.len(),
            });
        }
        let (header, payload) = bytes[..needed].split_at(std::mem::size_of::<SpectrumHeader>());
        let header = bytemuck::try_from_bytes(header)
            .map_err(|_| LayoutError::Misaligned("spectrum header"))?;
        Ok((header, cast(payload, "spectrum payload")?))
    }

    /// Mutable view.
    pub fn view_mut<'a>(
        &self,
        bytes: &'a mut [u8],
    ) -> Result<(&'a mut SpectrumHeader, &'a mut [f32]), LayoutError> {
        let needed = self.block_size();
        if bytes.len() < needed {
            return Err(LayoutError::TooShort {
                needed,
                got: bytes.len(),
            });
        }
        let (header, payload) =
            bytes[..needed].split_at_mut(std::mem::size_of::<SpectrumHeader>());
        let header = bytemuck::try_from_bytes_mut(header)
            .map_err(|_| LayoutError::Misaligned("spectrum header"))?;
        Ok((header, cast_mut(payload, "spectrum payload")?))
    }
}

/// Modified Julian Day of a UTC timestamp.
pub fn mjd_from_datetime(time: DateTime<Utc>) -> f64 {
    let seconds = time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) * 1e-9;
    MJD_UNIX_EPOCH + seconds / SECONDS_PER_DAY
}

/// Current Modified Julian Day.
pub fn mjd_now() -> f64 {
    mjd_from_datetime(Utc::now())
}
