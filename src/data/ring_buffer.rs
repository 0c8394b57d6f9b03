#![allow(unsafe_code)]
//! Memory-mapped block ring buffer shared between pipeline stages.
//!
//! Each ring is a fixed sequence of equally sized blocks living in a memory-mapped
//! file (normally under `/dev/shm`), so stages running in different threads or
//! different processes exchange data without copying it through a socket or pipe.
//!
//! # Block life cycle
//!
//! ```text
//! FREE -> FILLING -> FULL -> PROCESSING -> DONE -> FREE
//!         \_______ producer ______/ \______ consumer ______/
//! ```
//!
//! Exactly one producer and one consumer use a ring. The producer walks the blocks
//! in order with a write cursor and the consumer follows with a read cursor, so the
//! consumer always sees the oldest `FULL` block first (FIFO). The only shared mutable
//! state is the per-block state word plus the two cursors, all of which are atomics
//! stored inside the mapping.
//!
//! # Memory Layout
//! ```text
//! [128-byte header] [block_count x 64-byte slot] [block_count x block_stride data]
//!
//! Header (cache-line aligned):
//!   magic: u64               (0xDA_DA_DA_DA_00_00_00_02)
//!   block_count: u64
//!   block_size: u64          (usable bytes per block)
//!   block_stride: u64        (block_size rounded up to 64 bytes)
//!   write_cursor: AtomicU64  (next block the producer fills)
//!   read_cursor: AtomicU64   (next block the consumer drains)
//!   published: AtomicU64     (blocks made FULL since the last clear)
//!   dropped: AtomicU64       (producer timeouts since the last clear)
//!   buffer_id: u32
//!   tag_len: u32
//!   tag: [u8; 32]
//!   padding: [u8; 24]
//!
//! Slot (one cache line per block):
//!   state: AtomicU32
//!   reserved: u32
//!   sequence: AtomicU64      (publish order of the block's current contents)
//!   padding: [u8; 48]
//! ```
//!
//! # Backpressure
//!
//! Nothing here ever blocks indefinitely. When the consumer falls behind, the
//! producer's [`RingBuffer::acquire_free`] times out and the producer is expected to
//! skip that unit of data and call [`RingBuffer::record_drop`].

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Magic number for ring header validation
const MAGIC: u64 = 0xDA_DA_DA_DA_00_00_00_02;

/// Size of the ring header in bytes (2 cache lines)
const HEADER_SIZE: usize = 128;

/// Size of one block state slot (1 cache line)
const SLOT_SIZE: usize = 64;

/// Alignment of every block's data region
const BLOCK_ALIGN: usize = 64;

/// Maximum stored tag length in bytes
pub const MAX_TAG_LEN: usize = 32;

/// Busy-wait attempts before a waiter starts sleeping.
const SPIN_LIMIT: u32 = 128;

/// Longest single sleep while waiting on a block state.
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// Backing file name prefix inside a [`ShmNamespace`].
const FILE_PREFIX: &str = "heap_daq_ring_";

#[repr(C)]
struct RingHeader {
    magic: u64,
    block_count: u64,
    block_size: u64,
    block_stride: u64,
    write_cursor: AtomicU64,
    read_cursor: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    buffer_id: u32,
    tag_len: u32,
    tag: [u8; MAX_TAG_LEN],
    _padding: [u8; 24],
}

#[repr(C)]
struct BlockSlot {
    state: AtomicU32,
    _reserved: u32,
    sequence: AtomicU64,
    _padding: [u8; 48],
}

const _: () = assert!(
    std::mem::size_of::<RingHeader>() == HEADER_SIZE,
    "RingHeader size must equal HEADER_SIZE (128 bytes)"
);
const _: () = assert!(
    std::mem::size_of::<BlockSlot>() == SLOT_SIZE,
    "BlockSlot size must equal SLOT_SIZE (64 bytes)"
);

/// Occupancy state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlockState {
    /// Available to the producer
    Free = 0,
    /// Owned by the producer while it writes
    Filling = 1,
    /// Published and waiting for the consumer
    Full = 2,
    /// Owned by the consumer while it reads
    Processing = 3,
    /// Consumed, about to be recycled
    Done = 4,
}

impl BlockState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Filling,
            2 => Self::Full,
            3 => Self::Processing,
            4 => Self::Done,
            _ => Self::Free,
        }
    }
}

/// Errors raised by ring buffer creation, attachment and waits.
#[derive(Error, Debug)]
pub enum RingBufferError {
    /// Backing file could not be opened, sized or mapped
    #[error("Ring buffer {id} I/O failure on {path:?}: {source}")]
    Io {
        /// Buffer id
        id: u32,
        /// Backing file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Existing mapping does not carry the ring magic number
    #[error("Invalid ring buffer magic number in {path:?}: expected 0x{expected:016X}, got 0x{found:016X}")]
    BadMagic {
        /// Backing file
        path: PathBuf,
        /// Expected magic
        expected: u64,
        /// Magic found in the file
        found: u64,
    },

    /// Backing file is shorter than its header claims
    #[error("Ring buffer file {path:?} is {actual} bytes, header requires {required}")]
    Truncated {
        /// Backing file
        path: PathBuf,
        /// Size implied by the header
        required: u64,
        /// Actual file size
        actual: u64,
    },

    /// Requested geometry cannot be created
    #[error("Invalid ring geometry: {block_count} blocks of {block_size} bytes")]
    InvalidGeometry {
        /// Requested block count
        block_count: usize,
        /// Requested block size
        block_size: usize,
    },

    /// No block reached the wanted state within the timeout
    #[error("Ring buffer {id}: no {wanted:?} block within {timeout:?}")]
    Timeout {
        /// Buffer id
        id: u32,
        /// State that was waited for
        wanted: BlockState,
        /// Timeout that elapsed
        timeout: Duration,
    },
}

impl RingBufferError {
    /// True for wait timeouts, which are recoverable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for ring buffer operations.
pub type Result<T> = std::result::Result<T, RingBufferError>;

/// Counters read from a ring header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Blocks published since the last clear
    pub published: u64,
    /// Producer timeouts recorded since the last clear
    pub dropped: u64,
    /// Next block index the producer will fill
    pub write_cursor: u64,
    /// Next block index the consumer will drain
    pub read_cursor: u64,
}

impl RingStats {
    /// Fraction of producer attempts that were dropped.
    pub fn drop_fraction(&self) -> f64 {
        let total = self.published + self.dropped;
        if total == 0 {
            0.0
        } else {
            self.dropped as f64 / total as f64
        }
    }
}

/// Directory in which ring buffers are looked up by id.
///
/// Any process constructing a namespace over the same directory can attach to the
/// rings another process created there.
#[derive(Debug, Clone)]
pub struct ShmNamespace {
    dir: PathBuf,
}

impl ShmNamespace {
    /// Namespace rooted at `dir` (typically `/dev/shm`).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory backing this namespace.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Backing file used for buffer `id`.
    pub fn path_for(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{id}"))
    }

    /// Map an existing ring.
    ///
    /// Returns `Ok(None)` when no ring with this id exists yet, which callers treat
    /// as the cue to create one.
    pub fn attach(&self, id: u32) -> Result<Option<RingBuffer>> {
        let path = self.path_for(id);
        if !path.exists() {
            trace!(buffer_id = id, ?path, "No ring buffer to attach");
            return Ok(None);
        }
        RingBuffer::open(id, &path).map(Some)
    }

    /// Attach to ring `id`, creating it with the given geometry if it does not exist.
    ///
    /// An existing ring is returned as-is; geometry agreement between processes is
    /// the deployment's responsibility. Failure here means the process has no shared
    /// memory to work with.
    pub fn create_or_get(
        &self,
        id: u32,
        block_count: usize,
        block_size: usize,
        tag: &str,
    ) -> Result<RingBuffer> {
        if let Some(existing) = self.attach(id)? {
            return Ok(existing);
        }
        RingBuffer::create(id, &self.path_for(id), block_count, block_size, tag)
    }

    /// Delete the backing file of ring `id`, if any.
    pub fn remove(&self, id: u32) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Fixed-block ring living in shared memory.
///
/// # Safety
/// This structure contains raw pointers into the memory map. It is safe to use as
/// long as:
/// - The mapping stays alive for the lifetime of the ring (it is owned here)
/// - Block data is only touched through [`WriteBlock`] / [`ReadBlock`], whose
///   existence is tied to a successful state transition on that block
/// - At most one producer and one consumer use the ring at a time
pub struct RingBuffer {
    id: u32,
    path: PathBuf,
    #[allow(dead_code)]
    mmap: MmapMut,
    header: *mut RingHeader,
    slots: *mut BlockSlot,
    data_ptr: *mut u8,
    block_count: usize,
    block_size: usize,
    block_stride: usize,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("id", &self.id)
            .field("tag", &self.tag())
            .field("block_count", &self.block_count)
            .field("block_size", &self.block_size)
            .field("stats", &self.stats())
            .field("data_ptr", &format!("{:p}", self.data_ptr))
            .finish()
    }
}

// SAFETY: the ring owns its mapping; every shared field is an atomic inside the
// mapping, and block data is only reachable through guards created by a successful
// compare-exchange on the block state.
unsafe impl Send for RingBuffer {}

// SAFETY: concurrent use from a producer thread and a consumer thread only goes
// through atomic state transitions (AcqRel / Acquire / Release), which order the
// block data accesses between them.
unsafe impl Sync for RingBuffer {}

fn layout_size(block_count: usize, block_stride: usize) -> usize {
    HEADER_SIZE + block_count * SLOT_SIZE + block_count * block_stride
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

impl RingBuffer {
    fn create(
        id: u32,
        path: &Path,
        block_count: usize,
        block_size: usize,
        tag: &str,
    ) -> Result<Self> {
        if block_count == 0 || block_size == 0 {
            return Err(RingBufferError::InvalidGeometry {
                block_count,
                block_size,
            });
        }
        let block_stride = round_up(block_size, BLOCK_ALIGN);
        let total_size = layout_size(block_count, block_stride);
        let io_err = |source| RingBufferError::Io {
            id,
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)?;
        file.set_len(total_size as u64).map_err(io_err)?;

        // SAFETY: the file was just created and sized; nobody else has a view of it
        // that could be truncated underneath this mapping.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file).map_err(io_err)? };
        debug_assert!(mmap.len() >= total_size, "mmap shorter than requested size");

        let mut tag_bytes = [0u8; MAX_TAG_LEN];
        let tag_len = tag.len().min(MAX_TAG_LEN);
        tag_bytes[..tag_len].copy_from_slice(&tag.as_bytes()[..tag_len]);

        let base = mmap.as_mut_ptr();
        let header = base as *mut RingHeader;
        // SAFETY: mmap is at least HEADER_SIZE bytes and page aligned, which satisfies
        // RingHeader's size and alignment.
        unsafe {
            std::ptr::write(
                header,
                RingHeader {
                    magic: MAGIC,
                    block_count: block_count as u64,
                    block_size: block_size as u64,
                    block_stride: block_stride as u64,
                    write_cursor: AtomicU64::new(0),
                    read_cursor: AtomicU64::new(0),
                    published: AtomicU64::new(0),
                    dropped: AtomicU64::new(0),
                    buffer_id: id,
                    tag_len: tag_len as u32,
                    tag: tag_bytes,
                    _padding: [0; 24],
                },
            );
        }

        // SAFETY: the slot table starts right after the header and is within bounds.
        let slots = unsafe { base.add(HEADER_SIZE) } as *mut BlockSlot;
        for i in 0..block_count {
            // SAFETY: i < block_count and the slot table has block_count entries.
            unsafe {
                std::ptr::write(
                    slots.add(i),
                    BlockSlot {
                        state: AtomicU32::new(BlockState::Free as u32),
                        _reserved: 0,
                        sequence: AtomicU64::new(0),
                        _padding: [0; 48],
                    },
                );
            }
        }

        // SAFETY: data region follows the slot table and is within the mapping.
        let data_ptr = unsafe { base.add(HEADER_SIZE + block_count * SLOT_SIZE) };

        info!(
            buffer_id = id,
            tag,
            block_count,
            block_size,
            ?path,
            "Created ring buffer"
        );

        Ok(Self {
            id,
            path: path.to_path_buf(),
            mmap,
            header,
            slots,
            data_ptr,
            block_count,
            block_size,
            block_stride,
        })
    }

    fn open(id: u32, path: &Path) -> Result<Self> {
        let io_err = |source| RingBufferError::Io {
            id,
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let actual = file.metadata().map_err(io_err)?.len();
        if actual < HEADER_SIZE as u64 {
            return Err(RingBufferError::Truncated {
                path: path.to_path_buf(),
                required: HEADER_SIZE as u64,
                actual,
            });
        }

        // SAFETY: mapping an existing ring file; its size was checked against the
        // header size above and is checked against the full layout below.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file).map_err(io_err)? };

        let base = mmap.as_mut_ptr();
        let header = base as *mut RingHeader;
        // SAFETY: at least HEADER_SIZE bytes are mapped.
        let (magic, block_count, block_size, block_stride) = unsafe {
            (
                (*header).magic,
                (*header).block_count as usize,
                (*header).block_size as usize,
                (*header).block_stride as usize,
            )
        };

        if magic != MAGIC {
            return Err(RingBufferError::BadMagic {
                path: path.to_path_buf(),
                expected: MAGIC,
                found: magic,
            });
        }

        let required = layout_size(block_count, block_stride) as u64;
        if (mmap.len() as u64) < required || block_stride < block_size {
            return Err(RingBufferError::Truncated {
                path: path.to_path_buf(),
                required,
                actual: mmap.len() as u64,
            });
        }

        // SAFETY: layout size validated above.
        let slots = unsafe { base.add(HEADER_SIZE) } as *mut BlockSlot;
        // SAFETY: layout size validated above.
        let data_ptr = unsafe { base.add(HEADER_SIZE + block_count * SLOT_SIZE) };

        debug!(buffer_id = id, block_count, block_size, ?path, "Attached ring buffer");

        Ok(Self {
            id,
            path: path.to_path_buf(),
            mmap,
            header,
            slots,
            data_ptr,
            block_count,
            block_size,
            block_stride,
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: header points at the start of the mapping owned by self.
        unsafe { &*self.header }
    }

    fn slot(&self, index: usize) -> &BlockSlot {
        debug_assert!(index < self.block_count);
        // SAFETY: index < block_count, and the slot table has block_count entries.
        unsafe { &*self.slots.add(index) }
    }

    fn block_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.block_count);
        // SAFETY: index < block_count, so the offset stays inside the data region.
        unsafe { self.data_ptr.add(index * self.block_stride) }
    }

    /// Buffer id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Application tag stored at creation.
    pub fn tag(&self) -> String {
        let header = self.header();
        let len = (header.tag_len as usize).min(MAX_TAG_LEN);
        String::from_utf8_lossy(&header.tag[..len]).into_owned()
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Usable bytes per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Current state of block `index`.
    pub fn state(&self, index: usize) -> BlockState {
        BlockState::from_raw(self.slot(index).state.load(Ordering::Acquire))
    }

    /// Snapshot of all block states, in block order.
    pub fn states(&self) -> Vec<BlockState> {
        (0..self.block_count).map(|i| self.state(i)).collect()
    }

    /// Header counters.
    pub fn stats(&self) -> RingStats {
        let header = self.header();
        RingStats {
            published: header.published.load(Ordering::Acquire),
            dropped: header.dropped.load(Ordering::Acquire),
            write_cursor: header.write_cursor.load(Ordering::Acquire),
            read_cursor: header.read_cursor.load(Ordering::Acquire),
        }
    }

    /// Reset every block to `FREE` and zero the cursors and counters.
    ///
    /// Must run before any producer or consumer touches the ring, so that state
    /// left behind by a previous run is not taken for live data.
    pub fn clear(&self) {
        for i in 0..self.block_count {
            let slot = self.slot(i);
            slot.sequence.store(0, Ordering::Relaxed);
            slot.state.store(BlockState::Free as u32, Ordering::Release);
        }
        let header = self.header();
        header.write_cursor.store(0, Ordering::Release);
        header.read_cursor.store(0, Ordering::Release);
        header.published.store(0, Ordering::Release);
        header.dropped.store(0, Ordering::Release);
        debug!(buffer_id = self.id, "Cleared ring buffer");
    }

    /// Count one dropped unit of producer data; returns the new total.
    pub fn record_drop(&self) -> u64 {
        self.header().dropped.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Wait up to `timeout` for the next block in write order to become `FREE` and
    /// claim it as `FILLING`.
    pub fn acquire_free(&self, timeout: Duration) -> Result<WriteBlock<'_>> {
        let index = (self.header().write_cursor.load(Ordering::Acquire)
            % self.block_count as u64) as usize;
        let slot = self.slot(index);
        let claimed = wait_until(timeout, || {
            slot.state
                .compare_exchange(
                    BlockState::Free as u32,
                    BlockState::Filling as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        });
        if !claimed {
            return Err(RingBufferError::Timeout {
                id: self.id,
                wanted: BlockState::Free,
                timeout,
            });
        }
        trace!(buffer_id = self.id, block = index, "Block FILLING");
        Ok(WriteBlock {
            ring: self,
            index,
            published: false,
        })
    }

    /// Wait up to `timeout` for the oldest published block and claim it as
    /// `PROCESSING`.
    pub fn acquire_full(&self, timeout: Duration) -> Result<ReadBlock<'_>> {
        let index = (self.header().read_cursor.load(Ordering::Acquire)
            % self.block_count as u64) as usize;
        let slot = self.slot(index);
        let claimed = wait_until(timeout, || {
            slot.state
                .compare_exchange(
                    BlockState::Full as u32,
                    BlockState::Processing as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        });
        if !claimed {
            return Err(RingBufferError::Timeout {
                id: self.id,
                wanted: BlockState::Full,
                timeout,
            });
        }
        trace!(buffer_id = self.id, block = index, "Block PROCESSING");
        Ok(ReadBlock {
            ring: self,
            index,
            released: false,
        })
    }
}

/// Poll `attempt` until it succeeds or `timeout` elapses. Spins briefly, then sleeps
/// with exponential backoff capped at [`MAX_BACKOFF`].
fn wait_until(timeout: Duration, mut attempt: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    let mut spins = 0u32;
    let mut backoff = Duration::from_micros(10);
    loop {
        if attempt() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        if spins < SPIN_LIMIT {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Producer's exclusive handle on a `FILLING` block.
///
/// Dropping the handle without [`WriteBlock::publish`] returns the block to `FREE`
/// and leaves the write cursor where it was.
pub struct WriteBlock<'a> {
    ring: &'a RingBuffer,
    index: usize,
    published: bool,
}

impl WriteBlock<'_> {
    /// Block index inside the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Writable block contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle exists only after the FREE -> FILLING compare-exchange
        // succeeded, which gives it exclusive access to the block until publish/drop.
        unsafe { std::slice::from_raw_parts_mut(self.ring.block_ptr(self.index), self.ring.block_size) }
    }

    /// Mark the block `FULL`, making it visible to the consumer, and advance the
    /// write cursor. Returns the block's publish sequence number.
    pub fn publish(mut self) -> u64 {
        let header = self.ring.header();
        let sequence = header.published.fetch_add(1, Ordering::AcqRel);
        let slot = self.ring.slot(self.index);
        slot.sequence.store(sequence, Ordering::Relaxed);
        header.write_cursor.fetch_add(1, Ordering::AcqRel);
        slot.state.store(BlockState::Full as u32, Ordering::Release);
        self.published = true;
        trace!(buffer_id = self.ring.id, block = self.index, sequence, "Block FULL");
        sequence
    }
}

impl Drop for WriteBlock<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.ring
                .slot(self.index)
                .state
                .store(BlockState::Free as u32, Ordering::Release);
            trace!(buffer_id = self.ring.id, block = self.index, "Abandoned FILLING block");
        }
    }
}

/// Consumer's exclusive handle on a `PROCESSING` block.
///
/// Dropping the handle releases the block, same as [`ReadBlock::release`].
pub struct ReadBlock<'a> {
    ring: &'a RingBuffer,
    index: usize,
    released: bool,
}

impl ReadBlock<'_> {
    /// Block index inside the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Publish sequence number of the contents.
    pub fn sequence(&self) -> u64 {
        self.ring.slot(self.index).sequence.load(Ordering::Relaxed)
    }

    /// Block contents.
    pub fn data(&self) -> &[u8] {
        // SAFETY: this handle exists only after the FULL -> PROCESSING compare-exchange
        // succeeded; the producer will not touch the block until it is FREE again.
        unsafe { std::slice::from_raw_parts(self.ring.block_ptr(self.index), self.ring.block_size) }
    }

    /// Mark the block `DONE`, advance the read cursor and recycle it as `FREE`.
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.released {
            return;
        }
        let slot = self.ring.slot(self.index);
        slot.state.store(BlockState::Done as u32, Ordering::Release);
        self.ring.header().read_cursor.fetch_add(1, Ordering::AcqRel);
        slot.state.store(BlockState::Free as u32, Ordering::Release);
        self.released = true;
        trace!(buffer_id = self.ring.id, block = self.index, "Block FREE");
    }
}

impl Drop for ReadBlock<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
