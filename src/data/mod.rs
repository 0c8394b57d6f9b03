//! Data plane: shared-memory rings, block layouts and the reformatting kernel.

pub mod block_info;
pub mod heap;
pub mod ring_buffer;
pub mod transpose;

pub use block_info::BlockInfoCache;
pub use heap::{HeapBlockLayout, HeapHeader, HeapIndexEntry, SpectrumBlockLayout, SpectrumHeader};
pub use ring_buffer::{BlockState, RingBuffer, RingBufferError, RingStats, ShmNamespace};
pub use transpose::{transpose, TransposeError};
