//! Stage bodies.

pub mod accumulate;
pub mod disk;
pub mod filter;
pub mod ingest;

pub use accumulate::AccumulateStage;
pub use disk::DiskStage;
pub use filter::FilterStage;
pub use ingest::IngestStage;
