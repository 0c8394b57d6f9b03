//! # heap_daq
//!
//! Real-time acquisition backend for a radio-telescope digital receiver. Heaps arrive
//! from the network, are grouped into blocks in shared-memory ring buffers, integrated
//! into spectra, reformatted and handed to a writer, with one OS thread per stage.
//!
//! ## Crate Structure
//!
//! - **`command`**: the start/stop/quit control-line protocol, read from a named FIFO
//!   and standard input.
//! - **`config`**: `DaqConfig`, loaded with `figment` from TOML plus `HEAP_DAQ_`
//!   environment overrides.
//! - **`data`**: the shared-memory `RingBuffer`, heap and spectrum block layouts, the
//!   `BlockInfoCache` validity window and the 4x4 `transpose` kernel.
//! - **`error`**: `DaqError` and the fatal/recoverable split.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`pipeline`**: stage bodies, scheduling, and the `Orchestrator` that owns the
//!   chain's lifecycle.

pub mod command;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use config::DaqConfig;
pub use error::{AppResult, DaqError};
