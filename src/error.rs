//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate. Using
//! the `thiserror` crate, it gathers the per-module error enums behind one type so the
//! controller can decide, in a single place, whether a failure ends the process.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the TOML file or `HEAP_DAQ_` environment overrides.
//! - **`Configuration`**: Semantic errors caught by `DaqConfig::validate`, such as
//!   a channel count that is not a multiple of four.
//! - **`BufferUnavailable`**: A required ring buffer could neither be attached nor
//!   created. Fatal.
//! - **`StageSpawn`**: The OS refused to start a stage thread. Fatal.
//! - **`Command`**, **`Stage`**, **`Sched`**: the per-module errors, converted with
//!   `#[from]` so `?` works across module seams.
//!
//! Everything other than the two fatal classes is recoverable. Stages log and count
//! their own failures, and a stage that fails or panics is reported in the
//! `PipelineSummary` returned by shutdown while the controller keeps running.

use crate::command::CommandError;
use crate::data::ring_buffer::RingBufferError;
use crate::pipeline::sched::SchedError;
use crate::pipeline::stage::StageError;
use crate::pipeline::StageKind;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ring buffer {id} could not be attached or created: {source}")]
    BufferUnavailable {
        id: u32,
        #[source]
        source: RingBufferError,
    },

    #[error("Failed to start {stage} stage thread: {source}")]
    StageSpawn {
        stage: StageKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Command channel error: {0}")]
    Command(#[from] CommandError),

    #[error("Scheduling error: {0}")]
    Sched(#[from] SchedError),

    #[error("Logging initialization failed: {0}")]
    Logging(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// True for failures after which the process cannot continue: a required
    /// buffer is missing, or a stage thread could not be started.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::BufferUnavailable { .. } | DaqError::StageSpawn { .. }
        )
    }
}
