//! Stage trait and the per-thread context handed to each stage body.

use crate::data::heap::LayoutError;
use crate::data::ring_buffer::{RingBuffer, RingBufferError};
use crate::data::transpose::TransposeError;
use crate::pipeline::cancel::{CancelToken, Interrupt};
use crate::pipeline::StageKind;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a stage body. The orchestrator logs them; they never stop the
/// controller.
#[derive(Error, Debug)]
pub enum StageError {
    /// Ring buffer failure other than a wait timeout
    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingBufferError),

    /// Block bytes do not match the configured geometry
    #[error("Block layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Reformatting failed
    #[error("Transpose error: {0}")]
    Transpose(#[from] TransposeError),

    /// Stage was wired without a buffer it needs
    #[error("{stage} stage has no {direction} buffer")]
    MissingBuffer {
        /// Stage
        stage: StageKind,
        /// "input" or "output"
        direction: &'static str,
    },

    /// Heap source failure
    #[error("Heap source error: {0}")]
    Source(String),

    /// Spectrum sink failure
    #[error("Sink I/O error: {0}")]
    Sink(#[from] std::io::Error),
}

/// Stage wiring: buffer ids and the "finished" flag.
///
/// Written once by the orchestrator before the thread starts.
#[derive(Debug, Clone)]
pub struct StageArgs {
    /// Inbound buffer id (None for the first stage)
    pub input: Option<u32>,
    /// Outbound buffer id (None for the terminal stage)
    pub output: Option<u32>,
    /// Raised when the stage body returns
    pub finished: Arc<AtomicBool>,
}

impl StageArgs {
    /// Wiring with a lowered finished flag.
    pub fn new(input: Option<u32>, output: Option<u32>) -> Self {
        Self {
            input,
            output,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the stage has finished.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Live per-stage counters, shared between the stage thread and the orchestrator.
#[derive(Debug, Default)]
pub struct StageStats {
    /// Blocks taken from the input ring
    pub blocks_in: AtomicU64,
    /// Blocks published to the output ring
    pub blocks_out: AtomicU64,
    /// Output blocks dropped because no free block arrived in time
    pub dropped: AtomicU64,
    /// Integration runs rejected as invalid or phase-switching
    pub invalid_runs: AtomicU64,
    /// Integration runs rejected as blanked
    pub blanked_runs: AtomicU64,
    /// Heaps the source reported lost
    pub heaps_lost: AtomicU64,
    /// Spectra handed to the sink
    pub spectra: AtomicU64,
    /// Sink write failures
    pub io_errors: AtomicU64,
}

impl StageStats {
    /// Add one to `counter`.
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> StageStatsSnapshot {
        StageStatsSnapshot {
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            blocks_out: self.blocks_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            invalid_runs: self.invalid_runs.load(Ordering::Relaxed),
            blanked_runs: self.blanked_runs.load(Ordering::Relaxed),
            heaps_lost: self.heaps_lost.load(Ordering::Relaxed),
            spectra: self.spectra.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`StageStats`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStatsSnapshot {
    pub blocks_in: u64,
    pub blocks_out: u64,
    pub dropped: u64,
    pub invalid_runs: u64,
    pub blanked_runs: u64,
    pub heaps_lost: u64,
    pub spectra: u64,
    pub io_errors: u64,
}

impl StageStatsSnapshot {
    /// Fraction of output attempts that were dropped.
    pub fn drop_fraction(&self) -> f64 {
        let attempts = self.blocks_out + self.dropped;
        if attempts == 0 {
            0.0
        } else {
            self.dropped as f64 / attempts as f64
        }
    }
}

/// Everything a stage body may touch while it runs.
pub struct StageContext {
    /// Stage role
    pub kind: StageKind,
    /// Buffer ids and finished flag
    pub args: StageArgs,
    /// Attached inbound ring
    pub input: Option<Arc<RingBuffer>>,
    /// Attached outbound ring
    pub output: Option<Arc<RingBuffer>>,
    /// Cooperative stop request
    pub cancel: CancelToken,
    /// Finished flag of the upstream stage, if any
    pub upstream_finished: Option<Arc<AtomicBool>>,
    /// Counters
    pub stats: Arc<StageStats>,
    /// Bound on every ring buffer wait
    pub acquire_timeout: Duration,
}

impl StageContext {
    /// Inbound ring, or an error if the stage was wired without one.
    pub fn input(&self) -> Result<&RingBuffer, StageError> {
        self.input.as_deref().ok_or(StageError::MissingBuffer {
            stage: self.kind,
            direction: "input",
        })
    }

    /// Outbound ring, or an error if the stage was wired without one.
    pub fn output(&self) -> Result<&RingBuffer, StageError> {
        self.output.as_deref().ok_or(StageError::MissingBuffer {
            stage: self.kind,
            direction: "output",
        })
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the upstream stage has returned. A stage without upstream never
    /// considers it finished.
    pub fn upstream_done(&self) -> bool {
        self.upstream_finished
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Acquire))
    }
}

/// A pipeline stage body, run on its own thread.
pub trait Stage: Send {
    /// Stage role.
    fn kind(&self) -> StageKind;

    /// Handle that forces the stage out of a call that does not watch the cancel
    /// token. Taken once, before the thread starts.
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }

    /// Process until cancelled or out of data.
    ///
    /// Waits must be bounded by `ctx.acquire_timeout` and followed by a cancel check.
    fn run(&mut self, ctx: &StageContext) -> Result<(), StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_fraction_from_snapshot() {
        let stats = StageStats::default();
        StageStats::bump(&stats.blocks_out);
        StageStats::bump(&stats.blocks_out);
        StageStats::bump(&stats.blocks_out);
        assert_eq!(StageStats::bump(&stats.dropped), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.blocks_out, 3);
        assert!((snap.drop_fraction() - 0.25).abs() < 1e-12);
        assert_eq!(StageStatsSnapshot::default().drop_fraction(), 0.0);
    }

    #[test]
    fn missing_buffers_are_reported() {
        let ctx = StageContext {
            kind: StageKind::Filter,
            args: StageArgs::new(None, None),
            input: None,
            output: None,
            cancel: CancelToken::new(),
            upstream_finished: None,
            stats: Arc::new(StageStats::default()),
            acquire_timeout: Duration::from_millis(1),
        };
        let err = ctx.input().unwrap_err();
        assert_eq!(err.to_string(), "filter stage has no input buffer");
        assert!(ctx.output().is_err());
        assert!(!ctx.upstream_done());
    }
}
