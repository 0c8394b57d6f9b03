//! Stage chain: planning, stage bodies and lifecycle orchestration.
//!
//! ```text
//! high bandwidth:  ingest -> [ring a] -> accumulate -> [ring b] -> disk
//! low bandwidth:   ingest -> [ring a] -> filter -> [ring b] -> accumulate -> [ring c] -> disk
//! ```
//!
//! Each arrow pair is one shared-memory [`RingBuffer`](crate::data::RingBuffer) with
//! exactly one producer and one consumer.

pub mod cancel;
pub mod orchestrator;
pub mod sched;
pub mod sink;
pub mod source;
pub mod stage;
pub mod stages;

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use cancel::{CancelToken, Interrupt, InterruptFlag};
pub use orchestrator::{
    DefaultStageFactory, LifecycleEvent, LifecycleObserver, Orchestrator, PipelineState,
    RunningPipeline, StageFactory, StageState, TracingObserver,
};
pub use stage::{Stage, StageArgs, StageContext, StageError, StageStats};

/// Chain variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthMode {
    /// ingest, accumulate, disk
    #[default]
    High,
    /// ingest, filter, accumulate, disk
    Low,
}

impl BandwidthMode {
    /// Stages of this chain, upstream first.
    pub fn stages(&self) -> &'static [StageKind] {
        match self {
            BandwidthMode::High => &[StageKind::Ingest, StageKind::Accumulate, StageKind::Disk],
            BandwidthMode::Low => &[
                StageKind::Ingest,
                StageKind::Filter,
                StageKind::Accumulate,
                StageKind::Disk,
            ],
        }
    }
}

/// Role of a stage thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Heap receive into heap blocks
    Ingest,
    /// Polyphase filter bank (low bandwidth only)
    Filter,
    /// Heap accumulation into spectra
    Accumulate,
    /// Spectrum writer
    Disk,
}

impl StageKind {
    /// Every stage kind, upstream first.
    pub const ALL: [StageKind; 4] = [
        StageKind::Ingest,
        StageKind::Filter,
        StageKind::Accumulate,
        StageKind::Disk,
    ];

    /// Lower-case name, used for thread names and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Ingest => "ingest",
            StageKind::Filter => "filter",
            StageKind::Accumulate => "accumulate",
            StageKind::Disk => "disk",
        }
    }

    /// Whether this stage writes spectrum blocks rather than heap blocks.
    pub fn produces_spectra(&self) -> bool {
        matches!(self, StageKind::Accumulate)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One stage with its wired buffer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    /// Stage role
    pub kind: StageKind,
    /// Inbound ring (None for the first stage)
    pub input: Option<u32>,
    /// Outbound ring (None for the terminal stage)
    pub output: Option<u32>,
}

/// Ordered stage list with each stage's output wired to the next stage's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    /// Chain variant
    pub mode: BandwidthMode,
    /// Stages, upstream first
    pub stages: Vec<StagePlan>,
}

impl PipelinePlan {
    /// Wire the chain for `mode` using the first `stages - 1` entries of `ids`.
    pub fn for_mode(mode: BandwidthMode, ids: &[u32]) -> AppResult<Self> {
        let kinds = mode.stages();
        let links = kinds.len() - 1;
        if ids.len() < links {
            return Err(DaqError::Configuration(format!(
                "{mode:?} bandwidth mode needs {links} buffer ids, got {}",
                ids.len()
            )));
        }
        let stages = kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| StagePlan {
                kind,
                input: i.checked_sub(1).map(|j| ids[j]),
                output: (i < links).then(|| ids[i]),
            })
            .collect();
        Ok(Self { mode, stages })
    }

    /// Ring ids with the stage that produces into each, upstream first.
    pub fn links(&self) -> Vec<(u32, StageKind)> {
        self.stages
            .iter()
            .filter_map(|s| s.output.map(|id| (id, s.kind)))
            .collect()
    }

    /// The stage whose "finished" flag ends a run.
    pub fn terminal(&self) -> Option<&StagePlan> {
        self.stages.last()
    }
}
