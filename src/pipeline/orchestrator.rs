//! Stage chain lifecycle.
//!
//! Per stage thread: `Unstarted -> Running -> CancelRequested -> Joined`.
//!
//! Startup attaches (or creates) and clears every ring, then starts stage threads
//! upstream first, applying each stage's scheduling policy right after its thread
//! exists. Shutdown cancels downstream first, forces every stage out of calls that do
//! not watch the token, then joins upstream first. A stage that errors or panics is
//! logged and reported through [`LifecycleEvent::StageFailed`]; it never takes the
//! controller down. Only a missing ring or a thread that cannot be spawned is fatal.

use crate::config::DaqConfig;
use crate::data::ring_buffer::{RingBuffer, RingStats, ShmNamespace};
use crate::error::{AppResult, DaqError};
use crate::pipeline::cancel::{CancelToken, Interrupt};
use crate::pipeline::sink::RawDumpSink;
use crate::pipeline::source::MockHeapSource;
use crate::pipeline::stage::{Stage, StageArgs, StageContext, StageError, StageStats, StageStatsSnapshot};
use crate::pipeline::stages::{AccumulateStage, DiskStage, FilterStage, IngestStage};
use crate::pipeline::{BandwidthMode, PipelinePlan, StageKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Longest single sleep while waiting out a poll interval.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Lifecycle state of one stage thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Built, thread not started
    Unstarted,
    /// Thread started
    Running,
    /// Cancellation requested, not yet joined
    CancelRequested,
    /// Thread joined
    Joined,
}

/// Observable step of the lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Every ring of the chain is attached and cleared
    BuffersReady {
        /// Ring ids, upstream first
        ids: Vec<u32>,
    },
    /// A stage moved to a new state
    StageStateChanged {
        /// Stage
        stage: StageKind,
        /// New state
        state: StageState,
    },
    /// The stage's interrupter was fired
    Interrupted {
        /// Stage
        stage: StageKind,
    },
    /// The stage body returned an error or panicked
    StageFailed {
        /// Stage
        stage: StageKind,
        /// Rendered error
        error: String,
    },
}

/// Receives lifecycle events in the order they happen.
pub trait LifecycleObserver: Send + Sync {
    /// Called synchronously from the orchestrating thread.
    fn on_event(&self, event: &LifecycleEvent);
}

/// Logs every lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::BuffersReady { ids } => info!(?ids, "Ring buffers ready"),
            LifecycleEvent::StageStateChanged { stage, state } => {
                debug!(%stage, ?state, "Stage state changed")
            }
            LifecycleEvent::Interrupted { stage } => debug!(%stage, "Stage interrupted"),
            LifecycleEvent::StageFailed { stage, error } => {
                error!(%stage, %error, "Stage failed")
            }
        }
    }
}

/// Builds stage bodies.
pub trait StageFactory: Send + Sync {
    /// Body for `kind` under `config`.
    fn build(&self, kind: StageKind, config: &DaqConfig) -> AppResult<Box<dyn Stage>>;
}

/// Synthetic heap source, filter pass-through, accumulator and raw dump writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStageFactory;

impl StageFactory for DefaultStageFactory {
    fn build(&self, kind: StageKind, config: &DaqConfig) -> AppResult<Box<dyn Stage>> {
        let heap_layout = config.heap_layout();
        Ok(match kind {
            StageKind::Ingest => Box::new(IngestStage::new(
                Box::new(MockHeapSource::new(&config.source)),
                heap_layout,
            )),
            StageKind::Filter => Box::new(FilterStage::new(heap_layout)),
            StageKind::Accumulate => Box::new(AccumulateStage::new(
                heap_layout,
                config.pipeline.heaps_per_integration,
            )),
            StageKind::Disk => {
                let layout = config.spectrum_layout();
                let sink = RawDumpSink::create(&config.output.path, layout)?;
                Box::new(DiskStage::new(
                    layout,
                    Box::new(sink),
                    config.pipeline.max_spectra,
                ))
            }
        })
    }
}

/// Control-loop state: the external stop request and how often to look at it.
#[derive(Debug, Clone)]
pub struct PipelineState {
    cancel: CancelToken,
    poll_interval: Duration,
}

impl PipelineState {
    /// State watching `cancel`, polled every `poll_interval`.
    pub fn new(cancel: CancelToken, poll_interval: Duration) -> Self {
        Self {
            cancel,
            poll_interval,
        }
    }

    /// The external stop request.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether the control loop should keep going.
    pub fn should_run(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Sleep one poll interval, returning early when a stop is requested.
    pub fn wait_poll(&self) {
        let deadline = Instant::now() + self.poll_interval;
        while self.should_run() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }
}

/// Assembles and launches stage chains.
pub struct Orchestrator {
    config: DaqConfig,
    factory: Arc<dyn StageFactory>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl Orchestrator {
    /// Orchestrator with the default stage bodies and a [`TracingObserver`].
    pub fn new(config: DaqConfig) -> Self {
        Self {
            config,
            factory: Arc::new(DefaultStageFactory),
            observers: vec![Arc::new(TracingObserver)],
        }
    }

    /// Replace the stage factory.
    pub fn with_factory(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Add a lifecycle observer.
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    /// Attach the rings, build the stages and start their threads.
    pub fn start(&self) -> AppResult<RunningPipeline> {
        let plan = PipelinePlan::for_mode(
            self.config.pipeline.bandwidth_mode,
            &self.config.buffers.ids,
        )?;
        info!(mode = ?plan.mode, stages = plan.stages.len(), "Starting pipeline");

        let rings = self.prepare_buffers(&plan)?;
        emit(
            &self.observers,
            &LifecycleEvent::BuffersReady {
                ids: plan.links().iter().map(|(id, _)| *id).collect(),
            },
        );

        let mut bodies = Vec::with_capacity(plan.stages.len());
        for stage in &plan.stages {
            bodies.push(self.factory.build(stage.kind, &self.config)?);
        }

        let mut running = RunningPipeline {
            mode: plan.mode,
            stages: Vec::with_capacity(plan.stages.len()),
            rings: plan
                .links()
                .iter()
                .filter_map(|(id, _)| rings.get(id).cloned())
                .collect(),
            observers: self.observers.clone(),
            stopped: false,
        };

        let mut upstream: Option<Arc<AtomicBool>> = None;
        for (stage, body) in plan.stages.iter().zip(bodies) {
            let kind = stage.kind;
            let args = StageArgs::new(stage.input, stage.output);
            let finished = Arc::clone(&args.finished);
            let stats = Arc::new(StageStats::default());
            let cancel = CancelToken::new();
            let interrupter = body.interrupter();
            let ctx = StageContext {
                kind,
                args,
                input: stage.input.and_then(|id| rings.get(&id).cloned()),
                output: stage.output.and_then(|id| rings.get(&id).cloned()),
                cancel: cancel.clone(),
                upstream_finished: upstream.clone(),
                stats: Arc::clone(&stats),
                acquire_timeout: self.config.acquire_timeout(),
            };

            let handle = match thread::Builder::new()
                .name(format!("heap-daq-{kind}"))
                .spawn(move || run_stage(body, ctx))
            {
                Ok(handle) => handle,
                Err(source) => {
                    error!(stage = %kind, error = %source, "Failed to spawn stage thread");
                    running.stop_all();
                    return Err(DaqError::StageSpawn {
                        stage: kind,
                        source,
                    });
                }
            };

            match self.config.sched_policy(kind) {
                Ok(policy) if !policy.is_default() => {
                    if let Err(e) = policy.apply(&handle) {
                        warn!(stage = %kind, error = %e, "Could not apply scheduling policy");
                    } else {
                        debug!(stage = %kind, ?policy, "Scheduling policy applied");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(stage = %kind, error = %e, "Invalid scheduling policy"),
            }

            running.stages.push(StageHandle {
                kind,
                cancel,
                interrupter,
                finished: Arc::clone(&finished),
                stats,
                state: StageState::Running,
                outcome: None,
                handle: Some(handle),
            });
            emit(
                &self.observers,
                &LifecycleEvent::StageStateChanged {
                    stage: kind,
                    state: StageState::Running,
                },
            );
            upstream = Some(finished);
        }

        Ok(running)
    }

    /// Start a chain and poll it until the terminal stage finishes or `external` is
    /// cancelled, then shut it down.
    pub fn run_until_finished(&self, external: &CancelToken) -> AppResult<PipelineSummary> {
        let pipeline = self.start()?;
        let state = PipelineState::new(external.clone(), self.config.poll_interval());
        while state.should_run() && !pipeline.is_finished() {
            state.wait_poll();
        }
        if pipeline.is_finished() {
            info!("Terminal stage finished");
        }
        Ok(pipeline.shutdown())
    }

    fn prepare_buffers(&self, plan: &PipelinePlan) -> AppResult<HashMap<u32, Arc<RingBuffer>>> {
        let ns = ShmNamespace::new(&self.config.buffers.shm_dir);
        let count = self.config.buffers.block_count;
        let tag = &self.config.buffers.tag;
        let mut rings = HashMap::new();

        for (id, producer) in plan.links() {
            let size = if producer.produces_spectra() {
                self.config.spectrum_layout().block_size()
            } else {
                self.config.heap_layout().block_size()
            };
            let unavailable = |source| DaqError::BufferUnavailable { id, source };

            let existing = match ns.attach(id) {
                Ok(ring) => ring,
                Err(e) => {
                    warn!(buffer_id = id, error = %e, "Existing ring unusable, recreating");
                    remove_stale(&ns, id);
                    None
                }
            };
            let ring = match existing {
                Some(ring) if ring.block_size() >= size => {
                    debug!(buffer_id = id, "Attached existing ring buffer");
                    ring
                }
                Some(ring) => {
                    warn!(
                        buffer_id = id,
                        have = ring.block_size(),
                        need = size,
                        "Existing ring blocks too small, recreating"
                    );
                    drop(ring);
                    remove_stale(&ns, id);
                    ns.create_or_get(id, count, size, tag).map_err(unavailable)?
                }
                None => ns.create_or_get(id, count, size, tag).map_err(unavailable)?,
            };

            ring.clear();
            info!(
                buffer_id = id,
                blocks = ring.block_count(),
                block_size = ring.block_size(),
                producer = %producer,
                "Ring buffer ready"
            );
            rings.insert(id, Arc::new(ring));
        }
        Ok(rings)
    }
}

fn remove_stale(ns: &ShmNamespace, id: u32) {
    if let Err(e) = ns.remove(id) {
        warn!(buffer_id = id, error = %e, "Could not remove stale ring buffer");
    }
}

fn emit(observers: &[Arc<dyn LifecycleObserver>], event: &LifecycleEvent) {
    for observer in observers {
        observer.on_event(event);
    }
}

/// Raises the stage's finished flag however the body exits.
struct FinishOnDrop(Arc<AtomicBool>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn run_stage(mut body: Box<dyn Stage>, ctx: StageContext) -> Result<(), StageError> {
    let span = info_span!("stage", stage = %ctx.kind);
    let _enter = span.enter();
    let _finished = FinishOnDrop(Arc::clone(&ctx.args.finished));

    info!(input = ?ctx.args.input, output = ?ctx.args.output, "Stage started");
    let result = body.run(&ctx);

    let s = ctx.stats.snapshot();
    info!(
        blocks_in = s.blocks_in,
        blocks_out = s.blocks_out,
        dropped = s.dropped,
        drop_fraction = s.drop_fraction(),
        invalid_runs = s.invalid_runs,
        blanked_runs = s.blanked_runs,
        heaps_lost = s.heaps_lost,
        spectra = s.spectra,
        io_errors = s.io_errors,
        "Stage stopped"
    );
    result
}

/// How a stage thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Body returned `Ok`
    Completed,
    /// Body returned an error
    Failed(String),
    /// Body panicked
    Panicked,
}

struct StageHandle {
    kind: StageKind,
    cancel: CancelToken,
    interrupter: Option<Arc<dyn Interrupt>>,
    finished: Arc<AtomicBool>,
    stats: Arc<StageStats>,
    state: StageState,
    outcome: Option<StageOutcome>,
    handle: Option<JoinHandle<Result<(), StageError>>>,
}

/// Final per-stage report.
#[derive(Debug, Clone)]
pub struct StageSummary {
    /// Stage
    pub stage: StageKind,
    /// Counters at join time
    pub stats: StageStatsSnapshot,
    /// How the thread ended
    pub outcome: StageOutcome,
}

/// Report produced by [`RunningPipeline::shutdown`].
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    /// Chain variant
    pub mode: BandwidthMode,
    /// Stages, upstream first
    pub stages: Vec<StageSummary>,
    /// Ring counters, upstream first
    pub rings: Vec<(u32, RingStats)>,
}

impl PipelineSummary {
    /// Number of stages that errored or panicked.
    pub fn failures(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.outcome != StageOutcome::Completed)
            .count()
    }

    /// Summary of one stage.
    pub fn stage(&self, kind: StageKind) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == kind)
    }
}

/// A started chain. Dropping it shuts the chain down.
pub struct RunningPipeline {
    mode: BandwidthMode,
    stages: Vec<StageHandle>,
    rings: Vec<Arc<RingBuffer>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    stopped: bool,
}

impl RunningPipeline {
    /// Chain variant.
    pub fn mode(&self) -> BandwidthMode {
        self.mode
    }

    /// Whether the terminal stage has returned.
    pub fn is_finished(&self) -> bool {
        self.stages
            .last()
            .is_some_and(|s| s.finished.load(Ordering::Acquire))
    }

    /// Live counters, upstream first.
    pub fn stats(&self) -> Vec<(StageKind, StageStatsSnapshot)> {
        self.stages
            .iter()
            .map(|s| (s.kind, s.stats.snapshot()))
            .collect()
    }

    /// Ring counters, upstream first.
    pub fn ring_stats(&self) -> Vec<(u32, RingStats)> {
        self.rings.iter().map(|r| (r.id(), r.stats())).collect()
    }

    /// Stage lifecycle states, upstream first.
    pub fn states(&self) -> Vec<(StageKind, StageState)> {
        self.stages.iter().map(|s| (s.kind, s.state)).collect()
    }

    /// Cancel, unblock and join every stage.
    pub fn shutdown(mut self) -> PipelineSummary {
        self.stop_all();
        let summary = PipelineSummary {
            mode: self.mode,
            stages: self
                .stages
                .iter()
                .map(|s| StageSummary {
                    stage: s.kind,
                    stats: s.stats.snapshot(),
                    outcome: s.outcome.clone().unwrap_or(StageOutcome::Completed),
                })
                .collect(),
            rings: self.ring_stats(),
        };
        info!(
            mode = ?summary.mode,
            failures = summary.failures(),
            "Pipeline shut down"
        );
        summary
    }

    fn set_state(&mut self, i: usize, state: StageState) {
        let stage = &mut self.stages[i];
        stage.state = state;
        let event = LifecycleEvent::StageStateChanged {
            stage: stage.kind,
            state,
        };
        emit(&self.observers, &event);
    }

    fn stop_all(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for i in (0..self.stages.len()).rev() {
            self.stages[i].cancel.cancel();
            self.set_state(i, StageState::CancelRequested);
        }

        for stage in &self.stages {
            if let Some(interrupter) = &stage.interrupter {
                interrupter.interrupt();
                emit(&self.observers, &LifecycleEvent::Interrupted { stage: stage.kind });
            }
        }

        for i in 0..self.stages.len() {
            let kind = self.stages[i].kind;
            let Some(handle) = self.stages[i].handle.take() else {
                continue;
            };
            let outcome = match handle.join() {
                Ok(Ok(())) => StageOutcome::Completed,
                Ok(Err(e)) => {
                    error!(stage = %kind, error = %e, "Stage returned an error");
                    StageOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    error!(stage = %kind, "Stage thread panicked");
                    StageOutcome::Panicked
                }
            };
            match &outcome {
                StageOutcome::Completed => {}
                StageOutcome::Failed(error) => emit(
                    &self.observers,
                    &LifecycleEvent::StageFailed {
                        stage: kind,
                        error: error.clone(),
                    },
                ),
                StageOutcome::Panicked => emit(
                    &self.observers,
                    &LifecycleEvent::StageFailed {
                        stage: kind,
                        error: "panicked".into(),
                    },
                ),
            }
            self.stages[i].outcome = Some(outcome);
            self.set_state(i, StageState::Joined);
        }
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_poll_returns_early_on_cancel() {
        let cancel = CancelToken::new();
        let state = PipelineState::new(cancel.clone(), Duration::from_secs(30));
        cancel.cancel();
        let started = Instant::now();
        state.wait_poll();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!state.should_run());
    }

    #[test]
    fn wait_poll_sleeps_one_interval() {
        let state = PipelineState::new(CancelToken::new(), Duration::from_millis(60));
        let started = Instant::now();
        state.wait_poll();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn summary_counts_failures() {
        let summary = PipelineSummary {
            mode: BandwidthMode::High,
            stages: vec![
                StageSummary {
                    stage: StageKind::Ingest,
                    stats: StageStatsSnapshot::default(),
                    outcome: StageOutcome::Completed,
                },
                StageSummary {
                    stage: StageKind::Disk,
                    stats: StageStatsSnapshot::default(),
                    outcome: StageOutcome::Panicked,
                },
            ],
            rings: Vec::new(),
        };
        assert_eq!(summary.failures(), 1);
        assert!(summary.stage(StageKind::Disk).is_some());
        assert!(summary.stage(StageKind::Filter).is_none());
    }
}
