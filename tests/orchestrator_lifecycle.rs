//! Lifecycle ordering and failure handling of the orchestrator.

use heap_daq::config::DaqConfig;
use heap_daq::data::ring_buffer::ShmNamespace;
use heap_daq::error::{AppResult, DaqError};
use heap_daq::pipeline::orchestrator::StageOutcome;
use heap_daq::pipeline::{
    BandwidthMode, CancelToken, Interrupt, InterruptFlag, LifecycleEvent, LifecycleObserver,
    Orchestrator, Stage, StageContext, StageError, StageFactory, StageKind, StageState,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl LifecycleObserver for Recorder {
    fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

impl Recorder {
    fn transitions(&self, state: StageState) -> Vec<StageKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::StageStateChanged { stage, state: s } if *s == state => {
                    Some(*stage)
                }
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Run until cancelled or interrupted
    Idle,
    /// Return after a short delay
    Finish,
    Fail,
    Panic,
}

struct ScriptedStage {
    kind: StageKind,
    behavior: Behavior,
    interrupt: InterruptFlag,
}

impl Stage for ScriptedStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(self.interrupt.clone()))
    }

    fn run(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        match self.behavior {
            Behavior::Finish => {
                thread::sleep(Duration::from_millis(20));
                Ok(())
            }
            Behavior::Fail => Err(StageError::Source("receiver gone".into())),
            Behavior::Panic => panic!("stage blew up"),
            Behavior::Idle => {
                while !ctx.is_cancelled() && !self.interrupt.is_raised() {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(())
            }
        }
    }
}

struct ScriptedFactory {
    special: Option<(StageKind, Behavior)>,
}

impl ScriptedFactory {
    fn idle() -> Arc<Self> {
        Arc::new(Self { special: None })
    }

    fn with(kind: StageKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            special: Some((kind, behavior)),
        })
    }
}

impl StageFactory for ScriptedFactory {
    fn build(&self, kind: StageKind, _config: &DaqConfig) -> AppResult<Box<dyn Stage>> {
        let behavior = match self.special {
            Some((k, b)) if k == kind => b,
            _ => Behavior::Idle,
        };
        Ok(Box::new(ScriptedStage {
            kind,
            behavior,
            interrupt: InterruptFlag::new(),
        }))
    }
}

fn config(shm_dir: &Path, mode: BandwidthMode) -> DaqConfig {
    let mut config = DaqConfig::default();
    config.buffers.shm_dir = shm_dir.to_path_buf();
    config.buffers.block_count = 4;
    config.pipeline.bandwidth_mode = mode;
    config.pipeline.heaps_per_block = 4;
    config.pipeline.nchannels = 4;
    config.pipeline.nsubbands = 1;
    config.pipeline.heaps_per_integration = 2;
    config.pipeline.acquire_timeout_ms = 10;
    config.pipeline.poll_interval_ms = 20;
    config
}

const UPSTREAM_FIRST: [StageKind; 4] = [
    StageKind::Ingest,
    StageKind::Filter,
    StageKind::Accumulate,
    StageKind::Disk,
];
const DOWNSTREAM_FIRST: [StageKind; 4] = [
    StageKind::Disk,
    StageKind::Accumulate,
    StageKind::Filter,
    StageKind::Ingest,
];

#[test]
fn four_stage_cancel_and_join_order() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(config(dir.path(), BandwidthMode::Low))
        .with_factory(ScriptedFactory::idle())
        .with_observer(recorder.clone());

    let running = orchestrator.start().unwrap();
    assert_eq!(recorder.transitions(StageState::Running), UPSTREAM_FIRST);
    assert!(running
        .states()
        .iter()
        .all(|(_, s)| *s == StageState::Running));
    assert!(!running.is_finished());

    let summary = running.shutdown();
    assert_eq!(recorder.transitions(StageState::CancelRequested), DOWNSTREAM_FIRST);
    assert_eq!(recorder.transitions(StageState::Joined), UPSTREAM_FIRST);
    assert_eq!(
        recorder.count(|e| matches!(e, LifecycleEvent::Interrupted { .. })),
        4
    );
    assert_eq!(summary.failures(), 0);
    assert_eq!(summary.rings.len(), 3);
}

#[test]
fn order_is_independent_of_which_stage_finished() {
    for finisher in UPSTREAM_FIRST {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(config(dir.path(), BandwidthMode::Low))
            .with_factory(ScriptedFactory::with(finisher, Behavior::Finish))
            .with_observer(recorder.clone());

        let running = orchestrator.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        running.shutdown();

        assert_eq!(
            recorder.transitions(StageState::CancelRequested),
            DOWNSTREAM_FIRST,
            "cancel order with {finisher} finished early"
        );
        assert_eq!(
            recorder.transitions(StageState::Joined),
            UPSTREAM_FIRST,
            "join order with {finisher} finished early"
        );
    }
}

#[test]
fn three_stage_chain_creates_two_rings() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(config(dir.path(), BandwidthMode::High))
        .with_factory(ScriptedFactory::idle())
        .with_observer(recorder.clone());

    let running = orchestrator.start().unwrap();
    let ns = ShmNamespace::new(dir.path());
    assert!(ns.path_for(1).exists());
    assert!(ns.path_for(2).exists());
    assert!(!ns.path_for(3).exists());
    assert_eq!(
        recorder.transitions(StageState::Running),
        [StageKind::Ingest, StageKind::Accumulate, StageKind::Disk]
    );
    assert!(recorder
        .events
        .lock()
        .contains(&LifecycleEvent::BuffersReady { ids: vec![1, 2] }));

    running.shutdown();
    assert_eq!(
        recorder.transitions(StageState::Joined),
        [StageKind::Ingest, StageKind::Accumulate, StageKind::Disk]
    );
}

#[test]
fn missing_shm_directory_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does/not/exist");
    let orchestrator = Orchestrator::new(config(&missing, BandwidthMode::High))
        .with_factory(ScriptedFactory::idle());

    match orchestrator.start() {
        Err(e @ DaqError::BufferUnavailable { id: 1, .. }) => assert!(e.is_fatal()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("pipeline started without shared memory"),
    }
}

#[test]
fn undersized_existing_ring_is_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    drop(ns.create_or_get(1, 2, 64, "stale").unwrap());

    let config = config(dir.path(), BandwidthMode::High);
    let needed = config.heap_layout().block_size();
    assert!(needed > 64);

    let running = Orchestrator::new(config)
        .with_factory(ScriptedFactory::idle())
        .start()
        .unwrap();
    let ring = ns.attach(1).unwrap().unwrap();
    assert!(ring.block_size() >= needed);
    assert_eq!(ring.block_count(), 4);
    running.shutdown();
}

#[test]
fn corrupt_existing_rings_are_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    // ring 1 has a foreign header, ring 2 is shorter than any header
    std::fs::write(ns.path_for(1), vec![0xFFu8; 4096]).unwrap();
    std::fs::write(ns.path_for(2), [0u8; 8]).unwrap();
    assert!(ns.attach(1).is_err());
    assert!(ns.attach(2).is_err());

    let config = config(dir.path(), BandwidthMode::High);
    let heap_block = config.heap_layout().block_size();
    let spectrum_block = config.spectrum_layout().block_size();
    let running = Orchestrator::new(config)
        .with_factory(ScriptedFactory::idle())
        .start()
        .unwrap();

    let heaps = ns.attach(1).unwrap().unwrap();
    assert!(heaps.block_size() >= heap_block);
    assert_eq!(heaps.block_count(), 4);
    let spectra = ns.attach(2).unwrap().unwrap();
    assert!(spectra.block_size() >= spectrum_block);
    running.shutdown();
}

#[test]
fn stage_errors_and_panics_are_contained() {
    for (behavior, expected) in [
        (Behavior::Fail, "failed"),
        (Behavior::Panic, "panicked"),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(config(dir.path(), BandwidthMode::High))
            .with_factory(ScriptedFactory::with(StageKind::Accumulate, behavior))
            .with_observer(recorder.clone());

        let running = orchestrator.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        let summary = running.shutdown();

        assert_eq!(summary.failures(), 1, "{expected}");
        let accumulate = summary.stage(StageKind::Accumulate).unwrap();
        match (expected, &accumulate.outcome) {
            ("failed", StageOutcome::Failed(msg)) => assert!(msg.contains("receiver gone")),
            ("panicked", StageOutcome::Panicked) => {}
            (_, other) => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            recorder.count(|e| matches!(
                e,
                LifecycleEvent::StageFailed {
                    stage: StageKind::Accumulate,
                    ..
                }
            )),
            1
        );
        assert_eq!(recorder.transitions(StageState::Joined).len(), 3);
    }
}

#[test]
fn run_until_finished_returns_when_terminal_stage_exits() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(config(dir.path(), BandwidthMode::High))
        .with_factory(ScriptedFactory::with(StageKind::Disk, Behavior::Finish));

    let started = Instant::now();
    let summary = orchestrator.run_until_finished(&CancelToken::new()).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.failures(), 0);
    assert_eq!(summary.stages.len(), 3);
}

#[test]
fn run_until_finished_honors_external_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(config(dir.path(), BandwidthMode::Low))
        .with_factory(ScriptedFactory::idle());

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });

    let summary = orchestrator.run_until_finished(&cancel).unwrap();
    canceller.join().unwrap();
    assert_eq!(summary.stages.len(), 4);
}
