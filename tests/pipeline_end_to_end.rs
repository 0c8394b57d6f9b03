//! Full chains over real shared-memory rings with a synthetic heap source.

use heap_daq::config::DaqConfig;
use heap_daq::data::heap::{status, HeapHeader, HeapIndexEntry, SpectrumHeader};
use heap_daq::error::AppResult;
use heap_daq::pipeline::sink::{SinkStatus, SpectrumRecord, SpectrumSink};
use heap_daq::pipeline::source::{HeapSource, MockHeapSource, MockPayload, Received};
use heap_daq::pipeline::stages::{DiskStage, IngestStage};
use heap_daq::pipeline::{
    BandwidthMode, CancelToken, DefaultStageFactory, Orchestrator, Stage, StageError,
    StageFactory, StageKind,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

type Spectra = Arc<Mutex<Vec<(SpectrumHeader, Vec<f32>)>>>;

struct CollectingSink(Spectra);

impl SpectrumSink for CollectingSink {
    fn write(&mut self, record: &SpectrumRecord<'_>) -> std::io::Result<SinkStatus> {
        self.0.lock().push((*record.header, record.data.to_vec()));
        Ok(SinkStatus::Continue)
    }

    fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Heaps of ones carrying exactly the given counters, as if the missing ones had been
/// dropped upstream.
struct CounterListSource(std::vec::IntoIter<u64>);

impl HeapSource for CounterListSource {
    fn next_heap(&mut self, payload: &mut [f32]) -> Result<Received, StageError> {
        let Some(counter) = self.0.next() else {
            return Ok(Received::Exhausted);
        };
        payload.fill(1.0);
        Ok(Received::Heap {
            header: HeapHeader::new(counter, 0),
            index: HeapIndexEntry::new(counter as f64, true),
        })
    }
}

/// Constant-payload source at MJD 0 (or a fixed counter list) and a collecting sink;
/// everything else default.
struct TestFactory {
    payload: f32,
    counters: Option<Vec<u64>>,
    spectra: Spectra,
}

impl StageFactory for TestFactory {
    fn build(&self, kind: StageKind, config: &DaqConfig) -> AppResult<Box<dyn Stage>> {
        Ok(match kind {
            StageKind::Ingest => {
                let source: Box<dyn HeapSource> = match &self.counters {
                    Some(counters) => Box::new(CounterListSource(counters.clone().into_iter())),
                    None => Box::new(
                        MockHeapSource::new(&config.source)
                            .with_payload(MockPayload::Constant(self.payload))
                            .with_epoch(0.0),
                    ),
                };
                Box::new(IngestStage::new(source, config.heap_layout()))
            }
            StageKind::Disk => Box::new(DiskStage::new(
                config.spectrum_layout(),
                Box::new(CollectingSink(Arc::clone(&self.spectra))),
                config.pipeline.max_spectra,
            )),
            other => DefaultStageFactory.build(other, config)?,
        })
    }
}

fn config(shm_dir: &Path, mode: BandwidthMode, heaps: u64, per_integration: usize) -> DaqConfig {
    let mut config = DaqConfig::default();
    config.buffers.shm_dir = shm_dir.to_path_buf();
    config.buffers.block_count = 4;
    config.pipeline.bandwidth_mode = mode;
    config.pipeline.heaps_per_block = 4;
    config.pipeline.nchannels = 4;
    config.pipeline.nsubbands = 1;
    config.pipeline.heaps_per_integration = per_integration;
    config.pipeline.acquire_timeout_ms = 200;
    config.pipeline.poll_interval_ms = 20;
    config.source.max_heaps = heaps;
    config.output.path = shm_dir.join("spectra.raw");
    config
}

type Run = (
    heap_daq::pipeline::orchestrator::PipelineSummary,
    Vec<(SpectrumHeader, Vec<f32>)>,
);

fn run(config: DaqConfig, payload: f32) -> Run {
    run_factory(config, payload, None)
}

fn run_factory(config: DaqConfig, payload: f32, counters: Option<Vec<u64>>) -> Run {
    let spectra = Spectra::default();
    let factory = Arc::new(TestFactory {
        payload,
        counters,
        spectra: Arc::clone(&spectra),
    });
    let summary = Orchestrator::new(config)
        .with_factory(factory)
        .run_until_finished(&CancelToken::new())
        .unwrap();
    let collected = spectra.lock().clone();
    (summary, collected)
}

#[test]
fn high_bandwidth_chain_integrates_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let (summary, spectra) = run(config(dir.path(), BandwidthMode::High, 16, 2), 1.0);

    assert_eq!(summary.failures(), 0);
    assert_eq!(spectra.len(), 8);
    for (i, (header, data)) in spectra.iter().enumerate() {
        assert_eq!(header.integration, i as u64);
        assert_eq!(header.heaps, 2);
        assert_eq!(header.nchannels, 4);
        assert_eq!(header.nsubbands, 1);
        assert_eq!(data.len(), 16);
        assert!(data.iter().all(|&v| v == 2.0));
    }
    assert!(spectra.windows(2).all(|w| w[0].0.mjd < w[1].0.mjd));

    let accumulate = summary.stage(StageKind::Accumulate).unwrap();
    assert_eq!(accumulate.stats.blocks_in, 4);
    assert_eq!(accumulate.stats.spectra, 8);
    assert_eq!(summary.stage(StageKind::Disk).unwrap().stats.spectra, 8);
    assert_eq!(summary.stage(StageKind::Ingest).unwrap().stats.blocks_out, 4);
}

#[test]
fn low_bandwidth_chain_carries_phase_through_filter() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BandwidthMode::Low, 16, 2);
    config.source.phase_period = 2;
    let (summary, spectra) = run(config, 0.5);

    assert_eq!(summary.failures(), 0);
    assert_eq!(summary.stages.len(), 4);
    assert_eq!(summary.stage(StageKind::Filter).unwrap().stats.blocks_out, 4);
    let phases: Vec<u32> = spectra
        .iter()
        .map(|(h, _)| h.status & status::PHASE_MASK)
        .collect();
    assert_eq!(phases, [0, 1, 2, 3, 0, 1, 2, 3]);
    assert!(spectra.iter().all(|(_, d)| d.iter().all(|&v| v == 1.0)));
}

#[test]
fn runs_spanning_block_boundaries_are_integrated() {
    let dir = tempfile::tempdir().unwrap();
    let (summary, spectra) = run(config(dir.path(), BandwidthMode::High, 12, 3), 1.0);

    assert_eq!(summary.failures(), 0);
    assert_eq!(spectra.len(), 4);
    let heap_days = 1e-6 / 86_400.0;
    for (i, (header, data)) in spectra.iter().enumerate() {
        assert_eq!(header.heaps, 3);
        assert!(data.iter().all(|&v| v == 3.0));
        let first_heap = (i * 3) as f64;
        assert!((header.mjd - first_heap * heap_days).abs() < 1e-12);
    }
}

#[test]
fn blanked_runs_are_dropped_unless_an_interval_ends() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BandwidthMode::High, 16, 2);
    // heaps 3, 7, 11, 15 blanked; heaps 7 and 15 close an interval
    config.source.blank_every = 4;
    config.source.interval_heaps = 8;
    let (summary, spectra) = run(config, 1.0);

    let integrations: Vec<u64> = spectra.iter().map(|(h, _)| h.integration).collect();
    assert_eq!(integrations, [0, 2, 3, 4, 6, 7]);
    let ends: Vec<u64> = spectra
        .iter()
        .filter(|(h, _)| h.status & status::INTERVAL_END != 0)
        .map(|(h, _)| h.integration)
        .collect();
    assert_eq!(ends, [3, 7]);
    assert_eq!(
        summary.stage(StageKind::Accumulate).unwrap().stats.blanked_runs,
        2
    );

    // heaps 7 and 15 are left out of the closing runs, which say so
    for (header, data) in &spectra {
        let closes_interval = header.status & status::INTERVAL_END != 0;
        let flagged = header.status & status::BLANKING != 0;
        assert_eq!(flagged, closes_interval, "integration {}", header.integration);
        let (heaps, value) = if closes_interval { (1, 1.0) } else { (2, 2.0) };
        assert_eq!(header.heaps, heaps);
        assert!(data.iter().all(|&v| v == value));
    }
    let first = spectra[2].0;
    assert!((first.mjd - 6.0 * 1e-6 / 86_400.0).abs() < 1e-12);
}

#[test]
fn dropped_block_discards_the_run_it_split() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BandwidthMode::High, 0, 3);
    // block 4..8 never arrives; the run opened by heap 3 must not absorb 8 and 9
    let counters: Vec<u64> = (0..4).chain(8..16).collect();
    let (summary, spectra) = run_factory(config, 1.0, Some(counters));

    assert_eq!(summary.failures(), 0);
    let integrations: Vec<u64> = spectra.iter().map(|(h, _)| h.integration).collect();
    assert_eq!(integrations, [0, 2, 3]);
    let first_heaps: Vec<f64> = spectra.iter().map(|(h, _)| h.mjd).collect();
    assert_eq!(first_heaps, [0.0, 8.0, 11.0]);
    for (header, data) in &spectra {
        assert_eq!(header.heaps, 3);
        assert_eq!(header.status & status::BLANKING, 0);
        assert!(data.iter().all(|&v| v == 3.0));
    }
    assert_eq!(
        summary.stage(StageKind::Accumulate).unwrap().stats.invalid_runs,
        1
    );
}

#[test]
fn lost_heaps_invalidate_their_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BandwidthMode::High, 16, 2);
    config.source.loss_rate = 1.0;
    let (summary, spectra) = run(config, 1.0);

    assert!(spectra.is_empty());
    assert_eq!(summary.stage(StageKind::Ingest).unwrap().stats.heaps_lost, 16);
    assert_eq!(
        summary.stage(StageKind::Accumulate).unwrap().stats.invalid_runs,
        8
    );
}

#[test]
fn max_spectra_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BandwidthMode::High, 0, 2);
    config.source.heap_interval_us = 100;
    config.pipeline.max_spectra = 3;
    let (summary, spectra) = run(config, 1.0);

    assert_eq!(spectra.len(), 3);
    assert_eq!(summary.stage(StageKind::Disk).unwrap().stats.spectra, 3);
    assert_eq!(summary.failures(), 0);
}

#[test]
fn default_stages_write_a_raw_dump_with_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BandwidthMode::High, 16, 2);
    let record_bytes = std::mem::size_of::<SpectrumHeader>() + 16 * 4;
    let output = config.output.path.clone();

    let summary = Orchestrator::new(config)
        .run_until_finished(&CancelToken::new())
        .unwrap();
    assert_eq!(summary.failures(), 0);

    let len = std::fs::metadata(&output).unwrap().len() as usize;
    assert_eq!(len, 8 * record_bytes);
    let sidecar: serde_json::Value =
        serde_json::from_slice(&std::fs::read(output.with_extension("json")).unwrap()).unwrap();
    assert_eq!(sidecar["spectra"], 8);
}
