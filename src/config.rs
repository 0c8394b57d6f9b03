//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition backend. Configuration is loaded
//! from:
//! 1. a TOML file (`config/heap_daq.toml` by default)
//! 2. Environment variables prefixed with `HEAP_DAQ_`, nested keys separated by `__`
//!
//! Every section has defaults, so an empty file is a valid (if small) configuration.
//!
//! # Example
//! ```no_run
//! use heap_daq::config::DaqConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // HEAP_DAQ_PIPELINE__BANDWIDTH_MODE=low overrides the file
//! let config = DaqConfig::load()?;
//! config.validate()?;
//! println!("Mode: {:?}", config.pipeline.bandwidth_mode);
//! # Ok(())
//! # }
//! ```

use crate::data::heap::{HeapBlockLayout, SpectrumBlockLayout};
use crate::error::{AppResult, DaqError};
use crate::pipeline::sched::{SchedPolicy, MAX_PRIORITY};
use crate::pipeline::{BandwidthMode, StageKind};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/heap_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HEAP_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Shared-memory ring buffers
    #[serde(default)]
    pub buffers: BufferConfig,
    /// Chain shape and data geometry
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Per-stage scheduling
    #[serde(default)]
    pub stages: StagesConfig,
    /// Synthetic heap source
    #[serde(default)]
    pub source: SourceConfig,
    /// Spectrum output
    #[serde(default)]
    pub output: OutputConfig,
    /// Control channel
    #[serde(default)]
    pub command: CommandConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable
    #[default]
    Pretty,
    /// Single-line
    Compact,
    /// One JSON object per event
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Ring buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Directory holding the shared-memory backing files
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    /// Blocks per ring
    #[serde(default = "default_block_count")]
    pub block_count: usize,
    /// Buffer id per link, upstream first (2 used in high mode, 3 in low mode)
    #[serde(default = "default_buffer_ids")]
    pub ids: Vec<u32>,
    /// Tag stored in each ring header
    #[serde(default = "default_tag")]
    pub tag: String,
}

/// Chain shape and data geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// High (3 stages) or low (4 stages, extra filter) bandwidth
    #[serde(default)]
    pub bandwidth_mode: BandwidthMode,
    /// Heaps per heap block (K)
    #[serde(default = "default_heaps_per_block")]
    pub heaps_per_block: usize,
    /// Channels per subband, multiple of 4
    #[serde(default = "default_nchannels")]
    pub nchannels: usize,
    /// Subbands per heap
    #[serde(default = "default_nsubbands")]
    pub nsubbands: usize,
    /// Heaps summed into one spectrum, at most `heaps_per_block`
    #[serde(default = "default_heaps_per_integration")]
    pub heaps_per_integration: usize,
    /// Ring buffer acquire timeout in milliseconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
    /// Control loop poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Stop after this many spectra (0 = run until stopped)
    #[serde(default)]
    pub max_spectra: u64,
}

/// Scheduling attributes of one stage thread
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSchedConfig {
    /// SCHED_FIFO priority (0 = leave the default policy)
    #[serde(default)]
    pub priority: u8,
    /// Linux cpulist, e.g. "0-3,8" (empty = no pinning)
    #[serde(default)]
    pub cpus: String,
}

/// Scheduling attributes for every stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Network receive stage
    #[serde(default)]
    pub ingest: StageSchedConfig,
    /// Polyphase filter stage (low bandwidth only)
    #[serde(default)]
    pub filter: StageSchedConfig,
    /// Accumulation stage
    #[serde(default)]
    pub accumulate: StageSchedConfig,
    /// Disk writer stage
    #[serde(default)]
    pub disk: StageSchedConfig,
}

impl StagesConfig {
    /// Attributes for `kind`.
    pub fn for_kind(&self, kind: StageKind) -> &StageSchedConfig {
        match kind {
            StageKind::Ingest => &self.ingest,
            StageKind::Filter => &self.filter,
            StageKind::Accumulate => &self.accumulate,
            StageKind::Disk => &self.disk,
        }
    }
}

/// Synthetic heap source parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Pause between heaps in microseconds (0 = as fast as possible)
    #[serde(default)]
    pub heap_interval_us: u64,
    /// Probability that a heap is lost in transit (0.0-1.0)
    #[serde(default)]
    pub loss_rate: f64,
    /// Assert blanking on one heap in every N (0 = never)
    #[serde(default)]
    pub blank_every: u64,
    /// Advance the switching phase every N heaps (0 = fixed phase)
    #[serde(default)]
    pub phase_period: u64,
    /// Mark every Nth heap as the end of an interval (0 = never)
    #[serde(default)]
    pub interval_heaps: u64,
    /// Stop after N heaps (0 = unbounded)
    #[serde(default)]
    pub max_heaps: u64,
    /// Random seed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Spectrum output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Raw spectrum dump file; a JSON sidecar is written next to it
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
}

/// Control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Named FIFO the controller listens on
    #[serde(default = "default_fifo_path")]
    pub fifo_path: PathBuf,
}

// Default value functions
fn default_name() -> String {
    "heap-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_block_count() -> usize {
    8
}

fn default_buffer_ids() -> Vec<u32> {
    vec![1, 2, 3]
}

fn default_tag() -> String {
    "heap_daq".to_string()
}

fn default_heaps_per_block() -> usize {
    64
}

fn default_nchannels() -> usize {
    256
}

fn default_nsubbands() -> usize {
    8
}

fn default_heaps_per_integration() -> usize {
    32
}

fn default_acquire_timeout() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_seed() -> u64 {
    42
}

fn default_output_path() -> PathBuf {
    PathBuf::from("data/spectra.raw")
}

fn default_fifo_path() -> PathBuf {
    PathBuf::from("/tmp/heap_daq_control")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            block_count: default_block_count(),
            ids: default_buffer_ids(),
            tag: default_tag(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bandwidth_mode: BandwidthMode::default(),
            heaps_per_block: default_heaps_per_block(),
            nchannels: default_nchannels(),
            nsubbands: default_nsubbands(),
            heaps_per_integration: default_heaps_per_integration(),
            acquire_timeout_ms: default_acquire_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_spectra: 0,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            heap_interval_us: 0,
            loss_rate: 0.0,
            blank_every: 0,
            phase_period: 0,
            interval_heaps: 0,
            max_heaps: 0,
            seed: default_seed(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            fifo_path: default_fifo_path(),
        }
    }
}

impl DaqConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `HEAP_DAQ_`
    /// Example: `HEAP_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.buffers.block_count == 0 {
            return invalid("buffers.block_count must be at least 1".into());
        }
        let links = self.pipeline.bandwidth_mode.stages().len() - 1;
        if self.buffers.ids.len() < links {
            return invalid(format!(
                "{:?} bandwidth mode needs {} buffer ids, {} configured",
                self.pipeline.bandwidth_mode,
                links,
                self.buffers.ids.len()
            ));
        }
        let mut seen = HashSet::new();
        for &id in &self.buffers.ids[..links] {
            if id == 0 {
                return invalid("Buffer id 0 is reserved for \"no buffer\"".into());
            }
            if !seen.insert(id) {
                return invalid(format!("Duplicate buffer id: {id}"));
            }
        }

        let p = &self.pipeline;
        if p.nchannels == 0 || p.nchannels % 4 != 0 {
            return invalid(format!(
                "Invalid nchannels {}. Must be a non-zero multiple of 4",
                p.nchannels
            ));
        }
        if p.nsubbands == 0 || p.heaps_per_block == 0 {
            return invalid("nsubbands and heaps_per_block must be non-zero".into());
        }
        if p.heaps_per_integration == 0 || p.heaps_per_integration > p.heaps_per_block {
            return invalid(format!(
                "Invalid heaps_per_integration {}. Must be 1-{}",
                p.heaps_per_integration, p.heaps_per_block
            ));
        }
        if p.acquire_timeout_ms == 0 || p.poll_interval_ms == 0 {
            return invalid("acquire_timeout_ms and poll_interval_ms must be non-zero".into());
        }

        if !(0.0..=1.0).contains(&self.source.loss_rate) {
            return invalid(format!(
                "Invalid loss_rate {}. Must be 0.0-1.0",
                self.source.loss_rate
            ));
        }

        for kind in StageKind::ALL {
            let stage = self.stages.for_kind(kind);
            if stage.priority > MAX_PRIORITY {
                return invalid(format!(
                    "Invalid priority {} for {kind} stage. Must be 0-{MAX_PRIORITY}",
                    stage.priority
                ));
            }
            self.sched_policy(kind)?;
        }

        Ok(())
    }

    /// Heap block geometry.
    pub fn heap_layout(&self) -> HeapBlockLayout {
        HeapBlockLayout {
            heaps_per_block: self.pipeline.heaps_per_block,
            nchannels: self.pipeline.nchannels,
            nsubbands: self.pipeline.nsubbands,
        }
    }

    /// Spectrum block geometry.
    pub fn spectrum_layout(&self) -> SpectrumBlockLayout {
        SpectrumBlockLayout {
            nchannels: self.pipeline.nchannels,
            nsubbands: self.pipeline.nsubbands,
        }
    }

    /// Ring buffer acquire timeout.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.acquire_timeout_ms)
    }

    /// Control loop poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.poll_interval_ms)
    }

    /// Scheduling policy for a stage thread.
    pub fn sched_policy(&self, kind: StageKind) -> AppResult<SchedPolicy> {
        let stage = self.stages.for_kind(kind);
        Ok(SchedPolicy::new(stage.priority, &stage.cpus)?)
    }
}
