//! Spectrum sinks behind the disk stage.
//!
//! The FITS writer used in production plugs in through [`SpectrumSink`]. This module
//! ships [`RawDumpSink`], which appends raw little-endian records to a file and keeps a
//! JSON sidecar describing them.

use crate::data::heap::{SpectrumBlockLayout, SpectrumHeader};
use crate::pipeline::cancel::Interrupt;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One integrated spectrum, borrowed from a spectrum block.
#[derive(Debug, Clone, Copy)]
pub struct SpectrumRecord<'a> {
    /// Header
    pub header: &'a SpectrumHeader,
    /// `[subband][stokes][channel]` values
    pub data: &'a [f32],
}

/// Whether the sink wants more spectra.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// Keep going
    Continue,
    /// Output is complete; the disk stage finishes
    Complete,
}

/// Destination of integrated spectra.
pub trait SpectrumSink: Send {
    /// Store one spectrum.
    fn write(&mut self, record: &SpectrumRecord<'_>) -> std::io::Result<SinkStatus>;

    /// Flush and close. Called once when the disk stage exits.
    fn finish(&mut self) -> std::io::Result<()>;

    /// Handle that wakes a blocked write.
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

/// Sidecar describing a raw dump.
#[derive(Debug, Clone, Serialize)]
pub struct DumpSummary {
    /// Raw file the sidecar describes
    pub data_file: PathBuf,
    /// Channels per subband
    pub nchannels: usize,
    /// Subbands
    pub nsubbands: usize,
    /// Bytes per record (header plus payload)
    pub record_bytes: usize,
    /// Payload layout
    pub layout: &'static str,
    /// Records written
    pub spectra: u64,
    /// MJD of the first record
    pub first_mjd: Option<f64>,
    /// MJD of the last record
    pub last_mjd: Option<f64>,
    /// Wall-clock time the dump was opened
    pub created: DateTime<Utc>,
}

/// Appends `[SpectrumHeader][payload]` records to a file.
pub struct RawDumpSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    summary: DumpSummary,
}

impl RawDumpSink {
    /// Create (truncating) the dump at `path`, creating parent directories.
    pub fn create(path: &Path, layout: SpectrumBlockLayout) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        info!(?path, "Opened raw spectrum dump");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            summary: DumpSummary {
                data_file: path.to_path_buf(),
                nchannels: layout.nchannels,
                nsubbands: layout.nsubbands,
                record_bytes: layout.block_size(),
                layout: "[subband][stokes][channel] f32 little-endian",
                spectra: 0,
                first_mjd: None,
                last_mjd: None,
                created: Utc::now(),
            },
        })
    }

    /// Sidecar path: the dump path with a `.json` extension.
    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    /// Summary so far.
    pub fn summary(&self) -> &DumpSummary {
        &self.summary
    }
}

impl SpectrumSink for RawDumpSink {
    fn write(&mut self, record: &SpectrumRecord<'_>) -> std::io::Result<SinkStatus> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "raw dump already finished",
            ));
        };
        writer.write_all(bytemuck::bytes_of(record.header))?;
        writer.write_all(bytemuck::cast_slice(record.data))?;

        self.summary.spectra += 1;
        self.summary.first_mjd.get_or_insert(record.header.mjd);
        self.summary.last_mjd = Some(record.header.mjd);
        Ok(SinkStatus::Continue)
    }

    fn finish(&mut self) -> std::io::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        let sidecar = File::create(self.sidecar_path())?;
        serde_json::to_writer_pretty(sidecar, &self.summary)?;
        debug!(
            path = ?self.path,
            spectra = self.summary.spectra,
            "Closed raw spectrum dump"
        );
        Ok(())
    }
}

impl Drop for RawDumpSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::error!(path = ?self.path, error = %e, "Failed to close raw spectrum dump");
        }
    }
}
