//! Terminal stage: spectrum blocks to a [`SpectrumSink`].

use crate::data::heap::SpectrumBlockLayout;
use crate::pipeline::cancel::Interrupt;
use crate::pipeline::sink::{SinkStatus, SpectrumRecord, SpectrumSink};
use crate::pipeline::stage::{Stage, StageContext, StageError, StageStats};
use crate::pipeline::StageKind;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hands spectra to a sink until told to stop, the sink is complete, `max_spectra`
/// is reached, or the upstream stage has finished and the input is drained.
pub struct DiskStage {
    layout: SpectrumBlockLayout,
    sink: Box<dyn SpectrumSink>,
    max_spectra: u64,
    written: u64,
}

impl DiskStage {
    /// Stage writing `layout` spectra into `sink`; `max_spectra == 0` is unbounded.
    pub fn new(layout: SpectrumBlockLayout, sink: Box<dyn SpectrumSink>, max_spectra: u64) -> Self {
        Self {
            layout,
            sink,
            max_spectra,
            written: 0,
        }
    }

    /// Returns true when the stage should stop after this block.
    fn write_block(&mut self, ctx: &StageContext, bytes: &[u8]) -> Result<bool, StageError> {
        let (header, data) = self.layout.view(bytes)?;
        match self.sink.write(&SpectrumRecord { header, data }) {
            Ok(status) => {
                self.written += 1;
                StageStats::bump(&ctx.stats.spectra);
                if status == SinkStatus::Complete {
                    info!(spectra = self.written, "Sink complete");
                    return Ok(true);
                }
            }
            Err(e) => {
                let errors = StageStats::bump(&ctx.stats.io_errors);
                warn!(error = %e, integration = header.integration, io_errors = errors, "Spectrum write failed");
            }
        }
        if self.max_spectra > 0 && self.written >= self.max_spectra {
            info!(spectra = self.written, "Reached max_spectra");
            return Ok(true);
        }
        Ok(false)
    }
}

impl Stage for DiskStage {
    fn kind(&self) -> StageKind {
        StageKind::Disk
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        self.sink.interrupter()
    }

    fn run(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        let input = ctx.input()?;

        let result = loop {
            if ctx.is_cancelled() {
                break Ok(());
            }
            let upstream_done = ctx.upstream_done();
            let block = match input.acquire_full(ctx.acquire_timeout) {
                Ok(block) => block,
                Err(e) if e.is_timeout() => {
                    if upstream_done {
                        debug!("Upstream finished and input drained");
                        break Ok(());
                    }
                    continue;
                }
                Err(e) => break Err(e.into()),
            };
            StageStats::bump(&ctx.stats.blocks_in);
            let done = self.write_block(ctx, block.data());
            block.release();
            match done {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };

        self.sink.finish()?;
        result
    }
}
