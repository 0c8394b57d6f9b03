//! Accumulation stage: heaps into integrated spectra.
//!
//! Heaps are summed in arrival order into a `[channel][subband][stokes]` accumulator.
//! Blanked and scan-not-started heaps are left out of the sum. A block whose first
//! heap counter does not follow the previous block's last one means blocks were
//! dropped upstream, and the open run is discarded as invalid.
//! Every `heaps_per_integration` heaps the finished run is judged through the
//! [`BlockInfoCache`], which still holds the previous block, so runs that straddle a
//! block boundary are judged as a whole:
//!
//! - any invalid heap, or a phase change inside the run: discarded, `invalid_runs`
//! - blanking without a terminal interval-end: discarded, `blanked_runs`
//! - otherwise: transposed into a spectrum block labeled with the MJD of the first
//!   non-blanked heap, the run's phase, and the interval-end flag. If blanked heaps
//!   were left out, the spectrum carries [`status::BLANKING`] and `heaps` counts only
//!   the heaps actually summed

use crate::data::block_info::{BlockInfoCache, BLANKED, INTERVAL_END, PHASE_CHANGE};
use crate::data::heap::{status, HeapBlockLayout, SpectrumBlockLayout};
use crate::data::transpose::transpose;
use crate::pipeline::stage::{Stage, StageContext, StageError, StageStats};
use crate::pipeline::StageKind;
use tracing::{debug, trace, warn};

/// Verdict on a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    /// Emit a spectrum
    Emit,
    /// At least one heap invalid
    Invalid,
    /// Switching phase changed inside the run
    PhaseChange,
    /// Blanking asserted without an interval end
    Blanked,
}

/// Judge the run `[start, start + count)` of `cache`.
pub fn judge_run(cache: &BlockInfoCache, start: usize, count: usize) -> RunVerdict {
    if !cache.is_valid(start, count) {
        return RunVerdict::Invalid;
    }
    let flags = cache.is_blanked(start, count);
    if flags & PHASE_CHANGE != 0 {
        RunVerdict::PhaseChange
    } else if flags & BLANKED != 0 && flags & INTERVAL_END == 0 {
        RunVerdict::Blanked
    } else {
        RunVerdict::Emit
    }
}

/// Integrates heap blocks into spectrum blocks.
pub struct AccumulateStage {
    heap_layout: HeapBlockLayout,
    spectrum_layout: SpectrumBlockLayout,
    heaps_per_integration: usize,
    cache: BlockInfoCache,
    accumulator: Vec<f32>,
    run_start: usize,
    run_len: usize,
    run_summed: u32,
    next_counter: Option<u64>,
    integration: u64,
}

impl AccumulateStage {
    /// Stage summing `heaps_per_integration` heaps per spectrum.
    ///
    /// `heaps_per_integration` must not exceed the heaps per block, so a run spans at
    /// most one block boundary.
    pub fn new(heap_layout: HeapBlockLayout, heaps_per_integration: usize) -> Self {
        let k = heap_layout.heaps_per_block;
        Self {
            spectrum_layout: SpectrumBlockLayout {
                nchannels: heap_layout.nchannels,
                nsubbands: heap_layout.nsubbands,
            },
            heaps_per_integration: heaps_per_integration.clamp(1, k.max(1)),
            cache: BlockInfoCache::new(k),
            accumulator: vec![0.0; heap_layout.payload_len()],
            run_start: k,
            run_len: 0,
            run_summed: 0,
            next_counter: None,
            integration: 0,
            heap_layout,
        }
    }

    /// Consume one heap block.
    fn process_block(&mut self, ctx: &StageContext, bytes: &[u8]) -> Result<(), StageError> {
        let block = self.heap_layout.view(bytes)?;
        let k = self.heap_layout.heaps_per_block;

        let first = block.headers.first().map(|h| h.counter);
        if self.run_len > 0 && first != self.next_counter {
            self.abandon_run(ctx, first);
        }
        self.next_counter = block.headers.last().map(|h| h.counter.wrapping_add(1));

        self.cache.input(block.headers, block.index);
        if self.run_len > 0 {
            // the open run now sits in the "previous" half
            self.run_start -= k;
        }

        for i in 0..k {
            if self.run_len == 0 {
                self.run_start = k + i;
                self.accumulator.fill(0.0);
                self.run_summed = 0;
            }
            if !block.headers[i].is_blanking() {
                for (acc, v) in self.accumulator.iter_mut().zip(block.payload(i)) {
                    *acc += *v;
                }
                self.run_summed += 1;
            }
            self.run_len += 1;
            if self.run_len == self.heaps_per_integration {
                self.finish_run(ctx)?;
                self.run_len = 0;
            }
        }
        Ok(())
    }

    /// Drop the open run after a gap in the heap counters.
    fn abandon_run(&mut self, ctx: &StageContext, got: Option<u64>) {
        let integration = self.integration;
        self.integration += 1;
        self.run_len = 0;
        let n = StageStats::bump(&ctx.stats.invalid_runs);
        warn!(
            integration,
            expected = ?self.next_counter,
            got = ?got,
            invalid_runs = n,
            "Heap counter gap, discarding open run"
        );
    }

    fn finish_run(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        let (start, count) = (self.run_start, self.heaps_per_integration);
        let integration = self.integration;
        self.integration += 1;

        match judge_run(&self.cache, start, count) {
            RunVerdict::Emit => self.emit(ctx, start, count, integration),
            RunVerdict::Blanked => {
                let n = StageStats::bump(&ctx.stats.blanked_runs);
                debug!(integration, blanked_runs = n, "Discarding blanked run");
                Ok(())
            }
            verdict => {
                let n = StageStats::bump(&ctx.stats.invalid_runs);
                debug!(integration, ?verdict, invalid_runs = n, "Discarding run");
                Ok(())
            }
        }
    }

    fn emit(
        &mut self,
        ctx: &StageContext,
        start: usize,
        count: usize,
        integration: u64,
    ) -> Result<(), StageError> {
        let output = ctx.output()?;
        let flags = self.cache.is_blanked(start, count);
        let label = self.cache.first_unblanked(start, count).unwrap_or(start);
        let mjd = self.cache.mjd(label).unwrap_or_default();
        let phase = self.cache.status(start).unwrap_or_default() & status::PHASE_MASK;
        let mut bits = phase;
        if flags & INTERVAL_END != 0 {
            bits |= status::INTERVAL_END;
        }
        if (self.run_summed as usize) < count {
            bits |= status::BLANKING;
        }

        let mut block = match output.acquire_free(ctx.acquire_timeout) {
            Ok(block) => block,
            Err(e) if e.is_timeout() => {
                let dropped = output.record_drop();
                StageStats::bump(&ctx.stats.dropped);
                warn!(buffer_id = output.id(), integration, dropped, "No free block, dropping spectrum");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        {
            let (header, payload) = self.spectrum_layout.view_mut(block.data_mut())?;
            *header = crate::data::heap::SpectrumHeader {
                mjd,
                integration,
                heaps: self.run_summed,
                status: bits,
                nchannels: self.spectrum_layout.nchannels as u32,
                nsubbands: self.spectrum_layout.nsubbands as u32,
            };
            transpose(
                &self.accumulator,
                payload,
                self.spectrum_layout.nchannels,
                self.spectrum_layout.nsubbands,
            )?;
        }
        block.publish();
        StageStats::bump(&ctx.stats.blocks_out);
        StageStats::bump(&ctx.stats.spectra);
        trace!(integration, mjd, phase, "Spectrum published");
        Ok(())
    }
}

impl Stage for AccumulateStage {
    fn kind(&self) -> StageKind {
        StageKind::Accumulate
    }

    fn run(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        let input = ctx.input()?;
        ctx.output()?;

        while !ctx.is_cancelled() {
            let upstream_done = ctx.upstream_done();
            let block = match input.acquire_full(ctx.acquire_timeout) {
                Ok(block) => block,
                Err(e) if e.is_timeout() => {
                    if upstream_done {
                        debug!("Upstream finished and input drained");
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            StageStats::bump(&ctx.stats.blocks_in);
            let result = self.process_block(ctx, block.data());
            block.release();
            result?;
        }
        Ok(())
    }
}
