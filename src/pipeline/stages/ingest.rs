//! Network-receive stage: heaps from a [`HeapSource`] into heap blocks.

use crate::data::heap::HeapBlockLayout;
use crate::data::ring_buffer::RingBuffer;
use crate::pipeline::cancel::Interrupt;
use crate::pipeline::source::{HeapSource, Received};
use crate::pipeline::stage::{Stage, StageContext, StageError, StageStats};
use crate::pipeline::StageKind;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fills heap blocks from a heap source.
pub struct IngestStage {
    source: Box<dyn HeapSource>,
    layout: HeapBlockLayout,
    scratch: Vec<f32>,
}

/// Why a block fill stopped early.
enum FillEnd {
    Full,
    SourceDone,
    Cancelled,
}

impl IngestStage {
    /// Stage writing `layout` blocks filled from `source`.
    pub fn new(source: Box<dyn HeapSource>, layout: HeapBlockLayout) -> Self {
        Self {
            source,
            scratch: vec![0.0; layout.payload_len()],
            layout,
        }
    }

    /// Fill one claimed block; returns the heaps written and why filling stopped.
    fn fill(
        &mut self,
        ctx: &StageContext,
        bytes: &mut [u8],
    ) -> Result<(usize, FillEnd), StageError> {
        let mut block = self.layout.view_mut(bytes)?;
        let mut filled = 0;
        let mut end = FillEnd::Full;
        for i in 0..self.layout.heaps_per_block {
            if ctx.is_cancelled() {
                end = FillEnd::Cancelled;
                break;
            }
            match self.source.next_heap(block.payload_mut(i))? {
                Received::Heap { header, index } => {
                    if !index.is_valid() {
                        StageStats::bump(&ctx.stats.heaps_lost);
                    }
                    block.headers[i] = header;
                    block.index[i] = index;
                    filled += 1;
                }
                Received::Exhausted => {
                    end = FillEnd::SourceDone;
                    break;
                }
                Received::Interrupted => {
                    end = FillEnd::Cancelled;
                    break;
                }
            }
        }
        block.invalidate_from(filled);
        Ok((filled, end))
    }

    /// Pull and discard one block's worth of heaps. Returns false once the source
    /// has nothing more to give.
    fn discard_block(&mut self) -> Result<bool, StageError> {
        for _ in 0..self.layout.heaps_per_block {
            match self.source.next_heap(&mut self.scratch)? {
                Received::Heap { .. } => {}
                Received::Exhausted | Received::Interrupted => return Ok(false),
            }
        }
        Ok(true)
    }

    fn on_full_ring(&mut self, ctx: &StageContext, out: &RingBuffer) -> Result<bool, StageError> {
        let dropped = out.record_drop();
        StageStats::bump(&ctx.stats.dropped);
        warn!(
            buffer_id = out.id(),
            dropped,
            heaps = self.layout.heaps_per_block,
            "No free block, discarding heaps"
        );
        self.discard_block()
    }
}

impl Stage for IngestStage {
    fn kind(&self) -> StageKind {
        StageKind::Ingest
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        self.source.interrupter()
    }

    fn run(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        let out = ctx.output()?;

        while !ctx.is_cancelled() {
            let mut block = match out.acquire_free(ctx.acquire_timeout) {
                Ok(block) => block,
                Err(e) if e.is_timeout() => {
                    if !self.on_full_ring(ctx, out)? {
                        debug!("Source ended while ring was full");
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let (filled, end) = self.fill(ctx, block.data_mut())?;
            if matches!(end, FillEnd::Cancelled) {
                // abandoned blocks go back to FREE
                break;
            }
            if filled > 0 {
                block.publish();
                StageStats::bump(&ctx.stats.blocks_out);
            }
            if matches!(end, FillEnd::SourceDone) {
                info!(heaps_in_last_block = filled, "Heap source exhausted");
                break;
            }
        }
        Ok(())
    }
}
