//! Low-bandwidth filter stage.
//!
//! Sits between ingest and accumulate in the 4-stage chain. The polyphase filter
//! bank runs on an accelerator outside this crate; here heap blocks are moved from
//! the input ring to the output ring, dropping and counting when the output is full.

use crate::data::heap::HeapBlockLayout;
use crate::pipeline::stage::{Stage, StageContext, StageError, StageStats};
use crate::pipeline::StageKind;
use tracing::{debug, warn};

/// Forwards heap blocks between two rings.
#[derive(Debug)]
pub struct FilterStage {
    layout: HeapBlockLayout,
}

impl FilterStage {
    /// Stage forwarding `layout` blocks.
    pub fn new(layout: HeapBlockLayout) -> Self {
        Self { layout }
    }
}

impl Stage for FilterStage {
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn run(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        let input = ctx.input()?;
        let output = ctx.output()?;
        let bytes = self.layout.block_size();

        while !ctx.is_cancelled() {
            // read before waiting: everything upstream published is visible if it is set
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

            match output.acquire_free(ctx.acquire_timeout) {
                Ok(mut out) => {
                    out.data_mut()[..bytes].copy_from_slice(&block.data()[..bytes]);
                    out.publish();
                    StageStats::bump(&ctx.stats.blocks_out);
                }
                Err(e) if e.is_timeout() => {
                    let dropped = output.record_drop();
                    StageStats::bump(&ctx.stats.dropped);
                    warn!(buffer_id = output.id(), dropped, "No free block, dropping heap block");
                }
                Err(e) => return Err(e.into()),
            }
            block.release();
        }
        Ok(())
    }
}
