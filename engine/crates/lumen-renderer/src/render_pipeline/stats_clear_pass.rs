use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::RgBufferState;
use lumen_render_interface::stats::FrameStats;

use crate::render_pipeline::GraphBuffer;

/// 帧开始时清零 stats readback
pub struct StatsClearRgPass {
    pub stats: GraphBuffer,
}

impl RgPass for StatsClearRgPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        builder.write_buffer(self.stats.rg, RgBufferState::TRANSFER_DST);
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        ctx.cmd.cmd_update_buffer(self.stats.buffer, 0, bytemuck::bytes_of(&FrameStats::default()));
    }
}
