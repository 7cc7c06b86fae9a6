use ash::vk;

use lumen_gfx::commands::command_buffer::GfxBindings;
use lumen_gfx::handles::GfxKernelHandle;
use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::RgImageState;

use crate::frame_constants::{FrameConstants, PassSlots};
use crate::render_pipeline::{GraphImage, record_compute};

const STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COMPUTE_SHADER;

/// stage 4：把滤波后的间接光与 albedo、emissive 合成为一张 radiance
pub struct CompositeRgPass {
    pub kernel: GfxKernelHandle,
    pub constants: FrameConstants,

    /// 降噪的输出，没有降噪时是累积结果或 stage 1 的颜色
    pub indirect: GraphImage,
    pub albedo: GraphImage,
    pub emissive: GraphImage,
    pub output: GraphImage,
}

impl RgPass for CompositeRgPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        for input in [self.indirect, self.albedo, self.emissive] {
            builder.read_image(input.rg, RgImageState::storage_read(STAGE));
        }
        builder.write_image(self.output.rg, RgImageState::storage_write(STAGE));
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        let slots = PassSlots::new(&[
            self.indirect.slot.index(),
            self.albedo.slot.index(),
            self.emissive.slot.index(),
            self.output.slot.index(),
        ]);
        let bindings = GfxBindings::new()
            .read(self.indirect.image)
            .read(self.albedo.image)
            .read(self.emissive.image)
            .write(self.output.image);
        record_compute(ctx.cmd, self.kernel, &self.constants, &slots, self.constants.extent(), bindings);
    }
}
