use ash::vk;

use lumen_gfx::commands::command_buffer::GfxBindings;
use lumen_gfx::handles::GfxKernelHandle;
use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::RgImageState;

use crate::frame_constants::{FrameConstants, PassSlots};
use crate::render_pipeline::{GraphImage, record_compute};

const STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COMPUTE_SHADER;

/// 一对 history：混合后的颜色和亮度的一阶、二阶矩
#[derive(Clone, Copy, Debug)]
pub struct AccumHistory {
    pub color: GraphImage,
    pub moments: GraphImage,
}

/// temporal accumulation，stage 2 和 stage 5 各使用一个实例
///
/// 用当前帧和上一帧的世界坐标判断重投影是否有效，
/// `constants.blend_weight` 为 0 时直接用当前帧覆盖 history
pub struct AccumRgPass {
    pub kernel: GfxKernelHandle,
    pub constants: FrameConstants,

    /// 本帧的输入颜色
    pub input: GraphImage,
    pub world_position: GraphImage,
    pub previous_world_position: GraphImage,
    /// 上一帧写入的 history（只读）
    pub previous: AccumHistory,
    /// 本帧写入的 history
    pub current: AccumHistory,
}

impl RgPass for AccumRgPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        for input in [
            self.input,
            self.world_position,
            self.previous_world_position,
            self.previous.color,
            self.previous.moments,
        ] {
            builder.read_image(input.rg, RgImageState::storage_read(STAGE));
        }
        builder.write_image(self.current.color.rg, RgImageState::storage_write(STAGE));
        builder.write_image(self.current.moments.rg, RgImageState::storage_write(STAGE));
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        let inputs = [
            self.input,
            self.world_position,
            self.previous_world_position,
            self.previous.color,
            self.previous.moments,
        ];
        let outputs = [self.current.color, self.current.moments];

        let slots = PassSlots::new(
            &inputs.iter().chain(&outputs).map(|image| image.slot.index()).collect::<Vec<_>>(),
        );
        let bindings = inputs
            .iter()
            .fold(GfxBindings::new(), |bindings, image| bindings.read(image.image));
        let bindings = outputs.iter().fold(bindings, |bindings, image| bindings.write(image.image));

        record_compute(ctx.cmd, self.kernel, &self.constants, &slots, self.constants.extent(), bindings);
    }
}
