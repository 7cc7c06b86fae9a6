use ash::vk;

use lumen_gfx::commands::command_buffer::GfxBindings;
use lumen_gfx::handles::GfxKernelHandle;
use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::RgImageState;

use crate::frame_constants::{FrameConstants, PassSlots};
use crate::render_pipeline::{GraphImage, record_compute};

const STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COMPUTE_SHADER;

/// 通道选择需要的输入
#[derive(Clone, Copy, Debug)]
pub struct PostProcessInputs {
    pub radiance: GraphImage,
    pub albedo: GraphImage,
    pub normals: GraphImage,
    /// variance 通道从 moments 中计算
    pub moments: GraphImage,
}

impl PostProcessInputs {
    fn images(&self) -> [GraphImage; 4] {
        [self.radiance, self.albedo, self.normals, self.moments]
    }
}

/// stage 6：tone mapping、曝光、gamma 和通道选择
///
/// 唯一写出呈现格式的 stage。`inputs` 为 `None` 时输出 loading 画面
pub struct PostProcessRgPass {
    pub kernel: GfxKernelHandle,
    pub constants: FrameConstants,

    pub inputs: Option<PostProcessInputs>,
    /// 没有 upscaler 时就是呈现目标
    pub output: GraphImage,
}

impl RgPass for PostProcessRgPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        for input in self.inputs.iter().flat_map(PostProcessInputs::images) {
            builder.read_image(input.rg, RgImageState::storage_read(STAGE));
        }
        builder.write_image(self.output.rg, RgImageState::storage_write(STAGE));
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        let inputs = self.inputs.iter().flat_map(PostProcessInputs::images).collect::<Vec<_>>();

        let mut slots = vec![self.output.slot.index()];
        slots.extend(inputs.iter().map(|image| image.slot.index()));
        let bindings = inputs
            .iter()
            .fold(GfxBindings::new(), |bindings, image| bindings.read(image.image))
            .write(self.output.image);

        record_compute(
            ctx.cmd,
            self.kernel,
            &self.constants,
            &PassSlots::new(&slots),
            self.constants.extent(),
            bindings,
        );
    }
}
