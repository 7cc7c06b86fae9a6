use ash::vk;

use lumen_gfx::commands::command_buffer::{GfxBindings, GfxCommandBuffer};
use lumen_gfx::handles::GfxKernelHandle;
use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::RgImageState;

use crate::frame_constants::{FrameConstants, PassSlots, group_count};
use crate::render_pipeline::{GraphImage, push_constants};

/// 把渲染分辨率的 post-process 输出放大到呈现目标
///
/// 厂商的 upscaler 通过实现这个 trait 接入
pub trait Upscaler: Send {
    fn name(&self) -> &str;

    fn input_state(&self) -> RgImageState {
        RgImageState::storage_read(vk::PipelineStageFlags2::COMPUTE_SHADER)
    }

    fn output_state(&self) -> RgImageState {
        RgImageState::storage_write(vk::PipelineStageFlags2::COMPUTE_SHADER)
    }

    /// # 参数
    /// - `constants`: 渲染分辨率的 frame constants
    /// - `output_extent`: 呈现目标的分辨率
    fn record(
        &self,
        cmd: &mut GfxCommandBuffer,
        constants: &FrameConstants,
        input: &GraphImage,
        output: &GraphImage,
        output_extent: vk::Extent2D,
    );
}

/// 基于 compute 的空间放大
pub struct SpatialUpscaler {
    kernel: GfxKernelHandle,
}

impl SpatialUpscaler {
    pub fn new(kernel: GfxKernelHandle) -> Self {
        Self { kernel }
    }
}

impl Upscaler for SpatialUpscaler {
    fn name(&self) -> &str {
        "spatial"
    }

    fn record(
        &self,
        cmd: &mut GfxCommandBuffer,
        constants: &FrameConstants,
        input: &GraphImage,
        output: &GraphImage,
        output_extent: vk::Extent2D,
    ) {
        cmd.cmd_bind_kernel(self.kernel);
        push_constants(
            cmd,
            constants,
            &PassSlots::new(&[input.slot.index(), output.slot.index(), output_extent.width, output_extent.height]),
        );
        // 按输出分辨率 dispatch
        cmd.cmd_dispatch(group_count(output_extent), GfxBindings::new().read(input.image).write(output.image));
    }
}

/// stage 7
pub struct UpscaleRgPass<'a> {
    pub upscaler: &'a dyn Upscaler,
    pub constants: FrameConstants,
    pub input: GraphImage,
    pub output: GraphImage,
    pub output_extent: vk::Extent2D,
}

impl RgPass for UpscaleRgPass<'_> {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        builder.read_image(self.input.rg, self.upscaler.input_state());
        builder.write_image(self.output.rg, self.upscaler.output_state());
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        self.upscaler
            .record(ctx.cmd, &self.constants, &self.input, &self.output, self.output_extent);
    }
}
