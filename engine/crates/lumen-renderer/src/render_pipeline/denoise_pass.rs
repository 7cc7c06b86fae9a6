use ash::vk;

use lumen_gfx::commands::command_buffer::GfxBindings;
use lumen_gfx::handles::GfxKernelHandle;
use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::RgImageState;
use lumen_render_interface::output_settings::DenoiseSettings;

use crate::frame_constants::{FrameConstants, PassSlots};
use crate::render_pipeline::{GraphImage, record_compute};

const STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COMPUTE_SHADER;

/// 边缘感知的 à-trous wavelet 的一次迭代
///
/// 第 i 次迭代的步长为 `1 << i`，读取上一次的输出，写入 ping-pong 中的另一张
pub struct DenoiseRgPass {
    pub kernel: GfxKernelHandle,
    pub constants: FrameConstants,
    pub settings: DenoiseSettings,
    pub iteration: u32,

    pub input: GraphImage,
    pub output: GraphImage,
    /// 边缘权重使用的 guide
    pub normals: GraphImage,
    pub world_position: GraphImage,
}

impl DenoiseRgPass {
    /// `iterations` 次迭代中每一次的输入输出
    ///
    /// 第 0 次读取 `first_input`，之后在 ping 和 pong 之间交替，返回的最后一项的输出就是降噪结果
    pub fn ping_pong_chain<T: Copy>(first_input: T, ping: T, pong: T, iterations: u32) -> Vec<(T, T)> {
        let mut chain = Vec::with_capacity(iterations as usize);
        let mut input = first_input;
        for i in 0..iterations {
            let output = if i % 2 == 0 { ping } else { pong };
            chain.push((input, output));
            input = output;
        }
        chain
    }

    #[inline]
    pub fn step_width(&self) -> u32 {
        1 << self.iteration
    }
}

impl RgPass for DenoiseRgPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        for input in [self.input, self.normals, self.world_position] {
            builder.read_image(input.rg, RgImageState::storage_read(STAGE));
        }
        builder.write_image(self.output.rg, RgImageState::storage_write(STAGE));
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        let slots = PassSlots::new(&[
            self.input.slot.index(),
            self.output.slot.index(),
            self.normals.slot.index(),
            self.world_position.slot.index(),
            self.step_width(),
            self.settings.sigma_luminance.to_bits(),
            self.settings.sigma_normal.to_bits(),
            self.settings.sigma_position.to_bits(),
        ]);
        let bindings = GfxBindings::new()
            .read(self.input.image)
            .read(self.normals.image)
            .read(self.world_position.image)
            .write(self.output.image);

        record_compute(ctx.cmd, self.kernel, &self.constants, &slots, self.constants.extent(), bindings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_alternates() {
        let (accumulated, ping, pong) = (1, 2, 3);
        let chain = DenoiseRgPass::ping_pong_chain(accumulated, ping, pong, 4);
        assert_eq!(chain, vec![(1, 2), (2, 3), (3, 2), (2, 3)]);
        assert!(DenoiseRgPass::ping_pong_chain(accumulated, ping, pong, 0).is_empty());
    }
}
