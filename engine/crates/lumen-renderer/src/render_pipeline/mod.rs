//! 每帧的 stage pass 以及组装它们的 render graph
//!
//! 每个 pass 都持有物理句柄和 resource table slot，setup 中用 graph 句柄声明读写，
//! execute 中直接使用物理句柄，不再查询 graph。

pub mod accum_pass;
pub mod composite_pass;
pub mod denoise_pass;
pub mod frame_graph;
pub mod path_trace_pass;
pub mod post_process_pass;
pub mod stats_clear_pass;
pub mod trace_dispatch;
pub mod upscale_pass;

use ash::vk;

use lumen_gfx::commands::command_buffer::{GfxBindings, GfxCommandBuffer};
use lumen_gfx::handles::{GfxBufferHandle, GfxImageHandle, GfxKernelHandle};
use lumen_render_graph::frame_resources::FrameImage;
use lumen_render_graph::resource_handle::{RgBufferHandle, RgImageHandle};
use lumen_render_interface::resource_table::ResourceSlot;

use crate::frame_constants::{FrameConstants, PassSlots, group_count};

/// 导入 graph 之后的图像
#[derive(Clone, Copy, Debug)]
pub struct GraphImage {
    pub rg: RgImageHandle,
    pub image: GfxImageHandle,
    pub slot: ResourceSlot,
}

impl GraphImage {
    pub fn new(rg: RgImageHandle, image: &FrameImage) -> Self {
        Self {
            rg,
            image: image.handle,
            slot: image.slot,
        }
    }
}

/// 导入 graph 之后的 buffer
#[derive(Clone, Copy, Debug)]
pub struct GraphBuffer {
    pub rg: RgBufferHandle,
    pub buffer: GfxBufferHandle,
    pub slot: ResourceSlot,
}

/// 绑定 kernel，写入 frame constants 和 pass slots，然后按 8x8 dispatch
pub(crate) fn record_compute(
    cmd: &mut GfxCommandBuffer,
    kernel: GfxKernelHandle,
    constants: &FrameConstants,
    slots: &PassSlots,
    extent: vk::Extent2D,
    bindings: GfxBindings,
) {
    cmd.cmd_bind_kernel(kernel);
    push_constants(cmd, constants, slots);
    cmd.cmd_dispatch(group_count(extent), bindings);
}

pub(crate) fn push_constants(cmd: &mut GfxCommandBuffer, constants: &FrameConstants, slots: &PassSlots) {
    cmd.cmd_push_constants(0, bytemuck::bytes_of(constants));
    cmd.cmd_push_constants(PassSlots::OFFSET, bytemuck::bytes_of(slots));
}
