//! Pass 定义和构建器
//!
//! `RgPass` 在 setup 中通过 `RgPassBuilder` 声明资源依赖，在 execute 中录制命令。

use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
use lumen_gfx::handles::{GfxBufferHandle, GfxImageHandle};

use crate::resource::RgResourceRegistry;
use crate::resource_handle::{RgBufferHandle, RgImageHandle};
use crate::resource_state::{RgBufferState, RgImageState};

/// pass 执行时的上下文
pub struct RgPassContext<'a> {
    /// 已经开始录制，barrier 已经插入
    pub cmd: &'a mut GfxCommandBuffer,
    pub(crate) resources: &'a RgResourceRegistry,
}

impl RgPassContext<'_> {
    #[inline]
    pub fn image(&self, handle: RgImageHandle) -> Option<GfxImageHandle> {
        self.resources.get_image(handle).map(|r| r.physical)
    }

    #[inline]
    pub fn buffer(&self, handle: RgBufferHandle) -> Option<GfxBufferHandle> {
        self.resources.get_buffer(handle).map(|r| r.physical)
    }
}

/// 在 `RgPass::setup()` 中声明 pass 的资源依赖
#[derive(Default)]
pub struct RgPassBuilder {
    pub(crate) image_reads: Vec<(RgImageHandle, RgImageState)>,
    pub(crate) image_writes: Vec<(RgImageHandle, RgImageState)>,
    pub(crate) buffer_reads: Vec<(RgBufferHandle, RgBufferState)>,
    pub(crate) buffer_writes: Vec<(RgBufferHandle, RgBufferState)>,
}

impl RgPassBuilder {
    /// # 参数
    /// - `state`: 读取时期望的状态，用于推断 barrier
    #[inline]
    pub fn read_image(&mut self, handle: RgImageHandle, state: RgImageState) -> RgImageHandle {
        self.image_reads.push((handle, state));
        handle
    }

    #[inline]
    pub fn write_image(&mut self, handle: RgImageHandle, state: RgImageState) -> RgImageHandle {
        self.image_writes.push((handle, state));
        handle
    }

    /// 同时读取和写入，常用于累积
    pub fn read_write_image(&mut self, handle: RgImageHandle, state: RgImageState) -> RgImageHandle {
        self.read_image(handle, state);
        self.write_image(handle, state)
    }

    #[inline]
    pub fn read_buffer(&mut self, handle: RgBufferHandle, state: RgBufferState) -> RgBufferHandle {
        self.buffer_reads.push((handle, state));
        handle
    }

    #[inline]
    pub fn write_buffer(&mut self, handle: RgBufferHandle, state: RgBufferState) -> RgBufferHandle {
        self.buffer_writes.push((handle, state));
        handle
    }
}

/// 编译后的 pass 节点
pub struct RgPassNode<'a> {
    pub name: String,
    pub image_reads: Vec<(RgImageHandle, RgImageState)>,
    pub image_writes: Vec<(RgImageHandle, RgImageState)>,
    pub buffer_reads: Vec<(RgBufferHandle, RgBufferState)>,
    pub buffer_writes: Vec<(RgBufferHandle, RgBufferState)>,
    pub(crate) pass: Box<dyn RgPass + 'a>,
}

/// graph 中的一个 pass
///
/// pass 可以借用外部资源（kernel、常量、scene），生命周期由 `RenderGraphBuilder<'a>` 约束。
/// graph 在单个提交线程上构建和执行，因此不要求 `Send`。
pub trait RgPass {
    /// 声明读取和写入的资源
    fn setup(&mut self, builder: &mut RgPassBuilder);

    /// 录制命令，不需要手动插入 barrier
    fn execute(&self, ctx: &mut RgPassContext<'_>);
}
