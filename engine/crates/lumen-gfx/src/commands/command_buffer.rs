use ash::vk;

use crate::accel::GfxAccelBuild;
use crate::commands::barrier::{GfxBarrierMask, GfxBufferBarrier, GfxImageBarrier};
use crate::handles::{GfxBufferHandle, GfxKernelHandle, GfxResource};

/// 一次 dispatch 声明的读写资源
///
/// Vulkan 后端使用 bindless，不需要这些信息；headless 后端用它来检查读写冒险。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GfxBindings {
    pub reads: Vec<GfxResource>,
    pub writes: Vec<GfxResource>,
}

impl GfxBindings {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn read(mut self, resource: impl Into<GfxResource>) -> Self {
        self.reads.push(resource.into());
        self
    }

    #[inline]
    pub fn write(mut self, resource: impl Into<GfxResource>) -> Self {
        self.writes.push(resource.into());
        self
    }
}

/// trace rays 使用的 hit group 表
///
/// raygen 和 miss 区域由后端根据绑定的 kernel 自行组装
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GfxHitTableRegion {
    pub buffer: GfxBufferHandle,
    pub stride: vk::DeviceSize,
    pub count: u32,
}

/// 录制下来的一条命令
#[derive(Clone, Debug)]
pub enum GfxCommand {
    BeginLabel(String),
    EndLabel,
    PipelineBarrier {
        memory_barriers: Vec<GfxBarrierMask>,
        image_barriers: Vec<GfxImageBarrier>,
        buffer_barriers: Vec<GfxBufferBarrier>,
    },
    UpdateBuffer {
        buffer: GfxBufferHandle,
        offset: vk::DeviceSize,
        data: Vec<u8>,
    },
    CopyBuffer {
        src: GfxBufferHandle,
        dst: GfxBufferHandle,
        regions: Vec<vk::BufferCopy>,
    },
    BindKernel(GfxKernelHandle),
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        group_count: glam::UVec3,
        bindings: GfxBindings,
    },
    TraceRays {
        hit_table: GfxHitTableRegion,
        extent: glam::UVec3,
        bindings: GfxBindings,
    },
    BuildAccelerationStructure(GfxAccelBuild),
}

/// 命令缓冲
///
/// 与后端无关的命令录制接口：命令先以 `GfxCommand` 的形式录制下来，
/// 提交时由后端回放（Vulkan 后端回放到 `vk::CommandBuffer`）。
///
/// # 使用示例
/// ```ignore
/// let mut cmd = GfxCommandBuffer::new("my-pass");
/// cmd.begin("my-pass");
/// cmd.cmd_bind_kernel(kernel);
/// cmd.cmd_dispatch(glam::uvec3(8, 8, 1), bindings);
/// cmd.end();
/// ```
#[derive(Debug)]
pub struct GfxCommandBuffer {
    name: String,
    commands: Vec<GfxCommand>,
    recording: bool,
    label_depth: u32,
    bound_kernel: Option<GfxKernelHandle>,
}
// new & init
impl GfxCommandBuffer {
    pub fn new(debug_name: impl Into<String>) -> Self {
        Self {
            name: debug_name.into(),
            commands: Vec::new(),
            recording: false,
            label_depth: 0,
            bound_kernel: None,
        }
    }
}
// Basic 命令
impl GfxCommandBuffer {
    /// 开始录制 command
    ///
    /// 会清空之前录制的内容，并自动设置 debug label
    pub fn begin(&mut self, debug_label_name: &str) {
        debug_assert!(!self.recording, "command buffer {} is already recording", self.name);
        self.commands.clear();
        self.label_depth = 0;
        self.bound_kernel = None;
        self.recording = true;
        self.begin_label(debug_label_name);
    }

    /// 结束录制 command
    ///
    /// 结束 debug label
    pub fn end(&mut self) {
        self.end_label();
        debug_assert_eq!(self.label_depth, 0, "unbalanced debug labels in {}", self.name);
        self.recording = false;
    }

    /// 丢弃录制的内容，用于回收到 pool 中
    pub fn reset(&mut self) {
        self.commands.clear();
        self.recording = false;
        self.label_depth = 0;
        self.bound_kernel = None;
    }

    #[inline]
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}
// getters
impl GfxCommandBuffer {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    #[inline]
    pub fn commands(&self) -> &[GfxCommand] {
        &self.commands
    }

    #[inline]
    pub fn bound_kernel(&self) -> Option<GfxKernelHandle> {
        self.bound_kernel
    }

    #[inline]
    fn push(&mut self, command: GfxCommand) {
        debug_assert!(self.recording, "command buffer {} is not recording", self.name);
        self.commands.push(command);
    }
}
// 数据传输类型
impl GfxCommandBuffer {
    /// 将 data 传输到 buffer 中，大小限制：65536Bytes=64KB
    #[inline]
    pub fn cmd_update_buffer(&mut self, buffer: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) {
        debug_assert!(data.len() <= 65536 && data.len() % 4 == 0);
        self.push(GfxCommand::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    #[inline]
    pub fn cmd_copy_buffer(&mut self, src: GfxBufferHandle, dst: GfxBufferHandle, regions: &[vk::BufferCopy]) {
        self.push(GfxCommand::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }
}
// 计算与光追
impl GfxCommandBuffer {
    #[inline]
    pub fn cmd_bind_kernel(&mut self, kernel: GfxKernelHandle) {
        self.bound_kernel = Some(kernel);
        self.push(GfxCommand::BindKernel(kernel));
    }

    /// 所有 kernel 共享同一个 pipeline layout，push constant 的 offset 以字节为单位
    #[inline]
    pub fn cmd_push_constants(&mut self, offset: u32, data: &[u8]) {
        self.push(GfxCommand::PushConstants {
            offset,
            data: data.to_vec(),
        });
    }

    #[inline]
    pub fn cmd_dispatch(&mut self, group_count: glam::UVec3, bindings: GfxBindings) {
        debug_assert!(self.bound_kernel.is_some(), "dispatch without kernel in {}", self.name);
        self.push(GfxCommand::Dispatch { group_count, bindings });
    }

    /// 光追的入口
    #[inline]
    pub fn cmd_trace_rays(&mut self, hit_table: GfxHitTableRegion, extent: glam::UVec3, bindings: GfxBindings) {
        debug_assert!(self.bound_kernel.is_some(), "trace rays without kernel in {}", self.name);
        self.push(GfxCommand::TraceRays {
            hit_table,
            extent,
            bindings,
        });
    }

    #[inline]
    pub fn cmd_build_acceleration_structure(&mut self, build: GfxAccelBuild) {
        self.push(GfxCommand::BuildAccelerationStructure(build));
    }
}
// 同步与调试
impl GfxCommandBuffer {
    #[inline]
    pub fn image_memory_barrier(&mut self, barriers: &[GfxImageBarrier]) {
        self.pipeline_barrier(&[], barriers, &[]);
    }

    #[inline]
    pub fn buffer_memory_barrier(&mut self, barriers: &[GfxBufferBarrier]) {
        self.pipeline_barrier(&[], &[], barriers);
    }

    #[inline]
    pub fn memory_barrier(&mut self, barriers: &[GfxBarrierMask]) {
        self.pipeline_barrier(barriers, &[], &[]);
    }

    pub fn pipeline_barrier(
        &mut self,
        memory_barriers: &[GfxBarrierMask],
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    ) {
        if memory_barriers.is_empty() && image_barriers.is_empty() && buffer_barriers.is_empty() {
            return;
        }
        self.push(GfxCommand::PipelineBarrier {
            memory_barriers: memory_barriers.to_vec(),
            image_barriers: image_barriers.to_vec(),
            buffer_barriers: buffer_barriers.to_vec(),
        });
    }

    #[inline]
    pub fn begin_label(&mut self, label_name: &str) {
        self.label_depth += 1;
        self.push(GfxCommand::BeginLabel(label_name.to_string()));
    }

    #[inline]
    pub fn end_label(&mut self) {
        debug_assert!(self.label_depth > 0, "end_label without begin_label in {}", self.name);
        self.label_depth = self.label_depth.saturating_sub(1);
        self.push(GfxCommand::EndLabel);
    }
}
