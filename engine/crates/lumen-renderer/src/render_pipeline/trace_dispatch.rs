//! stage 1 的调度策略
//!
//! 硬件光追和 compute 模拟的遍历使用完全相同的资源约定，只有绑定点和入口不同。

use ash::vk;

use lumen_gfx::commands::command_buffer::{GfxBindings, GfxCommandBuffer};
use lumen_gfx::error::GfxError;
use lumen_gfx::handles::GfxKernelHandle;
use lumen_render_interface::output_settings::DispatchMode;

use crate::error::RendererError;
use crate::frame_constants::{FrameFlags, group_count};
use crate::kernels::RendererKernels;
use crate::render_pipeline::path_trace_pass::SceneBindings;

pub trait TraceDispatch: Send {
    fn name(&self) -> &'static str;

    /// pass 的读写发生在哪个 stage
    fn stage(&self) -> vk::PipelineStageFlags2;

    /// 附加到 frame constants 上的 flag
    fn flags(&self) -> FrameFlags;

    fn bind(&self, cmd: &mut GfxCommandBuffer);

    fn dispatch(&self, cmd: &mut GfxCommandBuffer, scene: &SceneBindings, extent: vk::Extent2D, bindings: GfxBindings);
}

/// `trace_rays`，每个像素一条光线
pub struct HardwareTraceDispatch {
    kernel: GfxKernelHandle,
}

impl TraceDispatch for HardwareTraceDispatch {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn stage(&self) -> vk::PipelineStageFlags2 {
        vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
    }

    fn flags(&self) -> FrameFlags {
        FrameFlags::empty()
    }

    fn bind(&self, cmd: &mut GfxCommandBuffer) {
        cmd.cmd_bind_kernel(self.kernel);
    }

    fn dispatch(&self, cmd: &mut GfxCommandBuffer, scene: &SceneBindings, extent: vk::Extent2D, bindings: GfxBindings) {
        cmd.cmd_trace_rays(scene.hit_region, glam::uvec3(extent.width, extent.height, 1), bindings);
    }
}

/// compute 中遍历 TLAS / BLAS
pub struct SoftwareTraceDispatch {
    kernel: GfxKernelHandle,
}

impl TraceDispatch for SoftwareTraceDispatch {
    fn name(&self) -> &'static str {
        "software"
    }

    fn stage(&self) -> vk::PipelineStageFlags2 {
        vk::PipelineStageFlags2::COMPUTE_SHADER
    }

    fn flags(&self) -> FrameFlags {
        FrameFlags::SOFTWARE_TRAVERSAL
    }

    fn bind(&self, cmd: &mut GfxCommandBuffer) {
        cmd.cmd_bind_kernel(self.kernel);
    }

    fn dispatch(&self, cmd: &mut GfxCommandBuffer, scene: &SceneBindings, extent: vk::Extent2D, bindings: GfxBindings) {
        // shader table 作为普通 storage buffer 读取
        cmd.cmd_dispatch(group_count(extent), bindings.read(scene.shader_table));
    }
}

/// 根据设置和设备能力选择调度方式
///
/// 强制使用硬件光追而设备不支持时返回 `MissingFeature`
pub fn select_trace_dispatch(
    mode: DispatchMode,
    kernels: &RendererKernels,
) -> Result<Box<dyn TraceDispatch>, RendererError> {
    let hardware = kernels.path_trace.map(|kernel| HardwareTraceDispatch { kernel });
    let software = SoftwareTraceDispatch {
        kernel: kernels.path_trace_software,
    };
    let dispatch: Box<dyn TraceDispatch> = match (mode, hardware) {
        (DispatchMode::Auto | DispatchMode::Hardware, Some(hardware)) => Box::new(hardware),
        (DispatchMode::Auto, None) | (DispatchMode::Software, _) => Box::new(software),
        (DispatchMode::Hardware, None) => {
            return Err(GfxError::MissingFeature("hardware ray tracing dispatch".to_string()).into());
        }
    };
    log::info!("stage 1 dispatch: {} ({:?} requested)", dispatch.name(), mode);
    Ok(dispatch)
}
