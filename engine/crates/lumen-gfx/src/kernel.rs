use ash::vk;

/// kernel 的类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GfxKernelKind {
    Compute,
    /// 单个 SPIR-V 模块，包含 `raygen` / `miss` / `closest_hit` 三个入口
    RayTracing,
}

/// 一个不透明的 GPU kernel
///
/// kernel 的具体实现（降噪、tone mapping 等）不在本 crate 的范围内，
/// 这里只描述创建 pipeline 所需的信息。
#[derive(Clone, Debug)]
pub struct GfxKernelDesc {
    pub name: String,
    pub kind: GfxKernelKind,
    /// 没有 SPIR-V 时只有 headless 后端可以创建
    pub spirv: Option<Vec<u32>>,
}

impl GfxKernelDesc {
    pub fn compute(name: impl Into<String>, spirv: Option<Vec<u32>>) -> Self {
        Self {
            name: name.into(),
            kind: GfxKernelKind::Compute,
            spirv,
        }
    }

    pub fn ray_tracing(name: impl Into<String>, spirv: Option<Vec<u32>>) -> Self {
        Self {
            name: name.into(),
            kind: GfxKernelKind::RayTracing,
            spirv,
        }
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            GfxKernelKind::Compute => vk::PipelineBindPoint::COMPUTE,
            GfxKernelKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

/// 所有 kernel 共享的 push constant 大小
pub const PUSH_CONSTANT_SIZE: u32 = 256;
