use std::path::Path;

use itertools::Itertools;

use lumen_gfx::backend::GfxBackend;
use lumen_gfx::handles::GfxKernelHandle;
use lumen_gfx::kernel::GfxKernelDesc;

use crate::error::RendererError;

/// 每个 stage 使用的 kernel 名称，同时也是 SPIR-V 的文件名
pub mod names {
    pub const PATH_TRACE: &str = "path-trace";
    pub const PATH_TRACE_SOFTWARE: &str = "path-trace-software";
    pub const TEMPORAL_ACCUMULATION: &str = "temporal-accumulation";
    pub const DENOISE: &str = "denoise";
    pub const COMPOSITE: &str = "composite";
    pub const POST_PROCESS: &str = "post-process";
    pub const UPSCALE: &str = "upscale";
}

/// 渲染器使用的所有 kernel
///
/// 光追 kernel 只在设备支持时创建
pub struct RendererKernels {
    pub path_trace: Option<GfxKernelHandle>,
    pub path_trace_software: GfxKernelHandle,
    pub temporal_accumulation: GfxKernelHandle,
    pub denoise: GfxKernelHandle,
    pub composite: GfxKernelHandle,
    pub post_process: GfxKernelHandle,
    pub upscale: GfxKernelHandle,
}

impl RendererKernels {
    /// # 参数
    /// - `shader_dir`: 编译好的 SPIR-V 所在目录，`None` 时创建不带 SPIR-V 的 kernel（仅 headless）
    pub fn new(backend: &dyn GfxBackend, shader_dir: Option<&Path>) -> Result<Self, RendererError> {
        let _span = tracy_client::span!("RendererKernels::new");
        let load = |name: &str| -> Result<Option<Vec<u32>>, RendererError> {
            shader_dir.map(|dir| load_spirv(&dir.join(format!("{name}.spv")))).transpose()
        };
        let compute = |name: &str| -> Result<GfxKernelHandle, RendererError> {
            Ok(backend.create_kernel(&GfxKernelDesc::compute(name, load(name)?))?)
        };

        let path_trace = if backend.capabilities().ray_tracing {
            Some(backend.create_kernel(&GfxKernelDesc::ray_tracing(names::PATH_TRACE, load(names::PATH_TRACE)?))?)
        } else {
            log::warn!("device has no hardware ray tracing, only software traversal is available");
            None
        };

        let kernels = Self {
            path_trace,
            path_trace_software: compute(names::PATH_TRACE_SOFTWARE)?,
            temporal_accumulation: compute(names::TEMPORAL_ACCUMULATION)?,
            denoise: compute(names::DENOISE)?,
            composite: compute(names::COMPOSITE)?,
            post_process: compute(names::POST_PROCESS)?,
            upscale: compute(names::UPSCALE)?,
        };
        log::info!(
            "kernels created from {}",
            shader_dir.map_or_else(|| "<builtin>".to_string(), |dir| dir.display().to_string())
        );
        Ok(kernels)
    }

    /// 每一行 shader table 开头的 hit group identifier
    ///
    /// 没有硬件光追时 shader table 只被 software traversal 读取，identifier 全为 0
    pub fn hit_group(&self, backend: &dyn GfxBackend) -> Result<Vec<u8>, RendererError> {
        match self.path_trace {
            Some(kernel) => Ok(backend.hit_group_identifier(kernel)?),
            None => Ok(vec![0; backend.capabilities().shader_group_handle_size as usize]),
        }
    }

    /// 所有 kernel 句柄，光追 kernel 在最前
    pub fn handles(&self) -> Vec<GfxKernelHandle> {
        self.path_trace
            .into_iter()
            .chain([
                self.path_trace_software,
                self.temporal_accumulation,
                self.denoise,
                self.composite,
                self.post_process,
                self.upscale,
            ])
            .collect()
    }

    pub fn destroy(self, backend: &dyn GfxBackend) {
        self.handles().into_iter().for_each(|kernel| backend.destroy_kernel(kernel));
    }
}

/// 读取 SPIR-V 文件，按小端序转换为 u32
fn load_spirv(path: &Path) -> Result<Vec<u32>, RendererError> {
    let bytes = std::fs::read(path).map_err(|source| RendererError::KernelLoad {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() % 4 != 0 {
        return Err(RendererError::KernelLoad {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "spirv size is not a multiple of 4"),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};

    #[test]
    fn test_software_only_device_has_zero_hit_group() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            ray_tracing: false,
            ..Default::default()
        });
        let kernels = RendererKernels::new(&backend, None).unwrap();
        assert!(kernels.path_trace.is_none());

        let hit_group = kernels.hit_group(&backend).unwrap();
        assert_eq!(hit_group.len(), backend.capabilities().shader_group_handle_size as usize);
        assert!(hit_group.iter().all(|b| *b == 0));
        kernels.destroy(&backend);
    }

    #[test]
    fn test_hit_group_comes_from_ray_tracing_kernel() {
        let backend = HeadlessBackend::default();
        let kernels = RendererKernels::new(&backend, None).unwrap();
        let hit_group = kernels.hit_group(&backend).unwrap();
        assert!(hit_group.iter().any(|b| *b != 0));
        kernels.destroy(&backend);
    }

    #[test]
    fn test_missing_spirv_is_reported_with_path() {
        let backend = HeadlessBackend::default();
        let dir = std::env::temp_dir().join("lumen-missing-kernels");
        match RendererKernels::new(&backend, Some(&dir)) {
            Err(RendererError::KernelLoad { path, .. }) => assert!(path.starts_with(&dir)),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }
}
