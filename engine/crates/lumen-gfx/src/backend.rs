use std::sync::Arc;

use ash::vk;

use crate::accel::{GfxAccelBuildSizes, GfxAccelInput, GfxAccelLevel};
use crate::commands::command_buffer::GfxCommandBuffer;
use crate::error::GfxResult;
use crate::handles::{GfxAccelHandle, GfxBufferHandle, GfxCommandAllocatorHandle, GfxImageHandle, GfxKernelHandle};
use crate::kernel::GfxKernelDesc;
use crate::resources::{GfxBufferDesc, GfxDescriptor, GfxImageDesc};

/// 可用的后端类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 不依赖 GPU，总是可用
    Headless,
    Vulkan,
}

/// 后端在初始化时报告的能力
#[derive(Clone, Debug)]
pub struct GfxCapabilities {
    pub device_name: String,
    /// 是否支持硬件光追（`trace_rays`）
    pub ray_tracing: bool,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    /// acceleration structure 构建时 scratch buffer 的对齐要求
    pub scratch_alignment: u32,
    /// resource table 最多可以容纳的 slot 数量
    pub max_descriptor_slots: u32,
}

/// 创建后端使用的配置
#[derive(Clone, Debug)]
pub struct GfxBackendConfig {
    pub app_name: String,
    pub enable_validation: bool,
    /// 与 resource table 的容量一致
    pub descriptor_slots: u32,
}

impl Default for GfxBackendConfig {
    fn default() -> Self {
        Self {
            app_name: "lumen".to_string(),
            enable_validation: cfg!(debug_assertions),
            descriptor_slots: 4096,
        }
    }
}

/// GPU 后端
///
/// 持有所有 GPU 对象的 arena，内部自行同步，可以在加载线程和渲染线程之间共享。
/// 命令以 `GfxCommandBuffer` 的形式提交，`signal_value` 是单调递增的 fence 值，
/// 由 command stream pool 统一分配。
pub trait GfxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> &GfxCapabilities;

    // buffer
    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle>;
    fn destroy_buffer(&self, handle: GfxBufferHandle);
    /// 只能用于 host visible 的 buffer
    fn write_buffer(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()>;
    fn read_buffer(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()>;
    fn buffer_device_address(&self, handle: GfxBufferHandle) -> GfxResult<vk::DeviceAddress>;

    // image
    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImageHandle>;
    fn destroy_image(&self, handle: GfxImageHandle);
    fn image_extent(&self, handle: GfxImageHandle) -> Option<vk::Extent2D>;

    // kernel
    fn create_kernel(&self, desc: &GfxKernelDesc) -> GfxResult<GfxKernelHandle>;
    fn destroy_kernel(&self, handle: GfxKernelHandle);
    /// 光追 kernel 的 hit group identifier，大小为 `shader_group_handle_size`
    fn hit_group_identifier(&self, kernel: GfxKernelHandle) -> GfxResult<Vec<u8>>;

    // acceleration structure
    fn accel_build_sizes(&self, input: &GfxAccelInput) -> GfxResult<GfxAccelBuildSizes>;
    fn create_accel(&self, level: GfxAccelLevel, size: vk::DeviceSize, name: &str) -> GfxResult<GfxAccelHandle>;
    fn destroy_accel(&self, handle: GfxAccelHandle);
    fn accel_device_address(&self, handle: GfxAccelHandle) -> GfxResult<vk::DeviceAddress>;

    // descriptor
    fn write_descriptor(&self, slot: u32, descriptor: GfxDescriptor) -> GfxResult<()>;

    // command & sync
    fn create_command_allocator(&self, name: &str) -> GfxResult<GfxCommandAllocatorHandle>;
    /// 调用者保证 allocator 上的所有命令都已经执行完毕
    fn reset_command_allocator(&self, handle: GfxCommandAllocatorHandle) -> GfxResult<()>;
    fn destroy_command_allocator(&self, handle: GfxCommandAllocatorHandle);
    fn submit(
        &self,
        allocator: GfxCommandAllocatorHandle,
        cmd: &GfxCommandBuffer,
        signal_value: u64,
    ) -> GfxResult<()>;
    fn completed_fence_value(&self) -> u64;
    fn wait_fence_value(&self, value: u64, timeout_ns: u64) -> GfxResult<()>;
    fn wait_idle(&self) -> GfxResult<()>;
}

/// 创建后端
///
/// - `BackendKind::Headless` 总是可用
/// - `BackendKind::Vulkan` 需要支持 Vulkan 1.3 的设备
pub fn create_backend(kind: BackendKind, config: &GfxBackendConfig) -> GfxResult<Arc<dyn GfxBackend>> {
    let _span = tracy_client::span!("create_backend");
    log::info!("creating {:?} backend", kind);
    match kind {
        BackendKind::Headless => Ok(Arc::new(crate::headless::HeadlessBackend::new(
            crate::headless::HeadlessConfig {
                max_descriptor_slots: config.descriptor_slots,
                ..Default::default()
            },
        ))),
        BackendKind::Vulkan => Ok(Arc::new(crate::vulkan::VulkanBackend::new(config)?)),
    }
}
