use ash::vk;

pub type GfxResult<T> = Result<T, GfxError>;

/// GPU 层的错误分类
///
/// 初始化阶段的错误（缺少特性、分配失败、prebuild 查询失败）都是致命的，
/// 由调用方直接向上传递并终止进程。
#[derive(thiserror::Error, Debug)]
pub enum GfxError {
    #[error("missing required gpu feature: {0}")]
    MissingFeature(String),

    #[error("gpu allocation failed: {0}")]
    Allocation(String),

    #[error("acceleration structure prebuild query rejected: {0}")]
    PrebuildQuery(String),

    #[error("queue submission failed: {0}")]
    Submit(String),

    #[error("invalid {kind} handle")]
    InvalidHandle { kind: &'static str },

    #[error("resource table is full (capacity {capacity})")]
    DescriptorTableFull { capacity: u32 },

    #[error("timed out waiting for fence value {value}")]
    Timeout { value: u64 },

    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("backend error: {0}")]
    Backend(String),
}

impl GfxError {
    pub fn invalid_buffer() -> Self {
        Self::InvalidHandle { kind: "buffer" }
    }

    pub fn invalid_image() -> Self {
        Self::InvalidHandle { kind: "image" }
    }

    pub fn invalid_accel() -> Self {
        Self::InvalidHandle { kind: "acceleration structure" }
    }

    pub fn invalid_kernel() -> Self {
        Self::InvalidHandle { kind: "kernel" }
    }

    pub fn invalid_allocator() -> Self {
        Self::InvalidHandle { kind: "command allocator" }
    }
}
