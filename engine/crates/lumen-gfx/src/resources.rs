use ash::vk;

/// buffer 所在的内存位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxMemoryLocation {
    /// 只能由 GPU 访问，优先 device local
    GpuOnly,
    /// CPU 写入，GPU 读取（stage buffer、instance buffer 等）
    CpuToGpu,
    /// GPU 写入，CPU 读取（readback）
    GpuToCpu,
}

impl GfxMemoryLocation {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// buffer 的创建参数
#[derive(Clone, Debug)]
pub struct GfxBufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: GfxMemoryLocation,
    /// 当 buffer 处于一个大的 memory block 中时，指定起始地址的对齐
    pub alignment: Option<vk::DeviceSize>,
    pub name: String,
}

// new & builder
impl GfxBufferDesc {
    #[inline]
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags, name: impl Into<String>) -> Self {
        Self {
            size,
            usage,
            location: GfxMemoryLocation::GpuOnly,
            alignment: None,
            name: name.into(),
        }
    }

    #[inline]
    pub fn new_stage_buffer(size: vk::DeviceSize, name: impl Into<String>) -> Self {
        Self::new(size, vk::BufferUsageFlags::TRANSFER_SRC, name).with_location(GfxMemoryLocation::CpuToGpu)
    }

    #[inline]
    pub fn new_readback_buffer(size: vk::DeviceSize, name: impl Into<String>) -> Self {
        Self::new(size, vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER, name)
            .with_location(GfxMemoryLocation::GpuToCpu)
    }

    #[inline]
    pub fn with_location(mut self, location: GfxMemoryLocation) -> Self {
        self.location = location;
        self
    }

    #[inline]
    pub fn with_alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

/// 2D 图像的创建参数
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub name: String,
}

impl GfxImageDesc {
    #[inline]
    pub fn new_2d(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: impl Into<String>,
    ) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format,
            usage,
            name: name.into(),
        }
    }

    /// 计算 pass 使用的 storage image，同时允许被拷贝
    #[inline]
    pub fn new_storage(extent: vk::Extent2D, format: vk::Format, name: impl Into<String>) -> Self {
        Self::new_2d(
            extent.width,
            extent.height,
            format,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            name,
        )
    }

    /// 推断 barrier 使用的 aspect
    pub fn infer_aspect(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }

            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,

            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }

            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

/// 通过 resource table 暴露给 shader 的资源视图
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxDescriptor {
    StorageImage(crate::handles::GfxImageHandle),
    StorageBuffer(crate::handles::GfxBufferHandle),
    AccelerationStructure(crate::handles::GfxAccelHandle),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_buffer_is_host_visible() {
        let desc = GfxBufferDesc::new_stage_buffer(256, "stage");
        assert!(desc.location.is_host_visible());
        assert!(desc.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(!GfxMemoryLocation::GpuOnly.is_host_visible());
    }

    #[test]
    fn test_infer_aspect() {
        assert_eq!(GfxImageDesc::infer_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(GfxImageDesc::infer_aspect(vk::Format::R16G16B16A16_SFLOAT), vk::ImageAspectFlags::COLOR);
    }
}
