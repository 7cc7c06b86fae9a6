use ash::vk;

use crate::handles::{GfxBufferHandle, GfxImageHandle};

/// barrier 使用的 src 和 dst 访问 mask
///
/// 单独使用时表示一个全局的 memory barrier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxBarrierMask {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl GfxBarrierMask {
    /// 加速结构构建完成之后，后续的构建或者光追读取
    pub const ACCEL_BUILD_TO_READ: Self = Self {
        src_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw()
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        src_access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags2::SHADER_READ.as_raw(),
        ),
    };

    /// 数据上传完成之后，作为加速结构构建的输入
    pub const TRANSFER_TO_ACCEL_BUILD: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags2::SHADER_READ.as_raw(),
        ),
    };

    /// 数据上传完成之后，被 shader 读取
    pub const TRANSFER_TO_SHADER_READ: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw() | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_access: vk::AccessFlags2::SHADER_READ,
    };

    #[inline]
    pub fn to_vk(&self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
    }
}

/// 便捷创建 image memory barrier 的结构体
///
/// 引用的是后端 arena 中的图像句柄，由后端在回放时解析为 `vk::Image`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxImageBarrier {
    image: GfxImageHandle,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
    aspect: vk::ImageAspectFlags,
}

impl Default for GfxImageBarrier {
    fn default() -> Self {
        Self {
            image: GfxImageHandle::default(),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_stage: vk::PipelineStageFlags2::NONE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::NONE,
            dst_access: vk::AccessFlags2::NONE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

impl GfxImageBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder
    #[inline]
    pub fn image(mut self, image: GfxImageHandle) -> Self {
        self.image = image;
        self
    }

    /// builder
    #[inline]
    pub fn layout_transfer(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.old_layout = old_layout;
        self.new_layout = new_layout;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.src_stage = src_stage_mask;
        self.src_access = src_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.dst_stage = dst_stage_mask;
        self.dst_access = dst_access_mask;
        self
    }

    /// builder
    /// layer 和 miplevel 都使用默认值
    #[inline]
    pub fn image_aspect_flag(mut self, aspect_mask: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect_mask;
        self
    }
}
// getters
impl GfxImageBarrier {
    #[inline]
    pub fn image_handle(&self) -> GfxImageHandle {
        self.image
    }

    #[inline]
    pub fn layouts(&self) -> (vk::ImageLayout, vk::ImageLayout) {
        (self.old_layout, self.new_layout)
    }

    #[inline]
    pub fn dst_access(&self) -> vk::AccessFlags2 {
        self.dst_access
    }

    /// 转换为 vk 结构体，`image` 由后端解析
    pub fn to_vk(&self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .image(image)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GfxBufferBarrier {
    buffer: GfxBufferHandle,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    mask: GfxBarrierMask,
}

impl Default for GfxBufferBarrier {
    fn default() -> Self {
        Self {
            buffer: GfxBufferHandle::default(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            mask: GfxBarrierMask {
                src_stage: vk::PipelineStageFlags2::NONE,
                dst_stage: vk::PipelineStageFlags2::NONE,
                src_access: vk::AccessFlags2::NONE,
                dst_access: vk::AccessFlags2::NONE,
            },
        }
    }
}

impl GfxBufferBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.mask.src_stage = src_stage_mask;
        self.mask.src_access = src_access_mask;
        self
    }

    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.mask.dst_stage = dst_stage_mask;
        self.mask.dst_access = dst_access_mask;
        self
    }

    #[inline]
    pub fn mask(mut self, mask: GfxBarrierMask) -> Self {
        self.mask = mask;
        self
    }

    #[inline]
    pub fn buffer(mut self, buffer: GfxBufferHandle, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.buffer = buffer;
        self.offset = offset;
        self.size = size;
        self
    }

    #[inline]
    pub fn buffer_handle(&self) -> GfxBufferHandle {
        self.buffer
    }

    pub fn to_vk(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .buffer(buffer)
            .offset(self.offset)
            .size(self.size)
            .src_stage_mask(self.mask.src_stage)
            .src_access_mask(self.mask.src_access)
            .dst_stage_mask(self.mask.dst_stage)
            .dst_access_mask(self.mask.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
    }
}
