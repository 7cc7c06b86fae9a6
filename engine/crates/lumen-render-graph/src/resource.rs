//! graph 的资源注册表
//!
//! graph 只引用外部导入的资源，物理资源的生命周期由 frame resource set 等外部对象管理。

use ash::vk;
use slotmap::SlotMap;

use lumen_gfx::handles::{GfxBufferHandle, GfxImageHandle};
use lumen_gfx::resources::GfxImageDesc;

use crate::resource_handle::{RgBufferHandle, RgImageHandle};
use crate::resource_state::{RgBufferState, RgImageState};

#[derive(Clone, Debug)]
pub struct RgImageResource {
    pub name: String,
    pub physical: GfxImageHandle,
    pub format: vk::Format,
    /// 导入时的状态，编译时从这里开始推断 barrier
    pub initial_state: RgImageState,
    /// 执行完成后要求的状态
    pub export_state: Option<RgImageState>,
}

impl RgImageResource {
    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        GfxImageDesc::infer_aspect(self.format)
    }
}

#[derive(Clone, Debug)]
pub struct RgBufferResource {
    pub name: String,
    pub physical: GfxBufferHandle,
    pub initial_state: RgBufferState,
    pub export_state: Option<RgBufferState>,
}

#[derive(Default)]
pub struct RgResourceRegistry {
    images: SlotMap<RgImageHandle, RgImageResource>,
    buffers: SlotMap<RgBufferHandle, RgBufferResource>,
}

impl RgResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一个物理资源重复导入时返回已有的句柄
    pub fn register_image(&mut self, resource: RgImageResource) -> RgImageHandle {
        if let Some((handle, _)) = self.images.iter().find(|(_, r)| r.physical == resource.physical) {
            return handle;
        }
        self.images.insert(resource)
    }

    pub fn register_buffer(&mut self, resource: RgBufferResource) -> RgBufferHandle {
        if let Some((handle, _)) = self.buffers.iter().find(|(_, r)| r.physical == resource.physical) {
            return handle;
        }
        self.buffers.insert(resource)
    }

    #[inline]
    pub fn get_image(&self, handle: RgImageHandle) -> Option<&RgImageResource> {
        self.images.get(handle)
    }

    #[inline]
    pub fn get_image_mut(&mut self, handle: RgImageHandle) -> Option<&mut RgImageResource> {
        self.images.get_mut(handle)
    }

    #[inline]
    pub fn get_buffer(&self, handle: RgBufferHandle) -> Option<&RgBufferResource> {
        self.buffers.get(handle)
    }

    #[inline]
    pub fn get_buffer_mut(&mut self, handle: RgBufferHandle) -> Option<&mut RgBufferResource> {
        self.buffers.get_mut(handle)
    }

    pub fn iter_images(&self) -> impl Iterator<Item = (RgImageHandle, &RgImageResource)> {
        self.images.iter()
    }

    pub fn iter_buffers(&self) -> impl Iterator<Item = (RgBufferHandle, &RgBufferResource)> {
        self.buffers.iter()
    }

    #[inline]
    pub fn image_name(&self, handle: RgImageHandle) -> &str {
        self.images.get(handle).map_or("<unknown>", |r| r.name.as_str())
    }

    #[inline]
    pub fn buffer_name(&self, handle: RgBufferHandle) -> &str {
        self.buffers.get(handle).map_or("<unknown>", |r| r.name.as_str())
    }
}
