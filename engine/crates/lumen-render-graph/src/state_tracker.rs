use std::collections::HashMap;

use lumen_gfx::handles::{GfxBufferHandle, GfxImageHandle};

use crate::resource_state::{RgBufferState, RgImageState};

/// 导入资源的跨帧状态
///
/// 每一帧的 graph 从这里读取导入资源的初始状态，执行之后写回最终状态，
/// 因此一帧中第一次使用资源时会从上一帧留下的状态开始转换。
#[derive(Default, Debug)]
pub struct ResourceStateTracker {
    images: HashMap<GfxImageHandle, RgImageState>,
    buffers: HashMap<GfxBufferHandle, RgBufferState>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 没有记录的资源处于 `UNDEFINED`
    #[inline]
    pub fn image_state(&self, image: GfxImageHandle) -> RgImageState {
        self.images.get(&image).copied().unwrap_or_default()
    }

    #[inline]
    pub fn buffer_state(&self, buffer: GfxBufferHandle) -> RgBufferState {
        self.buffers.get(&buffer).copied().unwrap_or_default()
    }

    #[inline]
    pub fn set_image_state(&mut self, image: GfxImageHandle, state: RgImageState) {
        self.images.insert(image, state);
    }

    #[inline]
    pub fn set_buffer_state(&mut self, buffer: GfxBufferHandle, state: RgBufferState) {
        self.buffers.insert(buffer, state);
    }

    /// 资源被销毁时调用
    pub fn forget_image(&mut self, image: GfxImageHandle) {
        self.images.remove(&image);
    }

    pub fn forget_buffer(&mut self, buffer: GfxBufferHandle) {
        self.buffers.remove(&buffer);
    }

    #[inline]
    pub fn tracked_count(&self) -> usize {
        self.images.len() + self.buffers.len()
    }
}
