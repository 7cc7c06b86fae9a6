//! barrier 推断
//!
//! 根据资源的前后状态生成 `GfxImageBarrier` 和 `GfxBufferBarrier`。

use ash::vk;
use lumen_gfx::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use lumen_gfx::handles::{GfxBufferHandle, GfxImageHandle};

use crate::resource_handle::{RgBufferHandle, RgImageHandle};
use crate::resource_state::{RgBufferState, RgImageState};

#[derive(Clone, Debug)]
pub struct RgImageBarrierDesc {
    pub handle: RgImageHandle,
    pub src_state: RgImageState,
    pub dst_state: RgImageState,
    pub aspect: vk::ImageAspectFlags,
}

impl RgImageBarrierDesc {
    pub fn new(handle: RgImageHandle, src_state: RgImageState, dst_state: RgImageState) -> Self {
        Self {
            handle,
            src_state,
            dst_state,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    #[inline]
    pub fn with_aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    /// layout 改变或者任意一侧有写操作时需要 barrier，只读到只读可以跳过
    pub fn needs_barrier(&self) -> bool {
        self.src_state.layout != self.dst_state.layout || self.src_state.is_write() || self.dst_state.is_write()
    }

    pub fn to_gfx_barrier(&self, image: GfxImageHandle) -> GfxImageBarrier {
        GfxImageBarrier::new()
            .image(image)
            .layout_transfer(self.src_state.layout, self.dst_state.layout)
            .src_mask(self.src_state.stage, self.src_state.src_access())
            .dst_mask(self.dst_state.stage, self.dst_state.access)
            .image_aspect_flag(self.aspect)
    }
}

#[derive(Clone, Debug)]
pub struct RgBufferBarrierDesc {
    pub handle: RgBufferHandle,
    pub src_state: RgBufferState,
    pub dst_state: RgBufferState,
}

impl RgBufferBarrierDesc {
    pub fn new(handle: RgBufferHandle, src_state: RgBufferState, dst_state: RgBufferState) -> Self {
        Self {
            handle,
            src_state,
            dst_state,
        }
    }

    #[inline]
    pub fn needs_barrier(&self) -> bool {
        self.src_state.is_write() || self.dst_state.is_write()
    }

    pub fn to_gfx_barrier(&self, buffer: GfxBufferHandle) -> GfxBufferBarrier {
        GfxBufferBarrier::new()
            .buffer(buffer, 0, vk::WHOLE_SIZE)
            .src_mask(self.src_state.stage, self.src_state.src_access())
            .dst_mask(self.dst_state.stage, self.dst_state.access)
    }
}

/// 一个 pass 执行前需要的 barrier 集合
#[derive(Clone, Debug, Default)]
pub struct PassBarriers {
    pub image_barriers: Vec<RgImageBarrierDesc>,
    pub buffer_barriers: Vec<RgBufferBarrierDesc>,
}

impl PassBarriers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 不需要的 barrier 会被丢弃
    pub fn add_image_barrier(&mut self, barrier: RgImageBarrierDesc) {
        if barrier.needs_barrier() {
            self.image_barriers.push(barrier);
        }
    }

    pub fn add_buffer_barrier(&mut self, barrier: RgBufferBarrierDesc) {
        if barrier.needs_barrier() {
            self.buffer_barriers.push(barrier);
        }
    }

    #[inline]
    pub fn has_barriers(&self) -> bool {
        !self.image_barriers.is_empty() || !self.buffer_barriers.is_empty()
    }

    #[inline]
    pub fn image_barrier_count(&self) -> usize {
        self.image_barriers.len()
    }

    #[inline]
    pub fn buffer_barrier_count(&self) -> usize {
        self.buffer_barriers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_barrier_layout_change() {
        let barrier =
            RgImageBarrierDesc::new(RgImageHandle::default(), RgImageState::UNDEFINED, RgImageState::STORAGE_READ_COMPUTE);
        assert!(barrier.needs_barrier());
    }

    #[test]
    fn test_image_barrier_read_to_read() {
        let barrier = RgImageBarrierDesc::new(
            RgImageHandle::default(),
            RgImageState::STORAGE_READ_RAY_TRACING,
            RgImageState::STORAGE_READ_COMPUTE,
        );
        assert!(!barrier.needs_barrier());
    }

    #[test]
    fn test_image_barrier_write_to_read() {
        let barrier = RgImageBarrierDesc::new(
            RgImageHandle::default(),
            RgImageState::STORAGE_WRITE_RAY_TRACING,
            RgImageState::STORAGE_READ_COMPUTE,
        );
        assert!(barrier.needs_barrier());

        let gfx = barrier.to_gfx_barrier(GfxImageHandle::default());
        assert_eq!(gfx.layouts(), (vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL));
        assert_eq!(gfx.dst_access(), vk::AccessFlags2::SHADER_STORAGE_READ);
    }

    #[test]
    fn test_pass_barriers_drop_redundant() {
        let mut barriers = PassBarriers::new();
        barriers.add_buffer_barrier(RgBufferBarrierDesc::new(
            RgBufferHandle::default(),
            RgBufferState::STORAGE_READ_COMPUTE,
            RgBufferState::STORAGE_READ_COMPUTE,
        ));
        assert!(!barriers.has_barriers());

        barriers.add_buffer_barrier(RgBufferBarrierDesc::new(
            RgBufferHandle::default(),
            RgBufferState::TRANSFER_DST,
            RgBufferState::STORAGE_READ_COMPUTE,
        ));
        assert_eq!(barriers.buffer_barrier_count(), 1);
    }
}
