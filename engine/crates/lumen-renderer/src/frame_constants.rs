//! 所有 pass 共享的常量块
//!
//! push constant 的布局：
//!
//! ```text
//! 0                   112                 192         256
//! ┌───────────────────┬───────────────────┬───────────┐
//! │ FrameConstants    │ pre-dispatch hook │ PassSlots │
//! └───────────────────┴───────────────────┴───────────┘
//! ```

use ash::vk;

use lumen_gfx::kernel::PUSH_CONSTANT_SIZE;
use lumen_scene::camera::CameraBasis;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        const CONTINUOUS = 1 << 0;
        const DENOISE = 1 << 1;
        /// 本帧可以读取上一帧的 history
        const HISTORY_VALID = 1 << 2;
        const UPSCALE = 1 << 3;
        /// stage 1 使用 compute 模拟的遍历
        const SOFTWARE_TRAVERSAL = 1 << 4;
        const LIMIT_REACHED = 1 << 5;
        /// 场景没有就绪，post-process 输出 loading 画面
        const LOADING = 1 << 6;
    }
}

/// 每帧的常量，布局与 shader 一致
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameConstants {
    pub resolution: [u32; 2],
    pub frame_index: u32,
    pub flags: u32,

    pub camera_origin: [f32; 4],
    pub camera_u: [f32; 4],
    pub camera_v: [f32; 4],
    pub camera_w: [f32; 4],
    /// x: 光圈半径，y: 对焦距离
    pub lens: [f32; 4],

    pub effort: f32,
    pub blend_weight: f32,
    pub sample_count: u32,
    pub channel: u32,
}

impl FrameConstants {
    pub const SIZE: u32 = size_of::<Self>() as u32;

    pub fn new(extent: vk::Extent2D, frame_index: u64, flags: FrameFlags) -> Self {
        Self {
            resolution: [extent.width, extent.height],
            frame_index: frame_index as u32,
            flags: flags.bits(),
            ..Default::default()
        }
    }

    pub fn with_camera(mut self, basis: &CameraBasis, lens_radius: f32, focal_distance: f32) -> Self {
        self.camera_origin = basis.origin.extend(1.0).to_array();
        self.camera_u = basis.u.extend(0.0).to_array();
        self.camera_v = basis.v.extend(0.0).to_array();
        self.camera_w = basis.w.extend(0.0).to_array();
        self.lens = [lens_radius, focal_distance, 0.0, 0.0];
        self
    }

    #[inline]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.resolution[0],
            height: self.resolution[1],
        }
    }
}

/// pass 自己的 resource table slot，放在 push constant 的末尾
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PassSlots {
    pub slots: [u32; 16],
}

impl PassSlots {
    pub const OFFSET: u32 = PUSH_CONSTANT_SIZE - size_of::<Self>() as u32;

    pub fn new(slots: &[u32]) -> Self {
        let mut result = Self::default();
        for (dst, src) in result.slots.iter_mut().zip(slots) {
            *dst = *src;
        }
        result
    }
}

/// pre-dispatch hook 的 push constant 偏移
pub const HOOK_PUSH_OFFSET: u32 = FrameConstants::SIZE;

/// 每 8x8 像素一个 group
pub fn group_count(extent: vk::Extent2D) -> glam::UVec3 {
    glam::uvec3(extent.width.div_ceil(8), extent.height.div_ceil(8), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constant_layout() {
        assert_eq!(FrameConstants::SIZE, 112);
        assert_eq!(PassSlots::OFFSET, 192);
        assert!(HOOK_PUSH_OFFSET < PassSlots::OFFSET);
    }

    #[test]
    fn test_group_count_rounds_up() {
        assert_eq!(group_count(vk::Extent2D { width: 1920, height: 1080 }), glam::uvec3(240, 135, 1));
        assert_eq!(group_count(vk::Extent2D { width: 9, height: 1 }), glam::uvec3(2, 1, 1));
    }

    #[test]
    fn test_flags_round_trip_through_constants() {
        let flags = FrameFlags::CONTINUOUS | FrameFlags::HISTORY_VALID;
        let constants = FrameConstants::new(vk::Extent2D { width: 4, height: 2 }, 7, flags);
        assert_eq!(constants.flags(), flags);
        assert_eq!(constants.extent(), vk::Extent2D { width: 4, height: 2 });
    }
}
