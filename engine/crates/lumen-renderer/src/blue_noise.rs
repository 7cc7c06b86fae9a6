use ash::vk;

use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::GfxBufferHandle;
use lumen_gfx::resources::{GfxBufferDesc, GfxMemoryLocation};
use lumen_render_interface::resource_table::ResourceSlot;

use crate::context::RendererContext;

/// stage 1 采样用的低差异序列，平铺到屏幕上
///
/// 使用 R2 序列，相邻像素的偏移在 [0, 1)² 上分布均匀
pub struct BlueNoise {
    buffer: GfxBufferHandle,
    slot: ResourceSlot,
}

impl BlueNoise {
    /// 平铺的边长
    pub const TILE: u32 = 64;

    pub fn new(ctx: &RendererContext) -> GfxResult<Self> {
        let samples = Self::sequence((Self::TILE * Self::TILE) as usize);
        let bytes: &[u8] = bytemuck::cast_slice(&samples);

        let backend = ctx.backend();
        let buffer = backend.create_buffer(
            &GfxBufferDesc::new(bytes.len() as vk::DeviceSize, vk::BufferUsageFlags::STORAGE_BUFFER, "blue-noise")
                .with_location(GfxMemoryLocation::CpuToGpu),
        )?;
        let slot = backend
            .write_buffer(buffer, 0, bytes)
            .and_then(|()| ctx.resource_table().register_buffer(buffer));
        match slot {
            Ok(slot) => Ok(Self { buffer, slot }),
            Err(e) => {
                backend.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// R2 序列的前 `count` 个点
    pub fn sequence(count: usize) -> Vec<[f32; 2]> {
        // plastic number
        const G: f64 = 1.324_717_957_244_746;
        let (a1, a2) = (1.0 / G, 1.0 / (G * G));
        (0..count)
            .map(|n| {
                let n = n as f64;
                [(0.5 + a1 * n).fract() as f32, (0.5 + a2 * n).fract() as f32]
            })
            .collect()
    }

    #[inline]
    pub fn buffer(&self) -> GfxBufferHandle {
        self.buffer
    }

    #[inline]
    pub fn slot(&self) -> ResourceSlot {
        self.slot
    }

    pub fn retire(self, ctx: &RendererContext) {
        let last_reader = ctx.stream_pool().last_submitted_value();
        ctx.deferred_destroy().push(self.buffer, last_reader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_covers_unit_square() {
        let samples = BlueNoise::sequence(1024);
        assert!(samples.iter().flatten().all(|v| (0.0..1.0).contains(v)));

        // 4x4 的每个格子里都有点
        let mut cells = [0u32; 16];
        for [x, y] in &samples {
            cells[(y * 4.0) as usize * 4 + (x * 4.0) as usize] += 1;
        }
        assert!(cells.iter().all(|&count| count > 32));
    }
}
