use ash::vk;
use lumen_gfx::backend::GfxBackend;
use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::GfxBufferHandle;
use lumen_gfx::resources::GfxBufferDesc;

/// stage 1 写出的统计数据，布局与 shader 一致
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable, serde::Serialize)]
pub struct FrameStats {
    /// 仍然在追踪的像素数量
    pub active_pixels: u32,
    pub active_waves: u32,
}
impl FrameStats {
    /// 没有活跃像素即认为收敛
    #[inline]
    pub fn is_converged(&self) -> bool {
        self.active_pixels == 0
    }
}

/// 每个 frame slot 一个的 readback buffer
///
/// 帧开始时用 update 命令清零，stage 1 写入，fence 通过之后由 CPU 读取。
pub struct StatsReadback {
    buffer: GfxBufferHandle,
}
impl StatsReadback {
    pub const SIZE: vk::DeviceSize = size_of::<FrameStats>() as vk::DeviceSize;

    pub fn new(backend: &dyn GfxBackend, name: &str) -> GfxResult<Self> {
        let buffer = backend.create_buffer(&GfxBufferDesc::new_readback_buffer(Self::SIZE, name))?;
        Ok(Self { buffer })
    }

    #[inline]
    pub fn buffer(&self) -> GfxBufferHandle {
        self.buffer
    }

    /// 录制清零命令
    pub fn record_clear(&self, cmd: &mut GfxCommandBuffer) {
        cmd.cmd_update_buffer(self.buffer, 0, bytemuck::bytes_of(&FrameStats::default()));
    }

    /// 调用者保证写入这个 buffer 的提交已经完成
    pub fn read(&self, backend: &dyn GfxBackend) -> GfxResult<FrameStats> {
        let mut stats = FrameStats::default();
        backend.read_buffer(self.buffer, 0, bytemuck::bytes_of_mut(&mut stats))?;
        Ok(stats)
    }

    pub fn destroy(self, backend: &dyn GfxBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::headless::HeadlessBackend;

    #[test]
    fn test_clear_resets_stats() {
        let backend = HeadlessBackend::default();
        let readback = StatsReadback::new(&backend, "stats").unwrap();
        let allocator = backend.create_command_allocator("test").unwrap();

        // 模拟 stage 1 写入
        let mut cmd = GfxCommandBuffer::new("write");
        cmd.begin("write");
        let written = FrameStats {
            active_pixels: 17,
            active_waves: 3,
        };
        cmd.cmd_update_buffer(readback.buffer(), 0, bytemuck::bytes_of(&written));
        cmd.end();
        backend.submit(allocator, &cmd, 1).unwrap();
        assert_eq!(readback.read(&backend).unwrap(), written);

        let mut cmd = GfxCommandBuffer::new("clear");
        cmd.begin("clear");
        readback.record_clear(&mut cmd);
        cmd.end();
        backend.submit(allocator, &cmd, 2).unwrap();
        let stats = readback.read(&backend).unwrap();
        assert!(stats.is_converged());
    }
}
