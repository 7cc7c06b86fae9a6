use std::collections::VecDeque;

use lumen_gfx::backend::GfxBackend;
use lumen_gfx::handles::GfxResource;

/// 在 GPU 上可能仍被引用的资源
///
/// 每个资源记录最后一个可能引用它的提交的 fence 值，
/// 当 `completed_fence_value()` 越过这个值之后才真正销毁。
#[derive(Default)]
pub struct DeferredDestroyQueue {
    pending: VecDeque<(u64, GfxResource)>,
}

impl DeferredDestroyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: impl Into<GfxResource>, fence_value: u64) {
        self.pending.push_back((fence_value, resource.into()));
    }

    /// 销毁所有已经安全的资源，返回销毁的数量
    pub fn collect(&mut self, backend: &dyn GfxBackend) -> usize {
        let completed = backend.completed_fence_value();
        let before = self.pending.len();
        self.pending.retain(|(fence_value, resource)| {
            if *fence_value <= completed {
                Self::destroy(backend, *resource);
                false
            } else {
                true
            }
        });
        before - self.pending.len()
    }

    /// 调用者保证 GPU 已经空闲
    pub fn flush(&mut self, backend: &dyn GfxBackend) {
        for (_, resource) in self.pending.drain(..) {
            Self::destroy(backend, resource);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn destroy(backend: &dyn GfxBackend, resource: GfxResource) {
        match resource {
            GfxResource::Buffer(buffer) => backend.destroy_buffer(buffer),
            GfxResource::Image(image) => backend.destroy_image(image),
            GfxResource::Accel(accel) => backend.destroy_accel(accel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};
    use lumen_gfx::resources::GfxBufferDesc;

    #[test]
    fn test_destroy_waits_for_fence() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        });
        let allocator = backend.create_command_allocator("test").unwrap();
        let mut cmd = GfxCommandBuffer::new("frame");
        cmd.begin("frame");
        cmd.end();
        backend.submit(allocator, &cmd, 1).unwrap();

        let buffer = backend
            .create_buffer(&GfxBufferDesc::new(64, ash::vk::BufferUsageFlags::STORAGE_BUFFER, "old"))
            .unwrap();
        let mut queue = DeferredDestroyQueue::new();
        queue.push(buffer, 1);

        assert_eq!(queue.collect(&backend), 0);
        assert_eq!(backend.live_buffer_count(), 1);

        backend.complete_up_to(1);
        assert_eq!(queue.collect(&backend), 1);
        assert_eq!(backend.live_buffer_count(), 0);
        assert!(queue.is_empty());
    }
}
