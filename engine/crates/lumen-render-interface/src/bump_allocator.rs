use std::sync::Arc;

use ash::vk;
use lumen_gfx::accel::GfxScratchRegion;
use lumen_gfx::backend::GfxBackend;
use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::GfxBufferHandle;
use lumen_gfx::resources::GfxBufferDesc;

struct ScratchBlock {
    buffer: GfxBufferHandle,
    size: vk::DeviceSize,
    used: vk::DeviceSize,
}

/// acceleration structure 构建使用的 scratch 内存
///
/// 在大块 buffer 上做 bump 分配，不支持单独释放。
///
/// 每一次使用 scratch 的录制都由 `begin_use` / `end_use` 包围：
/// - `end_use` 记录这次录制提交时的 fence
/// - `begin_use` 时如果没有其他录制正在进行，且最后一次使用的 fence 已经通过，
///   所有 block 整体回绕到起点，block 本身保留下来给后续的构建复用
///
/// `reset()` 销毁所有 block，只在 GPU 空闲时调用。
pub struct ScratchAllocator {
    backend: Arc<dyn GfxBackend>,
    block_size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    blocks: Vec<ScratchBlock>,
    /// 当前分配所在的 block
    cursor: usize,
    /// 最后一次使用 scratch 的提交的 fence
    last_use_fence: u64,
    /// 已经 `begin_use` 但还没有 `end_use` 的录制数量
    open_uses: usize,
}

impl ScratchAllocator {
    pub fn new(backend: Arc<dyn GfxBackend>, block_size: vk::DeviceSize) -> Self {
        let alignment = backend.capabilities().scratch_alignment.max(1) as vk::DeviceSize;
        Self {
            backend,
            block_size,
            alignment,
            blocks: Vec::new(),
            cursor: 0,
            last_use_fence: 0,
            open_uses: 0,
        }
    }

    /// 开始一次使用 scratch 的录制，返回 block 是否被回绕
    ///
    /// `completed` 是 GPU 已经完成的 fence 值
    pub fn begin_use(&mut self, completed: u64) -> bool {
        let rewind = self.open_uses == 0 && self.last_use_fence <= completed && self.used_bytes() > 0;
        if rewind {
            log::debug!(
                "scratch rewound: {} bytes in {} blocks, last use fence {}",
                self.used_bytes(),
                self.blocks.len(),
                self.last_use_fence
            );
            for block in &mut self.blocks {
                block.used = 0;
            }
            self.cursor = 0;
        }
        self.open_uses += 1;
        rewind
    }

    /// 结束一次录制，`fence` 为 `None` 表示录制没有被提交
    pub fn end_use(&mut self, fence: Option<u64>) {
        self.open_uses = self.open_uses.saturating_sub(1);
        if let Some(fence) = fence {
            self.last_use_fence = self.last_use_fence.max(fence);
        }
    }

    /// 分配一段对齐的 scratch 区域，所有 block 都放不下时创建新的 block
    pub fn allocate(&mut self, size: vk::DeviceSize) -> GfxResult<GfxScratchRegion> {
        let alignment = self.alignment;
        while let Some(block) = self.blocks.get_mut(self.cursor) {
            let offset = block.used.next_multiple_of(alignment);
            if offset + size <= block.size {
                block.used = offset + size;
                return Ok(GfxScratchRegion {
                    buffer: block.buffer,
                    offset,
                    size,
                });
            }
            if self.cursor + 1 == self.blocks.len() {
                break;
            }
            self.cursor += 1;
        }

        let block_size = self.block_size.max(size.next_multiple_of(alignment));
        let buffer = self.backend.create_buffer(
            &GfxBufferDesc::new(
                block_size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                format!("scratch-block-{}", self.blocks.len()),
            )
            .with_alignment(alignment),
        )?;
        log::debug!("scratch block {} created, size: {}", self.blocks.len(), block_size);
        self.blocks.push(ScratchBlock {
            buffer,
            size: block_size,
            used: size,
        });
        self.cursor = self.blocks.len() - 1;
        Ok(GfxScratchRegion {
            buffer,
            offset: 0,
            size,
        })
    }

    /// 销毁所有 block
    pub fn reset(&mut self) {
        for block in self.blocks.drain(..) {
            self.backend.destroy_buffer(block.buffer);
        }
        self.cursor = 0;
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.blocks.iter().map(|b| b.used).sum()
    }

    #[inline]
    pub fn last_use_fence(&self) -> u64 {
        self.last_use_fence
    }
}

impl Drop for ScratchAllocator {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::headless::HeadlessBackend;

    #[test]
    fn test_regions_are_aligned_and_disjoint() {
        let backend = Arc::new(HeadlessBackend::default());
        let alignment = backend.capabilities().scratch_alignment as vk::DeviceSize;
        let mut scratch = ScratchAllocator::new(backend.clone(), 4096);

        let a = scratch.allocate(100).unwrap();
        let b = scratch.allocate(300).unwrap();
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(b.offset % alignment, 0);
        assert!(a.offset + a.size <= b.offset);
        assert_eq!(scratch.block_count(), 1);
    }

    #[test]
    fn test_oversized_request_gets_own_block() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut scratch = ScratchAllocator::new(backend.clone(), 1024);
        scratch.allocate(512).unwrap();
        let big = scratch.allocate(8192).unwrap();
        assert_eq!(big.offset, 0);
        assert_eq!(scratch.block_count(), 2);

        let before = backend.live_buffer_count();
        scratch.reset();
        assert_eq!(backend.live_buffer_count(), before - 2);
        assert_eq!(scratch.used_bytes(), 0);
    }

    #[test]
    fn test_rewind_waits_for_last_use() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut scratch = ScratchAllocator::new(backend.clone(), 1024);

        assert!(!scratch.begin_use(0));
        scratch.allocate(512).unwrap();
        scratch.allocate(900).unwrap();
        scratch.end_use(Some(3));
        assert_eq!(scratch.block_count(), 2);

        // fence 3 还没有通过
        assert!(!scratch.begin_use(2));
        scratch.end_use(None);
        assert_eq!(scratch.used_bytes(), 512 + 900);

        assert!(scratch.begin_use(3));
        let first = scratch.allocate(512).unwrap();
        let second = scratch.allocate(900).unwrap();
        scratch.end_use(Some(4));
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 0);
        assert_ne!(first.buffer, second.buffer);
        // block 被复用，没有新建
        assert_eq!(scratch.block_count(), 2);
        assert_eq!(scratch.used_bytes(), 512 + 900);
    }

    #[test]
    fn test_no_rewind_while_another_recording_is_open() {
        let backend = Arc::new(HeadlessBackend::default());
        let mut scratch = ScratchAllocator::new(backend.clone(), 4096);

        scratch.begin_use(0);
        let held = scratch.allocate(256).unwrap();
        // 另一个线程开始录制，第一个录制还没有提交
        assert!(!scratch.begin_use(u64::MAX));
        let other = scratch.allocate(256).unwrap();
        assert!(held.offset + held.size <= other.offset);
        scratch.end_use(Some(1));
        scratch.end_use(Some(2));

        assert!(scratch.begin_use(2));
        scratch.end_use(None);
        assert_eq!(scratch.last_use_fence(), 2);
    }
}
