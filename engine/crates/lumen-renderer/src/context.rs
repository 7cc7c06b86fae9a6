use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use lumen_gfx::backend::GfxBackend;
use lumen_gfx::error::GfxResult;
use lumen_render_interface::bump_allocator::ScratchAllocator;
use lumen_render_interface::command_stream_pool::CommandStreamPool;
use lumen_render_interface::deferred_destroy::DeferredDestroyQueue;
use lumen_render_interface::resource_table::ResourceTable;

/// 渲染器的容量配置
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub resource_table_capacity: u32,
    /// scratch bump 分配器每个 block 的大小
    pub scratch_block_size: vk::DeviceSize,
    /// 加载线程和渲染线程同时录制，至少为 2
    pub stream_pool_capacity: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            resource_table_capacity: 4096,
            scratch_block_size: 16 * 1024 * 1024,
            stream_pool_capacity: 3,
        }
    }
}

/// 等待 scratch 上一次使用完成时的超时
const SCRATCH_WAIT_TIMEOUT_NS: u64 = 10_000_000_000;

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 渲染器共享的 GPU 上下文
///
/// 在渲染线程和加载线程之间通过 `Arc` 共享，内部的可变状态各自由一把锁保护。
/// 只创建一次，`wait_idle` 之后随最后一个引用一起销毁。
pub struct RendererContext {
    backend: Arc<dyn GfxBackend>,
    stream_pool: Arc<CommandStreamPool>,
    resource_table: Mutex<ResourceTable>,
    scratch: Mutex<ScratchAllocator>,
    deferred_destroy: Mutex<DeferredDestroyQueue>,
}

// new & init
impl RendererContext {
    pub fn new(backend: Arc<dyn GfxBackend>, config: &RendererConfig) -> Self {
        let _span = tracy_client::span!("RendererContext::new");
        log::info!(
            "renderer context on {}: ray tracing {}, stream pool capacity {}",
            backend.capabilities().device_name,
            backend.capabilities().ray_tracing,
            config.stream_pool_capacity
        );
        Self {
            stream_pool: Arc::new(CommandStreamPool::new(backend.clone(), config.stream_pool_capacity)),
            resource_table: Mutex::new(ResourceTable::new(backend.clone(), config.resource_table_capacity)),
            scratch: Mutex::new(ScratchAllocator::new(backend.clone(), config.scratch_block_size)),
            deferred_destroy: Mutex::new(DeferredDestroyQueue::new()),
            backend,
        }
    }
}

// getters
impl RendererContext {
    #[inline]
    pub fn backend(&self) -> &dyn GfxBackend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn backend_arc(&self) -> &Arc<dyn GfxBackend> {
        &self.backend
    }

    #[inline]
    pub fn stream_pool(&self) -> &Arc<CommandStreamPool> {
        &self.stream_pool
    }

    #[inline]
    pub fn resource_table(&self) -> MutexGuard<'_, ResourceTable> {
        lock(&self.resource_table)
    }

    #[inline]
    pub fn scratch(&self) -> MutexGuard<'_, ScratchAllocator> {
        lock(&self.scratch)
    }

    #[inline]
    pub fn deferred_destroy(&self) -> MutexGuard<'_, DeferredDestroyQueue> {
        lock(&self.deferred_destroy)
    }
}

// scratch
impl RendererContext {
    /// 开始一次使用 scratch 的录制，上一次使用已经完成时 scratch 整体回绕
    pub fn begin_scratch_use(&self) -> ScratchUse<'_> {
        let completed = self.backend.completed_fence_value();
        self.scratch().begin_use(completed);
        ScratchUse { ctx: self, fence: None }
    }

    /// 等待最后一次使用 scratch 的提交完成，之后的 `begin_scratch_use` 一定会回绕
    pub fn wait_scratch_idle(&self) -> GfxResult<()> {
        let fence = self.scratch().last_use_fence();
        if fence > self.backend.completed_fence_value() {
            log::debug!("waiting for scratch fence {}", fence);
            self.backend.wait_fence_value(fence, SCRATCH_WAIT_TIMEOUT_NS)?;
        }
        Ok(())
    }
}

/// 一次录制对 scratch 的使用，drop 时结束
///
/// 提交成功之后调用 `submitted`，否则这次使用不会推迟 scratch 的回绕
pub struct ScratchUse<'a> {
    ctx: &'a RendererContext,
    fence: Option<u64>,
}

impl ScratchUse<'_> {
    #[inline]
    pub fn submitted(&mut self, fence: u64) {
        self.fence = Some(fence);
    }
}

impl Drop for ScratchUse<'_> {
    fn drop(&mut self) {
        self.ctx.scratch().end_use(self.fence);
    }
}

// sync
impl RendererContext {
    /// 销毁 fence 已经通过的资源
    pub fn collect_garbage(&self) -> usize {
        let destroyed = self.deferred_destroy().collect(self.backend());
        if destroyed > 0 {
            log::debug!("deferred destroy: {} resources released", destroyed);
        }
        destroyed
    }

    /// 等待 GPU 空闲，回收所有 stream 和延迟销毁的资源
    pub fn wait_idle(&self) -> GfxResult<()> {
        let _span = tracy_client::span!("RendererContext::wait_idle");
        self.stream_pool.wait_idle()?;
        self.deferred_destroy().flush(self.backend());
        Ok(())
    }
}

impl Drop for RendererContext {
    fn drop(&mut self) {
        log::info!("Dropping RendererContext.");
        if let Err(e) = self.wait_idle() {
            log::error!("wait idle failed on context teardown: {}", e);
        }
        self.scratch().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};
    use lumen_gfx::resources::GfxBufferDesc;

    #[test]
    fn test_wait_idle_flushes_deferred_destroy() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        }));
        let ctx = RendererContext::new(backend.clone(), &RendererConfig::default());

        let mut stream = ctx.stream_pool().acquire().unwrap();
        stream.begin("frame");
        stream.end();
        let fence = ctx.stream_pool().submit(stream).unwrap();

        let buffer = backend
            .create_buffer(&GfxBufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER, "old"))
            .unwrap();
        ctx.deferred_destroy().push(buffer, fence);
        assert_eq!(ctx.collect_garbage(), 0);

        ctx.wait_idle().unwrap();
        assert!(ctx.deferred_destroy().is_empty());
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_scratch_use_records_submit_fence() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        }));
        let ctx = RendererContext::new(backend.clone(), &RendererConfig::default());

        {
            let mut scratch_use = ctx.begin_scratch_use();
            ctx.scratch().allocate(256).unwrap();
            let mut stream = ctx.stream_pool().acquire().unwrap();
            stream.begin("build");
            stream.end();
            scratch_use.submitted(ctx.stream_pool().submit(stream).unwrap());
        }
        assert_eq!(ctx.scratch().last_use_fence(), 1);

        // fence 没有通过，scratch 继续增长
        drop(ctx.begin_scratch_use());
        assert_eq!(ctx.scratch().used_bytes(), 256);

        ctx.wait_scratch_idle().unwrap();
        assert_eq!(backend.completed_fence_value(), 1);
        drop(ctx.begin_scratch_use());
        assert_eq!(ctx.scratch().used_bytes(), 0);
        assert_eq!(ctx.scratch().block_count(), 1);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RendererConfig = toml::from_str("stream_pool_capacity = 5").unwrap();
        assert_eq!(config.stream_pool_capacity, 5);
        assert_eq!(config.resource_table_capacity, 4096);
    }
}
