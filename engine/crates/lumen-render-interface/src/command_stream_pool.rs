use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use lumen_gfx::backend::GfxBackend;
use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
use lumen_gfx::error::GfxResult;
use lumen_gfx::handles::GfxCommandAllocatorHandle;

/// 等待最旧的 stream 时使用的超时
const ACQUIRE_TIMEOUT_NS: u64 = 10_000_000_000;

/// 加载线程和渲染线程同时录制时需要的最小容量
pub const MIN_SHARED_CAPACITY: usize = 2;

/// 一个录制上下文以及它背后的 allocator
///
/// 从 pool 中取出，录制，提交，然后在 fence 通过之后回到 free list。
pub struct CommandStream {
    cmd: GfxCommandBuffer,
    allocator: GfxCommandAllocatorHandle,
    /// 最后一次提交时分配到的 fence 值，0 表示从未提交
    fence_value: u64,
    id: usize,
}
impl CommandStream {
    #[inline]
    pub fn cmd(&mut self) -> &mut GfxCommandBuffer {
        &mut self.cmd
    }

    #[inline]
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// 开始录制，会清空之前录制的内容
    pub fn begin(&mut self, label: &str) {
        self.cmd.set_name(format!("stream-{}-{}", self.id, label));
        self.cmd.begin(label);
    }

    #[inline]
    pub fn end(&mut self) {
        self.cmd.end();
    }
}

struct PoolInner {
    free: Vec<CommandStream>,
    /// 按 fence 值递增排列
    in_flight: VecDeque<CommandStream>,
    /// 下一次提交使用的 fence 值
    next_fence_value: u64,
    created: usize,
}

/// command stream 的回收池
///
/// - 内部由一个 `Mutex` 同步，可以在加载线程和渲染线程之间共享
/// - fence 值的分配和队列提交在同一把锁中完成，因此 fence 值按队列顺序单调递增
/// - 只有当 stream 上一次提交的 fence 通过之后才会被复用
///
/// 加载线程和渲染线程各自会持有一个 stream，容量至少为 2。
pub struct CommandStreamPool {
    backend: Arc<dyn GfxBackend>,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

// new & init
impl CommandStreamPool {
    pub fn new(backend: Arc<dyn GfxBackend>, capacity: usize) -> Self {
        if capacity < MIN_SHARED_CAPACITY {
            log::warn!(
                "command stream pool capacity {} is below {}, acquire on a second thread spins until a stream is submitted",
                capacity,
                MIN_SHARED_CAPACITY
            );
        }
        Self {
            backend,
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_flight: VecDeque::new(),
                next_fence_value: 1,
                created: 0,
            }),
        }
    }

    #[inline]
    fn inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// acquire & submit
impl CommandStreamPool {
    /// 取出一个可以录制的 stream
    ///
    /// 没有空闲 stream 且已经达到容量时，会在锁外等待最旧的 in-flight stream
    pub fn acquire(&self) -> GfxResult<CommandStream> {
        let _span = tracy_client::span!("CommandStreamPool::acquire");
        let mut spinning = false;
        loop {
            let wait_value = {
                let mut inner = self.inner();
                self.retire_completed(&mut inner)?;

                if let Some(stream) = inner.free.pop() {
                    return Ok(stream);
                }
                if inner.created < self.capacity {
                    let id = inner.created;
                    let allocator = self.backend.create_command_allocator(&format!("command-stream-{id}"))?;
                    inner.created += 1;
                    log::debug!("command stream {} created", id);
                    return Ok(CommandStream {
                        cmd: GfxCommandBuffer::new(format!("stream-{id}")),
                        allocator,
                        fence_value: 0,
                        id,
                    });
                }

                match inner.in_flight.front() {
                    Some(oldest) => oldest.fence_value,
                    // 所有 stream 都被取出而没有归还，只能等其他线程提交
                    None => {
                        drop(inner);
                        if !spinning {
                            log::debug!(
                                "all {} command streams are checked out, waiting for another thread to submit",
                                self.capacity
                            );
                            spinning = true;
                        }
                        std::thread::yield_now();
                        continue;
                    }
                }
            };

            log::debug!("command stream pool exhausted, waiting for fence {}", wait_value);
            self.backend.wait_fence_value(wait_value, ACQUIRE_TIMEOUT_NS)?;
        }
    }

    /// 提交 stream，返回分配到的 fence 值
    ///
    /// 提交失败时 stream 会被重置并回到 free list
    pub fn submit(&self, mut stream: CommandStream) -> GfxResult<u64> {
        let _span = tracy_client::span!("CommandStreamPool::submit");
        let mut inner = self.inner();

        let fence_value = inner.next_fence_value;
        match self.backend.submit(stream.allocator, &stream.cmd, fence_value) {
            Ok(()) => {
                inner.next_fence_value += 1;
                stream.fence_value = fence_value;
                inner.in_flight.push_back(stream);
                Ok(fence_value)
            }
            Err(e) => {
                log::error!("submit of {} failed: {}", stream.cmd.name(), e);
                stream.cmd.reset();
                self.backend.reset_command_allocator(stream.allocator)?;
                inner.free.push(stream);
                Err(e)
            }
        }
    }

    /// 归还一个没有提交的 stream
    pub fn release(&self, mut stream: CommandStream) {
        stream.cmd.reset();
        self.inner().free.push(stream);
    }

    /// 回收所有 fence 已经通过的 stream
    fn retire_completed(&self, inner: &mut PoolInner) -> GfxResult<()> {
        let completed = self.backend.completed_fence_value();
        while inner.in_flight.front().is_some_and(|stream| stream.fence_value <= completed) {
            let Some(mut stream) = inner.in_flight.pop_front() else {
                break;
            };
            stream.cmd.reset();
            self.backend.reset_command_allocator(stream.allocator)?;
            inner.free.push(stream);
        }
        Ok(())
    }

    /// 等待 GPU 空闲，并回收所有 stream
    pub fn wait_idle(&self) -> GfxResult<()> {
        self.backend.wait_idle()?;
        let mut inner = self.inner();
        self.retire_completed(&mut inner)
    }
}

// getters
impl CommandStreamPool {
    /// 最近一次提交的 fence 值，0 表示还没有提交过
    #[inline]
    pub fn last_submitted_value(&self) -> u64 {
        self.inner().next_fence_value - 1
    }

    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.inner().in_flight.len()
    }

    #[inline]
    pub fn created_count(&self) -> usize {
        self.inner().created
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GfxBackend> {
        &self.backend
    }
}

impl Drop for CommandStreamPool {
    fn drop(&mut self) {
        log::info!("Dropping CommandStreamPool and destroying command allocators.");
        if let Err(e) = self.backend.wait_idle() {
            log::error!("wait idle failed on pool teardown: {}", e);
        }
        let inner = self.inner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for stream in inner.free.drain(..).chain(inner.in_flight.drain(..)) {
            self.backend.destroy_command_allocator(stream.allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};

    fn manual_backend() -> Arc<HeadlessBackend> {
        Arc::new(HeadlessBackend::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        }))
    }

    fn record_and_submit(pool: &CommandStreamPool, label: &str) -> u64 {
        let mut stream = pool.acquire().unwrap();
        stream.begin(label);
        stream.end();
        pool.submit(stream).unwrap()
    }

    #[test]
    fn test_fence_values_are_monotonic() {
        let backend = Arc::new(HeadlessBackend::default());
        let pool = CommandStreamPool::new(backend.clone(), 2);
        let values = (0..5).map(|i| record_and_submit(&pool, &format!("frame-{i}"))).collect::<Vec<_>>();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(pool.last_submitted_value(), 5);
    }

    #[test]
    fn test_stream_not_reused_before_fence() {
        let backend = manual_backend();
        let pool = CommandStreamPool::new(backend.clone(), 2);

        let first = pool.acquire().unwrap();
        let first_id = first.id();
        let mut first = first;
        first.begin("a");
        first.end();
        pool.submit(first).unwrap();

        // fence 1 没有完成，必须创建新的 stream
        let second = pool.acquire().unwrap();
        assert_ne!(second.id(), first_id);
        pool.release(second);

        backend.complete_up_to(1);
        let mut reused = pool.acquire().unwrap();
        reused.begin("b");
        reused.end();
        pool.submit(reused).unwrap();
        assert_eq!(pool.created_count(), 2);
    }

    #[test]
    fn test_acquire_waits_for_oldest_when_exhausted() {
        let backend = manual_backend();
        let pool = CommandStreamPool::new(backend.clone(), 1);

        record_and_submit(&pool, "a");
        assert_eq!(backend.completed_fence_value(), 0);

        // 容量为 1，只能等待 fence 1
        let stream = pool.acquire().unwrap();
        assert_eq!(backend.completed_fence_value(), 1);
        assert_eq!(stream.fence_value(), 1);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_checked_out_pool_resumes_after_submit() {
        let backend = Arc::new(HeadlessBackend::default());
        let pool = Arc::new(CommandStreamPool::new(backend, 1));
        let mut held = pool.acquire().unwrap();

        // 唯一的 stream 被取出且没有提交，另一个线程只能等待
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let stream = pool.acquire().unwrap();
                let id = stream.id();
                pool.release(stream);
                id
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        held.begin("loader");
        held.end();
        pool.submit(held).unwrap();
        assert_eq!(waiter.join().unwrap(), 0);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_failed_submit_returns_stream() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
            fail_submit_after: Some(0),
            ..Default::default()
        }));
        let pool = CommandStreamPool::new(backend, 1);
        let mut stream = pool.acquire().unwrap();
        stream.begin("doomed");
        stream.end();
        assert!(pool.submit(stream).is_err());
        assert_eq!(pool.last_submitted_value(), 0);
        // stream 回到了 free list
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_concurrent_submission_keeps_queue_order() {
        let backend = Arc::new(HeadlessBackend::default());
        let pool = Arc::new(CommandStreamPool::new(backend.clone(), 4));

        let threads = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..25).map(|i| record_and_submit(&pool, &format!("t{t}-{i}"))).collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut all = threads.into_iter().flat_map(|t| t.join().unwrap()).collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());

        let submitted = backend.submissions().iter().map(|s| s.signal_value).collect::<Vec<_>>();
        assert!(submitted.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(backend.submission_count(), 100);
    }
}
