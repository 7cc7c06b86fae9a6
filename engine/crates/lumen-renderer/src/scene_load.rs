//! 异步场景加载
//!
//! ```text
//! Empty ──load_scene──▶ Loading ──fence 通过──▶ Ready
//!                          │
//!                          └──错误 / panic──▶ Failed
//! ```
//!
//! 加载线程负责 `SceneLoader::load` 和整个上传（包括 BLAS / TLAS 构建的提交），
//! 结束时设置 `finished` 标记。渲染线程每帧检查一次这个标记，看到之后再从 `JoinHandle` 取结果。
//! 之后还要等上传所在提交的 fence 通过才会进入 `Ready`，在此之前每帧都只输出 loading 画面。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lumen_scene::camera::Camera;
use lumen_scene::error::SceneLoadError;
use lumen_scene::loader::SceneLoader;
use lumen_scene::scene_graph::EnvironmentLight;

use crate::accel_builder::AccelBuilder;
use crate::context::RendererContext;
use crate::error::RendererError;
use crate::scene_accel::SceneAccel;

/// 上传完成的场景
pub struct LoadedScene {
    pub name: String,
    pub accel: SceneAccel,
    /// 加载器提供的初始相机
    pub camera: Camera,
    pub environment: EnvironmentLight,
    /// 第几次成功加载，用于区分前后两个场景
    pub epoch: u64,
}

impl LoadedScene {
    /// 场景切换和 TLAS 替换都会改变这个值
    #[inline]
    pub fn generation(&self) -> u64 {
        (self.epoch << 32) | self.accel.generation()
    }
}

type LoadResult = Result<LoadedScene, SceneLoadError>;

/// 线程退出时设置标记，panic 展开时同样会执行
struct FinishedFlag(Arc<AtomicBool>);

impl Drop for FinishedFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// 一次进行中的加载
pub struct SceneLoadTask {
    name: String,
    ctx: Arc<RendererContext>,
    finished: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<LoadResult>>,
    /// 线程已经结束，等待上传的 fence
    uploaded: Option<LoadedScene>,
    started: Instant,
}

/// 一次轮询的结果
pub enum LoadPoll {
    Pending,
    Ready(Box<LoadedScene>),
    Failed(SceneLoadError),
}

// new & init
impl SceneLoadTask {
    /// 在独立线程上开始加载
    ///
    /// # 参数
    /// - `hit_group`: 写入 shader table 每一行开头的 identifier
    pub fn spawn(
        ctx: Arc<RendererContext>,
        loader: Box<dyn SceneLoader>,
        hit_group: Vec<u8>,
        epoch: u64,
    ) -> Result<Self, RendererError> {
        let name = loader.name().to_string();
        let finished = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        let finished_flag = FinishedFlag(finished.clone());
        let thread_ctx = ctx.clone();
        let thread_cancelled = cancelled.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("scene-loader-{name}"))
            .spawn(move || -> LoadResult {
                let _finished = finished_flag;
                let _span = tracy_client::span!("scene load");
                let graph = loader.load()?;
                if thread_cancelled.load(Ordering::Acquire) {
                    return Err(SceneLoadError::Cancelled);
                }
                let accel = AccelBuilder::new(&thread_ctx, hit_group).build(&graph)?;
                Ok(LoadedScene {
                    name: thread_name,
                    accel,
                    camera: graph.camera,
                    environment: graph.environment,
                    epoch,
                })
            })
            .map_err(RendererError::LoaderSpawn)?;

        log::info!("scene load started: {}", name);
        Ok(Self {
            name,
            ctx,
            finished,
            cancelled,
            handle: Some(handle),
            uploaded: None,
            started: Instant::now(),
        })
    }
}

// getters
impl SceneLoadTask {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

// poll
impl SceneLoadTask {
    /// 不会阻塞
    pub fn poll(&mut self) -> LoadPoll {
        if self.handle.is_some() && self.finished.load(Ordering::Acquire) {
            match self.join() {
                Ok(scene) => self.uploaded = Some(scene),
                Err(e) => return LoadPoll::Failed(e),
            }
        }

        let fence_passed = self
            .uploaded
            .as_ref()
            .is_some_and(|scene| self.ctx.backend().completed_fence_value() >= scene.accel.ready_fence());
        match self.uploaded.take() {
            Some(scene) if fence_passed => LoadPoll::Ready(Box::new(scene)),
            uploaded => {
                self.uploaded = uploaded;
                LoadPoll::Pending
            }
        }
    }

    /// 阻塞直到线程结束
    fn join(&mut self) -> LoadResult {
        let Some(handle) = self.handle.take() else {
            return Err(SceneLoadError::Cancelled);
        };
        handle
            .join()
            .unwrap_or_else(|_| Err(SceneLoadError::Malformed(format!("scene loader `{}` panicked", self.name))))
    }
}

impl Drop for SceneLoadTask {
    /// 被取代或者渲染器销毁时，等待线程结束并回收已经上传的资源
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if self.handle.is_some()
            && let Ok(scene) = self.join()
        {
            self.uploaded = Some(scene);
        }
        if let Some(scene) = self.uploaded.take() {
            log::info!("discarding scene `{}` that was never shown", scene.name);
            scene.accel.retire(&self.ctx);
        }
    }
}

/// 渲染器的场景状态
#[derive(Default)]
pub enum SceneState {
    #[default]
    Empty,
    Loading(SceneLoadTask),
    Ready(Box<LoadedScene>),
    /// 只保留错误描述，错误本身在进入这个状态时记录一次日志
    Failed(String),
}

/// `SceneState::update` 中发生的状态转换
#[derive(Clone, Debug, PartialEq)]
pub enum SceneTransition {
    Loaded {
        name: String,
        instance_count: usize,
        elapsed: Duration,
    },
    Failed(String),
}

impl SceneState {
    /// 轮询加载任务，返回本次发生的状态转换
    pub fn update(&mut self) -> Option<SceneTransition> {
        let Self::Loading(task) = self else {
            return None;
        };
        let elapsed = task.elapsed();
        let name = task.name().to_string();
        match task.poll() {
            LoadPoll::Pending => None,
            LoadPoll::Ready(scene) => {
                let instance_count = scene.accel.instances().len();
                log::info!(
                    "scene `{}` ready after {:.1} ms: {} geometries, {} instances",
                    name,
                    elapsed.as_secs_f64() * 1000.0,
                    scene.accel.geometries().len(),
                    instance_count
                );
                *self = Self::Ready(scene);
                Some(SceneTransition::Loaded {
                    name,
                    instance_count,
                    elapsed,
                })
            }
            LoadPoll::Failed(e) => {
                log::error!("scene `{}` failed to load: {}", name, e);
                let message = e.to_string();
                *self = Self::Failed(message.clone());
                Some(SceneTransition::Failed(message))
            }
        }
    }

    /// 替换为新的状态，当前场景交给 deferred destroy
    pub fn replace(&mut self, next: SceneState, ctx: &RendererContext) {
        match std::mem::replace(self, next) {
            Self::Ready(scene) => scene.accel.retire(ctx),
            // drop 中会等待线程并回收结果
            Self::Loading(task) => drop(task),
            Self::Empty | Self::Failed(_) => {}
        }
    }

    #[inline]
    pub fn ready(&self) -> Option<&LoadedScene> {
        match self {
            Self::Ready(scene) => Some(scene),
            _ => None,
        }
    }

    #[inline]
    pub fn ready_mut(&mut self) -> Option<&mut LoadedScene> {
        match self {
            Self::Ready(scene) => Some(scene),
            _ => None,
        }
    }

    #[inline]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    /// 用于日志和报告
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Loading(_) => "loading",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RendererConfig;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};
    use lumen_scene::loader::{ProceduralSceneLoader, ProceduralSceneParams};

    fn context(config: HeadlessConfig) -> (Arc<HeadlessBackend>, Arc<RendererContext>) {
        let backend = Arc::new(HeadlessBackend::new(config));
        let ctx = Arc::new(RendererContext::new(backend.clone(), &RendererConfig::default()));
        (backend, ctx)
    }

    fn loader(params: ProceduralSceneParams) -> Box<dyn SceneLoader> {
        Box::new(ProceduralSceneLoader::new(params))
    }

    fn update_until_settled(state: &mut SceneState) -> Option<SceneTransition> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(transition) = state.update() {
                return Some(transition);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_ready_waits_for_upload_fence() {
        let (backend, ctx) = context(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        });
        let task = SceneLoadTask::spawn(ctx.clone(), loader(ProceduralSceneParams::default()), vec![1; 32], 1).unwrap();
        let mut state = SceneState::Loading(task);

        // 线程结束之后 fence 仍未通过
        let deadline = Instant::now() + Duration::from_secs(10);
        while backend.submitted_fence_value() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(state.update().is_none());
        assert!(state.is_loading());

        backend.complete_up_to(backend.submitted_fence_value());
        let transition = update_until_settled(&mut state).unwrap();
        assert!(matches!(transition, SceneTransition::Loaded { instance_count: 12, .. }));
        assert_eq!(state.ready().unwrap().generation(), 1 << 32);
        state.replace(SceneState::Empty, &ctx);
    }

    #[test]
    fn test_loader_error_moves_to_failed() {
        let (_backend, ctx) = context(HeadlessConfig::default());
        let params = ProceduralSceneParams {
            fail: true,
            ..Default::default()
        };
        let mut state = SceneState::Loading(SceneLoadTask::spawn(ctx, loader(params), vec![0; 32], 1).unwrap());
        assert!(matches!(update_until_settled(&mut state), Some(SceneTransition::Failed(_))));
        assert_eq!(state.label(), "failed");
        // 失败状态不会再产生转换
        assert!(state.update().is_none());
    }

    #[test]
    fn test_panicking_loader_moves_to_failed() {
        struct Panics;
        impl SceneLoader for Panics {
            fn name(&self) -> &str {
                "panics"
            }
            fn load(&self) -> Result<lumen_scene::scene_graph::SceneGraph, SceneLoadError> {
                panic!("loader bug");
            }
        }

        let (_backend, ctx) = context(HeadlessConfig::default());
        let mut state = SceneState::Loading(SceneLoadTask::spawn(ctx, Box::new(Panics), vec![0; 32], 1).unwrap());
        match update_until_settled(&mut state) {
            Some(SceneTransition::Failed(message)) => assert!(message.contains("panicked")),
            other => panic!("unexpected transition {other:?}"),
        }
    }

    #[test]
    fn test_superseded_load_releases_resources() {
        let (backend, ctx) = context(HeadlessConfig::default());
        let params = ProceduralSceneParams {
            load_delay_ms: 20,
            ..Default::default()
        };
        let mut state = SceneState::Loading(SceneLoadTask::spawn(ctx.clone(), loader(params), vec![0; 32], 1).unwrap());

        // 取代正在进行的加载：线程在 load 之后看到取消标记，不会上传
        state.replace(SceneState::Empty, &ctx);
        ctx.wait_idle().unwrap();
        assert_eq!(backend.live_accel_count(), 0);
    }
}
