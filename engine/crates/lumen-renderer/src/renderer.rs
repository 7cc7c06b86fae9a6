//! 帧编排器
//!
//! 每帧的顺序：
//!
//! ```text
//! 帧时间反馈 -> 回读 stats -> 轮询场景加载 -> TLAS 重建 / 替换 -> 检查分辨率
//!     -> history 失效检查 -> 采样上限 -> 组装 graph -> 录制 -> 推进帧序号
//! ```
//!
//! 录制只写入调用者提供的 `CommandStream`，提交由 `Renderer::submit` 完成。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
use lumen_gfx::error::GfxError;
use lumen_gfx::handles::GfxBufferHandle;
use lumen_render_graph::frame_resources::FrameResources;
use lumen_render_graph::state_tracker::ResourceStateTracker;
use lumen_render_interface::command_stream_pool::CommandStream;
use lumen_render_interface::frame_counter::FrameCounter;
use lumen_render_interface::output_settings::{DispatchMode, FrameSettings, OutputSettings};
use lumen_render_interface::resource_table::ResourceSlot;
use lumen_render_interface::stats::{FrameStats, StatsReadback};
use lumen_scene::camera::Camera;
use lumen_scene::loader::SceneLoader;

use crate::blue_noise::BlueNoise;
use crate::context::RendererContext;
use crate::convergence::{ConvergenceController, ConvergenceSettings, EffortUpdate};
use crate::error::RendererError;
use crate::frame_constants::{FrameConstants, FrameFlags};
use crate::kernels::RendererKernels;
use crate::presentation::PresentationTarget;
use crate::render_pipeline::frame_graph::{FrameGraphInputs, HybridPipeline, StatsBinding};
use crate::render_pipeline::path_trace_pass::SceneBindings;
use crate::render_pipeline::trace_dispatch::select_trace_dispatch;
use crate::render_pipeline::upscale_pass::Upscaler;
use crate::scene_load::{SceneLoadTask, SceneState, SceneTransition};
use crate::temporal::{HistoryInvalidator, InvalidationCause, TemporalState};

/// stage 1 之前按注册顺序调用
///
/// 第二个参数是 frame constants 之后的 push constant 偏移
pub type PreDispatchHook = Box<dyn Fn(&mut GfxCommandBuffer, u32) + Send>;

/// 帧时间的来源
pub trait FrameClock: Send {
    /// 距离上一次调用的时间，第一次调用返回 `None`
    fn tick(&mut self) -> Option<Duration>;
}

#[derive(Default)]
pub struct WallClock {
    last: Option<Instant>,
}

impl FrameClock for WallClock {
    fn tick(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.last.replace(now).map(|last| now - last)
    }
}

/// 每帧固定耗时，用于离线渲染和测试
pub struct FixedClock(pub Duration);

impl FrameClock for FixedClock {
    fn tick(&mut self) -> Option<Duration> {
        Some(self.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RendererOptions {
    /// `None` 时 kernel 不带 SPIR-V，只能用于 headless
    pub shader_dir: Option<PathBuf>,
    pub convergence: ConvergenceSettings,
}

/// 一帧的摘要
#[derive(Clone, Debug, serde::Serialize)]
pub struct FrameReport {
    pub frame_id: u64,
    pub label: String,
    pub scene_state: &'static str,
    /// 按执行顺序
    pub passes: Vec<String>,
    pub blend_weight: f32,
    pub composite_blend_weight: f32,
    pub samples_rendered: u64,
    pub effort: f32,
    pub effort_update: Option<EffortUpdate>,
    pub invalidation: Option<InvalidationCause>,
    pub resized: bool,
    pub limit_reached: bool,
    /// 本帧开始时读回的、之前某一帧的统计
    pub stats: Option<FrameStats>,
    pub dispatch: &'static str,
}

#[derive(Clone, Debug)]
pub enum RendererEvent {
    SceneLoaded {
        name: String,
        instance_count: usize,
        elapsed: Duration,
    },
    SceneLoadFailed(String),
    HistoryInvalidated(InvalidationCause),
    Resized { width: u32, height: u32 },
    FrameRendered(FrameReport),
}

pub struct Renderer {
    ctx: Arc<RendererContext>,
    pipeline: HybridPipeline,
    dispatch_mode: DispatchMode,

    frame: Option<FrameResources>,
    tracker: ResourceStateTracker,
    counter: FrameCounter,

    temporal: TemporalState,
    invalidator: HistoryInvalidator,
    convergence: ConvergenceController,
    clock: Box<dyn FrameClock>,

    scene: SceneState,
    scene_epoch: u64,
    camera: Camera,
    blue_noise: BlueNoise,

    hooks: Vec<PreDispatchHook>,

    stats_slots: HashMap<GfxBufferHandle, ResourceSlot>,
    /// 每个 stats buffer 最后一次被写入的提交，读取之后移除
    stats_fences: HashMap<GfxBufferHandle, u64>,
    /// 最近一次 `render` 录制的 stats buffer
    recorded_stats: Option<GfxBufferHandle>,

    subscribers: Vec<Sender<RendererEvent>>,
}

// new & init
impl Renderer {
    pub fn new(ctx: Arc<RendererContext>, options: &RendererOptions) -> Result<Self, RendererError> {
        let _span = tracy_client::span!("Renderer::new");

        let kernels = RendererKernels::new(ctx.backend(), options.shader_dir.as_deref())?;
        let dispatch = match select_trace_dispatch(DispatchMode::Auto, &kernels) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                kernels.destroy(ctx.backend());
                return Err(e);
            }
        };
        let pipeline = HybridPipeline::new(kernels, dispatch);
        let blue_noise = match BlueNoise::new(&ctx) {
            Ok(blue_noise) => blue_noise,
            Err(e) => {
                for kernel in pipeline.kernels().handles() {
                    ctx.backend().destroy_kernel(kernel);
                }
                return Err(e.into());
            }
        };

        let convergence = ConvergenceController::new(
            options.convergence.clone(),
            OutputSettings::default().target_frame_time(),
        );

        Ok(Self {
            ctx,
            pipeline,
            dispatch_mode: DispatchMode::Auto,
            frame: None,
            tracker: ResourceStateTracker::new(),
            counter: FrameCounter::new(0),
            temporal: TemporalState::default(),
            invalidator: HistoryInvalidator::default(),
            convergence,
            clock: Box::new(WallClock::default()),
            scene: SceneState::Empty,
            scene_epoch: 0,
            camera: Camera::default(),
            blue_noise,
            hooks: Vec::new(),
            stats_slots: HashMap::new(),
            stats_fences: HashMap::new(),
            recorded_stats: None,
            subscribers: Vec::new(),
        })
    }

    /// 后续帧的事件，接收端被丢弃之后自动取消订阅
    pub fn subscribe(&mut self) -> Receiver<RendererEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn set_clock(&mut self, clock: Box<dyn FrameClock>) {
        self.clock = clock;
    }

    pub fn add_pre_dispatch_hook(&mut self, hook: PreDispatchHook) {
        self.hooks.push(hook);
    }

    pub fn set_upscaler(&mut self, upscaler: Box<dyn Upscaler>) {
        self.pipeline.set_upscaler(upscaler);
    }

    pub fn set_print_graph(&mut self, print_graph: bool) {
        self.pipeline.set_print_graph(print_graph);
    }
}

// scene
impl Renderer {
    /// 开始异步加载，当前的场景或加载任务会被替换
    pub fn load_scene(&mut self, loader: Box<dyn SceneLoader>) -> Result<(), RendererError> {
        let hit_group = self.pipeline.kernels().hit_group(self.ctx.backend())?;
        self.scene_epoch += 1;
        let task = SceneLoadTask::spawn(self.ctx.clone(), loader, hit_group, self.scene_epoch)?;
        self.scene.replace(SceneState::Loading(task), &self.ctx);
        Ok(())
    }

    /// 相机改变会在下一帧触发 history 失效
    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn orbit_camera(&mut self, angle_deg: f32) {
        self.camera.orbit(angle_deg);
    }

    /// 场景未就绪时返回 `Ok(false)`
    pub fn set_instance_transform(&mut self, index: usize, transform: glam::Mat4) -> Result<bool, RendererError> {
        match self.scene.ready_mut() {
            Some(scene) => {
                scene.accel.set_instance_transform(index, transform)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// getters
impl Renderer {
    #[inline]
    pub fn context(&self) -> &Arc<RendererContext> {
        &self.ctx
    }

    #[inline]
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    #[inline]
    pub fn scene_state(&self) -> &SceneState {
        &self.scene
    }

    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.counter
    }

    #[inline]
    pub fn frame_resources(&self) -> Option<&FrameResources> {
        self.frame.as_ref()
    }

    #[inline]
    pub fn temporal(&self) -> &TemporalState {
        &self.temporal
    }

    #[inline]
    pub fn convergence(&self) -> &ConvergenceController {
        &self.convergence
    }
}

// render
impl Renderer {
    /// 把一帧录制到 `stream` 中
    ///
    /// 返回错误时 stream 可能已经 begin / end，调用者应当把它归还给 pool 而不是提交
    pub fn render(
        &mut self,
        stream: &mut CommandStream,
        target: &PresentationTarget,
        stats: &StatsReadback,
        settings: &OutputSettings,
    ) -> Result<FrameReport, RendererError> {
        let _span = tracy_client::span!("Renderer::render");
        let now = Instant::now();

        self.convergence.set_target(settings.target_frame_time());
        let effort_update = self.clock.tick().and_then(|dt| self.convergence.record_frame(dt));

        self.ctx.collect_garbage();
        let read_stats = self.read_stats(stats)?;

        self.update_scene()?;

        let resized = self.ensure_frame_resources(target, settings, now)?;
        let mut invalidation = None;
        if resized {
            self.emit(RendererEvent::HistoryInvalidated(InvalidationCause::Resize));
            invalidation = Some(InvalidationCause::Resize);
        }

        if settings.dispatch_mode != self.dispatch_mode {
            self.pipeline
                .set_dispatch(select_trace_dispatch(settings.dispatch_mode, self.pipeline.kernels())?);
            self.dispatch_mode = settings.dispatch_mode;
        }

        let scene_generation = self.scene.ready().map(|scene| scene.generation());
        if let Some(cause) = self.invalidator.observe(&self.camera, scene_generation, settings) {
            log::debug!("{} history invalidated: {:?}", self.counter.frame_name(), cause);
            self.temporal.invalidate();
            self.convergence.on_invalidate(now);
            self.emit(RendererEvent::HistoryInvalidated(cause));
            invalidation = Some(cause);
        }

        let has_scene = scene_generation.is_some();
        let limit_reached = has_scene && self.convergence.limits_reached(settings, now);
        let trace_enabled = has_scene && !limit_reached;

        let stats_slot = self.stats_slot(stats.buffer())?;
        let Some(frame) = self.frame.as_ref() else {
            return Err(GfxError::Backend("frame resources missing after resize check".to_string()).into());
        };

        let blend_weight = self.temporal.blend_weight(settings);
        let composite_blend_weight = self.temporal.composite_blend_weight(settings);
        let constants = self.frame_constants(frame, settings, has_scene, limit_reached, blend_weight);
        let scene = self
            .scene
            .ready()
            .map(|scene| SceneBindings::new(&scene.accel, self.blue_noise.buffer(), self.blue_noise.slot()));

        stream.begin(&self.counter.frame_name());
        let inputs = FrameGraphInputs {
            frame,
            counter: &self.counter,
            tracker: &self.tracker,
            settings,
            target,
            stats: StatsBinding {
                buffer: stats.buffer(),
                slot: stats_slot,
            },
            constants,
            composite_blend_weight,
            scene,
            trace_enabled,
        };
        let graph = match self.pipeline.prepare_frame_graph(&inputs, &self.hooks) {
            Ok(graph) => graph,
            Err(e) => {
                stream.end();
                return Err(e.into());
            }
        };
        graph.execute(stream.cmd());
        graph.export_states(&mut self.tracker);
        let passes = graph.ordered_pass_names().into_iter().map(str::to_string).collect();
        drop(graph);
        stream.end();
        self.recorded_stats = Some(stats.buffer());

        let report = FrameReport {
            frame_id: self.counter.frame_id(),
            label: self.counter.frame_label().to_string(),
            scene_state: self.scene.label(),
            passes,
            blend_weight,
            composite_blend_weight,
            samples_rendered: self.convergence.samples_rendered(),
            effort: self.convergence.effort(),
            effort_update,
            invalidation,
            resized,
            limit_reached,
            stats: read_stats,
            dispatch: self.pipeline.dispatch().name(),
        };

        if has_scene {
            if trace_enabled {
                if settings.continuous {
                    self.temporal.accumulation.mark_written();
                }
                self.convergence.add_sample();
            }
            if settings.continuous {
                self.temporal.composite.mark_written();
            }
        }
        // 达到上限之后 history 不再写入，停留在同一个 parity 上
        if !limit_reached {
            self.counter.next_frame();
        }

        self.emit(RendererEvent::FrameRendered(report.clone()));
        Ok(report)
    }

    /// 提交录制好的帧，失败是致命的
    pub fn submit(&mut self, stream: CommandStream) -> Result<u64, RendererError> {
        let fence_value = self
            .ctx
            .stream_pool()
            .submit(stream)
            .map_err(RendererError::SubmitFailed)?;
        if let Some(buffer) = self.recorded_stats.take() {
            self.stats_fences.insert(buffer, fence_value);
        }
        Ok(fence_value)
    }

    /// 呈现目标被替换之后调用
    pub fn retire_target(&mut self, target: PresentationTarget) {
        self.tracker.forget_image(target.image());
        target.retire(&self.ctx);
    }

    /// 等待 GPU 空闲
    pub fn wait_idle(&self) -> Result<(), RendererError> {
        Ok(self.ctx.wait_idle()?)
    }

    /// 写入这个 buffer 的提交完成之后读取一次
    fn read_stats(&mut self, stats: &StatsReadback) -> Result<Option<FrameStats>, RendererError> {
        let buffer = stats.buffer();
        let Some(&fence_value) = self.stats_fences.get(&buffer) else {
            return Ok(None);
        };
        if self.ctx.backend().completed_fence_value() < fence_value {
            return Ok(None);
        }
        self.stats_fences.remove(&buffer);
        let read = stats.read(self.ctx.backend())?;
        self.convergence.record_stats(read);
        Ok(Some(read))
    }

    fn stats_slot(&mut self, buffer: GfxBufferHandle) -> Result<ResourceSlot, RendererError> {
        if let Some(slot) = self.stats_slots.get(&buffer) {
            return Ok(*slot);
        }
        let slot = self.ctx.resource_table().register_buffer(buffer)?;
        self.stats_slots.insert(buffer, slot);
        Ok(slot)
    }

    fn update_scene(&mut self) -> Result<(), RendererError> {
        match self.scene.update() {
            Some(SceneTransition::Loaded {
                name,
                instance_count,
                elapsed,
            }) => {
                if let Some(scene) = self.scene.ready() {
                    self.camera = scene.camera;
                }
                self.emit(RendererEvent::SceneLoaded {
                    name,
                    instance_count,
                    elapsed,
                });
            }
            Some(SceneTransition::Failed(message)) => self.emit(RendererEvent::SceneLoadFailed(message)),
            None => {}
        }

        if let Some(scene) = self.scene.ready_mut() {
            scene.accel.rebuild_if_dirty(&self.ctx)?;
            scene.accel.poll_pending(&self.ctx)?;
        }
        Ok(())
    }

    /// 分辨率或格式改变时重建，返回是否发生了重建（第一次创建不算）
    fn ensure_frame_resources(
        &mut self,
        target: &PresentationTarget,
        settings: &OutputSettings,
        now: Instant,
    ) -> Result<bool, RendererError> {
        let frame_settings = FrameSettings::new(target.extent(), target.format(), settings);
        let resized = match &self.frame {
            Some(frame) if *frame.settings() == frame_settings => return Ok(false),
            Some(_) => true,
            None => false,
        };

        if let Some(old) = self.frame.take() {
            let _span = tracy_client::span!("Renderer::resize");
            let fence_value = self.ctx.stream_pool().last_submitted_value();
            old.retire(&mut self.ctx.deferred_destroy(), &mut self.tracker, fence_value);
            self.ctx.wait_idle()?;
        }

        let frame = FrameResources::new(self.ctx.backend(), &mut self.ctx.resource_table(), &frame_settings)?;
        self.frame = Some(frame);
        self.temporal.reset();
        self.invalidator.forget();
        self.convergence.on_invalidate(now);

        if resized {
            let extent = frame_settings.output_extent;
            log::info!(
                "resized to {}x{} (render {}x{})",
                extent.width,
                extent.height,
                frame_settings.render_extent.width,
                frame_settings.render_extent.height
            );
            self.emit(RendererEvent::Resized {
                width: extent.width,
                height: extent.height,
            });
        }
        Ok(resized)
    }

    fn frame_constants(
        &self,
        frame: &FrameResources,
        settings: &OutputSettings,
        has_scene: bool,
        limit_reached: bool,
        blend_weight: f32,
    ) -> FrameConstants {
        let mut flags = self.pipeline.dispatch().flags();
        flags.set(FrameFlags::CONTINUOUS, settings.continuous);
        flags.set(FrameFlags::DENOISE, settings.denoise.enabled);
        flags.set(FrameFlags::HISTORY_VALID, self.temporal.accumulation.is_usable());
        flags.set(FrameFlags::UPSCALE, settings.upscaler_active());
        flags.set(FrameFlags::LIMIT_REACHED, limit_reached);
        flags.set(FrameFlags::LOADING, !has_scene);

        let extent = frame.render_extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut constants = FrameConstants::new(extent, self.counter.frame_id(), flags).with_camera(
            &self.camera.basis(aspect),
            self.camera.lens_radius,
            self.camera.focal_distance,
        );
        constants.effort = self.convergence.effort();
        constants.blend_weight = blend_weight;
        constants.sample_count = self.convergence.samples_rendered() as u32;
        constants.channel = settings.channel.index();
        constants
    }

    fn emit(&mut self, event: RendererEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Dropping Renderer.");
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("wait idle failed on renderer teardown: {}", e);
        }

        self.scene.replace(SceneState::Empty, &self.ctx);
        let fence_value = self.ctx.stream_pool().last_submitted_value();
        if let Some(frame) = self.frame.take() {
            frame.retire(&mut self.ctx.deferred_destroy(), &mut self.tracker, fence_value);
        }
        self.ctx.deferred_destroy().push(self.blue_noise.buffer(), fence_value);
        for kernel in self.pipeline.kernels().handles() {
            self.ctx.backend().destroy_kernel(kernel);
        }

        if let Err(e) = self.ctx.wait_idle() {
            log::error!("wait idle failed on renderer teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RendererConfig;
    use crate::render_pipeline::frame_graph::pass_names;
    use ash::vk;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};
    use lumen_scene::loader::{ProceduralSceneLoader, ProceduralSceneParams};

    struct Harness {
        backend: Arc<HeadlessBackend>,
        ctx: Arc<RendererContext>,
        renderer: Renderer,
        target: PresentationTarget,
        stats: [StatsReadback; 2],
    }

    impl Harness {
        fn new(config: HeadlessConfig, extent: vk::Extent2D) -> Self {
            let backend = Arc::new(HeadlessBackend::new(config));
            let ctx = Arc::new(RendererContext::new(backend.clone(), &RendererConfig::default()));
            let renderer = Renderer::new(ctx.clone(), &RendererOptions::default()).unwrap();
            let target = PresentationTarget::new(&ctx, extent, FrameSettings::DEFAULT_OUTPUT_FORMAT, "target").unwrap();
            let stats = [
                StatsReadback::new(ctx.backend(), "stats-A").unwrap(),
                StatsReadback::new(ctx.backend(), "stats-B").unwrap(),
            ];
            Self {
                backend,
                ctx,
                renderer,
                target,
                stats,
            }
        }

        fn frame(&mut self, settings: &OutputSettings) -> Result<FrameReport, RendererError> {
            let mut stream = self.ctx.stream_pool().acquire()?;
            let stats = &self.stats[*self.renderer.frame_counter().frame_label()];
            match self.renderer.render(&mut stream, &self.target, stats, settings) {
                Ok(report) => {
                    self.renderer.submit(stream)?;
                    Ok(report)
                }
                Err(e) => {
                    self.ctx.stream_pool().release(stream);
                    Err(e)
                }
            }
        }

        fn load(&mut self, params: ProceduralSceneParams) {
            self.renderer
                .load_scene(Box::new(ProceduralSceneLoader::new(params)))
                .unwrap();
        }

        /// 渲染直到场景离开 loading 状态
        fn render_until_settled(&mut self, settings: &OutputSettings) -> Vec<FrameReport> {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut reports = Vec::new();
            while Instant::now() < deadline {
                let report = self.frame(settings).unwrap();
                let settled = report.scene_state != "loading";
                reports.push(report);
                if settled {
                    return reports;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            panic!("scene did not settle");
        }

        fn resize(&mut self, extent: vk::Extent2D) {
            let target =
                PresentationTarget::new(&self.ctx, extent, FrameSettings::DEFAULT_OUTPUT_FORMAT, "target").unwrap();
            let old = std::mem::replace(&mut self.target, target);
            self.renderer.retire_target(old);
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_shared_mesh_scene_renders_all_stages() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(64, 48));
        h.load(ProceduralSceneParams {
            instance_count: 6,
            include_curves: false,
            ..Default::default()
        });
        let settings = OutputSettings::default();
        h.render_until_settled(&settings);

        {
            let scene = h.renderer.scene_state().ready().unwrap();
            // 地面 + 共享的 cube
            assert_eq!(scene.accel.geometries().len(), 2);
            assert_eq!(scene.accel.instances().len(), 7);
        }

        let report = h.frame(&settings).unwrap();
        let expected = [
            pass_names::STATS_CLEAR,
            pass_names::PATH_TRACE,
            pass_names::TEMPORAL_ACCUMULATION,
            "denoise-0",
            "denoise-1",
            "denoise-2",
            "denoise-3",
            pass_names::COMPOSITE,
            pass_names::COMPOSITE_ACCUMULATION,
            pass_names::POST_PROCESS,
        ];
        assert_eq!(report.passes, expected);
        assert_eq!(report.dispatch, "hardware");
        assert!(h.backend.hazards().is_empty(), "{:?}", h.backend.hazards());
    }

    #[test]
    fn test_upscaler_writes_presentation_target() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(64, 48));
        h.load(ProceduralSceneParams::default());
        let mut settings = OutputSettings::default();
        settings.upscale.enabled = true;
        settings.upscale.factor = 2.0;
        h.render_until_settled(&settings);

        let report = h.frame(&settings).unwrap();
        assert_eq!(report.passes[report.passes.len() - 2..], [pass_names::POST_PROCESS, pass_names::UPSCALE]);
        assert_eq!(h.renderer.frame_resources().unwrap().render_extent(), extent(32, 24));
        assert!(h.backend.hazards().is_empty(), "{:?}", h.backend.hazards());
    }

    #[test]
    fn test_temporal_off_skips_accumulation() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(32, 32));
        h.load(ProceduralSceneParams::default());
        let settings = OutputSettings {
            continuous: false,
            ..Default::default()
        };
        h.render_until_settled(&settings);
        for _ in 0..3 {
            let report = h.frame(&settings).unwrap();
            assert!(report.passes.iter().any(|p| p == pass_names::PATH_TRACE));
            assert!(!report.passes.iter().any(|p| p.contains("accumulation")));
        }

        let labels = h.backend.submissions().last().unwrap().labels().join(" ");
        assert!(!labels.contains("temporal-accumulation"));
        assert!(!labels.contains("composite-accumulation"));
        assert!(h.backend.hazards().is_empty());
    }

    #[test]
    fn test_camera_move_discards_history_for_one_frame() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(32, 32));
        h.load(ProceduralSceneParams::default());
        let settings = OutputSettings::default();
        h.render_until_settled(&settings);

        // 场景就绪之后的第一帧因为场景切换而失效
        let steady = settings.steady_blend_weight();
        let report = h.frame(&settings).unwrap();
        assert_eq!(report.blend_weight, steady);

        let events = h.renderer.subscribe();
        h.renderer.orbit_camera(10.0);
        let moved = h.frame(&settings).unwrap();
        assert_eq!(moved.invalidation, Some(InvalidationCause::Camera));
        assert_eq!(moved.blend_weight, 0.0);
        assert_eq!(moved.composite_blend_weight, 0.0);
        assert_eq!(moved.samples_rendered, 0);

        let after = h.frame(&settings).unwrap();
        assert_eq!(after.invalidation, None);
        assert_eq!(after.blend_weight, steady);
        assert_eq!(after.samples_rendered, 1);

        let invalidations = events
            .try_iter()
            .filter(|e| matches!(e, RendererEvent::HistoryInvalidated(InvalidationCause::Camera)))
            .count();
        assert_eq!(invalidations, 1);
    }

    #[test]
    fn test_slow_frames_reduce_effort() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(16, 16));
        let settings = OutputSettings::default();
        h.renderer.set_clock(Box::new(FixedClock(settings.target_frame_time() * 2)));
        h.load(ProceduralSceneParams::default());
        h.render_until_settled(&settings);

        let initial = h.renderer.convergence().effort();
        let mut previous = initial;
        let mut updates = 0;
        for _ in 0..64 {
            let report = h.frame(&settings).unwrap();
            assert!(report.effort >= 0.0);
            assert!(report.effort <= previous);
            if report.effort_update.is_some() {
                updates += 1;
            }
            previous = report.effort;
        }
        assert_eq!(updates, 64 / ConvergenceSettings::default().window_frames as usize);
        assert!(previous < initial);
    }

    #[test]
    fn test_resize_registers_new_slots() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(64, 64));
        h.load(ProceduralSceneParams::default());
        let settings = OutputSettings::default();
        h.render_until_settled(&settings);
        h.frame(&settings).unwrap();

        let old_max = h
            .renderer
            .frame_resources()
            .unwrap()
            .all_images()
            .iter()
            .map(|image| image.slot.index())
            .max()
            .unwrap();
        let events = h.renderer.subscribe();

        h.resize(extent(96, 64));
        let report = h.frame(&settings).unwrap();
        assert!(report.resized);
        assert_eq!(report.invalidation, Some(InvalidationCause::Resize));
        assert_eq!(report.blend_weight, 0.0);

        let frame = h.renderer.frame_resources().unwrap();
        assert_eq!(frame.render_extent(), extent(96, 64));
        assert!(frame.all_images().iter().all(|image| image.slot.index() > old_max));
        assert!(events.try_iter().any(|e| matches!(e, RendererEvent::Resized { width: 96, height: 64 })));

        let report = h.frame(&settings).unwrap();
        assert!(!report.resized);
        assert_eq!(report.blend_weight, settings.steady_blend_weight());
        assert!(h.backend.hazards().is_empty(), "{:?}", h.backend.hazards());
    }

    #[test]
    fn test_loading_screen_until_scene_ready() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(32, 32));
        let events = h.renderer.subscribe();
        h.load(ProceduralSceneParams {
            load_delay_ms: 50,
            ..Default::default()
        });
        let settings = OutputSettings::default();
        let reports = h.render_until_settled(&settings);

        let first = &reports[0];
        assert_eq!(first.scene_state, "loading");
        assert_eq!(first.passes, [pass_names::STATS_CLEAR, pass_names::LOADING_SCREEN]);
        assert_eq!(reports.last().unwrap().scene_state, "ready");
        assert!(events.try_iter().any(|e| matches!(e, RendererEvent::SceneLoaded { .. })));
        assert!(h.backend.hazards().is_empty());
    }

    #[test]
    fn test_failed_load_keeps_loading_screen() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(32, 32));
        let events = h.renderer.subscribe();
        h.load(ProceduralSceneParams {
            fail: true,
            ..Default::default()
        });
        let settings = OutputSettings::default();
        h.render_until_settled(&settings);

        for _ in 0..3 {
            let report = h.frame(&settings).unwrap();
            assert_eq!(report.scene_state, "failed");
            assert!(report.passes.iter().any(|p| p == pass_names::LOADING_SCREEN));
        }
        let failures = events
            .try_iter()
            .filter(|e| matches!(e, RendererEvent::SceneLoadFailed(_)))
            .count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_forced_hardware_dispatch_without_support_fails() {
        let mut h = Harness::new(
            HeadlessConfig {
                ray_tracing: false,
                ..Default::default()
            },
            extent(16, 16),
        );
        let software = h.frame(&OutputSettings::default()).unwrap();
        assert_eq!(software.dispatch, "software");

        let settings = OutputSettings {
            dispatch_mode: DispatchMode::Hardware,
            ..Default::default()
        };
        assert!(matches!(
            h.frame(&settings),
            Err(RendererError::Gfx(GfxError::MissingFeature(_)))
        ));
    }

    #[test]
    fn test_sample_limit_freezes_history() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(16, 16));
        h.load(ProceduralSceneParams::default());
        let settings = OutputSettings {
            max_samples: Some(3),
            ..Default::default()
        };
        h.render_until_settled(&settings);
        // 场景就绪的那一帧已经是第 1 个采样
        assert_eq!(h.renderer.convergence().samples_rendered(), 1);
        for _ in 0..2 {
            assert!(!h.frame(&settings).unwrap().limit_reached);
        }

        let frame_id = h.renderer.frame_counter().frame_id();
        for _ in 0..2 {
            let report = h.frame(&settings).unwrap();
            assert!(report.limit_reached);
            assert_eq!(report.frame_id, frame_id);
            assert!(!report.passes.iter().any(|p| p == pass_names::PATH_TRACE));
            assert!(!report.passes.iter().any(|p| p == pass_names::TEMPORAL_ACCUMULATION));
            assert!(report.passes.iter().any(|p| p == pass_names::POST_PROCESS));
        }
        assert_eq!(h.renderer.convergence().samples_rendered(), 3);
        assert!(h.backend.hazards().is_empty());
    }

    #[test]
    fn test_stats_are_read_after_fence() {
        let mut h = Harness::new(HeadlessConfig::default(), extent(16, 16));
        assert!(h.frame(&OutputSettings::default()).unwrap().stats.is_none());
        h.frame(&OutputSettings::default()).unwrap();
        // 第三帧重新使用第一帧的 buffer
        let report = h.frame(&OutputSettings::default()).unwrap();
        assert_eq!(report.stats, Some(FrameStats::default()));
        assert_eq!(h.renderer.convergence().last_stats(), Some(FrameStats::default()));
    }

    #[test]
    fn test_pre_dispatch_hooks_run_in_order() {
        use std::sync::Mutex;

        let mut h = Harness::new(HeadlessConfig::default(), extent(16, 16));
        let calls = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let calls = calls.clone();
            h.renderer.add_pre_dispatch_hook(Box::new(move |_cmd: &mut GfxCommandBuffer, offset: u32| {
                calls.lock().unwrap().push((id, offset));
            }));
        }
        h.load(ProceduralSceneParams::default());
        h.render_until_settled(&OutputSettings::default());

        let calls = calls.lock().unwrap();
        assert!(calls.len() >= 2);
        assert_eq!(calls[0], (0, FrameConstants::SIZE));
        assert_eq!(calls[1], (1, FrameConstants::SIZE));
    }
}
