use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ash::vk;
use crossbeam_channel::Receiver;

use lumen_crate_tools::init_log::init_log;
use lumen_crate_tools::resource::LumenPath;
use lumen_gfx::backend::{BackendKind, GfxBackend, GfxBackendConfig, create_backend};
use lumen_render_interface::output_settings::FrameSettings;
use lumen_render_interface::stats::StatsReadback;
use lumen_renderer::context::RendererContext;
use lumen_renderer::presentation::PresentationTarget;
use lumen_renderer::renderer::{FixedClock, FrameReport, Renderer, RendererEvent, RendererOptions};

use crate::config::AppConfig;
use crate::outer_app::HeadlessApp;
use crate::report::SessionReport;

pub fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

/// 驱动一次离线渲染：每帧 acquire -> render -> submit，按配置改变呈现目标的大小
pub struct HeadlessSession {
    config: AppConfig,
    ctx: Arc<RendererContext>,
    renderer: Renderer,
    target: Option<PresentationTarget>,
    /// 按帧标签（A/B）各一个
    stats: Vec<StatsReadback>,
    events: Receiver<RendererEvent>,
    report: SessionReport,

    outer_app: Option<Box<dyn HeadlessApp>>,
}

// new & init
impl HeadlessSession {
    pub fn init_env() {
        std::panic::set_hook(Box::new(panic_handler));

        init_log();

        #[cfg(feature = "profile")]
        {
            tracy_client::Client::start();
            tracy_client::set_thread_name!("RenderThread");
        }
    }

    pub fn new(config: AppConfig, outer_app: Box<dyn HeadlessApp>) -> anyhow::Result<Self> {
        let backend_config = GfxBackendConfig {
            enable_validation: config.debug.validation,
            descriptor_slots: config.renderer.resource_table_capacity,
            ..Default::default()
        };
        let backend = create_backend(config.backend, &backend_config)
            .with_context(|| format!("failed to create {:?} backend", config.backend))?;
        Self::with_backend(config, backend, outer_app)
    }

    /// 使用已经创建好的后端
    pub fn with_backend(
        config: AppConfig,
        backend: Arc<dyn GfxBackend>,
        mut outer_app: Box<dyn HeadlessApp>,
    ) -> anyhow::Result<Self> {
        let report = SessionReport::new(backend.kind(), backend.capabilities().device_name.clone());
        let ctx = Arc::new(RendererContext::new(backend, &config.renderer));

        // vulkan 后端没有配置时使用工作区中编译好的 SPIR-V
        let shader_dir = config
            .shader_dir
            .clone()
            .or_else(|| (ctx.backend().kind() == BackendKind::Vulkan).then(LumenPath::shader_build_dir));
        let options = RendererOptions {
            shader_dir,
            convergence: config.convergence.clone(),
        };
        let mut renderer = Renderer::new(ctx.clone(), &options).context("failed to create renderer")?;
        renderer.set_print_graph(config.debug.print_graph);
        if let Some(ms) = config.fixed_frame_time_ms {
            let frame_time = Duration::try_from_secs_f32(ms.max(0.0) / 1000.0)
                .with_context(|| format!("fixed frame time {ms}ms is out of range"))?;
            renderer.set_clock(Box::new(FixedClock(frame_time)));
        }
        let events = renderer.subscribe();

        let target = PresentationTarget::new(
            &ctx,
            config.extent(),
            FrameSettings::DEFAULT_OUTPUT_FORMAT,
            "presentation-target",
        )?;
        let stats = ["stats-A", "stats-B"]
            .into_iter()
            .map(|name| StatsReadback::new(ctx.backend(), name))
            .collect::<Result<Vec<_>, _>>()?;

        {
            let _span = tracy_client::span!("HeadlessApp::init");
            outer_app.init(&mut renderer, &config)?;
        }

        Ok(Self {
            config,
            ctx,
            renderer,
            target: Some(target),
            stats,
            events,
            report,
            outer_app: Some(outer_app),
        })
    }
}

// getters
impl HeadlessSession {
    #[inline]
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    #[inline]
    pub fn report(&self) -> &SessionReport {
        &self.report
    }
}

// update
impl HeadlessSession {
    /// 渲染配置中的所有帧，结束后等待 GPU 空闲并写出报告
    pub fn run(&mut self) -> anyhow::Result<&SessionReport> {
        log::info!(
            "session start: {} frames at {}x{}",
            self.config.frames,
            self.config.width,
            self.config.height
        );
        for frame in 0..self.config.frames {
            if let Some(step) = self.config.resize_before(frame).copied() {
                self.resize(step.extent())?;
            }
            if let Some(app) = self.outer_app.as_mut() {
                let _span = tracy_client::span!("HeadlessApp::update");
                app.update(&mut self.renderer, frame)?;
            }

            let report = self.render_frame().with_context(|| format!("frame {frame} failed"))?;
            if let Some(app) = self.outer_app.as_mut() {
                app.on_frame(&report);
            }
            self.drain_events();

            tracy_client::frame_mark();
        }

        self.renderer.wait_idle()?;
        self.drain_events();
        log::info!(
            "session end: {} frames, scene {}, final effort {:.4}",
            self.report.frames.len(),
            self.renderer.scene_state().label(),
            self.report.final_effort().unwrap_or_default()
        );

        if let Some(path) = &self.config.report_path {
            self.report.write(path)?;
        }
        Ok(&self.report)
    }

    fn render_frame(&mut self) -> anyhow::Result<FrameReport> {
        let target = self.target.as_ref().context("presentation target missing")?;
        let stats = &self.stats[*self.renderer.frame_counter().frame_label()];

        let mut stream = self.ctx.stream_pool().acquire()?;
        match self.renderer.render(&mut stream, target, stats, &self.config.output) {
            Ok(report) => {
                self.renderer.submit(stream)?;
                Ok(report)
            }
            Err(e) => {
                self.ctx.stream_pool().release(stream);
                Err(e.into())
            }
        }
    }

    /// 新的呈现目标在下一帧被渲染器发现，旧的交给 deferred destroy
    fn resize(&mut self, extent: vk::Extent2D) -> anyhow::Result<()> {
        log::info!("resizing presentation target to {}x{}", extent.width, extent.height);
        let target = PresentationTarget::new(&self.ctx, extent, FrameSettings::DEFAULT_OUTPUT_FORMAT, "presentation-target")?;
        if let Some(old) = self.target.replace(target) {
            self.renderer.retire_target(old);
        }
        if let Some(app) = self.outer_app.as_mut() {
            app.on_resized(&mut self.renderer, extent);
        }
        Ok(())
    }

    fn drain_events(&mut self) {
        for event in self.events.try_iter() {
            self.report.record(event);
        }
    }
}

// destroy
impl HeadlessSession {
    pub fn destroy(mut self) -> SessionReport {
        if let Err(e) = self.renderer.wait_idle() {
            log::error!("wait idle failed on session teardown: {}", e);
        }

        self.outer_app = None;
        if let Some(target) = self.target.take() {
            self.renderer.retire_target(target);
        }
        for stats in self.stats.drain(..) {
            stats.destroy(self.ctx.backend());
        }
        drop(self.renderer);

        log::info!("session destroyed.");
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResizeStep;
    use crate::outer_app::async_load_app::AsyncLoadApp;
    use crate::outer_app::procedural_app::ProceduralApp;
    use lumen_gfx::headless::{HeadlessBackend, HeadlessConfig};
    use lumen_renderer::temporal::InvalidationCause;
    use lumen_scene::loader::ProceduralSceneParams;

    /// 每帧等待 1ms，给加载线程留出时间
    struct Paced<A>(A);

    impl<A: HeadlessApp> HeadlessApp for Paced<A> {
        fn init(&mut self, renderer: &mut Renderer, config: &AppConfig) -> anyhow::Result<()> {
            self.0.init(renderer, config)
        }

        fn update(&mut self, renderer: &mut Renderer, frame: u32) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(1));
            self.0.update(renderer, frame)
        }

        fn on_frame(&mut self, report: &FrameReport) {
            self.0.on_frame(report);
        }
    }

    fn session(config: AppConfig, app: Box<dyn HeadlessApp>) -> (Arc<HeadlessBackend>, HeadlessSession) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let session = HeadlessSession::with_backend(config, backend.clone(), app).unwrap();
        (backend, session)
    }

    #[test]
    fn test_session_with_resize_has_no_hazards() {
        let config = AppConfig {
            width: 48,
            height: 32,
            frames: 12,
            resize_at: vec![ResizeStep {
                frame: 8,
                width: 64,
                height: 48,
            }],
            ..Default::default()
        };
        let (backend, mut session) = session(config, Box::new(ProceduralApp::default()));
        session.run().unwrap();

        let report = session.destroy();
        assert_eq!(report.frames.len(), 12);
        assert_eq!(report.resizes, [[64, 48]]);
        assert!(report.frames[8].resized);
        assert!(
            report
                .invalidations
                .iter()
                .any(|record| record.frame == 8 && record.cause == InvalidationCause::Resize)
        );
        assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());
        assert_eq!(backend.live_image_count(), 0);
    }

    #[test]
    fn test_camera_orbit_invalidates_every_frame() {
        let config = AppConfig {
            width: 16,
            height: 16,
            frames: 40,
            camera_orbit_deg: 2.0,
            ..Default::default()
        };
        let (_backend, mut session) = session(config, Box::new(Paced(ProceduralApp::default())));
        session.run().unwrap();

        let report = session.destroy();
        // 场景就绪之后相机每帧都在动，history 从来不会稳定
        let ready = report.frames.iter().filter(|f| f.scene_state == "ready").collect::<Vec<_>>();
        assert!(ready.len() > 2);
        assert!(ready.iter().skip(1).all(|f| f.blend_weight == 0.0));
    }

    #[test]
    fn test_async_load_shows_loading_frames_first() {
        let config = AppConfig {
            width: 16,
            height: 16,
            frames: 300,
            scene: ProceduralSceneParams {
                load_delay_ms: 30,
                ..Default::default()
            },
            fixed_frame_time_ms: Some(16.0),
            ..Default::default()
        };
        let (backend, mut session) = session(config, Box::new(Paced(AsyncLoadApp::default())));
        session.run().unwrap();

        let report = session.destroy();
        assert_eq!(report.frames[0].scene_state, "loading");
        assert!(report.scene.is_some(), "scene never became ready");
        assert!(report.frames.iter().any(|f| f.scene_state == "ready"));
        assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());
    }

    #[test]
    fn test_failed_scene_is_reported() {
        let config = AppConfig {
            width: 16,
            height: 16,
            frames: 200,
            scene: ProceduralSceneParams {
                fail: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (_backend, mut session) = session(config, Box::new(Paced(ProceduralApp::default())));
        session.run().unwrap();

        let report = session.destroy();
        assert!(report.scene.is_none());
        assert!(report.scene_error.as_deref().unwrap().contains("configured to fail"));
    }
}
