use std::time::Instant;

use lumen_renderer::renderer::{FrameReport, Renderer};
use lumen_scene::loader::{ProceduralSceneLoader, ProceduralSceneParams};

use crate::config::AppConfig;
use crate::outer_app::HeadlessApp;

/// 模拟耗时的场景加载
///
/// 场景就绪之前每帧输出 loading 画面，就绪之后让第一个 cube 上下浮动，触发 TLAS 重建
#[derive(Default)]
pub struct AsyncLoadApp {
    loading_frames: u32,
    started: Option<Instant>,
    bounce_instance: Option<usize>,
}

impl AsyncLoadApp {
    /// 配置中没有设置延迟时使用
    const DEFAULT_DELAY_MS: u64 = 200;

    #[inline]
    pub fn loading_frames(&self) -> u32 {
        self.loading_frames
    }
}

impl HeadlessApp for AsyncLoadApp {
    fn init(&mut self, renderer: &mut Renderer, config: &AppConfig) -> anyhow::Result<()> {
        log::info!("Async Load app init.");
        let params = ProceduralSceneParams {
            load_delay_ms: if config.scene.load_delay_ms > 0 {
                config.scene.load_delay_ms
            } else {
                Self::DEFAULT_DELAY_MS
            },
            ..config.scene.clone()
        };
        renderer.load_scene(Box::new(ProceduralSceneLoader::new(params)))?;
        self.started = Some(Instant::now());
        Ok(())
    }

    fn update(&mut self, renderer: &mut Renderer, frame: u32) -> anyhow::Result<()> {
        if self.bounce_instance.is_none() {
            let instance_count = renderer.scene_state().ready().map_or(0, |scene| scene.accel.instances().len());
            // 0 号是地面
            if instance_count > 1 {
                self.bounce_instance = Some(1);
            }
        }
        let Some(instance) = self.bounce_instance else {
            return Ok(());
        };
        let height = 0.5 + 0.25 * (frame as f32 * 0.2).sin();
        let transform = glam::Mat4::from_translation(glam::vec3(0.0, height, 0.0));
        renderer.set_instance_transform(instance, transform)?;
        Ok(())
    }

    fn on_frame(&mut self, report: &FrameReport) {
        if report.scene_state == "loading" {
            self.loading_frames += 1;
        } else if report.scene_state == "ready"
            && let Some(started) = self.started.take()
        {
            log::info!(
                "scene visible after {} loading frames ({:.1} ms)",
                self.loading_frames,
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
    }
}
