use lumen_renderer::renderer::Renderer;
use lumen_scene::loader::ProceduralSceneLoader;

use crate::config::AppConfig;
use crate::outer_app::HeadlessApp;

/// 加载程序化场景，相机按配置绕场景旋转
#[derive(Default)]
pub struct ProceduralApp {
    orbit_deg: f32,
}

impl HeadlessApp for ProceduralApp {
    fn init(&mut self, renderer: &mut Renderer, config: &AppConfig) -> anyhow::Result<()> {
        log::info!("Procedural app init.");
        self.orbit_deg = config.camera_orbit_deg;
        renderer.load_scene(Box::new(ProceduralSceneLoader::new(config.scene.clone())))?;
        Ok(())
    }

    fn update(&mut self, renderer: &mut Renderer, _frame: u32) -> anyhow::Result<()> {
        if self.orbit_deg != 0.0 && renderer.scene_state().ready().is_some() {
            renderer.orbit_camera(self.orbit_deg);
        }
        Ok(())
    }
}
