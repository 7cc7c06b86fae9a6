use ash::vk;

use lumen_renderer::renderer::{FrameReport, Renderer};

use crate::config::AppConfig;

pub mod async_load_app;
pub mod procedural_app;

/// 外部应用接口 trait
///
/// 定义 session 生命周期的关键钩子函数。所有自定义应用需实现此 trait。
pub trait HeadlessApp {
    /// 开始加载场景、注册 pre-dispatch hook 等
    fn init(&mut self, renderer: &mut Renderer, config: &AppConfig) -> anyhow::Result<()>;

    /// 每帧渲染之前调用（可选）
    fn update(&mut self, _renderer: &mut Renderer, _frame: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// 每帧提交之后调用（可选）
    fn on_frame(&mut self, _report: &FrameReport) {}

    /// 呈现目标改变大小之后调用（可选）
    fn on_resized(&mut self, _renderer: &mut Renderer, _extent: vk::Extent2D) {}
}
