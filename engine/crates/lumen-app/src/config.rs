use std::path::{Path, PathBuf};

use anyhow::Context;
use ash::vk;

use lumen_gfx::backend::BackendKind;
use lumen_render_interface::output_settings::OutputSettings;
use lumen_renderer::context::RendererConfig;
use lumen_renderer::convergence::ConvergenceSettings;
use lumen_scene::loader::ProceduralSceneParams;

/// 在第 `frame` 帧之前把呈现目标改为新的大小
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResizeStep {
    pub frame: u32,
    pub width: u32,
    pub height: u32,
}

impl ResizeStep {
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// 打印一次 graph 的执行计划
    pub print_graph: bool,
    /// 只对 vulkan 后端有效
    pub validation: bool,
}

/// 一次 session 的全部配置，从 toml 读取
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    /// 渲染的总帧数
    pub frames: u32,
    pub resize_at: Vec<ResizeStep>,
    pub scene: ProceduralSceneParams,
    pub output: OutputSettings,
    pub renderer: RendererConfig,
    pub convergence: ConvergenceSettings,
    /// 编译好的 SPIR-V 所在目录
    pub shader_dir: Option<PathBuf>,
    pub debug: DebugConfig,
    /// session 结束后写出 JSON 报告
    pub report_path: Option<PathBuf>,
    /// 每帧相机绕场景中心旋转的角度
    pub camera_orbit_deg: f32,
    /// 设置时每帧按固定耗时反馈给收敛控制器
    pub fixed_frame_time_ms: Option<f32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Headless,
            width: 320,
            height: 240,
            frames: 120,
            resize_at: vec![],
            scene: ProceduralSceneParams::default(),
            output: OutputSettings::default(),
            renderer: RendererConfig::default(),
            convergence: ConvergenceSettings::default(),
            shader_dir: None,
            debug: DebugConfig::default(),
            report_path: None,
            camera_orbit_deg: 0.0,
            fixed_frame_time_ms: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))?;
        log::info!("config loaded from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        anyhow::ensure!(config.width > 0 && config.height > 0, "output extent must not be empty");
        anyhow::ensure!(
            config.resize_at.iter().all(|step| step.width > 0 && step.height > 0),
            "resize_at contains an empty extent"
        );
        anyhow::ensure!(
            config.fixed_frame_time_ms.is_none_or(|ms| ms.is_finite() && ms >= 0.0),
            "fixed_frame_time_ms must be a finite, non-negative number"
        );
        config.resize_at.sort_by_key(|step| step.frame);
        Ok(config)
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// 第 `frame` 帧之前需要应用的 resize
    pub fn resize_before(&self, frame: u32) -> Option<&ResizeStep> {
        self.resize_at.iter().find(|step| step.frame == frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_render_interface::output_settings::DispatchMode;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = AppConfig::parse(
            r#"
            frames = 8
            camera_orbit_deg = 1.5

            [[resize_at]]
            frame = 6
            width = 64
            height = 64

            [[resize_at]]
            frame = 3
            width = 128
            height = 96

            [output]
            dispatch_mode = "software"

            [debug]
            print_graph = true
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Headless);
        assert_eq!(config.frames, 8);
        assert_eq!(config.output.dispatch_mode, DispatchMode::Software);
        assert!(config.output.continuous);
        assert!(config.debug.print_graph);
        assert_eq!(config.renderer, RendererConfig::default());

        // 按帧排序
        assert_eq!(config.resize_at[0].frame, 3);
        assert_eq!(config.resize_before(6).unwrap().extent(), vk::Extent2D { width: 64, height: 64 });
        assert!(config.resize_before(4).is_none());
    }

    #[test]
    fn test_empty_extent_is_rejected() {
        assert!(AppConfig::parse("width = 0").is_err());
        assert!(AppConfig::parse("[[resize_at]]\nframe = 1\nwidth = 0\nheight = 4").is_err());
    }

    #[test]
    fn test_fixed_frame_time_must_be_finite() {
        assert!(AppConfig::parse("fixed_frame_time_ms = inf").is_err());
        assert!(AppConfig::parse("fixed_frame_time_ms = nan").is_err());
        assert!(AppConfig::parse("fixed_frame_time_ms = -4.0").is_err());
        let config = AppConfig::parse("fixed_frame_time_ms = 16.5").unwrap();
        assert_eq!(config.fixed_frame_time_ms, Some(16.5));
    }

    #[test]
    fn test_missing_file_names_path() {
        let path = std::env::temp_dir().join("lumen-missing-config.toml");
        let message = format!("{:#}", AppConfig::load(&path).unwrap_err());
        assert!(message.contains("lumen-missing-config.toml"));
    }
}
