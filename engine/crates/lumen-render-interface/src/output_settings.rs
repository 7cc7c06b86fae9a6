use std::time::Duration;

use ash::vk;

/// 最终输出的通道
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputChannel {
    #[default]
    Lit,
    Albedo,
    Normals,
    Variance,
    /// 可视化 stage 1 中仍然活跃的像素
    LivePixelDebug,
    /// 可视化 stage 1 中仍然活跃的 wave
    LiveWaveDebug,
}
impl OutputChannel {
    /// 传给 post-process kernel 的编号
    #[inline]
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// 降噪设置
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DenoiseSettings {
    /// 是否启用降噪
    pub enabled: bool,
    /// wavelet 的迭代次数，每次迭代的步长翻倍
    pub iterations: u32,
    /// 亮度差异的 sigma
    pub sigma_luminance: f32,
    /// 法线差异的 sigma
    pub sigma_normal: f32,
    /// 世界空间位置差异的 sigma
    pub sigma_position: f32,
}
impl Default for DenoiseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            iterations: 4,
            sigma_luminance: 4.0,
            sigma_normal: 128.0,
            sigma_position: 1.0,
        }
    }
}

/// stage 1 的调度方式
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// 设备支持时使用硬件光追
    #[default]
    Auto,
    Hardware,
    /// compute 模拟的遍历
    Software,
}

#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UpscaleSettings {
    pub enabled: bool,
    /// 输出分辨率 / 渲染分辨率
    pub factor: f32,
}
impl Default for UpscaleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: 2.0,
        }
    }
}

/// 每帧传给 `Renderer::render` 的输出设置
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub channel: OutputChannel,
    pub denoise: DenoiseSettings,
    /// 稳定状态下的 temporal 混合权重
    pub temporal_blend: f32,
    /// 开启时运行两次 temporal accumulation
    pub continuous: bool,
    pub target_fps: f32,
    /// 达到之后 stage 1 不再 dispatch，后续 stage 照常运行
    pub max_samples: Option<u64>,
    pub max_seconds: Option<f32>,
    pub upscale: UpscaleSettings,
    pub dispatch_mode: DispatchMode,
}
impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            channel: OutputChannel::Lit,
            denoise: DenoiseSettings::default(),
            temporal_blend: 0.9,
            continuous: true,
            target_fps: 60.0,
            max_samples: None,
            max_seconds: None,
            upscale: UpscaleSettings::default(),
            dispatch_mode: DispatchMode::Auto,
        }
    }
}
impl OutputSettings {
    pub const MIN_BLEND: f32 = 0.9;
    pub const MAX_BLEND: f32 = 0.95;

    #[inline]
    pub fn steady_blend_weight(&self) -> f32 {
        self.temporal_blend.clamp(Self::MIN_BLEND, Self::MAX_BLEND)
    }

    #[inline]
    pub fn target_frame_time(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.target_fps.max(1.0))
    }

    #[inline]
    pub fn upscaler_active(&self) -> bool {
        self.upscale.enabled && self.upscale.factor > 1.0
    }
}

/// 帧级渲染配置
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameSettings {
    pub color_format: vk::Format,
    /// 呈现目标的格式
    pub output_format: vk::Format,
    /// stage 1 ~ 6 的分辨率
    pub render_extent: vk::Extent2D,
    /// 呈现目标的分辨率
    pub output_extent: vk::Extent2D,
}
impl FrameSettings {
    pub const DEFAULT_COLOR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
    pub const DEFAULT_OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    pub fn new(output_extent: vk::Extent2D, output_format: vk::Format, settings: &OutputSettings) -> Self {
        let render_extent = if settings.upscaler_active() {
            vk::Extent2D {
                width: ((output_extent.width as f32 / settings.upscale.factor) as u32).max(1),
                height: ((output_extent.height as f32 / settings.upscale.factor) as u32).max(1),
            }
        } else {
            output_extent
        };
        Self {
            color_format: Self::DEFAULT_COLOR_FORMAT,
            output_format,
            render_extent,
            output_extent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_weight_is_clamped() {
        let mut settings = OutputSettings::default();
        assert_eq!(settings.steady_blend_weight(), 0.9);
        settings.temporal_blend = 0.99;
        assert_eq!(settings.steady_blend_weight(), 0.95);
        settings.temporal_blend = 0.5;
        assert_eq!(settings.steady_blend_weight(), 0.9);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: OutputSettings = toml::from_str(
            r#"
            channel = "live-pixel-debug"
            continuous = false
            max_samples = 128

            [denoise]
            iterations = 2
            "#,
        )
        .unwrap();
        assert_eq!(settings.channel, OutputChannel::LivePixelDebug);
        assert!(!settings.continuous);
        assert_eq!(settings.max_samples, Some(128));
        assert_eq!(settings.denoise.iterations, 2);
        assert!(settings.denoise.enabled);
        assert_eq!(settings.dispatch_mode, DispatchMode::Auto);
    }

    #[test]
    fn test_render_extent_follows_upscale_factor() {
        let mut settings = OutputSettings::default();
        let output = vk::Extent2D { width: 1920, height: 1080 };
        let frame = FrameSettings::new(output, FrameSettings::DEFAULT_OUTPUT_FORMAT, &settings);
        assert_eq!(frame.render_extent, output);

        settings.upscale.enabled = true;
        let frame = FrameSettings::new(output, FrameSettings::DEFAULT_OUTPUT_FORMAT, &settings);
        assert_eq!(frame.render_extent, vk::Extent2D { width: 960, height: 540 });
    }
}
