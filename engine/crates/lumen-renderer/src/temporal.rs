//! 跨帧的 temporal 状态
//!
//! 每一对 history（颜色 + moments）都有自己的状态机：
//!
//! ```text
//! Invalid ──写入──▶ Populated ──失效──▶ Stale ──写入──▶ Populated
//! ```
//!
//! 只有 `Populated` 的 history 会参与混合，其他状态下混合权重为 0，本帧直接覆盖。

use lumen_render_interface::output_settings::{OutputChannel, OutputSettings};
use lumen_scene::camera::Camera;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum HistoryState {
    /// 刚分配，内容未定义
    #[default]
    Invalid,
    Populated,
    /// 失效之后内容保留，但不再参与混合
    Stale,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryPair {
    state: HistoryState,
}

impl HistoryPair {
    #[inline]
    pub fn state(&self) -> HistoryState {
        self.state
    }

    /// 只有已经写入过的 history 会变为 `Stale`
    pub fn invalidate(&mut self) {
        if self.state == HistoryState::Populated {
            self.state = HistoryState::Stale;
        }
    }

    /// 本帧写入之后调用
    #[inline]
    pub fn mark_written(&mut self) {
        self.state = HistoryState::Populated;
    }

    /// 重新分配之后调用
    #[inline]
    pub fn reset(&mut self) {
        self.state = HistoryState::Invalid;
    }

    #[inline]
    pub fn is_usable(&self) -> bool {
        self.state == HistoryState::Populated
    }
}

/// 两次 temporal accumulation 各自的 history
#[derive(Clone, Copy, Debug, Default)]
pub struct TemporalState {
    /// stage 2：accumulated + moments
    pub accumulation: HistoryPair,
    /// stage 5：composite history + composite moments
    pub composite: HistoryPair,
}

impl TemporalState {
    pub fn invalidate(&mut self) {
        self.accumulation.invalidate();
        self.composite.invalidate();
    }

    pub fn reset(&mut self) {
        self.accumulation.reset();
        self.composite.reset();
    }

    pub fn mark_written(&mut self) {
        self.accumulation.mark_written();
        self.composite.mark_written();
    }

    /// 本帧 stage 2 使用的混合权重
    pub fn blend_weight(&self, settings: &OutputSettings) -> f32 {
        Self::weight_for(&self.accumulation, settings)
    }

    /// 本帧 stage 5 使用的混合权重
    pub fn composite_blend_weight(&self, settings: &OutputSettings) -> f32 {
        Self::weight_for(&self.composite, settings)
    }

    fn weight_for(pair: &HistoryPair, settings: &OutputSettings) -> f32 {
        if pair.is_usable() { settings.steady_blend_weight() } else { 0.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum InvalidationCause {
    Camera,
    Scene,
    OutputMode,
    Resize,
}

/// 上一帧观察到的输入
#[derive(Clone, Copy, Debug, PartialEq)]
struct Observed {
    camera: Camera,
    scene_generation: Option<u64>,
    channel: OutputChannel,
    continuous: bool,
}

/// 比较相邻两帧的相机、场景和输出模式
#[derive(Default)]
pub struct HistoryInvalidator {
    last: Option<Observed>,
}

impl HistoryInvalidator {
    /// 记录本帧的输入，返回需要失效的原因
    ///
    /// 第一次调用只记录，不会返回失效，此时 history 本来就是 `Invalid`
    ///
    /// # 参数
    /// - `scene_generation`: 场景可用时的 TLAS 版本，场景切换或 transform 更新都会改变
    pub fn observe(
        &mut self,
        camera: &Camera,
        scene_generation: Option<u64>,
        settings: &OutputSettings,
    ) -> Option<InvalidationCause> {
        let current = Observed {
            camera: *camera,
            scene_generation,
            channel: settings.channel,
            continuous: settings.continuous,
        };
        let cause = self.last.as_ref().and_then(|last| {
            if last.scene_generation != current.scene_generation {
                Some(InvalidationCause::Scene)
            } else if last.camera != current.camera {
                Some(InvalidationCause::Camera)
            } else if last.channel != current.channel || last.continuous != current.continuous {
                Some(InvalidationCause::OutputMode)
            } else {
                None
            }
        });
        self.last = Some(current);
        cause
    }

    /// 下一次 `observe` 重新开始
    pub fn forget(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let mut pair = HistoryPair::default();
        assert_eq!(pair.state(), HistoryState::Invalid);

        // Invalid 失效之后仍然是 Invalid
        pair.invalidate();
        assert_eq!(pair.state(), HistoryState::Invalid);

        pair.mark_written();
        assert_eq!(pair.state(), HistoryState::Populated);
        pair.invalidate();
        assert_eq!(pair.state(), HistoryState::Stale);
        pair.mark_written();
        assert!(pair.is_usable());

        pair.reset();
        assert_eq!(pair.state(), HistoryState::Invalid);
    }

    #[test]
    fn test_blend_weight_follows_state() {
        let settings = OutputSettings {
            temporal_blend: 0.93,
            ..Default::default()
        };
        let mut state = TemporalState::default();
        assert_eq!(state.blend_weight(&settings), 0.0);

        state.mark_written();
        assert_eq!(state.blend_weight(&settings), 0.93);
        assert_eq!(state.composite_blend_weight(&settings), 0.93);

        state.invalidate();
        assert_eq!(state.blend_weight(&settings), 0.0);
        assert_eq!(state.composite_blend_weight(&settings), 0.0);
    }

    #[test]
    fn test_invalidator_causes() {
        let mut settings = OutputSettings::default();
        let mut camera = Camera::default();
        let mut invalidator = HistoryInvalidator::default();

        assert_eq!(invalidator.observe(&camera, Some(0), &settings), None);
        assert_eq!(invalidator.observe(&camera, Some(0), &settings), None);

        camera.orbit(5.0);
        assert_eq!(invalidator.observe(&camera, Some(0), &settings), Some(InvalidationCause::Camera));

        assert_eq!(invalidator.observe(&camera, Some(1), &settings), Some(InvalidationCause::Scene));

        settings.channel = OutputChannel::Albedo;
        assert_eq!(invalidator.observe(&camera, Some(1), &settings), Some(InvalidationCause::OutputMode));

        settings.continuous = !settings.continuous;
        assert_eq!(invalidator.observe(&camera, Some(1), &settings), Some(InvalidationCause::OutputMode));

        // blend 权重的改变不会使 history 失效
        settings.temporal_blend = 0.95;
        assert_eq!(invalidator.observe(&camera, Some(1), &settings), None);
    }
}
