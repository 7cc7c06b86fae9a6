//! 收敛控制器
//!
//! 以帧时间为反馈调节 effort。effort 只进入 stage 1 的收敛阈值常量，不影响正确性。

use std::time::{Duration, Instant};

use lumen_render_interface::output_settings::OutputSettings;
use lumen_render_interface::stats::FrameStats;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConvergenceSettings {
    /// 每隔多少帧调整一次
    pub window_frames: u32,
    /// 相对误差在这个范围内不做调整
    pub tolerance: f32,
    pub initial_effort: f32,
    pub initial_step: f32,
    pub min_step: f32,
    pub max_step: f32,
    /// 单次调整相对于当前 effort 的上限
    pub max_change_fraction: f32,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            window_frames: 16,
            tolerance: 0.1,
            initial_effort: 1.0,
            initial_step: 0.1,
            min_step: 0.01,
            max_step: 1.0,
            max_change_fraction: 0.25,
        }
    }
}

/// 一次调整的结果
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct EffortUpdate {
    pub average_frame_time: Duration,
    pub error: f32,
    pub delta: f32,
    pub effort: f32,
}

pub struct ConvergenceController {
    settings: ConvergenceSettings,
    target_frame_time: Duration,

    effort: f32,
    step: f32,
    /// 上一次调整的方向，0 表示还没有调整过
    last_direction: i8,

    window_sum: Duration,
    window_len: u32,

    samples_rendered: u64,
    last_invalidation: Instant,
    last_stats: Option<FrameStats>,
}

// new & init
impl ConvergenceController {
    pub fn new(settings: ConvergenceSettings, target_frame_time: Duration) -> Self {
        Self {
            effort: settings.initial_effort.max(0.0),
            step: settings.initial_step.clamp(settings.min_step, settings.max_step),
            last_direction: 0,
            window_sum: Duration::ZERO,
            window_len: 0,
            samples_rendered: 0,
            last_invalidation: Instant::now(),
            last_stats: None,
            target_frame_time,
            settings,
        }
    }

    /// 目标帧率改变时调用，当前窗口会被丢弃
    pub fn set_target(&mut self, target_frame_time: Duration) {
        if self.target_frame_time != target_frame_time {
            log::debug!("convergence target changed to {:?}", target_frame_time);
            self.target_frame_time = target_frame_time;
            self.window_sum = Duration::ZERO;
            self.window_len = 0;
        }
    }
}

// feedback
impl ConvergenceController {
    /// 记录一帧的耗时，窗口满时调整 effort
    pub fn record_frame(&mut self, frame_time: Duration) -> Option<EffortUpdate> {
        self.window_sum += frame_time;
        self.window_len += 1;
        if self.window_len < self.settings.window_frames.max(1) {
            return None;
        }

        let average = self.window_sum / self.window_len;
        self.window_sum = Duration::ZERO;
        self.window_len = 0;

        let target = self.target_frame_time.as_secs_f32();
        if target <= 0.0 {
            return None;
        }
        let error = (average.as_secs_f32() - target) / target;
        if error.abs() <= self.settings.tolerance {
            return None;
        }

        // 太慢时降低 effort
        let direction: i8 = if error > 0.0 { -1 } else { 1 };
        if self.last_direction != 0 && direction != self.last_direction {
            self.step *= 0.5;
        } else {
            self.step *= (1.0 + error.abs()).min(2.0);
        }
        self.step = self.step.clamp(self.settings.min_step, self.settings.max_step);
        self.last_direction = direction;

        let cap = (self.effort * self.settings.max_change_fraction)
            .max(self.settings.min_step)
            .min(self.settings.max_step);
        let delta = (direction as f32 * self.step).clamp(-cap, cap);
        let previous = self.effort;
        self.effort = (self.effort + delta).max(0.0);

        let update = EffortUpdate {
            average_frame_time: average,
            error,
            delta: self.effort - previous,
            effort: self.effort,
        };
        log::debug!(
            "convergence: avg {:.2}ms, error {:+.3}, effort {:.4} -> {:.4}",
            average.as_secs_f64() * 1000.0,
            error,
            previous,
            self.effort
        );
        Some(update)
    }

    pub fn record_stats(&mut self, stats: FrameStats) {
        self.last_stats = Some(stats);
    }

    #[inline]
    pub fn add_sample(&mut self) {
        self.samples_rendered += 1;
    }

    /// history 失效时调用，只重置采样计数和时间，effort 保持不变
    pub fn on_invalidate(&mut self, now: Instant) {
        self.samples_rendered = 0;
        self.last_invalidation = now;
    }

    /// 采样数或时间达到调试上限
    pub fn limits_reached(&self, settings: &OutputSettings, now: Instant) -> bool {
        let samples = settings.max_samples.is_some_and(|max| self.samples_rendered >= max);
        let seconds = settings
            .max_seconds
            .is_some_and(|max| now.saturating_duration_since(self.last_invalidation).as_secs_f32() >= max);
        samples || seconds
    }
}

// getters
impl ConvergenceController {
    #[inline]
    pub fn effort(&self) -> f32 {
        self.effort
    }

    #[inline]
    pub fn step(&self) -> f32 {
        self.step
    }

    #[inline]
    pub fn samples_rendered(&self) -> u64 {
        self.samples_rendered
    }

    #[inline]
    pub fn last_invalidation(&self) -> Instant {
        self.last_invalidation
    }

    #[inline]
    pub fn target_frame_time(&self) -> Duration {
        self.target_frame_time
    }

    #[inline]
    pub fn last_stats(&self) -> Option<FrameStats> {
        self.last_stats
    }

    /// 最近一次读回的统计中没有活跃像素
    #[inline]
    pub fn is_converged(&self) -> bool {
        self.last_stats.is_some_and(|stats| stats.is_converged())
    }

    #[inline]
    pub fn settings(&self) -> &ConvergenceSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const TARGET: Duration = Duration::from_micros(16_667);

    #[test]
    fn test_too_slow_lowers_effort_within_cap() {
        let settings = ConvergenceSettings::default();
        let mut controller = ConvergenceController::new(settings.clone(), TARGET);

        let mut updates = Vec::new();
        for _ in 0..64 {
            let before = controller.effort();
            if let Some(update) = controller.record_frame(TARGET * 2) {
                let cap = (before * settings.max_change_fraction).max(settings.min_step).min(settings.max_step);
                assert!(update.delta <= 0.0);
                assert!(update.delta.abs() <= cap + 1e-6);
                updates.push(update);
            }
            assert!(controller.effort() >= 0.0);
        }

        // 64 帧，每 16 帧一次
        assert_eq!(updates.len(), 4);
        assert!(controller.effort() < settings.initial_effort);
        assert!(updates.windows(2).all(|w| w[1].effort <= w[0].effort));
    }

    #[test]
    fn test_inside_band_keeps_effort() {
        let mut controller = ConvergenceController::new(ConvergenceSettings::default(), TARGET);
        for _ in 0..32 {
            assert!(controller.record_frame(TARGET.mul_f32(1.05)).is_none());
        }
        assert_eq!(controller.effort(), 1.0);
    }

    #[test]
    fn test_direction_reversal_halves_step() {
        let settings = ConvergenceSettings {
            window_frames: 1,
            ..Default::default()
        };
        let mut controller = ConvergenceController::new(settings, TARGET);

        controller.record_frame(TARGET * 2).unwrap();
        let step_after_slow = controller.step();
        controller.record_frame(TARGET / 2).unwrap();
        assert!((controller.step() - step_after_slow * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_effort_settles_when_frame_time_follows_effort() {
        // 帧时间与 effort 成正比，effort 为 0.47 时正好达到目标
        let frame_time = |effort: f32| TARGET.mul_f32(effort / 0.47);
        let settings = ConvergenceSettings::default();
        let mut controller = ConvergenceController::new(settings.clone(), TARGET);

        let mut updates = Vec::new();
        let mut last_update_frame = 0;
        for frame in 0..settings.window_frames * 40 {
            if let Some(update) = controller.record_frame(frame_time(controller.effort())) {
                updates.push(update);
                last_update_frame = frame;
            }
        }

        // 先单调下降，然后停在容差范围内
        assert!(!updates.is_empty());
        assert!(updates.iter().all(|u| u.delta < 0.0 && u.error > 0.0), "{updates:?}");
        assert!(last_update_frame < settings.window_frames * 8, "still adjusting at frame {last_update_frame}");

        let target = TARGET.as_secs_f32();
        let error = (frame_time(controller.effort()).as_secs_f32() - target) / target;
        assert!(error.abs() <= settings.tolerance, "settled at effort {} with error {error}", controller.effort());
    }

    #[test]
    fn test_effort_is_bounded_for_random_frame_times() {
        let settings = ConvergenceSettings {
            window_frames: 4,
            ..Default::default()
        };
        let mut controller = ConvergenceController::new(settings.clone(), TARGET);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..4096 {
            let before = controller.effort();
            let frame_time = TARGET.mul_f32(rng.gen_range(0.1..4.0));
            if let Some(update) = controller.record_frame(frame_time) {
                let cap = (before * settings.max_change_fraction).max(settings.min_step).min(settings.max_step);
                assert!(update.delta.abs() <= cap + 1e-6, "{update:?} exceeds {cap}");
            }
            assert!(controller.effort() >= 0.0);
            assert!(controller.step() >= settings.min_step && controller.step() <= settings.max_step);
        }
    }

    #[test]
    fn test_invalidate_resets_samples_not_effort() {
        let settings = ConvergenceSettings {
            window_frames: 1,
            ..Default::default()
        };
        let mut controller = ConvergenceController::new(settings, TARGET);
        controller.record_frame(TARGET * 3);
        let effort = controller.effort();
        for _ in 0..5 {
            controller.add_sample();
        }

        let now = Instant::now();
        controller.on_invalidate(now);
        assert_eq!(controller.samples_rendered(), 0);
        assert_eq!(controller.last_invalidation(), now);
        assert_eq!(controller.effort(), effort);
    }

    #[test]
    fn test_limits() {
        let mut controller = ConvergenceController::new(ConvergenceSettings::default(), TARGET);
        let settings = OutputSettings {
            max_samples: Some(2),
            ..Default::default()
        };
        let now = Instant::now();
        assert!(!controller.limits_reached(&settings, now));
        controller.add_sample();
        controller.add_sample();
        assert!(controller.limits_reached(&settings, now));

        let timed = OutputSettings {
            max_seconds: Some(1.0),
            ..Default::default()
        };
        controller.on_invalidate(now);
        assert!(!controller.limits_reached(&timed, now));
        assert!(controller.limits_reached(&timed, now + Duration::from_secs(2)));

        controller.record_stats(FrameStats::default());
        assert!(controller.is_converged());
    }
}
