use std::path::Path;

use anyhow::Context;

use lumen_gfx::backend::BackendKind;
use lumen_renderer::renderer::{FrameReport, RendererEvent};
use lumen_renderer::temporal::InvalidationCause;

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SceneSummary {
    pub name: String,
    pub instance_count: usize,
    pub load_ms: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct InvalidationRecord {
    /// 发生在第几个渲染的帧（从 0 开始）
    pub frame: usize,
    pub cause: InvalidationCause,
}

/// 一次 session 的结果，结束时写成 JSON
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionReport {
    pub backend: BackendKind,
    pub device: String,
    pub scene: Option<SceneSummary>,
    pub scene_error: Option<String>,
    pub invalidations: Vec<InvalidationRecord>,
    pub resizes: Vec<[u32; 2]>,
    pub frames: Vec<FrameReport>,
}

impl SessionReport {
    pub fn new(backend: BackendKind, device: impl Into<String>) -> Self {
        Self {
            backend,
            device: device.into(),
            scene: None,
            scene_error: None,
            invalidations: vec![],
            resizes: vec![],
            frames: vec![],
        }
    }

    /// 按接收顺序记录渲染器的事件
    pub fn record(&mut self, event: RendererEvent) {
        match event {
            RendererEvent::SceneLoaded {
                name,
                instance_count,
                elapsed,
            } => {
                self.scene = Some(SceneSummary {
                    name,
                    instance_count,
                    load_ms: elapsed.as_secs_f64() * 1000.0,
                });
                self.scene_error = None;
            }
            RendererEvent::SceneLoadFailed(message) => self.scene_error = Some(message),
            RendererEvent::HistoryInvalidated(cause) => self.invalidations.push(InvalidationRecord {
                frame: self.frames.len(),
                cause,
            }),
            RendererEvent::Resized { width, height } => self.resizes.push([width, height]),
            RendererEvent::FrameRendered(report) => self.frames.push(report),
        }
    }

    pub fn final_effort(&self) -> Option<f32> {
        self.frames.last().map(|frame| frame.effort)
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("failed to write report {}", path.display()))?;
        log::info!("session report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalidation_is_tagged_with_frame_index() {
        let mut report = SessionReport::new(BackendKind::Headless, "headless");
        report.record(RendererEvent::SceneLoaded {
            name: "procedural".to_string(),
            instance_count: 9,
            elapsed: Duration::from_millis(12),
        });
        report.record(RendererEvent::HistoryInvalidated(InvalidationCause::Scene));
        report.record(RendererEvent::Resized { width: 8, height: 4 });

        assert_eq!(report.scene.as_ref().unwrap().instance_count, 9);
        assert_eq!(
            report.invalidations,
            [InvalidationRecord {
                frame: 0,
                cause: InvalidationCause::Scene,
            }]
        );
        assert_eq!(report.resizes, [[8, 4]]);
        assert!(report.final_effort().is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["backend"], "headless");
        assert_eq!(json["invalidations"][0]["cause"], "Scene");
    }
}
