use std::path::PathBuf;

use lumen_gfx::error::GfxError;
use lumen_render_graph::error::RenderGraphError;
use lumen_scene::error::SceneLoadError;

/// 渲染器的错误
///
/// 除了 `SceneLoad` 之外都是致命的，由应用层通过 `anyhow` 终止进程。
/// 场景加载失败不会向上传递，渲染器进入 `SceneState::Failed` 并继续显示加载画面。
#[derive(thiserror::Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error(transparent)]
    SceneLoad(#[from] SceneLoadError),

    #[error("render graph: {0}")]
    Graph(#[from] RenderGraphError),

    /// 提交失败不会重试
    #[error("frame submission failed: {0}")]
    SubmitFailed(GfxError),

    #[error("failed to read kernel {path}: {source}")]
    KernelLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn scene loader thread: {0}")]
    LoaderSpawn(#[source] std::io::Error),

    #[error("instance {index} is out of range ({count} instances)")]
    InstanceOutOfRange { index: usize, count: usize },
}
