use lumen_gfx::error::GfxError;

/// 场景加载失败的原因
///
/// 加载失败不会终止程序，渲染器会一直停留在 loading 画面
#[derive(thiserror::Error, Debug)]
pub enum SceneLoadError {
    #[error("malformed scene: {0}")]
    Malformed(String),

    #[error("unsupported material kind: {0}")]
    UnsupportedMaterial(String),

    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    /// 加载期间又请求了新的场景
    #[error("scene load cancelled")]
    Cancelled,

    #[error("gpu error during scene upload: {0}")]
    Gfx(#[from] GfxError),
}
