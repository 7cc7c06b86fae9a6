use std::path::{Path, PathBuf};

/// 统一路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let config = LumenPath::config_path("headless.toml");      // config/headless.toml
/// let shaders = LumenPath::shader_build_dir();                // shader/.build/
/// ```
pub struct LumenPath {}
// 核心路径
impl LumenPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).parent().map(Path::to_path_buf).unwrap_or_default()
    }
}
// 根目录下
impl LumenPath {
    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }

    pub fn shader_root_path() -> PathBuf {
        Self::workspace_path().join("shader")
    }

    /// 编译好的 SPIR-V 所在目录，kernel 按 `<name>.spv` 查找
    pub fn shader_build_dir() -> PathBuf {
        Self::shader_root_path().join(".build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_under_workspace() {
        let root = LumenPath::workspace_path();
        assert!(LumenPath::shader_build_dir().starts_with(&root));
        assert!(LumenPath::shader_build_dir().ends_with("shader/.build"));
        assert_eq!(LumenPath::config_path("headless.toml"), root.join("config").join("headless.toml"));
    }
}
