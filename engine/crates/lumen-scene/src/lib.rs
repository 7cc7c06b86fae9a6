//! 场景的输入契约
//!
//! 场景由外部的 `SceneLoader` 产生，渲染核心只在上传期间读取。
//! 材质在加载时一次性转换为封闭的 `Material` 枚举。

pub mod camera;
pub mod error;
pub mod geometry;
pub mod loader;
pub mod material;
pub mod scene_graph;
