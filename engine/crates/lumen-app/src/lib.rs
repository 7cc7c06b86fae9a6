//! 离线 session 的驱动层
//!
//! - `config`: toml 配置
//! - `outer_app`: 应用钩子（场景加载、相机动画等）
//! - `session`: 每帧 acquire -> render -> submit，处理 resize
//! - `report`: 结束时写出的 JSON 报告

pub mod config;
pub mod outer_app;
pub mod report;
pub mod session;
