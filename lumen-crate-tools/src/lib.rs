//! Lumen 工具集
//!
//! 提供日志初始化和资源路径管理。

pub mod init_log;
pub mod resource;
