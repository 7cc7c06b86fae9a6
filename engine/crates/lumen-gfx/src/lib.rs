//! Lumen 的 GPU 抽象层
//!
//! - `handles`: 所有 GPU 对象都以 slotmap 句柄的形式存在于后端的 arena 中
//! - `commands`: 与后端无关的命令录制（`GfxCommandBuffer`）以及 barrier 描述
//! - `backend`: `GfxBackend` trait，以及后端的创建入口
//! - `headless`: 不依赖 GPU 的后端，用于测试和离线验证（会检查读写冒险）
//! - `vulkan`: 基于 ash + vk-mem 的后端，将命令列表回放到 `vk::CommandBuffer`

pub mod accel;
pub mod backend;
pub mod commands;
pub mod error;
pub mod handles;
pub mod headless;
pub mod kernel;
pub mod resources;
pub mod vulkan;
