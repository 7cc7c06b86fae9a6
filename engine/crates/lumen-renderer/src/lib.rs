//! 混合光追渲染器的帧编排核心
//!
//! - [`renderer::Renderer`]: 每帧的入口，持有 temporal 状态、收敛控制和场景
//! - [`render_pipeline`]: 七个 stage 的 pass 以及组装它们的 render graph
//! - [`scene_load`]: 在独立线程上加载场景并构建加速结构

pub mod accel_builder;
pub mod blue_noise;
pub mod context;
pub mod convergence;
pub mod error;
pub mod frame_constants;
pub mod kernels;
pub mod presentation;
pub mod render_pipeline;
pub mod renderer;
pub mod scene_accel;
pub mod scene_load;
pub mod shader_table;
pub mod temporal;
