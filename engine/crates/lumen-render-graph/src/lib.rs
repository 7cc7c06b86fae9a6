//! 声明式的 pass graph
//!
//! 每一帧都会重新构建：导入外部资源，添加 pass，编译，然后录制到一个 command stream 中。
//!
//! # 核心概念
//!
//! - **RgImageHandle / RgBufferHandle**: graph 内部的虚拟句柄，指向导入的物理资源
//! - **RgImageState / RgBufferState**: stage、access、layout 的组合，用于推断 barrier
//! - **RgPass**: 在 setup 中声明读写，在 execute 中录制命令
//! - **CompiledGraph**: 执行顺序以及每个 pass 之前需要的 barrier
//! - **ResourceStateTracker**: 跨帧记录导入资源的最终状态，下一帧从这里开始转换
//!
//! ```ignore
//! let mut builder = RenderGraphBuilder::new();
//! let color = builder.import_image("color", color_handle, format, tracker.image_state(color_handle));
//! builder.add_pass("path-trace", PathTracePass { color, .. });
//! let graph = builder.compile()?;
//! graph.execute(stream.cmd());
//! graph.export_states(&mut tracker);
//! ```

pub mod barrier;
pub mod error;
pub mod executor;
pub mod frame_resources;
pub mod graph;
pub mod pass;
pub mod resource;
pub mod resource_handle;
pub mod resource_state;
pub mod state_tracker;
