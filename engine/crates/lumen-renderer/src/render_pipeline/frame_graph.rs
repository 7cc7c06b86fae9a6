//! 把各个 stage 组装成一帧的 render graph
//!
//! ```text
//! stats-clear -> path-trace -> temporal-accumulation -> denoise-0..N -> composite
//!             -> composite-accumulation -> post-process -> upscale
//! ```
//!
//! 关闭的 stage 不会出现在 graph 中，后面的 stage 改为读取前一个实际运行的 stage 的输出。

use std::cell::Cell;

use lumen_gfx::handles::GfxBufferHandle;
use lumen_render_graph::error::RenderGraphError;
use lumen_render_graph::executor::{CompiledGraph, RenderGraphBuilder};
use lumen_render_graph::frame_resources::{FrameImage, FrameResources, HistorySlot};
use lumen_render_graph::resource_state::{RgBufferState, RgImageState};
use lumen_render_graph::state_tracker::ResourceStateTracker;
use lumen_render_interface::frame_counter::FrameCounter;
use lumen_render_interface::output_settings::OutputSettings;
use lumen_render_interface::resource_table::ResourceSlot;

use crate::frame_constants::FrameConstants;
use crate::kernels::RendererKernels;
use crate::presentation::PresentationTarget;
use crate::render_pipeline::accum_pass::{AccumHistory, AccumRgPass};
use crate::render_pipeline::composite_pass::CompositeRgPass;
use crate::render_pipeline::denoise_pass::DenoiseRgPass;
use crate::render_pipeline::path_trace_pass::{PathTraceOutputs, PathTraceRgPass, SceneBindings};
use crate::render_pipeline::post_process_pass::{PostProcessInputs, PostProcessRgPass};
use crate::render_pipeline::stats_clear_pass::StatsClearRgPass;
use crate::render_pipeline::trace_dispatch::TraceDispatch;
use crate::render_pipeline::upscale_pass::{SpatialUpscaler, UpscaleRgPass, Upscaler};
use crate::render_pipeline::{GraphBuffer, GraphImage};
use crate::renderer::PreDispatchHook;

/// graph 中的 pass 名称，也是命令流中的 debug label
pub mod pass_names {
    pub const STATS_CLEAR: &str = "stats-clear";
    pub const PATH_TRACE: &str = "path-trace";
    pub const TEMPORAL_ACCUMULATION: &str = "temporal-accumulation";
    pub const COMPOSITE: &str = "composite";
    pub const COMPOSITE_ACCUMULATION: &str = "composite-accumulation";
    pub const POST_PROCESS: &str = "post-process";
    pub const UPSCALE: &str = "upscale";
    pub const LOADING_SCREEN: &str = "loading-screen";

    #[inline]
    pub fn denoise(iteration: u32) -> String {
        format!("denoise-{iteration}")
    }
}

/// 一帧 graph 需要的外部状态
///
/// 只在组装期间借用，编译后的 graph 不再引用这些状态
pub struct FrameGraphInputs<'f> {
    pub frame: &'f FrameResources,
    pub counter: &'f FrameCounter,
    pub tracker: &'f ResourceStateTracker,
    pub settings: &'f OutputSettings,
    pub target: &'f PresentationTarget,
    pub stats: StatsBinding,

    /// 渲染分辨率的 frame constants，blend weight 为 stage 2 使用的值
    pub constants: FrameConstants,
    /// stage 5 使用的 blend weight
    pub composite_blend_weight: f32,
    /// `None` 时只输出 loading 画面
    pub scene: Option<SceneBindings>,
    /// 达到采样上限之后为 false，stage 1 和 stage 2 不再运行
    pub trace_enabled: bool,
}

/// stats readback buffer 以及它的 slot
#[derive(Clone, Copy, Debug)]
pub struct StatsBinding {
    pub buffer: GfxBufferHandle,
    pub slot: ResourceSlot,
}

/// 混合管线：stage 1 的调度方式和 upscaler 可以替换，其余 stage 固定
pub struct HybridPipeline {
    kernels: RendererKernels,
    dispatch: Box<dyn TraceDispatch>,
    upscaler: Box<dyn Upscaler>,

    print_graph: bool,
    plan_printed: Cell<bool>,
}

// new & init
impl HybridPipeline {
    pub fn new(kernels: RendererKernels, dispatch: Box<dyn TraceDispatch>) -> Self {
        let upscaler = Box::new(SpatialUpscaler::new(kernels.upscale));
        Self {
            kernels,
            dispatch,
            upscaler,
            print_graph: false,
            plan_printed: Cell::new(false),
        }
    }
}

// setters & getters
impl HybridPipeline {
    #[inline]
    pub fn kernels(&self) -> &RendererKernels {
        &self.kernels
    }

    #[inline]
    pub fn dispatch(&self) -> &dyn TraceDispatch {
        self.dispatch.as_ref()
    }

    pub fn set_dispatch(&mut self, dispatch: Box<dyn TraceDispatch>) {
        self.dispatch = dispatch;
    }

    pub fn set_upscaler(&mut self, upscaler: Box<dyn Upscaler>) {
        log::info!("upscaler: {}", upscaler.name());
        self.upscaler = upscaler;
    }

    /// 下一次组装 graph 时打印一次执行计划
    pub fn set_print_graph(&mut self, print_graph: bool) {
        self.print_graph = print_graph;
        self.plan_printed.set(false);
    }
}

/// 一个 parity 内本帧实际读取的来源
///
/// 不 trace 的帧沿用上一帧写入的结果
struct TraceSources {
    color: FrameImage,
    world_position: FrameImage,
    previous_world_position: FrameImage,
    accumulated: FrameImage,
    moments: FrameImage,
}

impl TraceSources {
    fn new(current: &HistorySlot, previous: &HistorySlot, traced: bool) -> Self {
        if traced {
            Self {
                color: current.color,
                world_position: current.world_position,
                previous_world_position: previous.world_position,
                accumulated: current.accumulated,
                moments: current.moments,
            }
        } else {
            Self {
                color: previous.color,
                world_position: previous.world_position,
                previous_world_position: previous.world_position,
                accumulated: previous.accumulated,
                moments: previous.moments,
            }
        }
    }
}

/// 按物理句柄去重的导入
struct ImageImports<'t> {
    tracker: &'t ResourceStateTracker,
    imported: Vec<GraphImage>,
}

impl<'t> ImageImports<'t> {
    fn new(tracker: &'t ResourceStateTracker) -> Self {
        Self {
            tracker,
            imported: Vec::new(),
        }
    }

    fn get(&mut self, builder: &mut RenderGraphBuilder<'_>, name: &str, image: &FrameImage) -> GraphImage {
        if let Some(found) = self.imported.iter().find(|i| i.image == image.handle) {
            return *found;
        }
        let rg = builder.import_image(name, image.handle, image.format, self.tracker.image_state(image.handle));
        let imported = GraphImage::new(rg, image);
        self.imported.push(imported);
        imported
    }
}

// graph
impl HybridPipeline {
    /// 组装并编译一帧的 graph
    ///
    /// 呈现目标导出为 `TRANSFER_SRC`，stats buffer 导出为 `HOST_READ`
    pub fn prepare_frame_graph<'a>(
        &'a self,
        inputs: &FrameGraphInputs<'_>,
        hooks: &'a [PreDispatchHook],
    ) -> Result<CompiledGraph<'a>, RenderGraphError> {
        let _span = tracy_client::span!("HybridPipeline::prepare_frame_graph");

        let mut builder = RenderGraphBuilder::new();
        let mut images = ImageImports::new(inputs.tracker);

        let target = images.get(&mut builder, "presentation-target", &inputs.target.frame_image());
        let stats_buffer = inputs.stats.buffer;
        let stats = GraphBuffer {
            rg: builder.import_buffer("stats", stats_buffer, inputs.tracker.buffer_state(stats_buffer)),
            buffer: stats_buffer,
            slot: inputs.stats.slot,
        };

        builder.add_pass(pass_names::STATS_CLEAR, StatsClearRgPass { stats });

        match inputs.scene {
            Some(scene) => self.add_stage_passes(&mut builder, &mut images, inputs, hooks, scene, stats, target),
            None => {
                // loading 画面直接覆盖整个呈现目标
                let extent = inputs.target.extent();
                let mut constants = inputs.constants;
                constants.resolution = [extent.width, extent.height];
                builder.add_pass(
                    pass_names::LOADING_SCREEN,
                    PostProcessRgPass {
                        kernel: self.kernels.post_process,
                        constants,
                        inputs: None,
                        output: target,
                    },
                );
            }
        }

        builder.export_image(target.rg, RgImageState::TRANSFER_SRC);
        builder.export_buffer(stats.rg, RgBufferState::HOST_READ);

        let compiled = builder.compile()?;
        if self.print_graph && !self.plan_printed.replace(true) {
            compiled.print_execution_plan();
        }
        Ok(compiled)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_stage_passes<'a>(
        &'a self,
        builder: &mut RenderGraphBuilder<'a>,
        images: &mut ImageImports<'_>,
        inputs: &FrameGraphInputs<'_>,
        hooks: &'a [PreDispatchHook],
        scene: SceneBindings,
        stats: GraphBuffer,
        target: GraphImage,
    ) {
        let settings = inputs.settings;
        let frame = inputs.frame;
        let current = frame.current(inputs.counter);
        let previous = frame.previous(inputs.counter);
        let constants = inputs.constants;
        let traced = inputs.trace_enabled;
        let sources = TraceSources::new(current, previous, traced);

        let mut image = |builder: &mut RenderGraphBuilder<'a>, name: &str, image: &FrameImage| {
            images.get(builder, name, image)
        };

        let color = image(builder, "color", &sources.color);
        let world_position = image(builder, "world-position", &sources.world_position);
        let previous_world_position = image(builder, "previous-world-position", &sources.previous_world_position);
        let normals = image(builder, "normals", &frame.normals);
        let albedo = image(builder, "albedo", &frame.albedo);
        let emissive = image(builder, "emissive", &frame.emissive);

        // stage 1
        if traced {
            let previous_color = image(builder, "previous-color", &previous.color);
            builder.add_pass(
                pass_names::PATH_TRACE,
                PathTraceRgPass {
                    dispatch: self.dispatch.as_ref(),
                    hooks,
                    constants,
                    scene,
                    previous_color,
                    outputs: PathTraceOutputs {
                        color,
                        world_position,
                        normals,
                        albedo,
                        emissive,
                    },
                    stats,
                },
            );
        }

        // stage 2
        let accumulated = image(builder, "accumulated", &sources.accumulated);
        let moments = image(builder, "moments", &sources.moments);
        let radiance_source = if settings.continuous {
            if traced {
                let previous_history = AccumHistory {
                    color: image(builder, "previous-accumulated", &previous.accumulated),
                    moments: image(builder, "previous-moments", &previous.moments),
                };
                builder.add_pass(
                    pass_names::TEMPORAL_ACCUMULATION,
                    AccumRgPass {
                        kernel: self.kernels.temporal_accumulation,
                        constants,
                        input: color,
                        world_position,
                        previous_world_position,
                        previous: previous_history,
                        current: AccumHistory {
                            color: accumulated,
                            moments,
                        },
                    },
                );
            }
            accumulated
        } else {
            color
        };

        // stage 3
        let mut indirect = radiance_source;
        if settings.denoise.enabled {
            let ping = image(builder, "denoise-ping", &frame.denoise_ping);
            let pong = image(builder, "denoise-pong", &frame.denoise_pong);
            let chain = DenoiseRgPass::ping_pong_chain(radiance_source, ping, pong, settings.denoise.iterations);
            for (iteration, (input, output)) in (0u32..).zip(chain) {
                builder.add_pass(
                    pass_names::denoise(iteration),
                    DenoiseRgPass {
                        kernel: self.kernels.denoise,
                        constants,
                        settings: settings.denoise,
                        iteration,
                        input,
                        output,
                        normals,
                        world_position,
                    },
                );
                indirect = output;
            }
        }

        // stage 4
        let composite = image(builder, "composite", &frame.composite);
        builder.add_pass(
            pass_names::COMPOSITE,
            CompositeRgPass {
                kernel: self.kernels.composite,
                constants,
                indirect,
                albedo,
                emissive,
                output: composite,
            },
        );

        // stage 5
        let radiance = if settings.continuous {
            let previous_history = AccumHistory {
                color: image(builder, "previous-composite-history", &previous.composite_history),
                moments: image(builder, "previous-composite-moments", &previous.composite_moments),
            };
            let current_history = AccumHistory {
                color: image(builder, "composite-history", &current.composite_history),
                moments: image(builder, "composite-moments", &current.composite_moments),
            };
            let mut composite_constants = constants;
            composite_constants.blend_weight = inputs.composite_blend_weight;
            builder.add_pass(
                pass_names::COMPOSITE_ACCUMULATION,
                AccumRgPass {
                    kernel: self.kernels.temporal_accumulation,
                    constants: composite_constants,
                    input: composite,
                    world_position,
                    previous_world_position,
                    previous: previous_history,
                    current: current_history,
                },
            );
            current_history.color
        } else {
            composite
        };

        // stage 6
        let upscale = settings.upscaler_active();
        let post_process_output = if upscale {
            image(builder, "post-process", &frame.post_process)
        } else {
            target
        };
        builder.add_pass(
            pass_names::POST_PROCESS,
            PostProcessRgPass {
                kernel: self.kernels.post_process,
                constants,
                inputs: Some(PostProcessInputs {
                    radiance,
                    albedo,
                    normals,
                    moments,
                }),
                output: post_process_output,
            },
        );

        // stage 7
        if upscale {
            builder.add_pass(
                pass_names::UPSCALE,
                UpscaleRgPass {
                    upscaler: self.upscaler.as_ref(),
                    constants,
                    input: post_process_output,
                    output: target,
                    output_extent: inputs.target.extent(),
                },
            );
        }
    }
}
