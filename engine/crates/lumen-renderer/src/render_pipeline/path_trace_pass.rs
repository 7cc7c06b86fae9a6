use lumen_gfx::commands::command_buffer::{GfxBindings, GfxHitTableRegion};
use lumen_gfx::handles::{GfxAccelHandle, GfxBufferHandle};
use lumen_render_graph::pass::{RgPass, RgPassBuilder, RgPassContext};
use lumen_render_graph::resource_state::{RgBufferState, RgImageState};
use lumen_render_interface::resource_table::ResourceSlot;

use crate::frame_constants::{FrameConstants, HOOK_PUSH_OFFSET, PassSlots};
use crate::render_pipeline::trace_dispatch::TraceDispatch;
use crate::render_pipeline::{GraphBuffer, GraphImage, push_constants};
use crate::renderer::PreDispatchHook;
use crate::scene_accel::SceneAccel;

/// stage 1 读取的场景资源
///
/// 这些资源在加载或 TLAS 重建的提交中已经有了 barrier，不需要导入 graph
#[derive(Clone, Copy, Debug)]
pub struct SceneBindings {
    pub tlas: GfxAccelHandle,
    pub tlas_slot: ResourceSlot,
    pub materials: GfxBufferHandle,
    pub material_slot: ResourceSlot,
    pub shader_table: GfxBufferHandle,
    pub hit_region: GfxHitTableRegion,
    pub blue_noise: GfxBufferHandle,
    pub blue_noise_slot: ResourceSlot,
}

impl SceneBindings {
    pub fn new(accel: &SceneAccel, blue_noise: GfxBufferHandle, blue_noise_slot: ResourceSlot) -> Self {
        Self {
            tlas: accel.tlas().accel,
            tlas_slot: accel.tlas().slot,
            materials: accel.material_buffer(),
            material_slot: accel.material_slot(),
            shader_table: accel.shader_table_buffer(),
            hit_region: accel.hit_region(),
            blue_noise,
            blue_noise_slot,
        }
    }
}

/// stage 1 写出的图像
#[derive(Clone, Copy, Debug)]
pub struct PathTraceOutputs {
    pub color: GraphImage,
    /// xyz 为世界坐标，w 为到相邻像素的距离
    pub world_position: GraphImage,
    pub normals: GraphImage,
    pub albedo: GraphImage,
    pub emissive: GraphImage,
}

/// stage 1：path trace
pub struct PathTraceRgPass<'a> {
    pub dispatch: &'a dyn TraceDispatch,
    pub hooks: &'a [PreDispatchHook],
    pub constants: FrameConstants,
    pub scene: SceneBindings,

    /// 上一帧的颜色（只读）
    pub previous_color: GraphImage,
    pub outputs: PathTraceOutputs,
    pub stats: GraphBuffer,
}

impl PathTraceRgPass<'_> {
    fn output_images(&self) -> [GraphImage; 5] {
        let o = &self.outputs;
        [o.color, o.world_position, o.normals, o.albedo, o.emissive]
    }
}

impl RgPass for PathTraceRgPass<'_> {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        let stage = self.dispatch.stage();
        builder.read_image(self.previous_color.rg, RgImageState::storage_read(stage));
        for output in self.output_images() {
            builder.write_image(output.rg, RgImageState::storage_write(stage));
        }
        builder.write_buffer(self.stats.rg, RgBufferState::storage_read_write(stage));
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        let scene = &self.scene;
        let o = &self.outputs;
        let slots = PassSlots::new(&[
            scene.tlas_slot.index(),
            scene.material_slot.index(),
            scene.blue_noise_slot.index(),
            self.previous_color.slot.index(),
            o.color.slot.index(),
            o.world_position.slot.index(),
            o.normals.slot.index(),
            o.albedo.slot.index(),
            o.emissive.slot.index(),
            self.stats.slot.index(),
        ]);

        let mut bindings = GfxBindings::new()
            .read(scene.tlas)
            .read(scene.materials)
            .read(scene.blue_noise)
            .read(self.previous_color.image);
        for output in self.output_images() {
            bindings = bindings.write(output.image);
        }
        bindings = bindings.write(self.stats.buffer);

        self.dispatch.bind(ctx.cmd);
        push_constants(ctx.cmd, &self.constants, &slots);
        for hook in self.hooks {
            hook(ctx.cmd, HOOK_PUSH_OFFSET);
        }
        self.dispatch.dispatch(ctx.cmd, scene, self.constants.extent(), bindings);
    }
}
