//! 构建器和执行器
//!
//! `RenderGraphBuilder` 导入资源、收集 pass，`CompiledGraph` 持有执行顺序和预先计算的 barrier。

use ash::vk;
use itertools::Itertools;
use slotmap::SecondaryMap;

use lumen_gfx::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use lumen_gfx::commands::command_buffer::GfxCommandBuffer;
use lumen_gfx::handles::{GfxBufferHandle, GfxImageHandle};

use crate::barrier::{PassBarriers, RgBufferBarrierDesc, RgImageBarrierDesc};
use crate::error::RenderGraphError;
use crate::graph::DependencyGraph;
use crate::pass::{RgPass, RgPassBuilder, RgPassContext, RgPassNode};
use crate::resource::{RgBufferResource, RgImageResource, RgResourceRegistry};
use crate::resource_handle::{RgBufferHandle, RgImageHandle};
use crate::resource_state::{RgBufferState, RgImageState};
use crate::state_tracker::ResourceStateTracker;

/// 渲染图构建器
///
/// # 使用流程
///
/// 1. 导入外部资源: `builder.import_image(...)`
/// 2. 添加 pass: `builder.add_pass("name", pass)`
/// 3. 编译: `builder.compile()?`
/// 4. 录制: `compiled.execute(cmd)`
///
/// `'a` 是 pass 可以借用的外部资源的生命周期。
pub struct RenderGraphBuilder<'a> {
    resources: RgResourceRegistry,
    passes: Vec<RgPassNode<'a>>,
    /// 按名称声明的额外顺序约束 (before, after)
    explicit_edges: Vec<(String, String)>,
}

impl Default for RenderGraphBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RenderGraphBuilder<'a> {
    pub fn new() -> Self {
        Self {
            resources: RgResourceRegistry::new(),
            passes: Vec::new(),
            explicit_edges: Vec::new(),
        }
    }

    /// 导入外部图像
    ///
    /// # 参数
    /// - `format`: 用于推断 barrier 的 aspect
    /// - `initial_state`: 通常来自 `ResourceStateTracker::image_state`
    pub fn import_image(
        &mut self,
        name: impl Into<String>,
        image: GfxImageHandle,
        format: vk::Format,
        initial_state: RgImageState,
    ) -> RgImageHandle {
        self.resources.register_image(RgImageResource {
            name: name.into(),
            physical: image,
            format,
            initial_state,
            export_state: None,
        })
    }

    pub fn import_buffer(
        &mut self,
        name: impl Into<String>,
        buffer: GfxBufferHandle,
        initial_state: RgBufferState,
    ) -> RgBufferHandle {
        self.resources.register_buffer(RgBufferResource {
            name: name.into(),
            physical: buffer,
            initial_state,
            export_state: None,
        })
    }

    /// 所有 pass 执行完之后，把图像转换到 `final_state`
    pub fn export_image(&mut self, handle: RgImageHandle, final_state: RgImageState) {
        if let Some(resource) = self.resources.get_image_mut(handle) {
            resource.export_state = Some(final_state);
        }
    }

    pub fn export_buffer(&mut self, handle: RgBufferHandle, final_state: RgBufferState) {
        if let Some(resource) = self.resources.get_buffer_mut(handle) {
            resource.export_state = Some(final_state);
        }
    }

    pub fn add_pass<P: RgPass + 'a>(&mut self, name: impl Into<String>, mut pass: P) -> &mut Self {
        let mut builder = RgPassBuilder::default();
        pass.setup(&mut builder);

        self.passes.push(RgPassNode {
            name: name.into(),
            image_reads: builder.image_reads,
            image_writes: builder.image_writes,
            buffer_reads: builder.buffer_reads,
            buffer_writes: builder.buffer_writes,
            pass: Box::new(pass),
        });
        self
    }

    /// 没有资源依赖时强制 `before` 先于 `after` 执行
    pub fn add_dependency(&mut self, before: impl Into<String>, after: impl Into<String>) -> &mut Self {
        self.explicit_edges.push((before.into(), after.into()));
        self
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// 依赖分析、排序、barrier 计算
    pub fn compile(self) -> Result<CompiledGraph<'a>, RenderGraphError> {
        let _span = tracy_client::span!("RenderGraphBuilder::compile");

        self.validate_handles()?;

        let pass_count = self.passes.len();
        let image_reads = self.passes.iter().map(|p| p.image_reads.iter().map(|s| s.0).collect_vec()).collect_vec();
        let image_writes = self.passes.iter().map(|p| p.image_writes.iter().map(|s| s.0).collect_vec()).collect_vec();
        let buffer_reads = self.passes.iter().map(|p| p.buffer_reads.iter().map(|s| s.0).collect_vec()).collect_vec();
        let buffer_writes = self.passes.iter().map(|p| p.buffer_writes.iter().map(|s| s.0).collect_vec()).collect_vec();

        let mut dep_graph =
            DependencyGraph::analyze(pass_count, &image_reads, &image_writes, &buffer_reads, &buffer_writes);
        for (before, after) in &self.explicit_edges {
            let index_of = |name: &str| {
                self.passes
                    .iter()
                    .position(|p| p.name == name)
                    .ok_or_else(|| RenderGraphError::UnknownPass(name.to_string()))
            };
            dep_graph.add_edge(index_of(before)?, index_of(after)?);
        }

        let execution_order = dep_graph.topological_sort().map_err(|cycle| {
            RenderGraphError::Cycle(cycle.iter().map(|&i| self.passes[i].name.clone()).collect())
        })?;

        let simulation = self.compute_barriers(&execution_order);

        Ok(CompiledGraph {
            resources: self.resources,
            passes: self.passes,
            execution_order,
            barriers: simulation.barriers,
            export_barriers: simulation.export_barriers,
            final_images: simulation.final_images,
            final_buffers: simulation.final_buffers,
            dep_graph,
        })
    }

    fn validate_handles(&self) -> Result<(), RenderGraphError> {
        for pass in &self.passes {
            let images_ok = pass
                .image_reads
                .iter()
                .chain(&pass.image_writes)
                .all(|(handle, _)| self.resources.get_image(*handle).is_some());
            let buffers_ok = pass
                .buffer_reads
                .iter()
                .chain(&pass.buffer_writes)
                .all(|(handle, _)| self.resources.get_buffer(*handle).is_some());
            if !images_ok || !buffers_ok {
                return Err(RenderGraphError::UnknownResource {
                    pass: pass.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// 按执行顺序模拟资源状态的变化，生成每个 pass 之前需要的 barrier
    fn compute_barriers(&self, execution_order: &[usize]) -> BarrierSimulation {
        let mut barriers = vec![PassBarriers::new(); self.passes.len()];

        let mut image_states: SecondaryMap<RgImageHandle, RgImageState> = SecondaryMap::new();
        let mut buffer_states: SecondaryMap<RgBufferHandle, RgBufferState> = SecondaryMap::new();
        for (handle, resource) in self.resources.iter_images() {
            image_states.insert(handle, resource.initial_state);
        }
        for (handle, resource) in self.resources.iter_buffers() {
            buffer_states.insert(handle, resource.initial_state);
        }

        for &pass_index in execution_order {
            let pass = &self.passes[pass_index];
            let pass_barriers = &mut barriers[pass_index];

            // 同一个资源既读又写时以写入状态为准
            for (handle, required) in merge_usage(&pass.image_reads, &pass.image_writes) {
                let aspect = self.resources.get_image(handle).map_or(vk::ImageAspectFlags::COLOR, |r| r.aspect());
                Self::transition_image(&mut image_states, pass_barriers, handle, required, aspect);
            }
            for (handle, required) in merge_usage(&pass.buffer_reads, &pass.buffer_writes) {
                Self::transition_buffer(&mut buffer_states, pass_barriers, handle, required);
            }
        }

        let mut export_barriers = PassBarriers::new();
        for (handle, resource) in self.resources.iter_images() {
            if let Some(final_state) = resource.export_state {
                Self::transition_image(&mut image_states, &mut export_barriers, handle, final_state, resource.aspect());
            }
        }
        for (handle, resource) in self.resources.iter_buffers() {
            if let Some(final_state) = resource.export_state {
                Self::transition_buffer(&mut buffer_states, &mut export_barriers, handle, final_state);
            }
        }

        BarrierSimulation {
            barriers,
            export_barriers,
            final_images: self
                .resources
                .iter_images()
                .map(|(handle, resource)| (resource.physical, image_states[handle]))
                .collect(),
            final_buffers: self
                .resources
                .iter_buffers()
                .map(|(handle, resource)| (resource.physical, buffer_states[handle]))
                .collect(),
        }
    }

    /// 不需要 barrier 的连续读取会合并 stage 和 access，之后的写入需要等待所有读取者
    fn transition_image(
        states: &mut SecondaryMap<RgImageHandle, RgImageState>,
        barriers: &mut PassBarriers,
        handle: RgImageHandle,
        required: RgImageState,
        aspect: vk::ImageAspectFlags,
    ) {
        let Some(current) = states.get_mut(handle) else {
            return;
        };
        let barrier = RgImageBarrierDesc::new(handle, *current, required).with_aspect(aspect);
        if barrier.needs_barrier() {
            barriers.add_image_barrier(barrier);
            *current = required;
        } else {
            current.stage |= required.stage;
            current.access |= required.access;
        }
    }

    fn transition_buffer(
        states: &mut SecondaryMap<RgBufferHandle, RgBufferState>,
        barriers: &mut PassBarriers,
        handle: RgBufferHandle,
        required: RgBufferState,
    ) {
        let Some(current) = states.get_mut(handle) else {
            return;
        };
        let barrier = RgBufferBarrierDesc::new(handle, *current, required);
        if barrier.needs_barrier() {
            barriers.add_buffer_barrier(barrier);
            *current = required;
        } else {
            current.stage |= required.stage;
            current.access |= required.access;
        }
    }
}

/// 保持声明顺序，重复的读取只保留第一个
fn merge_usage<K: Copy + PartialEq, S: Copy>(reads: &[(K, S)], writes: &[(K, S)]) -> Vec<(K, S)> {
    let mut usage: Vec<(K, S)> = Vec::with_capacity(reads.len() + writes.len());
    for &(handle, state) in reads {
        if !usage.iter().any(|(k, _)| *k == handle) {
            usage.push((handle, state));
        }
    }
    for &(handle, state) in writes {
        match usage.iter_mut().find(|(k, _)| *k == handle) {
            Some(entry) => entry.1 = state,
            None => usage.push((handle, state)),
        }
    }
    usage
}

struct BarrierSimulation {
    barriers: Vec<PassBarriers>,
    export_barriers: PassBarriers,
    final_images: Vec<(GfxImageHandle, RgImageState)>,
    final_buffers: Vec<(GfxBufferHandle, RgBufferState)>,
}

/// 编译后的渲染图
///
/// `'a` 是 pass 借用的外部资源的生命周期
pub struct CompiledGraph<'a> {
    resources: RgResourceRegistry,
    passes: Vec<RgPassNode<'a>>,
    execution_order: Vec<usize>,
    /// 按 pass 索引
    barriers: Vec<PassBarriers>,
    /// 所有 pass 之后的导出转换
    export_barriers: PassBarriers,
    final_images: Vec<(GfxImageHandle, RgImageState)>,
    final_buffers: Vec<(GfxBufferHandle, RgBufferState)>,
    dep_graph: DependencyGraph,
}

// getters
impl CompiledGraph<'_> {
    #[inline]
    pub fn execution_order(&self) -> &[usize] {
        &self.execution_order
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    #[inline]
    pub fn pass_name(&self, index: usize) -> &str {
        &self.passes[index].name
    }

    /// 按执行顺序排列的 pass 名称
    pub fn ordered_pass_names(&self) -> Vec<&str> {
        self.execution_order.iter().map(|&i| self.passes[i].name.as_str()).collect()
    }

    pub fn barriers_before(&self, pass_name: &str) -> Option<&PassBarriers> {
        self.passes.iter().position(|p| p.name == pass_name).map(|i| &self.barriers[i])
    }

    #[inline]
    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.dep_graph
    }
}

impl CompiledGraph<'_> {
    /// 按顺序录制所有 pass，每个 pass 之前插入推断出的 barrier
    ///
    /// `cmd` 需要已经 begin
    pub fn execute(&self, cmd: &mut GfxCommandBuffer) {
        let _span = tracy_client::span!("CompiledGraph::execute");

        for &pass_index in &self.execution_order {
            let node = &self.passes[pass_index];
            self.record_barriers(cmd, &self.barriers[pass_index]);

            cmd.begin_label(&node.name);
            let mut ctx = RgPassContext {
                cmd: &mut *cmd,
                resources: &self.resources,
            };
            node.pass.execute(&mut ctx);
            cmd.end_label();
        }

        self.record_barriers(cmd, &self.export_barriers);
    }

    /// 把导入资源的最终状态写回 tracker
    pub fn export_states(&self, tracker: &mut ResourceStateTracker) {
        for &(image, state) in &self.final_images {
            tracker.set_image_state(image, state);
        }
        for &(buffer, state) in &self.final_buffers {
            tracker.set_buffer_state(buffer, state);
        }
    }

    fn record_barriers(&self, cmd: &mut GfxCommandBuffer, pass_barriers: &PassBarriers) {
        if !pass_barriers.has_barriers() {
            return;
        }
        let image_barriers: Vec<GfxImageBarrier> = pass_barriers
            .image_barriers
            .iter()
            .filter_map(|desc| Some(desc.to_gfx_barrier(self.resources.get_image(desc.handle)?.physical)))
            .collect();
        let buffer_barriers: Vec<GfxBufferBarrier> = pass_barriers
            .buffer_barriers
            .iter()
            .filter_map(|desc| Some(desc.to_gfx_barrier(self.resources.get_buffer(desc.handle)?.physical)))
            .collect();
        cmd.pipeline_barrier(&[], &image_barriers, &buffer_barriers);
    }
}

const STAGE_NAMES: &[(vk::PipelineStageFlags2, &str)] = &[
    (vk::PipelineStageFlags2::TOP_OF_PIPE, "TOP_OF_PIPE"),
    (vk::PipelineStageFlags2::COMPUTE_SHADER, "COMPUTE"),
    (vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR, "RAY_TRACING"),
    (vk::PipelineStageFlags2::TRANSFER, "TRANSFER"),
    (vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR, "ACCEL_BUILD"),
    (vk::PipelineStageFlags2::HOST, "HOST"),
    (vk::PipelineStageFlags2::ALL_COMMANDS, "ALL_COMMANDS"),
];

const ACCESS_NAMES: &[(vk::AccessFlags2, &str)] = &[
    (vk::AccessFlags2::SHADER_SAMPLED_READ, "SAMPLED_READ"),
    (vk::AccessFlags2::SHADER_STORAGE_READ, "STORAGE_READ"),
    (vk::AccessFlags2::SHADER_STORAGE_WRITE, "STORAGE_WRITE"),
    (vk::AccessFlags2::TRANSFER_READ, "TRANSFER_READ"),
    (vk::AccessFlags2::TRANSFER_WRITE, "TRANSFER_WRITE"),
    (vk::AccessFlags2::HOST_READ, "HOST_READ"),
    (vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR, "ACCEL_READ"),
    (vk::AccessFlags2::MEMORY_READ, "MEMORY_READ"),
    (vk::AccessFlags2::MEMORY_WRITE, "MEMORY_WRITE"),
];

// 调试输出
impl CompiledGraph<'_> {
    /// 打印执行计划：执行顺序、每个 pass 的读写以及之前的 barrier
    pub fn print_execution_plan(&self) {
        log::info!("╔══════════════════════════════════════════════════════════════════╗");
        log::info!("║                    Render Graph Execution Plan                   ║");
        log::info!("╠══════════════════════════════════════════════════════════════════╣");
        log::info!("║ Passes: {} | Order: [{}]", self.passes.len(), self.ordered_pass_names().join(" → "));
        log::info!("╚══════════════════════════════════════════════════════════════════╝");

        for (order, &pass_index) in self.execution_order.iter().enumerate() {
            let node = &self.passes[pass_index];
            log::info!("┌─────────────────────────────────────────────────────────────────┐");
            log::info!("│ [{}/{}] {}", order + 1, self.execution_order.len(), node.name);
            log::info!("├─────────────────────────────────────────────────────────────────┤");

            for (handle, state) in &node.image_reads {
                log::info!("│   R image  {:<24} {}", self.resources.image_name(*handle), Self::format_image_state(state));
            }
            for (handle, state) in &node.image_writes {
                log::info!("│   W image  {:<24} {}", self.resources.image_name(*handle), Self::format_image_state(state));
            }
            for (handle, state) in &node.buffer_reads {
                log::info!(
                    "│   R buffer {:<24} {}",
                    self.resources.buffer_name(*handle),
                    Self::format_masks(state.stage, state.access)
                );
            }
            for (handle, state) in &node.buffer_writes {
                log::info!(
                    "│   W buffer {:<24} {}",
                    self.resources.buffer_name(*handle),
                    Self::format_masks(state.stage, state.access)
                );
            }

            self.print_barriers(&self.barriers[pass_index]);
            log::info!("└─────────────────────────────────────────────────────────────────┘");
        }

        if self.export_barriers.has_barriers() {
            log::info!("┌─ export ────────────────────────────────────────────────────────┐");
            self.print_barriers(&self.export_barriers);
            log::info!("└─────────────────────────────────────────────────────────────────┘");
        }
    }

    fn print_barriers(&self, barriers: &PassBarriers) {
        if !barriers.has_barriers() {
            log::info!("│ no barriers");
            return;
        }
        log::info!(
            "│ barriers: {} image, {} buffer",
            barriers.image_barrier_count(),
            barriers.buffer_barrier_count()
        );
        for barrier in &barriers.image_barriers {
            log::info!(
                "│   image {}: {:?} → {:?}, {} → {}",
                self.resources.image_name(barrier.handle),
                barrier.src_state.layout,
                barrier.dst_state.layout,
                Self::format_masks(barrier.src_state.stage, barrier.src_state.access),
                Self::format_masks(barrier.dst_state.stage, barrier.dst_state.access)
            );
        }
        for barrier in &barriers.buffer_barriers {
            log::info!(
                "│   buffer {}: {} → {}",
                self.resources.buffer_name(barrier.handle),
                Self::format_masks(barrier.src_state.stage, barrier.src_state.access),
                Self::format_masks(barrier.dst_state.stage, barrier.dst_state.access)
            );
        }
    }

    fn format_image_state(state: &RgImageState) -> String {
        format!("@ {:?} {}", state.layout, Self::format_masks(state.stage, state.access))
    }

    fn format_masks(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> String {
        let stages = STAGE_NAMES.iter().filter(|(flag, _)| stage.contains(*flag)).map(|(_, name)| *name).join("|");
        let accesses = if access == vk::AccessFlags2::NONE {
            "NONE".to_string()
        } else {
            ACCESS_NAMES.iter().filter(|(flag, _)| access.contains(*flag)).map(|(_, name)| *name).join("|")
        };
        format!("({stages}, {accesses})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_gfx::backend::GfxBackend;
    use lumen_gfx::commands::command_buffer::{GfxBindings, GfxCommand};
    use lumen_gfx::headless::HeadlessBackend;
    use lumen_gfx::resources::{GfxBufferDesc, GfxImageDesc};

    /// 读取 `inputs`，写入 `outputs` 的计算 pass
    struct ComputePass {
        inputs: Vec<RgImageHandle>,
        outputs: Vec<RgImageHandle>,
    }

    impl RgPass for ComputePass {
        fn setup(&mut self, builder: &mut RgPassBuilder) {
            for &input in &self.inputs {
                builder.read_image(input, RgImageState::STORAGE_READ_COMPUTE);
            }
            for &output in &self.outputs {
                builder.write_image(output, RgImageState::STORAGE_WRITE_COMPUTE);
            }
        }

        fn execute(&self, ctx: &mut RgPassContext<'_>) {
            let mut bindings = GfxBindings::new();
            for &input in &self.inputs {
                bindings = bindings.read(ctx.image(input).unwrap());
            }
            for &output in &self.outputs {
                bindings = bindings.write(ctx.image(output).unwrap());
            }
            ctx.cmd.cmd_dispatch(glam::UVec3::ONE, bindings);
        }
    }

    fn storage_image(backend: &HeadlessBackend, name: &str) -> GfxImageHandle {
        backend
            .create_image(&GfxImageDesc::new_storage(
                vk::Extent2D { width: 8, height: 8 },
                vk::Format::R32G32B32A32_SFLOAT,
                name,
            ))
            .unwrap()
    }

    fn submit(backend: &HeadlessBackend, cmd: &GfxCommandBuffer, value: u64) {
        let allocator = backend.create_command_allocator("test").unwrap();
        backend.submit(allocator, cmd, value).unwrap();
    }

    fn record_chain(
        tracker: &mut ResourceStateTracker,
        physical: &[GfxImageHandle; 3],
        frame: u64,
    ) -> GfxCommandBuffer {
        let mut builder = RenderGraphBuilder::new();
        let [a, b, c] = physical.map(|image| {
            builder.import_image(format!("{image:?}"), image, vk::Format::R32G32B32A32_SFLOAT, tracker.image_state(image))
        });
        builder.add_pass("produce", ComputePass { inputs: vec![], outputs: vec![a] });
        builder.add_pass("filter", ComputePass { inputs: vec![a], outputs: vec![b] });
        builder.add_pass("resolve", ComputePass { inputs: vec![a, b], outputs: vec![c] });
        let graph = builder.compile().unwrap();
        assert_eq!(graph.ordered_pass_names(), vec!["produce", "filter", "resolve"]);

        let mut cmd = GfxCommandBuffer::new(format!("frame-{frame}"));
        cmd.begin("frame");
        graph.execute(&mut cmd);
        cmd.end();
        graph.export_states(tracker);
        cmd
    }

    #[test]
    fn test_chain_has_no_hazards() {
        let backend = HeadlessBackend::default();
        let physical = ["a", "b", "c"].map(|name| storage_image(&backend, name));
        let mut tracker = ResourceStateTracker::new();

        for frame in 1..=3 {
            let cmd = record_chain(&mut tracker, &physical, frame);
            submit(&backend, &cmd, frame);
        }
        assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());
        assert_eq!(tracker.image_state(physical[2]), RgImageState::STORAGE_WRITE_COMPUTE);
    }

    #[test]
    fn test_barrier_precedes_consumer_dispatch() {
        let backend = HeadlessBackend::default();
        let physical = ["a", "b", "c"].map(|name| storage_image(&backend, name));
        let mut tracker = ResourceStateTracker::new();
        let cmd = record_chain(&mut tracker, &physical, 1);

        let commands = cmd.commands();
        let dispatches = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, GfxCommand::Dispatch { .. }))
            .map(|(i, _)| i)
            .collect_vec();
        assert_eq!(dispatches.len(), 3);
        // filter 之前必须有 a 的 barrier
        let barrier_before_filter = commands[dispatches[0]..dispatches[1]].iter().any(|c| match c {
            GfxCommand::PipelineBarrier { image_barriers, .. } => {
                image_barriers.iter().any(|b| b.image_handle() == physical[0])
            }
            _ => false,
        });
        assert!(barrier_before_filter);
    }

    #[test]
    fn test_second_frame_starts_from_tracked_state() {
        let backend = HeadlessBackend::default();
        let image = storage_image(&backend, "history");
        let mut tracker = ResourceStateTracker::new();

        let compile = |tracker: &ResourceStateTracker| {
            let mut builder = RenderGraphBuilder::new();
            let h = builder.import_image("history", image, vk::Format::R32G32B32A32_SFLOAT, tracker.image_state(image));
            builder.add_pass("read", ComputePass { inputs: vec![h], outputs: vec![] });
            builder.compile().unwrap()
        };

        let first = compile(&tracker);
        let barrier = &first.barriers_before("read").unwrap().image_barriers[0];
        assert_eq!(barrier.src_state.layout, vk::ImageLayout::UNDEFINED);
        first.export_states(&mut tracker);

        // 上一帧已经是 GENERAL 的只读状态，不需要再次转换
        let second = compile(&tracker);
        assert!(!second.barriers_before("read").unwrap().has_barriers());
    }

    #[test]
    fn test_export_transitions_buffer_for_host() {
        let backend = HeadlessBackend::default();
        let buffer = backend.create_buffer(&GfxBufferDesc::new_readback_buffer(8, "stats")).unwrap();

        struct Clear(RgBufferHandle);
        impl RgPass for Clear {
            fn setup(&mut self, builder: &mut RgPassBuilder) {
                builder.write_buffer(self.0, RgBufferState::TRANSFER_DST);
            }
            fn execute(&self, ctx: &mut RgPassContext<'_>) {
                let buffer = ctx.buffer(self.0).unwrap();
                ctx.cmd.cmd_update_buffer(buffer, 0, &[0; 8]);
            }
        }

        let mut tracker = ResourceStateTracker::new();
        let mut builder = RenderGraphBuilder::new();
        let stats = builder.import_buffer("stats", buffer, tracker.buffer_state(buffer));
        builder.add_pass("clear", Clear(stats));
        builder.export_buffer(stats, RgBufferState::HOST_READ);
        let graph = builder.compile().unwrap();

        let mut cmd = GfxCommandBuffer::new("export");
        cmd.begin("export");
        graph.execute(&mut cmd);
        cmd.end();
        graph.export_states(&mut tracker);

        // 最后一个是 end() 的 label
        let commands = cmd.commands();
        assert!(matches!(commands[commands.len() - 2], GfxCommand::PipelineBarrier { .. }));
        assert_eq!(tracker.buffer_state(buffer), RgBufferState::HOST_READ);
    }

    #[test]
    fn test_explicit_cycle_is_an_error() {
        let backend = HeadlessBackend::default();
        let image = storage_image(&backend, "x");
        let mut builder = RenderGraphBuilder::new();
        let x = builder.import_image("x", image, vk::Format::R32G32B32A32_SFLOAT, RgImageState::UNDEFINED);
        builder.add_pass("first", ComputePass { inputs: vec![], outputs: vec![x] });
        builder.add_pass("second", ComputePass { inputs: vec![x], outputs: vec![] });
        builder.add_dependency("second", "first");

        match builder.compile() {
            Err(RenderGraphError::Cycle(names)) => assert_eq!(names, vec!["first", "second"]),
            other => panic!("expected cycle, got {:?}", other.map(|g| g.pass_count())),
        }
    }

    #[test]
    fn test_unknown_pass_dependency() {
        let mut builder = RenderGraphBuilder::new();
        builder.add_pass("only", ComputePass { inputs: vec![], outputs: vec![] });
        builder.add_dependency("only", "missing");
        assert!(matches!(builder.compile(), Err(RenderGraphError::UnknownPass(name)) if name == "missing"));
    }
}
