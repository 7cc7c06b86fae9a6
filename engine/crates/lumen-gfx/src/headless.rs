//! 不依赖 GPU 的后端
//!
//! - buffer 的内容保存在内存中，`UpdateBuffer` / `CopyBuffer` 会真实执行
//! - dispatch 和 trace rays 只做记录，kernel 本身是不透明的
//! - 每条命令都会根据声明的读写资源检查冒险：写入之后、在 barrier 之前的读取或写入都会被记录下来
//! - fence 默认在提交时立即完成，也可以关闭 `auto_complete` 手动推进，用来模拟 GPU 的延迟

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use ash::vk;
use slotmap::{Key, SlotMap};

use crate::accel::{GfxAccelBuildSizes, GfxAccelInput, GfxAccelInstance, GfxAccelLevel, GfxScratchRegion};
use crate::backend::{BackendKind, GfxBackend, GfxCapabilities};
use crate::commands::command_buffer::{GfxBindings, GfxCommand, GfxCommandBuffer};
use crate::error::{GfxError, GfxResult};
use crate::handles::{
    GfxAccelHandle, GfxBufferHandle, GfxCommandAllocatorHandle, GfxImageHandle, GfxKernelHandle, GfxResource,
};
use crate::kernel::{GfxKernelDesc, GfxKernelKind};
use crate::resources::{GfxBufferDesc, GfxDescriptor, GfxImageDesc};

#[derive(Clone, Debug)]
pub struct HeadlessConfig {
    pub ray_tracing: bool,
    /// 提交之后 fence 立即完成
    pub auto_complete: bool,
    pub max_descriptor_slots: u32,
    /// 模拟设备拒绝 prebuild 查询
    pub fail_prebuild_query: bool,
    /// 成功提交这么多次之后，后续的提交都会失败
    pub fail_submit_after: Option<usize>,
    /// 最多保留的提交记录数量
    pub max_retained_submissions: usize,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            ray_tracing: true,
            auto_complete: true,
            max_descriptor_slots: 4096,
            fail_prebuild_query: false,
            fail_submit_after: None,
            max_retained_submissions: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterWrite,
}

/// 一次没有被 barrier 保护的访问
#[derive(Clone, Debug)]
pub struct GfxHazard {
    pub submission: String,
    pub command_index: usize,
    pub resource: GfxResource,
    pub kind: HazardKind,
}

/// 一次提交的记录
#[derive(Clone, Debug)]
pub struct HeadlessSubmission {
    pub name: String,
    pub signal_value: u64,
    pub commands: Vec<GfxCommand>,
}

impl HeadlessSubmission {
    /// 按顺序列出所有 debug label
    pub fn labels(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                GfxCommand::BeginLabel(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

struct HeadlessBuffer {
    desc: GfxBufferDesc,
    data: Vec<u8>,
    address: vk::DeviceAddress,
}

struct HeadlessAccel {
    level: GfxAccelLevel,
    address: vk::DeviceAddress,
    built: bool,
    _size: vk::DeviceSize,
    _name: String,
}

#[derive(Default)]
struct HeadlessState {
    buffers: SlotMap<GfxBufferHandle, HeadlessBuffer>,
    images: SlotMap<GfxImageHandle, GfxImageDesc>,
    kernels: SlotMap<GfxKernelHandle, GfxKernelDesc>,
    accels: SlotMap<GfxAccelHandle, HeadlessAccel>,
    allocators: SlotMap<GfxCommandAllocatorHandle, String>,
    descriptors: HashMap<u32, GfxDescriptor>,

    next_address: vk::DeviceAddress,
    submitted_value: u64,
    completed_value: u64,

    submissions: VecDeque<HeadlessSubmission>,
    submission_count: usize,

    /// 已经写入、但还没有被 barrier 保护的资源
    pending_writes: HashSet<GfxResource>,
    /// scratch 按区间跟踪，互不重叠的 build 可以共享同一个 scratch buffer
    pending_scratch: Vec<(GfxBufferHandle, Range<vk::DeviceSize>)>,
    hazards: Vec<GfxHazard>,
}

impl HeadlessState {
    fn alloc_address(&mut self, size: vk::DeviceSize) -> vk::DeviceAddress {
        // 按 256 对齐，且永远不为 0
        let address = self.next_address + 256;
        self.next_address = address + size.div_ceil(256) * 256;
        address
    }
}

pub struct HeadlessBackend {
    config: HeadlessConfig,
    capabilities: GfxCapabilities,
    state: Mutex<HeadlessState>,
}

// new & init
impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        let capabilities = GfxCapabilities {
            device_name: "headless".to_string(),
            ray_tracing: config.ray_tracing,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            scratch_alignment: 128,
            max_descriptor_slots: config.max_descriptor_slots,
        };
        log::info!("headless backend created, ray tracing: {}", config.ray_tracing);
        Self {
            config,
            capabilities,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

// 检查与调试
impl HeadlessBackend {
    /// 到目前为止发现的所有冒险
    pub fn hazards(&self) -> Vec<GfxHazard> {
        self.state().hazards.clone()
    }

    /// 最近的提交记录（受 `max_retained_submissions` 限制）
    pub fn submissions(&self) -> Vec<HeadlessSubmission> {
        self.state().submissions.iter().cloned().collect()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submission_count
    }

    pub fn submitted_fence_value(&self) -> u64 {
        self.state().submitted_value
    }

    /// 模拟 GPU 执行到 `value`
    pub fn complete_up_to(&self, value: u64) {
        let mut state = self.state();
        let value = value.min(state.submitted_value);
        state.completed_value = state.completed_value.max(value);
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state().images.len()
    }

    pub fn live_accel_count(&self) -> usize {
        self.state().accels.len()
    }

    pub fn descriptor(&self, slot: u32) -> Option<GfxDescriptor> {
        self.state().descriptors.get(&slot).copied()
    }

    pub fn is_accel_built(&self, handle: GfxAccelHandle) -> bool {
        self.state().accels.get(handle).is_some_and(|a| a.built)
    }
}
// 命令回放
impl HeadlessBackend {
    fn check_read(state: &mut HeadlessState, submission: &str, index: usize, resource: GfxResource) {
        if state.pending_writes.contains(&resource) {
            state.hazards.push(GfxHazard {
                submission: submission.to_string(),
                command_index: index,
                resource,
                kind: HazardKind::ReadAfterWrite,
            });
        }
    }

    fn mark_write(state: &mut HeadlessState, submission: &str, index: usize, resource: GfxResource) {
        if !state.pending_writes.insert(resource) {
            state.hazards.push(GfxHazard {
                submission: submission.to_string(),
                command_index: index,
                resource,
                kind: HazardKind::WriteAfterWrite,
            });
        }
    }

    fn mark_scratch_write(state: &mut HeadlessState, submission: &str, index: usize, scratch: &GfxScratchRegion) {
        let range = scratch.offset..scratch.offset + scratch.size;
        let overlaps = state
            .pending_scratch
            .iter()
            .any(|(buffer, pending)| *buffer == scratch.buffer && pending.start < range.end && range.start < pending.end);
        if overlaps || state.pending_writes.contains(&GfxResource::Buffer(scratch.buffer)) {
            state.hazards.push(GfxHazard {
                submission: submission.to_string(),
                command_index: index,
                resource: GfxResource::Buffer(scratch.buffer),
                kind: HazardKind::WriteAfterWrite,
            });
        }
        state.pending_scratch.push((scratch.buffer, range));
    }

    fn check_bindings(state: &mut HeadlessState, submission: &str, index: usize, bindings: &GfxBindings) {
        for read in &bindings.reads {
            Self::check_read(state, submission, index, *read);
        }
        // 同一个 dispatch 内的读写由 shader 自己保证
        let unique_writes: HashSet<GfxResource> = bindings.writes.iter().copied().collect();
        for write in unique_writes {
            Self::mark_write(state, submission, index, write);
        }
    }

    fn replay(state: &mut HeadlessState, cmd: &GfxCommandBuffer) -> GfxResult<()> {
        let name = cmd.name();
        for (index, command) in cmd.commands().iter().enumerate() {
            match command {
                GfxCommand::BeginLabel(_)
                | GfxCommand::EndLabel
                | GfxCommand::BindKernel(_)
                | GfxCommand::PushConstants { .. } => {}
                GfxCommand::PipelineBarrier {
                    memory_barriers,
                    image_barriers,
                    buffer_barriers,
                } => {
                    if !memory_barriers.is_empty() {
                        state.pending_writes.clear();
                        state.pending_scratch.clear();
                    }
                    for barrier in image_barriers {
                        state.pending_writes.remove(&GfxResource::Image(barrier.image_handle()));
                    }
                    for barrier in buffer_barriers {
                        let buffer = barrier.buffer_handle();
                        state.pending_writes.remove(&GfxResource::Buffer(buffer));
                        state.pending_scratch.retain(|(b, _)| *b != buffer);
                    }
                }
                GfxCommand::UpdateBuffer { buffer, offset, data } => {
                    let target = state.buffers.get_mut(*buffer).ok_or_else(GfxError::invalid_buffer)?;
                    let begin = *offset as usize;
                    let end = begin + data.len();
                    if end > target.data.len() {
                        return Err(GfxError::Submit(format!(
                            "{name}: update of {} bytes overflows buffer {}",
                            data.len(),
                            target.desc.name
                        )));
                    }
                    target.data[begin..end].copy_from_slice(data);
                    Self::mark_write(state, name, index, GfxResource::Buffer(*buffer));
                }
                GfxCommand::CopyBuffer { src, dst, regions } => {
                    let src_data = state.buffers.get(*src).ok_or_else(GfxError::invalid_buffer)?.data.clone();
                    let target = state.buffers.get_mut(*dst).ok_or_else(GfxError::invalid_buffer)?;
                    for region in regions {
                        let src_range = region.src_offset as usize..(region.src_offset + region.size) as usize;
                        let dst_range = region.dst_offset as usize..(region.dst_offset + region.size) as usize;
                        if src_range.end > src_data.len() || dst_range.end > target.data.len() {
                            return Err(GfxError::Submit(format!("{name}: copy region out of bounds")));
                        }
                        target.data[dst_range].copy_from_slice(&src_data[src_range]);
                    }
                    Self::check_read(state, name, index, GfxResource::Buffer(*src));
                    Self::mark_write(state, name, index, GfxResource::Buffer(*dst));
                }
                GfxCommand::Dispatch { bindings, .. } => {
                    Self::check_bindings(state, name, index, bindings);
                }
                GfxCommand::TraceRays { hit_table, bindings, .. } => {
                    Self::check_read(state, name, index, GfxResource::Buffer(hit_table.buffer));
                    Self::check_bindings(state, name, index, bindings);
                }
                GfxCommand::BuildAccelerationStructure(build) => {
                    match &build.input {
                        GfxAccelInput::Triangles(geometries) => {
                            for geometry in geometries {
                                Self::check_read(state, name, index, GfxResource::Buffer(geometry.vertex_buffer));
                                Self::check_read(state, name, index, GfxResource::Buffer(geometry.index_buffer));
                            }
                        }
                        GfxAccelInput::Instances { buffer, count } => {
                            Self::check_read(state, name, index, GfxResource::Buffer(*buffer));
                            Self::validate_instances(state, *buffer, *count)?;
                        }
                    }
                    Self::mark_scratch_write(state, name, index, &build.scratch);
                    Self::mark_write(state, name, index, GfxResource::Accel(build.dst));

                    let dst = state.accels.get_mut(build.dst).ok_or_else(GfxError::invalid_accel)?;
                    dst.built = true;
                }
            }
        }
        Ok(())
    }

    /// TLAS 引用的每个 BLAS 都必须已经构建完成
    fn validate_instances(state: &HeadlessState, buffer: GfxBufferHandle, count: u32) -> GfxResult<()> {
        let data = &state.buffers.get(buffer).ok_or_else(GfxError::invalid_buffer)?.data;
        let stride = size_of::<GfxAccelInstance>();
        if data.len() < stride * count as usize {
            return Err(GfxError::Submit("instance buffer is smaller than instance count".to_string()));
        }
        for i in 0..count as usize {
            let instance: GfxAccelInstance = bytemuck::pod_read_unaligned(&data[i * stride..(i + 1) * stride]);
            let referenced = state.accels.values().find(|a| a.address == instance.blas_device_address);
            match referenced {
                Some(accel) if accel.built && accel.level == GfxAccelLevel::Bottom => {}
                _ => {
                    return Err(GfxError::Submit(format!(
                        "instance {i} references an unbuilt bottom level structure"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl GfxBackend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn capabilities(&self) -> &GfxCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle> {
        if desc.size == 0 {
            return Err(GfxError::Allocation(format!("buffer {} has zero size", desc.name)));
        }
        let mut state = self.state();
        let address = state.alloc_address(desc.size);
        Ok(state.buffers.insert(HeadlessBuffer {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
            address,
        }))
    }

    fn destroy_buffer(&self, handle: GfxBufferHandle) {
        let mut state = self.state();
        state.buffers.remove(handle);
        state.pending_writes.remove(&GfxResource::Buffer(handle));
        state.pending_scratch.retain(|(b, _)| *b != handle);
    }

    fn write_buffer(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let mut state = self.state();
        let buffer = state.buffers.get_mut(handle).ok_or_else(GfxError::invalid_buffer)?;
        if !buffer.desc.location.is_host_visible() {
            return Err(GfxError::Backend(format!("buffer {} is not host visible", buffer.desc.name)));
        }
        let begin = offset as usize;
        let end = begin + data.len();
        if end > buffer.data.len() {
            return Err(GfxError::Backend(format!("write overflows buffer {}", buffer.desc.name)));
        }
        buffer.data[begin..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()> {
        let state = self.state();
        let buffer = state.buffers.get(handle).ok_or_else(GfxError::invalid_buffer)?;
        let begin = offset as usize;
        let end = begin + out.len();
        if end > buffer.data.len() {
            return Err(GfxError::Backend(format!("read overflows buffer {}", buffer.desc.name)));
        }
        out.copy_from_slice(&buffer.data[begin..end]);
        Ok(())
    }

    fn buffer_device_address(&self, handle: GfxBufferHandle) -> GfxResult<vk::DeviceAddress> {
        self.state().buffers.get(handle).map(|b| b.address).ok_or_else(GfxError::invalid_buffer)
    }

    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImageHandle> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GfxError::Allocation(format!("image {} has zero extent", desc.name)));
        }
        Ok(self.state().images.insert(desc.clone()))
    }

    fn destroy_image(&self, handle: GfxImageHandle) {
        let mut state = self.state();
        state.images.remove(handle);
        state.pending_writes.remove(&GfxResource::Image(handle));
    }

    fn image_extent(&self, handle: GfxImageHandle) -> Option<vk::Extent2D> {
        self.state().images.get(handle).map(|desc| desc.extent)
    }

    fn create_kernel(&self, desc: &GfxKernelDesc) -> GfxResult<GfxKernelHandle> {
        if desc.kind == GfxKernelKind::RayTracing && !self.config.ray_tracing {
            return Err(GfxError::MissingFeature("ray tracing pipeline".to_string()));
        }
        Ok(self.state().kernels.insert(desc.clone()))
    }

    fn destroy_kernel(&self, handle: GfxKernelHandle) {
        self.state().kernels.remove(handle);
    }

    fn hit_group_identifier(&self, kernel: GfxKernelHandle) -> GfxResult<Vec<u8>> {
        let state = self.state();
        let desc = state.kernels.get(kernel).ok_or_else(GfxError::invalid_kernel)?;
        if desc.kind != GfxKernelKind::RayTracing {
            return Err(GfxError::Backend(format!("kernel {} has no hit group", desc.name)));
        }
        // 确定性的伪 identifier
        let seed = kernel.data().as_ffi().to_le_bytes();
        let size = self.capabilities.shader_group_handle_size as usize;
        Ok(seed.iter().copied().cycle().take(size).collect())
    }

    fn accel_build_sizes(&self, input: &GfxAccelInput) -> GfxResult<GfxAccelBuildSizes> {
        if self.config.fail_prebuild_query {
            return Err(GfxError::PrebuildQuery("rejected by headless device".to_string()));
        }
        let primitives = input.primitive_count() as vk::DeviceSize;
        if primitives == 0 {
            return Err(GfxError::PrebuildQuery("empty build input".to_string()));
        }
        Ok(match input.level() {
            GfxAccelLevel::Bottom => GfxAccelBuildSizes {
                accel_size: 256 + primitives * 64,
                build_scratch_size: 128 + primitives * 32,
            },
            GfxAccelLevel::Top => GfxAccelBuildSizes {
                accel_size: 256 + primitives * 128,
                build_scratch_size: 128 + primitives * 64,
            },
        })
    }

    fn create_accel(&self, level: GfxAccelLevel, size: vk::DeviceSize, name: &str) -> GfxResult<GfxAccelHandle> {
        let mut state = self.state();
        let address = state.alloc_address(size);
        Ok(state.accels.insert(HeadlessAccel {
            level,
            address,
            built: false,
            _size: size,
            _name: name.to_string(),
        }))
    }

    fn destroy_accel(&self, handle: GfxAccelHandle) {
        let mut state = self.state();
        state.accels.remove(handle);
        state.pending_writes.remove(&GfxResource::Accel(handle));
    }

    fn accel_device_address(&self, handle: GfxAccelHandle) -> GfxResult<vk::DeviceAddress> {
        self.state().accels.get(handle).map(|a| a.address).ok_or_else(GfxError::invalid_accel)
    }

    fn write_descriptor(&self, slot: u32, descriptor: GfxDescriptor) -> GfxResult<()> {
        if slot >= self.capabilities.max_descriptor_slots {
            return Err(GfxError::DescriptorTableFull {
                capacity: self.capabilities.max_descriptor_slots,
            });
        }
        self.state().descriptors.insert(slot, descriptor);
        Ok(())
    }

    fn create_command_allocator(&self, name: &str) -> GfxResult<GfxCommandAllocatorHandle> {
        Ok(self.state().allocators.insert(name.to_string()))
    }

    fn reset_command_allocator(&self, handle: GfxCommandAllocatorHandle) -> GfxResult<()> {
        if self.state().allocators.contains_key(handle) { Ok(()) } else { Err(GfxError::invalid_allocator()) }
    }

    fn destroy_command_allocator(&self, handle: GfxCommandAllocatorHandle) {
        self.state().allocators.remove(handle);
    }

    fn submit(&self, allocator: GfxCommandAllocatorHandle, cmd: &GfxCommandBuffer, signal_value: u64) -> GfxResult<()> {
        let _span = tracy_client::span!("HeadlessBackend::submit");
        let mut state = self.state();
        if !state.allocators.contains_key(allocator) {
            return Err(GfxError::invalid_allocator());
        }
        if self.config.fail_submit_after.is_some_and(|limit| state.submission_count >= limit) {
            return Err(GfxError::Submit("device lost".to_string()));
        }
        if cmd.is_recording() {
            return Err(GfxError::Submit(format!("{} is still recording", cmd.name())));
        }
        if signal_value <= state.submitted_value {
            return Err(GfxError::Submit(format!(
                "fence value {} is not greater than {}",
                signal_value, state.submitted_value
            )));
        }

        Self::replay(&mut state, cmd)?;

        state.submitted_value = signal_value;
        if self.config.auto_complete {
            state.completed_value = signal_value;
        }
        state.submission_count += 1;
        state.submissions.push_back(HeadlessSubmission {
            name: cmd.name().to_string(),
            signal_value,
            commands: cmd.commands().to_vec(),
        });
        while state.submissions.len() > self.config.max_retained_submissions {
            state.submissions.pop_front();
        }
        Ok(())
    }

    fn completed_fence_value(&self) -> u64 {
        self.state().completed_value
    }

    fn wait_fence_value(&self, value: u64, _timeout_ns: u64) -> GfxResult<()> {
        let mut state = self.state();
        if value > state.submitted_value {
            // 没有任何提交会 signal 这个值
            return Err(GfxError::Timeout { value });
        }
        state.completed_value = state.completed_value.max(value);
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let mut state = self.state();
        state.completed_value = state.submitted_value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{GfxAccelBuild, GfxTriangleGeometry};
    use crate::commands::barrier::{GfxBarrierMask, GfxImageBarrier};

    fn storage_image(backend: &HeadlessBackend, name: &str) -> GfxImageHandle {
        backend
            .create_image(&GfxImageDesc::new_storage(
                vk::Extent2D { width: 4, height: 4 },
                vk::Format::R32G32B32A32_SFLOAT,
                name,
            ))
            .unwrap()
    }

    fn submit(backend: &HeadlessBackend, cmd: &GfxCommandBuffer, value: u64) -> GfxResult<()> {
        let allocator = backend.create_command_allocator("test").unwrap();
        backend.submit(allocator, cmd, value)
    }

    #[test]
    fn test_read_after_write_without_barrier_is_hazard() {
        let backend = HeadlessBackend::default();
        let kernel = backend.create_kernel(&GfxKernelDesc::compute("k", None)).unwrap();
        let image = storage_image(&backend, "color");

        let mut cmd = GfxCommandBuffer::new("frame");
        cmd.begin("frame");
        cmd.cmd_bind_kernel(kernel);
        cmd.cmd_dispatch(glam::UVec3::ONE, GfxBindings::new().write(image));
        cmd.cmd_dispatch(glam::UVec3::ONE, GfxBindings::new().read(image));
        cmd.end();
        submit(&backend, &cmd, 1).unwrap();

        let hazards = backend.hazards();
        assert_eq!(hazards.len(), 1);
        assert_eq!(hazards[0].kind, HazardKind::ReadAfterWrite);
        assert_eq!(hazards[0].resource, GfxResource::Image(image));
    }

    #[test]
    fn test_barrier_between_write_and_read() {
        let backend = HeadlessBackend::default();
        let kernel = backend.create_kernel(&GfxKernelDesc::compute("k", None)).unwrap();
        let image = storage_image(&backend, "color");

        let mut cmd = GfxCommandBuffer::new("frame");
        cmd.begin("frame");
        cmd.cmd_bind_kernel(kernel);
        cmd.cmd_dispatch(glam::UVec3::ONE, GfxBindings::new().write(image));
        cmd.image_memory_barrier(&[GfxImageBarrier::new().image(image)]);
        cmd.cmd_dispatch(glam::UVec3::ONE, GfxBindings::new().read(image));
        cmd.end();
        submit(&backend, &cmd, 1).unwrap();

        assert!(backend.hazards().is_empty());
    }

    #[test]
    fn test_fence_must_be_monotonic() {
        let backend = HeadlessBackend::default();
        let mut cmd = GfxCommandBuffer::new("empty");
        cmd.begin("empty");
        cmd.end();

        submit(&backend, &cmd, 2).unwrap();
        assert!(submit(&backend, &cmd, 2).is_err());
        assert!(submit(&backend, &cmd, 1).is_err());
        assert_eq!(backend.completed_fence_value(), 2);
    }

    #[test]
    fn test_manual_fence_completion() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            auto_complete: false,
            ..Default::default()
        });
        let mut cmd = GfxCommandBuffer::new("empty");
        cmd.begin("empty");
        cmd.end();
        submit(&backend, &cmd, 1).unwrap();
        submit(&backend, &cmd, 2).unwrap();

        assert_eq!(backend.completed_fence_value(), 0);
        backend.complete_up_to(1);
        assert_eq!(backend.completed_fence_value(), 1);
        backend.wait_fence_value(2, u64::MAX).unwrap();
        assert_eq!(backend.completed_fence_value(), 2);
        assert!(matches!(backend.wait_fence_value(3, 0), Err(GfxError::Timeout { value: 3 })));
    }

    #[test]
    fn test_update_and_copy_buffer_are_applied() {
        let backend = HeadlessBackend::default();
        let stage = backend.create_buffer(&GfxBufferDesc::new_stage_buffer(16, "stage")).unwrap();
        let readback = backend.create_buffer(&GfxBufferDesc::new_readback_buffer(16, "readback")).unwrap();
        backend.write_buffer(stage, 0, &[7u8; 16]).unwrap();

        let mut cmd = GfxCommandBuffer::new("copy");
        cmd.begin("copy");
        cmd.cmd_copy_buffer(stage, readback, &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 16 }]);
        cmd.end();
        submit(&backend, &cmd, 1).unwrap();

        let mut out = [0u8; 16];
        backend.read_buffer(readback, 0, &mut out).unwrap();
        assert_eq!(out, [7u8; 16]);
    }

    #[test]
    fn test_tlas_requires_built_blas() {
        let backend = HeadlessBackend::default();
        let vertices = backend.create_buffer(&GfxBufferDesc::new(36, vk::BufferUsageFlags::STORAGE_BUFFER, "v")).unwrap();
        let indices = backend.create_buffer(&GfxBufferDesc::new(12, vk::BufferUsageFlags::STORAGE_BUFFER, "i")).unwrap();
        let scratch = backend.create_buffer(&GfxBufferDesc::new(4096, vk::BufferUsageFlags::STORAGE_BUFFER, "s")).unwrap();
        let blas = backend.create_accel(GfxAccelLevel::Bottom, 1024, "blas").unwrap();
        let tlas = backend.create_accel(GfxAccelLevel::Top, 1024, "tlas").unwrap();

        let instance =
            GfxAccelInstance::new(&glam::Mat4::IDENTITY, 0, 0, backend.accel_device_address(blas).unwrap());
        let instance_buffer = backend
            .create_buffer(
                &GfxBufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER, "instances")
                    .with_location(crate::resources::GfxMemoryLocation::CpuToGpu),
            )
            .unwrap();
        backend.write_buffer(instance_buffer, 0, bytemuck::bytes_of(&instance)).unwrap();

        let tlas_build = GfxAccelBuild {
            dst: tlas,
            input: GfxAccelInput::Instances { buffer: instance_buffer, count: 1 },
            scratch: GfxScratchRegion { buffer: scratch, offset: 0, size: 1024 },
        };

        // BLAS 还没有构建
        let mut cmd = GfxCommandBuffer::new("tlas-only");
        cmd.begin("tlas-only");
        cmd.cmd_build_acceleration_structure(tlas_build.clone());
        cmd.end();
        assert!(submit(&backend, &cmd, 1).is_err());

        let mut cmd = GfxCommandBuffer::new("blas-then-tlas");
        cmd.begin("blas-then-tlas");
        cmd.cmd_build_acceleration_structure(GfxAccelBuild {
            dst: blas,
            input: GfxAccelInput::Triangles(vec![GfxTriangleGeometry {
                vertex_buffer: vertices,
                vertex_stride: 12,
                vertex_count: 3,
                index_buffer: indices,
                primitive_count: 1,
            }]),
            scratch: GfxScratchRegion { buffer: scratch, offset: 0, size: 1024 },
        });
        cmd.memory_barrier(&[GfxBarrierMask::ACCEL_BUILD_TO_READ]);
        cmd.cmd_build_acceleration_structure(tlas_build);
        cmd.end();
        submit(&backend, &cmd, 2).unwrap();

        assert!(backend.is_accel_built(tlas));
        assert!(backend.hazards().is_empty());
    }

    #[test]
    fn test_submit_failure_injection() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            fail_submit_after: Some(1),
            ..Default::default()
        });
        let mut cmd = GfxCommandBuffer::new("empty");
        cmd.begin("empty");
        cmd.end();
        submit(&backend, &cmd, 1).unwrap();
        assert!(matches!(submit(&backend, &cmd, 2), Err(GfxError::Submit(_))));
        assert_eq!(backend.submitted_fence_value(), 1);
    }

    #[test]
    fn test_prebuild_query_can_fail() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            fail_prebuild_query: true,
            ..Default::default()
        });
        let input = GfxAccelInput::Instances {
            buffer: GfxBufferHandle::default(),
            count: 1,
        };
        assert!(matches!(backend.accel_build_sizes(&input), Err(GfxError::PrebuildQuery(_))));
    }
}
