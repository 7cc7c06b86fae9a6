//! 将录制下来的 `GfxCommand` 回放到 `vk::CommandBuffer`

use std::ffi::CString;

use ash::vk;
use itertools::Itertools;

use crate::accel::{GfxAccelBuild, GfxAccelInput};
use crate::commands::command_buffer::GfxCommand;
use crate::error::{GfxError, GfxResult};
use crate::vulkan::{VkStorage, VulkanBackend};

/// 构建 acceleration structure 需要的几何描述
///
/// 顶点格式固定为 `R32G32B32_SFLOAT`，索引固定为 `u32`
pub(super) fn accel_geometries(
    storage: &VkStorage,
    input: &GfxAccelInput,
) -> GfxResult<Vec<vk::AccelerationStructureGeometryKHR<'static>>> {
    let address_of = |buffer| {
        storage.buffers.get(buffer).map(|b| b.device_address).ok_or_else(GfxError::invalid_buffer)
    };

    match input {
        GfxAccelInput::Triangles(geometries) => geometries
            .iter()
            .map(|geometry| {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address_of(geometry.vertex_buffer)?,
                    })
                    .vertex_stride(geometry.vertex_stride)
                    .max_vertex(geometry.vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address_of(geometry.index_buffer)?,
                    });
                Ok(vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(vk::GeometryFlagsKHR::OPAQUE))
            })
            .collect(),
        GfxAccelInput::Instances { buffer, .. } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: address_of(*buffer)?,
                });
            Ok(vec![
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                    .flags(vk::GeometryFlagsKHR::OPAQUE),
            ])
        }
    }
}

/// 每个 geometry 的图元数量
pub(super) fn accel_primitive_counts(input: &GfxAccelInput) -> Vec<u32> {
    match input {
        GfxAccelInput::Triangles(geometries) => geometries.iter().map(|g| g.primitive_count).collect(),
        GfxAccelInput::Instances { count, .. } => vec![*count],
    }
}

fn record_accel_build(
    backend: &VulkanBackend,
    storage: &VkStorage,
    cmd: vk::CommandBuffer,
    build: &GfxAccelBuild,
) -> GfxResult<()> {
    let loader = backend.accel_loader()?;
    let dst = storage.accels.get(build.dst).ok_or_else(GfxError::invalid_accel)?;
    let scratch = storage.buffers.get(build.scratch.buffer).ok_or_else(GfxError::invalid_buffer)?;

    let geometries = accel_geometries(storage, &build.input)?;
    let range_infos = accel_primitive_counts(&build.input)
        .into_iter()
        .map(|count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count))
        .collect_vec();

    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(build.input.level().to_vk())
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .dst_acceleration_structure(dst.handle)
        .geometries(&geometries)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch.device_address + build.scratch.offset,
        });

    unsafe {
        loader.cmd_build_acceleration_structures(
            cmd,
            std::slice::from_ref(&build_info),
            &[range_infos.as_slice()],
        );
    }
    Ok(())
}

pub(super) fn record(
    backend: &VulkanBackend,
    storage: &VkStorage,
    cmd: vk::CommandBuffer,
    commands: &[GfxCommand],
) -> GfxResult<()> {
    let device = &backend.device.device;
    let layout = backend.bindless.pipeline_layout;
    let mut bound_kernel = None;

    for command in commands {
        match command {
            GfxCommand::BeginLabel(name) => {
                if let Some(debug_utils) = &backend.device.debug_utils {
                    let name = CString::new(name.as_str()).unwrap_or_default();
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
                }
            }
            GfxCommand::EndLabel => {
                if let Some(debug_utils) = &backend.device.debug_utils {
                    unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
                }
            }
            GfxCommand::PipelineBarrier {
                memory_barriers,
                image_barriers,
                buffer_barriers,
            } => {
                let memory_barriers = memory_barriers.iter().map(|b| b.to_vk()).collect_vec();
                let image_barriers = image_barriers
                    .iter()
                    .map(|b| {
                        let image = storage.images.get(b.image_handle()).ok_or_else(GfxError::invalid_image)?;
                        Ok(b.to_vk(image.handle))
                    })
                    .collect::<GfxResult<Vec<_>>>()?;
                let buffer_barriers = buffer_barriers
                    .iter()
                    .map(|b| {
                        let buffer = storage.buffers.get(b.buffer_handle()).ok_or_else(GfxError::invalid_buffer)?;
                        Ok(b.to_vk(buffer.handle))
                    })
                    .collect::<GfxResult<Vec<_>>>()?;
                let dependency_info = vk::DependencyInfo::default()
                    .memory_barriers(&memory_barriers)
                    .image_memory_barriers(&image_barriers)
                    .buffer_memory_barriers(&buffer_barriers);
                unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
            }
            GfxCommand::UpdateBuffer { buffer, offset, data } => {
                let buffer = storage.buffers.get(*buffer).ok_or_else(GfxError::invalid_buffer)?;
                unsafe { device.cmd_update_buffer(cmd, buffer.handle, *offset, data) };
            }
            GfxCommand::CopyBuffer { src, dst, regions } => {
                let src = storage.buffers.get(*src).ok_or_else(GfxError::invalid_buffer)?;
                let dst = storage.buffers.get(*dst).ok_or_else(GfxError::invalid_buffer)?;
                unsafe { device.cmd_copy_buffer(cmd, src.handle, dst.handle, regions) };
            }
            GfxCommand::BindKernel(handle) => {
                let kernel = storage.kernels.get(*handle).ok_or_else(GfxError::invalid_kernel)?;
                unsafe {
                    device.cmd_bind_pipeline(cmd, kernel.bind_point, kernel.pipeline);
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        kernel.bind_point,
                        layout,
                        0,
                        std::slice::from_ref(&backend.bindless.set),
                        &[],
                    );
                }
                bound_kernel = Some(kernel);
            }
            GfxCommand::PushConstants { offset, data } => unsafe {
                device.cmd_push_constants(cmd, layout, backend.bindless.push_constant_stages, *offset, data);
            },
            GfxCommand::Dispatch { group_count, .. } => unsafe {
                device.cmd_dispatch(cmd, group_count.x, group_count.y, group_count.z);
            },
            GfxCommand::TraceRays { hit_table, extent, .. } => {
                let rt_loader = backend
                    .device
                    .ray_tracing_pipeline
                    .as_ref()
                    .ok_or_else(|| GfxError::MissingFeature("ray tracing pipeline".to_string()))?;
                let shader_table = bound_kernel
                    .and_then(|kernel| kernel.shader_table.as_ref())
                    .ok_or_else(|| GfxError::Submit("trace rays without a ray tracing kernel".to_string()))?;
                let hit_buffer = storage.buffers.get(hit_table.buffer).ok_or_else(GfxError::invalid_buffer)?;
                let hit_region = vk::StridedDeviceAddressRegionKHR::default()
                    .device_address(hit_buffer.device_address)
                    .stride(hit_table.stride)
                    .size(hit_table.stride * hit_table.count as vk::DeviceSize);
                unsafe {
                    rt_loader.cmd_trace_rays(
                        cmd,
                        &shader_table.raygen,
                        &shader_table.miss,
                        &hit_region,
                        &vk::StridedDeviceAddressRegionKHR::default(),
                        extent.x,
                        extent.y,
                        extent.z,
                    );
                }
            }
            GfxCommand::BuildAccelerationStructure(build) => {
                record_accel_build(backend, storage, cmd, build)?;
            }
        }
    }
    Ok(())
}
