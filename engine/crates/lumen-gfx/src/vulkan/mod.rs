//! 基于 ash + vk-mem 的后端
//!
//! - 所有 GPU 对象都存放在 slotmap 中，由一个 `Mutex` 保护
//! - 命令以 `GfxCommand` 的形式录制，提交时回放到 `vk::CommandBuffer`
//! - 使用单个 timeline semaphore 作为 fence，`signal_value` 由调用方保证单调递增
//! - shader 通过一个全局的 bindless descriptor set 访问资源

mod bindless;
mod debug;
mod device;
mod replay;

use std::mem::ManuallyDrop;
use std::sync::{Mutex, MutexGuard};

use ash::vk;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::accel::{GfxAccelBuildSizes, GfxAccelInput, GfxAccelLevel};
use crate::backend::{BackendKind, GfxBackend, GfxBackendConfig, GfxCapabilities};
use crate::commands::command_buffer::GfxCommandBuffer;
use crate::error::{GfxError, GfxResult};
use crate::handles::{GfxAccelHandle, GfxBufferHandle, GfxCommandAllocatorHandle, GfxImageHandle, GfxKernelHandle};
use crate::kernel::{GfxKernelDesc, GfxKernelKind};
use crate::resources::{GfxBufferDesc, GfxDescriptor, GfxImageDesc, GfxMemoryLocation};
use bindless::VkBindless;
use device::VkDevice;

pub(crate) struct VkBuffer {
    handle: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
    /// 在创建时写死，只有 host visible 的 buffer 才有
    mapped_ptr: Option<*mut u8>,
    device_address: vk::DeviceAddress,
}

pub(crate) struct VkImage {
    handle: vk::Image,
    view: vk::ImageView,
    allocation: vk_mem::Allocation,
    desc: GfxImageDesc,
}

/// 光追 kernel 自带的 raygen / miss 区域
pub(crate) struct VkKernelShaderTable {
    buffer: GfxBufferHandle,
    raygen: vk::StridedDeviceAddressRegionKHR,
    miss: vk::StridedDeviceAddressRegionKHR,
}

pub(crate) struct VkKernel {
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
    kind: GfxKernelKind,
    /// raygen, miss, hit 三个 shader group 的 handle
    group_handles: Vec<u8>,
    shader_table: Option<VkKernelShaderTable>,
}

pub(crate) struct VkAccel {
    handle: vk::AccelerationStructureKHR,
    buffer: GfxBufferHandle,
    level: GfxAccelLevel,
    device_address: vk::DeviceAddress,
}

pub(crate) struct VkCommandAllocator {
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    /// 下一个可用的 command buffer，reset 之后归零
    cursor: usize,
}

#[derive(Default)]
pub(crate) struct VkStorage {
    buffers: SlotMap<GfxBufferHandle, VkBuffer>,
    images: SlotMap<GfxImageHandle, VkImage>,
    kernels: SlotMap<GfxKernelHandle, VkKernel>,
    accels: SlotMap<GfxAccelHandle, VkAccel>,
    allocators: SlotMap<GfxCommandAllocatorHandle, VkCommandAllocator>,
}

// mapped_ptr 指向 vma 的映射内存，只在持有 storage 锁时访问
unsafe impl Send for VkStorage {}

pub struct VulkanBackend {
    storage: Mutex<VkStorage>,
    /// queue 需要外部同步
    queue_lock: Mutex<()>,
    timeline: vk::Semaphore,
    bindless: VkBindless,
    /// 需要在 device 之前销毁
    allocator: ManuallyDrop<vk_mem::Allocator>,
    device: VkDevice,
}

// new & init
impl VulkanBackend {
    pub fn new(config: &GfxBackendConfig) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanBackend::new");
        let device = VkDevice::new(config)?;

        let allocator = {
            let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&device.instance, &device.device, device.pdevice);
            vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
            vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
            unsafe { vk_mem::Allocator::new(vma_ci)? }
        };

        let bindless = VkBindless::new(&device)?;

        let timeline = {
            let mut type_ci =
                vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
            let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut type_ci);
            unsafe { device.device.create_semaphore(&semaphore_ci, None)? }
        };
        device.set_debug_name(timeline, "frame-timeline");

        log::info!("vulkan backend ready on {}", device.capabilities.device_name);
        Ok(Self {
            storage: Mutex::new(VkStorage::default()),
            queue_lock: Mutex::new(()),
            timeline,
            bindless,
            allocator: ManuallyDrop::new(allocator),
            device,
        })
    }

    #[inline]
    fn storage(&self) -> MutexGuard<'_, VkStorage> {
        self.storage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[inline]
    fn accel_loader(&self) -> GfxResult<&ash::khr::acceleration_structure::Device> {
        self.device
            .acceleration_structure
            .as_ref()
            .ok_or_else(|| GfxError::MissingFeature("acceleration structure".to_string()))
    }

    #[inline]
    fn align_up(value: u32, alignment: u32) -> u32 {
        value.div_ceil(alignment) * alignment
    }
}

// 对象的创建与销毁
impl VulkanBackend {
    fn create_buffer_locked(&self, storage: &mut VkStorage, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle> {
        let mut usage = desc.usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        if self.device.capabilities.ray_tracing {
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        }
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size).usage(usage);
        let alloc_ci = match desc.location {
            GfxMemoryLocation::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            GfxMemoryLocation::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            GfxMemoryLocation::GpuToCpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        };

        let align = desc.alignment.unwrap_or(8);
        let (handle, mut allocation) = unsafe {
            self.allocator
                .create_buffer_with_alignment(&buffer_ci, &alloc_ci, align)
                .map_err(|e| GfxError::Allocation(format!("buffer {}: {e}", desc.name)))?
        };

        let mapped_ptr = if desc.location.is_host_visible() {
            Some(unsafe { self.allocator.map_memory(&mut allocation)? })
        } else {
            None
        };
        let device_address = unsafe {
            self.device.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(handle))
        };
        self.device.set_debug_name(handle, &format!("Buffer::{}", desc.name));

        Ok(storage.buffers.insert(VkBuffer {
            handle,
            allocation,
            size: desc.size,
            mapped_ptr,
            device_address,
        }))
    }

    fn destroy_buffer_locked(&self, storage: &mut VkStorage, handle: GfxBufferHandle) {
        if let Some(mut buffer) = storage.buffers.remove(handle) {
            unsafe {
                if buffer.mapped_ptr.is_some() {
                    self.allocator.unmap_memory(&mut buffer.allocation);
                }
                self.allocator.destroy_buffer(buffer.handle, &mut buffer.allocation);
            }
        }
    }

    fn destroy_image_locked(&self, storage: &mut VkStorage, handle: GfxImageHandle) {
        if let Some(mut image) = storage.images.remove(handle) {
            unsafe {
                self.device.device.destroy_image_view(image.view, None);
                self.allocator.destroy_image(image.handle, &mut image.allocation);
            }
        }
    }

    fn destroy_kernel_locked(&self, storage: &mut VkStorage, handle: GfxKernelHandle) {
        if let Some(kernel) = storage.kernels.remove(handle) {
            unsafe { self.device.device.destroy_pipeline(kernel.pipeline, None) };
            if let Some(shader_table) = kernel.shader_table {
                self.destroy_buffer_locked(storage, shader_table.buffer);
            }
        }
    }

    fn destroy_accel_locked(&self, storage: &mut VkStorage, handle: GfxAccelHandle) {
        if let Some(accel) = storage.accels.remove(handle) {
            if let Some(loader) = &self.device.acceleration_structure {
                unsafe { loader.destroy_acceleration_structure(accel.handle, None) };
            }
            self.destroy_buffer_locked(storage, accel.buffer);
        }
    }

    fn destroy_allocator_locked(&self, storage: &mut VkStorage, handle: GfxCommandAllocatorHandle) {
        if let Some(allocator) = storage.allocators.remove(handle) {
            unsafe { self.device.device.destroy_command_pool(allocator.pool, None) };
        }
    }

    fn create_shader_module(&self, desc: &GfxKernelDesc) -> GfxResult<vk::ShaderModule> {
        let spirv = desc
            .spirv
            .as_ref()
            .ok_or_else(|| GfxError::Backend(format!("kernel {} has no SPIR-V", desc.name)))?;
        let module_ci = vk::ShaderModuleCreateInfo::default().code(spirv);
        Ok(unsafe { self.device.device.create_shader_module(&module_ci, None)? })
    }

    fn create_compute_kernel(&self, desc: &GfxKernelDesc) -> GfxResult<VkKernel> {
        let module = self.create_shader_module(desc)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage).layout(self.bindless.pipeline_layout);
        let result = unsafe {
            self.device.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_ci),
                None,
            )
        };
        unsafe { self.device.device.destroy_shader_module(module, None) };
        let pipeline = result.map_err(|(_, e)| e)?[0];

        Ok(VkKernel {
            pipeline,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            kind: GfxKernelKind::Compute,
            group_handles: vec![],
            shader_table: None,
        })
    }

    /// 单个模块，包含 `raygen` / `miss` / `closest_hit` 三个入口，对应三个 shader group
    fn create_ray_tracing_kernel(&self, storage: &mut VkStorage, desc: &GfxKernelDesc) -> GfxResult<VkKernel> {
        let rt_loader = self
            .device
            .ray_tracing_pipeline
            .as_ref()
            .ok_or_else(|| GfxError::MissingFeature("ray tracing pipeline".to_string()))?;

        let module = self.create_shader_module(desc)?;
        let stages = [
            (vk::ShaderStageFlags::RAYGEN_KHR, c"raygen"),
            (vk::ShaderStageFlags::MISS_KHR, c"miss"),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, c"closest_hit"),
        ]
        .map(|(stage, entry)| vk::PipelineShaderStageCreateInfo::default().stage(stage).module(module).name(entry));
        let groups = [
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(1)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];
        let pipeline_ci = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .layout(self.bindless.pipeline_layout)
            // 这个仅仅是用来分配栈内存的，递归深度需要在 shader 中手动跟踪
            .max_pipeline_ray_recursion_depth(1);
        let result = unsafe {
            rt_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_ci),
                None,
            )
        };
        unsafe { self.device.device.destroy_shader_module(module, None) };
        let pipeline = result.map_err(|(_, e)| e)?[0];
        self.device.set_debug_name(pipeline, &desc.name);

        let caps = &self.device.capabilities;
        let handle_size = caps.shader_group_handle_size;
        let group_handles = unsafe {
            rt_loader.get_ray_tracing_shader_group_handles(pipeline, 0, 3, 3 * handle_size as usize)?
        };

        // raygen 和 miss 各占一个 region，每个 region 按 base alignment 对齐
        let aligned_handle_size = Self::align_up(handle_size, caps.shader_group_handle_alignment);
        let region_size = Self::align_up(aligned_handle_size, caps.shader_group_base_alignment);
        let sbt_desc = GfxBufferDesc::new(
            2 * region_size as vk::DeviceSize,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            format!("{}-raygen-miss-sbt", desc.name),
        )
        .with_location(GfxMemoryLocation::CpuToGpu)
        .with_alignment(caps.shader_group_base_alignment as vk::DeviceSize);
        let sbt_buffer = self.create_buffer_locked(storage, &sbt_desc)?;

        let sbt_address = {
            let buffer = storage.buffers.get(sbt_buffer).ok_or_else(GfxError::invalid_buffer)?;
            let mapped = buffer.mapped_ptr.ok_or_else(GfxError::invalid_buffer)?;
            unsafe {
                let dst = std::slice::from_raw_parts_mut(mapped, buffer.size as usize);
                let hs = handle_size as usize;
                dst[..hs].copy_from_slice(&group_handles[..hs]);
                dst[region_size as usize..region_size as usize + hs].copy_from_slice(&group_handles[hs..2 * hs]);
            }
            self.allocator.flush_allocation(&buffer.allocation, 0, buffer.size)?;
            buffer.device_address
        };

        Ok(VkKernel {
            pipeline,
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
            kind: GfxKernelKind::RayTracing,
            group_handles,
            shader_table: Some(VkKernelShaderTable {
                buffer: sbt_buffer,
                // raygen 的 stride 需要和 size 一样
                raygen: vk::StridedDeviceAddressRegionKHR::default()
                    .device_address(sbt_address)
                    .stride(region_size as vk::DeviceSize)
                    .size(region_size as vk::DeviceSize),
                miss: vk::StridedDeviceAddressRegionKHR::default()
                    .device_address(sbt_address + region_size as vk::DeviceSize)
                    .stride(aligned_handle_size as vk::DeviceSize)
                    .size(region_size as vk::DeviceSize),
            }),
        })
    }
}

impl GfxBackend for VulkanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    fn capabilities(&self) -> &GfxCapabilities {
        &self.device.capabilities
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle> {
        let mut storage = self.storage();
        self.create_buffer_locked(&mut storage, desc)
    }

    fn destroy_buffer(&self, handle: GfxBufferHandle) {
        let mut storage = self.storage();
        self.destroy_buffer_locked(&mut storage, handle);
    }

    fn write_buffer(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let storage = self.storage();
        let buffer = storage.buffers.get(handle).ok_or_else(GfxError::invalid_buffer)?;
        let mapped = buffer.mapped_ptr.ok_or_else(|| GfxError::Backend("buffer is not host visible".to_string()))?;
        if offset + data.len() as vk::DeviceSize > buffer.size {
            return Err(GfxError::Backend("write overflows buffer".to_string()));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
        }
        self.allocator.flush_allocation(&buffer.allocation, offset, data.len() as vk::DeviceSize)?;
        Ok(())
    }

    fn read_buffer(&self, handle: GfxBufferHandle, offset: vk::DeviceSize, out: &mut [u8]) -> GfxResult<()> {
        let storage = self.storage();
        let buffer = storage.buffers.get(handle).ok_or_else(GfxError::invalid_buffer)?;
        let mapped = buffer.mapped_ptr.ok_or_else(|| GfxError::Backend("buffer is not host visible".to_string()))?;
        if offset + out.len() as vk::DeviceSize > buffer.size {
            return Err(GfxError::Backend("read overflows buffer".to_string()));
        }
        self.allocator.invalidate_allocation(&buffer.allocation, offset, out.len() as vk::DeviceSize)?;
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn buffer_device_address(&self, handle: GfxBufferHandle) -> GfxResult<vk::DeviceAddress> {
        self.storage().buffers.get(handle).map(|b| b.device_address).ok_or_else(GfxError::invalid_buffer)
    }

    fn create_image(&self, desc: &GfxImageDesc) -> GfxResult<GfxImageHandle> {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (handle, allocation) = unsafe {
            self.allocator
                .create_image(&image_ci, &alloc_ci)
                .map_err(|e| GfxError::Allocation(format!("image {}: {e}", desc.name)))?
        };

        let view_ci = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: GfxImageDesc::infer_aspect(desc.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.device.create_image_view(&view_ci, None)? };
        self.device.set_debug_name(handle, &format!("Image::{}", desc.name));
        self.device.set_debug_name(view, &format!("ImageView::{}", desc.name));

        Ok(self.storage().images.insert(VkImage {
            handle,
            view,
            allocation,
            desc: desc.clone(),
        }))
    }

    fn destroy_image(&self, handle: GfxImageHandle) {
        let mut storage = self.storage();
        self.destroy_image_locked(&mut storage, handle);
    }

    fn image_extent(&self, handle: GfxImageHandle) -> Option<vk::Extent2D> {
        self.storage().images.get(handle).map(|image| image.desc.extent)
    }

    fn create_kernel(&self, desc: &GfxKernelDesc) -> GfxResult<GfxKernelHandle> {
        let _span = tracy_client::span!("VulkanBackend::create_kernel");
        let mut storage = self.storage();
        let kernel = match desc.kind {
            GfxKernelKind::Compute => self.create_compute_kernel(desc)?,
            GfxKernelKind::RayTracing => self.create_ray_tracing_kernel(&mut storage, desc)?,
        };
        self.device.set_debug_name(kernel.pipeline, &desc.name);
        Ok(storage.kernels.insert(kernel))
    }

    fn destroy_kernel(&self, handle: GfxKernelHandle) {
        let mut storage = self.storage();
        self.destroy_kernel_locked(&mut storage, handle);
    }

    fn hit_group_identifier(&self, kernel: GfxKernelHandle) -> GfxResult<Vec<u8>> {
        let storage = self.storage();
        let kernel = storage.kernels.get(kernel).ok_or_else(GfxError::invalid_kernel)?;
        if kernel.kind != GfxKernelKind::RayTracing {
            return Err(GfxError::Backend("compute kernel has no hit group".to_string()));
        }
        let hs = self.device.capabilities.shader_group_handle_size as usize;
        Ok(kernel.group_handles[2 * hs..3 * hs].to_vec())
    }

    fn accel_build_sizes(&self, input: &GfxAccelInput) -> GfxResult<GfxAccelBuildSizes> {
        let loader = self.accel_loader()?;
        let storage = self.storage();
        let geometries = replay::accel_geometries(&storage, input)?;
        let max_primitive_counts = replay::accel_primitive_counts(input);

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(input.level().to_vk())
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &max_primitive_counts,
                &mut size_info,
            );
        }
        if size_info.acceleration_structure_size == 0 {
            return Err(GfxError::PrebuildQuery("device reported zero size".to_string()));
        }
        Ok(GfxAccelBuildSizes {
            accel_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
        })
    }

    fn create_accel(&self, level: GfxAccelLevel, size: vk::DeviceSize, name: &str) -> GfxResult<GfxAccelHandle> {
        let loader = self.accel_loader()?;
        let mut storage = self.storage();
        let buffer = self.create_buffer_locked(
            &mut storage,
            &GfxBufferDesc::new(size, vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR, format!("{name}-buffer")),
        )?;
        let vk_buffer = storage.buffers.get(buffer).ok_or_else(GfxError::invalid_buffer)?.handle;

        let accel_ci = vk::AccelerationStructureCreateInfoKHR::default()
            .ty(level.to_vk())
            .size(size)
            .buffer(vk_buffer)
            .offset(0);
        let handle = match unsafe { loader.create_acceleration_structure(&accel_ci, None) } {
            Ok(handle) => handle,
            Err(e) => {
                self.destroy_buffer_locked(&mut storage, buffer);
                return Err(e.into());
            }
        };
        let device_address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle),
            )
        };
        self.device.set_debug_name(handle, name);

        Ok(storage.accels.insert(VkAccel {
            handle,
            buffer,
            level,
            device_address,
        }))
    }

    fn destroy_accel(&self, handle: GfxAccelHandle) {
        let mut storage = self.storage();
        self.destroy_accel_locked(&mut storage, handle);
    }

    fn accel_device_address(&self, handle: GfxAccelHandle) -> GfxResult<vk::DeviceAddress> {
        self.storage().accels.get(handle).map(|a| a.device_address).ok_or_else(GfxError::invalid_accel)
    }

    fn write_descriptor(&self, slot: u32, descriptor: GfxDescriptor) -> GfxResult<()> {
        if slot >= self.bindless.slot_count {
            return Err(GfxError::DescriptorTableFull {
                capacity: self.bindless.slot_count,
            });
        }
        let storage = self.storage();
        let device = &self.device.device;
        match descriptor {
            GfxDescriptor::StorageImage(image) => {
                let view = storage.images.get(image).ok_or_else(GfxError::invalid_image)?.view;
                self.bindless.write_storage_image(device, slot, view);
            }
            GfxDescriptor::StorageBuffer(buffer) => {
                let buffer = storage.buffers.get(buffer).ok_or_else(GfxError::invalid_buffer)?.handle;
                self.bindless.write_storage_buffer(device, slot, buffer);
            }
            GfxDescriptor::AccelerationStructure(accel) => {
                let accel = storage.accels.get(accel).ok_or_else(GfxError::invalid_accel)?;
                debug_assert_eq!(accel.level, GfxAccelLevel::Top);
                self.bindless.write_accel(device, slot, accel.handle);
            }
        }
        Ok(())
    }

    fn create_command_allocator(&self, name: &str) -> GfxResult<GfxCommandAllocatorHandle> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.device.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.device.create_command_pool(&pool_ci, None)? };
        self.device.set_debug_name(pool, name);
        Ok(self.storage().allocators.insert(VkCommandAllocator {
            pool,
            command_buffers: vec![],
            cursor: 0,
        }))
    }

    fn reset_command_allocator(&self, handle: GfxCommandAllocatorHandle) -> GfxResult<()> {
        let mut storage = self.storage();
        let allocator = storage.allocators.get_mut(handle).ok_or_else(GfxError::invalid_allocator)?;
        unsafe {
            self.device.device.reset_command_pool(allocator.pool, vk::CommandPoolResetFlags::empty())?;
        }
        allocator.cursor = 0;
        Ok(())
    }

    fn destroy_command_allocator(&self, handle: GfxCommandAllocatorHandle) {
        let mut storage = self.storage();
        self.destroy_allocator_locked(&mut storage, handle);
    }

    fn submit(&self, allocator: GfxCommandAllocatorHandle, cmd: &GfxCommandBuffer, signal_value: u64) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanBackend::submit");
        if cmd.is_recording() {
            return Err(GfxError::Submit(format!("{} is still recording", cmd.name())));
        }

        let vk_cmd = {
            let mut storage = self.storage();
            let vk_cmd = {
                let allocator = storage.allocators.get_mut(allocator).ok_or_else(GfxError::invalid_allocator)?;
                if allocator.cursor == allocator.command_buffers.len() {
                    let alloc_info = vk::CommandBufferAllocateInfo::default()
                        .command_pool(allocator.pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1);
                    let new_cmd = unsafe { self.device.device.allocate_command_buffers(&alloc_info)?[0] };
                    allocator.command_buffers.push(new_cmd);
                }
                let vk_cmd = allocator.command_buffers[allocator.cursor];
                allocator.cursor += 1;
                vk_cmd
            };

            let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.device.begin_command_buffer(vk_cmd, &begin_info)? };
            replay::record(self, &storage, vk_cmd, cmd.commands())?;
            unsafe { self.device.device.end_command_buffer(vk_cmd)? };
            vk_cmd
        };

        let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(vk_cmd);
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline)
            .value(signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(std::slice::from_ref(&cmd_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));

        let _queue_guard = self.queue_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unsafe {
            self.device
                .device
                .queue_submit2(self.device.queue, std::slice::from_ref(&submit_info), vk::Fence::null())
                .map_err(|e| GfxError::Submit(format!("{}: {e}", cmd.name())))
        }
    }

    fn completed_fence_value(&self) -> u64 {
        unsafe { self.device.device.get_semaphore_counter_value(self.timeline) }.unwrap_or_else(|e| {
            log::error!("failed to query timeline value: {e}");
            0
        })
    }

    fn wait_fence_value(&self, value: u64, timeout_ns: u64) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanBackend::wait_fence_value");
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(std::slice::from_ref(&self.timeline))
            .values(std::slice::from_ref(&value));
        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GfxError::Timeout { value }),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let _queue_guard = self.queue_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unsafe { self.device.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("destroying vulkan backend");
        unsafe {
            let _ = self.device.device.device_wait_idle();
        }

        let mut storage = std::mem::take(self.storage.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let kernels = storage.kernels.keys().collect::<Vec<_>>();
        kernels.into_iter().for_each(|h| self.destroy_kernel_locked(&mut storage, h));
        let accels = storage.accels.keys().collect::<Vec<_>>();
        accels.into_iter().for_each(|h| self.destroy_accel_locked(&mut storage, h));
        let images = storage.images.keys().collect::<Vec<_>>();
        images.into_iter().for_each(|h| self.destroy_image_locked(&mut storage, h));
        let buffers = storage.buffers.keys().collect::<Vec<_>>();
        buffers.into_iter().for_each(|h| self.destroy_buffer_locked(&mut storage, h));
        let allocators = storage.allocators.keys().collect::<Vec<_>>();
        allocators.into_iter().for_each(|h| self.destroy_allocator_locked(&mut storage, h));

        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.device.destroy_semaphore(self.timeline, None);
        }
        self.bindless.destroy(&self.device.device);
        self.device.destroy();
    }
}
