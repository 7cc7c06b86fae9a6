use ash::vk;

use crate::error::GfxResult;
use crate::kernel::PUSH_CONSTANT_SIZE;
use crate::vulkan::device::VkDevice;

/// 全局的 bindless descriptor set 以及所有 kernel 共享的 pipeline layout
///
/// - binding 0: storage image 数组
/// - binding 1: storage buffer 数组
/// - binding 2: acceleration structure 数组（仅在支持光追时存在）
///
/// 三个数组共用 resource table 的 slot 编号，shader 通过 push constant 中的 slot 访问资源。
pub(crate) struct VkBindless {
    pub set_layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    pub pipeline_layout: vk::PipelineLayout,
    pub push_constant_stages: vk::ShaderStageFlags,
    pub slot_count: u32,
}

impl VkBindless {
    pub const BINDING_STORAGE_IMAGE: u32 = 0;
    pub const BINDING_STORAGE_BUFFER: u32 = 1;
    pub const BINDING_ACCEL: u32 = 2;

    pub fn new(vk_device: &VkDevice) -> GfxResult<Self> {
        let device = &vk_device.device;
        let slot_count = vk_device.capabilities.max_descriptor_slots;
        let ray_tracing = vk_device.capabilities.ray_tracing;

        let mut stages = vk::ShaderStageFlags::COMPUTE;
        if ray_tracing {
            stages |= vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::MISS_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        }

        let mut bindings = vec![
            vk::DescriptorSetLayoutBinding::default()
                .binding(Self::BINDING_STORAGE_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(slot_count)
                .stage_flags(stages),
            vk::DescriptorSetLayoutBinding::default()
                .binding(Self::BINDING_STORAGE_BUFFER)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(slot_count)
                .stage_flags(stages),
        ];
        if ray_tracing {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(Self::BINDING_ACCEL)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .descriptor_count(slot_count)
                    .stage_flags(stages),
            );
        }
        let binding_flags = vec![
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            bindings.len()
        ];

        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let set_layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_ci);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_ci, None)? };
        vk_device.set_debug_name(set_layout, "bindless-set-layout");

        let pool_sizes = bindings
            .iter()
            .map(|binding| vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: slot_count,
            })
            .collect::<Vec<_>>();
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_ci, None)? };

        let set_alloc_info =
            vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(std::slice::from_ref(&set_layout));
        let set = unsafe { device.allocate_descriptor_sets(&set_alloc_info)?[0] };
        vk_device.set_debug_name(set, "bindless-set");

        let push_constant_range = vk::PushConstantRange::default().stage_flags(stages).offset(0).size(PUSH_CONSTANT_SIZE);
        let pipeline_layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_constant_range));
        let pipeline_layout = unsafe { device.create_pipeline_layout(&pipeline_layout_ci, None)? };
        vk_device.set_debug_name(pipeline_layout, "global-pipeline-layout");

        Ok(Self {
            set_layout,
            pool,
            set,
            pipeline_layout,
            push_constant_stages: stages,
            slot_count,
        })
    }

    pub fn write_storage_image(&self, device: &ash::Device, slot: u32, view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo::default().image_view(view).image_layout(vk::ImageLayout::GENERAL);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(Self::BINDING_STORAGE_IMAGE)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    pub fn write_storage_buffer(&self, device: &ash::Device, slot: u32, buffer: vk::Buffer) {
        let buffer_info = vk::DescriptorBufferInfo::default().buffer(buffer).offset(0).range(vk::WHOLE_SIZE);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(Self::BINDING_STORAGE_BUFFER)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    pub fn write_accel(&self, device: &ash::Device, slot: u32, accel: vk::AccelerationStructureKHR) {
        let mut accel_info =
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(std::slice::from_ref(&accel));
        // acceleration structure 的数量不会被 push_next 自动设置
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(Self::BINDING_ACCEL)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .push_next(&mut accel_info);
        unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}
