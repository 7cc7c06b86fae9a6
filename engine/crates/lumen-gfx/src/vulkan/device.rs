use std::ffi::{CStr, CString};

use ash::vk;
use itertools::Itertools;

use crate::backend::{GfxBackendConfig, GfxCapabilities};
use crate::error::{GfxError, GfxResult};
use crate::vulkan::debug;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// instance、物理设备、逻辑设备以及各种扩展的函数指针
///
/// 只有一个同时支持 compute 和 transfer 的队列，所有提交都走这个队列。
pub(crate) struct VkDevice {
    /// 在 drop 之后会卸载 dll，因此需要最后销毁
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    pub pdevice: vk::PhysicalDevice,
    pub queue_family_index: u32,
    pub device: ash::Device,
    pub queue: vk::Queue,

    /// 仅在设备支持光追时存在
    pub acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    pub ray_tracing_pipeline: Option<ash::khr::ray_tracing_pipeline::Device>,
    pub debug_utils: Option<ash::ext::debug_utils::Device>,

    pub capabilities: GfxCapabilities,
}

struct PhysicalDeviceInfo {
    pdevice: vk::PhysicalDevice,
    name: String,
    queue_family_index: u32,
    is_discrete: bool,
    supports_ray_tracing: bool,
}

impl VkDevice {
    pub fn new(config: &GfxBackendConfig) -> GfxResult<Self> {
        let _span = tracy_client::span!("VkDevice::new");

        let entry =
            unsafe { ash::Entry::load() }.map_err(|e| GfxError::MissingFeature(format!("vulkan loader: {e}")))?;

        let enable_validation = config.enable_validation && Self::has_validation_layer(&entry)?;
        if config.enable_validation && !enable_validation {
            log::warn!("validation layer requested but not available");
        }

        let instance = Self::create_instance(&entry, &config.app_name, enable_validation)?;
        let debug_messenger = if enable_validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = unsafe { loader.create_debug_utils_messenger(&debug::messenger_create_info(), None)? };
            Some((loader, messenger))
        } else {
            None
        };

        let info = Self::pick_physical_device(&instance)?;
        log::info!(
            "selected gpu: {}, queue family: {}, ray tracing: {}",
            info.name,
            info.queue_family_index,
            info.supports_ray_tracing
        );

        let device = Self::create_device(&instance, &info)?;
        let queue = unsafe { device.get_device_queue(info.queue_family_index, 0) };

        let (acceleration_structure, ray_tracing_pipeline) = if info.supports_ray_tracing {
            (
                Some(ash::khr::acceleration_structure::Device::new(&instance, &device)),
                Some(ash::khr::ray_tracing_pipeline::Device::new(&instance, &device)),
            )
        } else {
            (None, None)
        };
        let debug_utils = enable_validation.then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        let capabilities = Self::query_capabilities(&instance, &info, config.descriptor_slots);

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            pdevice: info.pdevice,
            queue_family_index: info.queue_family_index,
            device,
            queue,
            acceleration_structure,
            ray_tracing_pipeline,
            debug_utils,
            capabilities,
        })
    }

    /// 所有由 device 创建的对象都需要在这之前销毁
    pub fn destroy(&mut self) {
        log::info!("destroying vulkan device");
        unsafe {
            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }

    pub fn set_debug_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        unsafe {
            // 命名失败不影响正确性
            let _ = debug_utils.set_debug_utils_object_name(&name_info);
        }
    }
}

// 创建过程的辅助函数
impl VkDevice {
    fn has_validation_layer(entry: &ash::Entry) -> GfxResult<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(layers.iter().any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER)))
    }

    fn create_instance(entry: &ash::Entry, app_name: &str, enable_validation: bool) -> GfxResult<ash::Instance> {
        let app_name = CString::new(app_name).map_err(|e| GfxError::Backend(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"lumen")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let mut extensions = vec![];
        let mut layers = vec![];
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let mut debug_ci = debug::messenger_create_info();
        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        if enable_validation {
            // 覆盖 instance 创建和销毁阶段的消息
            instance_ci = instance_ci.push_next(&mut debug_ci);
        }

        Ok(unsafe { entry.create_instance(&instance_ci, None)? })
    }

    /// 优先选择独立显卡，其次是支持光追的显卡
    fn pick_physical_device(instance: &ash::Instance) -> GfxResult<PhysicalDeviceInfo> {
        let pdevices = unsafe { instance.enumerate_physical_devices()? };

        let candidates = pdevices
            .into_iter()
            .filter_map(|pdevice| Self::inspect_physical_device(instance, pdevice))
            .collect_vec();

        candidates
            .into_iter()
            .max_by_key(|info| (info.is_discrete, info.supports_ray_tracing))
            .ok_or_else(|| GfxError::MissingFeature("no gpu supports vulkan 1.3 with a compute queue".to_string()))
    }

    fn inspect_physical_device(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> Option<PhysicalDeviceInfo> {
        let props = unsafe { instance.get_physical_device_properties(pdevice) };
        let name = props.device_name_as_c_str().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        if props.api_version < vk::API_VERSION_1_3 {
            log::info!("skip gpu {}: vulkan 1.3 is required", name);
            return None;
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        let queue_family_index = queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER))
            .or_else(|| queue_families.iter().position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE)))?
            as u32;

        let extensions = unsafe { instance.enumerate_device_extension_properties(pdevice) }.ok()?;
        let has_ext = |target: &CStr| {
            extensions.iter().any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == target))
        };
        let supports_ray_tracing = Self::ray_tracing_exts().iter().all(|ext| has_ext(ext));

        Some(PhysicalDeviceInfo {
            pdevice,
            name,
            queue_family_index,
            is_discrete: props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
            supports_ray_tracing,
        })
    }

    fn ray_tracing_exts() -> [&'static CStr; 3] {
        [
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_tracing_pipeline::NAME,
            ash::khr::deferred_host_operations::NAME,
        ]
    }

    fn create_device(instance: &ash::Instance, info: &PhysicalDeviceInfo) -> GfxResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_ci = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(info.queue_family_index)
            .queue_priorities(&queue_priorities);

        let extensions = if info.supports_ray_tracing {
            Self::ray_tracing_exts().iter().map(|ext| ext.as_ptr()).collect_vec()
        } else {
            vec![]
        };

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true) // 即使一些 descriptor 是 invalid
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .shader_storage_image_array_non_uniform_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .descriptor_binding_acceleration_structure_update_after_bind(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default().shader_int64(true)) // 用于 buffer device address
            .push_next(&mut features12)
            .push_next(&mut features13);
        if info.supports_ray_tracing {
            features2 = features2.push_next(&mut accel_features).push_next(&mut rt_features);
        }

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_ci))
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        Ok(unsafe { instance.create_device(info.pdevice, &device_ci, None)? })
    }

    fn query_capabilities(instance: &ash::Instance, info: &PhysicalDeviceInfo, descriptor_slots: u32) -> GfxCapabilities {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let limits;
        {
            let mut props2 = vk::PhysicalDeviceProperties2::default();
            if info.supports_ray_tracing {
                props2 = props2.push_next(&mut rt_props).push_next(&mut accel_props);
            }
            unsafe { instance.get_physical_device_properties2(info.pdevice, &mut props2) };
            limits = props2.properties.limits;
        }

        let max_slots = limits.max_descriptor_set_storage_images.min(limits.max_descriptor_set_storage_buffers);
        GfxCapabilities {
            device_name: info.name.clone(),
            ray_tracing: info.supports_ray_tracing,
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment.max(1),
            shader_group_base_alignment: rt_props.shader_group_base_alignment.max(1),
            scratch_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment.max(1),
            max_descriptor_slots: descriptor_slots.min(max_slots),
        }
    }
}
