//! Vulkan context bring-up: instance, surface, physical device, logical
//! device, queues, and the dynamic-rendering / synchronization2 dispatch.
//!
//! Initialization order is fixed: window surface, instance (with
//! debug-utils and portability enumeration when present), physical device
//! selection, logical device with the 1.3 feature set (KHR fallbacks on
//! older devices), then queue and command dispatch resolution. Each step
//! short-circuits with its own error.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{
    DynamicRendering, Surface, Swapchain as SwapchainLoader, Synchronization2,
};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};

use super::window::Window;
use super::{VulkanError, VulkanResult};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Vulkan instance wrapper with optional validation messenger.
pub struct VulkanInstance {
    /// Loaded Vulkan entry points.
    pub entry: Entry,
    /// Instance handle.
    pub instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create the instance. Validation layers are enabled when requested
    /// and actually present; portability enumeration is enabled when the
    /// extension exists (MoltenVK).
    pub fn new(window: &Window, app_name: &str, request_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("failed to load Vulkan: {:?}", e))
        })?;

        let app_name_c = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("app name contains NUL".into()))?;
        let engine_name_c = CString::new("kiln").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_c)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name_c)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let required = window.required_instance_extensions().map_err(|e| {
            VulkanError::InitializationFailed(format!("surface extensions: {}", e))
        })?;
        let mut extension_names: Vec<CString> = required
            .iter()
            .map(|ext| CString::new(ext.as_str()).unwrap())
            .collect();

        let available_extensions = unsafe {
            entry
                .enumerate_instance_extension_properties(None)
                .map_err(VulkanError::Api)?
        };
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        let mut flags = vk::InstanceCreateFlags::empty();
        if has_extension(vk::KhrPortabilityEnumerationFn::name()) {
            extension_names.push(vk::KhrPortabilityEnumerationFn::name().to_owned());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let validation = request_validation && Self::validation_available(&entry)?;
        if validation && has_extension(DebugUtils::name()) {
            extension_names.push(DebugUtils::name().to_owned());
        }

        let extension_ptrs: Vec<*const i8> =
            extension_names.iter().map(|ext| ext.as_ptr()).collect();
        let layer_ptrs: Vec<*const i8> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let debug_utils = if validation {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger = Self::create_messenger(&loader)?;
            log::info!("validation layers enabled");
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn validation_available(entry: &Entry) -> VulkanResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?;
        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER))
    }

    fn create_messenger(loader: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            loader
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = &self.debug_utils {
                loader.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {:?} - {}", message_type, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[vulkan] {:?} - {}", message_type, message);
    }
    vk::FALSE
}

/// Selected physical device plus everything device creation needs to know
/// about it.
pub struct PhysicalDeviceInfo {
    /// Physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version).
    pub properties: vk::PhysicalDeviceProperties,
    /// Graphics queue family index.
    pub graphics_family: u32,
    /// Present queue family index (may equal `graphics_family`).
    pub present_family: u32,
    /// Device supports Vulkan 1.3 core.
    pub has_core_1_3: bool,
    /// `VK_KHR_synchronization2` is available (pre-1.3 fallback).
    pub has_sync2_ext: bool,
    /// `VK_KHR_dynamic_rendering` is available (pre-1.3 fallback).
    pub has_dynamic_rendering_ext: bool,
    /// `VK_KHR_portability_subset` must be enabled on this device.
    pub needs_portability_subset: bool,
}

impl PhysicalDeviceInfo {
    /// Pick the first discrete-or-integrated GPU with graphics and present
    /// support and the required extensions.
    pub fn select(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        let mut fallback: Option<Self> = None;
        for device in devices {
            let info = match Self::evaluate(instance, device, surface, surface_loader) {
                Ok(info) => info,
                Err(_) => continue,
            };
            let device_type = info.properties.device_type;
            if device_type == vk::PhysicalDeviceType::DISCRETE_GPU
                || device_type == vk::PhysicalDeviceType::INTEGRATED_GPU
            {
                log::info!("selected GPU: {}", info.device_name());
                return Ok(info);
            }
            if fallback.is_none() {
                fallback = Some(info);
            }
        }

        if let Some(info) = fallback {
            log::info!("selected GPU (fallback type): {}", info.device_name());
            return Ok(info);
        }
        Err(VulkanError::InitializationFailed(
            "no suitable GPU found".to_string(),
        ))
    }

    fn evaluate(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if graphics_family.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics_family = Some(index);
            }
            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };
            if present_family.is_none() && present_support {
                present_family = Some(index);
            }
            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family.ok_or_else(|| {
            VulkanError::InitializationFailed("no graphics queue family".to_string())
        })?;
        let present_family = present_family.ok_or_else(|| {
            VulkanError::InitializationFailed("no present queue family".to_string())
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let has_ext = |name: &CStr| {
            extensions
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };

        if !has_ext(SwapchainLoader::name()) {
            return Err(VulkanError::InitializationFailed(
                "swapchain extension not supported".to_string(),
            ));
        }

        let has_core_1_3 = properties.api_version >= vk::API_VERSION_1_3;
        let has_sync2_ext = has_ext(vk::KhrSynchronization2Fn::name());
        let has_dynamic_rendering_ext = has_ext(vk::KhrDynamicRenderingFn::name());
        if !has_core_1_3 && (!has_sync2_ext || !has_dynamic_rendering_ext) {
            return Err(VulkanError::InitializationFailed(
                "device has neither Vulkan 1.3 nor the sync2/dynamic-rendering extensions"
                    .to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            graphics_family,
            present_family,
            has_core_1_3,
            has_sync2_ext,
            has_dynamic_rendering_ext,
            needs_portability_subset: has_ext(vk::KhrPortabilitySubsetFn::name()),
        })
    }

    /// Device name as UTF-8.
    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Dispatch for the commands that are core in 1.3 but extension-loaded on
/// older devices.
pub struct RenderCommands {
    core_1_3: bool,
    sync2: Option<Synchronization2>,
    dynamic_rendering: Option<DynamicRendering>,
}

impl RenderCommands {
    /// # Safety
    /// `cb` must be in the recording state.
    pub unsafe fn pipeline_barrier2(
        &self,
        device: &Device,
        cb: vk::CommandBuffer,
        dependency: &vk::DependencyInfo,
    ) {
        if self.core_1_3 {
            device.cmd_pipeline_barrier2(cb, dependency);
        } else if let Some(sync2) = &self.sync2 {
            sync2.cmd_pipeline_barrier2(cb, dependency);
        }
    }

    /// # Safety
    /// `cb` must be in the recording state.
    pub unsafe fn begin_rendering(
        &self,
        device: &Device,
        cb: vk::CommandBuffer,
        info: &vk::RenderingInfo,
    ) {
        if self.core_1_3 {
            device.cmd_begin_rendering(cb, info);
        } else if let Some(dynamic_rendering) = &self.dynamic_rendering {
            dynamic_rendering.cmd_begin_rendering(cb, info);
        }
    }

    /// # Safety
    /// `cb` must be in the recording state, inside a rendering scope.
    pub unsafe fn end_rendering(&self, device: &Device, cb: vk::CommandBuffer) {
        if self.core_1_3 {
            device.cmd_end_rendering(cb);
        } else if let Some(dynamic_rendering) = &self.dynamic_rendering {
            dynamic_rendering.cmd_end_rendering(cb);
        }
    }
}

/// Logical device, queues, and loaders.
pub struct LogicalDevice {
    /// Device function table.
    pub device: Device,
    /// Graphics queue.
    pub graphics_queue: vk::Queue,
    /// Present queue (may be the graphics queue).
    pub present_queue: vk::Queue,
    /// Graphics queue family index.
    pub graphics_family: u32,
    /// Present queue family index.
    pub present_family: u32,
    /// Swapchain extension loader.
    pub swapchain_loader: SwapchainLoader,
    /// Dynamic-rendering / sync2 dispatch.
    pub commands: RenderCommands,
}

impl LogicalDevice {
    /// Create the device with dynamic rendering and synchronization2
    /// enabled, via core 1.3 features or the KHR fallbacks.
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let mut unique_families = vec![physical.graphics_family];
        if physical.present_family != physical.graphics_family {
            unique_families.push(physical.present_family);
        }

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extension_ptrs = vec![SwapchainLoader::name().as_ptr()];
        if physical.needs_portability_subset {
            extension_ptrs.push(vk::KhrPortabilitySubsetFn::name().as_ptr());
        }
        if !physical.has_core_1_3 {
            extension_ptrs.push(vk::KhrSynchronization2Fn::name().as_ptr());
            extension_ptrs.push(vk::KhrDynamicRenderingFn::name().as_ptr());
        }

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut sync2_khr =
            vk::PhysicalDeviceSynchronization2FeaturesKHR::builder().synchronization2(true);
        let mut dynamic_rendering_khr =
            vk::PhysicalDeviceDynamicRenderingFeaturesKHR::builder().dynamic_rendering(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);

        if physical.has_core_1_3 {
            create_info = create_info.push_next(&mut features_1_3);
        } else {
            create_info = create_info
                .push_next(&mut sync2_khr)
                .push_next(&mut dynamic_rendering_khr);
        }

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        let commands = if physical.has_core_1_3 {
            RenderCommands {
                core_1_3: true,
                sync2: None,
                dynamic_rendering: None,
            }
        } else {
            RenderCommands {
                core_1_3: false,
                sync2: Some(Synchronization2::new(instance, &device)),
                dynamic_rendering: Some(DynamicRendering::new(instance, &device)),
            }
        };

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            graphics_family: physical.graphics_family,
            present_family: physical.present_family,
            swapchain_loader,
            commands,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Owns the core Vulkan objects in dependency order.
///
/// Field order matters: the logical device drops before the surface and
/// the surface before the instance.
pub struct VulkanContext {
    /// Logical device and queues.
    pub device: LogicalDevice,
    /// Selected physical device info.
    pub physical: PhysicalDeviceInfo,
    /// Window surface.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: Surface,
    /// Instance (dropped last).
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Bring up the full context against an existing window.
    pub fn new(window: &mut Window, app_name: &str, validation: bool) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, app_name, validation)?;
        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window
            .create_surface(instance.instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(format!("surface: {}", e)))?;
        let physical = PhysicalDeviceInfo::select(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical)?;

        Ok(Self {
            device,
            physical,
            surface,
            surface_loader,
            instance,
        })
    }

    /// Raw `ash::Device` clone for RAII wrappers.
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Device memory properties for memory-type searches.
    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_memory_properties(self.physical.device)
        }
    }

    /// Block until the device is idle. Mandatory before any teardown or
    /// module-pointer invalidation.
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .device
                .device_wait_idle()
                .map_err(VulkanError::from_vk)
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // Remaining fields drop in declaration order: device, then instance.
    }
}
