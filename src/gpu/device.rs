// Device bootstrap - instance, surface, adapter selection, logical device
//
// Adapter selection is a pure scoring pass over plain `AdapterInfo` records
// gathered up front: hard requirements zero the score, survivors rank by
// device class. The same input always picks the same adapter.

use std::ffi::{CStr, CString};

use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::error::{GpuError, Result, VkCall};

/// Core features every scored adapter must expose.
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Everything the selection policy needs to know about one adapter,
/// gathered up front so the policy itself runs on plain data.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub api_version: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub supports_swapchain_ext: bool,
    pub supports_dynamic_rendering_ext: bool,
    pub timeline_semaphore: bool,
    pub buffer_device_address: bool,
    pub descriptor_indexing: bool,
    pub dynamic_rendering: bool,
    pub sampler_anisotropy: bool,
    pub has_device_local_memory: bool,
    pub graphics_present_family: Option<u32>,
    pub present_mode_count: usize,
    pub has_compatible_surface_format: bool,
}

/// Score one adapter. Zero means unusable; otherwise higher is better.
pub fn score_adapter(info: &AdapterInfo) -> u32 {
    let usable = info.api_version >= vk::API_VERSION_1_2
        && info.supports_swapchain_ext
        && info.supports_dynamic_rendering_ext
        && info.timeline_semaphore
        && info.buffer_device_address
        && info.descriptor_indexing
        && info.dynamic_rendering
        && info.sampler_anisotropy
        && info.has_device_local_memory
        && info.graphics_present_family.is_some()
        && info.present_mode_count > 0
        && info.has_compatible_surface_format;
    if !usable {
        return 0;
    }
    match info.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// Pick the best-scoring adapter. Ties keep enumeration order.
pub fn pick_adapter(infos: &[AdapterInfo]) -> Option<usize> {
    let mut best = None;
    let mut best_score = 0;
    for (index, info) in infos.iter().enumerate() {
        let score = score_adapter(info);
        if score > best_score {
            best_score = score;
            best = Some(index);
        }
    }
    best
}

fn is_compatible_surface_format(format: vk::SurfaceFormatKHR) -> bool {
    let channels_ok = matches!(
        format.format,
        vk::Format::B8G8R8A8_SRGB
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::R8G8B8A8_UNORM
    );
    channels_ok && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
}

/// Owns the instance, surface, and logical device plus the single
/// graphics+present queue everything in the layer submits to.
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    pub instance: ash::Instance,
    _entry: Entry,

    pub queue: vk::Queue,
    pub queue_family: u32,

    pub dynamic_rendering: khr::DynamicRendering,

    debug_utils: ext::DebugUtils,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    naming: bool,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        validation: bool,
        naming: bool,
    ) -> Result<Self> {
        let entry = unsafe { Entry::load() }?;

        let instance = Self::create_instance(&entry, display_handle, validation)?;

        let debug_utils = ext::DebugUtils::new(&entry, &instance);
        let messenger = if validation {
            Some(Self::create_messenger(&debug_utils)?)
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .vk_call("vkCreateSurfaceKHR")?;

        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .vk_call("vkEnumeratePhysicalDevices")?;
        let mut infos = Vec::with_capacity(physical_devices.len());
        for &physical_device in &physical_devices {
            let info =
                Self::gather_adapter_info(&instance, &surface_loader, surface, physical_device)?;
            log::debug!("adapter {:?}: score {}", info.name, score_adapter(&info));
            infos.push(info);
        }
        let picked = pick_adapter(&infos).ok_or_else(|| {
            GpuError::MissingCapability("no adapter satisfies the device requirements".into())
        })?;
        let physical_device = physical_devices[picked];
        let info = &infos[picked];
        let queue_family = info
            .graphics_present_family
            .expect("picked adapter has a graphics+present family");

        log::info!(
            "Selected GPU: {} ({:?}, API {}.{}.{})",
            info.name,
            info.device_type,
            vk::api_version_major(info.api_version),
            vk::api_version_minor(info.api_version),
            vk::api_version_patch(info.api_version)
        );

        let (device, queue) = Self::create_logical_device(&instance, physical_device, queue_family)?;
        let dynamic_rendering = khr::DynamicRendering::new(&instance, &device);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(Self {
            device,
            physical_device,
            surface,
            surface_loader,
            instance,
            _entry: entry,
            queue,
            queue_family,
            dynamic_rendering,
            debug_utils,
            messenger,
            naming,
            properties,
            memory_properties,
        })
    }

    fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        validation: bool,
    ) -> Result<ash::Instance> {
        let app_name = c"kindling";
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .vk_call("vkEnumerateInstanceExtensionProperties")?
            .to_vec();
        extensions.push(ext::DebugUtils::name().as_ptr());

        let layers = if validation {
            log::info!("Validation layers enabled");
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        unsafe { entry.create_instance(&create_info, None) }.vk_call("vkCreateInstance")
    }

    fn create_messenger(debug_utils: &ext::DebugUtils) -> Result<vk::DebugUtilsMessengerEXT> {
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

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .vk_call("vkCreateDebugUtilsMessengerEXT")
    }

    fn gather_adapter_info(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<AdapterInfo> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .vk_call("vkEnumerateDeviceExtensionProperties")?;
        let has_extension = |wanted: &CStr| {
            extensions
                .iter()
                .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == wanted)
        };

        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut dynamic_rendering = vk::PhysicalDeviceDynamicRenderingFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut vulkan12)
            .push_next(&mut dynamic_rendering)
            .build();
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

        let descriptor_indexing = vulkan12.descriptor_binding_partially_bound == vk::TRUE
            && vulkan12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
            && vulkan12.descriptor_binding_update_unused_while_pending == vk::TRUE
            && vulkan12.runtime_descriptor_array == vk::TRUE
            && vulkan12.shader_sampled_image_array_non_uniform_indexing == vk::TRUE;

        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let has_device_local_memory = memory.memory_types[..memory.memory_type_count as usize]
            .iter()
            .any(|t| t.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut graphics_present_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let present = unsafe {
                surface_loader.get_physical_device_surface_support(
                    physical_device,
                    index as u32,
                    surface,
                )
            }
            .vk_call("vkGetPhysicalDeviceSurfaceSupportKHR")?;
            if present {
                graphics_present_family = Some(index as u32);
                break;
            }
        }

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }
        .vk_call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .vk_call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        Ok(AdapterInfo {
            name,
            api_version: properties.api_version,
            device_type: properties.device_type,
            supports_swapchain_ext: has_extension(khr::Swapchain::name()),
            supports_dynamic_rendering_ext: has_extension(khr::DynamicRendering::name()),
            timeline_semaphore: vulkan12.timeline_semaphore == vk::TRUE,
            buffer_device_address: vulkan12.buffer_device_address == vk::TRUE,
            descriptor_indexing,
            dynamic_rendering: dynamic_rendering.dynamic_rendering == vk::TRUE,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            has_device_local_memory,
            graphics_present_family,
            present_mode_count: present_modes.len(),
            has_compatible_surface_format: formats
                .iter()
                .any(|&f| is_compatible_surface_format(f)),
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [
            khr::Swapchain::name().as_ptr(),
            khr::DynamicRendering::name().as_ptr(),
        ];

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_update_unused_while_pending(true)
            .runtime_descriptor_array(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let mut dynamic_rendering =
            vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES)
            .push_next(&mut vulkan12)
            .push_next(&mut dynamic_rendering);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .vk_call("vkCreateDevice")?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    /// Attach a debug name to a native object. No-op when naming is off.
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if !self.naming {
            return;
        }
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        let _ = unsafe {
            self.debug_utils
                .set_debug_utils_object_name(self.device.handle(), &info)
        };
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk_call("vkDeviceWaitIdle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context");
        let _ = self.wait_idle();
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(messenger) = self.messenger.take() {
                self.debug_utils
                    .destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable(device_type: vk::PhysicalDeviceType) -> AdapterInfo {
        AdapterInfo {
            name: "test adapter".into(),
            api_version: vk::API_VERSION_1_3,
            device_type,
            supports_swapchain_ext: true,
            supports_dynamic_rendering_ext: true,
            timeline_semaphore: true,
            buffer_device_address: true,
            descriptor_indexing: true,
            dynamic_rendering: true,
            sampler_anisotropy: true,
            has_device_local_memory: true,
            graphics_present_family: Some(0),
            present_mode_count: 2,
            has_compatible_surface_format: true,
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let info = capable(vk::PhysicalDeviceType::DISCRETE_GPU);
        let first = score_adapter(&info);
        for _ in 0..10 {
            assert_eq!(score_adapter(&info), first);
        }
        assert_eq!(first, 1000);
    }

    #[test]
    fn every_missing_capability_rejects() {
        let cases: &[(&str, fn(&mut AdapterInfo))] = &[
            ("api below 1.2", |a| a.api_version = vk::API_VERSION_1_1),
            ("no swapchain extension", |a| a.supports_swapchain_ext = false),
            ("no dynamic rendering extension", |a| {
                a.supports_dynamic_rendering_ext = false
            }),
            ("no timeline semaphores", |a| a.timeline_semaphore = false),
            ("no buffer device address", |a| a.buffer_device_address = false),
            ("no descriptor indexing", |a| a.descriptor_indexing = false),
            ("no dynamic rendering feature", |a| a.dynamic_rendering = false),
            ("no sampler anisotropy", |a| a.sampler_anisotropy = false),
            ("no device-local memory", |a| a.has_device_local_memory = false),
            ("no graphics+present family", |a| {
                a.graphics_present_family = None
            }),
            ("no present modes", |a| a.present_mode_count = 0),
            ("no compatible surface format", |a| {
                a.has_compatible_surface_format = false
            }),
        ];
        for (what, mutate) in cases {
            let mut info = capable(vk::PhysicalDeviceType::DISCRETE_GPU);
            mutate(&mut info);
            assert_eq!(score_adapter(&info), 0, "{what} should reject");
        }
    }

    #[test]
    fn device_class_ordering() {
        let discrete = score_adapter(&capable(vk::PhysicalDeviceType::DISCRETE_GPU));
        let integrated = score_adapter(&capable(vk::PhysicalDeviceType::INTEGRATED_GPU));
        let virtual_gpu = score_adapter(&capable(vk::PhysicalDeviceType::VIRTUAL_GPU));
        let cpu = score_adapter(&capable(vk::PhysicalDeviceType::CPU));
        assert!(discrete > integrated);
        assert!(integrated > virtual_gpu);
        assert!(virtual_gpu > cpu);
        assert!(cpu > 0);
    }

    #[test]
    fn pick_prefers_best_class() {
        let infos = vec![
            capable(vk::PhysicalDeviceType::CPU),
            capable(vk::PhysicalDeviceType::INTEGRATED_GPU),
            capable(vk::PhysicalDeviceType::DISCRETE_GPU),
            capable(vk::PhysicalDeviceType::VIRTUAL_GPU),
        ];
        assert_eq!(pick_adapter(&infos), Some(2));
    }

    #[test]
    fn tie_break_keeps_enumeration_order() {
        let infos = vec![
            capable(vk::PhysicalDeviceType::DISCRETE_GPU),
            capable(vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(pick_adapter(&infos), Some(0));
    }

    #[test]
    fn pick_rejects_when_nothing_scores() {
        let mut unusable = capable(vk::PhysicalDeviceType::DISCRETE_GPU);
        unusable.graphics_present_family = None;
        assert_eq!(pick_adapter(&[unusable]), None);
        assert_eq!(pick_adapter(&[]), None);
    }

    #[test]
    fn surface_format_compatibility() {
        let good = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert!(is_compatible_surface_format(good));

        let wrong_space = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        assert!(!is_compatible_surface_format(wrong_space));

        let wrong_format = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert!(!is_compatible_surface_format(wrong_format));
    }
}
