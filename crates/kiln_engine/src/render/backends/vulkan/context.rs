//! Vulkan context management
//!
//! Instance, validation messenger, physical device selection and logical
//! device creation. The context is an explicitly constructed object owned
//! by the backend; nothing here is process-global.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::{Device, Entry, Instance};
use std::ffi::{CStr, CString};
use thiserror::Error;

use crate::render::surface::RenderSurface;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, optionally with the validation layer
    pub fn new(surface: &dyn RenderSurface, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name = CString::new("kiln").unwrap();
        let engine_name = CString::new("KilnEngine").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let required_extensions =
            ash_window::enumerate_required_extensions(surface.raw_display_handle())
                .map_err(VulkanError::Api)?;
        let mut extensions: Vec<*const i8> = required_extensions.to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            vec![]
        };
        let layer_names_ptrs: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
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
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Validation-layer messages go through the engine's normal logging
/// channel, not a separate one.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select a suitable physical device for rendering
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        for device in devices {
            if let Ok(device_info) = Self::evaluate_device(instance, device, surface, surface_loader)
            {
                log::info!("Selected GPU: {}", unsafe {
                    CStr::from_ptr(device_info.properties.device_name.as_ptr()).to_string_lossy()
                });
                return Ok(device_info);
            }
        }

        Err(VulkanError::InitializationFailed(
            "No suitable GPU found".to_string(),
        ))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };
            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;
        let present_family = present_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No present queue family found".to_string())
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let required_extensions = [SwapchainLoader::name()];
        let has_required_extensions = required_extensions.iter().all(|required| {
            extensions.iter().any(|available| {
                let extension_name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                extension_name == *required
            })
        });
        if !has_required_extensions {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            features,
            graphics_family,
            present_family,
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Index of the graphics queue family
    pub graphics_family: u32,
}

impl LogicalDevice {
    /// Create a new logical device with graphics and present queues
    pub fn new(instance: &Instance, physical_device_info: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let unique_families: std::collections::HashSet<u32> = [
            physical_device_info.graphics_family,
            physical_device_info.present_family,
        ]
        .iter()
        .cloned()
        .collect();

        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&[1.0])
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];
        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical_device_info.features.sampler_anisotropy != 0)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue =
            unsafe { device.get_device_queue(physical_device_info.graphics_family, 0) };
        let present_queue =
            unsafe { device.get_device_queue(physical_device_info.present_family, 0) };

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            graphics_family: physical_device_info.graphics_family,
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

/// Owns the core Vulkan objects: instance, surface, devices and queues
///
/// Constructed once per backend at `init_video` time and passed by
/// reference to everything that needs it.
pub struct VulkanContext {
    /// Vulkan surface for presentation
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device and queues
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a Vulkan context over the given window surface
    pub fn new(surface_provider: &dyn RenderSurface, enable_validation: bool) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(surface_provider, enable_validation)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                surface_provider.raw_display_handle(),
                surface_provider.raw_window_handle(),
                None,
            )
            .map_err(VulkanError::Api)?
        };

        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            device,
            instance,
        })
    }

    /// Get the raw `ash::Device`, cloned for resource wrappers
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Block until all GPU work has retired
    pub fn wait_idle(&self) {
        unsafe {
            if let Err(e) = self.device.device.device_wait_idle() {
                log::error!("device_wait_idle failed: {:?}", e);
            }
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // Remaining fields drop in declaration order; `instance` is last
        // so the device is destroyed before the instance.
    }
}
