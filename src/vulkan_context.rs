//! Vulkan initialization: instance, device, compute queue, allocator, immediate-submit objects.
//!
//! The context is headless. It requires Vulkan 1.3 with `VK_EXT_descriptor_buffer`, since every
//! compute pass binds its images through descriptor buffers instead of descriptor sets.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{info, warn};
use std::ffi::{CStr, CString};

/// Upper bound on a single immediate submit. Exceeding it means the device is lost or hung.
pub const IMMEDIATE_SUBMIT_TIMEOUT_NS: u64 = 10_000_000_000;

/// Holds all core Vulkan state for the baker.
///
/// Fields are ordered so that Rust's drop order (top-to-bottom declaration)
/// destroys resources before the device/instance they depend on.
pub struct VulkanContext {
    pub descriptor_buffer_loader: ash::ext::descriptor_buffer::Device,
    pub descriptor_buffer_properties: vk::PhysicalDeviceDescriptorBufferPropertiesEXT<'static>,

    // Allocator must be dropped before device, wrapped in Option so we can take() in destroy
    allocator_inner: Option<Allocator>,

    immediate_fence: vk::Fence,
    immediate_cmd: vk::CommandBuffer,

    pub command_pool: vk::CommandPool,
    pub queue: vk::Queue,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    // Debug utils (only in debug builds), must be destroyed before instance
    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub instance: ash::Instance,
    pub entry: ash::Entry,

    /// Whether destroy() has been called explicitly
    destroyed: bool,
}

impl VulkanContext {
    /// Create a new headless VulkanContext.
    pub fn new() -> Result<Self, String> {
        // --- Entry ---
        let entry = unsafe {
            ash::Entry::load().map_err(|e| format!("Failed to load Vulkan: {}", e))?
        };

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"ibl-bake")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"ibl-bake")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 3, 0));

        let mut layer_names: Vec<CString> = Vec::new();
        let mut extension_names: Vec<CString> = Vec::new();

        // Enable validation layers in debug builds
        let enable_validation = cfg!(debug_assertions);
        if enable_validation {
            let validation_layer = c"VK_LAYER_KHRONOS_validation";
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer
            });
            if has_validation {
                layer_names.push(validation_layer.to_owned());
                extension_names.push(ash::ext::debug_utils::NAME.to_owned());
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const i8> =
            layer_names.iter().map(|n| n.as_ptr()).collect();
        let extension_name_ptrs: Vec<*const i8> =
            extension_names.iter().map(|n| n.as_ptr()).collect();

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_name_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if enable_validation
            && extension_names
                .iter()
                .any(|n| n.as_c_str() == ash::ext::debug_utils::NAME)
        {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));

            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .ok()
            };

            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Physical device selection ---
        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?
        };

        if physical_devices.is_empty() {
            return Err("No Vulkan-capable GPUs found".to_string());
        }

        let mut selected: Option<(vk::PhysicalDevice, u32, bool)> = None;

        for &phys_dev in &physical_devices {
            let props = unsafe { instance.get_physical_device_properties(phys_dev) };
            let api_version = props.api_version;

            if vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3 {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
            let compute_family = queue_families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE));

            let Some(family_idx) = compute_family else {
                continue;
            };

            let dev_extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(phys_dev)
                    .unwrap_or_default()
            };
            let has_descriptor_buffer = dev_extensions.iter().any(|e| {
                let name = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
                name == ash::ext::descriptor_buffer::NAME
            });
            if !has_descriptor_buffer {
                continue;
            }

            let mut db_features = vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default();
            let mut features2 =
                vk::PhysicalDeviceFeatures2::default().push_next(&mut db_features);
            unsafe { instance.get_physical_device_features2(phys_dev, &mut features2) };
            if db_features.descriptor_buffer == vk::FALSE {
                continue;
            }

            let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            let replace = match selected {
                None => true,
                Some((_, _, current_discrete)) => is_discrete && !current_discrete,
            };

            if replace {
                selected = Some((phys_dev, family_idx as u32, is_discrete));

                let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!(
                    "Selected GPU: {} (Vulkan {}.{}, discrete: {})",
                    dev_name.to_string_lossy(),
                    vk::api_version_major(api_version),
                    vk::api_version_minor(api_version),
                    if is_discrete { "yes" } else { "no" }
                );
            }
        }

        let (physical_device, queue_family, _) = selected.ok_or(
            "No suitable GPU found (need Vulkan 1.3 with a compute queue and VK_EXT_descriptor_buffer)",
        )?;

        // --- Device creation ---
        let queue_priority = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priority);
        let queue_create_infos = [queue_create_info];

        let device_ext_ptrs = [ash::ext::descriptor_buffer::NAME.as_ptr()];

        let mut vulkan_12_features =
            vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let mut vulkan_13_features =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut descriptor_buffer_features =
            vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default().descriptor_buffer(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut vulkan_13_features)
            .push_next(&mut descriptor_buffer_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| format!("Failed to create logical device: {:?}", e))?
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        // --- Command pool and immediate-submit objects ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create command pool: {:?}", e))?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let immediate_cmd = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate immediate command buffer: {:?}", e))?[0]
        };

        // Created signaled so the first begin_immediate can reset it unconditionally
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let immediate_fence = unsafe {
            device
                .create_fence(&fence_info, None)
                .map_err(|e| format!("Failed to create immediate fence: {:?}", e))?
        };

        // --- gpu-allocator ---
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| format!("Failed to create GPU allocator: {:?}", e))?;

        // --- Descriptor buffer loader and properties ---
        let descriptor_buffer_loader =
            ash::ext::descriptor_buffer::Device::new(&instance, &device);

        let mut db_props = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut db_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }

        info!(
            "Descriptor buffer properties: offset_alignment={}, combined_image_sampler={}, storage_image={}, uniform_buffer={}",
            db_props.descriptor_buffer_offset_alignment,
            db_props.combined_image_sampler_descriptor_size,
            db_props.storage_image_descriptor_size,
            db_props.uniform_buffer_descriptor_size
        );

        // The properties struct is plain-old-data once p_next is cleared.
        db_props.p_next = std::ptr::null_mut();
        let db_props_static: vk::PhysicalDeviceDescriptorBufferPropertiesEXT<'static> =
            unsafe { std::mem::transmute(db_props) };

        info!("Vulkan context initialized successfully");

        Ok(VulkanContext {
            descriptor_buffer_loader,
            descriptor_buffer_properties: db_props_static,
            allocator_inner: Some(allocator),
            immediate_fence,
            immediate_cmd,
            command_pool,
            queue,
            physical_device,
            device,
            debug_utils_loader,
            debug_messenger,
            instance,
            entry,
            destroyed: false,
        })
    }

    /// Get a mutable reference to the allocator.
    pub fn allocator_mut(&mut self) -> Result<&mut Allocator, String> {
        self.allocator_inner
            .as_mut()
            .ok_or_else(|| "Allocator already destroyed".to_string())
    }

    /// Whether `format` supports linear filtering in optimal tiling (needed for blit mip chains).
    pub fn supports_linear_blit(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    /// Reset and begin the shared immediate command buffer.
    ///
    /// The returned buffer must be handed back to [`VulkanContext::end_immediate`].
    pub fn begin_immediate_commands(&self) -> Result<vk::CommandBuffer, String> {
        unsafe {
            self.device
                .reset_fences(&[self.immediate_fence])
                .map_err(|e| format!("Failed to reset immediate fence: {:?}", e))?;
            self.device
                .reset_command_buffer(self.immediate_cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| format!("Failed to reset immediate command buffer: {:?}", e))?;
        }

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(self.immediate_cmd, &begin_info)
                .map_err(|e| format!("Failed to begin command buffer: {:?}", e))?;
        }

        Ok(self.immediate_cmd)
    }

    /// End, submit, and block until the immediate command buffer has executed.
    pub fn end_immediate(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        if cmd != self.immediate_cmd {
            return Err("end_immediate called with a foreign command buffer".to_string());
        }

        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;
        }

        let cmd_bufs = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], self.immediate_fence)
                .map_err(|e| format!("Failed to submit command buffer: {:?}", e))?;

            self.device
                .wait_for_fences(&[self.immediate_fence], true, IMMEDIATE_SUBMIT_TIMEOUT_NS)
                .map_err(|e| match e {
                    vk::Result::TIMEOUT => format!(
                        "Immediate submit did not complete within {} ms (device lost or hung)",
                        IMMEDIATE_SUBMIT_TIMEOUT_NS / 1_000_000
                    ),
                    other => format!("Failed to wait for immediate fence: {:?}", other),
                })?;
        }

        Ok(())
    }

    /// Explicitly destroy all Vulkan resources in the correct order.
    ///
    /// The Drop impl will also call this if it hasn't been called yet.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_fence(self.immediate_fence, None);
            // Frees the immediate command buffer with it
            self.device.destroy_command_pool(self.command_pool, None);
        }

        // Drop allocator (needs device alive)
        drop(self.allocator_inner.take());

        // Destroy debug messenger before instance
        unsafe {
            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Vulkan debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "Unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "Empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {}", msg);
    } else {
        log::info!("[Vulkan] {}", msg);
    }

    vk::FALSE
}
