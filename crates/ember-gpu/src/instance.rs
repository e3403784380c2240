//! Vulkan instance creation.

use std::borrow::Cow;
use std::ffi::{c_char, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::{CreateStep, GpuError, Result};
use crate::handle::{Root, Unique};

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance creation parameters.
#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub app_name: String,
    pub enable_validation: bool,
    /// Display to enable surface extensions for, if presenting.
    pub display: Option<RawDisplayHandle>,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            app_name: "ember".to_string(),
            enable_validation: cfg!(debug_assertions),
            display: None,
        }
    }
}

/// Owned Vulkan instance with its loader and optional debug messenger.
///
/// Field order is drop order: the messenger goes before the instance, the
/// instance before the library entry.
pub struct Instance {
    debug_messenger: Unique<vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance>,
    surface_loader: Option<ash::khr::surface::Instance>,
    raw: Root<ash::Instance>,
    entry: ash::Entry,
}

impl Instance {
    /// Load Vulkan and create an instance.
    pub fn new(desc: &InstanceDesc) -> Result<Self> {
        // SAFETY: loading the system Vulkan library has no other preconditions.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loader(e.to_string()))?;

        let app_name = CString::new(desc.app_name.as_str())
            .map_err(|e| GpuError::InvalidState(format!("Application name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"ember")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extension_names: Vec<*const c_char> = Vec::new();
        if let Some(display) = desc.display {
            let surface_extensions = ash_window::enumerate_required_extensions(display)
                .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
            extension_names.extend_from_slice(surface_extensions);
        }

        let layers = if desc.enable_validation {
            available_layers(&entry, &validation_layers())?
        } else {
            Vec::new()
        };
        let validation = !layers.is_empty();
        if validation {
            extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        #[cfg(target_os = "macos")]
        let create_flags = {
            extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        };
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        // SAFETY: all pointers in `create_info` outlive the call.
        let raw = unsafe { entry.create_instance(&create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateInstance))?;
        // SAFETY: freshly created, owned by nobody else.
        let raw = unsafe { Root::new(raw) };

        let debug_loader = ash::ext::debug_utils::Instance::new(&entry, &raw);
        let debug_messenger = if validation {
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            // SAFETY: the instance was created with the debug utils extension.
            let messenger = unsafe { debug_loader.create_debug_utils_messenger(&messenger_info, None) }
                .map_err(GpuError::step(CreateStep::CreateDebugMessenger))?;
            // SAFETY: freshly created from `debug_loader`.
            unsafe { Unique::new(debug_loader, messenger) }
        } else {
            Unique::default()
        };

        let surface_loader = desc
            .display
            .map(|_| ash::khr::surface::Instance::new(&entry, &raw));

        tracing::debug!(
            app = %desc.app_name,
            validation,
            "Created Vulkan instance"
        );

        Ok(Self {
            debug_messenger,
            surface_loader,
            raw,
            entry,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    /// Surface extension loader, present when created for a display.
    pub fn surface_loader(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref()
    }

    pub fn has_debug_messenger(&self) -> bool {
        !self.debug_messenger.is_null()
    }
}

fn available_layers(entry: &ash::Entry, wanted: &[&'static CStr]) -> Result<Vec<&'static CStr>> {
    // SAFETY: plain enumeration call.
    let available = unsafe { entry.enumerate_instance_layer_properties() }?;
    let mut found = Vec::with_capacity(wanted.len());
    for &layer in wanted {
        let present = available
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == layer));
        if present {
            found.push(layer);
        } else {
            tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
        }
    }
    Ok(found)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes valid callback data for the duration of the call.
    let message = unsafe { data.as_ref() }
        .filter(|d| !d.p_message.is_null())
        .map_or(Cow::Borrowed(""), |d| {
            // SAFETY: checked non-null above; the driver NUL-terminates it.
            unsafe { CStr::from_ptr(d.p_message) }.to_string_lossy()
        });

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(?kind, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(?kind, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(?kind, "{message}");
    } else {
        tracing::trace!(?kind, "{message}");
    }
    vk::FALSE
}
