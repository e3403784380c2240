//! GPU context management.

use std::ffi::c_char;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::command::OneTimeCommands;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::{Destroy, Root};
use crate::instance::{Instance, InstanceDesc};
use crate::queue::{find_queue_family, QueueFamilyRequirements, TieBreak};
use crate::selector::{find_physical_device, DeviceRequirements, PhysicalDeviceCandidate};
use crate::surface::Surface;

/// Logical device shared by every resource created from it.
///
/// Resources hold an `Arc<Device>` as the parent of their handles, so the
/// device is destroyed only after the last of them, and the instance only
/// after the device.
pub struct Device {
    raw: Root<ash::Device>,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: vk::DeviceSize,
    name: String,
    instance: Arc<Instance>,
}

impl Device {
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Alignment of flushed and invalidated ranges on non-coherent memory.
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.non_coherent_atom_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Format capabilities of the physical device.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        // SAFETY: the physical device belongs to the instance held by `self`.
        unsafe {
            self.instance
                .raw()
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &ash::Device {
        &self.raw
    }
}

impl<H> Destroy<H> for Device
where
    ash::Device: Destroy<H>,
{
    unsafe fn destroy(&self, handle: H) {
        // SAFETY: forwarded from the caller.
        unsafe { self.raw.destroy(handle) }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("physical_device", &self.physical_device)
            .finish_non_exhaustive()
    }
}

/// Main GPU context: a selected device and one queue.
pub struct GpuContext {
    // Dropped before the device so the surface goes before the instance.
    surface: Option<Surface>,
    device: Arc<Device>,
    candidate: PhysicalDeviceCandidate,
    queue_family: u32,
    queue: vk::Queue,
}

impl GpuContext {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    /// Snapshot the device was selected from.
    pub fn candidate(&self) -> &PhysicalDeviceCandidate {
        &self.candidate
    }

    /// One-time submission helper on this context's queue.
    pub fn one_time_commands(&self) -> Result<OneTimeCommands> {
        OneTimeCommands::new(&self.device, self.queue_family, self.queue)
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is live while `self` is.
        unsafe { self.device.device_wait_idle() }
            .map_err(GpuError::step(CreateStep::WaitIdle))
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: the device is live while `self` is.
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            tracing::warn!("device_wait_idle failed during shutdown: {e}");
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    requirements: DeviceRequirements,
    queue: QueueFamilyRequirements,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "ember".to_string(),
            enable_validation: cfg!(debug_assertions),
            requirements: DeviceRequirements::default(),
            queue: QueueFamilyRequirements::default(),
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Physical device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Requirements for the context's queue.
    pub fn queue(mut self, queue: QueueFamilyRequirements) -> Self {
        self.queue = queue;
        self
    }

    /// Build a context without presentation.
    pub fn build(self) -> Result<GpuContext> {
        let instance = Arc::new(Instance::new(&self.instance_desc(None))?);
        self.finish(instance, None)
    }

    /// Build a context that can present to `window`.
    pub fn build_for_window<W>(mut self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();
        let instance = Arc::new(Instance::new(&self.instance_desc(Some(display)))?);
        let surface = Surface::from_window(&instance, window)?;

        if self.requirements.surface.is_none() {
            self.requirements.surface = Some(crate::selector::SurfaceRequirements::default());
        }
        self.queue.present = true;
        self.finish(instance, Some(surface))
    }

    fn instance_desc(&self, display: Option<raw_window_handle::RawDisplayHandle>) -> InstanceDesc {
        InstanceDesc {
            app_name: self.app_name.clone(),
            enable_validation: self.enable_validation,
            display,
        }
    }

    fn finish(self, instance: Arc<Instance>, surface: Option<Surface>) -> Result<GpuContext> {
        // SAFETY: the instance is live.
        let physical_devices = unsafe { instance.raw().enumerate_physical_devices() }?;

        let surface_query = match (&surface, instance.surface_loader()) {
            (Some(surface), Some(loader)) => Some((loader, surface.handle())),
            _ => None,
        };

        let candidates = physical_devices
            .iter()
            // SAFETY: devices were just enumerated from this instance.
            .map(|&pd| unsafe { PhysicalDeviceCandidate::query(instance.raw(), pd, surface_query) })
            .collect::<Result<Vec<_>>>()?;

        let index = find_physical_device(&candidates, &self.requirements)?;
        let physical_device = physical_devices[index];
        let candidate = candidates[index].clone();

        let queue_family =
            find_queue_family(&candidate.queue_families, &self.queue, TieBreak::Optimal)?;

        tracing::info!(
            "Selected GPU: {} ({:?}), queue family {}",
            candidate.name,
            candidate.device_type,
            queue_family
        );

        let queue_priority = 1.0_f32;
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(std::slice::from_ref(&queue_priority))];

        let mut extension_names: Vec<*const c_char> = Vec::new();
        if surface.is_some() {
            extension_names.push(ash::khr::swapchain::NAME.as_ptr());
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);

        // SAFETY: `physical_device` belongs to `instance`; pointers outlive the call.
        let raw = unsafe { instance.raw().create_device(physical_device, &device_create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateDevice))?;
        // SAFETY: the queue was requested in `queue_create_infos`.
        let queue = unsafe { raw.get_device_queue(queue_family, 0) };
        // SAFETY: `physical_device` belongs to `instance`.
        let limits = unsafe { instance.raw().get_physical_device_properties(physical_device) }.limits;

        let device = Arc::new(Device {
            // SAFETY: freshly created, owned by nobody else.
            raw: unsafe { Root::new(raw) },
            physical_device,
            memory_properties: candidate.memory_properties,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            name: candidate.name.clone(),
            instance,
        });

        Ok(GpuContext {
            surface,
            device,
            candidate,
            queue_family,
            queue,
        })
    }
}
