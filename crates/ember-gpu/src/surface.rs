//! Surface management for windowed rendering.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{GpuError, Result};
use crate::handle::{Destroy, Unique};
use crate::instance::Instance;
use crate::selector::SurfaceSupport;

impl Destroy<vk::SurfaceKHR> for Instance {
    unsafe fn destroy(&self, handle: vk::SurfaceKHR) {
        if let Some(loader) = self.surface_loader() {
            // SAFETY: forwarded from the caller.
            unsafe { loader.destroy(handle) }
        }
    }
}

/// Owned presentation surface.
#[derive(Debug)]
pub struct Surface {
    surface: Unique<vk::SurfaceKHR, Arc<Instance>>,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// The instance must have been created for the window's display.
    pub fn from_window<W>(instance: &Arc<Instance>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        if instance.surface_loader().is_none() {
            return Err(GpuError::SurfaceCreation(
                "instance was created without surface extensions".to_string(),
            ));
        }

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: the handles come from a live window and the instance has the
        // surface extensions enabled.
        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.raw(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self {
            // SAFETY: freshly created from `instance`.
            surface: unsafe { Unique::new(instance.clone(), surface) },
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface.handle()
    }

    /// Query what a physical device supports on this surface.
    ///
    /// # Safety
    /// `physical_device` must belong to the surface's instance.
    pub unsafe fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        let loader = self
            .surface
            .parent()
            .and_then(|instance| instance.surface_loader())
            .ok_or(GpuError::MissingParent)?;
        let surface = self.handle();
        // SAFETY: forwarded from the caller.
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: loader.get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }
}
