//! Swapchain management.

use std::sync::Arc;

use ash::vk;

use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::{Destroy, Unique};
use crate::selector::SurfaceSupport;
use crate::surface::Surface;

/// Swapchain loader that keeps its device alive.
pub struct SwapchainLoader {
    loader: ash::khr::swapchain::Device,
    _device: Arc<Device>,
}

impl SwapchainLoader {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            loader: ash::khr::swapchain::Device::new(device.instance().raw(), device.raw()),
            _device: device.clone(),
        }
    }

    pub fn raw(&self) -> &ash::khr::swapchain::Device {
        &self.loader
    }
}

impl Destroy<vk::SwapchainKHR> for SwapchainLoader {
    unsafe fn destroy(&self, handle: vk::SwapchainKHR) {
        // SAFETY: forwarded from the caller.
        unsafe { self.loader.destroy(handle) }
    }
}

/// Swapchain creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub image_usage: vk::ImageUsageFlags,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

/// Swapchain wrapper.
///
/// Views are declared first so they are destroyed before the swapchain that
/// owns their images.
pub struct Swapchain {
    image_views: Vec<Unique<vk::ImageView, Arc<Device>>>,
    swapchain: Unique<vk::SwapchainKHR, Arc<SwapchainLoader>>,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain, retiring `old` if given.
    pub fn new(
        device: &Arc<Device>,
        loader: &Arc<SwapchainLoader>,
        surface: &Surface,
        support: &SurfaceSupport,
        desc: &SwapchainDesc,
        queue_family: u32,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        if support.formats.is_empty() {
            return Err(GpuError::InvalidState("surface reports no formats".to_string()));
        }
        let format = select_surface_format(&support.formats);
        let present_mode = select_present_mode(&support.present_modes, desc.vsync);
        let extent = calculate_extent(&support.capabilities, desc.width, desc.height);

        let queue_families = [queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count(&support.capabilities))
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(desc.image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.handle()));

        // SAFETY: the surface and device are live.
        let raw = unsafe { loader.raw().create_swapchain(&create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateSwapchain))?;
        // SAFETY: freshly created from `loader`.
        let swapchain = unsafe { Unique::new(loader.clone(), raw) };

        // SAFETY: `raw` is a live swapchain.
        let images = unsafe { loader.raw().get_swapchain_images(raw) }?;

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            // SAFETY: `image` belongs to the live swapchain.
            let view = unsafe { device.create_image_view(&view_info, None) }
                .map_err(GpuError::step(CreateStep::CreateImageView))?;
            // SAFETY: freshly created from `device`.
            image_views.push(unsafe { Unique::new(device.clone(), view) });
        }

        tracing::debug!(
            images = images.len(),
            width = extent.width,
            height = extent.height,
            ?present_mode,
            "Created swapchain"
        );

        Ok(Self {
            image_views,
            swapchain,
            images,
            format,
            extent,
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain.handle()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_view(&self, index: usize) -> Option<vk::ImageView> {
        self.image_views.get(index).map(Unique::handle)
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Select the best surface format.
///
/// `available` must not be empty.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // Prefer SRGB
    available
        .iter()
        .copied()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .unwrap_or(available[0])
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more image than the minimum, capped by the maximum (zero is unbounded).
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_srgb_format() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(select_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(select_surface_format(&formats[..1]).format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn present_mode_fallbacks() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_when_undefined() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 768,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 4096, 8);
        assert_eq!((extent.width, extent.height), (1024, 16));

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..caps
        };
        let extent = calculate_extent(&fixed, 4096, 8);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn image_count_respects_limits() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(image_count(&caps), 2);
    }
}
