//! Render target images.

use std::sync::Arc;

use ash::vk;

use crate::buffer::{distinct_families, sharing_mode};
use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::Unique;
use crate::memory::DeviceMemory;

/// Whether `format` carries a stencil component.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Attachment creation parameters.
#[derive(Debug, Clone)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub samples: vk::SampleCountFlags,
    pub queue_families: Vec<u32>,
}

impl AttachmentDesc {
    /// Depth (and stencil, if the format has one) attachment.
    pub fn depth(format: vk::Format, width: u32, height: u32) -> Self {
        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if has_stencil(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        Self {
            format,
            extent: vk::Extent2D { width, height },
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect,
            samples: vk::SampleCountFlags::TYPE_1,
            queue_families: Vec::new(),
        }
    }

    /// Color attachment that can also be sampled.
    pub fn color(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            format,
            extent: vk::Extent2D { width, height },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            samples: vk::SampleCountFlags::TYPE_1,
            queue_families: Vec::new(),
        }
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_queue_families(mut self, families: impl Into<Vec<u32>>) -> Self {
        self.queue_families = families.into();
        self
    }

    /// Exclusive unless more than one distinct queue family is listed.
    pub fn sharing_mode(&self) -> vk::SharingMode {
        sharing_mode(&self.queue_families)
    }
}

/// Device-local image with one view over the whole image. Its contents are
/// written by the GPU, never uploaded.
#[derive(Debug)]
pub struct AttachmentImage {
    view: Unique<vk::ImageView, Arc<Device>>,
    image: Unique<vk::Image, Arc<Device>>,
    memory: DeviceMemory,
    desc: AttachmentDesc,
}

impl AttachmentImage {
    pub fn new(device: &Arc<Device>, desc: &AttachmentDesc) -> Result<Self> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::InvalidState("attachment extent must be non-zero".to_string()));
        }

        let families = distinct_families(&desc.queue_families);
        let sharing_mode = desc.sharing_mode();
        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            image_info = image_info.queue_family_indices(&families);
        }

        // SAFETY: the device is live while `device` is held.
        let raw = unsafe { device.create_image(&image_info, None) }
            .map_err(GpuError::step(CreateStep::CreateImage))?;
        // SAFETY: freshly created from `device`.
        let image = unsafe { Unique::new(device.clone(), raw) };

        // SAFETY: `raw` is live.
        let requirements = unsafe { device.get_image_memory_requirements(raw) };
        let memory =
            DeviceMemory::allocate(device, &requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        // SAFETY: both objects are live and the memory was sized from the requirements.
        unsafe { device.bind_image_memory(raw, memory.handle(), 0) }
            .map_err(GpuError::step(CreateStep::BindMemory))?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        // SAFETY: the image is live and bound.
        let view = unsafe { device.create_image_view(&view_info, None) }
            .map_err(GpuError::step(CreateStep::CreateImageView))?;

        tracing::debug!(
            format = ?desc.format,
            width = desc.extent.width,
            height = desc.extent.height,
            "Created attachment"
        );

        Ok(Self {
            // SAFETY: freshly created from `device`.
            view: unsafe { Unique::new(device.clone(), view) },
            image,
            memory,
            desc: desc.clone(),
        })
    }

    pub fn image(&self) -> vk::Image {
        self.image.handle()
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.desc.aspect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_aspect_includes_stencil_when_present() {
        let depth = AttachmentDesc::depth(vk::Format::D32_SFLOAT, 640, 480);
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
        assert!(depth.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));

        let depth_stencil = AttachmentDesc::depth(vk::Format::D24_UNORM_S8_UINT, 640, 480);
        assert_eq!(
            depth_stencil.aspect,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn color_attachment_is_sampled() {
        let color = AttachmentDesc::color(vk::Format::R8G8B8A8_UNORM, 32, 32)
            .with_samples(vk::SampleCountFlags::TYPE_4);
        assert_eq!(color.aspect, vk::ImageAspectFlags::COLOR);
        assert!(color.usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert_eq!(color.samples, vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn sharing_mode_counts_distinct_families() {
        let depth = AttachmentDesc::depth(vk::Format::D32_SFLOAT, 64, 64);
        assert_eq!(depth.sharing_mode(), vk::SharingMode::EXCLUSIVE);
        assert_eq!(
            depth.clone().with_queue_families([3, 3]).sharing_mode(),
            vk::SharingMode::EXCLUSIVE
        );
        assert_eq!(
            depth.with_queue_families([0, 3]).sharing_mode(),
            vk::SharingMode::CONCURRENT
        );
    }
}
