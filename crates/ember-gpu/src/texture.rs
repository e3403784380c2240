//! Sampled textures with optional mip chains.
//!
//! A [`Texture`] is created empty, then filled once with [`Texture::load`]:
//! pixels are staged through a host-visible buffer, copied into mip level 0
//! and either blitted down the mip chain or transitioned straight to
//! `SHADER_READ_ONLY_OPTIMAL`. `load` blocks until the GPU is done, so the
//! texture can be bound as soon as it returns.

use std::sync::Arc;

use ash::vk;

use crate::buffer::{distinct_families, sharing_mode, Buffer, BufferDesc};
use crate::command::OneTimeCommands;
use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::Unique;
use crate::memory::DeviceMemory;

/// Number of levels in a full mip chain for `extent`.
pub fn mip_level_count(extent: vk::Extent3D) -> u32 {
    let largest = extent.width.max(extent.height).max(extent.depth).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Extent of mip `level`, never smaller than one texel per axis.
pub fn mip_extent(extent: vk::Extent3D, level: u32) -> vk::Extent3D {
    let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
    vk::Extent3D {
        width: shrink(extent.width),
        height: shrink(extent.height),
        depth: shrink(extent.depth),
    }
}

/// Bytes per texel for common uncompressed formats.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Sampler parameters.
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Requires the `samplerAnisotropy` device feature.
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }
}

impl SamplerDesc {
    /// Nearest filtering everywhere, clamped to the edge.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_anisotropy: None,
        }
    }
}

/// One image view over a range of array layers. Views cover every mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub view_type: vk::ImageViewType,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl TextureViewDesc {
    pub fn new(view_type: vk::ImageViewType, base_layer: u32, layer_count: u32) -> Self {
        Self {
            view_type,
            base_layer,
            layer_count,
        }
    }

    /// 2D view of a single layer.
    pub fn layer(layer: u32) -> Self {
        Self::new(vk::ImageViewType::TYPE_2D, layer, 1)
    }
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub array_layers: u32,
    /// Allocate and generate a full mip chain on load.
    pub mipmaps: bool,
    /// Blit filter for mip generation. `LINEAR` needs format support.
    pub mip_filter: vk::Filter,
    /// Usage on top of the sampled/transfer usages every texture gets.
    pub usage: vk::ImageUsageFlags,
    /// Views to create. Empty means one view over every layer.
    pub views: Vec<TextureViewDesc>,
    pub sampler: SamplerDesc,
    /// Queue families that access the image. More than one distinct family
    /// makes the image concurrently shared.
    pub queue_families: Vec<u32>,
}

impl TextureDesc {
    pub fn new_2d(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            array_layers: 1,
            mipmaps: false,
            mip_filter: vk::Filter::NEAREST,
            usage: vk::ImageUsageFlags::empty(),
            views: Vec::new(),
            sampler: SamplerDesc::default(),
            queue_families: Vec::new(),
        }
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    pub fn with_mipmaps(mut self, enabled: bool) -> Self {
        self.mipmaps = enabled;
        self
    }

    pub fn with_mip_filter(mut self, filter: vk::Filter) -> Self {
        self.mip_filter = filter;
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_view(mut self, view: TextureViewDesc) -> Self {
        self.views.push(view);
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = sampler;
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

    pub fn mip_levels(&self) -> u32 {
        if self.mipmaps {
            mip_level_count(self.extent)
        } else {
            1
        }
    }

    fn image_type(&self) -> vk::ImageType {
        if self.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        }
    }

    fn image_usage(&self) -> vk::ImageUsageFlags {
        let mut usage = self.usage | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if self.mip_levels() > 1 {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        usage
    }

    fn resolved_views(&self) -> Vec<TextureViewDesc> {
        if !self.views.is_empty() {
            return self.views.clone();
        }
        let view_type = match (self.image_type(), self.array_layers) {
            (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
            (_, 1) => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_2D_ARRAY,
        };
        vec![TextureViewDesc::new(view_type, 0, self.array_layers)]
    }

    /// Reject parameter combinations before any driver call.
    pub fn validate(&self, format_features: vk::FormatFeatureFlags) -> Result<()> {
        let extent = self.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(GpuError::InvalidState("texture extent must be non-zero".to_string()));
        }
        if self.array_layers == 0 {
            return Err(GpuError::InvalidState("texture needs at least one layer".to_string()));
        }
        if texel_size(self.format).is_none() {
            return Err(GpuError::InvalidState(format!(
                "{:?} has no known texel size for uploads",
                self.format
            )));
        }
        if extent.depth > 1 && self.array_layers > 1 {
            return Err(GpuError::InvalidState("3D textures cannot have array layers".to_string()));
        }
        for view in self.resolved_views() {
            let end = u64::from(view.base_layer) + u64::from(view.layer_count);
            if view.layer_count == 0 || end > u64::from(self.array_layers) {
                return Err(GpuError::OutOfBounds {
                    offset: u64::from(view.base_layer),
                    size: u64::from(view.layer_count),
                    capacity: u64::from(self.array_layers),
                });
            }
        }
        if self.mip_levels() > 1 {
            let blit = vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST;
            if !format_features.contains(blit) {
                return Err(GpuError::InvalidState(format!(
                    "{:?} does not support blits for mip generation",
                    self.format
                )));
            }
            if self.mip_filter == vk::Filter::LINEAR
                && !format_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
            {
                return Err(GpuError::InvalidState(format!(
                    "{:?} does not support linear blits",
                    self.format
                )));
            }
        }
        Ok(())
    }
}

/// Access masks and pipeline stages for an image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Synchronization for the transitions used by texture uploads.
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<LayoutTransition> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};

    let (src_access, src_stage) = match old {
        L::UNDEFINED => (A::empty(), S::TOP_OF_PIPE),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::TRANSFER_SRC_OPTIMAL => (A::TRANSFER_READ, S::TRANSFER),
        _ => return None,
    };
    let (dst_access, dst_stage) = match new {
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::TRANSFER_SRC_OPTIMAL => (A::TRANSFER_READ, S::TRANSFER),
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        _ => return None,
    };
    if old == new {
        return None;
    }
    Some(LayoutTransition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// Record a layout transition for `levels` starting at `base_level`, all layers.
///
/// # Safety
/// `cmd` must be recording and `image` must be live.
unsafe fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    subresource: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let Some(masks) = layout_transition(old, new) else {
        return;
    };
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource);

    // SAFETY: forwarded from the caller.
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
}

fn extent_offset(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}

/// Sampled image with its memory, views and sampler.
#[derive(Debug)]
pub struct Texture {
    sampler: Unique<vk::Sampler, Arc<Device>>,
    views: Vec<Unique<vk::ImageView, Arc<Device>>>,
    image: Unique<vk::Image, Arc<Device>>,
    memory: DeviceMemory,
    device: Arc<Device>,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    mip_filter: vk::Filter,
    loaded: bool,
}

impl Texture {
    /// Create the image, its memory, views and sampler. No data is uploaded.
    pub fn new(device: &Arc<Device>, desc: &TextureDesc) -> Result<Self> {
        let features = device.format_properties(desc.format).optimal_tiling_features;
        desc.validate(features)?;

        let mip_levels = desc.mip_levels();
        let families = distinct_families(&desc.queue_families);
        let sharing_mode = desc.sharing_mode();
        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type())
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.image_usage())
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

        let views = desc
            .resolved_views()
            .iter()
            .map(|view| create_view(device, raw, desc.format, mip_levels, view))
            .collect::<Result<Vec<_>>>()?;

        let sampler = create_sampler(device, &desc.sampler, mip_levels)?;

        tracing::debug!(
            format = ?desc.format,
            width = desc.extent.width,
            height = desc.extent.height,
            mip_levels,
            layers = desc.array_layers,
            "Created texture"
        );

        Ok(Self {
            sampler,
            views,
            image,
            memory,
            device: device.clone(),
            format: desc.format,
            extent: desc.extent,
            mip_levels,
            array_layers: desc.array_layers,
            mip_filter: desc.mip_filter,
            loaded: false,
        })
    }

    /// Upload level 0 for every layer, generate the mip chain and leave the
    /// whole image in `SHADER_READ_ONLY_OPTIMAL`. Blocks until done.
    ///
    /// `pixels` holds tightly packed texels, layer after layer.
    pub fn load(&mut self, commands: &OneTimeCommands, pixels: &[u8]) -> Result<()> {
        if self.loaded {
            return Err(GpuError::InvalidState("texture is already loaded".to_string()));
        }
        if pixels.is_empty() {
            return Err(GpuError::InvalidState("no pixel data".to_string()));
        }
        let expected = self.level0_size().ok_or_else(|| {
            GpuError::InvalidState(format!("{:?} has no known texel size", self.format))
        })?;
        if pixels.len() as u64 != expected {
            return Err(GpuError::OutOfBounds {
                offset: 0,
                size: pixels.len() as u64,
                capacity: expected,
            });
        }

        let mut staging = Buffer::new(&self.device, &BufferDesc::staging(pixels.len() as u64))?;
        staging.write_bytes(0, pixels)?;

        let image = self.image.handle();
        let staging_buffer = staging.handle();
        let (extent, mip_levels, layers, filter) =
            (self.extent, self.mip_levels, self.array_layers, self.mip_filter);

        commands.execute(|device, cmd| {
            // SAFETY: `cmd` is recording; the image and staging buffer outlive
            // the blocking submit.
            unsafe {
                record_upload(device, cmd, image, staging_buffer, extent, mip_levels, layers, filter)
            }
        })?;

        self.loaded = true;
        tracing::debug!(mip_levels, "Uploaded texture");
        Ok(())
    }

    fn level0_size(&self) -> Option<u64> {
        let texel = u64::from(texel_size(self.format)?);
        let e = self.extent;
        Some(
            u64::from(e.width)
                * u64::from(e.height)
                * u64::from(e.depth)
                * u64::from(self.array_layers)
                * texel,
        )
    }

    pub fn image(&self) -> vk::Image {
        self.image.handle()
    }

    /// View `index` in creation order.
    pub fn view(&self, index: usize) -> Option<vk::ImageView> {
        self.views.get(index).map(Unique::handle)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Whether [`Texture::load`] has completed.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

fn create_view(
    device: &Arc<Device>,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    view: &TextureViewDesc,
) -> Result<Unique<vk::ImageView, Arc<Device>>> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view.view_type)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(mip_levels)
                .base_array_layer(view.base_layer)
                .layer_count(view.layer_count),
        );
    // SAFETY: `image` is live and bound to memory.
    let raw = unsafe { device.create_image_view(&view_info, None) }
        .map_err(GpuError::step(CreateStep::CreateImageView))?;
    // SAFETY: freshly created from `device`.
    Ok(unsafe { Unique::new(device.clone(), raw) })
}

fn create_sampler(
    device: &Arc<Device>,
    desc: &SamplerDesc,
    mip_levels: u32,
) -> Result<Unique<vk::Sampler, Arc<Device>>> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(desc.mag_filter)
        .min_filter(desc.min_filter)
        .mipmap_mode(desc.mipmap_mode)
        .address_mode_u(desc.address_mode)
        .address_mode_v(desc.address_mode)
        .address_mode_w(desc.address_mode)
        .anisotropy_enable(desc.max_anisotropy.is_some())
        .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
    // SAFETY: the device is live while `device` is held.
    let raw = unsafe { device.create_sampler(&sampler_info, None) }
        .map_err(GpuError::step(CreateStep::CreateSampler))?;
    // SAFETY: freshly created from `device`.
    Ok(unsafe { Unique::new(device.clone(), raw) })
}

/// # Safety
/// `cmd` must be recording; `image` and `staging` must stay live until the
/// submission completes.
#[allow(clippy::too_many_arguments)]
unsafe fn record_upload(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    staging: vk::Buffer,
    extent: vk::Extent3D,
    mip_levels: u32,
    layers: u32,
    filter: vk::Filter,
) {
    let range = |base_mip_level: u32, level_count: u32| vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: layers,
    };
    let level_layers = |mip_level: u32| vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: layers,
    };
    use vk::ImageLayout as L;

    // SAFETY: forwarded from the caller.
    unsafe {
        transition(device, cmd, image, range(0, mip_levels), L::UNDEFINED, L::TRANSFER_DST_OPTIMAL);

        let copy = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(level_layers(0))
            .image_offset(vk::Offset3D::default())
            .image_extent(extent);
        device.cmd_copy_buffer_to_image(cmd, staging, image, L::TRANSFER_DST_OPTIMAL, &[copy]);

        for level in 1..mip_levels {
            let src = level - 1;
            transition(device, cmd, image, range(src, 1), L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL);

            let blit = vk::ImageBlit::default()
                .src_subresource(level_layers(src))
                .src_offsets([vk::Offset3D::default(), extent_offset(mip_extent(extent, src))])
                .dst_subresource(level_layers(level))
                .dst_offsets([vk::Offset3D::default(), extent_offset(mip_extent(extent, level))]);
            device.cmd_blit_image(
                cmd,
                image,
                L::TRANSFER_SRC_OPTIMAL,
                image,
                L::TRANSFER_DST_OPTIMAL,
                &[blit],
                filter,
            );

            transition(device, cmd, image, range(src, 1), L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL);
        }

        // The last level was only ever written.
        transition(
            device,
            cmd,
            image,
            range(mip_levels - 1, 1),
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        );
    }
}
