//! Headless GPU context for integration tests.

use std::sync::Arc;

use ash::vk;
use image::{ImageBuffer, Rgba, RgbaImage};

use ember_gpu::texture::mip_extent;
use ember_gpu::{
    Buffer, BufferDesc, Device, GpuContext, GpuContextBuilder, OneTimeCommands, Texture,
};

use crate::{Result, TestError};

/// Headless context with a one-time command helper on its queue.
pub struct HeadlessContext {
    commands: OneTimeCommands,
    context: GpuContext,
}

impl HeadlessContext {
    /// Create a headless context with validation enabled.
    pub fn new() -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("ember-test")
            .validation(true)
            .build()?;
        let commands = context.one_time_commands()?;
        tracing::info!(device = context.device().name(), "Created headless test context");
        Ok(Self { commands, context })
    }

    pub fn device(&self) -> &Arc<Device> {
        self.context.device()
    }

    pub fn commands(&self) -> &OneTimeCommands {
        &self.commands
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Copy `buffer` into a fresh staging buffer and read it on the host.
    pub fn read_back(&self, buffer: &Buffer) -> Result<Vec<u8>> {
        let mut staging = Buffer::new(self.device(), &BufferDesc::staging(buffer.size()))?;
        Buffer::copy(&self.commands, buffer, &staging)?;
        Ok(staging.read_bytes(0, buffer.size() as usize)?)
    }

    /// Read layer 0 of one mip level of a loaded RGBA8 texture.
    pub fn read_back_texture(&self, texture: &Texture, level: u32) -> Result<RgbaImage> {
        if level >= texture.mip_levels() {
            return Err(TestError::Mismatch(format!(
                "level {level} of {} levels",
                texture.mip_levels()
            )));
        }
        let extent = mip_extent(texture.extent(), level);
        let size = u64::from(extent.width) * u64::from(extent.height) * 4;
        let mut staging = Buffer::new(self.device(), &BufferDesc::staging(size))?;

        let image = texture.image();
        let staging_buffer = staging.handle();
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        self.commands.execute(|device, cmd| {
            let to_src = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range);
            let back = to_src
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(vk::AccessFlags::SHADER_READ);

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(extent);

            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_src],
                );
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    staging_buffer,
                    &[region],
                );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[back],
                );
            }
        })?;

        let data = staging.read_bytes(0, size as usize)?;
        ImageBuffer::from_raw(extent.width, extent.height, data)
            .ok_or_else(|| TestError::Mismatch("Failed to create image from raw data".to_string()))
    }
}

/// Compare two images pixel for pixel.
pub fn compare_images(expected: &RgbaImage, actual: &RgbaImage) -> Result<()> {
    if expected.dimensions() != actual.dimensions() {
        let message = format!(
            "expected {:?}, got {:?}",
            expected.dimensions(),
            actual.dimensions()
        );
        tracing::warn!("Readback size mismatch: {message}");
        return Err(TestError::Mismatch(message));
    }
    let differing = expected
        .pixels()
        .zip(actual.pixels())
        .filter(|(a, b)| a != b)
        .count();
    if differing > 0 {
        tracing::warn!(differing, "Readback differs from expected image");
        return Err(TestError::Mismatch(format!("{differing} pixels differ")));
    }
    Ok(())
}

/// RGBA image filled with one color.
pub fn solid_color(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
    ImageBuffer::from_pixel(width, height, Rgba(color))
}

/// Black and white checkerboard with square cells of `cell` pixels.
pub fn checkerboard(width: u32, height: u32, cell: u32) -> RgbaImage {
    let cell = cell.max(1);
    ImageBuffer::from_fn(width, height, |x, y| {
        if (x / cell + y / cell) % 2 == 0 {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([0, 0, 0, 255])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gpu::sync::{create_fence, wait_for_fence};
    use ember_gpu::{
        AttachmentDesc, AttachmentImage, DescriptorSetManager, DescriptorState, GpuError,
        TextureDesc, Unique,
    };

    #[test]
    fn checkerboard_pattern() {
        let board = checkerboard(4, 4, 2);
        assert_eq!(board.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(board.get_pixel(2, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(board.get_pixel(2, 2), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn compare_images_counts_differences() {
        let board = checkerboard(4, 4, 2);
        compare_images(&board, &board.clone()).unwrap();

        let mut changed = board.clone();
        changed.put_pixel(1, 1, Rgba([1, 2, 3, 4]));
        assert!(matches!(
            compare_images(&board, &changed),
            Err(TestError::Mismatch(m)) if m == "1 pixels differ"
        ));
        assert!(compare_images(&board, &checkerboard(2, 4, 2)).is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_context_creation() {
        let harness = HeadlessContext::new().unwrap();
        assert!(!harness.device().name().is_empty());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_round_trip() {
        let harness = HeadlessContext::new().unwrap();
        let pattern: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();

        let mut staging = Buffer::new(harness.device(), &BufferDesc::staging(1024)).unwrap();
        staging.write_bytes(0, &pattern).unwrap();

        let device_buffer = Buffer::new(
            harness.device(),
            &BufferDesc::new(
                1024,
                vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::VERTEX_BUFFER,
            ),
        )
        .unwrap();
        assert!(device_buffer
            .memory()
            .flags()
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));

        Buffer::copy(harness.commands(), &staging, &device_buffer).unwrap();
        assert_eq!(harness.read_back(&device_buffer).unwrap(), pattern);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn upload_from_host_and_region_copy() {
        let harness = HeadlessContext::new().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let source = Buffer::upload_from_host(
            harness.device(),
            harness.commands(),
            &data,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )
        .unwrap();

        let target = Buffer::new(harness.device(), &BufferDesc::staging(96)).unwrap();
        let region = vk::BufferCopy {
            src_offset: 10,
            dst_offset: 6,
            size: 0,
        };
        Buffer::copy_region(harness.commands(), &source, &target, region).unwrap();

        let back = harness.read_back(&target).unwrap();
        assert_eq!(&back[6..], &data[10..]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn cached_memory_writes_at_offset() {
        let harness = HeadlessContext::new().unwrap();
        let desc = BufferDesc::new(
            1024,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        )
        .with_memory_flags(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED);
        let mut buffer = match Buffer::new(harness.device(), &desc) {
            Ok(buffer) => buffer,
            Err(GpuError::NoSuitableMemoryType { .. }) => return,
            Err(e) => panic!("{e}"),
        };

        let data: Vec<u8> = (0..40u8).collect();
        buffer.write_bytes(16, &data).unwrap();
        buffer.write_bytes(1000, &data[..24]).unwrap();
        assert_eq!(buffer.read_bytes(16, 40).unwrap(), data);
        assert_eq!(buffer.read_bytes(1000, 24).unwrap(), &data[..24]);
        assert_eq!(harness.read_back(&buffer).unwrap()[16..56], data[..]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn one_time_commands_from_several_threads() {
        let harness = HeadlessContext::new().unwrap();
        let device = harness.device();
        let commands = harness.commands();

        std::thread::scope(|scope| {
            for seed in 0..4u8 {
                scope.spawn(move || {
                    let data = vec![seed; 256];
                    let uploaded = Buffer::upload_from_host(
                        device,
                        commands,
                        &data,
                        vk::BufferUsageFlags::TRANSFER_SRC,
                    )
                    .unwrap();
                    let mut staging = Buffer::new(device, &BufferDesc::staging(256)).unwrap();
                    Buffer::copy(commands, &uploaded, &staging).unwrap();
                    assert_eq!(staging.read_bytes(0, 256).unwrap(), data);
                });
            }
        });
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn mapping_device_local_memory_is_rejected() {
        let harness = HeadlessContext::new().unwrap();
        let mut buffer = Buffer::new(
            harness.device(),
            &BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER),
        )
        .unwrap();
        if !buffer.memory().is_host_visible() {
            assert!(matches!(buffer.map(0, 64), Err(GpuError::NotHostVisible)));
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn texture_upload_generates_mips() {
        let harness = HeadlessContext::new().unwrap();
        let color = [32, 96, 160, 255];
        let pixels = solid_color(64, 64, color);

        let desc = TextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 64, 64)
            .with_mipmaps(true)
            .with_usage(vk::ImageUsageFlags::TRANSFER_SRC);
        let mut texture = Texture::new(harness.device(), &desc).unwrap();
        assert_eq!(texture.mip_levels(), 7);

        texture.load(harness.commands(), pixels.as_raw()).unwrap();
        assert!(texture.is_loaded());
        assert!(matches!(
            texture.load(harness.commands(), pixels.as_raw()),
            Err(GpuError::InvalidState(_))
        ));

        let smallest = harness.read_back_texture(&texture, 6).unwrap();
        assert_eq!(smallest.dimensions(), (1, 1));
        assert_eq!(smallest.get_pixel(0, 0), &Rgba(color));

        let base = harness.read_back_texture(&texture, 0).unwrap();
        compare_images(&pixels, &base).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn texture_rejects_wrong_pixel_count() {
        let harness = HeadlessContext::new().unwrap();
        let desc = TextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 8, 8);
        let mut texture = Texture::new(harness.device(), &desc).unwrap();
        assert!(matches!(
            texture.load(harness.commands(), &[0; 16]),
            Err(GpuError::OutOfBounds { .. })
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn depth_attachment_creation() {
        let harness = HeadlessContext::new().unwrap();
        let attachment = AttachmentImage::new(
            harness.device(),
            &AttachmentDesc::depth(vk::Format::D32_SFLOAT, 320, 240),
        )
        .unwrap();
        assert_ne!(attachment.view(), vk::ImageView::null());
        assert_eq!(attachment.extent().width, 320);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn descriptor_manager_flow() {
        let harness = HeadlessContext::new().unwrap();
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;

        let uniforms = Buffer::new(
            harness.device(),
            &BufferDesc::new(256, vk::BufferUsageFlags::UNIFORM_BUFFER)
                .with_queue_families([harness.context().queue_family()]),
        )
        .unwrap();
        let mut texture = Texture::new(
            harness.device(),
            &TextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, 4, 4),
        )
        .unwrap();

        let mut manager = DescriptorSetManager::new(harness.device());
        manager
            .add_binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1, stages)
            .unwrap();
        manager
            .add_binding(1, 3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, stages)
            .unwrap();

        manager.write_uniform_buffer(0, 0, &uniforms).unwrap();
        assert!(matches!(manager.update(), Err(GpuError::InvalidState(_))));

        manager.allocate_pool().unwrap();
        assert_eq!(manager.state(), DescriptorState::PoolAllocated);
        assert_eq!(manager.layouts().len(), 2);
        assert!(manager.allocate_pool().is_err());
        assert!(manager
            .add_binding(0, 1, vk::DescriptorType::SAMPLER, 1, stages)
            .is_err());

        manager.allocate_sets().unwrap();
        assert_eq!(manager.sets().len(), 2);

        assert!(matches!(
            manager.write_combined_image_sampler(1, 3, &texture),
            Err(GpuError::InvalidState(_))
        ));
        texture
            .load(harness.commands(), solid_color(4, 4, [255; 4]).as_raw())
            .unwrap();
        manager.write_combined_image_sampler(1, 3, &texture).unwrap();
        assert!(matches!(
            manager.write_storage_buffer(0, 0, &uniforms),
            Err(GpuError::DescriptorTypeMismatch { .. })
        ));
        assert_eq!(manager.pending_writes(), 2);
        manager.update().unwrap();
        assert_eq!(manager.pending_writes(), 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn fence_wait_times_out_and_can_retry() {
        let harness = HeadlessContext::new().unwrap();
        let device = harness.device();

        let unsignaled = create_fence(device, false).unwrap();
        let err = wait_for_fence(device, unsignaled.handle(), 1_000).unwrap_err();
        assert!(err.is_timeout());
        assert!(wait_for_fence(device, unsignaled.handle(), 1_000)
            .unwrap_err()
            .is_timeout());

        let signaled = create_fence(device, true).unwrap();
        wait_for_fence(device, signaled.handle(), 1_000).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn pending_submit_completes() {
        let harness = HeadlessContext::new().unwrap();
        let mut pending = harness.commands().submit(|_, _| {}).unwrap();
        pending.wait(u64::MAX).unwrap();
        assert!(pending.is_complete());
        pending.wait(0).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn explicit_destroy_is_idempotent() {
        let harness = HeadlessContext::new().unwrap();
        let mut fence: Unique<vk::Fence, _> = create_fence(harness.device(), false).unwrap();
        fence.destroy();
        assert!(fence.is_null());
        fence.destroy();

        let moved = std::mem::take(&mut fence);
        assert!(moved.is_null());
        assert!(fence.is_null());
    }
}
