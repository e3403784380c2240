//! GPU resources for a textured quad.

use std::mem::size_of;

use anyhow::Context;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use image::{Rgba, RgbaImage};
use tracing::info;

use ember_gpu::{
    AttachmentDesc, AttachmentImage, Buffer, BufferDesc, DescriptorSetManager, Device, GpuContext,
    OneTimeCommands, ShaderModule, Texture, TextureDesc,
};

use crate::options::DemoOptions;

pub const WIDTH: u32 = 1280;
pub const HEIGHT: u32 = 720;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub uv: Vec2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SceneUniforms {
    pub view_proj: Mat4,
    pub model: Mat4,
}

const fn vertex(x: f32, y: f32, u: f32, v: f32) -> Vertex {
    Vertex {
        position: Vec3::new(x, y, 0.0),
        uv: Vec2::new(u, v),
    }
}

/// Unit quad facing +Z, two triangles.
pub const QUAD_VERTICES: [Vertex; 4] = [
    vertex(-0.5, -0.5, 0.0, 1.0),
    vertex(0.5, -0.5, 1.0, 1.0),
    vertex(0.5, 0.5, 1.0, 0.0),
    vertex(-0.5, 0.5, 0.0, 0.0),
];
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Checkerboard used when no texture file is given.
pub fn checkerboard(size: u32, cell: u32) -> RgbaImage {
    let cell = cell.max(1);
    RgbaImage::from_fn(size, size, |x, y| {
        if (x / cell + y / cell) % 2 == 0 {
            Rgba([230, 120, 40, 255])
        } else {
            Rgba([30, 30, 40, 255])
        }
    })
}

pub fn uniforms(aspect: f32) -> SceneUniforms {
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
    let proj = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
    SceneUniforms {
        view_proj: proj * view,
        model: Mat4::IDENTITY,
    }
}

fn depth_format(device: &Device) -> vk::Format {
    [vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT]
        .into_iter()
        .find(|&format| {
            device
                .format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .unwrap_or(vk::Format::D32_SFLOAT)
}

/// Everything the quad needs, uploaded and bound to descriptor sets.
pub struct Scene {
    pub descriptors: DescriptorSetManager,
    pub shaders: Vec<ShaderModule>,
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub uniform_buffer: Buffer,
    pub texture: Texture,
    pub depth: AttachmentImage,
}

impl Scene {
    pub fn new(
        context: &GpuContext,
        commands: &OneTimeCommands,
        options: &DemoOptions,
    ) -> anyhow::Result<Self> {
        let device = context.device();

        let vertex_buffer = Buffer::upload_from_host(
            device,
            commands,
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = Buffer::upload_from_host(
            device,
            commands,
            bytemuck::cast_slice(&QUAD_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        let mut uniform_buffer = Buffer::new(
            device,
            &BufferDesc::new(
                size_of::<SceneUniforms>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )
            .with_memory_flags(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        )?;
        uniform_buffer.write_pod(0, &[uniforms(WIDTH as f32 / HEIGHT as f32)])?;

        let pixels = match &options.texture {
            Some(path) => image::open(path)
                .with_context(|| format!("Failed to load texture {}", path.display()))?
                .to_rgba8(),
            None => checkerboard(256, 32),
        };
        let mip_filter = if options.linear_mips {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };
        let mut texture = Texture::new(
            device,
            &TextureDesc::new_2d(vk::Format::R8G8B8A8_SRGB, pixels.width(), pixels.height())
                .with_mipmaps(true)
                .with_mip_filter(mip_filter),
        )?;
        texture.load(commands, pixels.as_raw())?;

        let depth = AttachmentImage::new(
            device,
            &AttachmentDesc::depth(depth_format(device), WIDTH, HEIGHT),
        )?;

        let mut descriptors = DescriptorSetManager::new(device);
        descriptors.add_binding(
            0,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
        )?;
        descriptors.add_binding(
            0,
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
        )?;
        descriptors.allocate_pool()?;
        descriptors.allocate_sets()?;
        descriptors.write_uniform_buffer(0, 0, &uniform_buffer)?;
        descriptors.write_combined_image_sampler(0, 1, &texture)?;
        descriptors.update()?;

        let shaders = [&options.vertex_shader, &options.fragment_shader]
            .into_iter()
            .flatten()
            .map(|path| {
                ShaderModule::from_file(device, path)
                    .with_context(|| format!("Failed to load shader {}", path.display()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!(
            vertices = QUAD_VERTICES.len(),
            indices = QUAD_INDICES.len(),
            texture_mips = texture.mip_levels(),
            depth_format = ?depth.format(),
            shaders = shaders.len(),
            "Scene ready"
        );

        Ok(Self {
            descriptors,
            shaders,
            vertex_buffer,
            index_buffer,
            uniform_buffer,
            texture,
            depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(size_of::<Vertex>(), 20);
        assert_eq!(bytemuck::cast_slice::<_, u8>(&QUAD_VERTICES).len(), 80);
    }

    #[test]
    fn quad_indices_stay_in_range() {
        assert!(QUAD_INDICES
            .iter()
            .all(|&i| usize::from(i) < QUAD_VERTICES.len()));
    }

    #[test]
    fn checkerboard_alternates() {
        let board = checkerboard(64, 32);
        assert_ne!(board.get_pixel(0, 0), board.get_pixel(32, 0));
        assert_eq!(board.get_pixel(0, 0), board.get_pixel(32, 32));
    }

    #[test]
    fn quad_center_projects_to_origin() {
        let u = uniforms(16.0 / 9.0);
        let clip = u.view_proj * u.model * Vec3::ZERO.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!((0.0..=1.0).contains(&ndc.z));
    }
}
