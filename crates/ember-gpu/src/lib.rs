//! Ownership-checked convenience layer over Vulkan.
//!
//! This crate provides:
//! - Unique ownership of Vulkan handles with compile-time selected destroy calls
//! - Physical device and queue family selection over plain snapshots
//! - Buffer, texture and attachment factories with explicit memory-type selection
//! - A staged descriptor set manager
//! - Instance, device, surface and swapchain setup
//! - One-time command submission

pub mod attachment;
pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod handle;
pub mod instance;
pub mod memory;
pub mod queue;
pub mod selector;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use attachment::{AttachmentDesc, AttachmentImage};
pub use buffer::{aligned_map_range, Buffer, BufferDesc, MapRange, MappedMemory};
pub use command::{CommandPool, OneTimeCommands, PendingSubmit};
pub use context::{Device, GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorLayoutSpec, DescriptorSetManager, DescriptorState};
pub use error::{CreateStep, GpuError, Result};
pub use handle::{Destroy, DestroyRoot, Root, Unique, UniqueArray};
pub use instance::{Instance, InstanceDesc};
pub use memory::{find_memory_type, DeviceMemory};
pub use queue::{find_queue_family, QueueFamilyRequirements, TieBreak};
pub use selector::{
    find_physical_device, DeviceRequirements, PhysicalDeviceCandidate, QueueFamilyInfo,
    SelectionError, SurfaceFailure, SurfaceRequirements,
};
pub use shader::ShaderModule;
pub use surface::Surface;
pub use swapchain::{Swapchain, SwapchainDesc, SwapchainLoader};
pub use sync::{create_fence, create_semaphore, wait_for_fence};
pub use texture::{SamplerDesc, Texture, TextureDesc, TextureViewDesc};
