//! Device memory allocation.

use std::sync::Arc;

use ash::vk;

use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::Unique;

/// Find a memory type allowed by `type_bits` with all of `flags`.
///
/// Returns the lowest matching index, as the driver orders types by preference.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = properties
        .memory_type_count
        .min(properties.memory_types.len() as u32);
    (0..count).find(|&index| {
        type_bits & (1 << index) != 0
            && properties.memory_types[index as usize]
                .property_flags
                .contains(flags)
    })
}

/// Owned block of device memory.
#[derive(Debug)]
pub struct DeviceMemory {
    memory: Unique<vk::DeviceMemory, Arc<Device>>,
    size: vk::DeviceSize,
    type_index: u32,
    flags: vk::MemoryPropertyFlags,
}

impl DeviceMemory {
    /// Allocate memory satisfying `requirements` with at least `flags`.
    pub fn allocate(
        device: &Arc<Device>,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            flags,
        )
        .ok_or(GpuError::NoSuitableMemoryType {
            type_bits: requirements.memory_type_bits,
            flags,
        })?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);

        // SAFETY: the device is live while `device` is held.
        let memory = unsafe { device.allocate_memory(&allocate_info, None) }
            .map_err(GpuError::step(CreateStep::AllocateMemory))?;

        let actual_flags = device.memory_properties().memory_types[type_index as usize].property_flags;

        Ok(Self {
            // SAFETY: freshly allocated from `device`.
            memory: unsafe { Unique::new(device.clone(), memory) },
            size: requirements.size,
            type_index,
            flags: actual_flags,
        })
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory.handle()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Property flags of the memory type actually chosen.
    pub fn flags(&self) -> vk::MemoryPropertyFlags {
        self.flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}
