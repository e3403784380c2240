//! Synchronization primitives.

use std::sync::Arc;

use ash::vk;

use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::Unique;

pub type Fence = Unique<vk::Fence, Arc<Device>>;
pub type Semaphore = Unique<vk::Semaphore, Arc<Device>>;

/// Create a semaphore.
pub fn create_semaphore(device: &Arc<Device>) -> Result<Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    // SAFETY: the device is live while `device` is held.
    let semaphore = unsafe { device.create_semaphore(&create_info, None) }
        .map_err(GpuError::step(CreateStep::CreateSemaphore))?;
    // SAFETY: freshly created from `device`.
    Ok(unsafe { Unique::new(device.clone(), semaphore) })
}

/// Create a fence.
pub fn create_fence(device: &Arc<Device>, signaled: bool) -> Result<Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    // SAFETY: the device is live while `device` is held.
    let fence = unsafe { device.create_fence(&create_info, None) }
        .map_err(GpuError::step(CreateStep::CreateFence))?;
    // SAFETY: freshly created from `device`.
    Ok(unsafe { Unique::new(device.clone(), fence) })
}

/// Wait for a fence to be signaled.
///
/// Exceeding `timeout_ns` yields [`GpuError::Timeout`]; the wait can be
/// retried.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fence(device: &Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    // SAFETY: the fence is owned by a live `Unique` on this device.
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Reset a fence to unsignaled state.
pub fn reset_fence(device: &Device, fence: vk::Fence) -> Result<()> {
    // SAFETY: the fence is owned by a live `Unique` on this device.
    unsafe { device.reset_fences(&[fence]) }?;
    Ok(())
}
