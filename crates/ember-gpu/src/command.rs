//! Command buffer management.
//!
//! Setup work (buffer copies, layout transitions, mip generation) goes through
//! [`OneTimeCommands`]: allocate a command buffer, record, submit, block until
//! the GPU is done, free. Nothing recorded this way overlaps with the next
//! submission.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::{Destroy, Unique, UniqueArray};
use crate::sync::{create_fence, wait_for_fence, Fence};

/// Command pool for allocating command buffers.
///
/// Pool access is externally synchronized in Vulkan. Allocating, freeing and
/// recording all go through an internal lock so a pool can be shared between
/// threads.
pub struct CommandPool {
    pool: Unique<vk::CommandPool, Arc<Device>>,
    device: Arc<Device>,
    queue_family: u32,
    lock: Mutex<()>,
}

/// Command buffers freed back to their pool on drop.
pub type CommandBuffers = UniqueArray<vk::CommandBuffer, Arc<CommandPool>>;

impl CommandPool {
    /// Create a new command pool.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: the device is live while `device` is held.
        let pool = unsafe { device.create_command_pool(&create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateCommandPool))?;

        Ok(Self {
            // SAFETY: freshly created from `device`.
            pool: unsafe { Unique::new(device.clone(), pool) },
            device: device.clone(),
            queue_family,
            lock: Mutex::new(()),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool.handle()
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate command buffers owned by the returned array.
    pub fn allocate(
        self: &Arc<Self>,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<CommandBuffers> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle())
            .level(level)
            .command_buffer_count(count);

        let buffers = {
            let _guard = self.lock.lock();
            // SAFETY: the pool is live and access is serialized by the lock.
            unsafe { self.device.allocate_command_buffers(&alloc_info) }
                .map_err(GpuError::step(CreateStep::AllocateCommandBuffers))?
        };
        // SAFETY: freshly allocated from this pool.
        Ok(unsafe { UniqueArray::new(self.clone(), buffers) })
    }

    /// Begin `cmd`, record into it with `f` and end it, holding the pool lock
    /// throughout.
    ///
    /// `f` must not allocate from or free to this pool.
    ///
    /// # Safety
    /// `cmd` must have been allocated from this pool and not be in use.
    pub unsafe fn record<F>(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let _guard = self.lock.lock();
        // SAFETY: forwarded from the caller; pool access is serialized.
        unsafe {
            begin_command_buffer(&self.device, cmd, flags)?;
            f(&self.device, cmd);
            end_command_buffer(&self.device, cmd)
        }
    }
}

impl Destroy<vk::CommandBuffer> for CommandPool {
    unsafe fn destroy(&self, handle: vk::CommandBuffer) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_all(&[handle]) }
    }

    unsafe fn destroy_all(&self, handles: &[vk::CommandBuffer]) {
        let _guard = self.lock.lock();
        // SAFETY: forwarded from the caller; pool access is serialized.
        unsafe { self.device.free_command_buffers(self.handle(), handles) }
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The command buffer must be valid and not in use.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    // SAFETY: forwarded from the caller.
    unsafe { device.begin_command_buffer(cmd, &begin_info) }
        .map_err(GpuError::step(CreateStep::RecordCommands))
}

/// End recording a command buffer.
///
/// # Safety
/// The command buffer must be in the recording state.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    // SAFETY: forwarded from the caller.
    unsafe { device.end_command_buffer(cmd) }.map_err(GpuError::step(CreateStep::RecordCommands))
}

/// One-time submission helper bound to a queue.
///
/// Submissions made through one helper are serialized. Other users of the same
/// queue must not submit to it concurrently with the helper.
pub struct OneTimeCommands {
    pool: Arc<CommandPool>,
    device: Arc<Device>,
    queue: vk::Queue,
    queue_lock: Mutex<()>,
}

impl OneTimeCommands {
    pub fn new(device: &Arc<Device>, queue_family: u32, queue: vk::Queue) -> Result<Self> {
        let pool = CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        Ok(Self {
            pool: Arc::new(pool),
            device: device.clone(),
            queue,
            queue_lock: Mutex::new(()),
        })
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.pool.queue_family()
    }

    fn record<F>(&self, f: F) -> Result<CommandBuffers>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let buffers = self.pool.allocate(vk::CommandBufferLevel::PRIMARY, 1)?;
        let cmd = buffers.handles()[0];
        // SAFETY: `cmd` was just allocated from the pool and is not in use.
        unsafe { self.pool.record(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, f)? };
        Ok(buffers)
    }

    /// Caller holds `queue_lock`.
    fn submit_recorded(&self, buffers: &CommandBuffers, fence: vk::Fence) -> Result<()> {
        let submit_info = vk::SubmitInfo::default().command_buffers(buffers.handles());
        tracing::trace!(queue = ?self.queue, "One-time submit");
        // SAFETY: the command buffers are fully recorded; the queue belongs to the device.
        unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
            .map_err(GpuError::step(CreateStep::Submit))
    }

    /// Record, submit and wait for the queue to go idle. No timeout.
    ///
    /// `f` runs with the pool locked and must not use this helper.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let buffers = self.record(f)?;
        {
            let _queue = self.queue_lock.lock();
            self.submit_recorded(&buffers, vk::Fence::null())?;
            // SAFETY: the queue belongs to the device; access is serialized.
            unsafe { self.device.queue_wait_idle(self.queue) }
                .map_err(GpuError::step(CreateStep::WaitIdle))?;
        }
        drop(buffers);
        Ok(())
    }

    /// Record and submit, returning a handle to wait on with a timeout.
    pub fn submit<F>(&self, f: F) -> Result<PendingSubmit>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let buffers = self.record(f)?;
        let fence = create_fence(&self.device, false)?;
        {
            let _queue = self.queue_lock.lock();
            self.submit_recorded(&buffers, fence.handle())?;
        }
        Ok(PendingSubmit {
            buffers,
            fence,
            device: self.device.clone(),
            complete: false,
        })
    }
}

/// Submitted one-time work.
///
/// Dropping an unfinished submission blocks until it completes, so its command
/// buffer is never freed while in use.
pub struct PendingSubmit {
    buffers: CommandBuffers,
    fence: Fence,
    device: Arc<Device>,
    complete: bool,
}

impl PendingSubmit {
    /// Wait up to `timeout_ns`. On [`GpuError::Timeout`] the wait can be retried.
    pub fn wait(&mut self, timeout_ns: u64) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        wait_for_fence(&self.device, self.fence.handle(), timeout_ns)?;
        self.complete = true;
        self.buffers.destroy();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl Drop for PendingSubmit {
    fn drop(&mut self) {
        if let Err(e) = self.wait(u64::MAX) {
            // The buffers may still be in use; leak rather than free them.
            tracing::error!("Waiting for pending submission failed: {e}");
            let _ = self.buffers.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn helpers_are_shareable_between_threads() {
        assert_send_sync::<CommandPool>();
        assert_send_sync::<OneTimeCommands>();
    }
}
