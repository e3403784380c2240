//! Unique ownership of Vulkan handles.
//!
//! Every non-dispatchable Vulkan object is destroyed through the object that
//! created it (its parent): a buffer through the device, a surface through the
//! surface loader, a command buffer through its pool. [`Unique`] pairs a handle
//! with that parent and destroys it exactly once; [`UniqueArray`] does the same
//! for a batch of handles sharing one parent.
//!
//! The destroy call is selected at compile time by the [`Destroy`] impl for the
//! `(parent, handle)` pair, so an owner carries no state beyond the parent and
//! the handle itself.
//!
//! Dispatchable root objects (`ash::Instance`, `ash::Device`) bundle their
//! handle with the function table used to destroy them; they have no parent and
//! are owned by [`Root`].

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::error::{GpuError, Result};

/// Destroys handles of type `H` created from `self`.
pub trait Destroy<H> {
    /// Destroy a single handle.
    ///
    /// # Safety
    /// `handle` must be non-null, created from `self`, not yet destroyed and no
    /// longer in use by the GPU.
    unsafe fn destroy(&self, handle: H);

    /// Destroy a batch of handles.
    ///
    /// # Safety
    /// Same as [`Destroy::destroy`] for every element.
    unsafe fn destroy_all(&self, handles: &[H])
    where
        H: Copy,
    {
        for &handle in handles {
            // SAFETY: forwarded from the caller.
            unsafe { self.destroy(handle) };
        }
    }
}

impl<H, P> Destroy<H> for Arc<P>
where
    P: Destroy<H> + ?Sized,
{
    unsafe fn destroy(&self, handle: H) {
        // SAFETY: forwarded from the caller.
        unsafe { (**self).destroy(handle) }
    }

    unsafe fn destroy_all(&self, handles: &[H])
    where
        H: Copy,
    {
        // SAFETY: forwarded from the caller.
        unsafe { (**self).destroy_all(handles) }
    }
}

macro_rules! device_children {
    ($($handle:ty => $method:ident),* $(,)?) => {
        $(
            impl Destroy<$handle> for ash::Device {
                unsafe fn destroy(&self, handle: $handle) {
                    // SAFETY: forwarded from the caller.
                    unsafe { self.$method(handle, None) }
                }
            }
        )*
    };
}

device_children! {
    vk::Buffer => destroy_buffer,
    vk::BufferView => destroy_buffer_view,
    vk::Image => destroy_image,
    vk::ImageView => destroy_image_view,
    vk::Sampler => destroy_sampler,
    vk::DeviceMemory => free_memory,
    vk::ShaderModule => destroy_shader_module,
    vk::CommandPool => destroy_command_pool,
    vk::Fence => destroy_fence,
    vk::Semaphore => destroy_semaphore,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
}

impl Destroy<vk::SurfaceKHR> for ash::khr::surface::Instance {
    unsafe fn destroy(&self, handle: vk::SurfaceKHR) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_surface(handle, None) }
    }
}

impl Destroy<vk::SwapchainKHR> for ash::khr::swapchain::Device {
    unsafe fn destroy(&self, handle: vk::SwapchainKHR) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_swapchain(handle, None) }
    }
}

impl Destroy<vk::DebugUtilsMessengerEXT> for ash::ext::debug_utils::Instance {
    unsafe fn destroy(&self, handle: vk::DebugUtilsMessengerEXT) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_debug_utils_messenger(handle, None) }
    }
}

fn is_null<H: Handle + Copy>(handle: H) -> bool {
    handle.as_raw() == 0
}

fn null<H: Handle>() -> H {
    H::from_raw(0)
}

/// Single owner of one handle and the parent that destroys it.
///
/// Invariant: a non-null handle always has a parent, and has not been passed
/// to the parent's destroy call yet.
pub struct Unique<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    parent: Option<P>,
    handle: H,
}

impl<H, P> Unique<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    /// Take ownership of `handle`.
    ///
    /// # Safety
    /// `handle` must be null or a live handle created from `parent` that no
    /// one else will destroy.
    pub unsafe fn new(parent: P, handle: H) -> Self {
        Self {
            parent: Some(parent),
            handle,
        }
    }

    /// The owned handle, null when empty.
    pub fn handle(&self) -> H {
        self.handle
    }

    /// The stored parent, if any.
    pub fn parent(&self) -> Option<&P> {
        self.parent.as_ref()
    }

    pub fn is_null(&self) -> bool {
        is_null(self.handle)
    }

    /// Give up ownership without destroying. The parent is kept so the owner
    /// can be reset with a new handle later.
    pub fn release(&mut self) -> H {
        std::mem::replace(&mut self.handle, null())
    }

    /// Destroy the current handle, then adopt `handle` under the same parent.
    /// Resetting to the handle already owned does nothing.
    ///
    /// # Safety
    /// Same contract as [`Unique::new`] against the stored parent.
    pub unsafe fn reset(&mut self, handle: H) -> Result<()> {
        if self.parent.is_none() && !is_null(handle) {
            return Err(GpuError::MissingParent);
        }
        if handle.as_raw() == self.handle.as_raw() {
            return Ok(());
        }
        self.destroy();
        self.handle = handle;
        Ok(())
    }

    /// Destroy the current handle, then adopt `handle` under `parent`.
    ///
    /// # Safety
    /// Same contract as [`Unique::new`].
    pub unsafe fn reset_with(&mut self, parent: P, handle: H) {
        if handle.as_raw() != self.handle.as_raw() {
            self.destroy();
        }
        self.parent = Some(parent);
        self.handle = handle;
    }

    /// Destroy the handle now. Further calls do nothing.
    pub fn destroy(&mut self) {
        if is_null(self.handle) {
            return;
        }
        let handle = self.release();
        if let Some(parent) = &self.parent {
            // SAFETY: non-null handles are owned and were created from `parent`.
            unsafe { parent.destroy(handle) };
        }
    }
}

impl<H, P> Default for Unique<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    fn default() -> Self {
        Self {
            parent: None,
            handle: null(),
        }
    }
}

impl<H, P> Drop for Unique<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<H, P> fmt::Debug for Unique<H, P>
where
    H: Handle + Copy + fmt::Debug,
    P: Destroy<H>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unique")
            .field("handle", &self.handle)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Single owner of a batch of handles sharing one parent.
pub struct UniqueArray<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    parent: Option<P>,
    handles: Vec<H>,
}

impl<H, P> UniqueArray<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    /// Take ownership of `handles`.
    ///
    /// # Safety
    /// Every handle must be null or a live handle created from `parent` that
    /// no one else will destroy.
    pub unsafe fn new(parent: P, handles: Vec<H>) -> Self {
        Self {
            parent: Some(parent),
            handles,
        }
    }

    pub fn handles(&self) -> &[H] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn parent(&self) -> Option<&P> {
        self.parent.as_ref()
    }

    /// Give up ownership of every handle without destroying them.
    pub fn release(&mut self) -> Vec<H> {
        std::mem::take(&mut self.handles)
    }

    /// Destroy the current handles, then adopt `handles` under the same parent.
    /// Handles present in both sets are kept alive.
    ///
    /// # Safety
    /// Same contract as [`UniqueArray::new`] against the stored parent.
    pub unsafe fn reset(&mut self, handles: Vec<H>) -> Result<()> {
        if self.parent.is_none() && handles.iter().any(|&h| !is_null(h)) {
            return Err(GpuError::MissingParent);
        }
        let previous = std::mem::replace(&mut self.handles, handles);
        let retired: Vec<H> = previous
            .into_iter()
            .filter(|&old| {
                !is_null(old) && !self.handles.iter().any(|new| new.as_raw() == old.as_raw())
            })
            .collect();
        if let (Some(parent), false) = (&self.parent, retired.is_empty()) {
            // SAFETY: retired handles were owned and created from `parent`.
            unsafe { parent.destroy_all(&retired) };
        }
        Ok(())
    }

    /// Destroy every handle now. Further calls do nothing.
    pub fn destroy(&mut self) {
        let live: Vec<H> = self
            .release()
            .into_iter()
            .filter(|&h| !is_null(h))
            .collect();
        if live.is_empty() {
            return;
        }
        if let Some(parent) = &self.parent {
            // SAFETY: non-null handles are owned and were created from `parent`.
            unsafe { parent.destroy_all(&live) };
        }
    }
}

impl<H, P> Default for UniqueArray<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    fn default() -> Self {
        Self {
            parent: None,
            handles: Vec::new(),
        }
    }
}

impl<H, P> Drop for UniqueArray<H, P>
where
    H: Handle + Copy,
    P: Destroy<H>,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<H, P> fmt::Debug for UniqueArray<H, P>
where
    H: Handle + Copy + fmt::Debug,
    P: Destroy<H>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueArray")
            .field("handles", &self.handles)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Dispatchable object that destroys itself.
pub trait DestroyRoot {
    /// # Safety
    /// Every child of the object must already be destroyed.
    unsafe fn destroy_root(&self);
}

impl DestroyRoot for ash::Instance {
    unsafe fn destroy_root(&self) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_instance(None) }
    }
}

impl DestroyRoot for ash::Device {
    unsafe fn destroy_root(&self) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_device(None) }
    }
}

/// Owner of a parentless dispatchable object.
///
/// Roots are shared through `Arc` by the objects created from them, so they
/// are destroyed when the last child lets go.
pub struct Root<T: DestroyRoot> {
    inner: ManuallyDrop<T>,
}

impl<T: DestroyRoot> Root<T> {
    /// # Safety
    /// No one else may destroy `inner`.
    pub unsafe fn new(inner: T) -> Self {
        Self {
            inner: ManuallyDrop::new(inner),
        }
    }

    /// Give up ownership without destroying.
    pub fn release(self) -> T {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `inner` is moved out exactly once.
        unsafe { ManuallyDrop::take(&mut this.inner) }
    }
}

impl<T: DestroyRoot> Deref for Root<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: DestroyRoot> Drop for Root<T> {
    fn drop(&mut self) {
        // SAFETY: children hold an `Arc` to their root, so none remain.
        unsafe {
            self.inner.destroy_root();
            ManuallyDrop::drop(&mut self.inner);
        }
    }
}
