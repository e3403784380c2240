//! GPU error types.

use std::fmt;

use ash::vk;
use thiserror::Error;

use crate::selector::SelectionError;

/// Driver step that failed while building a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateStep {
    CreateInstance,
    CreateDebugMessenger,
    CreateDevice,
    CreateBuffer,
    CreateImage,
    AllocateMemory,
    BindMemory,
    MapMemory,
    CreateImageView,
    CreateSampler,
    CreateShaderModule,
    CreateCommandPool,
    AllocateCommandBuffers,
    RecordCommands,
    Submit,
    WaitIdle,
    CreateFence,
    CreateSemaphore,
    CreateDescriptorSetLayout,
    CreateDescriptorPool,
    AllocateDescriptorSets,
    CreateSwapchain,
}

impl fmt::Display for CreateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error from a call that is not part of a create sequence.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A create/allocate/bind step returned a failure code.
    #[error("{step} failed: {result}")]
    Step { step: CreateStep, result: vk::Result },

    /// The Vulkan library could not be loaded.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// No physical device satisfied the requirements.
    #[error("No suitable GPU found: {0}")]
    Selection(#[from] SelectionError),

    /// No queue family satisfied the requirements.
    #[error("No queue family with {flags:?} and at least {min_queue_count} queue(s)")]
    QueueFamilyNotFound {
        flags: vk::QueueFlags,
        min_queue_count: u32,
    },

    /// No memory type matched both the resource and the requested properties.
    #[error("No memory type in mask {type_bits:#x} has properties {flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// A child handle was given without the parent needed to destroy it.
    #[error("Handle has no parent to destroy it with")]
    MissingParent,

    /// Memory is not host visible and cannot be mapped.
    #[error("Memory is not host visible")]
    NotHostVisible,

    /// A byte range does not fit inside a resource.
    #[error("Range {offset}..{offset}+{size} out of bounds for {capacity} bytes")]
    OutOfBounds {
        offset: u64,
        size: u64,
        capacity: u64,
    },

    /// A buffer lacks the usage flag an operation needs.
    #[error("Buffer usage {actual:?} lacks {required:?}")]
    MissingUsage {
        required: vk::BufferUsageFlags,
        actual: vk::BufferUsageFlags,
    },

    /// Descriptor binding is not declared for the set.
    #[error("Set {set} has no binding {binding}")]
    UnknownBinding { set: u32, binding: u32 },

    /// Descriptor binding declared twice in one set.
    #[error("Set {set} already declares binding {binding}")]
    DuplicateBinding { set: u32, binding: u32 },

    /// Write payload does not match the binding's descriptor type.
    #[error("Binding {binding} of set {set} is {expected:?}, write does not fit")]
    DescriptorTypeMismatch {
        set: u32,
        binding: u32,
        expected: vk::DescriptorType,
    },

    /// Shader bytes are not valid SPIR-V.
    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    /// Fence wait exceeded its timeout; the wait can be retried.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Operation is not valid in the object's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpuError {
    /// Wrap a driver failure with the step it happened in.
    pub fn step(step: CreateStep) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Step { step, result }
    }

    /// Whether a retry of the same wait may succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
