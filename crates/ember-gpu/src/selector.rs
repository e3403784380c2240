//! Physical device selection.
//!
//! Selection runs over [`PhysicalDeviceCandidate`] snapshots so the filtering
//! and ranking logic never talks to the driver. [`PhysicalDeviceCandidate::query`]
//! builds a snapshot from a live physical device.

use std::fmt;

use ash::vk;
use thiserror::Error;

/// One queue family as seen during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether the family can present to the surface the snapshot was taken for.
    pub supports_present: bool,
}

impl QueueFamilyInfo {
    pub fn new(flags: vk::QueueFlags, queue_count: u32) -> Self {
        Self {
            flags,
            queue_count,
            supports_present: false,
        }
    }

    #[must_use]
    pub fn with_present(mut self, supports_present: bool) -> Self {
        self.supports_present = supports_present;
        self
    }
}

/// Surface properties of a physical device.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Snapshot of one enumerated GPU.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Present only when the snapshot was taken against a surface.
    pub surface: Option<SurfaceSupport>,
}

impl PhysicalDeviceCandidate {
    /// Query a snapshot from the driver.
    ///
    /// # Safety
    /// `physical_device` must belong to `instance`, and `surface` (when given)
    /// must be a live surface created from the same instance.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
    ) -> crate::Result<Self> {
        // SAFETY: forwarded from the caller.
        let (properties, memory_properties, families) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_queue_family_properties(physical_device),
            )
        };

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut queue_families: Vec<QueueFamilyInfo> = families
            .iter()
            .map(|family| QueueFamilyInfo::new(family.queue_flags, family.queue_count))
            .collect();

        let surface = match surface {
            Some((loader, surface)) => {
                for (index, family) in (0u32..).zip(queue_families.iter_mut()) {
                    // SAFETY: forwarded from the caller.
                    family.supports_present = unsafe {
                        loader.get_physical_device_surface_support(physical_device, index, surface)
                    }?;
                }
                // SAFETY: forwarded from the caller.
                unsafe {
                    Some(SurfaceSupport {
                        capabilities: loader
                            .get_physical_device_surface_capabilities(physical_device, surface)?,
                        formats: loader.get_physical_device_surface_formats(physical_device, surface)?,
                        present_modes: loader
                            .get_physical_device_surface_present_modes(physical_device, surface)?,
                    })
                }
            }
            None => None,
        };

        Ok(Self {
            name,
            device_type: properties.device_type,
            memory_properties,
            queue_families,
            surface,
        })
    }

    fn memory_types(&self) -> &[vk::MemoryType] {
        let count = (self.memory_properties.memory_type_count as usize)
            .min(self.memory_properties.memory_types.len());
        &self.memory_properties.memory_types[..count]
    }
}

/// What the swapchain for a surface will need.
#[derive(Debug, Clone)]
pub struct SurfaceRequirements {
    /// Swapchain image count; must lie within the surface's min/max.
    pub image_count: u32,
    pub image_usage: vk::ImageUsageFlags,
    /// Accepted formats; at least one must be offered.
    pub formats: Vec<vk::Format>,
    /// Accepted color spaces; at least one must be offered.
    pub color_spaces: Vec<vk::ColorSpaceKHR>,
    /// Accepted present modes; at least one must be offered.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl Default for SurfaceRequirements {
    fn default() -> Self {
        Self {
            image_count: 2,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            formats: vec![vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM],
            color_spaces: vec![vk::ColorSpaceKHR::SRGB_NONLINEAR],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }
}

/// Declarative device requirements.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Device types in order of preference. Types not listed are rejected.
    pub preferred_types: Vec<vk::PhysicalDeviceType>,
    /// Every flag set must be offered by at least one memory type.
    pub memory_properties: Vec<vk::MemoryPropertyFlags>,
    /// Every flag set must be offered by at least one queue family.
    pub queue_flags: Vec<vk::QueueFlags>,
    /// When set, the surface checks run and a present-capable family is required.
    pub surface: Option<SurfaceRequirements>,
    /// Case-sensitive substring the device name must contain.
    pub name_filter: Option<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            preferred_types: vec![
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vk::PhysicalDeviceType::INTEGRATED_GPU,
                vk::PhysicalDeviceType::VIRTUAL_GPU,
                vk::PhysicalDeviceType::CPU,
                vk::PhysicalDeviceType::OTHER,
            ],
            memory_properties: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            queue_flags: vec![vk::QueueFlags::GRAPHICS],
            surface: None,
            name_filter: None,
        }
    }
}

impl DeviceRequirements {
    #[must_use]
    pub fn with_preferred_types(mut self, types: impl Into<Vec<vk::PhysicalDeviceType>>) -> Self {
        self.preferred_types = types.into();
        self
    }

    #[must_use]
    pub fn with_memory_properties(
        mut self,
        sets: impl Into<Vec<vk::MemoryPropertyFlags>>,
    ) -> Self {
        self.memory_properties = sets.into();
        self
    }

    #[must_use]
    pub fn with_queue_flags(mut self, sets: impl Into<Vec<vk::QueueFlags>>) -> Self {
        self.queue_flags = sets.into();
        self
    }

    #[must_use]
    pub fn with_surface(mut self, surface: SurfaceRequirements) -> Self {
        self.surface = Some(surface);
        self
    }

    #[must_use]
    pub fn with_name_filter(mut self, name: impl Into<String>) -> Self {
        self.name_filter = Some(name.into());
        self
    }
}

/// Which surface check a device failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceFailure {
    /// No surface data was captured for the device.
    Unavailable,
    ImageCount,
    ImageUsage,
    Format,
    ColorSpace,
    PresentMode,
}

impl fmt::Display for SurfaceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unavailable => "no surface information",
            Self::ImageCount => "image count out of range",
            Self::ImageUsage => "image usage unsupported",
            Self::Format => "no matching format",
            Self::ColorSpace => "no matching color space",
            Self::PresentMode => "no matching present mode",
        };
        f.write_str(text)
    }
}

/// Filter class that eliminated every candidate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionError {
    #[error("no physical devices")]
    NoDevices,
    #[error("no device name matches the filter")]
    Name,
    #[error("required memory properties unavailable")]
    MemoryProperties,
    #[error("required queue families unavailable")]
    QueueFamilies,
    #[error("surface unsupported: {0}")]
    Surface(SurfaceFailure),
    #[error("no queue family can present")]
    PresentSupport,
    #[error("no device of a preferred type")]
    DeviceType,
}

impl SelectionError {
    fn class(self) -> usize {
        match self {
            Self::NoDevices => 0,
            Self::Name => 1,
            Self::MemoryProperties => 2,
            Self::QueueFamilies => 3,
            Self::Surface(_) => 4,
            Self::PresentSupport => 5,
            Self::DeviceType => 6,
        }
    }
}

const FILTER_CLASSES: usize = 7;

/// Run every hard filter against one candidate, in fixed order.
///
/// Returns the classes passed before the first failure, and the failure.
fn evaluate(
    candidate: &PhysicalDeviceCandidate,
    requirements: &DeviceRequirements,
) -> (Vec<SelectionError>, Option<SelectionError>) {
    let mut passed = Vec::with_capacity(4);

    if let Some(filter) = &requirements.name_filter {
        if !candidate.name.contains(filter.as_str()) {
            return (passed, Some(SelectionError::Name));
        }
        passed.push(SelectionError::Name);
    }

    let memory_types = candidate.memory_types();
    let memory_ok = requirements.memory_properties.iter().all(|&flags| {
        memory_types
            .iter()
            .any(|memory_type| memory_type.property_flags.contains(flags))
    });
    if !memory_ok {
        return (passed, Some(SelectionError::MemoryProperties));
    }
    passed.push(SelectionError::MemoryProperties);

    let queues_ok = requirements.queue_flags.iter().all(|&flags| {
        candidate
            .queue_families
            .iter()
            .any(|family| family.queue_count > 0 && family.flags.contains(flags))
    });
    if !queues_ok {
        return (passed, Some(SelectionError::QueueFamilies));
    }
    passed.push(SelectionError::QueueFamilies);

    if let Some(surface_requirements) = &requirements.surface {
        let failure = match &candidate.surface {
            Some(support) => check_surface(support, surface_requirements),
            None => Some(SurfaceFailure::Unavailable),
        };
        if let Some(failure) = failure {
            return (passed, Some(SelectionError::Surface(failure)));
        }
        passed.push(SelectionError::Surface(SurfaceFailure::Unavailable));

        if !candidate.queue_families.iter().any(|f| f.supports_present) {
            return (passed, Some(SelectionError::PresentSupport));
        }
        passed.push(SelectionError::PresentSupport);
    }

    (passed, None)
}

fn check_surface(
    support: &SurfaceSupport,
    requirements: &SurfaceRequirements,
) -> Option<SurfaceFailure> {
    let caps = &support.capabilities;
    let count = requirements.image_count;
    // A max of zero means no upper limit.
    if count < caps.min_image_count || (caps.max_image_count != 0 && count > caps.max_image_count)
    {
        return Some(SurfaceFailure::ImageCount);
    }
    if !caps.supported_usage_flags.contains(requirements.image_usage) {
        return Some(SurfaceFailure::ImageUsage);
    }
    if !support
        .formats
        .iter()
        .any(|f| requirements.formats.contains(&f.format))
    {
        return Some(SurfaceFailure::Format);
    }
    if !support
        .formats
        .iter()
        .any(|f| requirements.color_spaces.contains(&f.color_space))
    {
        return Some(SurfaceFailure::ColorSpace);
    }
    if !support
        .present_modes
        .iter()
        .any(|m| requirements.present_modes.contains(m))
    {
        return Some(SurfaceFailure::PresentMode);
    }
    None
}

/// Pick the best candidate for `requirements`.
///
/// Candidates must pass every hard filter; among those, the first candidate
/// (in enumeration order) of the earliest preferred type wins.
///
/// When nothing qualifies the error names a failing filter class. A class that
/// any candidate passed is never reported, even if another candidate failed it
/// earlier in the scan; the first remaining failure in scan order is reported.
pub fn find_physical_device(
    candidates: &[PhysicalDeviceCandidate],
    requirements: &DeviceRequirements,
) -> Result<usize, SelectionError> {
    if candidates.is_empty() {
        return Err(SelectionError::NoDevices);
    }

    let mut cleared = [false; FILTER_CLASSES];
    let mut failures: Vec<SelectionError> = Vec::new();
    let mut qualified: Vec<usize> = Vec::new();

    for (index, candidate) in candidates.iter().enumerate() {
        let (passed, failure) = evaluate(candidate, requirements);
        for class in passed {
            cleared[class.class()] = true;
        }
        match failure {
            Some(failure) => {
                tracing::debug!(device = %candidate.name, reason = %failure, "Rejected physical device");
                failures.push(failure);
            }
            None => qualified.push(index),
        }
    }

    if qualified.is_empty() {
        let reported = failures
            .iter()
            .copied()
            .find(|failure| !cleared[failure.class()])
            .or_else(|| failures.first().copied())
            .unwrap_or(SelectionError::NoDevices);
        return Err(reported);
    }

    for preferred in &requirements.preferred_types {
        if let Some(&index) = qualified
            .iter()
            .find(|&&index| candidates[index].device_type == *preferred)
        {
            tracing::debug!(device = %candidates[index].name, "Selected physical device");
            return Ok(index);
        }
    }

    Err(SelectionError::DeviceType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    fn candidate(name: &str, device_type: vk::PhysicalDeviceType) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            name: name.to_string(),
            device_type,
            memory_properties: memory(&[
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ]),
            queue_families: vec![QueueFamilyInfo::new(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            )
            .with_present(true)],
            surface: Some(SurfaceSupport {
                capabilities: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 2,
                    max_image_count: 8,
                    supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSFER_DST,
                    ..Default::default()
                },
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            }),
        }
    }

    #[test]
    fn empty_list_reports_no_devices() {
        let result = find_physical_device(&[], &DeviceRequirements::default());
        assert_eq!(result, Err(SelectionError::NoDevices));
    }

    #[test]
    fn selection_is_deterministic() {
        let candidates = vec![
            candidate("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate("discrete", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("cpu", vk::PhysicalDeviceType::CPU),
        ];
        let requirements = DeviceRequirements::default();
        let first = find_physical_device(&candidates, &requirements);
        for _ in 0..4 {
            assert_eq!(find_physical_device(&candidates, &requirements), first);
        }
        assert_eq!(first, Ok(1));
    }

    #[test]
    fn unavailable_memory_flags_fail() {
        let candidates = vec![
            candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("b", vk::PhysicalDeviceType::INTEGRATED_GPU),
        ];
        let requirements = DeviceRequirements::default().with_memory_properties(vec![
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
        ]);
        assert_eq!(
            find_physical_device(&candidates, &requirements),
            Err(SelectionError::MemoryProperties)
        );
    }

    #[test]
    fn type_preference_beats_enumeration_order() {
        let a = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU);
        let b = candidate("b", vk::PhysicalDeviceType::INTEGRATED_GPU);
        let requirements = DeviceRequirements::default().with_preferred_types(vec![
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ]);

        assert_eq!(
            find_physical_device(&[a.clone(), b.clone()], &requirements),
            Ok(1)
        );
        assert_eq!(find_physical_device(&[b, a], &requirements), Ok(0));
    }

    #[test]
    fn unlisted_type_is_a_device_type_failure() {
        let candidates = vec![candidate("cpu", vk::PhysicalDeviceType::CPU)];
        let requirements = DeviceRequirements::default()
            .with_preferred_types(vec![vk::PhysicalDeviceType::DISCRETE_GPU]);
        assert_eq!(
            find_physical_device(&candidates, &requirements),
            Err(SelectionError::DeviceType)
        );
    }

    #[test]
    fn name_filter_matches_substring() {
        let candidates = vec![
            candidate("Vendor Fast 3000", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("Vendor Slow 100", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let requirements = DeviceRequirements::default().with_name_filter("Slow");
        assert_eq!(find_physical_device(&candidates, &requirements), Ok(1));

        let requirements = DeviceRequirements::default().with_name_filter("Missing");
        assert_eq!(
            find_physical_device(&candidates, &requirements),
            Err(SelectionError::Name)
        );
    }

    #[test]
    fn queue_flags_need_a_nonempty_family() {
        let mut c = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU);
        c.queue_families = vec![
            QueueFamilyInfo::new(vk::QueueFlags::GRAPHICS, 0),
            QueueFamilyInfo::new(vk::QueueFlags::COMPUTE, 4),
        ];
        assert_eq!(
            find_physical_device(&[c], &DeviceRequirements::default()),
            Err(SelectionError::QueueFamilies)
        );
    }

    #[test]
    fn surface_checks_run_in_order() {
        let base = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU);
        let requirements = DeviceRequirements::default().with_surface(SurfaceRequirements::default());
        assert_eq!(find_physical_device(&[base.clone()], &requirements), Ok(0));

        let mut too_few = base.clone();
        too_few.surface.as_mut().unwrap().capabilities.max_image_count = 1;
        too_few.surface.as_mut().unwrap().capabilities.min_image_count = 1;
        assert_eq!(
            find_physical_device(&[too_few], &requirements),
            Err(SelectionError::Surface(SurfaceFailure::ImageCount))
        );

        let mut unbounded = base.clone();
        unbounded.surface.as_mut().unwrap().capabilities.max_image_count = 0;
        assert_eq!(find_physical_device(&[unbounded], &requirements), Ok(0));

        let mut no_usage = base.clone();
        no_usage.surface.as_mut().unwrap().capabilities.supported_usage_flags =
            vk::ImageUsageFlags::TRANSFER_DST;
        assert_eq!(
            find_physical_device(&[no_usage], &requirements),
            Err(SelectionError::Surface(SurfaceFailure::ImageUsage))
        );

        let mut wrong_format = base.clone();
        wrong_format.surface.as_mut().unwrap().formats[0].format = vk::Format::R16G16B16A16_SFLOAT;
        assert_eq!(
            find_physical_device(&[wrong_format], &requirements),
            Err(SelectionError::Surface(SurfaceFailure::Format))
        );

        let mut wrong_space = base.clone();
        wrong_space.surface.as_mut().unwrap().formats[0].color_space =
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT;
        assert_eq!(
            find_physical_device(&[wrong_space], &requirements),
            Err(SelectionError::Surface(SurfaceFailure::ColorSpace))
        );

        let mut no_mode = base.clone();
        no_mode.surface.as_mut().unwrap().present_modes = vec![vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            find_physical_device(&[no_mode], &requirements),
            Err(SelectionError::Surface(SurfaceFailure::PresentMode))
        );

        let mut no_present = base.clone();
        no_present.queue_families[0].supports_present = false;
        assert_eq!(
            find_physical_device(&[no_present], &requirements),
            Err(SelectionError::PresentSupport)
        );

        let mut headless = base;
        headless.surface = None;
        assert_eq!(
            find_physical_device(&[headless], &requirements),
            Err(SelectionError::Surface(SurfaceFailure::Unavailable))
        );
    }

    #[test]
    fn surface_is_ignored_when_not_required() {
        let mut headless = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU);
        headless.surface = None;
        headless.queue_families[0].supports_present = false;
        assert_eq!(
            find_physical_device(&[headless], &DeviceRequirements::default()),
            Ok(0)
        );
    }

    #[test]
    fn passed_filter_class_is_not_reported() {
        // First device fails memory, second passes memory but fails queues.
        let mut no_memory = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_memory.memory_properties = memory(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let mut no_queues = candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_queues.queue_families = vec![QueueFamilyInfo::new(vk::QueueFlags::TRANSFER, 1)];

        let requirements = DeviceRequirements::default();
        assert_eq!(
            find_physical_device(&[no_memory.clone(), no_queues.clone()], &requirements),
            Err(SelectionError::QueueFamilies)
        );
        // Order does not matter: memory was passed by some device.
        assert_eq!(
            find_physical_device(&[no_queues, no_memory], &requirements),
            Err(SelectionError::QueueFamilies)
        );
    }

    #[test]
    fn first_uncleared_failure_is_reported() {
        let mut no_memory = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_memory.memory_properties = memory(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let mut also_no_memory = no_memory.clone();
        also_no_memory.name = "b".to_string();

        assert_eq!(
            find_physical_device(&[no_memory, also_no_memory], &DeviceRequirements::default()),
            Err(SelectionError::MemoryProperties)
        );
    }
}
