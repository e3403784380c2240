//! Queue family selection.

use ash::vk;

use crate::error::{GpuError, Result};
use crate::selector::QueueFamilyInfo;

/// Capabilities a queue family must offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyRequirements {
    pub flags: vk::QueueFlags,
    pub min_queue_count: u32,
    /// Also require presentation support.
    pub present: bool,
}

impl Default for QueueFamilyRequirements {
    fn default() -> Self {
        Self::new(vk::QueueFlags::GRAPHICS)
    }
}

impl QueueFamilyRequirements {
    pub fn new(flags: vk::QueueFlags) -> Self {
        Self {
            flags,
            min_queue_count: 1,
            present: false,
        }
    }

    #[must_use]
    pub fn with_min_queue_count(mut self, count: u32) -> Self {
        self.min_queue_count = count;
        self
    }

    #[must_use]
    pub fn with_present(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    fn accepts(&self, family: &QueueFamilyInfo) -> bool {
        family.flags.contains(self.flags)
            && family.queue_count >= self.min_queue_count
            && (!self.present || family.supports_present)
    }
}

/// How to choose among several qualifying families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// First qualifying family in enumeration order.
    First,
    /// Qualifying family with the fewest capabilities beyond those requested,
    /// earliest on ties.
    #[default]
    Optimal,
}

/// Find a queue family index meeting `requirements`.
pub fn find_queue_family(
    families: &[QueueFamilyInfo],
    requirements: &QueueFamilyRequirements,
    tie_break: TieBreak,
) -> Result<u32> {
    let mut qualifying = (0u32..)
        .zip(families)
        .filter(|(_, family)| requirements.accepts(family));

    let found = match tie_break {
        TieBreak::First => qualifying.next(),
        // `min_by_key` keeps the first of equal keys.
        TieBreak::Optimal => qualifying
            .min_by_key(|(_, family)| (family.flags ^ requirements.flags).as_raw().count_ones()),
    };

    found
        .map(|(index, _)| index)
        .ok_or(GpuError::QueueFamilyNotFound {
            flags: requirements.flags,
            min_queue_count: requirements.min_queue_count,
        })
}

/// Same as [`find_queue_family`] over raw driver properties.
pub fn find_queue_family_in(
    families: &[vk::QueueFamilyProperties],
    requirements: &QueueFamilyRequirements,
    tie_break: TieBreak,
) -> Result<u32> {
    let infos: Vec<QueueFamilyInfo> = families
        .iter()
        .map(|family| QueueFamilyInfo::new(family.queue_flags, family.queue_count))
        .collect();
    find_queue_family(&infos, requirements, tie_break)
}
