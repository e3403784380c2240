//! Buffers backed by dedicated device memory.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use crate::command::OneTimeCommands;
use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::Unique;
use crate::memory::DeviceMemory;

/// Buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Queue families that access the buffer. More than one distinct family
    /// makes the buffer concurrently shared.
    pub queue_families: Vec<u32>,
    pub memory_flags: vk::MemoryPropertyFlags,
}

impl BufferDesc {
    /// Device-local buffer with the given usage.
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            queue_families: Vec::new(),
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// Host-visible, coherent buffer usable as copy source and destination.
    pub fn staging(size: vk::DeviceSize) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        )
        .with_memory_flags(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    pub fn with_queue_families(mut self, families: impl Into<Vec<u32>>) -> Self {
        self.queue_families = families.into();
        self
    }

    pub fn with_memory_flags(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.memory_flags = flags;
        self
    }

    /// Exclusive unless more than one distinct queue family is listed.
    pub fn sharing_mode(&self) -> vk::SharingMode {
        sharing_mode(&self.queue_families)
    }
}

/// Sorted queue families with duplicates removed.
pub(crate) fn distinct_families(families: &[u32]) -> Vec<u32> {
    let mut families = families.to_vec();
    families.sort_unstable();
    families.dedup();
    families
}

/// Sharing mode for a resource accessed from `families`.
pub(crate) fn sharing_mode(families: &[u32]) -> vk::SharingMode {
    if distinct_families(families).len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    }
}

/// Buffer and the memory bound to it.
///
/// The buffer handle is declared before its memory, so it is destroyed first.
#[derive(Debug)]
pub struct Buffer {
    buffer: Unique<vk::Buffer, Arc<Device>>,
    memory: DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Create a buffer, allocate memory for it and bind the two.
    ///
    /// A failing step drops whatever was created before it.
    pub fn new(device: &Arc<Device>, desc: &BufferDesc) -> Result<Self> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState("buffer size must be non-zero".to_string()));
        }

        let families = distinct_families(&desc.queue_families);
        let sharing_mode = desc.sharing_mode();
        let mut create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing_mode);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(&families);
        }

        // SAFETY: the device is live while `device` is held.
        let raw = unsafe { device.create_buffer(&create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateBuffer))?;
        // SAFETY: freshly created from `device`.
        let buffer = unsafe { Unique::new(device.clone(), raw) };

        // SAFETY: `raw` is live.
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };
        let memory = DeviceMemory::allocate(device, &requirements, desc.memory_flags)?;

        // SAFETY: both objects are live and the memory was sized from the requirements.
        unsafe { device.bind_buffer_memory(raw, memory.handle(), 0) }
            .map_err(GpuError::step(CreateStep::BindMemory))?;

        tracing::debug!(
            size = desc.size,
            usage = ?desc.usage,
            memory_type = memory.type_index(),
            "Created buffer"
        );

        Ok(Self {
            buffer,
            memory,
            size: desc.size,
            usage: desc.usage,
        })
    }

    /// Create a device buffer holding `data`, uploaded through a staging buffer.
    ///
    /// `TRANSFER_DST` is added to `usage`.
    pub fn upload_from_host(
        device: &Arc<Device>,
        commands: &OneTimeCommands,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let size = data.len() as vk::DeviceSize;
        let mut staging = Self::new(device, &BufferDesc::staging(size))?;
        staging.write_bytes(0, data)?;

        let target = Self::new(
            device,
            &BufferDesc::new(size, usage | vk::BufferUsageFlags::TRANSFER_DST),
        )?;
        Self::copy(commands, &staging, &target)?;
        Ok(target)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    /// Map `size` bytes starting at `offset`. The range is unmapped when the
    /// guard drops.
    pub fn map(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<MappedMemory<'_>> {
        if !self.memory.is_host_visible() {
            return Err(GpuError::NotHostVisible);
        }
        check_range(offset, size, self.size)?;

        let device = self.device()?;
        let coherent = self.memory.is_host_coherent();
        let atom = if coherent { 1 } else { device.non_coherent_atom_size() };
        let range = aligned_map_range(offset, size, atom, self.memory.size());

        // SAFETY: the memory is host visible, not mapped elsewhere (the guard
        // borrows `self` mutably) and the range lies inside the allocation.
        let ptr = unsafe {
            device.map_memory(
                self.memory.handle(),
                range.offset,
                range.size,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(GpuError::step(CreateStep::MapMemory))?;

        if !coherent {
            // SAFETY: `range` is exactly the mapped range.
            let invalidated = unsafe {
                device.invalidate_mapped_memory_ranges(&[range.to_vk(self.memory.handle())])
            };
            if let Err(e) = invalidated {
                // SAFETY: mapped just above.
                unsafe { device.unmap_memory(self.memory.handle()) };
                return Err(e.into());
            }
        }

        Ok(MappedMemory {
            // SAFETY: `skip` lies inside the mapped range.
            ptr: unsafe { ptr.cast::<u8>().add(range.skip) },
            len: size as usize,
            range,
            buffer: self,
        })
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut mapped = self.map(offset, data.len() as vk::DeviceSize)?;
        mapped.as_mut_slice().copy_from_slice(data);
        Ok(())
    }

    /// Copy a slice of plain-old-data values into the buffer at `offset`.
    pub fn write_pod<T: Pod>(&mut self, offset: vk::DeviceSize, values: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(values))
    }

    /// Read `len` bytes starting at `offset`.
    pub fn read_bytes(&mut self, offset: vk::DeviceSize, len: usize) -> Result<Vec<u8>> {
        let mapped = self.map(offset, len as vk::DeviceSize)?;
        Ok(mapped.as_slice().to_vec())
    }

    /// Copy the whole of `src` into the start of `dst`.
    pub fn copy(commands: &OneTimeCommands, src: &Buffer, dst: &Buffer) -> Result<()> {
        Self::copy_region(commands, src, dst, vk::BufferCopy::default())
    }

    /// Copy one region from `src` to `dst` and wait for it to finish.
    ///
    /// A region size of zero copies from `src_offset` to the end of `src`.
    pub fn copy_region(
        commands: &OneTimeCommands,
        src: &Buffer,
        dst: &Buffer,
        region: vk::BufferCopy,
    ) -> Result<()> {
        check_copy_usage(src.usage, dst.usage)?;
        let region = resolve_copy_region(src.size, dst.size, region)?;
        let (src_buffer, dst_buffer) = (src.handle(), dst.handle());

        commands.execute(|device, cmd| {
            // SAFETY: `cmd` is recording; both buffers outlive the blocking submit.
            unsafe { device.cmd_copy_buffer(cmd, src_buffer, dst_buffer, &[region]) };
        })
    }

    fn device(&self) -> Result<&Arc<Device>> {
        self.buffer.parent().ok_or(GpuError::MissingParent)
    }
}

/// Host mapping of a buffer range, unmapped on drop.
///
/// Writes to non-coherent memory are flushed before unmapping.
pub struct MappedMemory<'a> {
    buffer: &'a mut Buffer,
    ptr: *mut u8,
    len: usize,
    range: MapRange,
}

impl MappedMemory<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` maps `len` bytes for as long as the guard lives.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` maps `len` bytes, exclusively borrowed through the guard.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        let memory = self.buffer.memory.handle();
        let coherent = self.buffer.memory.is_host_coherent();
        let Ok(device) = self.buffer.device() else {
            return;
        };
        // SAFETY: the memory was mapped by `Buffer::map`.
        unsafe {
            if !coherent {
                if let Err(e) = device.flush_mapped_memory_ranges(&[self.range.to_vk(memory)]) {
                    tracing::warn!("Failed to flush mapped memory: {e}");
                }
            }
            device.unmap_memory(memory);
        }
    }
}

/// Memory range mapped for a buffer access.
///
/// `size` may be `vk::WHOLE_SIZE` when the range runs to the end of the
/// allocation. `skip` is where the requested bytes start inside the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub skip: usize,
}

impl MapRange {
    fn to_vk(self, memory: vk::DeviceMemory) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(self.offset)
            .size(self.size)
    }
}

/// Widen `offset..offset + size` to multiples of `atom`.
///
/// Flushed and invalidated ranges on non-coherent memory must start on an
/// atom boundary and either end on one or reach the end of the allocation.
/// The same range is mapped, so every flush stays inside the mapping.
pub fn aligned_map_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
) -> MapRange {
    let atom = atom.max(1);
    let start = offset - offset % atom;
    let end = offset.saturating_add(size).div_ceil(atom).saturating_mul(atom);
    let size = if end >= allocation_size {
        vk::WHOLE_SIZE
    } else {
        end - start
    };
    MapRange {
        offset: start,
        size,
        skip: (offset - start) as usize,
    }
}

fn check_range(offset: u64, size: u64, capacity: u64) -> Result<()> {
    let in_bounds = size > 0 && offset.checked_add(size).is_some_and(|end| end <= capacity);
    if in_bounds {
        Ok(())
    } else {
        Err(GpuError::OutOfBounds {
            offset,
            size,
            capacity,
        })
    }
}

/// Check that a copy source and destination carry the transfer usages.
pub fn check_copy_usage(src: vk::BufferUsageFlags, dst: vk::BufferUsageFlags) -> Result<()> {
    if !src.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
        return Err(GpuError::MissingUsage {
            required: vk::BufferUsageFlags::TRANSFER_SRC,
            actual: src,
        });
    }
    if !dst.contains(vk::BufferUsageFlags::TRANSFER_DST) {
        return Err(GpuError::MissingUsage {
            required: vk::BufferUsageFlags::TRANSFER_DST,
            actual: dst,
        });
    }
    Ok(())
}

/// Resolve a copy region against the buffer sizes.
///
/// A zero `size` means "to the end of the source". The resolved region must
/// fit both buffers.
pub fn resolve_copy_region(
    src_size: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    region: vk::BufferCopy,
) -> Result<vk::BufferCopy> {
    let size = if region.size == 0 {
        src_size.saturating_sub(region.src_offset)
    } else {
        region.size
    };
    check_range(region.src_offset, size, src_size)?;
    check_range(region.dst_offset, size, dst_size)?;
    Ok(vk::BufferCopy { size, ..region })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(src_offset: u64, dst_offset: u64, size: u64) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        }
    }

    #[test]
    fn zero_size_copies_to_end_of_source() {
        let dst_offset = 16;
        let resolved = resolve_copy_region(100, 90 + dst_offset, region(10, dst_offset, 0)).unwrap();
        assert_eq!(resolved.size, 90);
        assert_eq!(resolved.src_offset, 10);
        assert_eq!(resolved.dst_offset, dst_offset);

        let err = resolve_copy_region(100, 89 + dst_offset, region(10, dst_offset, 0)).unwrap_err();
        assert!(matches!(err, GpuError::OutOfBounds { size: 90, .. }));
    }

    #[test]
    fn explicit_region_must_fit_both_buffers() {
        assert!(resolve_copy_region(64, 64, region(0, 0, 64)).is_ok());
        assert!(resolve_copy_region(64, 64, region(1, 0, 64)).is_err());
        assert!(resolve_copy_region(64, 64, region(0, 1, 64)).is_err());
        assert!(resolve_copy_region(64, 64, region(u64::MAX, 0, 2)).is_err());
    }

    #[test]
    fn offset_at_end_of_source_is_rejected() {
        let err = resolve_copy_region(100, 100, region(100, 0, 0)).unwrap_err();
        assert!(matches!(err, GpuError::OutOfBounds { size: 0, .. }));
    }

    #[test]
    fn copy_requires_transfer_usage() {
        let src = vk::BufferUsageFlags::TRANSFER_SRC;
        let dst = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER;
        assert!(check_copy_usage(src, dst).is_ok());

        let err = check_copy_usage(vk::BufferUsageFlags::VERTEX_BUFFER, dst).unwrap_err();
        assert!(matches!(
            err,
            GpuError::MissingUsage { required, .. } if required == vk::BufferUsageFlags::TRANSFER_SRC
        ));
        let err = check_copy_usage(src, src).unwrap_err();
        assert!(matches!(
            err,
            GpuError::MissingUsage { required, .. } if required == vk::BufferUsageFlags::TRANSFER_DST
        ));
    }

    #[test]
    fn sharing_mode_counts_distinct_families() {
        let desc = BufferDesc::new(16, vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(desc.sharing_mode(), vk::SharingMode::EXCLUSIVE);
        assert_eq!(
            desc.clone().with_queue_families([0]).sharing_mode(),
            vk::SharingMode::EXCLUSIVE
        );
        assert_eq!(
            desc.clone().with_queue_families([2, 2]).sharing_mode(),
            vk::SharingMode::EXCLUSIVE
        );
        assert_eq!(
            desc.with_queue_families([0, 2]).sharing_mode(),
            vk::SharingMode::CONCURRENT
        );
    }

    #[test]
    fn coherent_map_range_is_exact() {
        let range = aligned_map_range(16, 32, 1, 256);
        assert_eq!(range, MapRange { offset: 16, size: 32, skip: 0 });
    }

    #[test]
    fn non_coherent_map_range_widens_to_atoms() {
        let range = aligned_map_range(16, 32, 64, 256);
        assert_eq!(range, MapRange { offset: 0, size: 64, skip: 16 });

        let range = aligned_map_range(70, 60, 64, 256);
        assert_eq!(range, MapRange { offset: 64, size: 128, skip: 6 });
        assert!(range.offset <= 70 && range.offset + range.size >= 130);
    }

    #[test]
    fn map_range_reaching_allocation_end_uses_whole_size() {
        let range = aligned_map_range(200, 40, 64, 256);
        assert_eq!(range, MapRange { offset: 192, size: vk::WHOLE_SIZE, skip: 8 });

        // Rounding up past an unaligned allocation end also maps to the end.
        let range = aligned_map_range(100, 100, 64, 250);
        assert_eq!(range, MapRange { offset: 64, size: vk::WHOLE_SIZE, skip: 36 });

        assert_eq!(aligned_map_range(0, 256, 64, 256).size, vk::WHOLE_SIZE);
    }

    #[test]
    fn zero_atom_is_treated_as_one() {
        assert_eq!(aligned_map_range(5, 3, 0, 64), MapRange { offset: 5, size: 3, skip: 0 });
    }

    #[test]
    fn staging_desc_is_host_visible() {
        let desc = BufferDesc::staging(1024);
        assert!(desc
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT));
        assert!(check_copy_usage(desc.usage, desc.usage).is_ok());
    }
}
