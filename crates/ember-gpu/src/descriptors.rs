//! Descriptor set management.
//!
//! [`DescriptorSetManager`] moves through three states:
//!
//! 1. `Building`: bindings are declared with [`DescriptorSetManager::add_binding`].
//! 2. `PoolAllocated`: one layout per set and a pool sized for every binding exist.
//! 3. `SetsAllocated`: one descriptor set per layout has been allocated.
//!
//! Writes are queued and only reach the driver, in one batch, on
//! [`DescriptorSetManager::update`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use crate::buffer::Buffer;
use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::{Destroy, Unique, UniqueArray};
use crate::texture::Texture;

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Which write payload a descriptor type accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Buffer,
    Image,
    TexelBufferView,
}

impl PayloadKind {
    pub fn of(descriptor_type: vk::DescriptorType) -> Option<Self> {
        use vk::DescriptorType as T;
        match descriptor_type {
            T::UNIFORM_BUFFER
            | T::STORAGE_BUFFER
            | T::UNIFORM_BUFFER_DYNAMIC
            | T::STORAGE_BUFFER_DYNAMIC => Some(Self::Buffer),
            T::SAMPLER
            | T::COMBINED_IMAGE_SAMPLER
            | T::SAMPLED_IMAGE
            | T::STORAGE_IMAGE
            | T::INPUT_ATTACHMENT => Some(Self::Image),
            T::UNIFORM_TEXEL_BUFFER | T::STORAGE_TEXEL_BUFFER => Some(Self::TexelBufferView),
            _ => None,
        }
    }
}

/// Per-set binding lists plus running descriptor totals per type.
///
/// Set indices are dense: declaring a binding in set `n` creates every set
/// below `n` (possibly empty).
#[derive(Debug, Clone, Default)]
pub struct DescriptorLayoutSpec {
    sets: Vec<Vec<BindingSpec>>,
    totals: BTreeMap<i32, u32>,
}

impl DescriptorLayoutSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding to `set`. Binding numbers are unique per set.
    pub fn add_binding(
        &mut self,
        set: u32,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Result<()> {
        if self.binding(set, binding).is_some() {
            return Err(GpuError::DuplicateBinding { set, binding });
        }
        let set_index = set as usize;
        if self.sets.len() <= set_index {
            self.sets.resize_with(set_index + 1, Vec::new);
        }
        self.sets[set_index].push(BindingSpec {
            binding,
            descriptor_type,
            count,
            stages,
        });
        *self.totals.entry(descriptor_type.as_raw()).or_default() += count;
        Ok(())
    }

    pub fn set_count(&self) -> u32 {
        self.sets.len() as u32
    }

    pub fn bindings(&self, set: u32) -> &[BindingSpec] {
        self.sets.get(set as usize).map_or(&[], Vec::as_slice)
    }

    /// Look up a binding by number.
    pub fn binding(&self, set: u32, binding: u32) -> Option<&BindingSpec> {
        self.bindings(set).iter().find(|b| b.binding == binding)
    }

    /// Pool sizes covering every declared descriptor, one entry per type.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.totals
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&ty, &count)| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(ty),
                descriptor_count: count,
            })
            .collect()
    }

    /// Check a write against the declared binding and return its type.
    pub fn check_write(
        &self,
        set: u32,
        binding: u32,
        first_element: u32,
        payload: &WritePayload,
    ) -> Result<vk::DescriptorType> {
        let spec = self
            .binding(set, binding)
            .ok_or(GpuError::UnknownBinding { set, binding })?;

        if PayloadKind::of(spec.descriptor_type) != Some(payload.kind()) {
            return Err(GpuError::DescriptorTypeMismatch {
                set,
                binding,
                expected: spec.descriptor_type,
            });
        }

        let len = payload.len() as u64;
        let end = u64::from(first_element) + len;
        if len == 0 || end > u64::from(spec.count) {
            return Err(GpuError::OutOfBounds {
                offset: u64::from(first_element),
                size: len,
                capacity: u64::from(spec.count),
            });
        }
        Ok(spec.descriptor_type)
    }
}

/// Descriptor data for one write.
#[derive(Debug, Clone)]
pub enum WritePayload {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    TexelBufferViews(Vec<vk::BufferView>),
}

impl WritePayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Buffers(_) => PayloadKind::Buffer,
            Self::Images(_) => PayloadKind::Image,
            Self::TexelBufferViews(_) => PayloadKind::TexelBufferView,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Buffers(infos) => infos.len(),
            Self::Images(infos) => infos.len(),
            Self::TexelBufferViews(views) => views.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A queued descriptor update.
#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub set: u32,
    pub binding: u32,
    pub first_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub payload: WritePayload,
}

/// Descriptor pool that frees its sets individually.
pub struct DescriptorPool {
    pool: Unique<vk::DescriptorPool, Arc<Device>>,
    device: Arc<Device>,
}

impl DescriptorPool {
    /// Create a pool for up to `max_sets` sets.
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        // SAFETY: the device is live while `device` is held.
        let pool = unsafe { device.create_descriptor_pool(&create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateDescriptorPool))?;
        Ok(Self {
            // SAFETY: freshly created from `device`.
            pool: unsafe { Unique::new(device.clone(), pool) },
            device: device.clone(),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool.handle()
    }
}

impl Destroy<vk::DescriptorSet> for DescriptorPool {
    unsafe fn destroy(&self, handle: vk::DescriptorSet) {
        // SAFETY: forwarded from the caller.
        unsafe { self.destroy_all(&[handle]) }
    }

    unsafe fn destroy_all(&self, handles: &[vk::DescriptorSet]) {
        // SAFETY: forwarded from the caller; the pool allows freeing sets.
        if let Err(e) = unsafe { self.device.free_descriptor_sets(self.handle(), handles) } {
            tracing::warn!("Failed to free descriptor sets: {e}");
        }
    }
}

/// Lifecycle state of a [`DescriptorSetManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    Building,
    PoolAllocated,
    SetsAllocated,
}

/// Owns the layouts, pool and sets described by a [`DescriptorLayoutSpec`].
pub struct DescriptorSetManager {
    // Sets keep the pool alive; layouts may go in any order.
    sets: UniqueArray<vk::DescriptorSet, Arc<DescriptorPool>>,
    pool: Option<Arc<DescriptorPool>>,
    layouts: Vec<Unique<vk::DescriptorSetLayout, Arc<Device>>>,
    spec: DescriptorLayoutSpec,
    writes: Vec<DescriptorWrite>,
    state: DescriptorState,
    device: Arc<Device>,
}

impl DescriptorSetManager {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            sets: UniqueArray::default(),
            pool: None,
            layouts: Vec::new(),
            spec: DescriptorLayoutSpec::new(),
            writes: Vec::new(),
            state: DescriptorState::Building,
            device: device.clone(),
        }
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn spec(&self) -> &DescriptorLayoutSpec {
        &self.spec
    }

    fn expect_state(&self, expected: DescriptorState, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "cannot {action} in state {:?}, expected {expected:?}",
                self.state
            )))
        }
    }

    /// Declare a binding. Only valid before the pool is allocated.
    pub fn add_binding(
        &mut self,
        set: u32,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Result<()> {
        self.expect_state(DescriptorState::Building, "add a binding")?;
        self.spec
            .add_binding(set, binding, descriptor_type, count, stages)
    }

    /// Create one layout per set and a pool sized for all of them.
    pub fn allocate_pool(&mut self) -> Result<()> {
        self.expect_state(DescriptorState::Building, "allocate the pool")?;
        let pool_sizes = self.spec.pool_sizes();
        if pool_sizes.is_empty() {
            return Err(GpuError::InvalidState("no descriptors declared".to_string()));
        }

        let mut layouts = Vec::with_capacity(self.spec.set_count() as usize);
        for set in 0..self.spec.set_count() {
            let bindings: Vec<_> = self
                .spec
                .bindings(set)
                .iter()
                .map(|b| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(b.binding)
                        .descriptor_type(b.descriptor_type)
                        .descriptor_count(b.count)
                        .stage_flags(b.stages)
                })
                .collect();
            let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            // SAFETY: the device is live while `self.device` is held.
            let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(GpuError::step(CreateStep::CreateDescriptorSetLayout))?;
            // SAFETY: freshly created from `self.device`.
            layouts.push(unsafe { Unique::new(self.device.clone(), layout) });
        }

        let pool = DescriptorPool::new(&self.device, self.spec.set_count(), &pool_sizes)?;

        tracing::debug!(
            sets = self.spec.set_count(),
            pool_sizes = pool_sizes.len(),
            "Allocated descriptor pool"
        );

        self.layouts = layouts;
        self.pool = Some(Arc::new(pool));
        self.state = DescriptorState::PoolAllocated;
        Ok(())
    }

    /// Allocate one descriptor set per layout.
    pub fn allocate_sets(&mut self) -> Result<()> {
        self.expect_state(DescriptorState::PoolAllocated, "allocate sets")?;
        let pool = self.pool.clone().ok_or(GpuError::MissingParent)?;
        let layouts = self.layouts();

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool.handle())
            .set_layouts(&layouts);
        // SAFETY: the pool and layouts are live.
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(GpuError::step(CreateStep::AllocateDescriptorSets))?;

        // SAFETY: freshly allocated from `pool`.
        self.sets = unsafe { UniqueArray::new(pool, sets) };
        self.state = DescriptorState::SetsAllocated;
        Ok(())
    }

    pub fn layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        self.layouts.iter().map(Unique::handle).collect()
    }

    pub fn sets(&self) -> &[vk::DescriptorSet] {
        self.sets.handles()
    }

    pub fn set(&self, index: u32) -> Option<vk::DescriptorSet> {
        self.sets.handles().get(index as usize).copied()
    }

    fn queue_write(
        &mut self,
        set: u32,
        binding: u32,
        first_element: u32,
        payload: WritePayload,
    ) -> Result<()> {
        let descriptor_type = self.spec.check_write(set, binding, first_element, &payload)?;
        self.writes.push(DescriptorWrite {
            set,
            binding,
            first_element,
            descriptor_type,
            payload,
        });
        Ok(())
    }

    /// Queue buffer descriptors for `binding`, starting at array element `first_element`.
    pub fn write_buffer(
        &mut self,
        set: u32,
        binding: u32,
        first_element: u32,
        infos: &[vk::DescriptorBufferInfo],
    ) -> Result<()> {
        self.queue_write(set, binding, first_element, WritePayload::Buffers(infos.to_vec()))
    }

    /// Queue image descriptors.
    pub fn write_image(
        &mut self,
        set: u32,
        binding: u32,
        first_element: u32,
        infos: &[vk::DescriptorImageInfo],
    ) -> Result<()> {
        self.queue_write(set, binding, first_element, WritePayload::Images(infos.to_vec()))
    }

    /// Queue texel buffer view descriptors.
    pub fn write_texel_buffer(
        &mut self,
        set: u32,
        binding: u32,
        first_element: u32,
        views: &[vk::BufferView],
    ) -> Result<()> {
        self.queue_write(
            set,
            binding,
            first_element,
            WritePayload::TexelBufferViews(views.to_vec()),
        )
    }

    fn require_type(&self, set: u32, binding: u32, expected: vk::DescriptorType) -> Result<()> {
        let spec = self
            .spec
            .binding(set, binding)
            .ok_or(GpuError::UnknownBinding { set, binding })?;
        if spec.descriptor_type == expected {
            Ok(())
        } else {
            Err(GpuError::DescriptorTypeMismatch {
                set,
                binding,
                expected: spec.descriptor_type,
            })
        }
    }

    /// Queue the whole of `buffer` for a uniform buffer binding.
    pub fn write_uniform_buffer(&mut self, set: u32, binding: u32, buffer: &Buffer) -> Result<()> {
        self.require_type(set, binding, vk::DescriptorType::UNIFORM_BUFFER)?;
        self.write_buffer(set, binding, 0, &[whole_buffer(buffer)])
    }

    /// Queue the whole of `buffer` for a storage buffer binding.
    pub fn write_storage_buffer(&mut self, set: u32, binding: u32, buffer: &Buffer) -> Result<()> {
        self.require_type(set, binding, vk::DescriptorType::STORAGE_BUFFER)?;
        self.write_buffer(set, binding, 0, &[whole_buffer(buffer)])
    }

    /// Queue the first view and the sampler of a loaded texture.
    pub fn write_combined_image_sampler(
        &mut self,
        set: u32,
        binding: u32,
        texture: &Texture,
    ) -> Result<()> {
        self.require_type(set, binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)?;
        if !texture.is_loaded() {
            return Err(GpuError::InvalidState(
                "texture must be loaded before it is bound".to_string(),
            ));
        }
        let view = texture
            .view(0)
            .ok_or_else(|| GpuError::InvalidState("texture has no views".to_string()))?;
        let info = vk::DescriptorImageInfo::default()
            .sampler(texture.sampler())
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        self.write_image(set, binding, 0, &[info])
    }

    /// Number of writes waiting for [`DescriptorSetManager::update`].
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Apply every queued write in one driver call.
    pub fn update(&mut self) -> Result<()> {
        self.expect_state(DescriptorState::SetsAllocated, "update descriptor sets")?;
        if self.writes.is_empty() {
            return Ok(());
        }

        let sets = self.sets.handles();
        let writes = self
            .writes
            .iter()
            .map(|write| -> Result<vk::WriteDescriptorSet<'_>> {
                let dst_set = sets
                    .get(write.set as usize)
                    .copied()
                    .ok_or(GpuError::UnknownBinding {
                        set: write.set,
                        binding: write.binding,
                    })?;
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(dst_set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.first_element)
                    .descriptor_type(write.descriptor_type);
                Ok(match &write.payload {
                    WritePayload::Buffers(infos) => base.buffer_info(infos),
                    WritePayload::Images(infos) => base.image_info(infos),
                    WritePayload::TexelBufferViews(views) => base.texel_buffer_view(views),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // SAFETY: every write targets a live set and was checked against its layout.
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        tracing::trace!(count = writes.len(), "Updated descriptor sets");

        drop(writes);
        self.writes.clear();
        Ok(())
    }
}

fn whole_buffer(buffer: &Buffer) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer.handle())
        .offset(0)
        .range(vk::WHOLE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;

    fn pool_map(spec: &DescriptorLayoutSpec) -> Vec<(vk::DescriptorType, u32)> {
        let mut sizes: Vec<_> = spec
            .pool_sizes()
            .iter()
            .map(|s| (s.ty, s.descriptor_count))
            .collect();
        sizes.sort_by_key(|(ty, _)| ty.as_raw());
        sizes
    }

    fn buffer_info() -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default().range(vk::WHOLE_SIZE)
    }

    #[test]
    fn pool_sizes_are_order_independent() {
        let mut a = DescriptorLayoutSpec::new();
        a.add_binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 2, STAGES).unwrap();
        a.add_binding(0, 1, vk::DescriptorType::SAMPLER, 3, STAGES).unwrap();

        let mut b = DescriptorLayoutSpec::new();
        b.add_binding(0, 1, vk::DescriptorType::SAMPLER, 3, STAGES).unwrap();
        b.add_binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 2, STAGES).unwrap();

        let expected = vec![
            (vk::DescriptorType::SAMPLER, 3),
            (vk::DescriptorType::UNIFORM_BUFFER, 2),
        ];
        assert_eq!(pool_map(&a), expected);
        assert_eq!(pool_map(&b), expected);
        assert_eq!(a.pool_sizes().len(), 2);
    }

    #[test]
    fn totals_accumulate_across_sets() {
        let mut spec = DescriptorLayoutSpec::new();
        spec.add_binding(0, 0, vk::DescriptorType::STORAGE_BUFFER, 1, STAGES).unwrap();
        spec.add_binding(2, 0, vk::DescriptorType::STORAGE_BUFFER, 4, STAGES).unwrap();
        spec.add_binding(2, 1, vk::DescriptorType::UNIFORM_BUFFER, 0, STAGES).unwrap();

        assert_eq!(spec.set_count(), 3);
        assert!(spec.bindings(1).is_empty());
        assert_eq!(pool_map(&spec), vec![(vk::DescriptorType::STORAGE_BUFFER, 5)]);
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let mut spec = DescriptorLayoutSpec::new();
        spec.add_binding(1, 3, vk::DescriptorType::SAMPLER, 1, STAGES).unwrap();
        let err = spec
            .add_binding(1, 3, vk::DescriptorType::UNIFORM_BUFFER, 1, STAGES)
            .unwrap_err();
        assert!(matches!(err, GpuError::DuplicateBinding { set: 1, binding: 3 }));
        // Same number in another set is fine.
        spec.add_binding(0, 3, vk::DescriptorType::SAMPLER, 1, STAGES).unwrap();
    }

    #[test]
    fn writes_look_up_bindings_by_number() {
        let mut spec = DescriptorLayoutSpec::new();
        spec.add_binding(0, 5, vk::DescriptorType::UNIFORM_BUFFER, 1, STAGES).unwrap();
        spec.add_binding(0, 2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4, STAGES).unwrap();

        let buffers = WritePayload::Buffers(vec![buffer_info()]);
        assert_eq!(
            spec.check_write(0, 5, 0, &buffers).unwrap(),
            vk::DescriptorType::UNIFORM_BUFFER
        );

        // Position 0 in the list is binding 5, not binding 0.
        assert!(matches!(
            spec.check_write(0, 0, 0, &buffers),
            Err(GpuError::UnknownBinding { set: 0, binding: 0 })
        ));
        assert!(matches!(
            spec.check_write(1, 5, 0, &buffers),
            Err(GpuError::UnknownBinding { set: 1, binding: 5 })
        ));
    }

    #[test]
    fn write_payload_must_match_type() {
        let mut spec = DescriptorLayoutSpec::new();
        spec.add_binding(0, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4, STAGES).unwrap();

        let err = spec
            .check_write(0, 0, 0, &WritePayload::Buffers(vec![buffer_info()]))
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::DescriptorTypeMismatch { expected, .. }
                if expected == vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        ));

        let images = WritePayload::Images(vec![vk::DescriptorImageInfo::default(); 2]);
        assert!(spec.check_write(0, 0, 2, &images).is_ok());
        assert!(matches!(
            spec.check_write(0, 0, 3, &images),
            Err(GpuError::OutOfBounds { offset: 3, size: 2, capacity: 4 })
        ));
        assert!(spec.check_write(0, 0, 0, &WritePayload::Images(Vec::new())).is_err());
    }

    #[test]
    fn payload_kinds() {
        assert_eq!(
            PayloadKind::of(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC),
            Some(PayloadKind::Buffer)
        );
        assert_eq!(
            PayloadKind::of(vk::DescriptorType::INPUT_ATTACHMENT),
            Some(PayloadKind::Image)
        );
        assert_eq!(
            PayloadKind::of(vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
            Some(PayloadKind::TexelBufferView)
        );
        assert_eq!(PayloadKind::of(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), None);
    }
}
