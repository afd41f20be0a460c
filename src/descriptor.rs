// Descriptor heap: one update-after-bind set, three allocation disciplines
//
// All shader-visible views live in a single bindless descriptor set with one
// typed binding array per view kind, each `capacity` entries deep. A view's
// "descriptor" is therefore just a slot index shared across the bindings.
// The slot space is partitioned:
//
//   [0, null)                      null views, the fallback for unset table entries
//   [null, persistent_end)         free-list region, lives until freed
//   N frame-local linear regions   reset wholesale each time the frame slot recycles
//   ring region                    per-draw descriptor tables, reclaimed on frame cadence
//
// Per-draw tables are contiguous ring ranges filled with vkCmdCopyDescriptorSet
// copies and published to shaders as base indices in push constants.

use anyhow::{Context, Result};
use ash::vk;

use crate::types::MAX_BUFFERED_FRAMES;

pub const BINDING_UNIFORM_BUFFER: u32 = 0;
pub const BINDING_STORAGE_BUFFER: u32 = 1;
pub const BINDING_SAMPLED_IMAGE: u32 = 2;
pub const BINDING_STORAGE_IMAGE: u32 = 3;
pub const BINDING_SAMPLERS: u32 = 4;

pub const NUM_STATIC_SAMPLERS: u32 = 4;

/// Slot ranges carved out of the heap. Pure math, computed once at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapPartition {
    pub capacity: u32,
    pub null_size: u32,
    pub persistent_base: u32,
    pub persistent_size: u32,
    pub linear_bases: [u32; MAX_BUFFERED_FRAMES],
    pub linear_size: u32,
    pub ring_base: u32,
    pub ring_size: u32,
}

pub fn partition_heap(
    capacity: u32,
    null_size: u32,
    linear_size: u32,
    ring_size: u32,
) -> HeapPartition {
    let reserved = null_size + linear_size * MAX_BUFFERED_FRAMES as u32 + ring_size;
    assert!(
        reserved < capacity,
        "descriptor heap too small: {reserved} reserved slots of {capacity}"
    );

    let persistent_base = null_size;
    let persistent_size = capacity - reserved;
    let mut next = persistent_base + persistent_size;

    let mut linear_bases = [0u32; MAX_BUFFERED_FRAMES];
    for base in &mut linear_bases {
        *base = next;
        next += linear_size;
    }

    let ring_base = next;
    debug_assert_eq!(ring_base + ring_size, capacity);

    HeapPartition {
        capacity,
        null_size,
        persistent_base,
        persistent_size,
        linear_bases,
        linear_size,
        ring_base,
        ring_size,
    }
}

/// Free-list allocation over a slot range. Persistent views use this.
pub struct FreeListAllocator {
    base: u32,
    free: Vec<u32>,
    capacity: u32,
}

impl FreeListAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        // Popping from the back hands out low slots first.
        let free = (0..size).rev().map(|i| base + i).collect();
        Self {
            base,
            free,
            capacity: size,
        }
    }

    pub fn alloc(&mut self) -> u32 {
        self.free.pop().expect("persistent descriptor region exhausted")
    }

    pub fn free(&mut self, slot: u32) {
        debug_assert!(slot >= self.base && slot < self.base + self.capacity);
        debug_assert!((self.free.len() as u32) < self.capacity);
        self.free.push(slot);
    }

    pub fn num_free(&self) -> u32 {
        self.free.len() as u32
    }
}

/// Bump allocation over a slot range, reset wholesale each frame recycle.
pub struct LinearAllocator {
    base: u32,
    size: u32,
    head: u32,
}

impl LinearAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        Self { base, size, head: 0 }
    }

    pub fn alloc(&mut self, count: u32) -> u32 {
        assert!(
            self.head + count <= self.size,
            "frame linear descriptor region exhausted ({} of {} used)",
            self.head,
            self.size
        );
        let slot = self.base + self.head;
        self.head += count;
        slot
    }

    pub fn reset(&mut self) {
        self.head = 0;
    }
}

/// Ring allocation over a slot range with monotonic head/tail counters.
/// Allocations are contiguous: a would-wrap allocation skips the range tail.
/// The tail advances on the N-frame cadence, not on a fence check, so ring
/// contents must not be referenced for more than N frames.
pub struct RingAllocator {
    base: u32,
    size: u64,
    head: u64,
    tail: u64,
    frame_heads: [u64; MAX_BUFFERED_FRAMES],
}

const INVALID_FRAME_HEAD: u64 = u64::MAX;

impl RingAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size: size as u64,
            head: 0,
            tail: 0,
            frame_heads: [INVALID_FRAME_HEAD; MAX_BUFFERED_FRAMES],
        }
    }

    pub fn alloc(&mut self, count: u32) -> Option<u32> {
        let count = count as u64;
        debug_assert!(count <= self.size);

        let offset = self.head % self.size;
        let start = if offset + count > self.size {
            // Wasting the range tail keeps the allocation contiguous.
            self.head + (self.size - offset)
        } else {
            self.head
        };

        if start + count > self.tail + self.size {
            return None;
        }
        self.head = start + count;
        Some(self.base + (start % self.size) as u32)
    }

    pub fn on_end_frame(&mut self, frame_idx: usize) {
        self.frame_heads[frame_idx] = self.head;
    }

    /// Reclaims everything allocated up to the last end-of-frame mark for
    /// this frame slot.
    pub fn on_begin_frame(&mut self, frame_idx: usize) {
        if self.frame_heads[frame_idx] != INVALID_FRAME_HEAD {
            debug_assert!(self.frame_heads[frame_idx] >= self.tail);
            self.tail = self.frame_heads[frame_idx];
            self.frame_heads[frame_idx] = INVALID_FRAME_HEAD;
        }
    }
}

/// A pending descriptor copy from one heap slot to another, within a binding.
#[derive(Clone, Copy, Debug)]
pub struct SlotCopy {
    pub binding: u32,
    pub src_slot: u32,
    pub dst_slot: u32,
}

pub struct DescriptorHeap {
    pub partition: HeapPartition,

    pub pool: vk::DescriptorPool,
    pub set_layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
    samplers: [vk::Sampler; NUM_STATIC_SAMPLERS as usize],

    pub persistent: FreeListAllocator,
    pub linear: [LinearAllocator; MAX_BUFFERED_FRAMES],
    pub ring: RingAllocator,
}

impl DescriptorHeap {
    pub fn new(device: &ash::Device, partition: HeapPartition) -> Result<Self> {
        let capacity = partition.capacity;

        let samplers = create_static_samplers(device)?;

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_UNIFORM_BUFFER)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_STORAGE_BUFFER)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SAMPLED_IMAGE)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_STORAGE_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SAMPLERS)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(NUM_STATIC_SAMPLERS)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .immutable_samplers(&samplers)
                .build(),
        ];

        let array_flags = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
        let binding_flags = [
            array_flags,
            array_flags,
            array_flags,
            array_flags,
            vk::DescriptorBindingFlags::empty(),
        ];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_info);
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .context("Failed to create bindless set layout")?
        };

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: NUM_STATIC_SAMPLERS,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .context("Failed to create bindless descriptor pool")?
        };

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = unsafe {
            device
                .allocate_descriptor_sets(&alloc_info)
                .context("Failed to allocate bindless descriptor set")?[0]
        };

        Ok(Self {
            persistent: FreeListAllocator::new(partition.persistent_base, partition.persistent_size),
            linear: partition
                .linear_bases
                .map(|base| LinearAllocator::new(base, partition.linear_size)),
            ring: RingAllocator::new(partition.ring_base, partition.ring_size),
            partition,
            pool,
            set_layout,
            set,
            samplers,
        })
    }

    pub fn null_slot(&self) -> u32 {
        0
    }

    pub fn alloc_persistent(&mut self) -> u32 {
        self.persistent.alloc()
    }

    pub fn free_persistent(&mut self, slot: u32) {
        self.persistent.free(slot);
    }

    pub fn alloc_linear(&mut self, frame_idx: usize, count: u32) -> u32 {
        self.linear[frame_idx].alloc(count)
    }

    /// Contiguous slot range for a per-draw table.
    pub fn alloc_table(&mut self, count: u32) -> u32 {
        self.ring
            .alloc(count)
            .expect("descriptor table ring exhausted this frame")
    }

    pub fn on_begin_frame(&mut self, frame_idx: usize) {
        self.linear[frame_idx].reset();
        self.ring.on_begin_frame(frame_idx);
    }

    pub fn on_end_frame(&mut self, frame_idx: usize) {
        self.ring.on_end_frame(frame_idx);
    }

    pub fn write_uniform_buffer(
        &self,
        device: &ash::Device,
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let info = [vk::DescriptorBufferInfo {
            buffer,
            offset,
            range,
        }];
        self.write_buffer(device, BINDING_UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER, slot, &info);
    }

    pub fn write_storage_buffer(
        &self,
        device: &ash::Device,
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let info = [vk::DescriptorBufferInfo {
            buffer,
            offset,
            range,
        }];
        self.write_buffer(device, BINDING_STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER, slot, &info);
    }

    fn write_buffer(
        &self,
        device: &ash::Device,
        binding: u32,
        ty: vk::DescriptorType,
        slot: u32,
        info: &[vk::DescriptorBufferInfo],
    ) {
        debug_assert!(slot < self.partition.capacity);
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(ty)
            .buffer_info(info);
        unsafe { device.update_descriptor_sets(&[write.build()], &[]) };
    }

    pub fn write_sampled_image(&self, device: &ash::Device, slot: u32, view: vk::ImageView) {
        self.write_image(
            device,
            BINDING_SAMPLED_IMAGE,
            vk::DescriptorType::SAMPLED_IMAGE,
            slot,
            view,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
    }

    pub fn write_storage_image(&self, device: &ash::Device, slot: u32, view: vk::ImageView) {
        self.write_image(
            device,
            BINDING_STORAGE_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            slot,
            view,
            vk::ImageLayout::GENERAL,
        );
    }

    fn write_image(
        &self,
        device: &ash::Device,
        binding: u32,
        ty: vk::DescriptorType,
        slot: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) {
        debug_assert!(slot < self.partition.capacity);
        let info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(ty)
            .image_info(&info);
        unsafe { device.update_descriptor_sets(&[write.build()], &[]) };
    }

    /// Flushes a batch of slot-to-slot copies (per-draw table builds).
    pub fn copy_slots(&self, device: &ash::Device, copies: &[SlotCopy]) {
        if copies.is_empty() {
            return;
        }
        let vk_copies: Vec<vk::CopyDescriptorSet> = copies
            .iter()
            .map(|c| {
                debug_assert!(c.src_slot < self.partition.capacity);
                debug_assert!(c.dst_slot < self.partition.capacity);
                vk::CopyDescriptorSet::builder()
                    .src_set(self.set)
                    .src_binding(c.binding)
                    .src_array_element(c.src_slot)
                    .dst_set(self.set)
                    .dst_binding(c.binding)
                    .dst_array_element(c.dst_slot)
                    .descriptor_count(1)
                    .build()
            })
            .collect();
        unsafe { device.update_descriptor_sets(&[], &vk_copies) };
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        for sampler in self.samplers {
            device.destroy_sampler(sampler, None);
        }
    }
}

// Point/linear filtering crossed with clamp/wrap addressing, bound as
// immutable samplers. Shaders pick by index, no sampler objects in the API.
fn create_static_samplers(
    device: &ash::Device,
) -> Result<[vk::Sampler; NUM_STATIC_SAMPLERS as usize]> {
    let mut samplers = [vk::Sampler::null(); NUM_STATIC_SAMPLERS as usize];
    let configs = [
        (vk::Filter::NEAREST, vk::SamplerAddressMode::CLAMP_TO_EDGE),
        (vk::Filter::NEAREST, vk::SamplerAddressMode::REPEAT),
        (vk::Filter::LINEAR, vk::SamplerAddressMode::CLAMP_TO_EDGE),
        (vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT),
    ];
    for (i, (filter, address)) in configs.into_iter().enumerate() {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(if filter == vk::Filter::LINEAR {
                vk::SamplerMipmapMode::LINEAR
            } else {
                vk::SamplerMipmapMode::NEAREST
            })
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .max_lod(vk::LOD_CLAMP_NONE);
        samplers[i] = unsafe {
            device
                .create_sampler(&info, None)
                .context("Failed to create static sampler")?
        };
    }
    Ok(samplers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_heap_exactly() {
        let p = partition_heap(4096, 16, 256, 1024);
        assert_eq!(p.persistent_base, 16);
        assert_eq!(
            p.persistent_size,
            4096 - 16 - 256 * MAX_BUFFERED_FRAMES as u32 - 1024
        );
        let mut next = p.persistent_base + p.persistent_size;
        for base in p.linear_bases {
            assert_eq!(base, next);
            next += p.linear_size;
        }
        assert_eq!(p.ring_base, next);
        assert_eq!(p.ring_base + p.ring_size, p.capacity);
    }

    #[test]
    #[should_panic(expected = "descriptor heap too small")]
    fn partition_rejects_oversubscription() {
        partition_heap(1024, 16, 256, 1024);
    }

    #[test]
    fn free_list_reuses_slots() {
        let mut a = FreeListAllocator::new(100, 4);
        let s0 = a.alloc();
        let s1 = a.alloc();
        assert_eq!(s0, 100);
        assert_eq!(s1, 101);
        a.free(s0);
        assert_eq!(a.alloc(), s0);
        // Two slots out of four are in use.
        assert_eq!(a.num_free(), 2);
    }

    #[test]
    #[should_panic(expected = "persistent descriptor region exhausted")]
    fn free_list_exhaustion_panics() {
        let mut a = FreeListAllocator::new(0, 2);
        a.alloc();
        a.alloc();
        a.alloc();
    }

    #[test]
    fn linear_bumps_and_resets() {
        let mut a = LinearAllocator::new(50, 10);
        assert_eq!(a.alloc(4), 50);
        assert_eq!(a.alloc(4), 54);
        a.reset();
        assert_eq!(a.alloc(10), 50);
    }

    #[test]
    fn ring_skips_tail_on_wrap() {
        let mut r = RingAllocator::new(0, 10);
        assert_eq!(r.alloc(6), Some(0));
        r.on_end_frame(0);
        r.on_begin_frame(1);
        // 6 of 10 used; a 6-slot alloc would wrap, so it must wait for space
        // at the range start.
        assert_eq!(r.alloc(6), None);
        assert_eq!(r.alloc(4), Some(6));
    }

    #[test]
    fn ring_reclaims_on_frame_cadence() {
        let mut r = RingAllocator::new(0, 10);
        assert_eq!(r.alloc(8), Some(0));
        r.on_end_frame(0);

        assert_eq!(r.alloc(8), None);
        // Recycling frame slot 0 frees its allocations; the new range wraps
        // to the start.
        r.on_begin_frame(0);
        assert_eq!(r.alloc(8), Some(0));
    }

    #[test]
    fn ring_wrap_returns_contiguous_base() {
        let mut r = RingAllocator::new(100, 8);
        assert_eq!(r.alloc(6), Some(100));
        r.on_end_frame(0);
        r.on_begin_frame(0);
        // Head sits at 6; a 4-slot alloc wraps past the end and lands at the
        // range start, offset by the heap base.
        assert_eq!(r.alloc(4), Some(100));
    }

    #[test]
    fn ring_holds_n_frames_of_allocations() {
        let mut r = RingAllocator::new(0, 9);
        for frame in 0..MAX_BUFFERED_FRAMES {
            assert!(r.alloc(3).is_some(), "frame {frame} allocation failed");
            r.on_end_frame(frame);
        }
        // All N frames in flight, ring full.
        assert_eq!(r.alloc(3), None);
        r.on_begin_frame(0);
        assert!(r.alloc(3).is_some());
    }
}
