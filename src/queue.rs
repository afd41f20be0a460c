// Command queues, fence values and command-allocator pooling
//
// Each logical queue (graphics, compute, copy) owns a timeline fence and a
// pool of command allocators. Fence values are tagged with the owning queue
// in the top byte so a bare value can always be routed back to its timeline,
// even when queues share a vk family on the hardware.

use anyhow::{Context, Result};
use ash::vk;
use log::debug;

use crate::sync::Fence;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

impl QueueType {
    fn tag(self) -> u64 {
        match self {
            QueueType::Graphics => 1,
            QueueType::Compute => 2,
            QueueType::Copy => 3,
        }
    }

    fn from_tag(tag: u64) -> Option<QueueType> {
        match tag {
            1 => Some(QueueType::Graphics),
            2 => Some(QueueType::Compute),
            3 => Some(QueueType::Copy),
            _ => None,
        }
    }
}

const FENCE_TAG_SHIFT: u64 = 56;
const FENCE_COUNTER_MASK: u64 = (1 << FENCE_TAG_SHIFT) - 1;

/// A point on one queue's timeline. The top byte carries the queue tag, the
/// rest a monotonic counter. The zero value never matches a real submission.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct FenceValue(pub u64);

impl FenceValue {
    pub const NULL: FenceValue = FenceValue(0);

    pub fn new(queue: QueueType, counter: u64) -> FenceValue {
        debug_assert!(counter <= FENCE_COUNTER_MASK);
        FenceValue((queue.tag() << FENCE_TAG_SHIFT) | counter)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn queue_type(self) -> QueueType {
        QueueType::from_tag(self.0 >> FENCE_TAG_SHIFT).expect("untagged fence value")
    }

    pub fn counter(self) -> u64 {
        self.0 & FENCE_COUNTER_MASK
    }
}

/// A command pool plus its single primary command buffer, recycled through
/// [`CommandAllocatorPool`].
pub struct CommandAllocator {
    pub pool: vk::CommandPool,
    pub cmd_buf: vk::CommandBuffer,
}

struct RetiredAllocator {
    alloc: CommandAllocator,
    retire_fence: FenceValue,
}

/// Recycles command allocators once the submission that used them has
/// retired on the owning queue.
pub struct CommandAllocatorPool {
    family_index: u32,
    retired: Vec<RetiredAllocator>,
    num_created: u32,
}

/// Index of the first entry whose retire counter has completed.
fn find_reusable(retire_counters: impl Iterator<Item = u64>, completed: u64) -> Option<usize> {
    retire_counters.enumerate().find_map(|(i, c)| (c <= completed).then_some(i))
}

impl CommandAllocatorPool {
    pub fn new(family_index: u32) -> Self {
        Self {
            family_index,
            retired: Vec::new(),
            num_created: 0,
        }
    }

    pub fn acquire(&mut self, device: &ash::Device, fence: &mut Fence) -> Result<CommandAllocator> {
        let completed = fence.completed_value(device)? & FENCE_COUNTER_MASK;
        if let Some(idx) = find_reusable(
            self.retired.iter().map(|r| r.retire_fence.counter()),
            completed,
        ) {
            let entry = self.retired.swap_remove(idx);
            unsafe {
                device
                    .reset_command_pool(entry.alloc.pool, vk::CommandPoolResetFlags::empty())
                    .context("Failed to reset command pool")?;
            }
            return Ok(entry.alloc);
        }

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd_buf = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate command buffer")?[0]
        };

        self.num_created += 1;
        debug!(
            "Created command allocator {} for family {}",
            self.num_created, self.family_index
        );
        Ok(CommandAllocator { pool, cmd_buf })
    }

    /// Returns an allocator after submission. It becomes reusable once
    /// `retire_fence` completes.
    pub fn release(&mut self, alloc: CommandAllocator, retire_fence: FenceValue) {
        self.retired.push(RetiredAllocator {
            alloc,
            retire_fence,
        });
    }

    /// # Safety
    /// The queue must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for entry in self.retired.drain(..) {
            device.destroy_command_pool(entry.alloc.pool, None);
        }
    }
}

/// Binary/timeline waits and signals attached to one submission.
#[derive(Default)]
pub struct SubmitDesc {
    pub wait_binary: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal_binary: Vec<vk::Semaphore>,
}

pub struct CommandQueue {
    pub queue: vk::Queue,
    pub family_index: u32,
    pub queue_type: QueueType,
    pub fence: Fence,
    allocator_pool: CommandAllocatorPool,
    next_counter: u64,
    last_submitted: FenceValue,
    // Cross-queue timeline waits accumulated for the next submission.
    pending_waits: Vec<(vk::Semaphore, u64)>,
}

impl CommandQueue {
    pub fn new(
        device: &ash::Device,
        queue: vk::Queue,
        family_index: u32,
        queue_type: QueueType,
    ) -> Result<Self> {
        // The timeline starts at the tagged zero so tagged values compare
        // directly against the semaphore counter.
        let fence = Fence::new(device, FenceValue::new(queue_type, 0).0)?;
        Ok(Self {
            queue,
            family_index,
            queue_type,
            fence,
            allocator_pool: CommandAllocatorPool::new(family_index),
            next_counter: 1,
            last_submitted: FenceValue::NULL,
            pending_waits: Vec::new(),
        })
    }

    /// The value the next submission will signal.
    pub fn next_fence_value(&self) -> FenceValue {
        FenceValue::new(self.queue_type, self.next_counter)
    }

    pub fn last_submitted_fence(&self) -> FenceValue {
        self.last_submitted
    }

    pub fn acquire_allocator(&mut self, device: &ash::Device) -> Result<CommandAllocator> {
        self.allocator_pool.acquire(device, &mut self.fence)
    }

    pub fn release_allocator(&mut self, alloc: CommandAllocator, retire_fence: FenceValue) {
        self.allocator_pool.release(alloc, retire_fence);
    }

    /// Queues a GPU-side wait on another queue's fence value. Consumed by the
    /// next submission on this queue.
    pub fn wait_gpu(&mut self, semaphore: vk::Semaphore, value: FenceValue) {
        debug_assert!(!value.is_null());
        self.pending_waits.push((semaphore, value.0));
    }

    /// Submits a command buffer, signalling this queue's fence. Returns the
    /// fence value that retires when the submission finishes.
    pub fn submit(
        &mut self,
        device: &ash::Device,
        cmd_buf: vk::CommandBuffer,
        desc: &SubmitDesc,
    ) -> Result<FenceValue> {
        let fence_value = self.next_fence_value();

        let mut wait_semaphores: Vec<vk::Semaphore> = Vec::new();
        let mut wait_stages: Vec<vk::PipelineStageFlags> = Vec::new();
        let mut wait_values: Vec<u64> = Vec::new();

        for &(sem, stage) in &desc.wait_binary {
            wait_semaphores.push(sem);
            wait_stages.push(stage);
            wait_values.push(0); // ignored for binary semaphores
        }
        for (sem, value) in self.pending_waits.drain(..) {
            wait_semaphores.push(sem);
            wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
            wait_values.push(value);
        }

        let mut signal_semaphores: Vec<vk::Semaphore> = desc.signal_binary.clone();
        let mut signal_values: Vec<u64> = vec![0; signal_semaphores.len()];
        signal_semaphores.push(self.fence.semaphore);
        signal_values.push(fence_value.0);

        let command_buffers = [cmd_buf];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
                .context("Queue submit failed")?;
        }

        self.next_counter += 1;
        self.last_submitted = fence_value;
        Ok(fence_value)
    }

    pub fn has_fence_completed(&mut self, device: &ash::Device, value: FenceValue) -> Result<bool> {
        debug_assert_eq!(value.queue_type(), self.queue_type);
        self.fence.has_completed(device, value.0)
    }

    pub fn wait_fence_blocking(&mut self, device: &ash::Device, value: FenceValue) -> Result<()> {
        debug_assert_eq!(value.queue_type(), self.queue_type);
        self.fence.wait_blocking(device, value.0)
    }

    pub fn wait_idle(&mut self, device: &ash::Device) -> Result<()> {
        if !self.last_submitted.is_null() {
            self.wait_fence_blocking(device, self.last_submitted)?;
        }
        Ok(())
    }

    /// # Safety
    /// The queue must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.allocator_pool.destroy(device);
        self.fence.destroy(device);
    }
}

/// The three logical queues. On hardware without dedicated compute/copy
/// families these may alias the same vk family; the fence tags keep their
/// timelines apart regardless.
pub struct QueueManager {
    pub graphics: CommandQueue,
    pub compute: CommandQueue,
    pub copy: CommandQueue,
}

impl QueueManager {
    pub fn queue_mut(&mut self, ty: QueueType) -> &mut CommandQueue {
        match ty {
            QueueType::Graphics => &mut self.graphics,
            QueueType::Compute => &mut self.compute,
            QueueType::Copy => &mut self.copy,
        }
    }

    pub fn queue(&self, ty: QueueType) -> &CommandQueue {
        match ty {
            QueueType::Graphics => &self.graphics,
            QueueType::Compute => &self.compute,
            QueueType::Copy => &self.copy,
        }
    }

    /// Routes a tagged fence value to its owning queue.
    pub fn has_fence_completed(&mut self, device: &ash::Device, value: FenceValue) -> Result<bool> {
        if value.is_null() {
            return Ok(true);
        }
        self.queue_mut(value.queue_type())
            .has_fence_completed(device, value)
    }

    pub fn wait_fence_blocking(&mut self, device: &ash::Device, value: FenceValue) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        self.queue_mut(value.queue_type())
            .wait_fence_blocking(device, value)
    }

    /// Makes `waiter` wait on the GPU for `value` before its next submission.
    pub fn wait_cross_queue(&mut self, waiter: QueueType, value: FenceValue) {
        debug_assert_ne!(waiter, value.queue_type());
        let semaphore = self.queue(value.queue_type()).fence.semaphore;
        self.queue_mut(waiter).wait_gpu(semaphore, value);
    }

    pub fn wait_all_idle(&mut self, device: &ash::Device) -> Result<()> {
        self.graphics.wait_idle(device)?;
        self.compute.wait_idle(device)?;
        self.copy.wait_idle(device)?;
        Ok(())
    }

    /// # Safety
    /// All queues must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.graphics.destroy(device);
        self.compute.destroy(device);
        self.copy.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_value_roundtrip() {
        let v = FenceValue::new(QueueType::Copy, 1234);
        assert_eq!(v.queue_type(), QueueType::Copy);
        assert_eq!(v.counter(), 1234);
        assert!(!v.is_null());
        assert!(FenceValue::NULL.is_null());
    }

    #[test]
    fn fence_values_order_within_a_queue() {
        let a = FenceValue::new(QueueType::Graphics, 10);
        let b = FenceValue::new(QueueType::Graphics, 11);
        assert!(a.0 < b.0);
    }

    #[test]
    fn tags_keep_queue_timelines_apart() {
        let g = FenceValue::new(QueueType::Graphics, 5);
        let c = FenceValue::new(QueueType::Compute, 5);
        assert_ne!(g, c);
        assert_eq!(g.counter(), c.counter());
        assert_eq!(g.queue_type(), QueueType::Graphics);
        assert_eq!(c.queue_type(), QueueType::Compute);
    }

    #[test]
    #[should_panic(expected = "untagged fence value")]
    fn untagged_value_panics_on_routing() {
        let _ = FenceValue(42).queue_type();
    }

    #[test]
    fn allocator_reuse_picks_completed_entry() {
        // Retire counters 10 and 4; with 5 completed only the second is free.
        assert_eq!(find_reusable([10u64, 4].into_iter(), 5), Some(1));
        assert_eq!(find_reusable([10u64, 6].into_iter(), 5), None);
        assert_eq!(find_reusable(std::iter::empty(), 5), None);
        // Equal counter counts as completed.
        assert_eq!(find_reusable([5u64].into_iter(), 5), Some(0));
    }
}
