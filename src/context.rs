// Command context: bound-state cache, dirty tracking, barrier batching
//
// A context records into one pooled command buffer. Binds are cached and only
// replayed to the command buffer when a draw or dispatch needs them, driven
// by the dirty bitset. Resource transitions batch up and flush as a single
// pipeline barrier right before work is recorded.
//
// The recording API itself lives in `cmd`; this module owns the state.

use ash::vk;

use crate::handle::{BufferHandle, PsoHandle, ResourceHandle, TextureHandle};
use crate::queue::{CommandAllocator, QueueType};
use crate::types::{
    ResourceState, CBV_TABLE_SIZE, MAX_RENDER_TARGETS, MAX_VERTEX_STREAMS, SRV_TABLE_SIZE,
    UAV_TABLE_SIZE,
};

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct DirtyFlags: u32 {
        const PIPELINE          = 0x1;
        const VERTEX_BUFFERS    = 0x2;
        const INDEX_BUFFER      = 0x4;
        const RENDER_TARGETS    = 0x8;
        const VIEWPORT          = 0x10;
        const SCISSOR           = 0x20;

        const GFX_CBV_TABLE     = 0x40;
        const GFX_SRV_TABLE     = 0x80;
        const GFX_UAV_TABLE     = 0x100;

        const COMPUTE_PIPELINE  = 0x200;
        const CMP_CBV_TABLE     = 0x400;
        const CMP_SRV_TABLE     = 0x800;
        const CMP_UAV_TABLE     = 0x1000;

        const GFX_TABLES = Self::GFX_CBV_TABLE.bits()
            | Self::GFX_SRV_TABLE.bits()
            | Self::GFX_UAV_TABLE.bits();
        const CMP_TABLES = Self::CMP_CBV_TABLE.bits()
            | Self::CMP_SRV_TABLE.bits()
            | Self::CMP_UAV_TABLE.bits();
    }
}

/// One shader-visible table slot. Resolved to a heap slot when tables are
/// built; `Slot` entries (scratch constants, transient views) are already
/// resolved at set time.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TableEntry {
    #[default]
    Null,
    Resource(ResourceHandle),
    Slot(u32),
}

pub struct BindTables {
    pub cbv: [TableEntry; CBV_TABLE_SIZE as usize],
    pub srv: [TableEntry; SRV_TABLE_SIZE as usize],
    pub uav: [TableEntry; UAV_TABLE_SIZE as usize],
}

impl Default for BindTables {
    fn default() -> Self {
        Self {
            cbv: [TableEntry::Null; CBV_TABLE_SIZE as usize],
            srv: [TableEntry::Null; SRV_TABLE_SIZE as usize],
            uav: [TableEntry::Null; UAV_TABLE_SIZE as usize],
        }
    }
}

impl BindTables {
    /// Dirty flags for every table referencing `handle`, given the per-table
    /// flag triple. Used when a bound resource's views move.
    fn dirty_for_handle(
        &self,
        handle: ResourceHandle,
        flags: (DirtyFlags, DirtyFlags, DirtyFlags),
    ) -> DirtyFlags {
        let mut dirty = DirtyFlags::empty();
        let entry = TableEntry::Resource(handle);
        if self.cbv.contains(&entry) {
            dirty |= flags.0;
        }
        if self.srv.contains(&entry) {
            dirty |= flags.1;
        }
        if self.uav.contains(&entry) {
            dirty |= flags.2;
        }
        dirty
    }
}

/// Base slot indices of the built per-draw tables, pushed to shaders as
/// three u32 push constants.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TableBases {
    pub cbv_base: u32,
    pub srv_base: u32,
    pub uav_base: u32,
}

#[derive(Default)]
pub struct GraphicsState {
    pub pso: PsoHandle,
    pub vertex_buffers: [BufferHandle; MAX_VERTEX_STREAMS],
    pub index_buffer: BufferHandle,
    pub render_targets: [TextureHandle; MAX_RENDER_TARGETS],
    pub num_render_targets: u32,
    pub depth_target: TextureHandle,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub tables: BindTables,
}

#[derive(Default)]
pub struct ComputeState {
    pub pso: PsoHandle,
    pub tables: BindTables,
}

/// A pending resource transition. `before == after` only for write states,
/// where it stands for a write-to-write hazard barrier.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PendingBarrier {
    pub handle: ResourceHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// Batches transitions between draws. Recording merges with any pending
/// entry for the same resource: a transition back to the pending before
/// state cancels the entry outright, anything else just retargets it.
#[derive(Default)]
pub struct BarrierBatch {
    entries: Vec<PendingBarrier>,
}

impl BarrierBatch {
    /// `tracked` is the resource's current tracked state; the caller updates
    /// the tracked state to `target` after this returns.
    pub fn record(&mut self, handle: ResourceHandle, tracked: ResourceState, target: ResourceState) {
        if let Some(idx) = self.entries.iter().position(|e| e.handle == handle) {
            if self.entries[idx].before == target {
                self.entries.swap_remove(idx);
            } else {
                self.entries[idx].after = target;
            }
            return;
        }
        // Same-state records still need a hazard barrier for write states.
        if tracked != target || target.is_write() {
            self.entries.push(PendingBarrier {
                handle,
                before: tracked,
                after: target,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, PendingBarrier> {
        self.entries.drain(..)
    }

    pub fn entries(&self) -> &[PendingBarrier] {
        &self.entries
    }
}

pub struct CommandContext {
    pub queue_type: QueueType,
    pub allocator: CommandAllocator,
    pub cmd_buf: vk::CommandBuffer,

    pub dirty: DirtyFlags,
    pub graphics: GraphicsState,
    pub compute: ComputeState,
    pub barriers: BarrierBatch,

    /// Inside a dynamic-rendering scope; must close before barriers, copies
    /// or render-target rebinds.
    pub rendering_active: bool,
    /// Whether the bindless set has been bound for each bind point yet.
    pub set_bound_graphics: bool,
    pub set_bound_compute: bool,
    /// Last pushed table bases, to skip redundant push-constant updates.
    pub pushed_bases_graphics: Option<TableBases>,
    pub pushed_bases_compute: Option<TableBases>,
}

impl CommandContext {
    pub fn new(queue_type: QueueType, allocator: CommandAllocator) -> Self {
        let cmd_buf = allocator.cmd_buf;
        Self {
            queue_type,
            allocator,
            cmd_buf,
            dirty: DirtyFlags::all(),
            graphics: GraphicsState::default(),
            compute: ComputeState::default(),
            barriers: BarrierBatch::default(),
            rendering_active: false,
            set_bound_graphics: false,
            set_bound_compute: false,
            pushed_bases_graphics: None,
            pushed_bases_compute: None,
        }
    }

    /// Graphics work records only on the graphics queue.
    pub fn check_graphics(&self) {
        assert_eq!(
            self.queue_type,
            QueueType::Graphics,
            "graphics command on a {:?} context",
            self.queue_type
        );
    }

    /// Compute work records on graphics or compute queues.
    pub fn check_compute(&self) {
        assert_ne!(
            self.queue_type,
            QueueType::Copy,
            "compute command on a copy context"
        );
    }

    /// Re-dirties any table that binds `handle`. Needed when the resource's
    /// descriptors move (transient update) or its contents change meaning.
    pub fn mark_dirty_if_bound(&mut self, handle: ResourceHandle) {
        self.dirty |= self.graphics.tables.dirty_for_handle(
            handle,
            (
                DirtyFlags::GFX_CBV_TABLE,
                DirtyFlags::GFX_SRV_TABLE,
                DirtyFlags::GFX_UAV_TABLE,
            ),
        );
        self.dirty |= self.compute.tables.dirty_for_handle(
            handle,
            (
                DirtyFlags::CMP_CBV_TABLE,
                DirtyFlags::CMP_SRV_TABLE,
                DirtyFlags::CMP_UAV_TABLE,
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::RawHandle;

    fn handle(index: u32) -> ResourceHandle {
        ResourceHandle(RawHandle {
            index,
            generation: 0,
        })
    }

    #[test]
    fn redundant_read_transition_is_dropped() {
        let mut batch = BarrierBatch::default();
        batch.record(
            handle(0),
            ResourceState::ShaderResource,
            ResourceState::ShaderResource,
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn write_to_write_same_state_keeps_hazard_barrier() {
        let mut batch = BarrierBatch::default();
        batch.record(
            handle(0),
            ResourceState::UnorderedAccess,
            ResourceState::UnorderedAccess,
        );
        assert_eq!(batch.len(), 1);
        let e = batch.entries()[0];
        assert_eq!(e.before, e.after);
    }

    #[test]
    fn transition_back_cancels_pending_entry() {
        let mut batch = BarrierBatch::default();
        batch.record(
            handle(7),
            ResourceState::ShaderResource,
            ResourceState::UnorderedAccess,
        );
        assert_eq!(batch.len(), 1);
        // Back to the original state before anything was recorded: the pair
        // annihilates.
        batch.record(
            handle(7),
            ResourceState::UnorderedAccess,
            ResourceState::ShaderResource,
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn retarget_overwrites_pending_after_state() {
        let mut batch = BarrierBatch::default();
        batch.record(
            handle(3),
            ResourceState::ShaderResource,
            ResourceState::CopyDest,
        );
        batch.record(
            handle(3),
            ResourceState::CopyDest,
            ResourceState::UnorderedAccess,
        );
        assert_eq!(batch.len(), 1);
        let e = batch.entries()[0];
        assert_eq!(e.before, ResourceState::ShaderResource);
        assert_eq!(e.after, ResourceState::UnorderedAccess);
    }

    #[test]
    fn distinct_resources_batch_separately() {
        let mut batch = BarrierBatch::default();
        batch.record(
            handle(1),
            ResourceState::Unknown,
            ResourceState::CopyDest,
        );
        batch.record(
            handle(2),
            ResourceState::Unknown,
            ResourceState::ShaderResource,
        );
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn bound_handle_marks_tables_dirty() {
        let alloc = CommandAllocator {
            pool: vk::CommandPool::null(),
            cmd_buf: vk::CommandBuffer::null(),
        };
        let mut ctx = CommandContext::new(QueueType::Graphics, alloc);
        ctx.dirty = DirtyFlags::empty();

        ctx.graphics.tables.srv[4] = TableEntry::Resource(handle(9));
        ctx.compute.tables.uav[0] = TableEntry::Resource(handle(9));
        ctx.mark_dirty_if_bound(handle(9));

        assert!(ctx.dirty.contains(DirtyFlags::GFX_SRV_TABLE));
        assert!(ctx.dirty.contains(DirtyFlags::CMP_UAV_TABLE));
        assert!(!ctx.dirty.contains(DirtyFlags::GFX_CBV_TABLE));

        ctx.dirty = DirtyFlags::empty();
        ctx.mark_dirty_if_bound(handle(10));
        assert!(ctx.dirty.is_empty());
    }

    #[test]
    fn queue_class_checks() {
        let alloc = CommandAllocator {
            pool: vk::CommandPool::null(),
            cmd_buf: vk::CommandBuffer::null(),
        };
        let ctx = CommandContext::new(QueueType::Compute, alloc);
        ctx.check_compute();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ctx.check_graphics();
        }));
        assert!(result.is_err());
    }
}
