// Command recording
//
// Free functions over (&mut Device, &mut CommandContext). Setters only touch
// the context's cached state; draws and dispatches replay whatever the dirty
// bitset says changed, flush batched barriers and build the per-draw
// descriptor tables out of the heap ring before the vk command goes in.

use ash::vk;
use log::warn;

use crate::context::{CommandContext, DirtyFlags, TableBases, TableEntry};
use crate::descriptor::{
    SlotCopy, BINDING_SAMPLED_IMAGE, BINDING_STORAGE_BUFFER, BINDING_STORAGE_IMAGE,
    BINDING_UNIFORM_BUFFER,
};
use crate::device::Device;
use crate::handle::{BufferHandle, PsoHandle, ResourceHandle, TextureHandle};
use crate::pipeline::PsoDesc;
use crate::resource::{image_aspect, ResourceKind, INVALID_SLOT};
use crate::types::{
    BufferFlags, Format, IndexedDrawArguments, ResourceState, CBV_TABLE_SIZE, MAX_RENDER_TARGETS,
    SRV_TABLE_SIZE, UAV_TABLE_SIZE,
};
use crate::upload::{ScratchAlloc, CONSTANT_ALIGN};

// ---------------------------------------------------------------------------
// State setters
// ---------------------------------------------------------------------------

pub fn set_graphics_pso(ctx: &mut CommandContext, pso: PsoHandle) {
    ctx.check_graphics();
    if ctx.graphics.pso != pso {
        ctx.graphics.pso = pso;
        ctx.dirty |= DirtyFlags::PIPELINE;
    }
}

pub fn set_compute_pso(ctx: &mut CommandContext, pso: PsoHandle) {
    ctx.check_compute();
    if ctx.compute.pso != pso {
        ctx.compute.pso = pso;
        ctx.dirty |= DirtyFlags::COMPUTE_PIPELINE;
    }
}

pub fn set_vertex_buffer(ctx: &mut CommandContext, stream: u32, buffer: BufferHandle) {
    ctx.check_graphics();
    if ctx.graphics.vertex_buffers[stream as usize] != buffer {
        ctx.graphics.vertex_buffers[stream as usize] = buffer;
        ctx.dirty |= DirtyFlags::VERTEX_BUFFERS;
    }
}

pub fn set_index_buffer(ctx: &mut CommandContext, buffer: BufferHandle) {
    ctx.check_graphics();
    if ctx.graphics.index_buffer != buffer {
        ctx.graphics.index_buffer = buffer;
        ctx.dirty |= DirtyFlags::INDEX_BUFFER;
    }
}

/// Binds color and depth targets. The viewport and scissor snap to the first
/// target's full extent; override with [`set_viewport`]/[`set_scissor`] after.
pub fn set_render_targets(
    dev: &mut Device,
    ctx: &mut CommandContext,
    targets: &[TextureHandle],
    depth: TextureHandle,
) {
    ctx.check_graphics();
    assert!(targets.len() <= MAX_RENDER_TARGETS);

    ctx.graphics.render_targets = [TextureHandle::INVALID; MAX_RENDER_TARGETS];
    ctx.graphics.render_targets[..targets.len()].copy_from_slice(targets);
    ctx.graphics.num_render_targets = targets.len() as u32;
    ctx.graphics.depth_target = depth;
    ctx.dirty |= DirtyFlags::RENDER_TARGETS;

    let size_source = targets.first().copied().unwrap_or(depth);
    if size_source.is_valid() {
        let desc = dev
            .resources
            .lookup(size_source.resource().raw())
            .expect("stale render target handle")
            .texture()
            .desc;
        set_viewport(ctx, 0.0, 0.0, desc.width as f32, desc.height as f32, 0.0, 1.0);
        set_scissor(ctx, 0, 0, desc.width, desc.height);
    }
}

pub fn set_viewport(
    ctx: &mut CommandContext,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    min_depth: f32,
    max_depth: f32,
) {
    ctx.check_graphics();
    ctx.graphics.viewport = vk::Viewport {
        x,
        y,
        width,
        height,
        min_depth,
        max_depth,
    };
    ctx.dirty |= DirtyFlags::VIEWPORT;
}

pub fn set_scissor(ctx: &mut CommandContext, x: i32, y: i32, width: u32, height: u32) {
    ctx.check_graphics();
    ctx.graphics.scissor = vk::Rect2D {
        offset: vk::Offset2D { x, y },
        extent: vk::Extent2D { width, height },
    };
    ctx.dirty |= DirtyFlags::SCISSOR;
}

// ---------------------------------------------------------------------------
// Descriptor table entries
// ---------------------------------------------------------------------------

pub fn set_graphics_cbv(ctx: &mut CommandContext, index: u32, resource: ResourceHandle) {
    ctx.check_graphics();
    assert!(index < CBV_TABLE_SIZE);
    ctx.graphics.tables.cbv[index as usize] = table_entry(resource);
    ctx.dirty |= DirtyFlags::GFX_CBV_TABLE;
}

pub fn set_graphics_srv(ctx: &mut CommandContext, index: u32, resource: ResourceHandle) {
    ctx.check_graphics();
    assert!(index < SRV_TABLE_SIZE);
    ctx.graphics.tables.srv[index as usize] = table_entry(resource);
    ctx.dirty |= DirtyFlags::GFX_SRV_TABLE;
}

pub fn set_graphics_uav(ctx: &mut CommandContext, index: u32, resource: ResourceHandle) {
    ctx.check_graphics();
    assert!(index < UAV_TABLE_SIZE);
    ctx.graphics.tables.uav[index as usize] = table_entry(resource);
    ctx.dirty |= DirtyFlags::GFX_UAV_TABLE;
}

pub fn set_compute_cbv(ctx: &mut CommandContext, index: u32, resource: ResourceHandle) {
    ctx.check_compute();
    assert!(index < CBV_TABLE_SIZE);
    ctx.compute.tables.cbv[index as usize] = table_entry(resource);
    ctx.dirty |= DirtyFlags::CMP_CBV_TABLE;
}

pub fn set_compute_srv(ctx: &mut CommandContext, index: u32, resource: ResourceHandle) {
    ctx.check_compute();
    assert!(index < SRV_TABLE_SIZE);
    ctx.compute.tables.srv[index as usize] = table_entry(resource);
    ctx.dirty |= DirtyFlags::CMP_SRV_TABLE;
}

pub fn set_compute_uav(ctx: &mut CommandContext, index: u32, resource: ResourceHandle) {
    ctx.check_compute();
    assert!(index < UAV_TABLE_SIZE);
    ctx.compute.tables.uav[index as usize] = table_entry(resource);
    ctx.dirty |= DirtyFlags::CMP_UAV_TABLE;
}

fn table_entry(resource: ResourceHandle) -> TableEntry {
    if resource.is_valid() {
        TableEntry::Resource(resource)
    } else {
        TableEntry::Null
    }
}

/// Copies `data` into frame upload memory and binds it as a one-shot constant
/// buffer at CBV table slot `index`. Valid for this frame only.
pub fn set_graphics_scratch_cbv(
    dev: &mut Device,
    ctx: &mut CommandContext,
    index: u32,
    data: &[u8],
) {
    ctx.check_graphics();
    assert!(index < CBV_TABLE_SIZE);
    let slot = write_scratch_cbv(dev, data);
    ctx.graphics.tables.cbv[index as usize] = TableEntry::Slot(slot);
    ctx.dirty |= DirtyFlags::GFX_CBV_TABLE;
}

pub fn set_compute_scratch_cbv(
    dev: &mut Device,
    ctx: &mut CommandContext,
    index: u32,
    data: &[u8],
) {
    ctx.check_compute();
    assert!(index < CBV_TABLE_SIZE);
    let slot = write_scratch_cbv(dev, data);
    ctx.compute.tables.cbv[index as usize] = TableEntry::Slot(slot);
    ctx.dirty |= DirtyFlags::CMP_CBV_TABLE;
}

fn write_scratch_cbv(dev: &mut Device, data: &[u8]) -> u32 {
    let scratch = dev
        .upload_alloc(data.len() as u64, CONSTANT_ALIGN)
        .expect("frame upload memory exhausted");
    scratch.copy_from(data);

    let slot = dev.heap.alloc_linear(dev.frame_slot, 1);
    dev.heap
        .write_uniform_buffer(&dev.device, slot, scratch.buffer, scratch.offset, scratch.size);
    slot
}

/// Refreshes a dynamic buffer: the bytes are staged in frame upload memory
/// and copied into the buffer's own allocation on the GPU timeline. The
/// persistent views are untouched, so the contents stay valid across frames
/// until the next update. The buffer tracks as copy-dest afterwards.
pub fn update_dynamic_buffer(
    dev: &mut Device,
    ctx: &mut CommandContext,
    buffer: BufferHandle,
    data: &[u8],
) {
    let dst = {
        let record = dev
            .resources
            .lookup(buffer.resource().raw())
            .expect("update of stale buffer handle");
        let b = record.buffer();
        assert!(
            b.desc.flags.contains(BufferFlags::DYNAMIC)
                && !b.desc.flags.contains(BufferFlags::TRANSIENT),
            "buffer '{}' is not dynamic",
            record.name
        );
        assert!(data.len() as u32 <= b.desc.size_in_bytes);
        b.buffer
    };

    let scratch = dev
        .upload_alloc(data.len() as u64, 4)
        .expect("frame upload memory exhausted");
    scratch.copy_from(data);

    close_rendering(ctx, &dev.device);
    transition_resource(dev, ctx, buffer.resource(), ResourceState::CopyDest);
    flush_barriers(dev, ctx);

    let region = vk::BufferCopy {
        src_offset: scratch.offset,
        dst_offset: 0,
        size: data.len() as u64,
    };
    unsafe {
        dev.device
            .cmd_copy_buffer(ctx.cmd_buf, scratch.buffer, dst, &[region]);
    }
}

/// Gives a transient buffer fresh frame-local backing holding `data` and
/// rewrites its views into this frame's linear descriptor region. Transient
/// buffers must be updated every frame they are used.
pub fn update_transient_buffer(
    dev: &mut Device,
    ctx: &mut CommandContext,
    buffer: BufferHandle,
    data: &[u8],
) {
    let scratch = alloc_transient_backing(dev, buffer, data.len() as u64);
    scratch.copy_from(data);
    publish_transient_backing(dev, ctx, buffer, scratch);
}

/// Like [`update_transient_buffer`] but lets the caller fill the mapped
/// backing directly, skipping the intermediate copy.
pub fn update_transient_buffer_inplace(
    dev: &mut Device,
    ctx: &mut CommandContext,
    buffer: BufferHandle,
    len: u64,
    fill: impl FnOnce(&mut [u8]),
) {
    let scratch = alloc_transient_backing(dev, buffer, len);
    let bytes = unsafe { std::slice::from_raw_parts_mut(scratch.cpu_ptr(), len as usize) };
    fill(bytes);
    publish_transient_backing(dev, ctx, buffer, scratch);
}

fn alloc_transient_backing(
    dev: &mut Device,
    buffer: BufferHandle,
    len: u64,
) -> ScratchAlloc {
    let flags = {
        let record = dev
            .resources
            .lookup(buffer.resource().raw())
            .expect("update of stale buffer handle");
        let desc = record.buffer().desc;
        assert!(
            desc.flags.contains(BufferFlags::TRANSIENT),
            "buffer '{}' is not transient",
            record.name
        );
        assert!(len as u32 <= desc.size_in_bytes);
        desc.flags
    };

    let align = if flags.contains(BufferFlags::CONSTANT) {
        CONSTANT_ALIGN
    } else {
        4
    };
    dev.upload_alloc(len, align)
        .expect("frame upload memory exhausted")
}

fn publish_transient_backing(
    dev: &mut Device,
    ctx: &mut CommandContext,
    buffer: BufferHandle,
    scratch: ScratchAlloc,
) {
    let flags = dev
        .resources
        .lookup(buffer.resource().raw())
        .expect("update of stale buffer handle")
        .buffer()
        .desc
        .flags;

    let frame_slot = dev.frame_slot;
    let frame_counter = dev.frame_counter;

    let mut cbv_slot = INVALID_SLOT;
    let mut srv_slot = INVALID_SLOT;
    let mut uav_slot = INVALID_SLOT;
    if flags.contains(BufferFlags::CONSTANT) {
        cbv_slot = dev.heap.alloc_linear(frame_slot, 1);
        dev.heap.write_uniform_buffer(
            &dev.device,
            cbv_slot,
            scratch.buffer,
            scratch.offset,
            scratch.size,
        );
    }
    if flags.contains(BufferFlags::SHADER_RESOURCE) {
        srv_slot = dev.heap.alloc_linear(frame_slot, 1);
        dev.heap.write_storage_buffer(
            &dev.device,
            srv_slot,
            scratch.buffer,
            scratch.offset,
            scratch.size,
        );
    }
    if flags.contains(BufferFlags::UNORDERED_ACCESS) {
        uav_slot = dev.heap.alloc_linear(frame_slot, 1);
        dev.heap.write_storage_buffer(
            &dev.device,
            uav_slot,
            scratch.buffer,
            scratch.offset,
            scratch.size,
        );
    }

    let record = dev
        .resources
        .lookup_mut(buffer.resource().raw())
        .expect("update of stale buffer handle");
    let buf = record.buffer_mut();
    buf.frame_backing = Some(scratch);
    buf.last_update_frame = frame_counter;
    if cbv_slot != INVALID_SLOT {
        buf.cbv_slot = cbv_slot;
    }
    if srv_slot != INVALID_SLOT {
        buf.srv_slot = srv_slot;
    }
    if uav_slot != INVALID_SLOT {
        buf.uav_slot = uav_slot;
    }
    record.state = ResourceState::Common;

    ctx.mark_dirty_if_bound(buffer.resource());
}

// ---------------------------------------------------------------------------
// Barriers
// ---------------------------------------------------------------------------

/// Records a state transition; the barrier is batched until the next flush.
pub fn transition_resource(
    dev: &mut Device,
    ctx: &mut CommandContext,
    handle: ResourceHandle,
    target: ResourceState,
) {
    let record = dev
        .resources
        .lookup_mut(handle.raw())
        .expect("transition of stale resource handle");
    ctx.barriers.record(handle, record.state, target);
    record.state = target;
}

/// Write-to-write hazard barrier for a UAV resource, without a state change.
pub fn uav_barrier(dev: &mut Device, ctx: &mut CommandContext, handle: ResourceHandle) {
    transition_resource(dev, ctx, handle, ResourceState::UnorderedAccess);
}

/// Ends the dynamic-rendering scope if one is open. Barriers, copies and
/// clears are illegal inside it.
pub fn close_rendering(ctx: &mut CommandContext, device: &ash::Device) {
    if ctx.rendering_active {
        unsafe { device.cmd_end_rendering(ctx.cmd_buf) };
        ctx.rendering_active = false;
        ctx.dirty |= DirtyFlags::RENDER_TARGETS;
    }
}

/// Emits all batched transitions as one pipeline barrier.
pub fn flush_barriers(dev: &mut Device, ctx: &mut CommandContext) {
    if ctx.barriers.is_empty() {
        return;
    }
    close_rendering(ctx, &dev.device);

    let mut src_stage = vk::PipelineStageFlags::empty();
    let mut dst_stage = vk::PipelineStageFlags::empty();
    let mut buffer_barriers: Vec<vk::BufferMemoryBarrier> = Vec::new();
    let mut image_barriers: Vec<vk::ImageMemoryBarrier> = Vec::new();

    for pending in ctx.barriers.drain() {
        let record = match dev.resources.lookup(pending.handle.raw()) {
            Some(r) => r,
            None => {
                warn!("barrier on a resource released mid-frame, dropped");
                continue;
            }
        };
        let before = pending.before.to_vk();
        let after = pending.after.to_vk();
        src_stage |= before.stage;
        dst_stage |= after.stage;

        match &record.kind {
            ResourceKind::Buffer(b) => {
                let (buffer, offset, size) = match (&b.frame_backing, b.buffer) {
                    (Some(scratch), _) => (scratch.buffer, scratch.offset, scratch.size),
                    (None, buf) if buf != vk::Buffer::null() => (buf, 0, vk::WHOLE_SIZE),
                    _ => continue,
                };
                buffer_barriers.push(
                    vk::BufferMemoryBarrier::builder()
                        .src_access_mask(before.access)
                        .dst_access_mask(after.access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer)
                        .offset(offset)
                        .size(size)
                        .build(),
                );
            }
            ResourceKind::Texture(t) => {
                image_barriers.push(
                    vk::ImageMemoryBarrier::builder()
                        .src_access_mask(before.access)
                        .dst_access_mask(after.access)
                        .old_layout(before.layout)
                        .new_layout(after.layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(t.image)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: image_aspect(t.desc.format),
                            base_mip_level: 0,
                            level_count: vk::REMAINING_MIP_LEVELS,
                            base_array_layer: 0,
                            layer_count: vk::REMAINING_ARRAY_LAYERS,
                        })
                        .build(),
                );
            }
            ResourceKind::Empty => {}
        }
    }

    if buffer_barriers.is_empty() && image_barriers.is_empty() {
        return;
    }
    if src_stage.is_empty() {
        src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    unsafe {
        dev.device.cmd_pipeline_barrier(
            ctx.cmd_buf,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &buffer_barriers,
            &image_barriers,
        );
    }
}

// ---------------------------------------------------------------------------
// Clears and copies
// ---------------------------------------------------------------------------

pub fn clear_render_target(
    dev: &mut Device,
    ctx: &mut CommandContext,
    texture: TextureHandle,
    color: [f32; 4],
) {
    ctx.check_graphics();
    close_rendering(ctx, &dev.device);
    transition_resource(dev, ctx, texture.resource(), ResourceState::CopyDest);
    flush_barriers(dev, ctx);

    let record = dev
        .resources
        .lookup(texture.resource().raw())
        .expect("clear of stale texture handle");
    let image = record.texture().image;
    let clear = vk::ClearColorValue { float32: color };
    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    };
    unsafe {
        dev.device.cmd_clear_color_image(
            ctx.cmd_buf,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[range],
        );
    }
}

pub fn clear_depth_target(
    dev: &mut Device,
    ctx: &mut CommandContext,
    texture: TextureHandle,
    depth: f32,
) {
    ctx.check_graphics();
    close_rendering(ctx, &dev.device);
    transition_resource(dev, ctx, texture.resource(), ResourceState::CopyDest);
    flush_barriers(dev, ctx);

    let record = dev
        .resources
        .lookup(texture.resource().raw())
        .expect("clear of stale texture handle");
    let image = record.texture().image;
    let clear = vk::ClearDepthStencilValue { depth, stencil: 0 };
    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    };
    unsafe {
        dev.device.cmd_clear_depth_stencil_image(
            ctx.cmd_buf,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[range],
        );
    }
}

pub fn copy_buffer(
    dev: &mut Device,
    ctx: &mut CommandContext,
    src: BufferHandle,
    dst: BufferHandle,
    src_offset: u64,
    dst_offset: u64,
    size: u64,
) {
    close_rendering(ctx, &dev.device);
    transition_resource(dev, ctx, src.resource(), ResourceState::CopySrc);
    transition_resource(dev, ctx, dst.resource(), ResourceState::CopyDest);
    flush_barriers(dev, ctx);

    let resolve = |handle: BufferHandle, offset: u64| {
        let record = dev
            .resources
            .lookup(handle.resource().raw())
            .expect("copy with stale buffer handle");
        let b = record.buffer();
        match &b.frame_backing {
            Some(scratch) => (scratch.buffer, scratch.offset + offset),
            None => {
                assert!(
                    b.buffer != vk::Buffer::null(),
                    "copy with unbacked transient buffer '{}'",
                    record.name
                );
                (b.buffer, offset)
            }
        }
    };
    let (src_buf, src_off) = resolve(src, src_offset);
    let (dst_buf, dst_off) = resolve(dst, dst_offset);

    let region = vk::BufferCopy {
        src_offset: src_off,
        dst_offset: dst_off,
        size,
    };
    unsafe {
        dev.device
            .cmd_copy_buffer(ctx.cmd_buf, src_buf, dst_buf, &[region]);
    }
}

/// Full mip-0 copy between textures of matching dimensions.
pub fn copy_texture(
    dev: &mut Device,
    ctx: &mut CommandContext,
    src: TextureHandle,
    dst: TextureHandle,
) {
    close_rendering(ctx, &dev.device);
    transition_resource(dev, ctx, src.resource(), ResourceState::CopySrc);
    transition_resource(dev, ctx, dst.resource(), ResourceState::CopyDest);
    flush_barriers(dev, ctx);

    let (src_image, src_desc) = {
        let t = dev
            .resources
            .lookup(src.resource().raw())
            .expect("copy with stale texture handle")
            .texture();
        (t.image, t.desc)
    };
    let (dst_image, dst_desc) = {
        let t = dev
            .resources
            .lookup(dst.resource().raw())
            .expect("copy with stale texture handle")
            .texture();
        (t.image, t.desc)
    };
    assert_eq!(src_desc.width, dst_desc.width);
    assert_eq!(src_desc.height, dst_desc.height);

    let subresource = |desc: &crate::types::TextureDesc| vk::ImageSubresourceLayers {
        aspect_mask: image_aspect(desc.format),
        mip_level: 0,
        base_array_layer: 0,
        layer_count: desc.array_slices,
    };
    let region = vk::ImageCopy {
        src_subresource: subresource(&src_desc),
        src_offset: vk::Offset3D::default(),
        dst_subresource: subresource(&dst_desc),
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: src_desc.width,
            height: src_desc.height,
            depth: src_desc.depth,
        },
    };
    unsafe {
        dev.device.cmd_copy_image(
            ctx.cmd_buf,
            src_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

// ---------------------------------------------------------------------------
// Draws and dispatches
// ---------------------------------------------------------------------------

pub fn draw(
    dev: &mut Device,
    ctx: &mut CommandContext,
    vertex_count: u32,
    instance_count: u32,
    start_vertex: u32,
    start_instance: u32,
) {
    apply_graphics_state(dev, ctx);
    unsafe {
        dev.device.cmd_draw(
            ctx.cmd_buf,
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        );
    }
}

pub fn draw_indexed(dev: &mut Device, ctx: &mut CommandContext, args: &IndexedDrawArguments) {
    apply_graphics_state(dev, ctx);
    unsafe {
        dev.device.cmd_draw_indexed(
            ctx.cmd_buf,
            args.indices_per_instance,
            args.instance_count,
            args.index_start,
            args.base_vertex,
            args.start_instance,
        );
    }
}

pub fn dispatch(dev: &mut Device, ctx: &mut CommandContext, x: u32, y: u32, z: u32) {
    apply_compute_state(dev, ctx);
    unsafe {
        dev.device.cmd_dispatch(ctx.cmd_buf, x, y, z);
    }
}

// ---------------------------------------------------------------------------
// State replay
// ---------------------------------------------------------------------------

fn apply_graphics_state(dev: &mut Device, ctx: &mut CommandContext) {
    ctx.check_graphics();

    // Bound attachments transition before the rendering scope opens.
    if ctx.dirty.contains(DirtyFlags::RENDER_TARGETS) {
        let num = ctx.graphics.num_render_targets as usize;
        let targets: Vec<TextureHandle> = ctx.graphics.render_targets[..num].to_vec();
        let depth = ctx.graphics.depth_target;
        for target in targets {
            transition_resource(dev, ctx, target.resource(), ResourceState::RenderTarget);
        }
        if depth.is_valid() {
            transition_resource(dev, ctx, depth.resource(), ResourceState::DepthStencilTarget);
        }
    }

    flush_barriers(dev, ctx);

    if ctx.dirty.contains(DirtyFlags::RENDER_TARGETS) {
        close_rendering(ctx, &dev.device);
        begin_rendering(dev, ctx);
        ctx.dirty.remove(DirtyFlags::RENDER_TARGETS);
    }
    assert!(ctx.rendering_active, "draw without render targets bound");

    if ctx.dirty.contains(DirtyFlags::PIPELINE) {
        let pso = dev
            .psos
            .lookup(ctx.graphics.pso.raw())
            .expect("draw with stale or unset PSO handle");
        debug_assert!(matches!(pso.desc, Some(PsoDesc::Graphics(_))));
        unsafe {
            dev.device.cmd_bind_pipeline(
                ctx.cmd_buf,
                vk::PipelineBindPoint::GRAPHICS,
                pso.pipeline,
            );
        }
        ctx.dirty.remove(DirtyFlags::PIPELINE);
    }

    if !ctx.set_bound_graphics {
        bind_heap_set(dev, ctx, vk::PipelineBindPoint::GRAPHICS);
        ctx.set_bound_graphics = true;
    }

    if ctx.dirty.intersects(DirtyFlags::GFX_TABLES) {
        let mut bases = ctx.pushed_bases_graphics.unwrap_or_default();
        if ctx.dirty.contains(DirtyFlags::GFX_CBV_TABLE) || ctx.pushed_bases_graphics.is_none() {
            bases.cbv_base = build_table(dev, &ctx.graphics.tables.cbv, TableKind::Cbv);
        }
        if ctx.dirty.contains(DirtyFlags::GFX_SRV_TABLE) || ctx.pushed_bases_graphics.is_none() {
            bases.srv_base = build_table(dev, &ctx.graphics.tables.srv, TableKind::Srv);
        }
        if ctx.dirty.contains(DirtyFlags::GFX_UAV_TABLE) || ctx.pushed_bases_graphics.is_none() {
            bases.uav_base = build_table(dev, &ctx.graphics.tables.uav, TableKind::Uav);
        }
        if ctx.pushed_bases_graphics != Some(bases) {
            push_table_bases(dev, ctx, bases);
            ctx.pushed_bases_graphics = Some(bases);
        }
        ctx.dirty.remove(DirtyFlags::GFX_TABLES);
    }

    if ctx.dirty.contains(DirtyFlags::VERTEX_BUFFERS) {
        bind_vertex_buffers(dev, ctx);
        ctx.dirty.remove(DirtyFlags::VERTEX_BUFFERS);
    }

    if ctx.dirty.contains(DirtyFlags::INDEX_BUFFER) && ctx.graphics.index_buffer.is_valid() {
        let (buffer, offset, index_type) = resolve_index_buffer(dev, ctx.graphics.index_buffer);
        unsafe {
            dev.device
                .cmd_bind_index_buffer(ctx.cmd_buf, buffer, offset, index_type);
        }
        ctx.dirty.remove(DirtyFlags::INDEX_BUFFER);
    }

    if ctx.dirty.contains(DirtyFlags::VIEWPORT) {
        unsafe {
            dev.device
                .cmd_set_viewport(ctx.cmd_buf, 0, &[ctx.graphics.viewport]);
        }
        ctx.dirty.remove(DirtyFlags::VIEWPORT);
    }
    if ctx.dirty.contains(DirtyFlags::SCISSOR) {
        unsafe {
            dev.device
                .cmd_set_scissor(ctx.cmd_buf, 0, &[ctx.graphics.scissor]);
        }
        ctx.dirty.remove(DirtyFlags::SCISSOR);
    }
}

fn apply_compute_state(dev: &mut Device, ctx: &mut CommandContext) {
    ctx.check_compute();
    // Dispatches are illegal inside a rendering scope.
    close_rendering(ctx, &dev.device);
    flush_barriers(dev, ctx);

    if ctx.dirty.contains(DirtyFlags::COMPUTE_PIPELINE) {
        let pso = dev
            .psos
            .lookup(ctx.compute.pso.raw())
            .expect("dispatch with stale or unset PSO handle");
        debug_assert!(matches!(pso.desc, Some(PsoDesc::Compute(_))));
        unsafe {
            dev.device.cmd_bind_pipeline(
                ctx.cmd_buf,
                vk::PipelineBindPoint::COMPUTE,
                pso.pipeline,
            );
        }
        ctx.dirty.remove(DirtyFlags::COMPUTE_PIPELINE);
    }

    if !ctx.set_bound_compute {
        bind_heap_set(dev, ctx, vk::PipelineBindPoint::COMPUTE);
        ctx.set_bound_compute = true;
    }

    if ctx.dirty.intersects(DirtyFlags::CMP_TABLES) {
        let mut bases = ctx.pushed_bases_compute.unwrap_or_default();
        if ctx.dirty.contains(DirtyFlags::CMP_CBV_TABLE) || ctx.pushed_bases_compute.is_none() {
            bases.cbv_base = build_table(dev, &ctx.compute.tables.cbv, TableKind::Cbv);
        }
        if ctx.dirty.contains(DirtyFlags::CMP_SRV_TABLE) || ctx.pushed_bases_compute.is_none() {
            bases.srv_base = build_table(dev, &ctx.compute.tables.srv, TableKind::Srv);
        }
        if ctx.dirty.contains(DirtyFlags::CMP_UAV_TABLE) || ctx.pushed_bases_compute.is_none() {
            bases.uav_base = build_table(dev, &ctx.compute.tables.uav, TableKind::Uav);
        }
        if ctx.pushed_bases_compute != Some(bases) {
            push_table_bases(dev, ctx, bases);
            ctx.pushed_bases_compute = Some(bases);
        }
        ctx.dirty.remove(DirtyFlags::CMP_TABLES);
    }
}

fn bind_heap_set(dev: &Device, ctx: &CommandContext, bind_point: vk::PipelineBindPoint) {
    unsafe {
        dev.device.cmd_bind_descriptor_sets(
            ctx.cmd_buf,
            bind_point,
            dev.pipeline_layout,
            0,
            &[dev.heap.set],
            &[],
        );
    }
}

fn push_table_bases(dev: &Device, ctx: &CommandContext, bases: TableBases) {
    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&bases.cbv_base.to_ne_bytes());
    bytes[4..8].copy_from_slice(&bases.srv_base.to_ne_bytes());
    bytes[8..12].copy_from_slice(&bases.uav_base.to_ne_bytes());
    unsafe {
        dev.device.cmd_push_constants(
            ctx.cmd_buf,
            dev.pipeline_layout,
            vk::ShaderStageFlags::ALL,
            0,
            &bytes,
        );
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TableKind {
    Cbv,
    Srv,
    Uav,
}

/// Builds one per-draw table in the heap ring: a contiguous slot range filled
/// by descriptor copies. Returns the range base for the push constants.
fn build_table(dev: &mut Device, entries: &[TableEntry], kind: TableKind) -> u32 {
    let count = entries.len() as u32;
    let base = dev.heap.alloc_table(count);
    let null_slot = dev.heap.null_slot();

    let mut copies: Vec<SlotCopy> = Vec::with_capacity(entries.len() * 2);
    for (i, entry) in entries.iter().enumerate() {
        let dst_slot = base + i as u32;
        match entry {
            TableEntry::Null => push_null_copies(&mut copies, kind, null_slot, dst_slot),
            TableEntry::Slot(slot) => {
                let binding = match kind {
                    TableKind::Cbv => BINDING_UNIFORM_BUFFER,
                    TableKind::Srv | TableKind::Uav => BINDING_STORAGE_BUFFER,
                };
                copies.push(SlotCopy {
                    binding,
                    src_slot: *slot,
                    dst_slot,
                });
            }
            TableEntry::Resource(handle) => {
                let (binding, src_slot) = resolve_table_resource(dev, kind, *handle);
                copies.push(SlotCopy {
                    binding,
                    src_slot,
                    dst_slot,
                });
            }
        }
    }
    dev.heap.copy_slots(&dev.device, &copies);
    base
}

/// Null views exist in every binding array; an unset entry fills whichever
/// bindings its table kind can be read through.
fn push_null_copies(copies: &mut Vec<SlotCopy>, kind: TableKind, null_slot: u32, dst_slot: u32) {
    for &binding in kind_bindings(kind) {
        copies.push(SlotCopy {
            binding,
            src_slot: null_slot,
            dst_slot,
        });
    }
}

fn kind_bindings(kind: TableKind) -> &'static [u32] {
    match kind {
        TableKind::Cbv => &[BINDING_UNIFORM_BUFFER],
        TableKind::Srv => &[BINDING_STORAGE_BUFFER, BINDING_SAMPLED_IMAGE],
        TableKind::Uav => &[BINDING_STORAGE_BUFFER, BINDING_STORAGE_IMAGE],
    }
}

fn resolve_table_resource(
    dev: &Device,
    kind: TableKind,
    handle: ResourceHandle,
) -> (u32, u32) {
    let record = dev
        .resources
        .lookup(handle.raw())
        .expect("stale resource handle in descriptor table");

    let (binding, slot) = match (&record.kind, kind) {
        (ResourceKind::Buffer(b), TableKind::Cbv) => {
            check_frame_backing(record.name.as_str(), b, dev.frame_counter);
            (BINDING_UNIFORM_BUFFER, b.cbv_slot)
        }
        (ResourceKind::Buffer(b), TableKind::Srv) => {
            check_frame_backing(record.name.as_str(), b, dev.frame_counter);
            (BINDING_STORAGE_BUFFER, b.srv_slot)
        }
        (ResourceKind::Buffer(b), TableKind::Uav) => {
            check_frame_backing(record.name.as_str(), b, dev.frame_counter);
            (BINDING_STORAGE_BUFFER, b.uav_slot)
        }
        (ResourceKind::Texture(t), TableKind::Srv) => (BINDING_SAMPLED_IMAGE, t.srv_slot),
        (ResourceKind::Texture(t), TableKind::Uav) => (
            BINDING_STORAGE_IMAGE,
            t.uav_slots.first().copied().unwrap_or(INVALID_SLOT),
        ),
        (ResourceKind::Texture(_), TableKind::Cbv) => {
            panic!("texture '{}' bound in a CBV table", record.name)
        }
        (ResourceKind::Empty, _) => panic!("empty resource record bound in a table"),
    };
    assert!(
        slot != INVALID_SLOT,
        "resource '{}' has no view for this table kind",
        record.name
    );
    (binding, slot)
}

/// Frame-local backing is only valid for the frame it was written in; the
/// pages behind it recycle as soon as the slot's fence is waited on.
fn check_frame_backing(name: &str, b: &crate::resource::BufferData, frame: u64) {
    if b.desc.flags.contains(BufferFlags::TRANSIENT) || b.frame_backing.is_some() {
        assert!(
            b.last_update_frame == frame,
            "buffer '{name}' bound without an update this frame"
        );
    }
}

fn resolve_index_buffer(
    dev: &Device,
    handle: BufferHandle,
) -> (vk::Buffer, u64, vk::IndexType) {
    let record = dev
        .resources
        .lookup(handle.resource().raw())
        .expect("stale index buffer handle");
    let b = record.buffer();
    check_frame_backing(record.name.as_str(), b, dev.frame_counter);
    let index_type = index_type_for(b.desc.format);
    match &b.frame_backing {
        Some(scratch) => (scratch.buffer, scratch.offset, index_type),
        None => {
            assert!(
                b.buffer != vk::Buffer::null(),
                "index buffer '{}' has no backing",
                record.name
            );
            (b.buffer, 0, index_type)
        }
    }
}

fn index_type_for(format: Format) -> vk::IndexType {
    match format {
        Format::R16Uint => vk::IndexType::UINT16,
        Format::R32Uint => vk::IndexType::UINT32,
        other => panic!("format {other:?} is not an index buffer format"),
    }
}

fn bind_vertex_buffers(dev: &Device, ctx: &CommandContext) {
    for (stream, handle) in ctx.graphics.vertex_buffers.iter().enumerate() {
        if !handle.is_valid() {
            continue;
        }
        let record = dev
            .resources
            .lookup(handle.resource().raw())
            .expect("stale vertex buffer handle");
        let b = record.buffer();
        check_frame_backing(record.name.as_str(), b, dev.frame_counter);
        let (buffer, offset) = match &b.frame_backing {
            Some(scratch) => (scratch.buffer, scratch.offset),
            None => {
                assert!(
                    b.buffer != vk::Buffer::null(),
                    "vertex buffer '{}' has no backing",
                    record.name
                );
                (b.buffer, 0)
            }
        };
        unsafe {
            dev.device
                .cmd_bind_vertex_buffers(ctx.cmd_buf, stream as u32, &[buffer], &[offset]);
        }
    }
}

fn begin_rendering(dev: &mut Device, ctx: &mut CommandContext) {
    let num = ctx.graphics.num_render_targets as usize;
    let mut color_attachments: Vec<vk::RenderingAttachmentInfo> = Vec::with_capacity(num);
    let mut render_area = vk::Extent2D::default();

    for &target in &ctx.graphics.render_targets[..num] {
        let t = dev
            .resources
            .lookup(target.resource().raw())
            .expect("stale render target handle")
            .texture();
        render_area = vk::Extent2D {
            width: t.desc.width,
            height: t.desc.height,
        };
        color_attachments.push(
            vk::RenderingAttachmentInfo::builder()
                .image_view(t.full_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .build(),
        );
    }

    let depth_attachment = if ctx.graphics.depth_target.is_valid() {
        let t = dev
            .resources
            .lookup(ctx.graphics.depth_target.resource().raw())
            .expect("stale depth target handle")
            .texture();
        render_area = vk::Extent2D {
            width: t.desc.width,
            height: t.desc.height,
        };
        Some(
            vk::RenderingAttachmentInfo::builder()
                .image_view(t.full_view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .build(),
        )
    } else {
        None
    };

    assert!(
        render_area.width > 0 && render_area.height > 0,
        "rendering scope with no attachments"
    );

    let mut info = vk::RenderingInfo::builder()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: render_area,
        })
        .layer_count(1)
        .color_attachments(&color_attachments);
    if let Some(depth) = &depth_attachment {
        info = info.depth_attachment(depth);
    }

    unsafe {
        dev.device.cmd_begin_rendering(ctx.cmd_buf, &info);
    }
    ctx.rendering_active = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::RawHandle;
    use crate::queue::{CommandAllocator, QueueType};
    use crate::resource::BufferData;
    use crate::types::BufferDesc;

    fn buffer_data(flags: BufferFlags, last_update_frame: u64) -> BufferData {
        BufferData {
            desc: BufferDesc {
                flags,
                format: Format::Unknown,
                size_in_bytes: 64,
                stride_in_bytes: 16,
            },
            buffer: vk::Buffer::null(),
            allocation: None,
            cbv_slot: INVALID_SLOT,
            srv_slot: INVALID_SLOT,
            uav_slot: INVALID_SLOT,
            frame_backing: None,
            last_update_frame,
        }
    }

    fn test_context(queue_type: QueueType) -> CommandContext {
        CommandContext::new(
            queue_type,
            CommandAllocator {
                pool: vk::CommandPool::null(),
                cmd_buf: vk::CommandBuffer::null(),
            },
        )
    }

    #[test]
    fn index_type_mapping() {
        assert_eq!(index_type_for(Format::R16Uint), vk::IndexType::UINT16);
        assert_eq!(index_type_for(Format::R32Uint), vk::IndexType::UINT32);
    }

    #[test]
    #[should_panic(expected = "not an index buffer format")]
    fn non_index_format_panics() {
        index_type_for(Format::R32Float);
    }

    #[test]
    fn null_entries_fill_every_readable_binding() {
        assert_eq!(kind_bindings(TableKind::Cbv), &[BINDING_UNIFORM_BUFFER]);
        assert_eq!(
            kind_bindings(TableKind::Srv),
            &[BINDING_STORAGE_BUFFER, BINDING_SAMPLED_IMAGE]
        );
        assert_eq!(
            kind_bindings(TableKind::Uav),
            &[BINDING_STORAGE_BUFFER, BINDING_STORAGE_IMAGE]
        );
    }

    #[test]
    fn table_bases_pack_as_three_words() {
        let bases = TableBases {
            cbv_base: 1,
            srv_base: 2,
            uav_base: 3,
        };
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&bases.cbv_base.to_ne_bytes());
        bytes[4..8].copy_from_slice(&bases.srv_base.to_ne_bytes());
        bytes[8..12].copy_from_slice(&bases.uav_base.to_ne_bytes());
        assert_eq!(u32::from_ne_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(std::mem::size_of::<TableBases>(), 12);
    }

    #[test]
    fn null_copy_expansion_targets_each_binding() {
        let mut copies = Vec::new();
        push_null_copies(&mut copies, TableKind::Srv, 3, 42);
        let bindings: Vec<u32> = copies.iter().map(|c| c.binding).collect();
        assert_eq!(bindings, vec![BINDING_STORAGE_BUFFER, BINDING_SAMPLED_IMAGE]);
        for copy in &copies {
            assert_eq!(copy.src_slot, 3);
            assert_eq!(copy.dst_slot, 42);
        }

        copies.clear();
        push_null_copies(&mut copies, TableKind::Cbv, 0, 7);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].binding, BINDING_UNIFORM_BUFFER);
    }

    #[test]
    #[should_panic(expected = "bound without an update this frame")]
    fn stale_transient_backing_is_fatal() {
        // Written in frame 3, bound in frame 4: the pages behind the backing
        // may already belong to another frame slot.
        let b = buffer_data(BufferFlags::TRANSIENT | BufferFlags::VERTEX, 3);
        check_frame_backing("verts", &b, 4);
    }

    #[test]
    fn dynamic_buffers_persist_across_frames() {
        // Dynamic contents live in the buffer's own allocation; binding
        // frames after the last update is fine.
        let b = buffer_data(BufferFlags::DYNAMIC | BufferFlags::CONSTANT, 3);
        check_frame_backing("constants", &b, 10);
    }

    #[test]
    fn unchanged_vertex_stream_binds_once() {
        let mut ctx = test_context(QueueType::Graphics);
        ctx.dirty = DirtyFlags::empty();

        let vb = BufferHandle(ResourceHandle(RawHandle {
            index: 1,
            generation: 0,
        }));
        set_vertex_buffer(&mut ctx, 0, vb);
        assert!(ctx.dirty.contains(DirtyFlags::VERTEX_BUFFERS));

        // The first draw replays the bind and clears the flag.
        ctx.dirty.remove(DirtyFlags::VERTEX_BUFFERS);

        // Re-setting the same buffer on the same stream stays clean, so
        // later draws emit no second bind.
        set_vertex_buffer(&mut ctx, 0, vb);
        assert!(!ctx.dirty.contains(DirtyFlags::VERTEX_BUFFERS));

        let other = BufferHandle(ResourceHandle(RawHandle {
            index: 2,
            generation: 0,
        }));
        set_vertex_buffer(&mut ctx, 0, other);
        assert!(ctx.dirty.contains(DirtyFlags::VERTEX_BUFFERS));
    }
}
