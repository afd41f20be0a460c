// GPU device - the owning hub
//
// Owns the vk instance/device, the three queues, the bindless descriptor
// heap, the upload page pool, the swapchain and the object registries. Frames
// are N-buffered: begin_frame blocks on the fence of the frame slot being
// recycled, then recycles that slot's upload pages, linear descriptors and
// deferred deletions before handing out the frame's command context.
//
// There is no global device. Callers own the Device value and thread
// `&mut Device` through the recording API, which also makes single-threaded
// recording a compile-time property.

use anyhow::{bail, Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use log::{info, warn};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use rustc_hash::FxHashMap;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};

use crate::cmd;
use crate::config::GpuConfig;
use crate::context::CommandContext;
use crate::descriptor::{partition_heap, DescriptorHeap};
use crate::handle::{
    BufferHandle, HandlePool, PsoHandle, RawHandle, ResourceHandle, ShaderHandle, TextureHandle,
};
use crate::pipeline::{self, Pso, PsoDesc};
use crate::queue::{CommandQueue, FenceValue, QueueManager, QueueType, SubmitDesc};
use crate::resource::{
    self, BufferData, Resource, ResourceKind, TextureData, INVALID_SLOT,
};
use crate::shader::{self, Shader};
use crate::swapchain::{Swapchain, SwapchainStatus};
use crate::types::{
    BufferDesc, BufferFlags, ComputePsoDesc, Format, GraphicsPsoDesc, ResourceState, ShaderType,
    TextureDesc, TextureUsageFlags,
};
use crate::upload::{FrameUploadAllocator, ScratchAlloc, UploadPagePool};

/// Size of the null-descriptor region at the base of the heap. Unset table
/// entries resolve into this range.
const NULL_DESCRIPTORS: u32 = 16;

struct FrameData {
    /// Graphics fence value of this slot's last submission.
    frame_fence: FenceValue,
    upload: FrameUploadAllocator,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

enum DeferredObject {
    Resource(ResourceKind),
    Pipeline(vk::Pipeline),
    ShaderModule(vk::ShaderModule),
}

/// A release whose native objects wait for every queue to pass the fence
/// values current at release time.
struct DeferredDelete {
    object: DeferredObject,
    fences: [FenceValue; 3],
    heap_slots: Vec<u32>,
}

pub struct Device {
    pub config: GpuConfig,

    _entry: Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    pub limits: vk::PhysicalDeviceLimits,

    allocator: Option<Allocator>,
    pub queues: QueueManager,
    pub heap: DescriptorHeap,
    pub pipeline_layout: vk::PipelineLayout,
    pub swapchain: Swapchain,

    pub resources: HandlePool<Resource>,
    pub shaders: HandlePool<Shader>,
    pub psos: HandlePool<Pso>,
    pso_cache: FxHashMap<u64, Vec<PsoHandle>>,

    null_buffer: vk::Buffer,
    null_buffer_allocation: Option<Allocation>,
    null_image: vk::Image,
    null_image_allocation: Option<Allocation>,
    null_image_view: vk::ImageView,

    upload_pool: UploadPagePool,
    frames: Vec<FrameData>,
    deferred: Vec<DeferredDelete>,

    /// Monotonic CPU frame index, starts at 0 before the first begin_frame.
    pub frame_counter: u64,
    pub frame_slot: usize,
    backbuffers: Vec<TextureHandle>,
    depth_target: TextureHandle,
    backbuffer_index: u32,
    needs_resize: bool,
    window_extent: (u32, u32),
}

impl Device {
    pub fn new(
        config: GpuConfig,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        info!("Creating GPU device");

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = create_instance(&entry, display_handle, config.debug.validation_layers)?;

        let debug_utils = if config.debug.validation_layers {
            Some(setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
                .context("Failed to create window surface")?
        };

        let (physical_device, families) =
            pick_physical_device(&instance, &surface_loader, surface)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let device = create_logical_device(&instance, physical_device, &families)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let compute_queue = unsafe { device.get_device_queue(families.compute, 0) };
        let copy_queue = unsafe { device.get_device_queue(families.copy, 0) };
        let queues = QueueManager {
            graphics: CommandQueue::new(&device, graphics_queue, families.graphics, QueueType::Graphics)?,
            compute: CommandQueue::new(&device, compute_queue, families.compute, QueueType::Compute)?,
            copy: CommandQueue::new(&device, copy_queue, families.copy, QueueType::Copy)?,
        };

        let partition = partition_heap(
            config.heap.descriptor_capacity,
            NULL_DESCRIPTORS,
            config.heap.linear_descriptors_per_frame,
            config.heap.ring_descriptors,
        );
        let heap = DescriptorHeap::new(&device, partition)?;
        let pipeline_layout = create_pipeline_layout(&device, heap.set_layout)?;

        let swapchain = Swapchain::new(
            &instance,
            &device,
            physical_device,
            surface,
            &surface_loader,
            width,
            height,
            config.present_mode(),
            None,
        )?;

        let buffered_frames = config.buffered_frames();
        let mut frames = Vec::with_capacity(buffered_frames);
        for _ in 0..buffered_frames {
            frames.push(FrameData {
                frame_fence: FenceValue::NULL,
                upload: FrameUploadAllocator::default(),
                image_available: create_binary_semaphore(&device)?,
                render_finished: create_binary_semaphore(&device)?,
            });
        }

        let mut out = Self {
            resources: HandlePool::new(config.heap.max_resources),
            shaders: HandlePool::new(config.heap.max_shaders),
            psos: HandlePool::new(config.heap.max_psos),
            pso_cache: FxHashMap::default(),
            upload_pool: UploadPagePool::new(config.heap.upload_page_size),
            config,
            _entry: entry,
            instance,
            physical_device,
            device,
            debug_utils,
            surface_loader,
            surface,
            limits: properties.limits,
            allocator: Some(allocator),
            queues,
            heap,
            pipeline_layout,
            swapchain,
            null_buffer: vk::Buffer::null(),
            null_buffer_allocation: None,
            null_image: vk::Image::null(),
            null_image_allocation: None,
            null_image_view: vk::ImageView::null(),
            frames,
            deferred: Vec::new(),
            frame_counter: 0,
            frame_slot: 0,
            backbuffers: Vec::new(),
            depth_target: TextureHandle::INVALID,
            backbuffer_index: 0,
            needs_resize: false,
            window_extent: (width, height),
        };

        out.create_null_descriptors()?;
        out.register_backbuffers()?;
        out.create_depth_target()?;
        info!("GPU device ready ({buffered_frames} buffered frames)");
        Ok(out)
    }

    fn create_depth_target(&mut self) -> Result<TextureHandle> {
        let extent = self.swapchain.extent;
        let desc = TextureDesc::tex_2d(
            extent.width,
            extent.height,
            TextureUsageFlags::DEPTH_STENCIL,
            Format::D32Float,
        );
        self.depth_target = self.create_texture(desc, "backbuffer depth")?;
        Ok(self.depth_target)
    }

    pub fn allocator_mut(&mut self) -> &mut Allocator {
        self.allocator.as_mut().expect("allocator torn down")
    }

    // -------------------------------------------------------------------
    // Resources
    // -------------------------------------------------------------------

    /// Creates a buffer. Transient buffers get no committed memory; their
    /// backing comes from the frame upload allocator on each update.
    /// `initial_data` stages a blocking copy and is rejected for transient
    /// buffers.
    pub fn create_buffer(
        &mut self,
        desc: BufferDesc,
        initial_data: Option<&[u8]>,
        name: &str,
    ) -> Result<BufferHandle> {
        assert!(desc.size_in_bytes > 0, "zero-sized buffer '{name}'");
        let transient = desc.flags.contains(BufferFlags::TRANSIENT);
        assert!(
            !(transient && initial_data.is_some()),
            "transient buffer '{name}' cannot take initial data"
        );

        let (buffer, allocation) = if transient {
            (vk::Buffer::null(), None)
        } else {
            let allocator = self.allocator.as_mut().expect("allocator torn down");
            let (buffer, allocation) =
                resource::create_committed_buffer(&self.device, allocator, &desc, name)?;
            (buffer, Some(allocation))
        };

        // Persistent views only exist for committed buffers; transient views
        // are written per update into the frame's linear region.
        let mut cbv_slot = INVALID_SLOT;
        let mut srv_slot = INVALID_SLOT;
        let mut uav_slot = INVALID_SLOT;
        if !transient {
            let size = desc.size_in_bytes as u64;
            if desc.flags.contains(BufferFlags::CONSTANT) {
                cbv_slot = self.heap.alloc_persistent();
                self.heap
                    .write_uniform_buffer(&self.device, cbv_slot, buffer, 0, size);
            }
            if desc.flags.contains(BufferFlags::SHADER_RESOURCE) {
                srv_slot = self.heap.alloc_persistent();
                self.heap
                    .write_storage_buffer(&self.device, srv_slot, buffer, 0, size);
            }
            if desc.flags.contains(BufferFlags::UNORDERED_ACCESS) {
                uav_slot = self.heap.alloc_persistent();
                self.heap
                    .write_storage_buffer(&self.device, uav_slot, buffer, 0, size);
            }
        }

        let (raw, record) = self.resources.alloc();
        *record = Resource {
            name: name.to_string(),
            refcount: 1,
            state: ResourceState::Unknown,
            kind: ResourceKind::Buffer(BufferData {
                desc,
                buffer,
                allocation,
                cbv_slot,
                srv_slot,
                uav_slot,
                frame_backing: None,
                last_update_frame: u64::MAX,
            }),
        };
        let handle = BufferHandle(ResourceHandle(raw));

        if let Some(data) = initial_data {
            self.upload_buffer_blocking(handle, data)
                .with_context(|| format!("Initial upload for buffer '{name}' failed"))?;
        }
        Ok(handle)
    }

    pub fn create_texture(&mut self, desc: TextureDesc, name: &str) -> Result<TextureHandle> {
        let allocator = self.allocator.as_mut().expect("allocator torn down");
        let (image, allocation) =
            resource::create_committed_image(&self.device, allocator, &desc, name)?;
        let full_view = resource::create_full_view(&self.device, image, &desc, name)?;

        let mut srv_slot = INVALID_SLOT;
        if desc.usage.contains(TextureUsageFlags::SHADER_RESOURCE) {
            srv_slot = self.heap.alloc_persistent();
            self.heap
                .write_sampled_image(&self.device, srv_slot, full_view);
        }

        let mut mip_views = Vec::new();
        let mut uav_slots = Vec::new();
        if desc.usage.contains(TextureUsageFlags::UNORDERED_ACCESS) {
            for mip in 0..desc.mip_levels {
                let view = resource::create_mip_view(&self.device, image, &desc, mip, name)?;
                let slot = self.heap.alloc_persistent();
                self.heap.write_storage_image(&self.device, slot, view);
                mip_views.push(view);
                uav_slots.push(slot);
            }
        }

        let (raw, record) = self.resources.alloc();
        *record = Resource {
            name: name.to_string(),
            refcount: 1,
            state: ResourceState::Unknown,
            kind: ResourceKind::Texture(TextureData {
                desc,
                image,
                allocation: Some(allocation),
                owns_image: true,
                full_view,
                mip_views,
                srv_slot,
                uav_slots,
            }),
        };
        Ok(TextureHandle(ResourceHandle(raw)))
    }

    pub fn add_ref(&mut self, handle: ResourceHandle) {
        let record = self
            .resources
            .lookup_mut(handle.raw())
            .expect("add_ref on stale resource handle");
        record.refcount += 1;
    }

    /// Drops one reference. At zero the handle dies immediately; the heap
    /// slots and native objects wait until every queue has passed its fence
    /// value from this moment, since in-flight tables may still copy from
    /// the slots.
    pub fn release(&mut self, handle: ResourceHandle) {
        let record = self
            .resources
            .lookup_mut(handle.raw())
            .expect("release on stale resource handle");
        assert!(record.refcount > 0);
        record.refcount -= 1;
        if record.refcount > 0 {
            return;
        }

        let kind = std::mem::take(&mut record.kind);
        let heap_slots = collect_heap_slots(&kind);
        self.resources.free(handle.raw());
        let fences = self.current_queue_fences();
        self.deferred.push(DeferredDelete {
            object: DeferredObject::Resource(kind),
            fences,
            heap_slots,
        });
    }

    fn current_queue_fences(&self) -> [FenceValue; 3] {
        [
            self.queues.graphics.last_submitted_fence(),
            self.queues.compute.last_submitted_fence(),
            self.queues.copy.last_submitted_fence(),
        ]
    }

    fn flush_completed_deletions(&mut self) -> Result<()> {
        let mut idx = 0;
        while idx < self.deferred.len() {
            let mut done = true;
            for fence in self.deferred[idx].fences {
                if !self.queues.has_fence_completed(&self.device, fence)? {
                    done = false;
                    break;
                }
            }
            if !done {
                idx += 1;
                continue;
            }
            let entry = self.deferred.swap_remove(idx);
            for slot in entry.heap_slots {
                self.heap.free_persistent(slot);
            }
            let allocator = self.allocator.as_mut().expect("allocator torn down");
            unsafe {
                match entry.object {
                    DeferredObject::Resource(kind) => {
                        resource::destroy_kind(&self.device, allocator, kind)
                    }
                    DeferredObject::Pipeline(pipeline) => {
                        self.device.destroy_pipeline(pipeline, None)
                    }
                    DeferredObject::ShaderModule(module) => {
                        self.device.destroy_shader_module(module, None)
                    }
                }
            }
        }
        Ok(())
    }

    /// Blocking staged upload through the copy queue. Load-path only.
    fn upload_buffer_blocking(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let scratch = self.upload_alloc(data.len() as u64, 4)?;
        scratch.copy_from(data);

        let (dst_buffer, size) = {
            let record = self
                .resources
                .lookup(handle.resource().raw())
                .context("upload to stale buffer handle")?;
            let buf = record.buffer();
            (buf.buffer, buf.desc.size_in_bytes as u64)
        };
        assert!(data.len() as u64 <= size);

        let alloc = self.queues.copy.acquire_allocator(&self.device)?;
        let cmd_buf = alloc.cmd_buf;
        unsafe {
            self.device.begin_command_buffer(
                cmd_buf,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            let region = vk::BufferCopy {
                src_offset: scratch.offset,
                dst_offset: 0,
                size: data.len() as u64,
            };
            self.device
                .cmd_copy_buffer(cmd_buf, scratch.buffer, dst_buffer, &[region]);
            self.device.end_command_buffer(cmd_buf)?;
        }
        let fence = self
            .queues
            .copy
            .submit(&self.device, cmd_buf, &SubmitDesc::default())?;
        self.queues.copy.release_allocator(alloc, fence);
        self.queues.copy.wait_fence_blocking(&self.device, fence)?;

        if let Some(record) = self.resources.lookup_mut(handle.resource().raw()) {
            record.state = ResourceState::Common;
        }
        Ok(())
    }

    /// Bump allocation out of the current frame's upload memory.
    pub fn upload_alloc(&mut self, size: u64, align: u64) -> Result<ScratchAlloc> {
        let allocator = self.allocator.as_mut().expect("allocator torn down");
        self.frames[self.frame_slot].upload.alloc(
            &self.device,
            allocator,
            &mut self.upload_pool,
            size,
            align,
        )
    }

    // -------------------------------------------------------------------
    // Shaders and PSOs
    // -------------------------------------------------------------------

    pub fn create_shader(
        &mut self,
        shader_type: ShaderType,
        bytecode: &[u8],
        name: &str,
    ) -> Result<ShaderHandle> {
        let module = shader::create_shader_module(&self.device, bytecode, name)?;
        let (raw, record) = self.shaders.alloc();
        *record = Shader {
            name: name.to_string(),
            shader_type: Some(shader_type),
            bytecode: bytecode.to_vec(),
            module,
            refcount: 1,
            linked_psos: Vec::new(),
        };
        Ok(ShaderHandle(raw))
    }

    pub fn add_ref_shader(&mut self, handle: ShaderHandle) {
        let record = self
            .shaders
            .lookup_mut(handle.raw())
            .expect("add_ref on stale shader handle");
        record.refcount += 1;
    }

    /// Drops one shader reference. Every PSO holds its own, so a shader
    /// outlives the caller's handle while pipelines built from it exist.
    pub fn release_shader(&mut self, handle: ShaderHandle) {
        let record = self
            .shaders
            .lookup_mut(handle.raw())
            .expect("release of stale shader handle");
        assert!(record.refcount > 0);
        record.refcount -= 1;
        if record.refcount > 0 {
            return;
        }

        let module = record.module;
        self.shaders.free(handle.raw());
        let fences = self.current_queue_fences();
        self.deferred.push(DeferredDelete {
            object: DeferredObject::ShaderModule(module),
            fences,
            heap_slots: Vec::new(),
        });
    }

    /// Swaps a shader's bytecode and rebuilds every PSO linked against it.
    /// Old modules and pipelines are deferred until the GPU is done.
    pub fn reload_shader(&mut self, handle: ShaderHandle, bytecode: &[u8]) -> Result<()> {
        let name = self
            .shaders
            .lookup(handle.raw())
            .context("reload of stale shader handle")?
            .name
            .clone();
        let new_module = shader::create_shader_module(&self.device, bytecode, &name)?;

        let fences = self.current_queue_fences();
        let shader_record = self
            .shaders
            .lookup_mut(handle.raw())
            .context("reload of stale shader handle")?;
        let old_module = shader_record.module;
        shader_record.module = new_module;
        shader_record.bytecode = bytecode.to_vec();
        let linked = shader_record.linked_psos.clone();
        self.deferred.push(DeferredDelete {
            object: DeferredObject::ShaderModule(old_module),
            fences,
            heap_slots: Vec::new(),
        });

        info!("Reloading shader '{}' ({} linked PSOs)", name, linked.len());
        for pso_handle in linked {
            self.rebuild_pso(pso_handle)
                .with_context(|| format!("Rebuilding PSO after reload of '{name}'"))?;
        }
        Ok(())
    }

    fn rebuild_pso(&mut self, handle: PsoHandle) -> Result<()> {
        let (desc, name) = {
            let pso = self
                .psos
                .lookup(handle.raw())
                .context("rebuild of stale PSO handle")?;
            (pso.desc.clone().context("PSO record without desc")?, pso.name.clone())
        };
        let pipeline = self.build_pipeline(&desc, &name)?;

        let fences = self.current_queue_fences();
        let pso = self
            .psos
            .lookup_mut(handle.raw())
            .context("rebuild of stale PSO handle")?;
        let old = pso.pipeline;
        pso.pipeline = pipeline;
        self.deferred.push(DeferredDelete {
            object: DeferredObject::Pipeline(old),
            fences,
            heap_slots: Vec::new(),
        });
        Ok(())
    }

    fn build_pipeline(&self, desc: &PsoDesc, name: &str) -> Result<vk::Pipeline> {
        match desc {
            PsoDesc::Graphics(desc) => {
                let vs = self
                    .shaders
                    .lookup(desc.vs.raw())
                    .context("graphics PSO references stale vertex shader")?;
                assert_eq!(vs.shader_type, Some(ShaderType::Vertex));
                let ps_module = if desc.ps.is_valid() {
                    let ps = self
                        .shaders
                        .lookup(desc.ps.raw())
                        .context("graphics PSO references stale pixel shader")?;
                    assert_eq!(ps.shader_type, Some(ShaderType::Pixel));
                    ps.module
                } else {
                    vk::ShaderModule::null()
                };
                pipeline::create_graphics_pipeline(
                    &self.device,
                    self.pipeline_layout,
                    desc,
                    vs.module,
                    ps_module,
                    name,
                )
            }
            PsoDesc::Compute(desc) => {
                let cs = self
                    .shaders
                    .lookup(desc.cs.raw())
                    .context("compute PSO references stale compute shader")?;
                assert_eq!(cs.shader_type, Some(ShaderType::Compute));
                pipeline::create_compute_pipeline(
                    &self.device,
                    self.pipeline_layout,
                    cs.module,
                    name,
                )
            }
        }
    }

    /// Returns a cached PSO when an identical desc exists, adding a
    /// reference; otherwise builds a new pipeline. Hash collisions fall back
    /// to a full desc comparison, so they can never alias distinct PSOs.
    pub fn create_graphics_pso(
        &mut self,
        desc: &GraphicsPsoDesc,
        name: &str,
    ) -> Result<PsoHandle> {
        let key = hash_desc(desc);
        if let Some(candidates) = self.pso_cache.get(&key) {
            for &candidate in candidates {
                let pso = self
                    .psos
                    .lookup(candidate.raw())
                    .expect("PSO cache holds stale handle");
                if let Some(PsoDesc::Graphics(cached)) = &pso.desc {
                    if **cached == *desc {
                        self.psos.lookup_mut(candidate.raw()).expect("checked").refcount += 1;
                        return Ok(candidate);
                    }
                }
            }
        }

        let pso_desc = PsoDesc::Graphics(Box::new(desc.clone()));
        let pipeline = self.build_pipeline(&pso_desc, name)?;
        let (raw, record) = self.psos.alloc();
        *record = Pso {
            name: name.to_string(),
            desc: Some(pso_desc),
            pipeline,
            refcount: 1,
        };
        let handle = PsoHandle(raw);

        self.pso_cache.entry(key).or_default().push(handle);
        self.link_shader(desc.vs, handle);
        if desc.ps.is_valid() {
            self.link_shader(desc.ps, handle);
        }
        Ok(handle)
    }

    pub fn create_compute_pso(&mut self, desc: &ComputePsoDesc, name: &str) -> Result<PsoHandle> {
        let key = hash_desc(desc);
        if let Some(candidates) = self.pso_cache.get(&key) {
            for &candidate in candidates {
                let pso = self
                    .psos
                    .lookup(candidate.raw())
                    .expect("PSO cache holds stale handle");
                if let Some(PsoDesc::Compute(cached)) = &pso.desc {
                    if *cached == *desc {
                        self.psos.lookup_mut(candidate.raw()).expect("checked").refcount += 1;
                        return Ok(candidate);
                    }
                }
            }
        }

        let pso_desc = PsoDesc::Compute(*desc);
        let pipeline = self.build_pipeline(&pso_desc, name)?;
        let (raw, record) = self.psos.alloc();
        *record = Pso {
            name: name.to_string(),
            desc: Some(pso_desc),
            pipeline,
            refcount: 1,
        };
        let handle = PsoHandle(raw);

        self.pso_cache.entry(key).or_default().push(handle);
        self.link_shader(desc.cs, handle);
        Ok(handle)
    }

    /// Links a freshly built PSO to its shader: a counted reference plus the
    /// weak back-edge used for reload invalidation.
    fn link_shader(&mut self, shader: ShaderHandle, pso: PsoHandle) {
        let record = self
            .shaders
            .lookup_mut(shader.raw())
            .expect("PSO built against stale shader");
        record.refcount += 1;
        if !record.linked_psos.contains(&pso) {
            record.linked_psos.push(pso);
        }
    }

    pub fn release_pso(&mut self, handle: PsoHandle) {
        let record = self
            .psos
            .lookup_mut(handle.raw())
            .expect("release of stale PSO handle");
        assert!(record.refcount > 0);
        record.refcount -= 1;
        if record.refcount > 0 {
            return;
        }

        let pipeline = record.pipeline;
        let desc = record.desc.take();
        self.psos.free(handle.raw());

        if let Some(desc) = &desc {
            let key = match desc {
                PsoDesc::Graphics(d) => hash_desc(d.as_ref()),
                PsoDesc::Compute(d) => hash_desc(d),
            };
            if let Some(candidates) = self.pso_cache.get_mut(&key) {
                candidates.retain(|&h| h != handle);
                if candidates.is_empty() {
                    self.pso_cache.remove(&key);
                }
            }
            // Relinquish the references link_shader took.
            for shader in desc_shaders(desc) {
                if let Some(record) = self.shaders.lookup_mut(shader.raw()) {
                    record.linked_psos.retain(|&h| h != handle);
                } else {
                    continue;
                }
                self.release_shader(shader);
            }
        }

        let fences = self.current_queue_fences();
        self.deferred.push(DeferredDelete {
            object: DeferredObject::Pipeline(pipeline),
            fences,
            heap_slots: Vec::new(),
        });
    }

    // -------------------------------------------------------------------
    // Frame loop
    // -------------------------------------------------------------------

    pub fn backbuffer(&self) -> TextureHandle {
        self.backbuffers[self.backbuffer_index as usize]
    }

    pub fn backbuffer_depth(&self) -> TextureHandle {
        self.depth_target
    }

    pub fn buffer_desc(&self, handle: BufferHandle) -> Option<BufferDesc> {
        self.resources
            .lookup(handle.resource().raw())
            .filter(|r| r.is_buffer())
            .map(|r| r.buffer().desc)
    }

    pub fn texture_desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        self.resources
            .lookup(handle.resource().raw())
            .filter(|r| !r.is_buffer())
            .map(|r| r.texture().desc)
    }

    /// The format backbuffer records carry, derived from the surface format
    /// the swapchain actually selected. Build backbuffer PSOs against this.
    pub fn backbuffer_format(&self) -> Format {
        self.swapchain.color_format
    }

    pub fn backbuffer_extent(&self) -> (u32, u32) {
        (self.swapchain.extent.width, self.swapchain.extent.height)
    }

    /// Flags the swapchain for recreation at the next begin_frame.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.window_extent = (width, height);
        self.needs_resize = true;
    }

    /// Blocks until the recycled frame slot's GPU work finished, reclaims
    /// its frame-local memory, acquires a backbuffer and opens the frame's
    /// graphics context.
    pub fn begin_frame(&mut self) -> Result<CommandContext> {
        let slot = (self.frame_counter % self.frames.len() as u64) as usize;
        self.frame_slot = slot;

        let recycled_fence = self.frames[slot].frame_fence;
        self.queues
            .wait_fence_blocking(&self.device, recycled_fence)?;

        {
            let frame = &mut self.frames[slot];
            frame.upload.retire(&mut self.upload_pool);
        }
        self.flush_completed_deletions()?;
        self.heap.on_begin_frame(slot);

        if self.needs_resize {
            self.recreate_swapchain()?;
        }

        let image_available = self.frames[slot].image_available;
        let (image_index, status) = self.swapchain.acquire_next_image(image_available)?;
        if status == SwapchainStatus::OutOfDate {
            self.recreate_swapchain()?;
            let (image_index, status) = self.swapchain.acquire_next_image(image_available)?;
            if status == SwapchainStatus::OutOfDate {
                bail!("Swapchain still out of date after recreation");
            }
            self.backbuffer_index = image_index;
        } else {
            self.backbuffer_index = image_index;
        }

        // Acquired backbuffer contents are undefined; first use discards.
        let backbuffer = self.backbuffers[self.backbuffer_index as usize];
        if let Some(record) = self.resources.lookup_mut(backbuffer.resource().raw()) {
            record.state = ResourceState::Unknown;
        }

        let alloc = self.queues.graphics.acquire_allocator(&self.device)?;
        unsafe {
            self.device.begin_command_buffer(
                alloc.cmd_buf,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        let mut ctx = CommandContext::new(QueueType::Graphics, alloc);
        let depth = self.depth_target;
        cmd::set_render_targets(self, &mut ctx, &[backbuffer], depth);
        Ok(ctx)
    }

    /// Opens a context on any queue, outside the frame loop. Submit it with
    /// [`Device::submit_context`].
    pub fn begin_context(&mut self, queue_type: QueueType) -> Result<CommandContext> {
        let alloc = self
            .queues
            .queue_mut(queue_type)
            .acquire_allocator(&self.device)?;
        unsafe {
            self.device.begin_command_buffer(
                alloc.cmd_buf,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        Ok(CommandContext::new(queue_type, alloc))
    }

    /// Closes and submits a context opened with [`Device::begin_context`].
    pub fn submit_context(&mut self, mut ctx: CommandContext) -> Result<FenceValue> {
        cmd::close_rendering(&mut ctx, &self.device);
        cmd::flush_barriers(self, &mut ctx);
        unsafe {
            self.device.end_command_buffer(ctx.cmd_buf)?;
        }
        let CommandContext {
            allocator,
            queue_type,
            cmd_buf,
            ..
        } = ctx;
        let queue = self.queues.queue_mut(queue_type);
        let fence = queue.submit(&self.device, cmd_buf, &SubmitDesc::default())?;
        queue.release_allocator(allocator, fence);
        Ok(fence)
    }

    /// Closes the frame context, submits it and presents the backbuffer.
    pub fn end_frame(&mut self, mut ctx: CommandContext) -> Result<()> {
        ctx.check_graphics();

        let backbuffer = self.backbuffer();
        cmd::transition_resource(self, &mut ctx, backbuffer.resource(), ResourceState::Present);
        cmd::close_rendering(&mut ctx, &self.device);
        cmd::flush_barriers(self, &mut ctx);

        unsafe {
            self.device.end_command_buffer(ctx.cmd_buf)?;
        }

        let slot = self.frame_slot;
        let (image_available, render_finished) = {
            let frame = &self.frames[slot];
            (frame.image_available, frame.render_finished)
        };
        let submit = SubmitDesc {
            wait_binary: vec![(
                image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            signal_binary: vec![render_finished],
        };
        let fence = self
            .queues
            .graphics
            .submit(&self.device, ctx.cmd_buf, &submit)?;
        let CommandContext { allocator, .. } = ctx;
        self.queues.graphics.release_allocator(allocator, fence);
        self.frames[slot].frame_fence = fence;
        self.heap.on_end_frame(slot);

        let status = self.swapchain.present(
            self.queues.graphics.queue,
            self.backbuffer_index,
            &[render_finished],
        )?;
        if status != SwapchainStatus::Ok {
            self.needs_resize = true;
        }

        self.frame_counter += 1;
        Ok(())
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        self.queues.wait_all_idle(&self.device)?;
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    fn recreate_swapchain(&mut self) -> Result<()> {
        self.wait_idle()?;
        self.needs_resize = false;

        for handle in std::mem::take(&mut self.backbuffers) {
            let record = self
                .resources
                .lookup_mut(handle.resource().raw())
                .expect("backbuffer record missing");
            record.kind = ResourceKind::Empty;
            self.resources.free(handle.resource().raw());
        }

        let (width, height) = self.window_extent;
        let old = self.swapchain.swapchain;
        let new_swapchain = Swapchain::new(
            &self.instance,
            &self.device,
            self.physical_device,
            self.surface,
            &self.surface_loader,
            width,
            height,
            self.config.present_mode(),
            Some(old),
        )?;
        unsafe {
            self.swapchain.destroy(&self.device);
        }
        self.swapchain = new_swapchain;
        self.register_backbuffers()?;

        if self.depth_target.is_valid() {
            self.release(self.depth_target.resource());
        }
        self.create_depth_target()?;
        Ok(())
    }

    fn register_backbuffers(&mut self) -> Result<()> {
        let extent = self.swapchain.extent;
        let images: Vec<(vk::Image, vk::ImageView)> = self
            .swapchain
            .images
            .iter()
            .copied()
            .zip(self.swapchain.image_views.iter().copied())
            .collect();
        for (i, (image, view)) in images.into_iter().enumerate() {
            let desc = TextureDesc::tex_2d(
                extent.width,
                extent.height,
                TextureUsageFlags::RENDER_TARGET,
                self.backbuffer_format(),
            );
            let (raw, record) = self.resources.alloc();
            *record = Resource {
                name: format!("backbuffer {i}"),
                refcount: 1,
                state: ResourceState::Unknown,
                kind: ResourceKind::Texture(TextureData {
                    desc,
                    image,
                    allocation: None,
                    owns_image: false,
                    full_view: view,
                    mip_views: Vec::new(),
                    srv_slot: INVALID_SLOT,
                    uav_slots: Vec::new(),
                }),
            };
            self.backbuffers.push(TextureHandle(ResourceHandle(raw)));
        }
        Ok(())
    }

    /// Writes real null views into the heap's base region so unset table
    /// entries stay valid to bind.
    fn create_null_descriptors(&mut self) -> Result<()> {
        let allocator = self.allocator.as_mut().expect("allocator torn down");

        let buffer_desc = BufferDesc {
            flags: BufferFlags::CONSTANT | BufferFlags::SHADER_RESOURCE | BufferFlags::UNORDERED_ACCESS,
            format: Format::Unknown,
            size_in_bytes: 256,
            stride_in_bytes: 0,
        };
        let (buffer, buffer_allocation) =
            resource::create_committed_buffer(&self.device, allocator, &buffer_desc, "null buffer")?;

        let image_desc = TextureDesc::tex_2d(
            1,
            1,
            TextureUsageFlags::SHADER_RESOURCE | TextureUsageFlags::UNORDERED_ACCESS,
            Format::R8G8B8A8Unorm,
        );
        let (image, image_allocation) =
            resource::create_committed_image(&self.device, allocator, &image_desc, "null image")?;
        let view = resource::create_full_view(&self.device, image, &image_desc, "null image")?;

        // One-shot transition to GENERAL so both sampled and storage
        // descriptors can share the view.
        let alloc = self.queues.graphics.acquire_allocator(&self.device)?;
        unsafe {
            self.device.begin_command_buffer(
                alloc.cmd_buf,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            self.device.cmd_pipeline_barrier(
                alloc.cmd_buf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            );
            self.device.end_command_buffer(alloc.cmd_buf)?;
        }
        let fence = self
            .queues
            .graphics
            .submit(&self.device, alloc.cmd_buf, &SubmitDesc::default())?;
        self.queues.graphics.release_allocator(alloc, fence);
        self.queues
            .graphics
            .wait_fence_blocking(&self.device, fence)?;

        for slot in 0..self.heap.partition.null_size {
            self.heap
                .write_uniform_buffer(&self.device, slot, buffer, 0, 256);
            self.heap
                .write_storage_buffer(&self.device, slot, buffer, 0, 256);
            self.heap.write_sampled_image(&self.device, slot, view);
            self.heap.write_storage_image(&self.device, slot, view);
        }

        self.null_buffer = buffer;
        self.null_buffer_allocation = Some(buffer_allocation);
        self.null_image = image;
        self.null_image_allocation = Some(image_allocation);
        self.null_image_view = view;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        info!("Destroying GPU device");
        if self.wait_idle().is_err() {
            warn!("Device wait-idle failed during teardown");
        }

        // Everything in flight has retired; deferred objects can go now.
        for entry in &mut self.deferred {
            entry.fences = [FenceValue::NULL; 3];
        }
        if let Err(e) = self.flush_completed_deletions() {
            warn!("Deferred deletion flush failed during teardown: {e:#}");
        }

        // Backbuffer records and the depth target are device-owned.
        let internal = self.backbuffers.len() + 1;
        let leaked = (self.resources.num_allocated() as usize).saturating_sub(internal);
        if leaked > 0 {
            warn!("{leaked} resources still alive at device teardown");
        }

        unsafe {
            // Registry leftovers, including backbuffer records.
            let handles: Vec<RawHandle> = self.resources.iter_handles().collect();
            for raw in handles {
                let record = self.resources.lookup_mut(raw).expect("live handle");
                let kind = std::mem::take(&mut record.kind);
                let allocator = self.allocator.as_mut().expect("allocator torn down");
                resource::destroy_kind(&self.device, allocator, kind);
            }
            let handles: Vec<RawHandle> = self.shaders.iter_handles().collect();
            for raw in handles {
                let module = self.shaders.lookup(raw).expect("live handle").module;
                if module != vk::ShaderModule::null() {
                    self.device.destroy_shader_module(module, None);
                }
            }
            let handles: Vec<RawHandle> = self.psos.iter_handles().collect();
            for raw in handles {
                let pipeline = self.psos.lookup(raw).expect("live handle").pipeline;
                if pipeline != vk::Pipeline::null() {
                    self.device.destroy_pipeline(pipeline, None);
                }
            }

            if let Some(allocation) = self.null_buffer_allocation.take() {
                let _ = self.allocator_mut().free(allocation);
            }
            self.device.destroy_buffer(self.null_buffer, None);
            self.device.destroy_image_view(self.null_image_view, None);
            if let Some(allocation) = self.null_image_allocation.take() {
                let _ = self.allocator_mut().free(allocation);
            }
            self.device.destroy_image(self.null_image, None);

            for frame in &mut self.frames {
                frame.upload.retire(&mut self.upload_pool);
                self.device.destroy_semaphore(frame.image_available, None);
                self.device.destroy_semaphore(frame.render_finished, None);
            }
            if let Some(mut allocator) = self.allocator.take() {
                self.upload_pool.destroy(&self.device, &mut allocator);
                // Allocator drops before the device.
                drop(allocator);
            }

            self.heap.destroy(&self.device);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.swapchain.destroy(&self.device);
            self.queues.destroy(&self.device);

            self.surface_loader.destroy_surface(self.surface, None);
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn hash_desc<T: Hash>(desc: &T) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    desc.hash(&mut hasher);
    hasher.finish()
}

fn desc_shaders(desc: &PsoDesc) -> Vec<ShaderHandle> {
    match desc {
        PsoDesc::Graphics(d) => {
            let mut out = vec![d.vs];
            if d.ps.is_valid() {
                out.push(d.ps);
            }
            out
        }
        PsoDesc::Compute(d) => vec![d.cs],
    }
}

fn collect_heap_slots(kind: &ResourceKind) -> Vec<u32> {
    let mut slots = Vec::new();
    match kind {
        ResourceKind::Empty => {}
        ResourceKind::Buffer(b) => {
            for slot in [b.cbv_slot, b.srv_slot, b.uav_slot] {
                if slot != INVALID_SLOT {
                    slots.push(slot);
                }
            }
        }
        ResourceKind::Texture(t) => {
            if t.srv_slot != INVALID_SLOT {
                slots.push(t.srv_slot);
            }
            slots.extend_from_slice(&t.uav_slots);
        }
    }
    slots
}

fn create_binary_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    unsafe {
        device
            .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
            .context("Failed to create semaphore")
    }
}

fn create_pipeline_layout(
    device: &ash::Device,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout> {
    // Three u32 table bases, visible to all stages.
    let push_range = vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::ALL)
        .offset(0)
        .size(12)
        .build();
    let set_layouts = [set_layout];
    let push_ranges = [push_range];
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_ranges);
    unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")
    }
}

fn create_instance(
    entry: &Entry,
    display_handle: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new("furnace")?;
    let validation_layer = CString::new("VK_LAYER_KHRONOS_validation")?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .context("No Vulkan surface support for this display")?
        .to_vec();
    extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());

    let layer_names = if enable_validation {
        vec![validation_layer.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;
    Ok((debug_utils, messenger))
}

struct QueueFamilies {
    graphics: u32,
    compute: u32,
    copy: u32,
}

impl QueueFamilies {
    fn unique(&self) -> Vec<u32> {
        let mut out = vec![self.graphics];
        if !out.contains(&self.compute) {
            out.push(self.compute);
        }
        if !out.contains(&self.copy) {
            out.push(self.copy);
        }
        out
    }
}

fn pick_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
    let graphics = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;
    // Prefer dedicated families; fall back to the graphics family.
    let compute = families
        .iter()
        .position(|f| {
            f.queue_flags.contains(vk::QueueFlags::COMPUTE)
                && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|i| i as u32)
        .unwrap_or(graphics);
    let copy = families
        .iter()
        .position(|f| {
            f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .unwrap_or(compute);
    Some(QueueFamilies {
        graphics,
        compute,
        copy,
    })
}

fn pick_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;
    if devices.is_empty() {
        bail!("No Vulkan-capable GPU found");
    }

    let mut best: Option<(vk::PhysicalDevice, QueueFamilies)> = None;
    let mut best_score = 0;

    for device in devices {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let Some(picked) = pick_queue_families(&families) else {
            continue;
        };

        let present_supported = unsafe {
            surface_loader
                .get_physical_device_surface_support(device, picked.graphics, surface)
                .unwrap_or(false)
        };
        if !present_supported {
            continue;
        }

        let score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        if score > best_score {
            best_score = score;
            best = Some((device, picked));
        }
    }

    best.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<ash::Device> {
    let queue_priorities = [1.0];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

    let features = vk::PhysicalDeviceFeatures::builder().fill_mode_non_solid(true);
    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_update_unused_while_pending(true)
        .descriptor_binding_uniform_buffer_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .dynamic_rendering(true)
        .synchronization2(false);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .context("Failed to create logical device")
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.compute, 1);
        assert_eq!(picked.copy, 2);
        assert_eq!(picked.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_hardware_shares_queues() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.compute, 0);
        assert_eq!(picked.copy, 0);
        assert_eq!(picked.unique(), vec![0]);
    }

    #[test]
    fn no_graphics_family_means_no_device() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        assert!(pick_queue_families(&families).is_none());
    }

    fn shader_handle(index: u32) -> ShaderHandle {
        ShaderHandle(RawHandle {
            index,
            generation: 0,
        })
    }

    // Releasing a PSO walks exactly these shaders to give back the
    // references link_shader took.
    #[test]
    fn pso_desc_lists_each_counted_shader() {
        let vs = shader_handle(1);
        let ps = shader_handle(2);

        let gfx = PsoDesc::Graphics(Box::new(GraphicsPsoDesc {
            vs,
            ps,
            ..Default::default()
        }));
        assert_eq!(desc_shaders(&gfx), vec![vs, ps]);

        let depth_only = PsoDesc::Graphics(Box::new(GraphicsPsoDesc {
            vs,
            ps: ShaderHandle::INVALID,
            ..Default::default()
        }));
        assert_eq!(desc_shaders(&depth_only), vec![vs]);

        let cs = shader_handle(3);
        let compute = PsoDesc::Compute(ComputePsoDesc { cs });
        assert_eq!(desc_shaders(&compute), vec![cs]);
    }
}
