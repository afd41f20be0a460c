// Buffers and textures: registry records plus native object creation
//
// A registry slot holds the native object, its memory allocation, cached
// descriptor-heap view slots and the tracked resource state barriers are
// computed from. Transient buffers carry no committed memory at all; they
// point at the current frame's upload allocation instead.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use crate::types::{
    BufferDesc, BufferFlags, Format, ResourceState, ResourceType, TextureDesc, TextureUsageFlags,
};
use crate::upload::ScratchAlloc;

/// Descriptor-heap slot, `INVALID_SLOT` when the view kind does not exist.
pub const INVALID_SLOT: u32 = u32::MAX;

pub struct BufferData {
    pub desc: BufferDesc,
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,

    pub cbv_slot: u32,
    pub srv_slot: u32,
    pub uav_slot: u32,

    /// Current frame backing for transient/dynamic updates.
    pub frame_backing: Option<ScratchAlloc>,
    /// Frame index of the last update. Transient buffers must match the
    /// current frame when bound.
    pub last_update_frame: u64,
}

pub struct TextureData {
    pub desc: TextureDesc,
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    /// Whether this record owns `image` (false for swapchain backbuffers).
    pub owns_image: bool,

    /// All-mips view for sampling and attachment use.
    pub full_view: vk::ImageView,
    /// One single-mip storage view per mip when UAV usage was requested.
    pub mip_views: Vec<vk::ImageView>,

    pub srv_slot: u32,
    pub uav_slots: Vec<u32>,
}

#[derive(Default)]
pub enum ResourceKind {
    #[default]
    Empty,
    Buffer(BufferData),
    Texture(TextureData),
}

/// One registry slot. `Default` is an empty record; creation fills it in.
#[derive(Default)]
pub struct Resource {
    pub name: String,
    pub refcount: u32,
    pub state: ResourceState,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn buffer(&self) -> &BufferData {
        match &self.kind {
            ResourceKind::Buffer(b) => b,
            _ => panic!("resource '{}' is not a buffer", self.name),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BufferData {
        match &mut self.kind {
            ResourceKind::Buffer(b) => b,
            _ => panic!("resource '{}' is not a buffer", self.name),
        }
    }

    pub fn texture(&self) -> &TextureData {
        match &self.kind {
            ResourceKind::Texture(t) => t,
            _ => panic!("resource '{}' is not a texture", self.name),
        }
    }

    pub fn texture_mut(&mut self) -> &mut TextureData {
        match &mut self.kind {
            ResourceKind::Texture(t) => t,
            _ => panic!("resource '{}' is not a texture", self.name),
        }
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, ResourceKind::Buffer(_))
    }
}

pub fn buffer_usage_flags(flags: BufferFlags) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
    if flags.contains(BufferFlags::VERTEX) {
        usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if flags.contains(BufferFlags::INDEX) {
        usage |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if flags.contains(BufferFlags::CONSTANT) {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if flags.intersects(BufferFlags::SHADER_RESOURCE | BufferFlags::UNORDERED_ACCESS) {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    usage
}

pub fn texture_usage_flags(usage: TextureUsageFlags, format: Format) -> vk::ImageUsageFlags {
    let mut vk_usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC;
    if usage.contains(TextureUsageFlags::SHADER_RESOURCE) {
        vk_usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsageFlags::UNORDERED_ACCESS) {
        vk_usage |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsageFlags::RENDER_TARGET) {
        assert!(!format.is_depth());
        vk_usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsageFlags::DEPTH_STENCIL) {
        assert!(format.is_depth());
        vk_usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    vk_usage
}

/// Creates a device-local buffer and binds its memory.
pub fn create_committed_buffer(
    device: &ash::Device,
    allocator: &mut Allocator,
    desc: &BufferDesc,
    name: &str,
) -> Result<(vk::Buffer, Allocation)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(desc.size_in_bytes as u64)
        .usage(buffer_usage_flags(desc.flags))
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe {
        device
            .create_buffer(&buffer_info, None)
            .with_context(|| format!("Failed to create buffer '{name}'"))?
    };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let allocation = allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for buffer '{name}'"))?;

    unsafe {
        device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .with_context(|| format!("Failed to bind memory for buffer '{name}'"))?;
    }
    Ok((buffer, allocation))
}

/// Creates a device-local image and binds its memory.
pub fn create_committed_image(
    device: &ash::Device,
    allocator: &mut Allocator,
    desc: &TextureDesc,
    name: &str,
) -> Result<(vk::Image, Allocation)> {
    let (image_type, extent) = match desc.resource_type {
        ResourceType::Texture1D => (
            vk::ImageType::TYPE_1D,
            vk::Extent3D {
                width: desc.width,
                height: 1,
                depth: 1,
            },
        ),
        ResourceType::Texture2D | ResourceType::TextureCube => (
            vk::ImageType::TYPE_2D,
            vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
        ),
        ResourceType::Texture3D => (
            vk::ImageType::TYPE_3D,
            vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            },
        ),
        ResourceType::Buffer => panic!("buffer desc passed to image creation"),
    };

    let mut flags = vk::ImageCreateFlags::empty();
    if desc.resource_type == ResourceType::TextureCube {
        flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }

    let image_info = vk::ImageCreateInfo::builder()
        .flags(flags)
        .image_type(image_type)
        .format(desc.format.to_vk())
        .extent(extent)
        .mip_levels(desc.mip_levels)
        .array_layers(desc.array_slices)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(texture_usage_flags(desc.usage, desc.format))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe {
        device
            .create_image(&image_info, None)
            .with_context(|| format!("Failed to create image '{name}'"))?
    };
    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let allocation = allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for image '{name}'"))?;

    unsafe {
        device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
            .with_context(|| format!("Failed to bind memory for image '{name}'"))?;
    }
    Ok((image, allocation))
}

pub fn image_aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// All-mips, all-slices view used for sampling and attachments.
pub fn create_full_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &TextureDesc,
    name: &str,
) -> Result<vk::ImageView> {
    let view_type = match desc.resource_type {
        ResourceType::Texture1D => vk::ImageViewType::TYPE_1D,
        ResourceType::Texture2D => vk::ImageViewType::TYPE_2D,
        ResourceType::Texture3D => vk::ImageViewType::TYPE_3D,
        ResourceType::TextureCube => vk::ImageViewType::CUBE,
        ResourceType::Buffer => panic!("buffer desc passed to view creation"),
    };
    create_view(device, image, desc, view_type, 0, desc.mip_levels, name)
}

/// Single-mip 2D view for storage writes.
pub fn create_mip_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &TextureDesc,
    mip: u32,
    name: &str,
) -> Result<vk::ImageView> {
    create_view(device, image, desc, vk::ImageViewType::TYPE_2D, mip, 1, name)
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &TextureDesc,
    view_type: vk::ImageViewType,
    base_mip: u32,
    mip_count: u32,
    name: &str,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(desc.format.to_vk())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: image_aspect(desc.format),
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: 0,
            layer_count: desc.array_slices,
        });
    unsafe {
        device
            .create_image_view(&view_info, None)
            .with_context(|| format!("Failed to create image view for '{name}'"))
    }
}

/// Frees the native objects behind a registry record.
///
/// # Safety
/// The GPU must be done with the resource.
pub unsafe fn destroy_kind(device: &ash::Device, allocator: &mut Allocator, kind: ResourceKind) {
    match kind {
        ResourceKind::Empty => {}
        ResourceKind::Buffer(mut b) => {
            if let Some(allocation) = b.allocation.take() {
                let _ = allocator.free(allocation);
            }
            if b.buffer != vk::Buffer::null() {
                device.destroy_buffer(b.buffer, None);
            }
        }
        ResourceKind::Texture(mut t) => {
            if let Some(allocation) = t.allocation.take() {
                let _ = allocator.free(allocation);
            }
            // Backbuffer records borrow the swapchain's image and view.
            if t.owns_image {
                if t.full_view != vk::ImageView::null() {
                    device.destroy_image_view(t.full_view, None);
                }
                for view in t.mip_views.drain(..) {
                    device.destroy_image_view(view, None);
                }
                device.destroy_image(t.image, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_usage_translation() {
        let usage = buffer_usage_flags(BufferFlags::VERTEX | BufferFlags::SHADER_RESOURCE);
        assert!(usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(!usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));

        let usage = buffer_usage_flags(BufferFlags::CONSTANT);
        assert!(usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }

    #[test]
    fn texture_usage_translation() {
        let usage = texture_usage_flags(
            TextureUsageFlags::SHADER_RESOURCE | TextureUsageFlags::RENDER_TARGET,
            Format::R8G8B8A8Unorm,
        );
        assert!(usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let usage = texture_usage_flags(TextureUsageFlags::DEPTH_STENCIL, Format::D32Float);
        assert!(usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    #[should_panic]
    fn depth_usage_on_color_format_panics() {
        texture_usage_flags(TextureUsageFlags::DEPTH_STENCIL, Format::R8G8B8A8Unorm);
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(image_aspect(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            image_aspect(Format::R8G8B8A8Unorm),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    #[should_panic(expected = "is not a buffer")]
    fn kind_mismatch_panics() {
        let r = Resource {
            name: "tex".into(),
            ..Default::default()
        };
        let _ = r.buffer();
    }
}
