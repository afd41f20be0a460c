// Per-frame upload memory
//
// Host-visible pages handed out by bump allocation. Each buffered frame owns
// an allocator; its pages go back to the shared pool when the frame slot
// recycles, after the frame fence has been waited on. Scratch constants,
// transient buffer contents and staging copies all come from here.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use log::debug;

pub const DEFAULT_PAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum alignment for scratch constant-buffer allocations.
pub const CONSTANT_ALIGN: u64 = 256;

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Aligned offset within a page, or `None` when the remainder cannot hold
/// `size` bytes.
fn fit_in_page(head: u64, page_size: u64, size: u64, align: u64) -> Option<u64> {
    let offset = align_up(head, align);
    (offset + size <= page_size).then_some(offset)
}

pub struct UploadPage {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    head: u64,
    mapped: *mut u8,
}

impl UploadPage {
    fn create(device: &ash::Device, allocator: &mut Allocator, size: u64) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .context("Failed to create upload page buffer")?
        };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name: "upload page",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate upload page memory")?;

        unsafe {
            device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind upload page memory")?;
        }

        let mapped = allocation
            .mapped_ptr()
            .context("Upload page memory is not host mapped")?
            .as_ptr() as *mut u8;

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            head: 0,
            mapped,
        })
    }

    unsafe fn destroy(mut self, device: &ash::Device, allocator: &mut Allocator) {
        if let Some(allocation) = self.allocation.take() {
            let _ = allocator.free(allocation);
        }
        device.destroy_buffer(self.buffer, None);
    }
}

/// One bump allocation out of an upload page. The memory is valid until the
/// owning frame slot recycles.
#[derive(Clone, Copy)]
pub struct ScratchAlloc {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    cpu_ptr: *mut u8,
}

impl ScratchAlloc {
    pub fn copy_from(&self, data: &[u8]) {
        assert!(data.len() as u64 <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.cpu_ptr, data.len());
        }
    }

    pub fn cpu_ptr(&self) -> *mut u8 {
        self.cpu_ptr
    }
}

/// Shared pool of upload pages, recycled across frames.
pub struct UploadPagePool {
    default_page_size: u64,
    free: Vec<UploadPage>,
    num_created: u32,
}

impl UploadPagePool {
    pub fn new(default_page_size: u64) -> Self {
        Self {
            default_page_size,
            free: Vec::new(),
            num_created: 0,
        }
    }

    fn acquire(
        &mut self,
        device: &ash::Device,
        allocator: &mut Allocator,
        min_size: u64,
    ) -> Result<UploadPage> {
        if let Some(idx) = self.free.iter().position(|p| p.size >= min_size) {
            return Ok(self.free.swap_remove(idx));
        }
        let size = min_size.max(self.default_page_size);
        self.num_created += 1;
        debug!("Created upload page {} ({} bytes)", self.num_created, size);
        UploadPage::create(device, allocator, size)
    }

    fn recycle(&mut self, pages: impl Iterator<Item = UploadPage>) {
        self.free.extend(pages.map(|mut p| {
            p.head = 0;
            p
        }));
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        for page in self.free.drain(..) {
            page.destroy(device, allocator);
        }
    }
}

/// Bump allocator over upload pages for one buffered frame. Only the most
/// recently opened page accepts allocations; a page that cannot fit a
/// request is done for the rest of the frame, never revisited.
#[derive(Default)]
pub struct FrameUploadAllocator {
    pages: Vec<UploadPage>,
}

/// Bump out of the active (last) page.
fn bump_active(pages: &mut [UploadPage], size: u64, align: u64) -> Option<ScratchAlloc> {
    let page = pages.last_mut()?;
    let offset = fit_in_page(page.head, page.size, size, align)?;
    page.head = offset + size;
    Some(ScratchAlloc {
        buffer: page.buffer,
        offset,
        size,
        cpu_ptr: unsafe { page.mapped.add(offset as usize) },
    })
}

impl FrameUploadAllocator {
    pub fn alloc(
        &mut self,
        device: &ash::Device,
        allocator: &mut Allocator,
        pool: &mut UploadPagePool,
        size: u64,
        align: u64,
    ) -> Result<ScratchAlloc> {
        if let Some(scratch) = bump_active(&mut self.pages, size, align) {
            return Ok(scratch);
        }
        let page = pool.acquire(device, allocator, size)?;
        self.pages.push(page);
        bump_active(&mut self.pages, size, align)
            .context("Upload allocation larger than acquired page")
    }

    /// Returns all pages to the pool. Call only after the frame fence for
    /// this slot has been waited on.
    pub fn retire(&mut self, pool: &mut UploadPagePool) {
        pool.recycle(self.pages.drain(..));
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        for page in self.pages.drain(..) {
            page.destroy(device, allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn fit_respects_alignment_and_capacity() {
        // Head at 100, align 256: allocation starts at 256.
        assert_eq!(fit_in_page(100, 1024, 512, 256), Some(256));
        // Exactly fills the page.
        assert_eq!(fit_in_page(0, 1024, 1024, 256), Some(0));
        // Alignment pushes it over the end.
        assert_eq!(fit_in_page(100, 1024, 800, 256), None);
        // Too big outright.
        assert_eq!(fit_in_page(0, 1024, 2048, 4), None);
    }

    #[test]
    fn full_page_is_skipped_not_split() {
        // An allocation that no partially-used page can hold must not carve
        // up an earlier page.
        let head = 1000u64;
        assert_eq!(fit_in_page(head, 1024, 512, 4), None);
        assert_eq!(fit_in_page(0, 1024, 512, 4), Some(0));
    }

    fn test_page(size: u64, head: u64) -> UploadPage {
        UploadPage {
            buffer: vk::Buffer::null(),
            allocation: None,
            size,
            head,
            mapped: std::ptr::null_mut(),
        }
    }

    #[test]
    fn retired_page_is_not_revisited() {
        let mut pages = vec![test_page(64, 0)];
        let first = bump_active(&mut pages, 48, 4).unwrap();
        assert_eq!(first.offset, 0);

        // 32 does not fit the 16-byte remainder; the page is done for the
        // frame.
        assert!(bump_active(&mut pages, 32, 4).is_none());

        // A fresh page becomes active. The 8-byte request would fit the old
        // page's remainder, but must land in the new one.
        pages.push(test_page(64, 0));
        let next = bump_active(&mut pages, 8, 4).unwrap();
        assert_eq!(next.offset, 0);
        assert_eq!(pages[0].head, 48);
        assert_eq!(pages[1].head, 8);
    }
}
