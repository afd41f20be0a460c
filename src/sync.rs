// Timeline-semaphore fence
//
// One fence per queue. The queue signals monotonically increasing values on
// submit; the CPU polls or blocks on them. Completed-value reads are cached
// so the common has_completed path stays off the driver.

use anyhow::{Context, Result};
use ash::vk;

pub struct Fence {
    pub semaphore: vk::Semaphore,
    cached_completed: u64,
}

impl Fence {
    pub fn new(device: &ash::Device, initial_value: u64) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .context("Failed to create timeline semaphore")?
        };

        Ok(Self {
            semaphore,
            cached_completed: initial_value,
        })
    }

    /// Cheap check against the cached completed value, refreshing from the
    /// driver only on a miss.
    pub fn has_completed(&mut self, device: &ash::Device, value: u64) -> Result<bool> {
        if value <= self.cached_completed {
            return Ok(true);
        }
        self.refresh(device)?;
        Ok(value <= self.cached_completed)
    }

    pub fn completed_value(&mut self, device: &ash::Device) -> Result<u64> {
        self.refresh(device)?;
        Ok(self.cached_completed)
    }

    fn refresh(&mut self, device: &ash::Device) -> Result<u64> {
        let value = unsafe {
            device
                .get_semaphore_counter_value(self.semaphore)
                .context("Failed to query timeline semaphore value")?
        };
        debug_assert!(value >= self.cached_completed);
        self.cached_completed = value;
        Ok(value)
    }

    /// Blocks the calling thread until the fence reaches `value`.
    pub fn wait_blocking(&mut self, device: &ash::Device, value: u64) -> Result<()> {
        if value <= self.cached_completed {
            return Ok(());
        }
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            device
                .wait_semaphores(&wait_info, u64::MAX)
                .context("Timeline semaphore wait failed")?;
        }
        self.cached_completed = self.cached_completed.max(value);
        Ok(())
    }

    /// # Safety
    /// No submitted work may still reference the semaphore.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_semaphore(self.semaphore, None);
        self.semaphore = vk::Semaphore::null();
    }
}
