//! Command buffer management
//!
//! One command pool per backend, allocating the per-frame primary command
//! buffers plus short-lived one-time buffers for staging copies and
//! layout transitions.

use ash::{vk, Device};

use super::context::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool for the given queue family
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self {
            device,
            command_pool,
        })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Record and synchronously submit a one-time command buffer
    ///
    /// Used for staging copies and image layout transitions at resource
    /// creation time; waits for the queue to drain before returning, so
    /// the recorded work is complete when this returns.
    pub fn one_time_submit<F>(&self, queue: vk::Queue, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        let command_buffer = self.allocate_command_buffers(1)?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        record(&self.device, command_buffer);

        let result = unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)
                .and_then(|()| {
                    let command_buffers = [command_buffer];
                    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                    self.device
                        .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                        .map_err(VulkanError::Api)
                })
                .and_then(|()| self.device.queue_wait_idle(queue).map_err(VulkanError::Api))
        };

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }
        result
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
