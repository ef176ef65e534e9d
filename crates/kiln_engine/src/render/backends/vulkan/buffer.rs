//! Buffer management for geometry and staging data
//!
//! Memory management following RAII patterns with proper allocation and
//! cleanup. Static geometry lives in device-local memory filled through a
//! staging buffer; dynamic geometry and uniform rings stay host-visible
//! and persistently mapped.

use ash::{vk, Device, Instance};
use std::ffi::c_void;

use super::commands::CommandPool;
use super::context::{VulkanError, VulkanResult};
use crate::render::api::BufferFlags;

/// Buffer wrapper with memory management
pub struct DeviceBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<*mut c_void>,
}

impl DeviceBuffer {
    /// Create a buffer with memory allocation
    pub fn new(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = find_memory_type(
            instance,
            physical_device,
            mem_requirements.memory_type_bits,
            properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)?
        };

        unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(VulkanError::Api)?;
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            mapped: None,
        })
    }

    /// Create a host-visible buffer that stays mapped for its lifetime
    pub fn new_mapped(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let mut buffer = Self::new(
            device,
            instance,
            physical_device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let ptr = unsafe {
            buffer
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?
        };
        buffer.mapped = Some(ptr);

        Ok(buffer)
    }

    /// Create a device-local buffer filled with `data` through a staging copy
    pub fn new_device_local(
        device: Device,
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        command_pool: &CommandPool,
        queue: vk::Queue,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> VulkanResult<Self> {
        // Zero-size buffers are invalid; allocate one byte and skip the copy.
        let size = (data.len() as vk::DeviceSize).max(1);

        let staging = Self::new_mapped(
            device.clone(),
            instance,
            physical_device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write_bytes(0, data)?;

        let buffer = Self::new(
            device,
            instance,
            physical_device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        if !data.is_empty() {
            command_pool.one_time_submit(queue, |device, cmd| {
                let region = vk::BufferCopy::builder()
                    .size(data.len() as vk::DeviceSize)
                    .build();
                unsafe {
                    device.cmd_copy_buffer(cmd, staging.handle(), buffer.handle(), &[region]);
                }
            })?;
        }

        Ok(buffer)
    }

    /// Write bytes at an offset through the persistent mapping
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> VulkanResult<()> {
        let ptr = self.mapped.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "buffer is not host-mapped".to_string(),
        })?;
        if offset + data.len() > self.size as usize {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "write of {} bytes at offset {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    self.size
                ),
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (ptr as *mut u8).add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Read bytes back through the persistent mapping
    pub fn read_bytes(&self, len: usize) -> VulkanResult<Vec<u8>> {
        let ptr = self.mapped.ok_or_else(|| VulkanError::InvalidOperation {
            reason: "buffer is not host-mapped".to_string(),
        })?;
        let len = len.min(self.size as usize);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// What a [`GeometryBuffer`] binds as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Vertex attribute data
    Vertex,
    /// Index data
    Index,
}

/// A vertex or index buffer as tracked by the backend
pub struct GeometryBuffer {
    /// Backing allocation
    pub buffer: DeviceBuffer,
    /// Vertex or index
    pub kind: BufferKind,
    /// Creation flags, checked on update
    pub flags: BufferFlags,
    /// Vertex or index count
    pub element_count: u32,
    /// Index type, only meaningful for index buffers
    pub index_type: vk::IndexType,
}

/// Find memory type with required properties
pub fn find_memory_type(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    let mem_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

    for i in 0..mem_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (mem_properties.memory_types[i as usize].property_flags & properties) == properties
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType)
}
