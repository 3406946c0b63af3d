//! GPU buffer and image helpers.
//!
//! Two buffer flavors: host-visible buffers that stay persistently mapped
//! for their whole lifetime (SSBOs, staging, capture readback), and
//! device-local buffers populated through a one-time staged copy on the
//! graphics queue. Plus the depth attachment image.

use ash::{vk, Device};

use super::{VulkanError, VulkanResult};

/// Find the first memory type matching the filter and property flags.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (memory_properties.memory_types[i as usize].property_flags & properties)
                == properties
        {
            return Ok(i);
        }
    }
    Err(VulkanError::NoSuitableMemoryType)
}

/// A buffer with bound device memory.
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Create a buffer and allocate matching memory.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
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
                .map_err(|e| VulkanError::GpuAlloc(format!("buffer create: {:?}", e)))?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(VulkanError::GpuAlloc(format!("memory alloc: {:?}", e)));
            }
        };

        unsafe {
            if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
                return Err(VulkanError::GpuAlloc(format!("bind: {:?}", e)));
            }
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
        })
    }

    /// Create a device-local buffer and fill it through a staged copy:
    /// host-visible staging, one-time copy command on the graphics queue,
    /// queue-wait, staging freed.
    pub fn device_local_with_data(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        upload_pool: vk::CommandPool,
        graphics_queue: vk::Queue,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> VulkanResult<Self> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = MappedBuffer::new(
            device.clone(),
            memory_properties,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.write(0, bytes);

        let buffer = Self::new(
            device.clone(),
            memory_properties,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(upload_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| VulkanError::GpuAlloc(format!("upload cb alloc: {:?}", e)))?
        };
        let cb = command_buffers[0];

        let result = (|| -> VulkanResult<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                device
                    .begin_command_buffer(cb, &begin_info)
                    .map_err(VulkanError::Api)?;
                let region = vk::BufferCopy::builder().size(size).build();
                device.cmd_copy_buffer(cb, staging.handle(), buffer.handle(), &[region]);
                device.end_command_buffer(cb).map_err(VulkanError::Api)?;

                let command_buffers = [cb];
                let submit = vk::SubmitInfo::builder()
                    .command_buffers(&command_buffers)
                    .build();
                device
                    .queue_submit(graphics_queue, &[submit], vk::Fence::null())
                    .map_err(|e| VulkanError::GpuAlloc(format!("upload submit: {:?}", e)))?;
                device
                    .queue_wait_idle(graphics_queue)
                    .map_err(VulkanError::from_vk)?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(upload_pool, &[cb]) };
        result?;
        Ok(buffer)
    }

    /// Buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A host-visible, host-coherent buffer mapped for its entire lifetime.
pub struct MappedBuffer {
    buffer: Buffer,
    ptr: *mut u8,
}

impl MappedBuffer {
    /// Create and persistently map.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let buffer = Buffer::new(
            device,
            memory_properties,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let ptr = unsafe {
            buffer
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
                .map_err(|e| VulkanError::GpuAlloc(format!("map: {:?}", e)))?
        } as *mut u8;
        Ok(Self { buffer, ptr })
    }

    /// Copy `bytes` into the mapping at `offset`. Out-of-range writes are
    /// truncated.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let capacity = self.buffer.size as usize;
        if offset >= capacity {
            return;
        }
        let len = bytes.len().min(capacity - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), len);
        }
    }

    /// Copy a slice of plain-old-data values into the mapping.
    pub fn write_slice<T: Copy>(&self, values: &[T]) {
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
        };
        self.write(0, bytes);
    }

    /// Read the mapping back into `out` (capture readback).
    pub fn read(&self, out: &mut [u8]) {
        let len = out.len().min(self.buffer.size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, out.as_mut_ptr(), len);
        }
    }

    /// Buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        unsafe {
            self.buffer.device.unmap_memory(self.buffer.memory);
        }
        // The inner buffer drop frees the handle and memory.
    }
}

/// D32_SFLOAT depth attachment with its view.
pub struct DepthImage {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

/// Depth attachment format used by the mesh pipeline.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

impl DepthImage {
    /// Create the depth image and view for the given extent.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(|e| VulkanError::GpuAlloc(format!("depth image: {:?}", e)))?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(VulkanError::GpuAlloc(format!("depth memory: {:?}", e)));
            }
        };
        unsafe {
            if let Err(e) = device.bind_image_memory(image, memory, 0) {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
                return Err(VulkanError::GpuAlloc(format!("depth bind: {:?}", e)));
            }
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(VulkanError::GpuAlloc(format!("depth view: {:?}", e)));
            }
        };

        Ok(Self {
            device,
            image,
            memory,
            view,
        })
    }

    /// Image handle.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Depth-aspect view.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for DepthImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
