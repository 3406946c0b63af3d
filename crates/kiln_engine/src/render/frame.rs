//! Frame slots, image slots, and the frame scheduler.
//!
//! Two timelines meet here. Per frame slot (of `MAX_FRAMES_IN_FLIGHT`):
//! a fence for CPU/GPU coordination and an image-available semaphore,
//! plus the persistently mapped quad SSBO and one command pool/buffer per
//! lane. Per swapchain image: a render-finished semaphore. The
//! render-finished semaphore is bound to the image rather than the frame
//! because acquire order and frame order may disagree; present must wait
//! on the submit that actually rendered that image.

use ash::{vk, Device};

use crate::api::{MeshCommand, QuadCommand, MAX_QUADS};
use crate::foundation::math::Mat4;
use crate::mesh::MeshTable;

use super::buffer::MappedBuffer;
use super::context::VulkanContext;
use super::pipeline::{PipelineSet, QuadDescriptors};
use super::recorder::{record_frame, FrameRecordInfo};
use super::swapchain::SwapchainContext;
use super::{VulkanError, VulkanResult};

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// GPU-GPU sync primitive with RAII cleanup.
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create an unsignaled binary semaphore.
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { device, semaphore })
    }

    /// Semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// CPU-GPU sync primitive with RAII cleanup.
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled (frame fences start
    /// signaled so the first wait passes).
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe {
            device
                .create_fence(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { device, fence })
    }

    /// Block until signaled.
    pub fn wait(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(VulkanError::from_vk)
        }
    }

    /// Return to the unsignaled state.
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_fences(&[self.fence])
                .map_err(VulkanError::from_vk)
        }
    }

    /// Fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Command pool with RAII cleanup; buffers allocated from it are
/// individually resettable.
pub struct CommandPool {
    device: Device,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool for `queue_family`.
    pub fn new(device: Device, queue_family: u32) -> VulkanResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let pool = unsafe {
            device
                .create_command_pool(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { device, pool })
    }

    /// Allocate one primary command buffer.
    pub fn allocate_primary(&self) -> VulkanResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        };
        Ok(buffers[0])
    }

    /// Pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Per-frame-in-flight resources. These survive swapchain recreation.
pub struct FrameSlot {
    /// Persistently mapped SSBO holding up to `MAX_QUADS` quad commands.
    pub quad_ssbo: MappedBuffer,
    /// One command pool per lane.
    pub command_pools: Vec<CommandPool>,
    /// One primary command buffer per lane, parallel to `command_pools`.
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Signaled when the acquired image is ready for rendering.
    pub image_available: Semaphore,
    /// Signaled by submit; waited before this slot is reused.
    pub in_flight: Fence,
}

impl FrameSlot {
    /// Create one frame slot with `lane_count` command pools/buffers.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        graphics_family: u32,
        lane_count: usize,
    ) -> VulkanResult<Self> {
        let ssbo_size = (MAX_QUADS * std::mem::size_of::<QuadCommand>()) as vk::DeviceSize;
        let quad_ssbo = MappedBuffer::new(
            device.clone(),
            memory_properties,
            ssbo_size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;

        let mut command_pools = Vec::with_capacity(lane_count);
        let mut command_buffers = Vec::with_capacity(lane_count);
        for _ in 0..lane_count {
            let pool = CommandPool::new(device.clone(), graphics_family)?;
            command_buffers.push(pool.allocate_primary()?);
            command_pools.push(pool);
        }

        let image_available = Semaphore::new(device.clone())?;
        let in_flight = Fence::new(device, true)?;

        Ok(Self {
            quad_ssbo,
            command_pools,
            command_buffers,
            image_available,
            in_flight,
        })
    }

    /// Lane 0's command buffer (the one the recorder uses).
    pub fn primary_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers[0]
    }
}

/// Per-swapchain-image resources; rebuilt on every recreation.
pub struct ImageSlot {
    /// Signaled by the submit that rendered this image; present waits on it.
    pub render_finished: Semaphore,
}

impl ImageSlot {
    /// Create the slot for one swapchain image.
    pub fn new(device: Device) -> VulkanResult<Self> {
        Ok(Self {
            render_finished: Semaphore::new(device)?,
        })
    }

    /// Build one slot per swapchain image.
    pub fn for_swapchain(device: &Device, image_count: usize) -> VulkanResult<Vec<Self>> {
        (0..image_count)
            .map(|_| Self::new(device.clone()))
            .collect()
    }
}

/// Outcome of one scheduler iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was submitted and presented.
    Presented,
    /// The swapchain must be recreated before the next useful frame.
    /// The acquired image (if any) has already been consumed.
    RecreateNeeded,
    /// The iteration was skipped (fence timeout); try again.
    Skipped,
}

/// Borrowed inputs for one scheduler iteration.
pub struct FrameInputs<'a> {
    /// Vulkan context.
    pub context: &'a VulkanContext,
    /// Current swapchain.
    pub swapchain: &'a SwapchainContext,
    /// All frame slots.
    pub frames: &'a [FrameSlot],
    /// Per-image slots for the current swapchain.
    pub image_slots: &'a [ImageSlot],
    /// Current pipelines.
    pub pipelines: &'a PipelineSet,
    /// Quad descriptor sets.
    pub descriptors: &'a QuadDescriptors,
    /// Mesh slot table.
    pub meshes: &'a MeshTable,
    /// This frame's clear color.
    pub clear_color: [f32; 4],
    /// Quad commands appended this frame (clamped to `MAX_QUADS` here).
    pub quads: &'a [QuadCommand],
    /// Mesh commands appended this frame.
    pub mesh_commands: &'a [MeshCommand],
    /// View matrix.
    pub view: Mat4,
    /// Projection matrix.
    pub projection: Mat4,
}

/// The acquire/wait/record/submit/present state machine.
pub struct FrameScheduler {
    current_frame: usize,
    acquire_suboptimal: bool,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    /// Start at frame slot 0 with no pending suboptimal signal.
    pub fn new() -> Self {
        Self {
            current_frame: 0,
            acquire_suboptimal: false,
        }
    }

    /// The frame slot the next iteration will use.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Advance to the next frame slot (round-robin).
    fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
    }

    /// Run one full frame. Recoverable swapchain obsolescence returns
    /// `Ok(RecreateNeeded)`; device loss and recording failures are `Err`.
    pub fn run_frame(&mut self, inputs: &FrameInputs) -> VulkanResult<FrameStatus> {
        let frame = &inputs.frames[self.current_frame];
        let device = &inputs.context.device.device;

        // WAIT_FENCE: the GPU is done with this slot's SSBO and command
        // buffer after this returns.
        match frame.in_flight.wait() {
            Ok(()) => {}
            Err(VulkanError::Api(vk::Result::TIMEOUT)) => return Ok(FrameStatus::Skipped),
            Err(e) => return Err(e),
        }

        // COPY_UPLOAD: safe now that the fence has signaled.
        let quad_count = inputs.quads.len().min(MAX_QUADS);
        if quad_count > 0 {
            frame.quad_ssbo.write_slice(&inputs.quads[..quad_count]);
        }

        // ACQUIRE. SUBOPTIMAL is remembered and handled after present so
        // the acquired image is still consumed.
        let acquire = unsafe {
            inputs.swapchain.loader().acquire_next_image(
                inputs.swapchain.handle(),
                u64::MAX,
                frame.image_available.handle(),
                vk::Fence::null(),
            )
        };
        let image_index = match acquire {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.acquire_suboptimal = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(FrameStatus::RecreateNeeded),
            Err(e) => return Err(VulkanError::from_vk(e)),
        };

        // RESET_CMD + RECORD.
        let cb = frame.primary_command_buffer();
        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::from_vk)?;
        }
        let record_info = FrameRecordInfo {
            command_buffer: cb,
            image: inputs.swapchain.images()[image_index as usize],
            image_view: inputs.swapchain.image_views()[image_index as usize],
            depth_image: inputs.swapchain.depth_image(),
            depth_view: inputs.swapchain.depth_view(),
            extent: inputs.swapchain.extent(),
            pipelines: inputs.pipelines,
            quad_descriptor_set: inputs.descriptors.set(self.current_frame),
            meshes: inputs.meshes,
            clear_color: inputs.clear_color,
            quad_count: quad_count as u32,
            mesh_commands: inputs.mesh_commands,
            view: inputs.view,
            projection: inputs.projection,
        };
        record_frame(inputs.context, &record_info)?;

        // RESET_FENCE only after acquire and record both succeeded: a
        // failed acquire must not leave the fence unsignaled with no
        // submission coming to re-signal it.
        frame.in_flight.reset()?;

        // SUBMIT.
        let render_finished = inputs.image_slots[image_index as usize].render_finished.handle();
        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cb];
        let signal_semaphores = [render_finished];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            device
                .queue_submit(
                    inputs.context.device.graphics_queue,
                    &[submit],
                    frame.in_flight.handle(),
                )
                .map_err(VulkanError::from_vk)?;
        }

        // PRESENT, waiting on the image's own render-finished semaphore.
        let swapchains = [inputs.swapchain.handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let present = unsafe {
            inputs
                .swapchain
                .loader()
                .queue_present(inputs.context.device.present_queue, &present_info)
        };

        let present_stale = match present {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(VulkanError::from_vk(e)),
        };
        let recreate = present_stale || std::mem::take(&mut self.acquire_suboptimal);

        // ADVANCE happens whether or not a recreate follows: the image was
        // consumed and this slot's fence is in flight.
        self.advance();

        if recreate {
            Ok(FrameStatus::RecreateNeeded)
        } else {
            Ok(FrameStatus::Presented)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_advances_round_robin() {
        let mut scheduler = FrameScheduler::new();
        assert_eq!(scheduler.current_frame(), 0);
        scheduler.advance();
        assert_eq!(scheduler.current_frame(), 1);
        scheduler.advance();
        assert_eq!(scheduler.current_frame(), 0);
    }

    #[test]
    fn suboptimal_flag_starts_clear() {
        let scheduler = FrameScheduler::new();
        assert!(!scheduler.acquire_suboptimal);
    }
}
