//! The Vulkan rendering stack: context, buffers, swapchain, pipelines,
//! the frame recorder, and the frame scheduler.

pub mod buffer;
pub mod context;
pub mod frame;
pub mod pipeline;
pub mod recorder;
pub mod swapchain;
pub mod window;

use ash::vk;
use thiserror::Error;

pub use buffer::{Buffer, DepthImage, MappedBuffer};
pub use context::{LogicalDevice, PhysicalDeviceInfo, RenderCommands, VulkanContext, VulkanInstance};
pub use frame::{FrameScheduler, FrameSlot, FrameStatus, ImageSlot, MAX_FRAMES_IN_FLIGHT};
pub use pipeline::{GraphicsPipeline, PipelineSet, QuadDescriptors, ShaderModule};
pub use recorder::{record_frame, FrameRecordInfo};
pub use swapchain::SwapchainContext;
pub use window::{Window, WindowError};

/// Vulkan-layer error type.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// A Vulkan entry point returned an error code.
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The device was lost; the frame loop must exit.
    #[error("device lost")]
    DeviceLost,

    /// A failure during context/swapchain/pipeline bring-up.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Buffer or image memory could not be allocated.
    #[error("GPU allocation failed: {0}")]
    GpuAlloc(String),

    /// Command-buffer recording failed; non-recoverable for the frame loop.
    #[error("command recording failed: {0:?}")]
    Record(vk::Result),

    /// No device memory type satisfies the requested properties.
    #[error("no suitable memory type found")]
    NoSuitableMemoryType,
}

impl VulkanError {
    /// Map a raw result, promoting `ERROR_DEVICE_LOST` to its own variant.
    pub fn from_vk(result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            VulkanError::DeviceLost
        } else {
            VulkanError::Api(result)
        }
    }
}

/// Result type for Vulkan operations.
pub type VulkanResult<T> = Result<T, VulkanError>;
