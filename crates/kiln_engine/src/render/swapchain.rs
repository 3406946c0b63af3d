//! Swapchain creation and recreation, including the depth attachment.
//!
//! The context is recreated atomically: the caller waits for the device to
//! go idle, drops the old value, resets the swapchain arena, and builds a
//! new one. Consumers index the image list by the index returned from
//! acquire and never hold references across a recreation.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use super::buffer::DepthImage;
use super::context::VulkanContext;
use super::{VulkanError, VulkanResult};

/// Swapchain, its images and views, and the depth attachment.
pub struct SwapchainContext {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    /// TRANSFER_SRC was supported and enabled (headless capture needs it).
    supports_transfer_src: bool,
    depth: DepthImage,
}

impl SwapchainContext {
    /// Create a swapchain for the current surface state. `old_swapchain`
    /// is passed through on recreation and may be null.
    pub fn new(
        context: &VulkanContext,
        window_extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let physical = context.physical.device;
        let surface = context.surface;
        let surface_loader = &context.surface_loader;

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(physical, surface)
                .map_err(VulkanError::Api)?
        };
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(physical, surface)
                .map_err(VulkanError::Api)?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(physical, surface)
                .map_err(VulkanError::Api)?
        };

        let supports_transfer_src = caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_SRC);
        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if supports_transfer_src {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }

        let format = choose_format(context, &formats, usage)?;
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: window_extent
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: window_extent
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let mut min_image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            min_image_count = min_image_count.min(caps.max_image_count);
        }

        let graphics_family = context.device.graphics_family;
        let present_family = context.device.present_family;
        let queue_families = [graphics_family, present_family];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(min_image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if graphics_family != present_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let loader = context.device.swapchain_loader.clone();
        let device = context.raw_device();
        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = unsafe {
            loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)?
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => view,
                Err(e) => {
                    unsafe {
                        for &view in &image_views {
                            device.destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(VulkanError::Api(e));
                }
            };
            image_views.push(view);
        }

        let depth = match DepthImage::new(device.clone(), &context.memory_properties(), extent) {
            Ok(depth) => depth,
            Err(e) => {
                unsafe {
                    for &view in &image_views {
                        device.destroy_image_view(view, None);
                    }
                    loader.destroy_swapchain(swapchain, None);
                }
                return Err(e);
            }
        };

        log::info!(
            "swapchain: {:?} {}x{} x{} images, present {:?}{}",
            format.format,
            extent.width,
            extent.height,
            images.len(),
            present_mode,
            if supports_transfer_src { ", transfer-src" } else { "" },
        );

        Ok(Self {
            device,
            loader,
            swapchain,
            images,
            image_views,
            format,
            extent,
            supports_transfer_src,
            depth,
        })
    }

    /// Swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Loader for acquire/present.
    pub fn loader(&self) -> &SwapchainLoader {
        &self.loader
    }

    /// Images, indexed by acquire's `image_index`.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Views matching [`Self::images`].
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Chosen surface format.
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Current extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Whether the images were created with TRANSFER_SRC usage.
    pub fn supports_transfer_src(&self) -> bool {
        self.supports_transfer_src
    }

    /// Depth attachment image.
    pub fn depth_image(&self) -> vk::Image {
        self.depth.image()
    }

    /// Depth attachment view.
    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.view()
    }
}

impl Drop for SwapchainContext {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        // The depth image drops itself.
    }
}

/// Ordered surface-format preference: sRGB BGRA, then UNORM BGRA, then the
/// first format the device can actually create images with for our usage.
fn choose_format(
    context: &VulkanContext,
    formats: &[vk::SurfaceFormatKHR],
    usage: vk::ImageUsageFlags,
) -> VulkanResult<vk::SurfaceFormatKHR> {
    if let Some(format) = formats.iter().find(|sf| {
        sf.format == vk::Format::B8G8R8A8_SRGB
            && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    }) {
        return Ok(*format);
    }
    if let Some(format) = formats.iter().find(|sf| {
        sf.format == vk::Format::B8G8R8A8_UNORM
            && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    }) {
        return Ok(*format);
    }
    for sf in formats {
        let supported = unsafe {
            context
                .instance
                .instance
                .get_physical_device_image_format_properties(
                    context.physical.device,
                    sf.format,
                    vk::ImageType::TYPE_2D,
                    vk::ImageTiling::OPTIMAL,
                    usage,
                    vk::ImageCreateFlags::empty(),
                )
        };
        if supported.is_ok() {
            return Ok(*sf);
        }
    }
    Err(VulkanError::InitializationFailed(
        "no usable surface format".to_string(),
    ))
}
