//! Headless frame capture: render normally, blit the swapchain image into
//! a staging buffer, and write each frame as a 32-bpp top-down BMP.
//!
//! Single-threaded by construction: no lane runtime, no hot reload, no
//! input, and a simulated delta of 1/60s per frame. Per frame the normal
//! record path runs into the frame's command buffer, a second command
//! buffer does PRESENT_SRC -> TRANSFER_SRC -> copy -> PRESENT_SRC, both
//! are submitted together so the frame fence covers both, and present
//! only happens after the staging buffer has been read back.

use std::io::Write;
use std::path::Path;

use ash::vk;

use crate::engine::{Engine, EngineError};
use crate::foundation::math::{look_at, perspective_vk};
use crate::hotload::ModuleHost;
use crate::render::buffer::MappedBuffer;
use crate::render::recorder::{record_frame, FrameRecordInfo};
use crate::render::{VulkanError, MAX_FRAMES_IN_FLIGHT};

/// Simulated per-frame delta in headless mode.
const HEADLESS_DT: f32 = 1.0 / 60.0;

/// Render `frame_count` frames and write `frame_0000.bmp`... under
/// `output_dir`.
pub fn run_headless(
    engine: &mut Engine,
    host: &ModuleHost,
    frame_count: u32,
    output_dir: &Path,
) -> Result<(), EngineError> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| EngineError::Capture(format!("create {:?}: {}", output_dir, e)))?;

    let mut exporter = Exporter::new(engine)?;

    let mut frame = 0u32;
    while frame < frame_count {
        engine.timer.set_fixed_delta(HEADLESS_DT);
        engine.arenas.frame.reset();
        engine.commands.begin_frame();
        host.update(engine);

        match exporter.capture_frame(engine)? {
            CaptureOutcome::Written {
                pixels,
                extent,
                stale,
            } => {
                let path = output_dir.join(format!("frame_{:04}.bmp", frame));
                write_bmp(&path, extent.width, extent.height, &pixels)
                    .map_err(|e| EngineError::Capture(format!("write {:?}: {}", path, e)))?;
                log::info!("wrote {:?}", path);
                frame += 1;
                // A suboptimal acquire or stale present still produced a
                // usable frame; rebuild before the next one.
                if stale {
                    if !engine.recreate_swapchain()? {
                        break;
                    }
                    exporter.rebuild_staging(engine)?;
                }
            }
            CaptureOutcome::SwapchainStale => {
                // Extent changed before the image was captured; rebuild
                // and retry this frame.
                if !engine.recreate_swapchain()? {
                    break;
                }
                exporter.rebuild_staging(engine)?;
            }
        }
    }
    Ok(())
}

enum CaptureOutcome {
    /// The frame was captured; `stale` asks for a recreation before the
    /// next one (suboptimal acquire or stale present).
    Written {
        pixels: Vec<u8>,
        extent: vk::Extent2D,
        stale: bool,
    },
    /// Nothing was captured; recreate and retry.
    SwapchainStale,
}

/// Capture staging buffer plus one capture command buffer per frame slot.
struct Exporter {
    staging: MappedBuffer,
    capture_cbs: Vec<vk::CommandBuffer>,
    current_frame: usize,
    acquire_suboptimal: bool,
}

impl Exporter {
    fn new(engine: &Engine) -> Result<Self, EngineError> {
        let swapchain = engine
            .swapchain
            .as_ref()
            .ok_or_else(|| EngineError::Capture("swapchain absent".to_string()))?;
        if !swapchain.supports_transfer_src() {
            return Err(EngineError::Capture(
                "surface does not support TRANSFER_SRC".to_string(),
            ));
        }

        let staging = Self::staging_for(engine, swapchain.extent())?;

        let mut capture_cbs = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for frame in &engine.frames {
            let cb = frame.command_pools[0]
                .allocate_primary()
                .map_err(EngineError::Vulkan)?;
            capture_cbs.push(cb);
        }

        Ok(Self {
            staging,
            capture_cbs,
            current_frame: 0,
            acquire_suboptimal: false,
        })
    }

    /// Re-size the staging buffer after a swapchain recreation. The
    /// capture command buffers live in the frame pools and are kept.
    fn rebuild_staging(&mut self, engine: &Engine) -> Result<(), EngineError> {
        let swapchain = engine
            .swapchain
            .as_ref()
            .ok_or_else(|| EngineError::Capture("swapchain absent".to_string()))?;
        if !swapchain.supports_transfer_src() {
            return Err(EngineError::Capture(
                "surface does not support TRANSFER_SRC".to_string(),
            ));
        }
        self.staging = Self::staging_for(engine, swapchain.extent())?;
        // The recreation this accompanies resolves any pending signal.
        self.acquire_suboptimal = false;
        Ok(())
    }

    fn staging_for(engine: &Engine, extent: vk::Extent2D) -> Result<MappedBuffer, EngineError> {
        let size = (extent.width as vk::DeviceSize) * (extent.height as vk::DeviceSize) * 4;
        MappedBuffer::new(
            engine.context.raw_device(),
            &engine.context.memory_properties(),
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
        )
        .map_err(EngineError::Vulkan)
    }

    /// Render + capture one frame. Returns the BGRA bytes on success.
    fn capture_frame(&mut self, engine: &mut Engine) -> Result<CaptureOutcome, EngineError> {
        let swapchain = engine
            .swapchain
            .as_ref()
            .ok_or_else(|| EngineError::Capture("swapchain absent".to_string()))?;
        let device = &engine.context.device.device;
        let extent = swapchain.extent();
        let frame = &engine.frames[self.current_frame];

        frame.in_flight.wait().map_err(EngineError::Vulkan)?;

        let quad_count = engine.commands.quads.len().min(crate::api::MAX_QUADS);
        if quad_count > 0 {
            frame
                .quad_ssbo
                .write_slice(&engine.commands.quads[..quad_count]);
        }

        let acquire = unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.handle(),
                u64::MAX,
                frame.image_available.handle(),
                vk::Fence::null(),
            )
        };
        // SUBOPTIMAL is remembered and folded in after present, same as
        // the windowed scheduler, so the acquired image is still consumed.
        let image_index = match acquire {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.acquire_suboptimal = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(CaptureOutcome::SwapchainStale),
            Err(e) => return Err(EngineError::Vulkan(VulkanError::from_vk(e))),
        };
        let image = swapchain.images()[image_index as usize];

        // Normal record path into the frame's command buffer.
        let cb = frame.primary_command_buffer();
        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::from_vk)
                .map_err(EngineError::Vulkan)?;
        }
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let record_info = FrameRecordInfo {
            command_buffer: cb,
            image,
            image_view: swapchain.image_views()[image_index as usize],
            depth_image: swapchain.depth_image(),
            depth_view: swapchain.depth_view(),
            extent,
            pipelines: &engine.pipelines,
            quad_descriptor_set: engine.descriptors.set(self.current_frame),
            meshes: &engine.meshes,
            clear_color: engine.commands.clear_color,
            quad_count: quad_count as u32,
            mesh_commands: &engine.commands.meshes,
            view: look_at(engine.camera.eye, engine.camera.target),
            projection: perspective_vk(aspect),
        };
        record_frame(&engine.context, &record_info).map_err(EngineError::Vulkan)?;

        // Second command buffer: readback.
        let capture_cb = self.capture_cbs[self.current_frame];
        self.record_capture(engine, capture_cb, image, extent)
            .map_err(EngineError::Vulkan)?;

        frame.in_flight.reset().map_err(EngineError::Vulkan)?;

        // One submit covers both command buffers, so the fence does too.
        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cb, capture_cb];
        let render_finished = engine.image_slots[image_index as usize]
            .render_finished
            .handle();
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
                    engine.context.device.graphics_queue,
                    &[submit],
                    frame.in_flight.handle(),
                )
                .map_err(VulkanError::from_vk)
                .map_err(EngineError::Vulkan)?;
        }

        frame.in_flight.wait().map_err(EngineError::Vulkan)?;

        let mut pixels = vec![0u8; (extent.width * extent.height * 4) as usize];
        self.staging.read(&mut pixels);

        // Present to hand the image back to the swapchain.
        let swapchains = [swapchain.handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let present = unsafe {
            swapchain
                .loader()
                .queue_present(engine.context.device.present_queue, &present_info)
        };
        // The staging buffer was already read, so even a stale present
        // yields a written frame; the recreate happens before the next.
        let present_stale = match present {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(EngineError::Vulkan(VulkanError::from_vk(e))),
        };
        let stale = present_stale || std::mem::take(&mut self.acquire_suboptimal);

        self.advance();
        Ok(CaptureOutcome::Written {
            pixels,
            extent,
            stale,
        })
    }

    fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
    }

    /// PRESENT_SRC -> TRANSFER_SRC, copy into the staging buffer, back to
    /// PRESENT_SRC.
    fn record_capture(
        &self,
        engine: &Engine,
        cb: vk::CommandBuffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) -> Result<(), VulkanError> {
        let device = &engine.context.device.device;
        let commands = &engine.context.device.commands;

        unsafe {
            device
                .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::from_vk)?;
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cb, &begin_info)
                .map_err(VulkanError::Record)?;

            transition(
                commands,
                device,
                cb,
                image,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::empty(),
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();
            device.cmd_copy_image_to_buffer(
                cb,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.staging.handle(),
                &[region],
            );

            transition(
                commands,
                device,
                cb,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::empty(),
            );

            device.end_command_buffer(cb).map_err(VulkanError::Record)?;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn transition(
    commands: &crate::render::RenderCommands,
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
) {
    let barrier = vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();
    let barriers = [barrier];
    let dependency = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
    commands.pipeline_barrier2(device, cb, &dependency);
}

/// 54-byte BMP header length (BITMAPFILEHEADER + BITMAPINFOHEADER).
pub const BMP_HEADER_LEN: usize = 54;

/// Write a 32-bpp top-down BMP: 54-byte header, then BGRA rows verbatim.
pub fn write_bmp(path: &Path, width: u32, height: u32, bgra: &[u8]) -> std::io::Result<()> {
    let data_len = (width * height * 4) as usize;
    debug_assert_eq!(bgra.len(), data_len);

    let mut header = [0u8; BMP_HEADER_LEN];
    header[0] = b'B';
    header[1] = b'M';
    header[2..6].copy_from_slice(&((BMP_HEADER_LEN + data_len) as u32).to_le_bytes());
    // 6..10 reserved, zero.
    header[10..14].copy_from_slice(&(BMP_HEADER_LEN as u32).to_le_bytes());
    header[14..18].copy_from_slice(&40u32.to_le_bytes()); // BITMAPINFOHEADER size
    header[18..22].copy_from_slice(&(width as i32).to_le_bytes());
    // Negative height marks a top-down pixel order.
    header[22..26].copy_from_slice(&(-(height as i32)).to_le_bytes());
    header[26..28].copy_from_slice(&1u16.to_le_bytes()); // planes
    header[28..30].copy_from_slice(&32u16.to_le_bytes()); // bpp
    // 30..34 compression BI_RGB = 0.
    header[34..38].copy_from_slice(&(data_len as u32).to_le_bytes());
    // 38..46 pixels-per-meter (unset), 46..54 palette counts (unset).

    let mut file = std::fs::File::create(path)?;
    file.write_all(&header)?;
    file.write_all(&bgra[..data_len.min(bgra.len())])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_bmp(path: &Path) -> (u32, i32, Vec<u8>) {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(&bytes[0..2], b"BM");
        let offset = u32::from_le_bytes(bytes[10..14].try_into().unwrap()) as usize;
        let width = u32::from_le_bytes(bytes[18..22].try_into().unwrap());
        let height = i32::from_le_bytes(bytes[22..26].try_into().unwrap());
        (width, height, bytes[offset..].to_vec())
    }

    #[test]
    fn bmp_round_trips_the_staging_bytes() {
        let width = 3u32;
        let height = 2u32;
        let bgra: Vec<u8> = (0..width * height * 4).map(|i| i as u8).collect();
        let path = std::env::temp_dir().join(format!("kiln_bmp_{}.bmp", std::process::id()));

        write_bmp(&path, width, height, &bgra).unwrap();
        let (w, h, pixels) = read_bmp(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(w, width);
        assert_eq!(h, -(height as i32), "negative height = top-down");
        assert_eq!(pixels, bgra);
    }

    #[test]
    fn bmp_header_is_54_bytes_and_sizes_match() {
        let width = 4u32;
        let height = 4u32;
        let bgra = vec![0u8; (width * height * 4) as usize];
        let path = std::env::temp_dir().join(format!("kiln_bmp_hdr_{}.bmp", std::process::id()));

        write_bmp(&path, width, height, &bgra).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(bytes.len(), BMP_HEADER_LEN + bgra.len());
        let file_size = u32::from_le_bytes(bytes[2..6].try_into().unwrap()) as usize;
        assert_eq!(file_size, bytes.len());
        let bpp = u16::from_le_bytes(bytes[28..30].try_into().unwrap());
        assert_eq!(bpp, 32);
        let compression = u32::from_le_bytes(bytes[30..34].try_into().unwrap());
        assert_eq!(compression, 0);
    }
}
