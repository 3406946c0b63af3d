//! Per-frame command recording.
//!
//! One primary command buffer per frame: layout barriers in, dynamic
//! rendering with the quad pass then the mesh pass, and the present
//! barrier out. Mesh commands are processed strictly in append order;
//! commands with out-of-range or unloaded handles record nothing.

use ash::vk;

use crate::api::MeshCommand;
use crate::foundation::math::Mat4;
use crate::mesh::MeshTable;

use super::context::{RenderCommands, VulkanContext};
use super::pipeline::{PipelineSet, MESH_PUSH_SIZE};
use super::{VulkanError, VulkanResult};

/// Push-constant block of the mesh pipeline; layout mirrors the shader.
#[repr(C)]
#[derive(Clone, Copy)]
struct MeshPush {
    mvp: [[f32; 4]; 4],
    tint: [f32; 4],
}

/// Everything one frame's recording needs.
pub struct FrameRecordInfo<'a> {
    /// Command buffer in the initial state (already reset).
    pub command_buffer: vk::CommandBuffer,
    /// Acquired swapchain image.
    pub image: vk::Image,
    /// View of the acquired image.
    pub image_view: vk::ImageView,
    /// Depth attachment image.
    pub depth_image: vk::Image,
    /// Depth attachment view.
    pub depth_view: vk::ImageView,
    /// Current swapchain extent.
    pub extent: vk::Extent2D,
    /// Quad and mesh pipelines.
    pub pipelines: &'a PipelineSet,
    /// The current frame's quad descriptor set.
    pub quad_descriptor_set: vk::DescriptorSet,
    /// Mesh slot table.
    pub meshes: &'a MeshTable,
    /// Clear color for the color attachment.
    pub clear_color: [f32; 4],
    /// Number of quad instances already copied into the frame's SSBO.
    pub quad_count: u32,
    /// Mesh commands in append order.
    pub mesh_commands: &'a [MeshCommand],
    /// View matrix.
    pub view: Mat4,
    /// Projection matrix.
    pub projection: Mat4,
}

/// Record the full frame into `info.command_buffer`.
pub fn record_frame(context: &VulkanContext, info: &FrameRecordInfo) -> VulkanResult<()> {
    let device = &context.device.device;
    let commands = &context.device.commands;
    let cb = info.command_buffer;

    unsafe {
        let begin_info = vk::CommandBufferBeginInfo::builder();
        device
            .begin_command_buffer(cb, &begin_info)
            .map_err(VulkanError::Record)?;

        // Swapchain image: UNDEFINED -> COLOR_ATTACHMENT_OPTIMAL.
        image_barrier(
            commands,
            device,
            cb,
            info.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::empty(),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        );

        // Depth image: UNDEFINED -> DEPTH_STENCIL_ATTACHMENT_OPTIMAL.
        image_barrier(
            commands,
            device,
            cb,
            info.depth_image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::empty(),
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(info.image_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: info.clear_color,
                },
            })
            .build();
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(info.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            })
            .build();
        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: info.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);
        commands.begin_rendering(device, cb, &rendering_info);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: info.extent.width as f32,
            height: info.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: info.extent,
        };
        device.cmd_set_viewport(cb, 0, &[viewport]);
        device.cmd_set_scissor(cb, 0, &[scissor]);

        if info.quad_count > 0 {
            device.cmd_bind_pipeline(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                info.pipelines.quad.handle(),
            );
            device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                info.pipelines.quad.layout(),
                0,
                &[info.quad_descriptor_set],
                &[],
            );
            device.cmd_draw(cb, 6, info.quad_count, 0, 0);
        }

        if !info.mesh_commands.is_empty() {
            record_mesh_draws(device, cb, info);
        }

        commands.end_rendering(device, cb);

        // Swapchain image: COLOR_ATTACHMENT_OPTIMAL -> PRESENT_SRC.
        image_barrier(
            commands,
            device,
            cb,
            info.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::empty(),
        );

        device.end_command_buffer(cb).map_err(VulkanError::Record)?;
    }

    Ok(())
}

unsafe fn record_mesh_draws(device: &ash::Device, cb: vk::CommandBuffer, info: &FrameRecordInfo) {
    device.cmd_bind_pipeline(
        cb,
        vk::PipelineBindPoint::GRAPHICS,
        info.pipelines.mesh.handle(),
    );

    let view_proj = info.projection * info.view;
    let mut bound_slot: Option<u32> = None;

    for command in info.mesh_commands {
        let mesh = match info.meshes.get(command.handle) {
            Some(mesh) => mesh,
            None => continue, // out-of-range or unloaded slot: no GPU work
        };

        if bound_slot != Some(command.handle) {
            device.cmd_bind_vertex_buffers(cb, 0, &[mesh.vertex_buffer.handle()], &[0]);
            device.cmd_bind_index_buffer(cb, mesh.index_buffer.handle(), 0, vk::IndexType::UINT32);
            bound_slot = Some(command.handle);
        }

        let model = Mat4::from_column_slice(&flatten(&command.model));
        let mvp = view_proj * model;
        let push = MeshPush {
            mvp: mvp.into(),
            tint: command.tint,
        };
        debug_assert_eq!(std::mem::size_of::<MeshPush>(), MESH_PUSH_SIZE as usize);
        let bytes = std::slice::from_raw_parts(
            &push as *const MeshPush as *const u8,
            std::mem::size_of::<MeshPush>(),
        );
        device.cmd_push_constants(
            cb,
            info.pipelines.mesh.layout(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            0,
            bytes,
        );
        device.cmd_draw_indexed(cb, mesh.index_count, 1, 0, 0, 0);
    }
}

fn flatten(m: &[[f32; 4]; 4]) -> [f32; 16] {
    let mut out = [0.0f32; 16];
    for (col, column) in m.iter().enumerate() {
        out[col * 4..col * 4 + 4].copy_from_slice(column);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_block_is_80_bytes() {
        assert_eq!(std::mem::size_of::<MeshPush>(), MESH_PUSH_SIZE as usize);
        let push = MeshPush {
            mvp: [[0.0; 4]; 4],
            tint: [0.0; 4],
        };
        let base = &push as *const MeshPush as usize;
        assert_eq!(&push.mvp as *const _ as usize - base, 0);
        assert_eq!(&push.tint as *const _ as usize - base, 64);
    }

    #[test]
    fn matrices_flatten_column_major() {
        let m = [
            [1.0, 2.0, 3.0, 4.0],
            [5.0, 6.0, 7.0, 8.0],
            [9.0, 10.0, 11.0, 12.0],
            [13.0, 14.0, 15.0, 16.0],
        ];
        let flat = flatten(&m);
        assert_eq!(flat[0..4], [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(flat[12..16], [13.0, 14.0, 15.0, 16.0]);
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn image_barrier(
    commands: &RenderCommands,
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
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
            aspect_mask: aspect,
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
