//! Graphics pipelines and descriptors.
//!
//! Two pipelines, both using dynamic rendering (no render-pass objects):
//! the quad pipeline pulls per-instance data from an SSBO and has no
//! vertex input at all; the mesh pipeline consumes interleaved vertices
//! with depth testing and an 80-byte push-constant block (MVP + tint).
//! Both are rebuilt whenever the swapchain format changes.

use ash::{vk, Device};
use std::path::{Path, PathBuf};

use crate::api::{QuadCommand, MAX_QUADS};
use crate::mesh::MeshVertex;

use super::buffer::DEPTH_FORMAT;
use super::{VulkanError, VulkanResult};

/// Bytes of push-constant data for the mesh pipeline: mat4 MVP + vec4 tint.
pub const MESH_PUSH_SIZE: u32 = 80;

/// SPIR-V shader module wrapper.
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create from SPIR-V bytes.
    pub fn from_bytes(device: Device, bytes: &[u8]) -> VulkanResult<Self> {
        let (prefix, words, suffix) = unsafe { bytes.align_to::<u32>() };
        if !prefix.is_empty() || !suffix.is_empty() {
            return Err(VulkanError::InitializationFailed(
                "SPIR-V bytecode is not 4-byte aligned".to_string(),
            ));
        }
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        let module = unsafe {
            device
                .create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        Ok(Self { device, module })
    }

    /// Load a compiled shader by file name, resolving across the usual
    /// shader output directories.
    pub fn load(device: Device, file_name: &str) -> VulkanResult<Self> {
        let path = resolve_shader_path(file_name)?;
        let bytes = std::fs::read(&path).map_err(|e| {
            VulkanError::InitializationFailed(format!("read shader {:?}: {}", path, e))
        })?;
        Self::from_bytes(device, &bytes)
    }

    /// Module handle.
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Try the common shader locations, working-directory and exe-relative.
fn resolve_shader_path(file_name: &str) -> VulkanResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = ["target/shaders", "shaders", "resources/shaders"]
        .iter()
        .map(|dir| Path::new(dir).join(file_name))
        .collect();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            candidates.push(exe_dir.join("shaders").join(file_name));
            candidates.push(exe_dir.join("../shaders").join(file_name));
        }
    }
    candidates
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| {
            VulkanError::InitializationFailed(format!(
                "shader {} not found (run with the Vulkan SDK so build.rs can compile it)",
                file_name
            ))
        })
}

/// Pipeline + layout pair with RAII cleanup.
pub struct GraphicsPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout (for descriptor binds and push constants).
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Descriptor set layout, pool, and the per-frame sets for the quad SSBO.
///
/// Sets are allocated once at init and statically bound to their frame's
/// buffer; they survive swapchain recreation.
pub struct QuadDescriptors {
    device: Device,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
}

impl QuadDescriptors {
    /// Create the layout (one STORAGE_BUFFER binding visible to the
    /// vertex stage) and allocate one set per frame slot.
    pub fn new(device: Device, frame_count: usize) -> VulkanResult<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build()];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: frame_count as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(frame_count as u32)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let layouts = vec![set_layout; frame_count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets,
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(VulkanError::Api(e));
            }
        };

        Ok(Self {
            device,
            set_layout,
            pool,
            sets,
        })
    }

    /// Point frame `frame`'s set at its SSBO. Done once at init.
    pub fn bind_ssbo(&self, frame: usize, buffer: vk::Buffer) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range: (MAX_QUADS * std::mem::size_of::<QuadCommand>()) as vk::DeviceSize,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[frame])
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
    }

    /// Set layout for pipeline creation.
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    /// Frame `frame`'s descriptor set.
    pub fn set(&self, frame: usize) -> vk::DescriptorSet {
        self.sets[frame]
    }
}

impl Drop for QuadDescriptors {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Both graphics pipelines, built against the current swapchain format.
pub struct PipelineSet {
    /// Bindless quad pipeline (SSBO, no vertex input, no depth).
    pub quad: GraphicsPipeline,
    /// Mesh pipeline (vertex input, depth test, push constants).
    pub mesh: GraphicsPipeline,
}

impl PipelineSet {
    /// Build (or rebuild) both pipelines for `color_format`.
    pub fn new(
        device: Device,
        color_format: vk::Format,
        quad_set_layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<Self> {
        let quad = build_quad_pipeline(device.clone(), color_format, quad_set_layout)?;
        let mesh = build_mesh_pipeline(device, color_format)?;
        log::debug!("pipelines built for {:?}", color_format);
        Ok(Self { quad, mesh })
    }
}

const SHADER_ENTRY: &std::ffi::CStr =
    unsafe { std::ffi::CStr::from_bytes_with_nul_unchecked(b"main\0") };

fn build_quad_pipeline(
    device: Device,
    color_format: vk::Format,
    set_layout: vk::DescriptorSetLayout,
) -> VulkanResult<GraphicsPipeline> {
    let vert = ShaderModule::load(device.clone(), "quad.vert.spv")?;
    let frag = ShaderModule::load(device.clone(), "quad.frag.spv")?;

    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert.handle())
            .name(SHADER_ENTRY)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag.handle())
            .name(SHADER_ENTRY)
            .build(),
    ];

    // All quad data comes from the SSBO; no vertex input state at all.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let layout = unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(VulkanError::Api)?
    };

    let color_formats = [color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&color_formats);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let pipeline = match unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    } {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(VulkanError::Api(e));
        }
    };

    Ok(GraphicsPipeline {
        device,
        pipeline,
        layout,
    })
}

fn build_mesh_pipeline(device: Device, color_format: vk::Format) -> VulkanResult<GraphicsPipeline> {
    let vert = ShaderModule::load(device.clone(), "mesh.vert.spv")?;
    let frag = ShaderModule::load(device.clone(), "mesh.frag.spv")?;

    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert.handle())
            .name(SHADER_ENTRY)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag.handle())
            .name(SHADER_ENTRY)
            .build(),
    ];

    let bindings = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<MeshVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 12,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: 24,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS);
    let attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let push_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: MESH_PUSH_SIZE,
    }];
    let layout_info = vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&push_ranges);
    let layout = unsafe {
        device
            .create_pipeline_layout(&layout_info, None)
            .map_err(VulkanError::Api)?
    };

    let color_formats = [color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(DEPTH_FORMAT);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let pipeline = match unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    } {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(VulkanError::Api(e));
        }
    };

    Ok(GraphicsPipeline {
        device,
        pipeline,
        layout,
    })
}
