//! Engine composition: ordered bring-up, the per-frame draw path, and
//! reverse-order teardown.
//!
//! Field order in [`Engine`] is load-bearing: Rust drops fields in
//! declaration order, so every Vulkan child sits before the context and
//! the window sits after it (the surface must be destroyed before the
//! window goes away). `Drop` waits for the device to go idle before any
//! handle is destroyed.

use ash::vk;
use thiserror::Error;

use crate::api::{Camera, FrameCommands};
use crate::config::EngineConfig;
use crate::foundation::arena::EngineArenas;
use crate::foundation::lanes::MAX_LANES;
use crate::foundation::math::{look_at, perspective_vk};
use crate::foundation::time::Timer;
use crate::hotload::ModuleError;
use crate::mesh::{decode_gltf, unit_cube, upload_mesh, MeshError, MeshTable};
use crate::render::frame::{CommandPool, FrameInputs, FrameScheduler, FrameSlot, ImageSlot};
use crate::render::pipeline::{PipelineSet, QuadDescriptors};
use crate::render::swapchain::SwapchainContext;
use crate::render::window::{Window, WindowError};
use crate::render::{FrameStatus, VulkanContext, VulkanError, VulkanResult, MAX_FRAMES_IN_FLIGHT};

/// Top-level engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bring-up failed; cleanup still runs via drops.
    #[error("initialization failed: {0}")]
    Init(String),

    /// A Vulkan-layer failure.
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    /// A windowing failure.
    #[error(transparent)]
    Window(#[from] WindowError),

    /// A module host failure (fatal only at initial load).
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Headless capture failure.
    #[error("headless capture failed: {0}")]
    Capture(String),
}

/// The engine: every Vulkan handle it creates, the per-frame host state,
/// and the arenas.
pub struct Engine {
    // Vulkan children; dropped before the context.
    pub(crate) frames: Vec<FrameSlot>,
    pub(crate) image_slots: Vec<ImageSlot>,
    pub(crate) pipelines: PipelineSet,
    pub(crate) descriptors: QuadDescriptors,
    pub(crate) meshes: MeshTable,
    pub(crate) upload_pool: CommandPool,
    pub(crate) swapchain: Option<SwapchainContext>,
    // Device, queues, instance.
    pub(crate) context: VulkanContext,
    // The window outlives the surface (dropped after the context).
    pub(crate) window: Window,
    // Host-side state.
    pub(crate) arenas: EngineArenas,
    pub(crate) commands: FrameCommands,
    pub(crate) camera: Camera,
    pub(crate) timer: Timer,
    pub(crate) scheduler: FrameScheduler,
    pub(crate) allow_mesh_load: bool,
    headless: bool,
    config: EngineConfig,
}

impl Engine {
    /// Ordered bring-up. Any failure drops the partially built state in
    /// reverse order.
    pub fn new(config: EngineConfig, headless: bool) -> Result<Self, EngineError> {
        let arenas = EngineArenas::new()
            .map_err(|e| EngineError::Init(format!("arena reserve: {}", e)))?;

        let mut window = Window::new(
            &config.window.title,
            config.window.width,
            config.window.height,
        )?;

        let context = VulkanContext::new(&mut window, &config.window.title, config.renderer.validation)?;

        let (fb_width, fb_height) = window.framebuffer_size();
        let swapchain = SwapchainContext::new(
            &context,
            vk::Extent2D {
                width: fb_width,
                height: fb_height,
            },
            vk::SwapchainKHR::null(),
        )?;

        let descriptors = QuadDescriptors::new(context.raw_device(), MAX_FRAMES_IN_FLIGHT)?;
        let pipelines = PipelineSet::new(
            context.raw_device(),
            swapchain.format().format,
            descriptors.set_layout(),
        )?;

        let memory_properties = context.memory_properties();
        let mut frames = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for index in 0..MAX_FRAMES_IN_FLIGHT {
            let frame = FrameSlot::new(
                context.raw_device(),
                &memory_properties,
                context.device.graphics_family,
                MAX_LANES,
            )?;
            descriptors.bind_ssbo(index, frame.quad_ssbo.handle());
            frames.push(frame);
        }

        let image_slots =
            ImageSlot::for_swapchain(&context.raw_device(), swapchain.image_count())?;

        // One-time uploads get their own transient pool rather than
        // borrowing a frame slot's.
        let upload_pool = CommandPool::new(context.raw_device(), context.device.graphics_family)?;

        let mut meshes = MeshTable::new();
        let (cube_vertices, cube_indices) = unit_cube();
        let cube = upload_mesh(&context, &upload_pool, &cube_vertices, &cube_indices)
            .map_err(|e| EngineError::Init(format!("cube upload: {}", e)))?;
        let cube_handle = meshes
            .register(cube)
            .map_err(|e| EngineError::Init(e.to_string()))?;
        if cube_handle != 0 {
            return Err(EngineError::Init("cube must own slot 0".to_string()));
        }

        log::info!("engine initialized");

        Ok(Self {
            frames,
            image_slots,
            pipelines,
            descriptors,
            meshes,
            upload_pool,
            swapchain: Some(swapchain),
            context,
            window,
            arenas,
            commands: FrameCommands::default(),
            camera: Camera::default(),
            timer: Timer::new(),
            scheduler: FrameScheduler::new(),
            allow_mesh_load: false,
            headless,
            config,
        })
    }

    /// Whether this engine runs the headless capture branch.
    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one scheduler iteration over the current frame's commands.
    pub fn draw_frame(&mut self) -> VulkanResult<FrameStatus> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| VulkanError::InitializationFailed("swapchain absent".to_string()))?;
        let extent = swapchain.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;

        let inputs = FrameInputs {
            context: &self.context,
            swapchain,
            frames: &self.frames,
            image_slots: &self.image_slots,
            pipelines: &self.pipelines,
            descriptors: &self.descriptors,
            meshes: &self.meshes,
            clear_color: self.commands.clear_color,
            quads: &self.commands.quads,
            mesh_commands: &self.commands.meshes,
            view: look_at(self.camera.eye, self.camera.target),
            projection: perspective_vk(aspect),
        };
        self.scheduler.run_frame(&inputs)
    }

    /// Recreate the swapchain and everything keyed to it: the per-image
    /// semaphores and both pipelines (their color format follows the
    /// swapchain). Blocks while the framebuffer is zero-sized. Returns
    /// `false` if the window is closing and recreation was abandoned.
    pub fn recreate_swapchain(&mut self) -> VulkanResult<bool> {
        loop {
            let (width, height) = self.window.framebuffer_size();
            if width > 0 && height > 0 {
                break;
            }
            if self.window.should_close() {
                return Ok(false);
            }
            self.window.wait_events();
        }

        self.context.wait_idle()?;
        self.swapchain = None;
        self.arenas.swapchain.reset();

        let (width, height) = self.window.framebuffer_size();
        let swapchain = SwapchainContext::new(
            &self.context,
            vk::Extent2D { width, height },
            vk::SwapchainKHR::null(),
        )?;

        self.image_slots =
            ImageSlot::for_swapchain(&self.context.raw_device(), swapchain.image_count())?;
        self.pipelines = PipelineSet::new(
            self.context.raw_device(),
            swapchain.format().format,
            self.descriptors.set_layout(),
        )?;
        self.swapchain = Some(swapchain);
        Ok(true)
    }

    /// Register a glTF mesh. Only honored while the module's `load` call
    /// is running; any other time returns the cube handle with a warning.
    pub fn load_mesh_from_path(&mut self, path: &str) -> u32 {
        if !self.allow_mesh_load {
            log::warn!(
                "load_mesh({:?}) outside the module load call; returning the cube",
                path
            );
            return 0;
        }
        match self.try_load_mesh(path) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("load_mesh({:?}) failed: {}; returning the cube", path, e);
                0
            }
        }
    }

    fn try_load_mesh(&mut self, path: &str) -> Result<u32, MeshError> {
        let bytes =
            std::fs::read(path).map_err(|e| MeshError::Io(path.to_string(), e))?;
        // Stage the file through the frame arena; if the arena is
        // exhausted the Vec serves as-is.
        let staged = self.arenas.frame.copy_bytes(&bytes);
        let payload: &[u8] = if staged.len() == bytes.len() {
            staged
        } else {
            &bytes
        };
        let (vertices, indices) = decode_gltf(payload)?;
        let mesh = upload_mesh(&self.context, &self.upload_pool, &vertices, &indices)?;
        let handle = self.meshes.register(mesh)?;
        log::info!(
            "mesh {:?} loaded into slot {} ({} vertices, {} indices)",
            path,
            handle,
            vertices.len(),
            indices.len()
        );
        Ok(handle)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // No handle may be destroyed while the GPU is using it.
        let _ = self.context.wait_idle();
        log::info!("engine shutdown");
        // Fields drop in declaration order: frame slots, image slots,
        // pipelines, descriptors, meshes, pools, swapchain, then the
        // context (device before instance), then the window.
    }
}
