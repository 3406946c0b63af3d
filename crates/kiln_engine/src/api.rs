//! The engine API surface exposed to the game module, and the per-frame
//! command record those callbacks fill in.
//!
//! All callbacks run on lane 0, inside the module `update`/`load` call.
//! The trampolines cast the opaque context pointer back to the [`Engine`]
//! that built the table; the table is rebuilt for every module call and
//! must not be retained by the module.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

use kiln_abi::{EngineApi, API_VERSION};

use crate::engine::Engine;
use crate::foundation::math::Vec3;

/// Upper bound on quad instances per frame; commands beyond it are
/// dropped (and counted, for the once-per-frame warning).
pub const MAX_QUADS: usize = 4096;

/// One bindless quad instance; layout matches the shader-side SSBO entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadCommand {
    /// x, y, width, height in clip-space NDC, +y up.
    pub rect: [f32; 4],
    /// RGBA color.
    pub color: [f32; 4],
}

/// One mesh draw: a slot handle, a column-major model matrix, and a tint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshCommand {
    /// Index into the mesh table; slot 0 is the built-in cube.
    pub handle: u32,
    /// Column-major 4x4 model matrix, as uploaded.
    pub model: [[f32; 4]; 4],
    /// RGBA tint.
    pub tint: [f32; 4],
}

/// Camera state the module controls through `set_camera`.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    /// Eye position.
    pub eye: Vec3,
    /// Look-at target.
    pub target: Vec3,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 3.0, 6.0),
            target: Vec3::zeros(),
        }
    }
}

/// The per-frame command record, owned and mutated by lane 0 only:
/// cleared at the top of the frame, appended to by module callbacks,
/// copied to the SSBO, and handed to the recorder.
pub struct FrameCommands {
    /// Clear color for the color attachment.
    pub clear_color: [f32; 4],
    /// Quad draws in append order, capped at [`MAX_QUADS`].
    pub quads: Vec<QuadCommand>,
    /// Mesh draws in append order.
    pub meshes: Vec<MeshCommand>,
    /// Quads dropped this frame because the cap was hit.
    pub dropped_quads: usize,
}

impl Default for FrameCommands {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            quads: Vec::with_capacity(MAX_QUADS),
            meshes: Vec::new(),
            dropped_quads: 0,
        }
    }
}

impl FrameCommands {
    /// Reset for a new frame. Allocations are retained.
    pub fn begin_frame(&mut self) {
        self.clear_color = [0.0, 0.0, 0.0, 1.0];
        self.quads.clear();
        self.meshes.clear();
        self.dropped_quads = 0;
    }

    /// Append a quad; past the cap the command is counted and dropped.
    pub fn push_quad(&mut self, quad: QuadCommand) {
        if self.quads.len() < MAX_QUADS {
            self.quads.push(quad);
        } else {
            self.dropped_quads += 1;
        }
    }

    /// Append a mesh draw.
    pub fn push_mesh(&mut self, command: MeshCommand) {
        self.meshes.push(command);
    }
}

impl Engine {
    /// Build the callback table for one module call. The table points at
    /// `self`, so it is only valid for the duration of that call.
    pub fn api_table(&mut self) -> EngineApi {
        EngineApi {
            version: API_VERSION,
            ctx: self as *mut Engine as *mut c_void,
            set_clear_color: api_set_clear_color,
            draw_quad: api_draw_quad,
            set_camera: api_set_camera,
            load_mesh: api_load_mesh,
            draw_mesh: api_draw_mesh,
            draw_cube: api_draw_cube,
            log: api_log,
            get_dt: api_get_dt,
            is_key_down: api_is_key_down,
        }
    }
}

/// # Safety
/// `ctx` is the pointer the engine put into the table; module calls happen
/// strictly inside a host-driven lifecycle call on lane 0, so the borrow
/// is exclusive for its duration.
unsafe fn engine_from(ctx: *mut c_void) -> &'static mut Engine {
    &mut *(ctx as *mut Engine)
}

extern "C" fn api_set_clear_color(ctx: *mut c_void, r: f32, g: f32, b: f32, a: f32) {
    let engine = unsafe { engine_from(ctx) };
    engine.commands.clear_color = [r, g, b, a];
}

#[allow(clippy::too_many_arguments)]
extern "C" fn api_draw_quad(
    ctx: *mut c_void,
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    r: f32,
    g: f32,
    b: f32,
    a: f32,
) {
    let engine = unsafe { engine_from(ctx) };
    engine.commands.push_quad(QuadCommand {
        rect: [x, y, w, h],
        color: [r, g, b, a],
    });
}

extern "C" fn api_set_camera(
    ctx: *mut c_void,
    ex: f32,
    ey: f32,
    ez: f32,
    tx: f32,
    ty: f32,
    tz: f32,
) {
    let engine = unsafe { engine_from(ctx) };
    engine.camera.eye = Vec3::new(ex, ey, ez);
    engine.camera.target = Vec3::new(tx, ty, tz);
}

extern "C" fn api_load_mesh(ctx: *mut c_void, path: *const c_char) -> u32 {
    let engine = unsafe { engine_from(ctx) };
    if path.is_null() {
        log::warn!("load_mesh called with a null path; returning the cube");
        return 0;
    }
    let path = unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned();
    engine.load_mesh_from_path(&path)
}

extern "C" fn api_draw_mesh(
    ctx: *mut c_void,
    handle: u32,
    model: *const f32,
    r: f32,
    g: f32,
    b: f32,
    a: f32,
) {
    let engine = unsafe { engine_from(ctx) };
    let model = match read_matrix(model) {
        Some(model) => model,
        None => return,
    };
    engine.commands.push_mesh(MeshCommand {
        handle,
        model,
        tint: [r, g, b, a],
    });
}

extern "C" fn api_draw_cube(ctx: *mut c_void, model: *const f32, r: f32, g: f32, b: f32, a: f32) {
    api_draw_mesh(ctx, 0, model, r, g, b, a);
}

extern "C" fn api_log(_ctx: *mut c_void, msg: *const c_char) {
    if msg.is_null() {
        return;
    }
    let msg = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
    log::info!(target: "game", "{}", msg);
}

extern "C" fn api_get_dt(ctx: *mut c_void) -> f32 {
    let engine = unsafe { engine_from(ctx) };
    engine.timer.delta_time()
}

extern "C" fn api_is_key_down(ctx: *mut c_void, key: i32) -> bool {
    let engine = unsafe { engine_from(ctx) };
    if engine.is_headless() {
        return false;
    }
    engine.window.is_key_down(key)
}

/// Read 16 floats (column-major) from the module, defensively.
fn read_matrix(ptr: *const f32) -> Option<[[f32; 4]; 4]> {
    if ptr.is_null() {
        return None;
    }
    let flat = unsafe { std::slice::from_raw_parts(ptr, 16) };
    let mut m = [[0.0f32; 4]; 4];
    for col in 0..4 {
        m[col].copy_from_slice(&flat[col * 4..col * 4 + 4]);
    }
    Some(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_command_matches_gpu_layout() {
        assert_eq!(std::mem::size_of::<QuadCommand>(), 32);
        assert_eq!(std::mem::align_of::<QuadCommand>(), 4);
    }

    #[test]
    fn frame_commands_preserve_append_order() {
        let mut commands = FrameCommands::default();
        for i in 0..4 {
            commands.push_quad(QuadCommand {
                rect: [i as f32, 0.0, 1.0, 1.0],
                color: [0.0; 4],
            });
        }
        let xs: Vec<f32> = commands.quads.iter().map(|q| q.rect[0]).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn quads_past_the_cap_are_counted_not_stored() {
        let mut commands = FrameCommands::default();
        let quad = QuadCommand {
            rect: [0.0; 4],
            color: [0.0; 4],
        };
        for _ in 0..MAX_QUADS + 7 {
            commands.push_quad(quad);
        }
        assert_eq!(commands.quads.len(), MAX_QUADS);
        assert_eq!(commands.dropped_quads, 7);
    }

    #[test]
    fn begin_frame_resets_everything() {
        let mut commands = FrameCommands::default();
        commands.clear_color = [0.5; 4];
        commands.push_quad(QuadCommand {
            rect: [0.0; 4],
            color: [0.0; 4],
        });
        commands.push_mesh(MeshCommand {
            handle: 0,
            model: [[0.0; 4]; 4],
            tint: [1.0; 4],
        });
        commands.dropped_quads = 3;

        commands.begin_frame();
        assert_eq!(commands.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(commands.quads.is_empty());
        assert!(commands.meshes.is_empty());
        assert_eq!(commands.dropped_quads, 0);
    }

    #[test]
    fn matrix_reads_column_major() {
        #[rustfmt::skip]
        let flat: [f32; 16] = [
            1.0, 2.0, 3.0, 4.0,
            5.0, 6.0, 7.0, 8.0,
            9.0, 10.0, 11.0, 12.0,
            13.0, 14.0, 15.0, 16.0,
        ];
        let m = read_matrix(flat.as_ptr()).unwrap();
        assert_eq!(m[0], [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m[3], [13.0, 14.0, 15.0, 16.0]);
        assert!(read_matrix(std::ptr::null()).is_none());
    }
}
