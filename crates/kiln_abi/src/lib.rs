//! The C ABI between the engine host and a reloadable game module.
//!
//! Both sides depend on this crate so the table layout cannot drift: the
//! host builds an [`EngineApi`] and passes a pointer to it into every
//! module call; the module exports the six lifecycle symbols with the
//! typedefs below. The layout is `repr(C)` and version-fronted — the first
//! field a module reads is [`EngineApi::version`], and the host refuses to
//! (re)load a module whose `kiln_get_api_version` disagrees with
//! [`API_VERSION`].

#![warn(missing_docs)]

use std::os::raw::{c_char, c_void};

/// Bumped on any change to [`EngineApi`] or the lifecycle signatures.
pub const API_VERSION: u32 = 1;

/// Symbol name of [`GetApiVersionFn`] in the module.
pub const SYM_GET_API_VERSION: &[u8] = b"kiln_get_api_version";
/// Symbol name of [`GetMemorySizeFn`] in the module.
pub const SYM_GET_MEMORY_SIZE: &[u8] = b"kiln_get_memory_size";
/// Symbol name of the `load` lifecycle call.
pub const SYM_LOAD: &[u8] = b"kiln_load";
/// Symbol name of the per-frame `update` call.
pub const SYM_UPDATE: &[u8] = b"kiln_update";
/// Symbol name of the pre-unload lifecycle call.
pub const SYM_UNLOAD: &[u8] = b"kiln_unload";
/// Symbol name of the post-reload lifecycle call.
pub const SYM_RELOAD: &[u8] = b"kiln_reload";

/// `() -> u32`; must return [`API_VERSION`].
pub type GetApiVersionFn = unsafe extern "C" fn() -> u32;
/// `() -> usize`; bytes of state the host must allocate. Called once at
/// initial load.
pub type GetMemorySizeFn = unsafe extern "C" fn() -> usize;
/// Shared signature of `load`, `update`, `unload`, and `reload`: the API
/// table, the host-owned state buffer, and its size in bytes.
pub type LifecycleFn = unsafe extern "C" fn(api: *const EngineApi, memory: *mut u8, size: usize);

/// Callback table handed to the module on every lifecycle call.
///
/// Every callback takes the opaque `ctx` pointer as its first argument; the
/// module must pass it back verbatim. The table is rebuilt by the host for
/// each call, so the module must not retain the pointer across calls.
#[repr(C)]
pub struct EngineApi {
    /// Always [`API_VERSION`] for this engine binary.
    pub version: u32,
    /// Opaque engine context; first argument to every callback.
    pub ctx: *mut c_void,
    /// Overwrite the frame's clear color (RGBA).
    pub set_clear_color: extern "C" fn(ctx: *mut c_void, r: f32, g: f32, b: f32, a: f32),
    /// Append a quad draw: rect (x, y, w, h) in NDC with +y up, RGBA color.
    pub draw_quad: extern "C" fn(
        ctx: *mut c_void,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        r: f32,
        g: f32,
        b: f32,
        a: f32,
    ),
    /// Overwrite the camera eye and target.
    pub set_camera:
        extern "C" fn(ctx: *mut c_void, ex: f32, ey: f32, ez: f32, tx: f32, ty: f32, tz: f32),
    /// Register a glTF mesh; honored only during `load`. Returns a mesh
    /// handle (the built-in cube, handle 0, on failure).
    pub load_mesh: extern "C" fn(ctx: *mut c_void, path: *const c_char) -> u32,
    /// Append a mesh draw: handle, column-major 4x4 model matrix (16 f32),
    /// RGBA tint.
    pub draw_mesh: extern "C" fn(
        ctx: *mut c_void,
        handle: u32,
        model: *const f32,
        r: f32,
        g: f32,
        b: f32,
        a: f32,
    ),
    /// Shorthand for `draw_mesh(0, model, ...)`.
    pub draw_cube:
        extern "C" fn(ctx: *mut c_void, model: *const f32, r: f32, g: f32, b: f32, a: f32),
    /// Forward a NUL-terminated UTF-8 message to the host log.
    pub log: extern "C" fn(ctx: *mut c_void, msg: *const c_char),
    /// Seconds since the previous frame; never negative.
    pub get_dt: extern "C" fn(ctx: *mut c_void) -> f32,
    /// Non-blocking query of the current key state (see [`key`]).
    pub is_key_down: extern "C" fn(ctx: *mut c_void, key: i32) -> bool,
}

/// Key codes accepted by [`EngineApi::is_key_down`].
///
/// The values are the GLFW keycodes, which is what the host window layer
/// speaks natively. Unknown codes are treated as "not down".
pub mod key {
    #![allow(missing_docs)]

    pub const KEY_SPACE: i32 = 32;
    pub const KEY_0: i32 = 48;
    pub const KEY_1: i32 = 49;
    pub const KEY_2: i32 = 50;
    pub const KEY_3: i32 = 51;
    pub const KEY_4: i32 = 52;
    pub const KEY_5: i32 = 53;
    pub const KEY_6: i32 = 54;
    pub const KEY_7: i32 = 55;
    pub const KEY_8: i32 = 56;
    pub const KEY_9: i32 = 57;
    pub const KEY_A: i32 = 65;
    pub const KEY_B: i32 = 66;
    pub const KEY_C: i32 = 67;
    pub const KEY_D: i32 = 68;
    pub const KEY_E: i32 = 69;
    pub const KEY_F: i32 = 70;
    pub const KEY_G: i32 = 71;
    pub const KEY_H: i32 = 72;
    pub const KEY_I: i32 = 73;
    pub const KEY_J: i32 = 74;
    pub const KEY_K: i32 = 75;
    pub const KEY_L: i32 = 76;
    pub const KEY_M: i32 = 77;
    pub const KEY_N: i32 = 78;
    pub const KEY_O: i32 = 79;
    pub const KEY_P: i32 = 80;
    pub const KEY_Q: i32 = 81;
    pub const KEY_R: i32 = 82;
    pub const KEY_S: i32 = 83;
    pub const KEY_T: i32 = 84;
    pub const KEY_U: i32 = 85;
    pub const KEY_V: i32 = 86;
    pub const KEY_W: i32 = 87;
    pub const KEY_X: i32 = 88;
    pub const KEY_Y: i32 = 89;
    pub const KEY_Z: i32 = 90;
    pub const KEY_ESCAPE: i32 = 256;
    pub const KEY_ENTER: i32 = 257;
    pub const KEY_TAB: i32 = 258;
    pub const KEY_RIGHT: i32 = 262;
    pub const KEY_LEFT: i32 = 263;
    pub const KEY_DOWN: i32 = 264;
    pub const KEY_UP: i32 = 265;
    pub const KEY_LEFT_SHIFT: i32 = 340;
    pub const KEY_LEFT_CONTROL: i32 = 341;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn api_table_is_version_fronted() {
        // The version must be the first field so a mismatched module can
        // still read it safely.
        assert_eq!(memoffset_of_version(), 0);
    }

    fn memoffset_of_version() -> usize {
        let api = mem::MaybeUninit::<EngineApi>::uninit();
        let base = api.as_ptr() as usize;
        let field = unsafe { std::ptr::addr_of!((*api.as_ptr()).version) } as usize;
        field - base
    }

    #[test]
    fn function_pointers_are_non_nullable() {
        // Option-free fn pointers keep the table layout identical to the C
        // equivalent (no niche surprises).
        assert_eq!(
            mem::size_of::<extern "C" fn(*mut std::os::raw::c_void)>(),
            mem::size_of::<usize>()
        );
    }
}
