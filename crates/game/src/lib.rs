//! Sample game module: a spinning cube over two overlapping quads.
//!
//! Built as a cdylib; the engine host loads it through the `kiln_abi`
//! contract and may unload and reload it at any time. All state lives in
//! the host-owned byte buffer passed to every call, so a reload picks up
//! exactly where the previous library left off.

use std::ffi::CString;
use std::os::raw::c_void;

use kiln_abi::{key, EngineApi, API_VERSION};

/// Module state, reinterpreted from the host buffer on every call.
/// Index- and value-only: no pointers, so it survives library swaps.
#[repr(C)]
struct GameState {
    elapsed: f32,
    spin_speed: f32,
    reload_count: u32,
    initialized: u32,
}

const SKY: [f32; 4] = [0.53, 0.81, 0.92, 1.0];
const CUBE_TINT: [f32; 4] = [0.8, 0.4, 0.2, 1.0];

fn state_mut(memory: *mut u8, size: usize) -> Option<&'static mut GameState> {
    if memory.is_null() || size < std::mem::size_of::<GameState>() {
        return None;
    }
    // The host guarantees exclusive access for the duration of the call.
    Some(unsafe { &mut *(memory as *mut GameState) })
}

fn emit_log(api: &EngineApi, message: &str) {
    if let Ok(message) = CString::new(message) {
        (api.log)(api.ctx, message.as_ptr());
    }
}

/// Column-major rotation about +Y.
fn rotation_y(angle: f32) -> [f32; 16] {
    let (sin, cos) = angle.sin_cos();
    #[rustfmt::skip]
    let m = [
        cos, 0.0, -sin, 0.0,
        0.0, 1.0, 0.0, 0.0,
        sin, 0.0, cos, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ];
    m
}

#[no_mangle]
pub extern "C" fn kiln_get_api_version() -> u32 {
    API_VERSION
}

#[no_mangle]
pub extern "C" fn kiln_get_memory_size() -> usize {
    std::mem::size_of::<GameState>()
}

/// # Safety
/// Called by the host with a live api table and the state buffer it
/// allocated for us.
#[no_mangle]
pub unsafe extern "C" fn kiln_load(api: *const EngineApi, memory: *mut u8, size: usize) {
    let api = &*api;
    let Some(state) = state_mut(memory, size) else {
        emit_log(api, "load: state buffer too small");
        return;
    };
    state.elapsed = 0.0;
    state.spin_speed = 1.0;
    state.reload_count = 0;
    state.initialized = 1;
    emit_log(api, "game loaded");
}

/// # Safety
/// See [`kiln_load`].
#[no_mangle]
pub unsafe extern "C" fn kiln_update(api: *const EngineApi, memory: *mut u8, size: usize) {
    let api = &*api;
    let ctx: *mut c_void = api.ctx;
    let Some(state) = state_mut(memory, size) else {
        return;
    };

    let dt = (api.get_dt)(ctx);
    let boost = if (api.is_key_down)(ctx, key::KEY_SPACE) {
        3.0
    } else {
        1.0
    };
    state.elapsed += dt * state.spin_speed * boost;

    (api.set_clear_color)(ctx, SKY[0], SKY[1], SKY[2], SKY[3]);
    (api.set_camera)(ctx, 0.0, 3.0, 6.0, 0.0, 0.0, 0.0);

    let model = rotation_y(state.elapsed);
    (api.draw_cube)(
        ctx,
        model.as_ptr(),
        CUBE_TINT[0],
        CUBE_TINT[1],
        CUBE_TINT[2],
        CUBE_TINT[3],
    );

    // Two overlapping corner quads; the later one wins in the overlap.
    (api.draw_quad)(ctx, -0.9, -0.9, 0.4, 0.4, 1.0, 0.0, 0.0, 1.0);
    (api.draw_quad)(ctx, -0.7, -0.7, 0.4, 0.4, 0.0, 1.0, 0.0, 1.0);
}

/// # Safety
/// See [`kiln_load`].
#[no_mangle]
pub unsafe extern "C" fn kiln_unload(api: *const EngineApi, _memory: *mut u8, _size: usize) {
    emit_log(&*api, "game unloading");
}

/// # Safety
/// See [`kiln_load`].
#[no_mangle]
pub unsafe extern "C" fn kiln_reload(api: *const EngineApi, memory: *mut u8, size: usize) {
    let api = &*api;
    let Some(state) = state_mut(memory, size) else {
        emit_log(api, "reload: state buffer too small");
        return;
    };
    if state.initialized == 0 {
        // A reload against a state the old library never set up.
        state.elapsed = 0.0;
        state.spin_speed = 1.0;
        state.initialized = 1;
    }
    state.reload_count += 1;
    emit_log(
        api,
        &format!(
            "game reloaded (count {}, t = {:.2}s preserved)",
            state.reload_count, state.elapsed
        ),
    );
}
