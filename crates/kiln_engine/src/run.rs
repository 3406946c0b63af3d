//! The windowed main loop: the lane-parallel phase structure around one
//! frame of window polling, hot-reload checking, module update, and the
//! frame scheduler.

use crate::api::MAX_QUADS;
use crate::engine::{Engine, EngineError};
use crate::foundation::lanes::{LaneRuntime, LoopControl, MAX_LANES};
use crate::hotload::ModuleHost;
use crate::render::{FrameStatus, VulkanError};

/// Drive the engine until the window closes or a fatal error occurs.
///
/// Spawns `MAX_LANES` worker lanes; the calling thread is lane 0 and is
/// the only lane that touches Vulkan, the window, or the module. A fatal
/// error raises the quit flag so every lane exits in the same iteration,
/// then the module is shut down while the device is known idle.
pub fn run_main_loop(engine: &mut Engine, host: &mut ModuleHost) -> Result<(), EngineError> {
    let lanes = LaneRuntime::new(MAX_LANES);
    let mut fatal: Option<EngineError> = None;

    lanes.run(|| {
        // Window close is observed at the top of the phase.
        engine.window.poll_events();
        if engine.window.should_close() {
            return LoopControl::Quit;
        }

        engine.arenas.frame.reset();

        // Hot reload before the module runs this frame; at most one
        // update is skipped around a swap.
        host.poll_reload(engine);

        engine.timer.tick();
        engine.commands.begin_frame();
        host.update(engine);

        if engine.commands.dropped_quads > 0 {
            log::warn!(
                "{} quad commands dropped this frame (cap {})",
                engine.commands.dropped_quads,
                MAX_QUADS
            );
        }

        match engine.draw_frame() {
            Ok(FrameStatus::Presented) | Ok(FrameStatus::Skipped) => LoopControl::Continue,
            Ok(FrameStatus::RecreateNeeded) => match engine.recreate_swapchain() {
                Ok(true) => LoopControl::Continue,
                // The window is closing; the failed recreate is expected.
                Ok(false) => LoopControl::Quit,
                Err(e) => {
                    log::error!("swapchain recreation failed: {}", e);
                    fatal = Some(e.into());
                    LoopControl::Quit
                }
            },
            Err(VulkanError::DeviceLost) => {
                log::error!("device lost; shutting down");
                fatal = Some(VulkanError::DeviceLost.into());
                LoopControl::Quit
            }
            Err(e) => {
                log::error!("frame failed: {}", e);
                fatal = Some(e.into());
                LoopControl::Quit
            }
        }
    });

    host.shutdown(engine);

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
