//! # kiln
//!
//! A small Vulkan 1.3 engine host that drives a hot-reloadable game
//! module across a lane-parallel frame loop.
//!
//! The module is a dynamic library speaking the C ABI defined in
//! `kiln_abi`; each frame lane 0 polls the window, runs the module's
//! `update` (which appends quad and mesh draw commands through the
//! engine API table), and feeds those commands through the frame
//! scheduler: fence wait, SSBO upload, acquire, record, submit, present,
//! with two frames in flight. A `--headless` branch renders the same
//! frames into BMP files instead of a live window.

#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod engine;
pub mod foundation;
pub mod headless;
pub mod hotload;
pub mod mesh;
pub mod render;
pub mod run;

pub use api::{Camera, FrameCommands, MeshCommand, QuadCommand, MAX_QUADS};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use headless::run_headless;
pub use hotload::ModuleHost;
pub use run::run_main_loop;
