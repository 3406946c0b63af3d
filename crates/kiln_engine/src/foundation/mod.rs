//! Engine-agnostic building blocks: memory arenas, the lane runtime,
//! frame timing, and math types.

pub mod arena;
pub mod lanes;
pub mod math;
pub mod time;
