//! Task manager -- owns the worker pool and the task arena.
//!
//! Split into focused submodules:
//! - `core`: TaskManager struct, builder, accessors and shutdown
//! - `submit`: admission, affinity resolution and expiry
//! - `fence`: the per-batch barrier (`clear_fences` / `wait_for_fence`)

mod core;
mod fence;
mod submit;
#[cfg(test)]
mod tests;

pub use self::core::{TaskManager, TaskManagerBuilder};
pub use self::submit::Affinity;
