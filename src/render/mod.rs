//! Batched GPU renderer and its software fallback: driver abstraction,
//! card buffers, texture slot management, WGSL assembly, and the scene
//! walk that feeds them.

pub mod batch;
pub mod driver;
pub mod renderer;
pub mod shader;
pub mod surface2d;
pub mod texture;
#[cfg(feature = "gpu")]
pub mod wgpu_driver;
