//! Retained scene graph: node arena, pixel sources, sprite sheets, and the
//! CPU raster surface backing software caches.

pub mod graph;
pub mod node;
pub mod pixmap;
pub mod source;
