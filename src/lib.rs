#![forbid(unsafe_code)]

pub mod foundation;
pub mod render;
pub mod scene;
pub mod stage;
pub mod tween;

pub use foundation::core::{
    Affine, DrawState, NodeTransform, Point, Rect, Rgba8Premul, SurfaceSize, UvRect, Vec2,
};
pub use foundation::error::{ZoetropeError, ZoetropeResult};
pub use render::driver::{BatchUpload, DriverLimits, GpuDriver, GpuTextureHandle, ProgramHandle};
pub use render::renderer::{BatchRenderer, RenderStats, RendererOpts};
pub use render::surface2d::SoftwareSurface;
#[cfg(feature = "gpu")]
pub use render::wgpu_driver::WgpuDriver;
pub use scene::graph::Scene;
pub use scene::node::{CacheBacking, CacheSpec, Filter, Node, NodeCache, NodeId, NodeKind};
pub use scene::pixmap::Pixmap;
pub use scene::source::{
    FrameDef, ImageSource, SheetId, SourceId, SourceState, SourceStore, SpriteSheet,
    SpriteSheetData,
};
pub use stage::Stage;
pub use tween::core::{Loops, Playhead, PositionOrLabel, TweenConfig};
pub use tween::ease::Ease;
pub use tween::plugin::TweenPlugin;
pub use tween::props::{PropValue, TargetId, TweenHost, TweenProps, TweenTarget, props};
pub use tween::registry::{ActionCtx, TweenId, Tweens};
pub use tween::timeline::Timeline;
pub use tween::tween::{Tween, TweenEvent};
