//! Stage facade.
//!
//! Owns one rendering path and drives the frame heartbeat: advance the
//! tween registry, then draw the scene. Construction falls back to the
//! software surface permanently when a GPU path cannot be brought up,
//! so callers never branch on what they got.

use tracing::warn;

use crate::foundation::core::SurfaceSize;
use crate::foundation::error::ZoetropeResult;
use crate::render::driver::GpuDriver;
use crate::render::renderer::{BatchRenderer, RenderStats, RendererOpts};
use crate::render::surface2d::SoftwareSurface;
use crate::scene::graph::Scene;
use crate::scene::node::{CacheSpec, NodeId};
use crate::scene::pixmap::Pixmap;
use crate::tween::registry::Tweens;

enum StagePath {
    Gpu(BatchRenderer),
    Software(SoftwareSurface),
}

pub struct Stage {
    path: StagePath,
}

impl Stage {
    /// Stage over the CPU compositor.
    pub fn software(size: SurfaceSize, opts: RendererOpts) -> ZoetropeResult<Self> {
        Ok(Self {
            path: StagePath::Software(SoftwareSurface::new(size, opts.background)?),
        })
    }

    /// Stage over a caller-supplied driver. A driver that fails renderer
    /// bring-up is dropped in favor of the software surface.
    pub fn with_driver(
        driver: Box<dyn GpuDriver>,
        size: SurfaceSize,
        opts: RendererOpts,
    ) -> ZoetropeResult<Self> {
        match BatchRenderer::new(driver, size, opts.clone()) {
            Ok(renderer) => Ok(Self {
                path: StagePath::Gpu(renderer),
            }),
            Err(err) => {
                warn!(error = %err, "renderer bring-up failed, using the software surface");
                Self::software(size, opts)
            }
        }
    }

    /// Stage over the system GPU, or the software surface when no adapter
    /// is available.
    #[cfg(feature = "gpu")]
    pub fn gpu(size: SurfaceSize, opts: RendererOpts) -> ZoetropeResult<Self> {
        match crate::render::wgpu_driver::WgpuDriver::new() {
            Ok(driver) => Self::with_driver(Box::new(driver), size, opts),
            Err(err) => {
                warn!(error = %err, "gpu unavailable, using the software surface");
                Self::software(size, opts)
            }
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.path, StagePath::Gpu(_))
    }

    pub fn surface_size(&self) -> SurfaceSize {
        match &self.path {
            StagePath::Gpu(renderer) => renderer.surface_size(),
            StagePath::Software(surface) => surface.surface_size(),
        }
    }

    /// Renderer counters; `None` on the software path.
    pub fn stats(&self) -> Option<RenderStats> {
        match &self.path {
            StagePath::Gpu(renderer) => Some(renderer.stats()),
            StagePath::Software(_) => None,
        }
    }

    pub fn update_viewport(&mut self, size: SurfaceSize) -> ZoetropeResult<()> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.update_viewport(size),
            StagePath::Software(surface) => surface.update_viewport(size),
        }
    }

    /// One frame: advance every registered tween against the scene, then
    /// draw it.
    pub fn update(
        &mut self,
        scene: &mut Scene,
        tweens: &mut Tweens,
        delta: f64,
        global_paused: bool,
    ) -> ZoetropeResult<()> {
        tweens.tick(scene, delta, global_paused);
        self.render(scene)
    }

    /// Draw without ticking.
    pub fn render(&mut self, scene: &Scene) -> ZoetropeResult<()> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.render(scene),
            StagePath::Software(surface) => surface.render(scene),
        }
    }

    pub fn cache_node(
        &mut self,
        scene: &mut Scene,
        id: NodeId,
        spec: CacheSpec,
    ) -> ZoetropeResult<()> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.cache_node(scene, id, spec),
            StagePath::Software(surface) => surface.cache_node(scene, id, spec),
        }
    }

    pub fn update_cache(&mut self, scene: &mut Scene, id: NodeId) -> ZoetropeResult<()> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.update_cache(scene, id),
            StagePath::Software(surface) => surface.update_cache(scene, id),
        }
    }

    pub fn uncache(&mut self, scene: &mut Scene, id: NodeId) {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.uncache(scene, id),
            StagePath::Software(surface) => surface.uncache(scene, id),
        }
    }

    /// Release the textures and caches a subtree holds. Call before
    /// dropping nodes whose sources will not be drawn again.
    pub fn release_node(&mut self, scene: &mut Scene, id: NodeId) {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.release_node(scene, id),
            StagePath::Software(_) => clear_caches(scene, id),
        }
    }

    /// Reclaim source textures unused for `age` draws. The software path
    /// holds no textures and reports zero.
    pub fn purge_textures(&mut self, age: u64) -> usize {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.purge_textures(age),
            StagePath::Software(_) => 0,
        }
    }

    /// Read the drawn surface back to a CPU pixmap.
    pub fn to_pixmap(&mut self) -> ZoetropeResult<Pixmap> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.to_pixmap(),
            StagePath::Software(surface) => Ok(surface.to_pixmap()),
        }
    }

    /// Read the drawn surface back as an unpremultiplied image buffer.
    pub fn to_image(&mut self) -> ZoetropeResult<image::RgbaImage> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.to_image(),
            StagePath::Software(surface) => surface
                .to_pixmap()
                .to_image()
                .ok_or_else(|| crate::foundation::error::ZoetropeError::render(
                    "surface buffer did not convert",
                )),
        }
    }

    /// Read a cached node's content back to a CPU pixmap.
    pub fn cache_to_pixmap(&mut self, scene: &Scene, id: NodeId) -> ZoetropeResult<Pixmap> {
        match &mut self.path {
            StagePath::Gpu(renderer) => renderer.cache_to_pixmap(scene, id),
            StagePath::Software(surface) => surface.cache_to_pixmap(scene, id),
        }
    }
}

fn clear_caches(scene: &mut Scene, id: NodeId) {
    let children: Vec<NodeId> = scene
        .node(id)
        .map(|n| n.children().to_vec())
        .unwrap_or_default();
    for child in children {
        clear_caches(scene, child);
    }
    if let Some(node) = scene.node_mut(id) {
        node.cache = None;
    }
}
