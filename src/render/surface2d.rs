//! Software rendering path.
//!
//! Walks the same display list as the GPU batcher but composites on the CPU
//! with an inverse-mapped nearest blit, so it handles every affine the GPU
//! path does. Caches back onto pixel sources in the scene's source store
//! instead of render targets. Filter chains are WGSL and do not apply here.

use crate::foundation::core::{Affine, DrawState, Point, Rect, Rgba8Premul, SurfaceSize};
use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::render::renderer::VISIBILITY_THRESHOLD;
use crate::scene::graph::Scene;
use crate::scene::node::{CacheBacking, CacheSpec, Node, NodeCache, NodeId, NodeKind};
use crate::scene::pixmap::{Pixmap, over};
use crate::scene::source::{ImageSource, SourceId};

pub struct SoftwareSurface {
    target: Pixmap,
    background: Option<Rgba8Premul>,
}

impl SoftwareSurface {
    pub fn new(size: SurfaceSize, background: Option<Rgba8Premul>) -> ZoetropeResult<Self> {
        Ok(Self {
            target: Pixmap::new(size.width, size.height)?,
            background,
        })
    }

    pub fn surface_size(&self) -> SurfaceSize {
        SurfaceSize {
            width: self.target.width(),
            height: self.target.height(),
        }
    }

    /// Resize the surface. Contents reset to the clear color.
    pub fn update_viewport(&mut self, size: SurfaceSize) -> ZoetropeResult<()> {
        self.target = Pixmap::new(size.width, size.height)?;
        Ok(())
    }

    pub fn render(&mut self, scene: &Scene) -> ZoetropeResult<()> {
        match self.background {
            Some(bg) => self.target.fill(bg),
            None => self.target.clear(),
        }
        draw_node(
            &mut self.target,
            scene,
            scene.root(),
            DrawState::identity(),
            false,
        );
        Ok(())
    }

    /// Install (or re-spec) a cache on a node and rasterize its content
    /// into a pixel source.
    pub fn cache_node(
        &mut self,
        scene: &mut Scene,
        id: NodeId,
        spec: CacheSpec,
    ) -> ZoetropeResult<()> {
        if scene.node(id).is_none() {
            return Err(ZoetropeError::validation("unknown node id"));
        }
        if spec.width <= 0.0 || spec.height <= 0.0 {
            return Err(ZoetropeError::validation(
                "cache region must have positive size",
            ));
        }

        let scratch = draw_cache_content(scene, id, &spec)?;
        let (source, cache_id) = match scene.node_mut(id).and_then(|n| n.cache.take()) {
            Some(NodeCache {
                backing: CacheBacking::Pixels(source),
                cache_id,
                ..
            }) => (source, cache_id),
            _ => {
                let (sw, sh) = spec.store_size();
                (scene.sources_mut().register_canvas(sw, sh)?, 0)
            }
        };
        scene.sources_mut().replace_pixels(source, &scratch)?;
        if let Some(node) = scene.node_mut(id) {
            node.cache = Some(NodeCache {
                spec,
                backing: CacheBacking::Pixels(source),
                cache_id: cache_id + 1,
            });
        }
        Ok(())
    }

    /// Rasterize a cached node's content again after it changed.
    pub fn update_cache(&mut self, scene: &mut Scene, id: NodeId) -> ZoetropeResult<()> {
        let Some(cache) = scene.node(id).and_then(|n| n.cache.clone()) else {
            return Err(ZoetropeError::validation("node is not cached"));
        };
        let CacheBacking::Pixels(source) = cache.backing else {
            return Err(ZoetropeError::validation("cache is not pixel backed"));
        };
        let scratch = draw_cache_content(scene, id, &cache.spec)?;
        scene.sources_mut().replace_pixels(source, &scratch)?;
        if let Some(node) = scene.node_mut(id)
            && let Some(cache) = &mut node.cache
        {
            cache.cache_id += 1;
        }
        Ok(())
    }

    /// Drop a node's cache. The backing source slot stays registered; a
    /// later re-cache reuses a fresh canvas slot.
    pub fn uncache(&mut self, scene: &mut Scene, id: NodeId) {
        if let Some(node) = scene.node_mut(id) {
            node.cache = None;
        }
    }

    pub fn to_pixmap(&self) -> Pixmap {
        self.target.clone()
    }

    /// Copy of a cached node's content.
    pub fn cache_to_pixmap(&self, scene: &Scene, id: NodeId) -> ZoetropeResult<Pixmap> {
        let Some(cache) = scene.node(id).and_then(|n| n.cache.as_ref()) else {
            return Err(ZoetropeError::validation("node is not cached"));
        };
        let CacheBacking::Pixels(source) = &cache.backing else {
            return Err(ZoetropeError::validation("cache is not pixel backed"));
        };
        let src = scene
            .sources()
            .get(*source)
            .filter(|s| s.is_ready())
            .ok_or_else(|| ZoetropeError::render("cache has no content"))?;
        let pixels = src
            .pixels
            .as_ref()
            .ok_or_else(|| ZoetropeError::render("cache has no content"))?;
        Pixmap::from_rgba8_premul(src.width, src.height, pixels.to_vec())
    }
}

fn draw_cache_content(scene: &Scene, id: NodeId, spec: &CacheSpec) -> ZoetropeResult<Pixmap> {
    let (sw, sh) = spec.store_size();
    let mut scratch = Pixmap::new(sw, sh)?;
    let scale = if spec.scale > 0.0 { spec.scale } else { 1.0 };
    let state = DrawState {
        matrix: Affine::scale(scale) * Affine::translate((-spec.x, -spec.y)),
        alpha: 1.0,
    };
    if let Some(node) = scene.node(id) {
        draw_content(&mut scratch, scene, node, state, true);
    }
    Ok(scratch)
}

fn draw_node(target: &mut Pixmap, scene: &Scene, id: NodeId, parent: DrawState, ignore_cache: bool) {
    let Some(node) = scene.node(id) else { return };
    if !node.visible {
        return;
    }
    let state = parent.child(node.local_matrix(), node.alpha);
    if state.alpha <= VISIBILITY_THRESHOLD {
        return;
    }
    draw_content(target, scene, node, state, ignore_cache);
}

fn draw_content(
    target: &mut Pixmap,
    scene: &Scene,
    node: &Node,
    state: DrawState,
    ignore_cache: bool,
) {
    if !ignore_cache
        && let Some(cache) = &node.cache
        && let CacheBacking::Pixels(source) = &cache.backing
        && let Some(view) = source_view(scene, *source)
    {
        let (sw, sh) = cache.spec.store_size();
        let scale = if cache.spec.scale > 0.0 {
            cache.spec.scale
        } else {
            1.0
        };
        let l = cache.spec.x;
        let t = cache.spec.y;
        let local = Rect::new(
            l,
            t,
            f64::from(sw) / scale + l,
            f64::from(sh) / scale + t,
        );
        let src_rect = Rect::new(0.0, 0.0, f64::from(view.width), f64::from(view.height));
        blit(target, view, src_rect, local, state.matrix, state.alpha);
        return;
    }

    match &node.kind {
        NodeKind::Container => {}
        NodeKind::Bitmap {
            source,
            source_rect,
        } => {
            if let Some(view) = source_view(scene, *source) {
                let (local, src_rect) = match source_rect {
                    Some(sub) => (Rect::new(0.0, 0.0, sub.width(), sub.height()), *sub),
                    None => {
                        let full =
                            Rect::new(0.0, 0.0, f64::from(view.width), f64::from(view.height));
                        (full, full)
                    }
                };
                blit(target, view, src_rect, local, state.matrix, state.alpha);
            }
        }
        NodeKind::Sprite { sheet, frame } => {
            if let Some(sheet) = scene.sheet(*sheet) {
                let index = frame.max(0.0).floor() as usize;
                if let Some(frame) = sheet.frame(index)
                    && let Some(view) = source_view(scene, frame.page)
                {
                    let r = frame.rect;
                    let local = Rect::new(
                        -frame.reg_x,
                        -frame.reg_y,
                        r.width() - frame.reg_x,
                        r.height() - frame.reg_y,
                    );
                    blit(target, view, r, local, state.matrix, state.alpha);
                }
            }
        }
        NodeKind::Drawn { surface } => {
            if let Some(view) = source_view(scene, *surface) {
                let full = Rect::new(0.0, 0.0, f64::from(view.width), f64::from(view.height));
                blit(target, view, full, full, state.matrix, state.alpha);
            }
        }
    }

    for child in node.children() {
        draw_node(target, scene, *child, state, false);
    }
}

/// Borrowed pixel view of a ready source.
#[derive(Clone, Copy)]
struct SrcView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

fn source_view(scene: &Scene, source: SourceId) -> Option<SrcView<'_>> {
    let src: &ImageSource = scene.sources().get(source)?;
    if !src.is_ready() || src.width == 0 || src.height == 0 {
        return None;
    }
    let pixels = src.pixels.as_ref()?;
    Some(SrcView {
        data: pixels.as_slice(),
        width: src.width,
        height: src.height,
    })
}

/// Composite `src_rect` of the source onto the target, mapping the node
/// local rectangle `local` through `matrix`. Each covered target pixel is
/// inverse mapped and nearest sampled, which keeps rotation and flips
/// exact at the cost of speed.
fn blit(
    target: &mut Pixmap,
    src: SrcView<'_>,
    src_rect: Rect,
    local: Rect,
    matrix: Affine,
    alpha: f64,
) {
    if local.width() <= 0.0 || local.height() <= 0.0 {
        return;
    }
    if src_rect.width() <= 0.0 || src_rect.height() <= 0.0 {
        return;
    }
    if matrix.determinant().abs() < 1e-12 {
        return;
    }
    let inv = matrix.inverse();
    let opacity = alpha.clamp(0.0, 1.0) as f32;

    let bbox = matrix.transform_rect_bbox(local);
    let x0 = bbox.x0.floor().max(0.0) as i64;
    let y0 = bbox.y0.floor().max(0.0) as i64;
    let x1 = (bbox.x1.ceil() as i64).min(i64::from(target.width()));
    let y1 = (bbox.y1.ceil() as i64).min(i64::from(target.height()));

    let sx_per = src_rect.width() / local.width();
    let sy_per = src_rect.height() / local.height();
    let dst_width = target.width() as usize;
    let data = target.data_mut();

    for dy in y0..y1 {
        for dx in x0..x1 {
            let p = inv * Point::new(dx as f64 + 0.5, dy as f64 + 0.5);
            let sx = src_rect.x0 + (p.x - local.x0) * sx_per;
            let sy = src_rect.y0 + (p.y - local.y0) * sy_per;
            if sx < src_rect.x0 || sx >= src_rect.x1 || sy < src_rect.y0 || sy >= src_rect.y1 {
                continue;
            }
            let sxi = sx.floor() as i64;
            let syi = sy.floor() as i64;
            if sxi < 0 || syi < 0 || sxi >= i64::from(src.width) || syi >= i64::from(src.height) {
                continue;
            }

            let si = ((syi as usize) * (src.width as usize) + (sxi as usize)) * 4;
            let s = [
                src.data[si],
                src.data[si + 1],
                src.data[si + 2],
                src.data[si + 3],
            ];
            let di = ((dy as usize) * dst_width + (dx as usize)) * 4;
            let d = [data[di], data[di + 1], data[di + 2], data[di + 3]];
            let out = over(d, s, opacity);
            data[di..di + 4].copy_from_slice(&out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_source(scene: &mut Scene, w: u32, h: u32, color: Rgba8Premul) -> SourceId {
        let mut pixmap = Pixmap::new(w, h).unwrap();
        pixmap.fill(color);
        scene
            .sources_mut()
            .register_pixmap(format!("solid_{w}x{h}_{}", color.r), &pixmap)
    }

    fn red() -> Rgba8Premul {
        Rgba8Premul {
            r: 255,
            g: 0,
            b: 0,
            a: 255,
        }
    }

    #[test]
    fn renders_a_translated_bitmap() {
        let mut scene = Scene::new();
        let source = solid_source(&mut scene, 2, 2, red());
        let bitmap = scene.new_bitmap(source);
        scene.add_child(scene.root(), bitmap).unwrap();
        scene.node_mut(bitmap).unwrap().transform.x = 1.0;
        scene.node_mut(bitmap).unwrap().transform.y = 1.0;

        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 4,
                height: 4,
            },
            None,
        )
        .unwrap();
        surface.render(&scene).unwrap();
        let out = surface.to_pixmap();

        assert_eq!(out.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(out.pixel(1, 1), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(2, 2), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(3, 3), Some([0, 0, 0, 0]));
    }

    #[test]
    fn alpha_concatenates_down_the_tree() {
        let mut scene = Scene::new();
        let source = solid_source(&mut scene, 1, 1, red());
        let group = scene.new_container();
        let bitmap = scene.new_bitmap(source);
        scene.add_child(scene.root(), group).unwrap();
        scene.add_child(group, bitmap).unwrap();
        scene.node_mut(group).unwrap().alpha = 0.5;
        scene.node_mut(bitmap).unwrap().alpha = 0.5;

        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 1,
                height: 1,
            },
            None,
        )
        .unwrap();
        surface.render(&scene).unwrap();
        let px = surface.to_pixmap().pixel(0, 0).unwrap();

        // 0.25 of solid red
        assert_eq!(px[3], 64);
        assert_eq!(px[0], 64);
    }

    #[test]
    fn quarter_turn_rotation_moves_pixels_exactly() {
        let mut scene = Scene::new();
        // 2x1: red then transparent
        let mut pixmap = Pixmap::new(2, 1).unwrap();
        pixmap.data_mut()[..4].copy_from_slice(&[255, 0, 0, 255]);
        let source = scene.sources_mut().register_pixmap("two_wide", &pixmap);

        let bitmap = scene.new_bitmap(source);
        scene.add_child(scene.root(), bitmap).unwrap();
        {
            let t = &mut scene.node_mut(bitmap).unwrap().transform;
            t.rotation = 90.0;
            t.x = 2.0;
        }

        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 4,
                height: 4,
            },
            None,
        )
        .unwrap();
        surface.render(&scene).unwrap();
        let out = surface.to_pixmap();

        // the strip turns vertical with the red texel on top
        assert_eq!(out.pixel(1, 0), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(1, 1), Some([0, 0, 0, 0]));
    }

    #[test]
    fn sprite_draws_its_frame_with_registration() {
        use crate::scene::source::{FrameDef, SpriteSheet, SpriteSheetData};

        let mut scene = Scene::new();
        let mut page = Pixmap::new(4, 2).unwrap();
        // left half red, right half green
        for x in 0..4u32 {
            let color: [u8; 4] = if x < 2 {
                [255, 0, 0, 255]
            } else {
                [0, 255, 0, 255]
            };
            for y in 0..2u32 {
                let i = ((y * 4 + x) * 4) as usize;
                page.data_mut()[i..i + 4].copy_from_slice(&color);
            }
        }
        scene.sources_mut().register_pixmap("page.png", &page);

        let data = SpriteSheetData {
            images: vec!["page.png".into()],
            frames: vec![FrameDef {
                x: 2.0,
                y: 0.0,
                width: 2.0,
                height: 2.0,
                image_index: 0,
                reg_x: 1.0,
                reg_y: 0.0,
            }],
        };
        let sheet = SpriteSheet::from_data(scene.sources_mut(), &data).unwrap();
        let sheet = scene.add_sheet(sheet);
        let sprite = scene.new_sprite(sheet, 0);
        scene.add_child(scene.root(), sprite).unwrap();
        scene.node_mut(sprite).unwrap().transform.x = 2.0;

        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 4,
                height: 4,
            },
            None,
        )
        .unwrap();
        surface.render(&scene).unwrap();
        let out = surface.to_pixmap();

        // frame is the green half, shifted left one texel by reg_x
        assert_eq!(out.pixel(1, 0), Some([0, 255, 0, 255]));
        assert_eq!(out.pixel(2, 0), Some([0, 255, 0, 255]));
        assert_eq!(out.pixel(3, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn cache_replaces_subtree_until_updated() {
        let mut scene = Scene::new();
        let source = solid_source(&mut scene, 2, 2, red());
        let group = scene.new_container();
        let bitmap = scene.new_bitmap(source);
        scene.add_child(scene.root(), group).unwrap();
        scene.add_child(group, bitmap).unwrap();

        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 4,
                height: 4,
            },
            None,
        )
        .unwrap();
        surface
            .cache_node(&mut scene, group, CacheSpec::new(0.0, 0.0, 2.0, 2.0))
            .unwrap();
        assert_eq!(scene.node(group).unwrap().cache.as_ref().unwrap().cache_id, 1);

        // hide the live child; the cache keeps drawing the old content
        scene.node_mut(bitmap).unwrap().visible = false;
        surface.render(&scene).unwrap();
        assert_eq!(surface.to_pixmap().pixel(0, 0), Some([255, 0, 0, 255]));

        surface.update_cache(&mut scene, group).unwrap();
        surface.render(&scene).unwrap();
        assert_eq!(surface.to_pixmap().pixel(0, 0), Some([0, 0, 0, 0]));

        surface.uncache(&mut scene, group);
        assert!(scene.node(group).unwrap().cache.is_none());
    }

    #[test]
    fn drawn_surfaces_blit_directly() {
        let mut scene = Scene::new();
        let surface_id = scene.sources_mut().register_canvas(2, 2).unwrap();
        let drawn = scene.new_drawn(surface_id);
        scene.add_child(scene.root(), drawn).unwrap();

        let mut canvas = Pixmap::new(2, 2).unwrap();
        canvas.fill(red());
        scene
            .sources_mut()
            .replace_pixels(surface_id, &canvas)
            .unwrap();

        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 2,
                height: 2,
            },
            None,
        )
        .unwrap();
        surface.render(&scene).unwrap();
        assert_eq!(surface.to_pixmap().pixel(1, 1), Some([255, 0, 0, 255]));
    }

    #[test]
    fn background_fills_before_drawing() {
        let scene = Scene::new();
        let bg = Rgba8Premul {
            r: 0,
            g: 0,
            b: 40,
            a: 255,
        };
        let mut surface = SoftwareSurface::new(
            SurfaceSize {
                width: 2,
                height: 2,
            },
            Some(bg),
        )
        .unwrap();
        surface.render(&scene).unwrap();
        assert_eq!(surface.to_pixmap().pixel(0, 0), Some([0, 0, 40, 255]));
    }
}
