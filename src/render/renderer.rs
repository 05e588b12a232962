//! Batching scene renderer.
//!
//! A render pass walks the display list front to back, resolving every leaf
//! to a textured card and accumulating cards until a draw is forced: the
//! card buffer fills, a texture cannot get a sampler slot, or the walk ends.
//! Node caches draw their subtree into render targets through the same
//! machinery and then stand in for the subtree as a single card.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::foundation::core::{Affine, DrawState, Rect, Rgba8Premul, SurfaceSize, UvRect};
use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::render::batch::BatchBuffers;
use crate::render::driver::{BatchUpload, GpuDriver, GpuTextureHandle, ProgramHandle};
use crate::render::shader;
use crate::render::texture::{SlotInsert, TextureId, TextureStore};
use crate::scene::graph::Scene;
use crate::scene::node::{CacheBacking, CacheSpec, Node, NodeCache, NodeId, NodeKind};
use crate::scene::pixmap::Pixmap;
use crate::scene::source::{SheetId, SourceId};

/// Concatenated alpha below this draws nothing.
pub(crate) const VISIBILITY_THRESHOLD: f64 = 0.0035;

#[derive(Clone, Debug)]
pub struct RendererOpts {
    /// Sampler slots per batch. Clamped to what the driver supports.
    pub texture_slots: usize,
    /// Cards per draw before a vertex overflow forces a flush.
    pub max_cards_per_batch: usize,
    /// Reclaim source textures unused for this many draws; `None` disables
    /// the automatic sweep.
    pub auto_purge: Option<u64>,
    /// Source pixels are premultiplied already. When false, uploads
    /// premultiply a copy first.
    pub premultiplied_sources: bool,
    /// Color the output surface clears to each render; `None` clears to
    /// transparent.
    pub background: Option<Rgba8Premul>,
}

impl Default for RendererOpts {
    fn default() -> Self {
        Self {
            texture_slots: 8,
            max_cards_per_batch: 10_920,
            auto_purge: Some(1200),
            premultiplied_sources: true,
            background: None,
        }
    }
}

/// Counters accumulated since the renderer was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RenderStats {
    pub draw_calls: u64,
    pub cards_drawn: u64,
    pub texture_inserts: u64,
    pub purged_textures: u64,
    pub vertex_overflows: u64,
    pub texture_overflows: u64,
}

pub struct BatchRenderer {
    driver: Box<dyn GpuDriver>,
    store: TextureStore,
    buffers: BatchBuffers,
    opts: RendererOpts,
    width: u32,
    height: u32,
    projection: [f32; 16],
    /// Projection of the pass currently being drawn; swaps to a flipped,
    /// store-sized matrix during cache passes.
    active_projection: [f32; 16],
    batch_program: ProgramHandle,
    /// Compiled filter passes keyed by label. Seeded with the pass-through
    /// cover under `"cover"`.
    filter_programs: HashMap<String, ProgramHandle>,
    /// Slot count the batch program actually compiled with.
    slot_count: usize,
    /// Nonzero while a walk is on the stack; a nested draw flushes first.
    is_drawing: u32,
    batch_reason: &'static str,
    stats: RenderStats,
}

impl BatchRenderer {
    pub fn new(
        mut driver: Box<dyn GpuDriver>,
        size: SurfaceSize,
        opts: RendererOpts,
    ) -> ZoetropeResult<Self> {
        let limits = driver.limits();
        if size.width == 0 || size.height == 0 {
            return Err(ZoetropeError::validation("surface dimensions must be > 0"));
        }
        if size.width > limits.max_texture_size || size.height > limits.max_texture_size {
            return Err(ZoetropeError::texture(format!(
                "surface {}x{} exceeds the driver texture size limit ({})",
                size.width, size.height, limits.max_texture_size
            )));
        }

        // Drivers can refuse a slot count their limits claimed to support,
        // so step the batch shader down until it compiles.
        let mut slots = opts.texture_slots.clamp(1, limits.max_texture_slots.max(1));
        let batch_program = loop {
            let fragment = shader::build_batch_fragment(slots);
            match driver.compile_program("batch", shader::BATCH_VERTEX, &fragment, slots) {
                Ok(program) => break program,
                Err(err) if slots > 1 => {
                    let next = slots.saturating_sub(4).max(1);
                    warn!(
                        error = %err,
                        slots, next, "batch shader failed to compile, retrying with fewer slots"
                    );
                    slots = next;
                }
                Err(err) => {
                    return Err(ZoetropeError::render(format!(
                        "batch shader failed at every slot count: {err}"
                    )));
                }
            }
        };
        let cover_program =
            driver.compile_program("cover", shader::BATCH_VERTEX, &shader::cover_fragment(), 1)?;

        let store = TextureStore::new(driver.as_mut(), slots)?;
        driver.set_viewport(size.width, size.height);

        Ok(Self {
            store,
            buffers: BatchBuffers::new(opts.max_cards_per_batch.max(1)),
            width: size.width,
            height: size.height,
            projection: shader::projection(size.width, size.height),
            active_projection: shader::projection(size.width, size.height),
            batch_program,
            filter_programs: HashMap::from([("cover".to_owned(), cover_program)]),
            slot_count: slots,
            is_drawing: 0,
            batch_reason: "all",
            stats: RenderStats::default(),
            opts,
            driver,
        })
    }

    pub fn surface_size(&self) -> SurfaceSize {
        SurfaceSize {
            width: self.width,
            height: self.height,
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn opts(&self) -> &RendererOpts {
        &self.opts
    }

    /// Slot count the batch shader settled on; at most the requested count.
    pub fn texture_slots(&self) -> usize {
        self.slot_count
    }

    pub fn texture_store(&self) -> &TextureStore {
        &self.store
    }

    /// Resize the output surface.
    pub fn update_viewport(&mut self, size: SurfaceSize) -> ZoetropeResult<()> {
        if size.width == 0 || size.height == 0 {
            return Err(ZoetropeError::validation("surface dimensions must be > 0"));
        }
        let max = self.driver.limits().max_texture_size;
        if size.width > max || size.height > max {
            return Err(ZoetropeError::texture(format!(
                "surface {}x{} exceeds the driver texture size limit ({max})",
                size.width, size.height
            )));
        }
        self.width = size.width;
        self.height = size.height;
        self.projection = shader::projection(size.width, size.height);
        self.active_projection = self.projection;
        self.driver.set_viewport(size.width, size.height);
        Ok(())
    }

    /// Draw the whole scene to the output surface.
    pub fn render(&mut self, scene: &Scene) -> ZoetropeResult<()> {
        self.driver.bind_target(None);
        self.driver.set_viewport(self.width, self.height);
        self.active_projection = self.projection;
        let clear = self.opts.background.unwrap_or(Rgba8Premul::transparent());
        self.driver.clear(clear)?;

        let root = scene.root();
        self.run_batch(|r| r.append_node(scene, root, DrawState::identity(), false))?;

        if let Some(age) = self.opts.auto_purge {
            let div = age / 10;
            if div == 0 || self.store.draw_id() % div == 0 {
                let purged = self.store.purge(self.driver.as_mut(), age);
                self.stats.purged_textures += purged as u64;
            }
        }
        Ok(())
    }

    /// Install (or re-spec) a cache on a node and draw its content.
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

        let cache = match scene.node_mut(id).and_then(|n| n.cache.take()) {
            Some(mut old) => {
                old.spec = spec;
                if !matches!(old.backing, CacheBacking::Target { .. }) {
                    old.backing = CacheBacking::Target {
                        rt_a: None,
                        rt_b: None,
                        last_rt: None,
                    };
                }
                old
            }
            None => NodeCache {
                spec,
                backing: CacheBacking::Target {
                    rt_a: None,
                    rt_b: None,
                    last_rt: None,
                },
                cache_id: 0,
            },
        };
        if let Some(node) = scene.node_mut(id) {
            node.cache = Some(cache);
        }
        self.cache_draw(scene, id)
    }

    /// Redraw an existing cache after its content changed.
    pub fn update_cache(&mut self, scene: &mut Scene, id: NodeId) -> ZoetropeResult<()> {
        self.cache_draw(scene, id)
    }

    /// Drop a node's cache and release its render targets. Live content
    /// draws again on the next render.
    pub fn uncache(&mut self, scene: &mut Scene, id: NodeId) {
        if let Some(node) = scene.node_mut(id)
            && let Some(cache) = node.cache.take()
            && let CacheBacking::Target { rt_a, rt_b, .. } = cache.backing
        {
            for rt in [rt_a, rt_b].into_iter().flatten() {
                self.store.kill(self.driver.as_mut(), rt);
            }
        }
    }

    /// Release every driver texture reachable from a subtree.
    pub fn release_node(&mut self, scene: &mut Scene, id: NodeId) {
        self.store.release_node(self.driver.as_mut(), scene, id);
    }

    /// Reclaim source textures unused for `age` draws.
    pub fn purge_textures(&mut self, age: u64) -> usize {
        let purged = self.store.purge(self.driver.as_mut(), age);
        self.stats.purged_textures += purged as u64;
        purged
    }

    /// Read the output surface back to a CPU pixmap.
    pub fn to_pixmap(&mut self) -> ZoetropeResult<Pixmap> {
        let data = self.driver.read_pixels(None, self.width, self.height)?;
        Pixmap::from_rgba8_premul(self.width, self.height, data)
    }

    /// Read the output surface back as an unpremultiplied image buffer,
    /// ready for encoding.
    pub fn to_image(&mut self) -> ZoetropeResult<image::RgbaImage> {
        self.to_pixmap()?
            .to_image()
            .ok_or_else(|| ZoetropeError::render("readback did not match the surface size"))
    }

    /// Read a cached node's content back to a CPU pixmap.
    pub fn cache_to_pixmap(&mut self, scene: &Scene, id: NodeId) -> ZoetropeResult<Pixmap> {
        let Some(cache) = scene.node(id).and_then(|n| n.cache.as_ref()) else {
            return Err(ZoetropeError::validation("node is not cached"));
        };
        match &cache.backing {
            CacheBacking::Pixels(source) => {
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
            CacheBacking::Target { .. } => {
                let content = cache
                    .content_texture()
                    .ok_or_else(|| ZoetropeError::render("cache has no content"))?;
                let (handle, w, h) = self
                    .store
                    .entry(content)
                    .map(|e| (e.handle, e.width, e.height))
                    .ok_or_else(|| ZoetropeError::render("cache has no content"))?;
                let data = self.driver.read_pixels(Some(handle), w, h)?;
                Pixmap::from_rgba8_premul(w, h, data)
            }
        }
    }

    // One draw pass: bump the draw id, walk, and flush whatever the walk
    // accumulated.
    fn run_batch<F>(&mut self, walk: F) -> ZoetropeResult<()>
    where
        F: FnOnce(&mut Self) -> ZoetropeResult<()>,
    {
        if self.is_drawing > 0 {
            self.flush("nested draw")?;
        }
        self.is_drawing += 1;
        self.store.next_draw();
        self.buffers.clear();
        let result = walk(self).and_then(|()| self.flush("draw finish"));
        self.is_drawing -= 1;
        result
    }

    fn append_node(
        &mut self,
        scene: &Scene,
        id: NodeId,
        parent: DrawState,
        ignore_cache: bool,
    ) -> ZoetropeResult<()> {
        let Some(node) = scene.node(id) else {
            return Ok(());
        };
        if !node.visible {
            return Ok(());
        }
        let state = parent.child(node.local_matrix(), node.alpha);
        if state.alpha <= VISIBILITY_THRESHOLD {
            return Ok(());
        }
        self.append_content(scene, node, state, ignore_cache)
    }

    fn append_content(
        &mut self,
        scene: &Scene,
        node: &Node,
        state: DrawState,
        ignore_cache: bool,
    ) -> ZoetropeResult<()> {
        if !ignore_cache && let Some(cache) = &node.cache {
            let content = match &cache.backing {
                CacheBacking::Target { .. } => cache.content_texture(),
                CacheBacking::Pixels(source) => {
                    let texture =
                        self.store
                            .load_or_lookup(self.driver.as_mut(), scene.sources(), *source);
                    // software caches always hold premultiplied pixels
                    self.store
                        .ensure_uploaded(self.driver.as_mut(), scene.sources(), texture, true);
                    Some(texture)
                }
            };
            // a cache that never drew falls through to its live content
            if let Some(content) = content {
                return self.append_cache_card(cache, content, state);
            }
        }

        match &node.kind {
            NodeKind::Container => {}
            NodeKind::Bitmap {
                source,
                source_rect,
            } => self.append_bitmap(scene, *source, *source_rect, state)?,
            NodeKind::Sprite { sheet, frame } => {
                self.append_sprite(scene, *sheet, *frame, state)?;
            }
            NodeKind::Drawn { .. } => {
                // drawn surfaces reach the GPU only through a cache
            }
        }

        for child in node.children() {
            self.append_node(scene, *child, state, false)?;
        }
        Ok(())
    }

    fn append_bitmap(
        &mut self,
        scene: &Scene,
        source: SourceId,
        source_rect: Option<Rect>,
        state: DrawState,
    ) -> ZoetropeResult<()> {
        let texture = self
            .store
            .load_or_lookup(self.driver.as_mut(), scene.sources(), source);
        self.store.ensure_uploaded(
            self.driver.as_mut(),
            scene.sources(),
            texture,
            self.opts.premultiplied_sources,
        );

        let (width, height) = scene
            .sources()
            .get(source)
            .map_or((0, 0), |s| (s.width, s.height));
        if width == 0 || height == 0 {
            // still loading or failed; nothing to size a card by
            return Ok(());
        }

        let (rect, uv) = match source_rect {
            Some(sub) => (
                Rect::new(0.0, 0.0, sub.width(), sub.height()),
                UvRect::from_rect(sub, width, height),
            ),
            None => (
                Rect::new(0.0, 0.0, f64::from(width), f64::from(height)),
                UvRect::FULL,
            ),
        };
        self.push_textured_card(texture, rect, uv, state)
    }

    fn append_sprite(
        &mut self,
        scene: &Scene,
        sheet: SheetId,
        frame: f64,
        state: DrawState,
    ) -> ZoetropeResult<()> {
        let Some(sheet) = scene.sheet(sheet) else {
            return Ok(());
        };
        let index = frame.max(0.0).floor() as usize;
        let Some(frame) = sheet.frame(index) else {
            return Ok(());
        };

        let texture = self
            .store
            .load_or_lookup(self.driver.as_mut(), scene.sources(), frame.page);
        self.store.ensure_uploaded(
            self.driver.as_mut(),
            scene.sources(),
            texture,
            self.opts.premultiplied_sources,
        );

        let (page_w, page_h) = scene
            .sources()
            .get(frame.page)
            .map_or((0, 0), |s| (s.width, s.height));
        if page_w == 0 || page_h == 0 {
            return Ok(());
        }

        let r = frame.rect;
        let rect = Rect::new(
            -frame.reg_x,
            -frame.reg_y,
            r.width() - frame.reg_x,
            r.height() - frame.reg_y,
        );
        let uv = UvRect::from_rect(r, page_w, page_h);
        self.push_textured_card(texture, rect, uv, state)
    }

    fn append_cache_card(
        &mut self,
        cache: &NodeCache,
        content: TextureId,
        state: DrawState,
    ) -> ZoetropeResult<()> {
        let (store_w, store_h) = cache.spec.store_size();
        let scale = if cache.spec.scale > 0.0 {
            cache.spec.scale
        } else {
            1.0
        };
        let l = cache.spec.x;
        let t = cache.spec.y;
        let rect = Rect::new(
            l,
            t,
            f64::from(store_w) / scale + l,
            f64::from(store_h) / scale + t,
        );
        self.push_textured_card(content, rect, UvRect::FULL, state)
    }

    fn push_textured_card(
        &mut self,
        texture: TextureId,
        rect: Rect,
        uv: UvRect,
        state: DrawState,
    ) -> ZoetropeResult<()> {
        if self.buffers.is_full() {
            self.stats.vertex_overflows += 1;
            self.flush("vertex overflow")?;
        }
        let slot = self.slot_for(texture)?;
        self.buffers
            .push_card(state.matrix, rect, uv, slot, state.alpha as f32);
        Ok(())
    }

    fn slot_for(&mut self, texture: TextureId) -> ZoetropeResult<usize> {
        match self.store.insert_into_batch(texture) {
            SlotInsert::Resident(slot) => Ok(slot),
            SlotInsert::Placed(slot) => {
                self.stats.texture_inserts += 1;
                Ok(slot)
            }
            SlotInsert::Overflow => {
                self.stats.texture_overflows += 1;
                self.flush("texture overflow")?;
                let slot = self.store.take_start_slot(texture)?;
                self.stats.texture_inserts += 1;
                Ok(slot)
            }
        }
    }

    fn flush(&mut self, reason: &'static str) -> ZoetropeResult<()> {
        self.batch_reason = reason;
        self.draw_buffers()
    }

    fn draw_buffers(&mut self) -> ZoetropeResult<()> {
        if self.buffers.card_count() == 0 {
            return Ok(());
        }
        debug!(
            cards = self.buffers.card_count(),
            reason = self.batch_reason,
            "drawing batch"
        );
        let slots = self.store.slot_handles();
        let upload = BatchUpload {
            positions: self.buffers.positions(),
            uvs: self.buffers.uvs(),
            tex_indices: self.buffers.tex_indices(),
            alphas: self.buffers.alphas(),
            vertex_count: self.buffers.vertex_count(),
            slots: &slots,
            projection: &self.active_projection,
            program: self.batch_program,
        };
        self.driver.draw(&upload)?;
        self.stats.draw_calls += 1;
        self.stats.cards_drawn += self.buffers.card_count() as u64;
        self.store.next_batch();
        self.buffers.clear();
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(node = id.index()))]
    fn cache_draw(&mut self, scene: &mut Scene, id: NodeId) -> ZoetropeResult<()> {
        let Some(mut cache) = scene.node_mut(id).and_then(|n| n.cache.take()) else {
            return Err(ZoetropeError::validation("node is not cached"));
        };

        let (store_w, store_h) = cache.spec.store_size();
        let scale = if cache.spec.scale > 0.0 {
            cache.spec.scale
        } else {
            1.0
        };
        // content is drawn in node-local coordinates, shifted so the cache
        // region lands at the store origin
        let state = DrawState {
            matrix: Affine::scale(scale) * Affine::translate((-cache.spec.x, -cache.spec.y)),
            alpha: 1.0,
        };

        if self.is_drawing > 0 {
            self.flush("nested draw")?;
        }
        let last_slot = self.slot_count - 1;
        self.store.protect_slot(last_slot, true);
        let snapshot = self.store.snapshot_slots();

        let result = if cache.spec.filters.is_empty() {
            self.cache_content_pass(&*scene, id, &mut cache, state, store_w, store_h)
        } else {
            self.draw_filters(&*scene, id, &mut cache, state, store_w, store_h)
        };

        self.store.restore_slots(&snapshot);
        self.store.protect_slot(last_slot, false);
        self.driver.bind_target(None);
        self.driver.set_viewport(self.width, self.height);
        self.active_projection = self.projection;

        if result.is_ok() {
            cache.cache_id += 1;
        }
        if let Some(node) = scene.node_mut(id) {
            node.cache = Some(cache);
        }
        result
    }

    /// Draw a node's live content into the next ping-pong target.
    fn cache_content_pass(
        &mut self,
        scene: &Scene,
        id: NodeId,
        cache: &mut NodeCache,
        state: DrawState,
        store_w: u32,
        store_h: u32,
    ) -> ZoetropeResult<()> {
        let target = self.store.target_render_texture(
            self.driver.as_mut(),
            &mut cache.backing,
            store_w,
            store_h,
        )?;
        let handle = self
            .store
            .handle(target)
            .ok_or_else(|| ZoetropeError::texture("render target entry vanished"))?;

        self.driver.bind_target(Some(handle));
        self.driver.set_viewport(store_w, store_h);
        self.active_projection = shader::projection_flipped(store_w, store_h);
        self.driver.clear(Rgba8Premul::transparent())?;

        self.run_batch(|r| match scene.node(id) {
            Some(node) => r.append_content(scene, node, state, true),
            None => Ok(()),
        })?;

        if let CacheBacking::Target { last_rt, .. } = &mut cache.backing {
            *last_rt = Some(target);
        }
        Ok(())
    }

    /// Content pass, then one cover pass per filter body, ping-ponging
    /// between the cache's two targets. A filter whose shader does not
    /// compile is skipped with a warning rather than killing the cache.
    fn draw_filters(
        &mut self,
        scene: &Scene,
        id: NodeId,
        cache: &mut NodeCache,
        state: DrawState,
        store_w: u32,
        store_h: u32,
    ) -> ZoetropeResult<()> {
        self.cache_content_pass(scene, id, cache, state, store_w, store_h)?;

        let passes: Vec<(String, String)> = cache
            .spec
            .filters
            .iter()
            .flat_map(|f| {
                let mut p = vec![(f.label.clone(), f.fragment.clone())];
                if let Some(second) = &f.second_pass {
                    p.push((format!("{}#2", f.label), second.clone()));
                }
                p
            })
            .collect();

        for (label, body) in &passes {
            let Some(program) = self.filter_program(label, body) else {
                continue;
            };
            let source = cache
                .content_texture()
                .and_then(|t| self.store.handle(t))
                .ok_or_else(|| ZoetropeError::render("filter pass without content"))?;

            let target = self.store.target_render_texture(
                self.driver.as_mut(),
                &mut cache.backing,
                store_w,
                store_h,
            )?;
            let target_handle = self
                .store
                .handle(target)
                .ok_or_else(|| ZoetropeError::texture("render target entry vanished"))?;

            self.driver.bind_target(Some(target_handle));
            self.driver.set_viewport(store_w, store_h);
            self.active_projection = shader::projection_flipped(store_w, store_h);
            self.driver.clear(Rgba8Premul::transparent())?;
            self.draw_cover(program, source, store_w, store_h)?;

            if let CacheBacking::Target { last_rt, .. } = &mut cache.backing {
                *last_rt = Some(target);
            }
        }
        Ok(())
    }

    fn draw_cover(
        &mut self,
        program: ProgramHandle,
        source: GpuTextureHandle,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<()> {
        let mut cover = BatchBuffers::new(1);
        cover.push_cover(f64::from(width), f64::from(height));
        let slots = [source];
        let upload = BatchUpload {
            positions: cover.positions(),
            uvs: cover.uvs(),
            tex_indices: cover.tex_indices(),
            alphas: cover.alphas(),
            vertex_count: cover.vertex_count(),
            slots: &slots,
            projection: &self.active_projection,
            program,
        };
        self.driver.draw(&upload)?;
        self.stats.draw_calls += 1;
        Ok(())
    }

    fn filter_program(&mut self, label: &str, body: &str) -> Option<ProgramHandle> {
        if let Some(&program) = self.filter_programs.get(label) {
            return Some(program);
        }
        let fragment = shader::build_filter_fragment(body);
        match self
            .driver
            .compile_program(label, shader::BATCH_VERTEX, &fragment, 1)
        {
            Ok(program) => {
                self.filter_programs.insert(label.to_owned(), program);
                Some(program)
            }
            Err(err) => {
                warn!(label, error = %err, "filter shader failed to compile, skipping the pass");
                None
            }
        }
    }
}
