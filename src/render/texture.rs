//! Resident texture tracking for the batch renderer.
//!
//! The store maps pixel sources to driver textures, assigns them to the
//! fixed set of sampler slots a batch can address, and reclaims textures
//! that have not drawn for a while. One shared 1x1 base texture fills empty
//! slots and stands in for sources whose texture could not be created.

use std::collections::HashMap;

use tracing::warn;

use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::render::driver::{GpuDriver, GpuTextureHandle};
use crate::scene::graph::Scene;
use crate::scene::node::{CacheBacking, NodeId, NodeKind};
use crate::scene::source::{SourceId, SourceStore, premultiply_rgba8_in_place};

/// Handle to an entry in a [`TextureStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub(crate) u32);

impl TextureId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct TextureEntry {
    pub handle: GpuTextureHandle,
    pub width: u32,
    pub height: u32,
    /// Sampler slot this texture was last placed in. Stale once another
    /// texture takes the slot; the identity check in the insert path covers
    /// that.
    pub active_slot: Option<usize>,
    /// Batch the slot placement belongs to.
    pub batch_id: u64,
    /// Draw the texture last took part in; drives purging.
    pub draw_id: u64,
    pub is_render_target: bool,
    /// Backing source for uploads and purge decisions. Render targets and
    /// the base texture have none.
    pub source: Option<SourceId>,
    /// Source revision last pushed to the driver. A failed push still
    /// records the revision so it is not retried until the pixels change.
    pub uploaded_revision: u64,
    /// The last creation or upload attempt failed; the entry keeps drawing
    /// with whatever content it has.
    pub tainted: bool,
}

/// Outcome of asking for a sampler slot inside the current batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotInsert {
    /// Already placed earlier in this batch.
    Resident(usize),
    /// Newly placed, possibly evicting a texture from an older batch.
    Placed(usize),
    /// Every slot is taken by this batch; the caller must flush and then
    /// [`take_start_slot`](TextureStore::take_start_slot).
    Overflow,
}

#[derive(Debug)]
pub struct TextureStore {
    entries: Vec<Option<TextureEntry>>,
    free: Vec<u32>,
    by_source: HashMap<SourceId, TextureId>,
    /// Which entry occupies each sampler slot. Never shrinks; empty slots
    /// point at the base texture.
    slots: Vec<TextureId>,
    /// Slots excluded from placement while a protected pass runs.
    blacklist: Vec<bool>,
    /// Rotation point for slot probing, so consecutive placements spread
    /// over the slot table instead of fighting over slot 0.
    last_insert: usize,
    base: TextureId,
    batch_id: u64,
    draw_id: u64,
}

impl TextureStore {
    pub fn new(driver: &mut dyn GpuDriver, slot_count: usize) -> ZoetropeResult<Self> {
        let slot_count = slot_count.max(1);
        let handle = driver.create_texture(1, 1)?;
        let base = TextureId(0);
        Ok(Self {
            entries: vec![Some(TextureEntry {
                handle,
                width: 1,
                height: 1,
                active_slot: None,
                batch_id: 0,
                draw_id: 0,
                is_render_target: false,
                source: None,
                uploaded_revision: 0,
                tainted: false,
            })],
            free: Vec::new(),
            by_source: HashMap::new(),
            slots: vec![base; slot_count],
            blacklist: vec![false; slot_count],
            last_insert: slot_count - 1,
            base,
            batch_id: 1,
            draw_id: 0,
        })
    }

    pub fn base(&self) -> TextureId {
        self.base
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[TextureId] {
        &self.slots
    }

    /// Driver handles of the current slot table, in slot order.
    pub fn slot_handles(&self) -> Vec<GpuTextureHandle> {
        let base = self.base_handle();
        self.slots
            .iter()
            .map(|id| self.entry(*id).map_or(base, |e| e.handle))
            .collect()
    }

    pub fn entry(&self, id: TextureId) -> Option<&TextureEntry> {
        self.entries.get(id.index()).and_then(|e| e.as_ref())
    }

    pub fn handle(&self, id: TextureId) -> Option<GpuTextureHandle> {
        self.entry(id).map(|e| e.handle)
    }

    pub fn texture_for_source(&self, source: SourceId) -> Option<TextureId> {
        self.by_source.get(&source).copied()
    }

    /// Live entries, base included.
    pub fn texture_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn draw_id(&self) -> u64 {
        self.draw_id
    }

    /// Start the next batch: slot placements from the previous batch become
    /// evictable.
    pub fn next_batch(&mut self) {
        self.batch_id += 1;
    }

    pub fn next_draw(&mut self) {
        self.draw_id += 1;
    }

    pub fn protect_slot(&mut self, slot: usize, protected: bool) {
        if let Some(flag) = self.blacklist.get_mut(slot) {
            *flag = protected;
        }
    }

    /// Texture for a pixel source, creating one on first sight. Never fails:
    /// when the driver cannot create the texture the entry substitutes the
    /// base texture and is marked tainted.
    pub fn load_or_lookup(
        &mut self,
        driver: &mut dyn GpuDriver,
        sources: &SourceStore,
        source: SourceId,
    ) -> TextureId {
        if let Some(&id) = self.by_source.get(&source) {
            return id;
        }

        let src = sources.get(source);
        if src.is_none() {
            warn!(source = source.index(), "texture requested for an unknown source");
        }
        let (mut width, mut height) = src.map_or((1, 1), |s| (s.width.max(1), s.height.max(1)));
        let max = driver.limits().max_texture_size;
        let mut tainted = src.is_none();
        if width > max || height > max {
            warn!(width, height, max, "source exceeds the driver texture size limit");
            width = 1;
            height = 1;
            tainted = true;
        }

        let handle = match driver.create_texture(width, height) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "texture creation failed, substituting the base texture");
                tainted = true;
                width = 1;
                height = 1;
                self.base_handle()
            }
        };

        // A tainted entry absorbs the current revision so it retries only
        // when the pixels actually change.
        let uploaded_revision = if tainted {
            src.map_or(0, |s| s.revision)
        } else {
            0
        };

        let id = self.alloc(TextureEntry {
            handle,
            width,
            height,
            active_slot: None,
            batch_id: 0,
            draw_id: self.draw_id,
            is_render_target: false,
            source: Some(source),
            uploaded_revision,
            tainted,
        });
        self.by_source.insert(source, id);
        id
    }

    /// Push the source's pixels to the driver if its revision moved since
    /// the last push. Resizes the driver texture when the source changed
    /// dimensions. Failures warn once per revision and taint the entry.
    pub fn ensure_uploaded(
        &mut self,
        driver: &mut dyn GpuDriver,
        sources: &SourceStore,
        id: TextureId,
        premultiplied: bool,
    ) {
        let base_handle = self.base_handle();
        let Some(entry) = self.entries.get_mut(id.index()).and_then(|e| e.as_mut()) else {
            return;
        };
        let Some(source) = entry.source else { return };
        let Some(src) = sources.get(source) else { return };
        if src.revision == entry.uploaded_revision {
            return;
        }
        entry.uploaded_revision = src.revision;

        let Some(pixels) = src.pixels.as_ref().filter(|_| src.is_ready()) else {
            return;
        };
        if src.width == 0 || src.height == 0 {
            return;
        }

        let max = driver.limits().max_texture_size;
        if src.width > max || src.height > max {
            warn!(
                width = src.width,
                height = src.height,
                max,
                "source exceeds the driver texture size limit"
            );
            entry.tainted = true;
            return;
        }

        if (entry.width, entry.height) != (src.width, src.height) {
            match driver.create_texture(src.width, src.height) {
                Ok(fresh) => {
                    let old = entry.handle;
                    entry.handle = fresh;
                    entry.width = src.width;
                    entry.height = src.height;
                    if old != base_handle {
                        driver.destroy_texture(old);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "texture resize failed, keeping the old texture");
                    entry.tainted = true;
                    return;
                }
            }
        }

        let expected = (src.width as usize) * (src.height as usize) * 4;
        if pixels.len() != expected {
            warn!(
                len = pixels.len(),
                expected, "source pixel buffer length does not match its dimensions"
            );
            entry.tainted = true;
            return;
        }

        let result = if premultiplied {
            driver.upload_pixels(entry.handle, src.width, src.height, pixels)
        } else {
            let mut straight = pixels.as_ref().clone();
            premultiply_rgba8_in_place(&mut straight);
            driver.upload_pixels(entry.handle, src.width, src.height, &straight)
        };
        match result {
            Ok(()) => entry.tainted = false,
            Err(err) => {
                warn!(error = %err, "texture upload failed");
                entry.tainted = true;
            }
        }
    }

    /// Give the texture a sampler slot for the current batch.
    pub fn insert_into_batch(&mut self, id: TextureId) -> SlotInsert {
        let resident = self
            .entry(id)
            .and_then(|e| e.active_slot)
            .filter(|&slot| self.slots[slot] == id);
        if let Some(slot) = resident {
            self.mark_used(id);
            return SlotInsert::Resident(slot);
        }

        let count = self.slots.len();
        let start = (self.last_insert + 1) % count;
        for i in 0..count {
            let probe = (start + i) % count;
            if self.blacklist[probe] {
                continue;
            }
            let occupant = self.slots[probe];
            if occupant != id
                && self
                    .entry(occupant)
                    .is_some_and(|e| e.batch_id == self.batch_id)
            {
                continue;
            }
            self.place(id, probe);
            return SlotInsert::Placed(probe);
        }
        SlotInsert::Overflow
    }

    /// After an overflow flush, seize the next unprotected slot regardless
    /// of who holds it. Fails only when every slot is protected.
    pub fn take_start_slot(&mut self, id: TextureId) -> ZoetropeResult<usize> {
        let count = self.slots.len();
        let start = (self.last_insert + 1) % count;
        for i in 0..count {
            let probe = (start + i) % count;
            if self.blacklist[probe] {
                continue;
            }
            self.place(id, probe);
            return Ok(probe);
        }
        Err(ZoetropeError::render("every texture slot is protected"))
    }

    fn place(&mut self, id: TextureId, slot: usize) {
        let evicted = self.slots[slot];
        if evicted != id
            && let Some(e) = self.entry_mut(evicted)
            && e.active_slot == Some(slot)
        {
            e.active_slot = None;
        }
        self.slots[slot] = id;
        if let Some(e) = self.entry_mut(id) {
            e.active_slot = Some(slot);
        }
        self.last_insert = slot;
        self.mark_used(id);
    }

    fn mark_used(&mut self, id: TextureId) {
        let (batch, draw) = (self.batch_id, self.draw_id);
        if let Some(e) = self.entry_mut(id) {
            e.batch_id = batch;
            e.draw_id = draw;
        }
    }

    /// Reclaim source textures that have not drawn within `age` draws.
    /// Render targets and the base texture are never purged. Returns how
    /// many textures were killed.
    pub fn purge(&mut self, driver: &mut dyn GpuDriver, age: u64) -> usize {
        let mut doomed = Vec::new();
        for (i, slot) in self.entries.iter().enumerate() {
            let Some(entry) = slot else { continue };
            if entry.source.is_none() {
                continue;
            }
            if entry.draw_id + age <= self.draw_id {
                doomed.push(TextureId(i as u32));
            }
        }
        for id in &doomed {
            self.kill(driver, *id);
        }
        doomed.len()
    }

    /// Drop an entry: repoint its slots at the base texture, clear the
    /// source mapping, and destroy the driver texture unless it is the
    /// shared base object.
    pub fn kill(&mut self, driver: &mut dyn GpuDriver, id: TextureId) {
        if id == self.base {
            return;
        }
        let Some(entry) = self.entries.get_mut(id.index()).and_then(|e| e.take()) else {
            return;
        };
        let base = self.base;
        for slot in self.slots.iter_mut() {
            if *slot == id {
                *slot = base;
            }
        }
        if let Some(source) = entry.source
            && self.by_source.get(&source) == Some(&id)
        {
            self.by_source.remove(&source);
        }
        if entry.handle != self.base_handle() {
            driver.destroy_texture(entry.handle);
        }
        self.free.push(id.0);
    }

    /// Register a render target sized exactly to the request.
    pub fn create_render_target(
        &mut self,
        driver: &mut dyn GpuDriver,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<TextureId> {
        let max = driver.limits().max_texture_size;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(ZoetropeError::texture(format!(
                "render target {width}x{height} outside driver limits (max {max})"
            )));
        }
        let handle = driver.create_render_target(width, height)?;
        Ok(self.alloc(TextureEntry {
            handle,
            width,
            height,
            active_slot: None,
            batch_id: 0,
            draw_id: self.draw_id,
            is_render_target: true,
            source: None,
            uploaded_revision: 0,
            tainted: false,
        }))
    }

    /// The render target to draw the next cache pass into: the ping-pong
    /// partner of `last_rt`, created lazily and resized in place when the
    /// requested size changed. The id stays stable across resizes so
    /// scene-side references survive.
    pub fn target_render_texture(
        &mut self,
        driver: &mut dyn GpuDriver,
        backing: &mut CacheBacking,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<TextureId> {
        let CacheBacking::Target { rt_a, rt_b, last_rt } = backing else {
            return Err(ZoetropeError::texture("cache is not target backed"));
        };
        let pick = if last_rt.is_some() && *last_rt == *rt_a {
            rt_b
        } else {
            rt_a
        };

        let id = match *pick {
            Some(existing) if self.entry(existing).is_some() => existing,
            _ => {
                let fresh = self.create_render_target(driver, width, height)?;
                *pick = Some(fresh);
                fresh
            }
        };

        let current = self
            .entry(id)
            .map(|e| (e.width, e.height))
            .ok_or_else(|| ZoetropeError::texture("render target entry vanished"))?;
        if current != (width, height) {
            let base_handle = self.base_handle();
            let fresh = driver.create_render_target(width, height)?;
            if let Some(entry) = self.entry_mut(id) {
                let old = entry.handle;
                entry.handle = fresh;
                entry.width = width;
                entry.height = height;
                if old != base_handle {
                    driver.destroy_texture(old);
                }
            }
        }
        Ok(id)
    }

    /// Copy of the slot table, taken before a protected pass rewrites it.
    pub fn snapshot_slots(&self) -> Vec<TextureId> {
        self.slots.clone()
    }

    /// Put a snapshot back, repairing placements so the restored occupants
    /// hit the resident fast path again. Entries killed in the meantime
    /// fall back to the base texture.
    pub fn restore_slots(&mut self, snapshot: &[TextureId]) {
        debug_assert_eq!(snapshot.len(), self.slots.len());
        for (slot, id) in snapshot.iter().enumerate() {
            let id = if self.entry(*id).is_some() {
                *id
            } else {
                self.base
            };
            self.slots[slot] = id;
            if id != self.base
                && let Some(e) = self.entry_mut(id)
            {
                e.active_slot = Some(slot);
            }
        }
    }

    /// Release every driver texture reachable from a subtree: caches,
    /// bitmap sources, sprite sheet pages, and drawn surfaces. Caches are
    /// dropped from the nodes as their targets die.
    pub fn release_node(&mut self, driver: &mut dyn GpuDriver, scene: &mut Scene, id: NodeId) {
        let children: Vec<NodeId> = scene
            .node(id)
            .map(|n| n.children().to_vec())
            .unwrap_or_default();
        for child in children {
            self.release_node(driver, scene, child);
        }

        let mut sources: Vec<SourceId> = Vec::new();
        match scene.node(id).map(|n| &n.kind) {
            Some(NodeKind::Bitmap { source, .. }) => sources.push(*source),
            Some(NodeKind::Drawn { surface }) => sources.push(*surface),
            Some(NodeKind::Sprite { sheet, .. }) => {
                if let Some(sheet) = scene.sheet(*sheet) {
                    sources.extend(sheet.pages.iter().copied());
                }
            }
            _ => {}
        }

        let mut targets: Vec<TextureId> = Vec::new();
        if let Some(node) = scene.node_mut(id)
            && let Some(cache) = node.cache.take()
        {
            match cache.backing {
                CacheBacking::Target { rt_a, rt_b, .. } => {
                    targets.extend([rt_a, rt_b].into_iter().flatten());
                }
                CacheBacking::Pixels(source) => sources.push(source),
            }
        }

        for target in targets {
            self.kill(driver, target);
        }
        for source in sources {
            if let Some(&tex) = self.by_source.get(&source) {
                self.kill(driver, tex);
            }
        }
    }

    fn base_handle(&self) -> GpuTextureHandle {
        self.entry(self.base)
            .map_or(GpuTextureHandle(0), |e| e.handle)
    }

    fn entry_mut(&mut self, id: TextureId) -> Option<&mut TextureEntry> {
        self.entries.get_mut(id.index()).and_then(|e| e.as_mut())
    }

    fn alloc(&mut self, entry: TextureEntry) -> TextureId {
        match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                TextureId(slot)
            }
            None => {
                let id = TextureId(self.entries.len() as u32);
                self.entries.push(Some(entry));
                id
            }
        }
    }
}
