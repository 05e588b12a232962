use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::foundation::core::Rect;
use crate::foundation::error::{ZoetropeError, ZoetropeResult};
use crate::scene::pixmap::Pixmap;

/// Handle to an entry in a [`SourceStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub(crate) u32);

impl SourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Registered but pixels not available yet.
    Pending,
    /// Pixels are resident and uploadable.
    Ready,
    /// The load failed; the source stays unusable.
    Failed,
}

#[derive(Clone, Debug)]
/// Pixel source in premultiplied RGBA8 form, keyed for dedup.
pub struct ImageSource {
    /// Stable lookup key: a URI for loaded images, `canvas_N` for surfaces.
    pub key: String,
    /// Width in pixels. Zero until the source is ready.
    pub width: u32,
    /// Height in pixels. Zero until the source is ready.
    pub height: u32,
    /// Pixel bytes in row-major premultiplied RGBA8.
    pub pixels: Option<Arc<Vec<u8>>>,
    pub state: SourceState,
    /// Bumped on every pixel change so uploads can detect staleness.
    pub revision: u64,
}

impl ImageSource {
    pub fn is_ready(&self) -> bool {
        self.state == SourceState::Ready
    }
}

/// Registry of pixel sources shared by the renderers and the scene graph.
///
/// Keys dedup registration: asking for an already-known key returns the
/// existing id instead of a second copy of the pixels.
#[derive(Debug, Default)]
pub struct SourceStore {
    entries: Vec<ImageSource>,
    by_key: HashMap<String, SourceId>,
    canvas_counter: u32,
}

impl SourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: SourceId) -> Option<&ImageSource> {
        self.entries.get(id.index())
    }

    pub fn lookup(&self, key: &str) -> Option<SourceId> {
        self.by_key.get(key).copied()
    }

    /// Register a key with no pixels yet. Returns the existing id when the
    /// key is already known.
    pub fn register_pending(&mut self, key: impl Into<String>) -> SourceId {
        let key = key.into();
        if let Some(id) = self.by_key.get(&key) {
            return *id;
        }
        self.push_entry(ImageSource {
            key,
            width: 0,
            height: 0,
            pixels: None,
            state: SourceState::Pending,
            revision: 0,
        })
    }

    /// Register a ready source from an in-memory surface.
    pub fn register_pixmap(&mut self, key: impl Into<String>, pixmap: &Pixmap) -> SourceId {
        let key = key.into();
        if let Some(id) = self.by_key.get(&key).copied() {
            self.set_pixels(id, pixmap.width(), pixmap.height(), pixmap.data().to_vec());
            return id;
        }
        self.push_entry(ImageSource {
            key,
            width: pixmap.width(),
            height: pixmap.height(),
            pixels: Some(Arc::new(pixmap.data().to_vec())),
            state: SourceState::Ready,
            revision: 1,
        })
    }

    /// Register a blank mutable surface under a fresh `canvas_N` key.
    pub fn register_canvas(&mut self, width: u32, height: u32) -> ZoetropeResult<SourceId> {
        let pixmap = Pixmap::new(width, height)?;
        let key = format!("canvas_{}", self.canvas_counter);
        self.canvas_counter += 1;
        Ok(self.register_pixmap(key, &pixmap))
    }

    /// Decode encoded image bytes (PNG, JPEG, ...) and register them ready.
    pub fn decode_bytes(&mut self, key: impl Into<String>, bytes: &[u8]) -> ZoetropeResult<SourceId> {
        let key = key.into();
        let dyn_img = image::load_from_memory(bytes).context("decode image from memory")?;
        let rgba = dyn_img.to_rgba8();
        let (width, height) = rgba.dimensions();

        let mut rgba8_premul = rgba.into_raw();
        premultiply_rgba8_in_place(&mut rgba8_premul);

        if let Some(id) = self.by_key.get(&key).copied() {
            self.set_pixels(id, width, height, rgba8_premul);
            return Ok(id);
        }
        Ok(self.push_entry(ImageSource {
            key,
            width,
            height,
            pixels: Some(Arc::new(rgba8_premul)),
            state: SourceState::Ready,
            revision: 1,
        }))
    }

    /// Read and decode an image file, keyed by its path.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ZoetropeResult<SourceId> {
        let path = path.as_ref();
        let key = path.to_string_lossy().into_owned();
        let bytes = std::fs::read(path)
            .with_context(|| format!("read image file {}", path.display()))?;
        self.decode_bytes(key, &bytes)
    }

    /// Attach pixels to a pending source, marking it ready.
    pub fn mark_loaded(
        &mut self,
        id: SourceId,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> ZoetropeResult<()> {
        let expected = (width as usize) * (height as usize) * 4;
        if pixels.len() != expected {
            return Err(ZoetropeError::validation(format!(
                "source pixel buffer is {} bytes, expected {expected}",
                pixels.len()
            )));
        }
        if self.get(id).is_none() {
            return Err(ZoetropeError::validation("unknown source id"));
        }
        self.set_pixels(id, width, height, pixels);
        Ok(())
    }

    pub fn mark_failed(&mut self, id: SourceId) {
        if let Some(entry) = self.entries.get_mut(id.index()) {
            entry.state = SourceState::Failed;
            entry.pixels = None;
        }
    }

    /// Replace the pixels of a ready source in place, e.g. after a canvas
    /// surface was redrawn. Bumps the revision so renderers re-upload.
    pub fn replace_pixels(&mut self, id: SourceId, pixmap: &Pixmap) -> ZoetropeResult<()> {
        if self.get(id).is_none() {
            return Err(ZoetropeError::validation("unknown source id"));
        }
        self.set_pixels(id, pixmap.width(), pixmap.height(), pixmap.data().to_vec());
        Ok(())
    }

    fn set_pixels(&mut self, id: SourceId, width: u32, height: u32, pixels: Vec<u8>) {
        let entry = &mut self.entries[id.index()];
        entry.width = width;
        entry.height = height;
        entry.pixels = Some(Arc::new(pixels));
        entry.state = SourceState::Ready;
        entry.revision += 1;
    }

    fn push_entry(&mut self, entry: ImageSource) -> SourceId {
        let id = SourceId(self.entries.len() as u32);
        self.by_key.insert(entry.key.clone(), id);
        self.entries.push(entry);
        id
    }
}

pub(crate) fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

/// Handle to a sprite sheet registered on a scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SheetId(pub(crate) u32);

impl SheetId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// Declarative sheet description: page image keys plus frame rectangles.
pub struct SpriteSheetData {
    pub images: Vec<String>,
    pub frames: Vec<FrameDef>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FrameDef {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Index into [`SpriteSheetData::images`].
    #[serde(default)]
    pub image_index: usize,
    #[serde(default)]
    pub reg_x: f64,
    #[serde(default)]
    pub reg_y: f64,
}

#[derive(Clone, Debug)]
pub struct SpriteFrame {
    /// Page image holding this frame's pixels.
    pub page: SourceId,
    /// Frame rectangle in page pixel coordinates.
    pub rect: Rect,
    pub reg_x: f64,
    pub reg_y: f64,
}

#[derive(Clone, Debug)]
pub struct SpriteSheet {
    pub pages: Vec<SourceId>,
    pub frames: Vec<SpriteFrame>,
}

impl SpriteSheet {
    /// Resolve a sheet description against the store, registering pending
    /// sources for page keys the store has not seen yet.
    pub fn from_data(store: &mut SourceStore, data: &SpriteSheetData) -> ZoetropeResult<Self> {
        if data.images.is_empty() {
            return Err(ZoetropeError::validation(
                "sprite sheet needs at least one page image",
            ));
        }
        let pages: Vec<SourceId> = data
            .images
            .iter()
            .map(|key| store.register_pending(key.clone()))
            .collect();

        let mut frames = Vec::with_capacity(data.frames.len());
        for (i, f) in data.frames.iter().enumerate() {
            let page = *pages.get(f.image_index).ok_or_else(|| {
                ZoetropeError::validation(format!(
                    "frame {i} references page {} of {}",
                    f.image_index,
                    pages.len()
                ))
            })?;
            if f.width <= 0.0 || f.height <= 0.0 {
                return Err(ZoetropeError::validation(format!(
                    "frame {i} must have positive size"
                )));
            }
            frames.push(SpriteFrame {
                page,
                rect: Rect::new(f.x, f.y, f.x + f.width, f.y + f.height),
                reg_x: f.reg_x,
                reg_y: f.reg_y,
            });
        }

        Ok(Self { pages, frames })
    }

    pub fn frame(&self, index: usize) -> Option<&SpriteFrame> {
        self.frames.get(index)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}
