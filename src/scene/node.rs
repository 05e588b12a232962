use serde::{Deserialize, Serialize};

use crate::foundation::core::{Affine, NodeTransform, Rect};
use crate::render::texture::TextureId;
use crate::scene::source::{SheetId, SourceId};
use crate::tween::props::{PropValue, TweenTarget};

/// Handle to a node slot in a [`Scene`](crate::scene::graph::Scene).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Groups children; draws nothing itself.
    Container,
    /// Draws a pixel source, optionally restricted to a sub-rectangle.
    Bitmap {
        source: SourceId,
        source_rect: Option<Rect>,
    },
    /// Draws one frame of a sprite sheet. Fractional frames floor at draw
    /// time so the index can be tweened.
    Sprite { sheet: SheetId, frame: f64 },
    /// CPU-drawn surface. The GPU path reaches it only through its cache;
    /// the software path blits the surface directly.
    Drawn { surface: SourceId },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// Post-process pass applied when a cache is drawn. The fragment body is
/// compiled and reused per label.
pub struct Filter {
    pub label: String,
    /// WGSL fragment body sampling `src` at `uv`.
    pub fragment: String,
    #[serde(default)]
    pub second_pass: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// Region and options for caching a node's rendered content.
pub struct CacheSpec {
    /// Cache region origin in node-local coordinates.
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Resolution multiplier for the backing store.
    #[serde(default = "default_cache_scale")]
    pub scale: f64,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

fn default_cache_scale() -> f64 {
    1.0
}

impl CacheSpec {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale: 1.0,
            filters: Vec::new(),
        }
    }

    /// Backing store size in pixels, after the scale multiplier.
    pub fn store_size(&self) -> (u32, u32) {
        let w = (self.width * self.scale).ceil().max(1.0) as u32;
        let h = (self.height * self.scale).ceil().max(1.0) as u32;
        (w, h)
    }
}

#[derive(Clone, Debug)]
pub enum CacheBacking {
    /// Software backing: pixels live in the source store.
    Pixels(SourceId),
    /// GPU backing: ping-pong render targets owned by the texture store.
    Target {
        rt_a: Option<TextureId>,
        rt_b: Option<TextureId>,
        last_rt: Option<TextureId>,
    },
}

#[derive(Clone, Debug)]
pub struct NodeCache {
    pub spec: CacheSpec,
    pub backing: CacheBacking,
    /// Bumped every time the cache content is redrawn.
    pub cache_id: u64,
}

impl NodeCache {
    /// The texture currently holding the cache content, if the GPU path has
    /// produced one.
    pub fn content_texture(&self) -> Option<TextureId> {
        match self.backing {
            CacheBacking::Target { last_rt, .. } => last_rt,
            CacheBacking::Pixels(_) => None,
        }
    }
}

/// One display-list entry: a transform, paint state, and content kind.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub transform: NodeTransform,
    /// When set, overrides the decomposed transform entirely.
    pub transform_matrix: Option<Affine>,
    pub alpha: f64,
    pub visible: bool,
    pub kind: NodeKind,
    pub cache: Option<NodeCache>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            transform: NodeTransform::default(),
            transform_matrix: None,
            alpha: 1.0,
            visible: true,
            kind,
            cache: None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn local_matrix(&self) -> Affine {
        match self.transform_matrix {
            Some(m) => m,
            None => self.transform.to_affine(),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container)
    }
}

impl TweenTarget for Node {
    fn get_prop(&self, name: &str) -> Option<PropValue> {
        let t = &self.transform;
        let n = match name {
            "x" => t.x,
            "y" => t.y,
            "scale_x" => t.scale_x,
            "scale_y" => t.scale_y,
            "rotation" => t.rotation,
            "skew_x" => t.skew_x,
            "skew_y" => t.skew_y,
            "reg_x" => t.reg_x,
            "reg_y" => t.reg_y,
            "alpha" => self.alpha,
            "frame" => match self.kind {
                NodeKind::Sprite { frame, .. } => frame,
                _ => return None,
            },
            "visible" => {
                return Some(PropValue::Discrete(serde_json::Value::Bool(self.visible)));
            }
            _ => return None,
        };
        Some(PropValue::Number(n))
    }

    fn set_prop(&mut self, name: &str, value: &PropValue) {
        match name {
            "visible" => {
                if let Some(v) = value.as_bool() {
                    self.visible = v;
                }
            }
            "frame" => {
                if let NodeKind::Sprite { frame, .. } = &mut self.kind
                    && let Some(v) = value.as_number()
                {
                    *frame = v;
                }
            }
            _ => {
                let Some(v) = value.as_number() else { return };
                let t = &mut self.transform;
                match name {
                    "x" => t.x = v,
                    "y" => t.y = v,
                    "scale_x" => t.scale_x = v,
                    "scale_y" => t.scale_y = v,
                    "rotation" => t.rotation = v,
                    "skew_x" => t.skew_x = v,
                    "skew_y" => t.skew_y = v,
                    "reg_x" => t.reg_x = v,
                    "reg_y" => t.reg_y = v,
                    "alpha" => self.alpha = v,
                    _ => {}
                }
            }
        }
    }
}
