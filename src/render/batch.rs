use crate::foundation::core::{Affine, Rect, UvRect};

/// Vertex accumulation for one draw: a card is a textured quad emitted as
/// two triangles (six vertices). The four attribute streams grow in lockstep
/// and are reused across draws via [`clear`](BatchBuffers::clear).
#[derive(Debug)]
pub struct BatchBuffers {
    positions: Vec<f32>,
    uvs: Vec<f32>,
    tex_indices: Vec<f32>,
    alphas: Vec<f32>,
    max_cards: usize,
    cards: usize,
}

impl BatchBuffers {
    pub fn new(max_cards: usize) -> Self {
        let verts = max_cards * 6;
        Self {
            positions: Vec::with_capacity(verts * 2),
            uvs: Vec::with_capacity(verts * 2),
            tex_indices: Vec::with_capacity(verts),
            alphas: Vec::with_capacity(verts),
            max_cards,
            cards: 0,
        }
    }

    /// Append one card. The caller checks [`is_full`](BatchBuffers::is_full)
    /// first; a card is never split across draws.
    ///
    /// Corners of `rect` are pushed as two triangles sharing the diagonal:
    /// top left, bottom left, top right, then bottom left, top right, bottom
    /// right. Texture index and alpha are constant across the six vertices.
    pub fn push_card(&mut self, matrix: Affine, rect: Rect, uv: UvRect, slot: usize, alpha: f32) {
        let [a, b, c, d, e, f] = matrix.as_coeffs();

        let corner = |x: f64, y: f64| -> [f32; 2] {
            [
                (a * x + c * y + e) as f32,
                (b * x + d * y + f) as f32,
            ]
        };
        let tl = corner(rect.x0, rect.y0);
        let bl = corner(rect.x0, rect.y1);
        let tr = corner(rect.x1, rect.y0);
        let br = corner(rect.x1, rect.y1);

        for p in [tl, bl, tr, bl, tr, br] {
            self.positions.extend_from_slice(&p);
        }
        for t in [
            [uv.l, uv.t],
            [uv.l, uv.b],
            [uv.r, uv.t],
            [uv.l, uv.b],
            [uv.r, uv.t],
            [uv.r, uv.b],
        ] {
            self.uvs.extend_from_slice(&t);
        }
        let index = slot as f32;
        for _ in 0..6 {
            self.tex_indices.push(index);
            self.alphas.push(alpha);
        }
        self.cards += 1;
    }

    /// Append a target-filling quad sampling slot 0, used by filter and
    /// cover passes.
    pub fn push_cover(&mut self, width: f64, height: f64) {
        self.push_card(
            Affine::IDENTITY,
            Rect::new(0.0, 0.0, width, height),
            UvRect::FULL,
            0,
            1.0,
        );
    }

    pub fn is_full(&self) -> bool {
        self.cards >= self.max_cards
    }

    pub fn card_count(&self) -> usize {
        self.cards
    }

    pub fn vertex_count(&self) -> usize {
        self.cards * 6
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.uvs.clear();
        self.tex_indices.clear();
        self.alphas.clear();
        self.cards = 0;
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn uvs(&self) -> &[f32] {
        &self.uvs
    }

    pub fn tex_indices(&self) -> &[f32] {
        &self.tex_indices
    }

    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }
}
