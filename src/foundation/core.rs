pub use kurbo::{Affine, Point, Rect, Vec2};

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// Integer pixel dimensions of a drawing surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

/// Premultiplied RGBA8 (r,g,b already multiplied by a).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rgba8Premul {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8Premul {
    pub fn transparent() -> Self {
        Self {
            r: 0,
            g: 0,
            b: 0,
            a: 0,
        }
    }

    pub fn from_straight_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        fn premul(c: u8, a: u8) -> u8 {
            let c = u16::from(c);
            let a = u16::from(a);
            (((c * a) + 127) / 255) as u8
        }

        Self {
            r: premul(r, a),
            g: premul(g, a),
            b: premul(b, a),
            a,
        }
    }
}

/// Decomposed 2D transform of a scene node.
///
/// Angles are in degrees. `reg_x`/`reg_y` is the registration point: the local
/// coordinate that lands on (`x`, `y`) after the transform is applied.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NodeTransform {
    pub x: f64,
    pub y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub rotation: f64,
    pub skew_x: f64,
    pub skew_y: f64,
    pub reg_x: f64,
    pub reg_y: f64,
}

impl Default for NodeTransform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            skew_x: 0.0,
            skew_y: 0.0,
            reg_x: 0.0,
            reg_y: 0.0,
        }
    }
}

impl NodeTransform {
    pub fn translation(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    /// Collapse to the equivalent affine matrix.
    ///
    /// Order: skew, then rotation and scale, then the registration offset. With
    /// no skew the skew stage degenerates to the translation alone.
    pub fn to_affine(self) -> Affine {
        let r = self.rotation * DEG_TO_RAD;
        let (sin, cos) = if self.rotation == 0.0 {
            (0.0, 1.0)
        } else {
            r.sin_cos()
        };

        let mut m = if self.skew_x != 0.0 || self.skew_y != 0.0 {
            let kx = self.skew_x * DEG_TO_RAD;
            let ky = self.skew_y * DEG_TO_RAD;
            let skew = Affine::new([ky.cos(), ky.sin(), -kx.sin(), kx.cos(), self.x, self.y]);
            let rot_scale = Affine::new([
                cos * self.scale_x,
                sin * self.scale_x,
                -sin * self.scale_y,
                cos * self.scale_y,
                0.0,
                0.0,
            ]);
            skew * rot_scale
        } else {
            Affine::new([
                cos * self.scale_x,
                sin * self.scale_x,
                -sin * self.scale_y,
                cos * self.scale_y,
                self.x,
                self.y,
            ])
        };

        if self.reg_x != 0.0 || self.reg_y != 0.0 {
            m *= Affine::translate((-self.reg_x, -self.reg_y));
        }
        m
    }
}

/// Concatenated drawing state handed down a scene walk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawState {
    pub matrix: Affine,
    pub alpha: f64,
}

impl DrawState {
    pub fn identity() -> Self {
        Self {
            matrix: Affine::IDENTITY,
            alpha: 1.0,
        }
    }

    /// Concatenate a child's local transform and alpha onto this state.
    pub fn child(self, local: Affine, alpha: f64) -> Self {
        Self {
            matrix: self.matrix * local,
            alpha: self.alpha * alpha,
        }
    }
}

/// Normalized texture coordinates of a source rectangle.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UvRect {
    pub l: f32,
    pub t: f32,
    pub r: f32,
    pub b: f32,
}

impl UvRect {
    pub const FULL: Self = Self {
        l: 0.0,
        t: 0.0,
        r: 1.0,
        b: 1.0,
    };

    /// Normalize a pixel-space source rect against an image of the given size.
    pub fn from_rect(rect: Rect, width: u32, height: u32) -> Self {
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        Self {
            l: (rect.x0 / w) as f32,
            t: (rect.y0 / h) as f32,
            r: (rect.x1 / w) as f32,
            b: (rect.y1 / h) as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_to_affine_identity_and_translation() {
        let t = NodeTransform::default();
        assert_eq!(t.to_affine(), Affine::IDENTITY);

        let t = NodeTransform::translation(10.0, -2.5);
        assert_eq!(t.to_affine(), Affine::translate((10.0, -2.5)));
    }

    #[test]
    fn transform_rotation_quarter_turn() {
        let t = NodeTransform {
            rotation: 90.0,
            ..NodeTransform::default()
        };
        let p = t.to_affine() * Point::new(1.0, 0.0);
        assert!((p.x - 0.0).abs() < 1e-9);
        assert!((p.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn registration_point_lands_on_position() {
        let t = NodeTransform {
            x: 100.0,
            y: 50.0,
            rotation: 37.0,
            scale_x: 2.0,
            reg_x: 8.0,
            reg_y: 4.0,
            ..NodeTransform::default()
        };
        let p = t.to_affine() * Point::new(8.0, 4.0);
        assert!((p.x - 100.0).abs() < 1e-9);
        assert!((p.y - 50.0).abs() < 1e-9);
    }

    #[test]
    fn uv_rect_normalizes_against_image_size() {
        let uv = UvRect::from_rect(Rect::new(16.0, 8.0, 48.0, 40.0), 64, 64);
        assert_eq!(uv.l, 0.25);
        assert_eq!(uv.t, 0.125);
        assert_eq!(uv.r, 0.75);
        assert_eq!(uv.b, 0.625);
    }

    #[test]
    fn draw_state_concatenates_alpha() {
        let s = DrawState::identity().child(Affine::translate((5.0, 0.0)), 0.5);
        let s = s.child(Affine::IDENTITY, 0.5);
        assert_eq!(s.alpha, 0.25);
        assert_eq!(s.matrix, Affine::translate((5.0, 0.0)));
    }
}
