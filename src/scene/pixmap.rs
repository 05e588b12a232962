use crate::foundation::core::{Rect, Rgba8Premul};
use crate::foundation::error::{ZoetropeError, ZoetropeResult};

pub type PremulRgba8 = [u8; 4];

/// CPU raster surface in row-major premultiplied RGBA8.
///
/// Backs software caches and the GL-less drawing path, and is the readback
/// format for pixel assertions.
#[derive(Clone, Debug, PartialEq)]
pub struct Pixmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Pixmap {
    pub fn new(width: u32, height: u32) -> ZoetropeResult<Self> {
        if width == 0 || height == 0 {
            return Err(ZoetropeError::validation("Pixmap dimensions must be > 0"));
        }
        Ok(Self {
            width,
            height,
            data: vec![0u8; (width as usize) * (height as usize) * 4],
        })
    }

    pub fn from_rgba8_premul(width: u32, height: u32, data: Vec<u8>) -> ZoetropeResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        if data.len() != expected {
            return Err(ZoetropeError::validation(format!(
                "Pixmap buffer is {} bytes, expected {expected}",
                data.len()
            )));
        }
        if width == 0 || height == 0 {
            return Err(ZoetropeError::validation("Pixmap dimensions must be > 0"));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Unpremultiply into an image buffer ready for encoding.
    pub fn to_image(&self) -> Option<image::RgbaImage> {
        let mut data = self.data.clone();
        for px in data.chunks_exact_mut(4) {
            let a = u16::from(px[3]);
            if a > 0 && a < 255 {
                for c in px.iter_mut().take(3) {
                    *c = ((u16::from(*c) * 255 + a / 2) / a).min(255) as u8;
                }
            }
        }
        image::RgbaImage::from_raw(self.width, self.height, data)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<PremulRgba8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y as usize) * (self.width as usize) + (x as usize)) * 4;
        Some([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ])
    }

    pub fn fill(&mut self, color: Rgba8Premul) {
        for px in self.data.chunks_exact_mut(4) {
            px[0] = color.r;
            px[1] = color.g;
            px[2] = color.b;
            px[3] = color.a;
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Source-over composite of `src_rect` from `src` into `dst_rect`, nearest
    /// sampled, with an extra opacity factor. Destination pixels outside this
    /// surface are clipped.
    pub fn draw_scaled(&mut self, src: &Pixmap, src_rect: Rect, dst_rect: Rect, opacity: f64) {
        if dst_rect.width() <= 0.0 || dst_rect.height() <= 0.0 {
            return;
        }
        if src_rect.width() <= 0.0 || src_rect.height() <= 0.0 {
            return;
        }
        let opacity = opacity.clamp(0.0, 1.0) as f32;
        if opacity <= 0.0 {
            return;
        }

        let x0 = dst_rect.x0.floor().max(0.0) as i64;
        let y0 = dst_rect.y0.floor().max(0.0) as i64;
        let x1 = (dst_rect.x1.ceil() as i64).min(self.width as i64);
        let y1 = (dst_rect.y1.ceil() as i64).min(self.height as i64);

        let sx_per_dx = src_rect.width() / dst_rect.width();
        let sy_per_dy = src_rect.height() / dst_rect.height();

        for dy in y0..y1 {
            let sy = src_rect.y0 + ((dy as f64) + 0.5 - dst_rect.y0) * sy_per_dy;
            let sy = sy.floor() as i64;
            if sy < 0 || sy >= src.height as i64 {
                continue;
            }
            for dx in x0..x1 {
                let sx = src_rect.x0 + ((dx as f64) + 0.5 - dst_rect.x0) * sx_per_dx;
                let sx = sx.floor() as i64;
                if sx < 0 || sx >= src.width as i64 {
                    continue;
                }
                let si = ((sy as usize) * (src.width as usize) + (sx as usize)) * 4;
                let di = ((dy as usize) * (self.width as usize) + (dx as usize)) * 4;
                let s = [
                    src.data[si],
                    src.data[si + 1],
                    src.data[si + 2],
                    src.data[si + 3],
                ];
                let d = [
                    self.data[di],
                    self.data[di + 1],
                    self.data[di + 2],
                    self.data[di + 3],
                ];
                let out = over(d, s, opacity);
                self.data[di..di + 4].copy_from_slice(&out);
            }
        }
    }
}

/// Premultiplied source-over of one pixel pair with an extra opacity factor.
pub fn over(dst: PremulRgba8, src: PremulRgba8, opacity: f32) -> PremulRgba8 {
    let opacity = opacity.clamp(0.0, 1.0);
    if opacity <= 0.0 || src[3] == 0 {
        return dst;
    }

    let op = ((opacity * 255.0).round() as i32).clamp(0, 255) as u16;
    let sa = mul_div255(u16::from(src[3]), op);
    if sa == 0 {
        return dst;
    }

    let inv = 255u16 - u16::from(sa);

    let mut out = [0u8; 4];
    out[3] = add_sat_u8(sa, mul_div255(u16::from(dst[3]), inv));

    for i in 0..3 {
        let sc = mul_div255(u16::from(src[i]), op);
        let dc = mul_div255(u16::from(dst[i]), inv);
        out[i] = add_sat_u8(sc, dc);
    }
    out
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

fn add_sat_u8(a: u8, b: u8) -> u8 {
    a.saturating_add(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_opacity_0_is_noop() {
        let dst = [1, 2, 3, 4];
        let src = [200, 200, 200, 200];
        assert_eq!(over(dst, src, 0.0), dst);
    }

    #[test]
    fn over_src_opaque_replaces_dst() {
        let dst = [0, 0, 0, 255];
        let src = [255, 0, 0, 255];
        assert_eq!(over(dst, src, 1.0), src);
    }

    #[test]
    fn over_dst_transparent_returns_scaled_src() {
        let dst = [0, 0, 0, 0];
        let src = [100, 110, 120, 200];
        assert_eq!(over(dst, src, 1.0), src);
    }

    #[test]
    fn draw_scaled_copies_unit_scale() {
        let mut src = Pixmap::new(2, 2).unwrap();
        src.fill(Rgba8Premul {
            r: 10,
            g: 20,
            b: 30,
            a: 255,
        });
        let mut dst = Pixmap::new(4, 4).unwrap();
        dst.draw_scaled(
            &src,
            Rect::new(0.0, 0.0, 2.0, 2.0),
            Rect::new(1.0, 1.0, 3.0, 3.0),
            1.0,
        );
        assert_eq!(dst.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(dst.pixel(1, 1), Some([10, 20, 30, 255]));
        assert_eq!(dst.pixel(2, 2), Some([10, 20, 30, 255]));
        assert_eq!(dst.pixel(3, 3), Some([0, 0, 0, 0]));
    }

    #[test]
    fn draw_scaled_clips_at_edges() {
        let mut src = Pixmap::new(2, 2).unwrap();
        src.fill(Rgba8Premul {
            r: 0,
            g: 0,
            b: 0,
            a: 255,
        });
        let mut dst = Pixmap::new(2, 2).unwrap();
        dst.draw_scaled(
            &src,
            Rect::new(0.0, 0.0, 2.0, 2.0),
            Rect::new(-1.0, -1.0, 1.0, 1.0),
            1.0,
        );
        assert_eq!(dst.pixel(0, 0).map(|p| p[3]), Some(255));
        assert_eq!(dst.pixel(1, 1).map(|p| p[3]), Some(0));
    }

    #[test]
    fn pixmap_rejects_mismatched_buffer() {
        assert!(Pixmap::from_rgba8_premul(2, 2, vec![0u8; 15]).is_err());
        assert!(Pixmap::from_rgba8_premul(2, 2, vec![0u8; 16]).is_ok());
    }
}
