use rayon::prelude::*;

use crate::canvas::RasterBuffer;
use crate::color::Rgb;
use crate::ops::shapes::{PaintError, PaintMode, deposit, snap_angle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum GradientKind {
    #[default]
    Linear,
    /// Mirrored around the start point.
    LinearMirror,
    Radial,
}

impl GradientKind {
    pub fn name(&self) -> &'static str {
        match self {
            GradientKind::Linear => "linear",
            GradientKind::LinearMirror => "linear-mirror",
            GradientKind::Radial => "radial",
        }
    }
}

/// A one-color gradient fading from `color` at the start point to transparent at the end point.
#[derive(Clone, Debug, PartialEq)]
pub struct GradientParams {
    pub kind: GradientKind,
    pub color: Rgb,
    /// The color sits at the end point instead of the start point.
    pub is_reversed: bool,
    pub opacity: f32,
    pub lock_alpha: bool,
    /// 45° angle snapping of the start→end direction.
    pub snap: bool,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Rotation of the view; snapping is relative to it.
    pub angle_rad: f32,
    pub is_eraser: bool,
}

impl Default for GradientParams {
    fn default() -> Self {
        Self {
            kind: GradientKind::Linear,
            color: Rgb::BLACK,
            is_reversed: false,
            opacity: 1.0,
            lock_alpha: false,
            snap: false,
            x1: 0.0,
            y1: 0.0,
            x2: 0.0,
            y2: 0.0,
            angle_rad: 0.0,
            is_eraser: false,
        }
    }
}

impl GradientParams {
    /// End point after optional snapping.
    pub fn effective_end(&self) -> (f32, f32) {
        let (dx, dy) = (self.x2 - self.x1, self.y2 - self.y1);
        if !self.snap {
            return (self.x2, self.y2);
        }
        let len = (dx * dx + dy * dy).sqrt();
        let angle = snap_angle(dy.atan2(dx) - self.angle_rad) + self.angle_rad;
        let (s, c) = angle.sin_cos();
        (self.x1 + len * c, self.y1 + len * s)
    }

    /// Gradient position in 0..1 for a point, 0 at the start point.
    #[inline]
    fn compute_t(&self, px: f32, py: f32, bx: f32, by: f32) -> f32 {
        let (ax, ay) = (self.x1, self.y1);
        let dx = bx - ax;
        let dy = by - ay;
        let len_sq = dx * dx + dy * dy;
        if len_sq < 1e-6 {
            return 0.0;
        }
        match self.kind {
            GradientKind::Linear => (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0),
            GradientKind::LinearMirror => (((px - ax) * dx + (py - ay) * dy) / len_sq).abs().min(1.0),
            GradientKind::Radial => {
                let dist = ((px - ax) * (px - ax) + (py - ay) * (py - ay)).sqrt();
                (dist / len_sq.sqrt()).clamp(0.0, 1.0)
            }
        }
    }
}

/// Paint the gradient over the whole buffer.
pub fn render_gradient(buffer: &mut RasterBuffer, params: &GradientParams) -> Result<(), PaintError> {
    let coords = [params.x1, params.y1, params.x2, params.y2, params.angle_rad];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(PaintError::InvalidGeometry);
    }
    let (bx, by) = params.effective_end();
    let opacity = params.opacity.clamp(0.0, 1.0);
    let mode = PaintMode { eraser: params.is_eraser, lock_alpha: params.lock_alpha };

    let mut flat = buffer.to_rgba_image();
    let stride = flat.width() as usize * 4;
    let raw: &mut [u8] = &mut flat;

    raw.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let py = y as f32 + 0.5;
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let t = params.compute_t(x as f32 + 0.5, py, bx, by);
            let strength = if params.is_reversed { t } else { 1.0 - t };
            if let Ok(dst) = <&mut [u8; 4]>::try_from(px) {
                deposit(dst, params.color, strength * opacity, mode);
            }
        }
    });

    *buffer = RasterBuffer::from_validated_image(&flat);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn horizontal(w: u32, reversed: bool) -> RasterBuffer {
        let mut buf = RasterBuffer::new(w, 3).unwrap();
        let params = GradientParams {
            color: Rgb::new(200, 40, 10),
            is_reversed: reversed,
            x1: 0.5,
            y1: 1.5,
            x2: w as f32 - 0.5,
            y2: 1.5,
            ..GradientParams::default()
        };
        render_gradient(&mut buf, &params).unwrap();
        buf
    }

    #[test]
    fn reversed_swaps_endpoint_colors() {
        let w = 21;
        let normal = horizontal(w, false);
        let reversed = horizontal(w, true);
        assert_eq!(normal.get_pixel(0, 1).unwrap(), Rgba([200, 40, 10, 255]));
        assert_eq!(normal.get_pixel(w - 1, 1).unwrap()[3], 0);
        assert_eq!(reversed.get_pixel(0, 1).unwrap()[3], 0);
        assert_eq!(reversed.get_pixel(w - 1, 1).unwrap(), Rgba([200, 40, 10, 255]));
        for x in 0..w {
            let a = normal.get_pixel(x, 1).unwrap()[3] as i32;
            let b = reversed.get_pixel(w - 1 - x, 1).unwrap()[3] as i32;
            assert!((a - b).abs() <= 1, "x={x}: {a} vs {b}");
        }
    }

    #[test]
    fn mirror_is_symmetric_around_start() {
        let mut buf = RasterBuffer::new(21, 1).unwrap();
        let params = GradientParams {
            kind: GradientKind::LinearMirror,
            x1: 10.5,
            y1: 0.5,
            x2: 20.5,
            y2: 0.5,
            ..GradientParams::default()
        };
        render_gradient(&mut buf, &params).unwrap();
        for d in 0..10 {
            assert_eq!(buf.get_pixel(10 - d, 0).unwrap(), buf.get_pixel(10 + d, 0).unwrap());
        }
        assert_eq!(buf.get_pixel(10, 0).unwrap()[3], 255);
    }

    #[test]
    fn radial_fades_with_distance() {
        let mut buf = RasterBuffer::new(21, 21).unwrap();
        let params = GradientParams {
            kind: GradientKind::Radial,
            x1: 10.5,
            y1: 10.5,
            x2: 20.5,
            y2: 10.5,
            ..GradientParams::default()
        };
        render_gradient(&mut buf, &params).unwrap();
        let center = buf.get_pixel(10, 10).unwrap()[3];
        let mid = buf.get_pixel(15, 10).unwrap()[3];
        assert_eq!(center, 255);
        assert!(mid < center && mid > 0);
        assert_eq!(buf.get_pixel(0, 0).unwrap()[3], 0);
    }

    #[test]
    fn snapping_is_relative_to_view_angle() {
        let params = GradientParams { x1: 0.0, y1: 0.0, x2: 10.0, y2: 1.0, snap: true, ..Default::default() };
        let (x, y) = params.effective_end();
        assert!(y.abs() < 1e-4 && (x - 101f32.sqrt()).abs() < 1e-3);
    }

    #[test]
    fn eraser_gradient_removes_alpha_at_start() {
        let mut buf = RasterBuffer::new_filled(11, 1, Rgba([9, 9, 9, 255])).unwrap();
        let params = GradientParams {
            is_eraser: true,
            x1: 0.5,
            y1: 0.5,
            x2: 10.5,
            y2: 0.5,
            ..GradientParams::default()
        };
        render_gradient(&mut buf, &params).unwrap();
        assert_eq!(buf.get_pixel(0, 0).unwrap()[3], 0);
        assert_eq!(buf.get_pixel(10, 0).unwrap()[3], 255);
    }
}
