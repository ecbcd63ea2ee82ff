use std::f32::consts::FRAC_PI_4;

use rayon::prelude::*;

use crate::canvas::RasterBuffer;
use crate::color::Rgb;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PaintError {
    #[error("a line needs a stroke color and a positive line width")]
    MissingStroke,
    #[error("shape has neither a fill nor a stroke")]
    NothingToDraw,
    #[error("non-finite coordinates")]
    InvalidGeometry,
}

/// Round an angle (radians) to the nearest multiple of 45°.
pub fn snap_angle(angle: f32) -> f32 {
    (angle / FRAC_PI_4).round() * FRAC_PI_4
}

// ============================================================================
// DEPOSIT - how painted coverage lands in a destination pixel
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PaintMode {
    /// Subtract alpha instead of painting color.
    pub eraser: bool,
    /// Only touch pixels that already have alpha, and keep that alpha.
    pub lock_alpha: bool,
}

/// Paint `color` into `dst` with strength `mask` in 0..1.
pub(crate) fn deposit(dst: &mut [u8; 4], color: Rgb, mask: f32, mode: PaintMode) {
    if mask <= 0.0 {
        return;
    }
    let mask = mask.min(1.0);
    if mode.lock_alpha {
        if dst[3] == 0 || mode.eraser {
            return;
        }
        for (c, src) in dst.iter_mut().take(3).zip([color.r, color.g, color.b]) {
            *c = (*c as f32 + (src as f32 - *c as f32) * mask).round() as u8;
        }
        return;
    }
    if mode.eraser {
        // Eraser: reduce layer alpha by mask strength
        let current_a = dst[3] as f32 / 255.0;
        dst[3] = (current_a * (1.0 - mask) * 255.0).round() as u8;
        return;
    }

    // Normal alpha-over blend
    let sa = mask;
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a > 0.0 {
        for (c, src) in dst.iter_mut().take(3).zip([color.r, color.g, color.b]) {
            *c = ((src as f32 * sa + *c as f32 * da * (1.0 - sa)) / out_a).round().clamp(0.0, 255.0) as u8;
        }
        dst[3] = (out_a * 255.0).round() as u8;
    }
}

// ============================================================================
// SHAPE PARAMETERS
// ============================================================================

/// Available shape primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ShapeKind {
    #[default]
    Rect,
    Ellipse,
    Line,
}

impl ShapeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Rect => "rect",
            ShapeKind::Ellipse => "ellipse",
            ShapeKind::Line => "line",
        }
    }
}

/// A shape drawn by dragging from `(x1, y1)` to `(x2, y2)` in canvas coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeParams {
    pub kind: ShapeKind,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Rotation of the view the shape was drawn in. Shape edges follow the view.
    pub angle_rad: f32,
    /// `(x1, y1)` is the center and `(x2, y2)` gives the outward extent.
    pub is_outwards: bool,
    pub opacity: f32,
    pub is_eraser: bool,
    /// For rect or ellipse.
    pub fill: Option<Rgb>,
    /// Needed for line.
    pub stroke: Option<Rgb>,
    /// Needed for line.
    pub line_width: Option<f32>,
    /// 45° angle snapping of the drag direction.
    pub angle_snap: bool,
    /// 1:1 for rect or ellipse.
    pub fixed_ratio: bool,
    pub lock_alpha: bool,
}

impl Default for ShapeParams {
    fn default() -> Self {
        Self {
            kind: ShapeKind::Rect,
            x1: 0.0,
            y1: 0.0,
            x2: 0.0,
            y2: 0.0,
            angle_rad: 0.0,
            is_outwards: false,
            opacity: 1.0,
            is_eraser: false,
            fill: None,
            stroke: None,
            line_width: None,
            angle_snap: false,
            fixed_ratio: false,
            lock_alpha: false,
        }
    }
}

impl ShapeParams {
    pub fn new(kind: ShapeKind, from: (f32, f32), to: (f32, f32)) -> Self {
        Self { kind, x1: from.0, y1: from.1, x2: to.0, y2: to.1, ..Self::default() }
    }

    fn stroke_width(&self) -> Option<(Rgb, f32)> {
        match (self.stroke, self.line_width) {
            (Some(color), Some(w)) if w > 0.0 => Some((color, w)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), PaintError> {
        let coords = [self.x1, self.y1, self.x2, self.y2, self.angle_rad];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(PaintError::InvalidGeometry);
        }
        match self.kind {
            ShapeKind::Line if self.stroke_width().is_none() => Err(PaintError::MissingStroke),
            ShapeKind::Rect | ShapeKind::Ellipse if self.fill.is_none() && self.stroke_width().is_none() => {
                Err(PaintError::NothingToDraw)
            }
            _ => Ok(()),
        }
    }

    /// Apply snapping, fixed ratio and outward-from-center to get the final geometry.
    pub fn resolve(&self) -> ShapeGeometry {
        let (sin_a, cos_a) = self.angle_rad.sin_cos();
        let to_view = |x: f32, y: f32| (x * cos_a + y * sin_a, -x * sin_a + y * cos_a);
        let to_canvas = |x: f32, y: f32| (x * cos_a - y * sin_a, x * sin_a + y * cos_a);

        let (mut vx, mut vy) = to_view(self.x2 - self.x1, self.y2 - self.y1);
        if self.angle_snap {
            let len = (vx * vx + vy * vy).sqrt();
            let (s, c) = snap_angle(vy.atan2(vx)).sin_cos();
            vx = len * c;
            vy = len * s;
        }
        if self.fixed_ratio && self.kind != ShapeKind::Line {
            let m = vx.abs().max(vy.abs());
            vx = m.copysign(vx);
            vy = m.copysign(vy);
        }

        let (dx, dy) = to_canvas(vx, vy);
        let (center, half_extents, start, end) = if self.is_outwards {
            (
                [self.x1, self.y1],
                [vx.abs(), vy.abs()],
                [self.x1 - dx, self.y1 - dy],
                [self.x1 + dx, self.y1 + dy],
            )
        } else {
            (
                [self.x1 + dx * 0.5, self.y1 + dy * 0.5],
                [vx.abs() * 0.5, vy.abs() * 0.5],
                [self.x1, self.y1],
                [self.x1 + dx, self.y1 + dy],
            )
        };

        ShapeGeometry {
            kind: self.kind,
            center,
            half_extents,
            rotation: self.angle_rad,
            start,
            end,
            direction: vy.atan2(vx),
        }
    }
}

/// Resolved shape in canvas space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShapeGeometry {
    pub kind: ShapeKind,
    pub center: [f32; 2],
    pub half_extents: [f32; 2],
    pub rotation: f32,
    /// Line endpoints (also the drag corners for rect/ellipse).
    pub start: [f32; 2],
    pub end: [f32; 2],
    /// Drag direction relative to the view, radians.
    pub direction: f32,
}

impl ShapeGeometry {
    pub fn width(&self) -> f32 {
        self.half_extents[0] * 2.0
    }

    pub fn height(&self) -> f32 {
        self.half_extents[1] * 2.0
    }

    fn bounds(&self, pad: f32) -> (f32, f32, f32, f32) {
        let points: Vec<(f32, f32)> = if self.kind == ShapeKind::Line {
            vec![(self.start[0], self.start[1]), (self.end[0], self.end[1])]
        } else {
            // Corners of the rotated box
            let (sin_r, cos_r) = self.rotation.sin_cos();
            let [hx, hy] = self.half_extents;
            [(-hx, -hy), (hx, -hy), (hx, hy), (-hx, hy)]
                .iter()
                .map(|(x, y)| (x * cos_r - y * sin_r + self.center[0], x * sin_r + y * cos_r + self.center[1]))
                .collect()
        };
        points.iter().fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(x0, y0, x1, y1), &(x, y)| (x0.min(x - pad), y0.min(y - pad), x1.max(x + pad), y1.max(y + pad)),
        )
    }
}

// ============================================================================
// SDF functions - return signed distance (negative = inside)
// ============================================================================

/// SDF for a box centred at origin with half-extents (hx, hy).
#[inline]
fn sdf_box(px: f32, py: f32, hx: f32, hy: f32) -> f32 {
    let dx = px.abs() - hx;
    let dy = py.abs() - hy;
    let outside = (dx.max(0.0) * dx.max(0.0) + dy.max(0.0) * dy.max(0.0)).sqrt();
    let inside = dx.max(dy).min(0.0);
    outside + inside
}

/// SDF for an ellipse (approximation).
#[inline]
fn sdf_ellipse(px: f32, py: f32, rx: f32, ry: f32) -> f32 {
    let nx = px / rx;
    let ny = py / ry;
    let len = (nx * nx + ny * ny).sqrt();
    if len < 1e-8 {
        return -rx.min(ry);
    }
    let scale = (rx * rx * ny * ny + ry * ry * nx * nx).sqrt() / (rx * ry * len);
    (len - 1.0) / scale
}

/// Distance from a point to the segment a→b.
#[inline]
fn sdf_line_segment(px: f32, py: f32, a: [f32; 2], b: [f32; 2]) -> f32 {
    let (bax, bay) = (b[0] - a[0], b[1] - a[1]);
    let (pax, pay) = (px - a[0], py - a[1]);
    let len_sq = bax * bax + bay * bay;
    let h = if len_sq > 0.0 { ((pax * bax + pay * bay) / len_sq).clamp(0.0, 1.0) } else { 0.0 };
    let (dx, dy) = (pax - bax * h, pay - bay * h);
    (dx * dx + dy * dy).sqrt()
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

// ============================================================================
// RASTERIZATION
// ============================================================================

/// Paint a rect, ellipse or line into `buffer`. Fill is painted first, then the stroke.
pub fn rasterize_shape(buffer: &mut RasterBuffer, params: &ShapeParams) -> Result<(), PaintError> {
    params.validate()?;
    let geom = params.resolve();
    let stroke = params.stroke_width();
    let fill = if geom.kind == ShapeKind::Line { None } else { params.fill };
    let opacity = params.opacity.clamp(0.0, 1.0);
    let mode = PaintMode { eraser: params.is_eraser, lock_alpha: params.lock_alpha };

    let pad = stroke.map_or(0.0, |(_, w)| w) + 2.0;
    let (min_x, min_y, max_x, max_y) = geom.bounds(pad);
    let x0 = (min_x.floor() as i64).max(0) as u32;
    let y0 = (min_y.floor() as i64).max(0) as u32;
    let x1 = (max_x.ceil() as i64).clamp(0, buffer.width() as i64) as u32;
    let y1 = (max_y.ceil() as i64).clamp(0, buffer.height() as i64) as u32;
    if x1 <= x0 || y1 <= y0 {
        return Ok(());
    }
    let buf_w = (x1 - x0) as usize;

    let (sin_r, cos_r) = geom.rotation.sin_cos();
    let [cx, cy] = geom.center;
    let [hx, hy] = geom.half_extents;
    let half_stroke = stroke.map_or(0.0, |(_, w)| w * 0.5);
    let has_area = hx > 0.0 && hy > 0.0;

    // Per-pixel (fill coverage, stroke coverage)
    let mut coverage = vec![[0.0f32; 2]; buf_w * (y1 - y0) as usize];
    coverage.par_chunks_mut(buf_w).enumerate().for_each(|(row, out)| {
        let py = (y0 as usize + row) as f32 + 0.5;
        for (col, cov) in out.iter_mut().enumerate() {
            let px = (x0 as usize + col) as f32 + 0.5;
            if geom.kind == ShapeKind::Line {
                let d = sdf_line_segment(px, py, geom.start, geom.end) - half_stroke;
                cov[1] = smoothstep(0.5, -0.5, d);
                continue;
            }
            // Transform to shape-local coordinates (inverse rotate around center)
            let dx = px - cx;
            let dy = py - cy;
            let lx = dx * cos_r + dy * sin_r;
            let ly = -dx * sin_r + dy * cos_r;
            let d = match geom.kind {
                ShapeKind::Ellipse => sdf_ellipse(lx, ly, hx.max(1e-3), hy.max(1e-3)),
                _ => sdf_box(lx, ly, hx, hy),
            };
            if fill.is_some() && has_area {
                cov[0] = smoothstep(0.5, -0.5, d);
            }
            if stroke.is_some() {
                cov[1] = smoothstep(0.5, -0.5, d.abs() - half_stroke);
            }
        }
    });

    for (i, cov) in coverage.iter().enumerate() {
        if cov[0] <= 0.001 && cov[1] <= 0.001 {
            continue;
        }
        let x = x0 + (i % buf_w) as u32;
        let y = y0 + (i / buf_w) as u32;
        let dst = &mut buffer.pixel_mut(x, y).0;
        if let Some(color) = fill {
            deposit(dst, color, cov[0] * opacity, mode);
        }
        if let Some((color, _)) = stroke {
            deposit(dst, color, cov[1] * opacity, mode);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const RED: Rgb = Rgb::new(255, 0, 0);

    fn opaque_count(buf: &RasterBuffer) -> usize {
        buf.to_rgba_image().pixels().filter(|p| p[3] == 255).count()
    }

    #[test]
    fn snapping_rounds_forty_degrees_to_forty_five() {
        let snapped = snap_angle(40f32.to_radians());
        assert!((snapped.to_degrees() - 45.0).abs() < 1e-4);

        let len = 100.0;
        let (s, c) = 40f32.to_radians().sin_cos();
        let mut params = ShapeParams::new(ShapeKind::Line, (10.0, 10.0), (10.0 + len * c, 10.0 + len * s));
        params.angle_snap = true;
        let geom = params.resolve();
        assert!((geom.direction.to_degrees() - 45.0).abs() < 1e-3);
        let (ex, ey) = (geom.end[0] - 10.0, geom.end[1] - 10.0);
        assert!((ex - ey).abs() < 1e-3);
        assert!(((ex * ex + ey * ey).sqrt() - len).abs() < 1e-3);
    }

    #[test]
    fn fixed_ratio_uses_larger_extent() {
        let mut params = ShapeParams::new(ShapeKind::Rect, (0.0, 0.0), (10.0, 4.0));
        params.fixed_ratio = true;
        params.fill = Some(RED);
        let geom = params.resolve();
        assert_eq!((geom.width(), geom.height()), (10.0, 10.0));

        let mut buf = RasterBuffer::new(20, 20).unwrap();
        rasterize_shape(&mut buf, &params).unwrap();
        assert_eq!(opaque_count(&buf), 100);
        assert_eq!(buf.get_pixel(9, 9).unwrap(), Rgba([255, 0, 0, 255]));
        assert_eq!(buf.get_pixel(10, 5).unwrap()[3], 0);
    }

    #[test]
    fn fixed_ratio_keeps_drag_direction() {
        let mut params = ShapeParams::new(ShapeKind::Ellipse, (20.0, 20.0), (10.0, 16.0));
        params.fixed_ratio = true;
        let geom = params.resolve();
        assert_eq!(geom.center, [15.0, 15.0]);
        assert_eq!(geom.half_extents, [5.0, 5.0]);
    }

    #[test]
    fn outwards_treats_first_point_as_center() {
        let mut params = ShapeParams::new(ShapeKind::Rect, (10.0, 10.0), (13.0, 12.0));
        params.is_outwards = true;
        params.fill = Some(RED);
        let geom = params.resolve();
        assert_eq!(geom.center, [10.0, 10.0]);
        assert_eq!((geom.width(), geom.height()), (6.0, 4.0));
        let mut buf = RasterBuffer::new(20, 20).unwrap();
        rasterize_shape(&mut buf, &params).unwrap();
        assert_eq!(opaque_count(&buf), 24);
    }

    #[test]
    fn line_requires_stroke_and_width() {
        let mut buf = RasterBuffer::new(8, 8).unwrap();
        let mut params = ShapeParams::new(ShapeKind::Line, (0.0, 0.0), (7.0, 7.0));
        params.fill = Some(RED);
        assert_eq!(rasterize_shape(&mut buf, &params), Err(PaintError::MissingStroke));
        params.stroke = Some(RED);
        params.line_width = Some(0.0);
        assert_eq!(rasterize_shape(&mut buf, &params), Err(PaintError::MissingStroke));
        params.line_width = Some(2.0);
        assert!(rasterize_shape(&mut buf, &params).is_ok());
        assert!(buf.get_pixel(4, 4).unwrap()[3] > 200);
    }

    #[test]
    fn rect_without_fill_or_stroke_is_rejected() {
        let mut buf = RasterBuffer::new(8, 8).unwrap();
        let params = ShapeParams::new(ShapeKind::Rect, (0.0, 0.0), (4.0, 4.0));
        assert_eq!(rasterize_shape(&mut buf, &params), Err(PaintError::NothingToDraw));
    }

    #[test]
    fn eraser_cuts_alpha() {
        let mut buf = RasterBuffer::new_filled(10, 10, Rgba([0, 0, 255, 255])).unwrap();
        let mut params = ShapeParams::new(ShapeKind::Rect, (0.0, 0.0), (5.0, 10.0));
        params.fill = Some(RED);
        params.is_eraser = true;
        rasterize_shape(&mut buf, &params).unwrap();
        assert_eq!(buf.get_pixel(2, 2).unwrap()[3], 0);
        assert_eq!(buf.get_pixel(7, 2).unwrap(), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn alpha_lock_only_recolors_existing_pixels() {
        let mut buf = RasterBuffer::new(10, 10).unwrap();
        buf.put_pixel(3, 3, Rgba([0, 0, 255, 100])).unwrap();
        let mut params = ShapeParams::new(ShapeKind::Rect, (0.0, 0.0), (10.0, 10.0));
        params.fill = Some(RED);
        params.lock_alpha = true;
        rasterize_shape(&mut buf, &params).unwrap();
        assert_eq!(buf.get_pixel(3, 3).unwrap(), Rgba([255, 0, 0, 100]));
        assert_eq!(buf.get_pixel(4, 4).unwrap()[3], 0);
    }

    #[test]
    fn half_opacity_paints_half_alpha() {
        let mut buf = RasterBuffer::new(10, 10).unwrap();
        let mut params = ShapeParams::new(ShapeKind::Rect, (0.0, 0.0), (10.0, 10.0));
        params.fill = Some(RED);
        params.opacity = 0.5;
        rasterize_shape(&mut buf, &params).unwrap();
        assert_eq!(buf.get_pixel(5, 5).unwrap(), Rgba([255, 0, 0, 128]));
    }
}
