// ============================================================================
// ADJUSTMENT OPERATIONS - pixel-level adjustments on one raster buffer
// ============================================================================
//
// Every operation rewrites a whole buffer. Rows are processed in parallel
// with rayon; results are rounded and clamped to 8 bits.
// ============================================================================

use rayon::prelude::*;

use crate::canvas::RasterBuffer;
use crate::color::{hsl_to_rgb, rgb_to_hsl};

/// Apply a per-pixel transform to `buffer`.
/// `transform` receives (r, g, b, a) as f32 in 0..255 and returns the same.
pub fn apply_pixel_transform<F>(buffer: &mut RasterBuffer, transform: F)
where
    F: Fn(f32, f32, f32, f32) -> (f32, f32, f32, f32) + Sync,
{
    let mut flat = buffer.to_rgba_image();
    let stride = flat.width() as usize * 4;
    let raw: &mut [u8] = &mut flat;

    raw.par_chunks_mut(stride).for_each(|row| {
        for px in row.chunks_exact_mut(4) {
            let (nr, ng, nb, na) = transform(px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32);
            px[0] = nr.round().clamp(0.0, 255.0) as u8;
            px[1] = ng.round().clamp(0.0, 255.0) as u8;
            px[2] = nb.round().clamp(0.0, 255.0) as u8;
            px[3] = na.round().clamp(0.0, 255.0) as u8;
        }
    });

    *buffer = RasterBuffer::from_validated_image(&flat);
}

/// Invert all color channels (R, G, B). Alpha is preserved.
pub fn invert_colors(buffer: &mut RasterBuffer) {
    apply_pixel_transform(buffer, |r, g, b, a| (255.0 - r, 255.0 - g, 255.0 - b, a));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GrayscaleMode {
    /// Rec. 601 luma weights.
    #[default]
    Luminance,
    Average,
    /// Midpoint of the brightest and darkest channel.
    Lightness,
}

/// Desaturate towards gray. `strength` 0 leaves the buffer unchanged, 1 is fully gray.
pub fn desaturate(buffer: &mut RasterBuffer, mode: GrayscaleMode, strength: f32) {
    let strength = strength.clamp(0.0, 1.0);
    apply_pixel_transform(buffer, move |r, g, b, a| {
        let v = match mode {
            GrayscaleMode::Luminance => 0.299 * r + 0.587 * g + 0.114 * b,
            GrayscaleMode::Average => (r + g + b) / 3.0,
            GrayscaleMode::Lightness => (r.max(g).max(b) + r.min(g).min(b)) / 2.0,
        };
        (
            r + (v - r) * strength,
            g + (v - g) * strength,
            b + (v - b) * strength,
            a,
        )
    });
}

/// `brightness` and `contrast` in -1..1 (0 = neutral).
pub fn brightness_contrast(buffer: &mut RasterBuffer, brightness: f32, contrast: f32) {
    let brightness = brightness.clamp(-1.0, 1.0) * 255.0;
    let contrast = contrast.clamp(-1.0, 1.0) * 255.0;
    let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));
    apply_pixel_transform(buffer, move |r, g, b, a| {
        let nr = factor * (r + brightness - 128.0) + 128.0;
        let ng = factor * (g + brightness - 128.0) + 128.0;
        let nb = factor * (b + brightness - 128.0) + 128.0;
        (nr, ng, nb, a)
    });
}

/// Shift hue by `hue_shift` degrees; `saturation` and `lightness` in -1..1.
pub fn hue_saturation_lightness(buffer: &mut RasterBuffer, hue_shift: f32, saturation: f32, lightness: f32) {
    let sat_factor = 1.0 + saturation.clamp(-1.0, 1.0);
    let light_offset = lightness.clamp(-1.0, 1.0) * 255.0;
    apply_pixel_transform(buffer, move |r, g, b, a| {
        let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
        let nh = ((h + hue_shift / 360.0) % 1.0 + 1.0) % 1.0;
        let ns = (s * sat_factor).clamp(0.0, 1.0);
        let (nr, ng, nb) = hsl_to_rgb(nh, ns, l);
        (nr * 255.0 + light_offset, ng * 255.0 + light_offset, nb * 255.0 + light_offset, a)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn one_pixel(p: Rgba<u8>) -> RasterBuffer {
        RasterBuffer::new_filled(1, 1, p).unwrap()
    }

    #[test]
    fn invert_keeps_alpha() {
        let mut buf = one_pixel(Rgba([10, 200, 0, 77]));
        invert_colors(&mut buf);
        assert_eq!(buf.get_pixel(0, 0).unwrap(), Rgba([245, 55, 255, 77]));
    }

    #[test]
    fn full_strength_grayscale_equalizes_channels() {
        for mode in [GrayscaleMode::Luminance, GrayscaleMode::Average, GrayscaleMode::Lightness] {
            let mut buf = one_pixel(Rgba([200, 50, 10, 255]));
            desaturate(&mut buf, mode, 1.0);
            let p = buf.get_pixel(0, 0).unwrap();
            assert!(p[0] == p[1] && p[1] == p[2], "{mode:?}");
        }
        let mut buf = one_pixel(Rgba([200, 50, 10, 255]));
        desaturate(&mut buf, GrayscaleMode::Average, 0.0);
        assert_eq!(buf.get_pixel(0, 0).unwrap(), Rgba([200, 50, 10, 255]));
    }

    #[test]
    fn neutral_adjustments_are_identity() {
        let p = Rgba([30, 140, 220, 255]);
        let mut buf = one_pixel(p);
        brightness_contrast(&mut buf, 0.0, 0.0);
        assert_eq!(buf.get_pixel(0, 0).unwrap(), p);
        hue_saturation_lightness(&mut buf, 0.0, 0.0, 0.0);
        let q = buf.get_pixel(0, 0).unwrap();
        for i in 0..3 {
            assert!((p[i] as i32 - q[i] as i32).abs() <= 1);
        }
    }

    #[test]
    fn full_brightness_saturates_to_white() {
        let mut buf = one_pixel(Rgba([30, 140, 220, 255]));
        brightness_contrast(&mut buf, 1.0, 0.0);
        assert_eq!(buf.get_pixel(0, 0).unwrap(), Rgba([255, 255, 255, 255]));
    }
}
