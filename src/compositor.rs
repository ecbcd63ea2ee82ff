//! Flattens a [`LayerStack`] bottom to top.
//!
//! Each layer is mixed with the accumulator through its blend function,
//! `Cs' = (1 - ab) * Cs + ab * B(Cb, Cs)`, weighted by `layer opacity × source alpha`,
//! and then merged with source-over alpha. Rendering never mutates the stack.

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{BlendMode, LayerStack, Pixel, RasterBuffer};

/// Render the stack into a new buffer of stack dimensions.
pub fn render(stack: &LayerStack) -> RasterBuffer {
    RasterBuffer::from_validated_image(&render_image(stack))
}

/// Render the stack into a contiguous image of stack dimensions.
pub fn render_image(stack: &LayerStack) -> RgbaImage {
    let (width, height) = stack.dimensions();
    let mut out = RgbaImage::new(width, height);
    let stride = width as usize * 4;

    for layer in stack.layers() {
        let opacity = layer.opacity();
        if opacity <= 0.0 {
            continue;
        }
        let mode = layer.blend_mode;
        let pixels = layer.pixels();
        let raw: &mut [u8] = &mut out;
        raw.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
            for (x, dst) in row.chunks_exact_mut(4).enumerate() {
                let top = *pixels.pixel(x as u32, y as u32);
                if top[3] == 0 {
                    continue;
                }
                let base = Rgba([dst[0], dst[1], dst[2], dst[3]]);
                dst.copy_from_slice(&blend_pixel(base, top, mode, opacity).0);
            }
        });
    }
    out
}

/// Composite `top` over `base` with the given mode and layer opacity.
pub fn blend_pixel(base: Pixel, top: Pixel, mode: BlendMode, opacity: f32) -> Pixel {
    // Fast path: fully transparent top pixel - nothing to blend
    if top[3] == 0 {
        return base;
    }
    let opacity = opacity.clamp(0.0, 1.0);

    // Fast path: Normal blend, full opacity, fully opaque top pixel - just overwrite
    if mode == BlendMode::Normal && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let base_c = [base[0] as f32 / 255.0, base[1] as f32 / 255.0, base[2] as f32 / 255.0];
    let base_a = base[3] as f32 / 255.0;
    let top_c = [top[0] as f32 / 255.0, top[1] as f32 / 255.0, top[2] as f32 / 255.0];
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let blended = blend_color(base_c, top_c, mode);
    let mut out = [0u8; 4];
    for i in 0..3 {
        // Blend result only counts where the backdrop is present.
        let mixed = (1.0 - base_a) * top_c[i] + base_a * blended[i];
        let c = (mixed * top_a + base_c[i] * base_a * (1.0 - top_a)) / out_a;
        out[i] = to_channel(c);
    }
    out[3] = to_channel(out_a);
    Rgba(out)
}

#[inline]
fn to_channel(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// `B(Cb, Cs)` for every mode, on unit-range channels.
fn blend_color(cb: [f32; 3], cs: [f32; 3], mode: BlendMode) -> [f32; 3] {
    let per_channel = |f: fn(f32, f32) -> f32| [f(cb[0], cs[0]), f(cb[1], cs[1]), f(cb[2], cs[2])];
    match mode {
        BlendMode::Normal => cs,
        BlendMode::Darken => per_channel(f32::min),
        BlendMode::Multiply => per_channel(|b, s| b * s),
        BlendMode::ColorBurn => per_channel(color_burn_channel),
        BlendMode::Lighten => per_channel(f32::max),
        BlendMode::Screen => per_channel(|b, s| b + s - b * s),
        BlendMode::ColorDodge => per_channel(color_dodge_channel),
        BlendMode::Overlay => per_channel(|b, s| hard_light_channel(s, b)),
        BlendMode::SoftLight => per_channel(soft_light_channel),
        BlendMode::HardLight => per_channel(hard_light_channel),
        BlendMode::Difference => per_channel(|b, s| (b - s).abs()),
        BlendMode::Exclusion => per_channel(|b, s| b + s - 2.0 * b * s),
        BlendMode::Hue => set_lum(set_sat(cs, sat(cb)), lum(cb)),
        BlendMode::Saturation => set_lum(set_sat(cb, sat(cs)), lum(cb)),
        BlendMode::Color => set_lum(cs, lum(cb)),
        BlendMode::Luminosity => set_lum(cb, lum(cs)),
    }
}

// ---- separable helpers -----------------------------------------------------

fn hard_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base * 2.0 * top
    } else {
        let s = 2.0 * top - 1.0;
        base + s - base * s
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if base >= 1.0 {
        1.0
    } else if top <= 0.0 {
        0.0
    } else {
        1.0 - ((1.0 - base) / top).min(1.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if base <= 0.0 {
        0.0
    } else if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

// ---- non-separable helpers -------------------------------------------------

fn lum(c: [f32; 3]) -> f32 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

fn clip_color(c: [f32; 3]) -> [f32; 3] {
    let l = lum(c);
    let n = c[0].min(c[1]).min(c[2]);
    let x = c[0].max(c[1]).max(c[2]);
    let mut out = c;
    if n < 0.0 {
        for v in &mut out {
            *v = l + (*v - l) * l / (l - n);
        }
    }
    if x > 1.0 {
        for v in &mut out {
            *v = l + (*v - l) * (1.0 - l) / (x - l);
        }
    }
    out
}

fn set_lum(c: [f32; 3], l: f32) -> [f32; 3] {
    let d = l - lum(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

fn sat(c: [f32; 3]) -> f32 {
    c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])
}

fn set_sat(c: [f32; 3], s: f32) -> [f32; 3] {
    let mut idx = [0usize, 1, 2];
    idx.sort_by(|&a, &b| c[a].total_cmp(&c[b]));
    let [min_i, mid_i, max_i] = idx;
    let mut out = [0.0; 3];
    if c[max_i] > c[min_i] {
        out[mid_i] = (c[mid_i] - c[min_i]) * s / (c[max_i] - c[min_i]);
        out[max_i] = s;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Layer, RasterBuffer};

    fn gradient_buffer(w: u32, h: u32) -> RasterBuffer {
        let mut buf = RasterBuffer::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                buf.put_pixel(x, y, Rgba([(x * 7) as u8, (y * 11) as u8, 200, 255])).unwrap();
            }
        }
        buf
    }

    fn single(mode: BlendMode, opacity: f32, pixels: RasterBuffer) -> LayerStack {
        let mut stack = LayerStack::new(pixels.width(), pixels.height()).unwrap();
        let mut layer = Layer::from_buffer("only", pixels);
        layer.blend_mode = mode;
        layer.set_opacity(opacity);
        stack.insert(0, layer).unwrap();
        stack
    }

    #[test]
    fn single_opaque_normal_layer_is_identity() {
        let pixels = gradient_buffer(33, 17);
        let stack = single(BlendMode::Normal, 1.0, pixels.clone());
        assert_eq!(render(&stack), pixels);
    }

    #[test]
    fn any_mode_onto_empty_backdrop_keeps_source() {
        let pixels = gradient_buffer(9, 9);
        for &mode in BlendMode::all() {
            let stack = single(mode, 1.0, pixels.clone());
            assert_eq!(render(&stack), pixels, "mode {}", mode.name());
        }
    }

    #[test]
    fn render_is_idempotent() {
        let mut stack = single(BlendMode::Normal, 1.0, gradient_buffer(20, 20));
        stack.insert_layer(1, "top").unwrap();
        stack.set_blend_mode(1, BlendMode::SoftLight).unwrap();
        stack.set_opacity(1, 0.4).unwrap();
        stack.layer_mut(1).unwrap().put_pixel(3, 3, Rgba([250, 10, 10, 128])).unwrap();
        assert_eq!(render_image(&stack), render_image(&stack));
    }

    #[test]
    fn multiply_with_white_is_neutral() {
        let base = Rgba([120, 60, 30, 255]);
        assert_eq!(blend_pixel(base, Rgba([255, 255, 255, 255]), BlendMode::Multiply, 1.0), base);
    }

    #[test]
    fn half_opacity_normal_mixes_linearly() {
        let out = blend_pixel(Rgba([0, 0, 0, 255]), Rgba([200, 100, 50, 255]), BlendMode::Normal, 0.5);
        assert_eq!(out, Rgba([100, 50, 25, 255]));
    }

    #[test]
    fn transparent_layers_and_zero_opacity_are_skipped() {
        let base = Rgba([1, 2, 3, 4]);
        assert_eq!(blend_pixel(base, Rgba([9, 9, 9, 0]), BlendMode::Screen, 1.0), base);
        let stack = single(BlendMode::Normal, 0.0, gradient_buffer(4, 4));
        assert_eq!(render(&stack), RasterBuffer::new(4, 4).unwrap());
    }

    #[test]
    fn difference_of_equal_colors_is_black() {
        let c = Rgba([90, 180, 45, 255]);
        assert_eq!(blend_pixel(c, c, BlendMode::Difference, 1.0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn luminosity_of_gray_onto_gray_takes_source_lightness() {
        let out = blend_pixel(Rgba([50, 50, 50, 255]), Rgba([200, 200, 200, 255]), BlendMode::Luminosity, 1.0);
        assert_eq!(out, Rgba([200, 200, 200, 255]));
    }

    #[test]
    fn color_mode_keeps_backdrop_luminance() {
        let base = [0.5, 0.5, 0.5];
        let out = blend_color(base, [1.0, 0.0, 0.0], BlendMode::Color);
        assert!((lum(out) - 0.5).abs() < 1e-4);
        assert!(out[0] > out[1] && out[1] == out[2]);
    }
}
