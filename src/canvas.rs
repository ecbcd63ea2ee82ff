use std::borrow::Cow;
use std::sync::Arc;

use image::{DynamicImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::compositor;

/// Largest canvas accepted by `RasterBuffer::new` (~256 megapixels).
const MAX_PIXELS: u64 = 256_000_000;

pub type Pixel = Rgba<u8>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CanvasError {
    #[error("invalid canvas dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("pixel ({x}, {y}) is outside the {width}x{height} buffer")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },
    #[error("buffer is {actual:?}, expected {expected:?}")]
    DimensionMismatch { expected: (u32, u32), actual: (u32, u32) },
    #[error("raw pixel data has {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
    #[error("layer index {index} out of range ({len} layers)")]
    LayerIndex { index: usize, len: usize },
    #[error("layer stack is empty")]
    EmptyStack,
}

// ============================================================================
// RASTER SOURCE – anything that can hand out decoded RGBA8 pixels
// ============================================================================

/// A decoded image that layers and imports can be built from.
pub trait RasterSource {
    fn dimensions(&self) -> (u32, u32);
    fn to_rgba8(&self) -> Cow<'_, RgbaImage>;
}

impl RasterSource for RgbaImage {
    fn dimensions(&self) -> (u32, u32) {
        RgbaImage::dimensions(self)
    }

    fn to_rgba8(&self) -> Cow<'_, RgbaImage> {
        Cow::Borrowed(self)
    }
}

impl RasterSource for DynamicImage {
    fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    fn to_rgba8(&self) -> Cow<'_, RgbaImage> {
        Cow::Owned(DynamicImage::to_rgba8(self))
    }
}

impl RasterSource for RasterBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn to_rgba8(&self) -> Cow<'_, RgbaImage> {
        Cow::Owned(self.to_rgba_image())
    }
}

// ============================================================================
// RASTER BUFFER – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Pixel = Rgba([0, 0, 0, 0]);

/// Owned RGBA8 pixel buffer backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and writes use `Arc::make_mut` to copy only the
/// touched chunk. History snapshots rely on this to stay cheap.
///
/// Dimensions are fixed at creation. Out-of-range access through the public
/// accessors fails with [`CanvasError::OutOfBounds`].
#[derive(Clone)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl std::fmt::Debug for RasterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl RasterBuffer {
    // ---- construction -------------------------------------------------------

    /// Allocate a fully transparent buffer.
    pub fn new(width: u32, height: u32) -> Result<Self, CanvasError> {
        let total = width as u64 * height as u64;
        if width == 0 || height == 0 || total > MAX_PIXELS {
            return Err(CanvasError::InvalidDimensions { width, height });
        }
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        Ok(Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; (chunks_per_row * chunks_per_col) as usize],
        })
    }

    /// Allocate a buffer filled with `color`. A transparent fill stores nothing.
    pub fn new_filled(width: u32, height: u32, color: Pixel) -> Result<Self, CanvasError> {
        let mut buf = Self::new(width, height)?;
        if color[3] > 0 {
            buf.fill(color);
        }
        Ok(buf)
    }

    /// Import from a flat `RgbaImage`. Only non-transparent chunks are stored.
    pub fn from_rgba_image(src: &RgbaImage) -> Result<Self, CanvasError> {
        Self::from_raw_rgba(src.width(), src.height(), src.as_raw())
    }

    /// Import an image whose dimensions were already validated as a buffer's.
    pub(crate) fn from_validated_image(src: &RgbaImage) -> Self {
        let (width, height) = src.dimensions();
        debug_assert!(width > 0 && height > 0);
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        Self {
            width,
            height,
            chunks_per_row,
            chunks: build_chunks(width, height, chunks_per_row, src.as_raw()),
        }
    }

    /// Import from any decoded raster.
    pub fn from_source(src: &dyn RasterSource) -> Result<Self, CanvasError> {
        Self::from_rgba_image(&src.to_rgba8())
    }

    /// Import from a flat row-major RGBA byte slice of exactly `width * height * 4` bytes.
    /// Chunk conversion is parallelised with rayon.
    pub fn from_raw_rgba(width: u32, height: u32, data: &[u8]) -> Result<Self, CanvasError> {
        let mut buf = Self::new(width, height)?;
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(CanvasError::BufferLength { expected, actual: data.len() });
        }
        buf.chunks = build_chunks(width, height, buf.chunks_per_row, data);
        Ok(buf)
    }

    /// Replace every pixel with the contents of `src`, which must have the same size.
    pub fn copy_from_image(&mut self, src: &RgbaImage) -> Result<(), CanvasError> {
        if src.dimensions() != self.dimensions() {
            return Err(CanvasError::DimensionMismatch {
                expected: self.dimensions(),
                actual: src.dimensions(),
            });
        }
        self.chunks = build_chunks(self.width, self.height, self.chunks_per_row, src.as_raw());
        Ok(())
    }

    /// Replace the buffer contents with `src` drawn at the origin.
    /// Parts of `src` outside the buffer are clipped, uncovered pixels become transparent.
    pub fn copy_from_source_clipped(&mut self, src: &dyn RasterSource) {
        let img = src.to_rgba8();
        if img.dimensions() == self.dimensions() {
            self.chunks = build_chunks(self.width, self.height, self.chunks_per_row, img.as_raw());
            return;
        }
        self.clear();
        let w = img.width().min(self.width);
        let h = img.height().min(self.height);
        for y in 0..h {
            for x in 0..w {
                let p = *img.get_pixel(x, y);
                if p[3] != 0 {
                    *self.pixel_mut(x, y) = p;
                }
            }
        }
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        let out_raw: &mut [u8] = &mut out;
        let out_stride = self.width as usize * 4;
        let chunk_stride = CHUNK_SIZE as usize * 4;
        for (idx, slot) in self.chunks.iter().enumerate() {
            let Some(chunk) = slot else { continue };
            let (base_x, base_y, cw, ch) = self.chunk_extent(idx);
            let chunk_raw = chunk.as_raw();
            for ly in 0..ch as usize {
                let src_start = ly * chunk_stride;
                let dst_start = (base_y as usize + ly) * out_stride + base_x as usize * 4;
                let len = cw as usize * 4;
                out_raw[dst_start..dst_start + len]
                    .copy_from_slice(&chunk_raw[src_start..src_start + len]);
            }
        }
        out
    }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel.
    pub fn get_pixel(&self, x: u32, y: u32) -> Result<Pixel, CanvasError> {
        self.check_bounds(x, y)?;
        Ok(*self.pixel(x, y))
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Pixel) -> Result<(), CanvasError> {
        self.check_bounds(x, y)?;
        *self.pixel_mut(x, y) = pixel;
        Ok(())
    }

    fn check_bounds(&self, x: u32, y: u32) -> Result<(), CanvasError> {
        if x >= self.width || y >= self.height {
            return Err(CanvasError::OutOfBounds { x, y, width: self.width, height: self.height });
        }
        Ok(())
    }

    /// Unchecked read for inner loops that already iterate inside the buffer.
    #[inline]
    pub(crate) fn pixel(&self, x: u32, y: u32) -> &Pixel {
        debug_assert!(x < self.width && y < self.height);
        let idx = self.flat_index(x / CHUNK_SIZE, y / CHUNK_SIZE);
        self.chunks[idx]
            .as_ref()
            .map(|c| c.get_pixel(x % CHUNK_SIZE, y % CHUNK_SIZE))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    #[inline]
    pub(crate) fn pixel_mut(&mut self, x: u32, y: u32) -> &mut Pixel {
        debug_assert!(x < self.width && y < self.height);
        let idx = self.flat_index(x / CHUNK_SIZE, y / CHUNK_SIZE);
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).get_pixel_mut(x % CHUNK_SIZE, y % CHUNK_SIZE)
    }

    // ---- bulk operations ----------------------------------------------------

    /// Fill every pixel with `color`.
    pub fn fill(&mut self, color: Pixel) {
        for slot in &mut self.chunks {
            let arc = slot.get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
            for pixel in Arc::make_mut(arc).pixels_mut() {
                *pixel = color;
            }
        }
    }

    /// Drop all chunks (make the buffer fully transparent).
    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    /// Mirror left↔right in place.
    pub fn flip_horizontal(&mut self) {
        let w = self.width;
        self.remap_chunks(|x, y| (w - 1 - x, y));
    }

    /// Mirror top↔bottom in place.
    pub fn flip_vertical(&mut self) {
        let h = self.height;
        self.remap_chunks(|x, y| (x, h - 1 - y));
    }

    /// Move every stored pixel to `map(x, y)` without materialising the full image.
    fn remap_chunks(&mut self, map: impl Fn(u32, u32) -> (u32, u32)) {
        let mut dst: Vec<Option<Arc<RgbaImage>>> = vec![None; self.chunks.len()];
        for (idx, slot) in self.chunks.iter().enumerate() {
            let Some(chunk) = slot else { continue };
            let (base_x, base_y, cw, ch) = self.chunk_extent(idx);
            for ly in 0..ch {
                for lx in 0..cw {
                    let p = *chunk.get_pixel(lx, ly);
                    if p[3] == 0 {
                        continue;
                    }
                    let (dx, dy) = map(base_x + lx, base_y + ly);
                    let di = self.flat_index(dx / CHUNK_SIZE, dy / CHUNK_SIZE);
                    let dc = Arc::make_mut(
                        dst[di].get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE))),
                    );
                    dc.put_pixel(dx % CHUNK_SIZE, dy % CHUNK_SIZE, p);
                }
            }
        }
        self.chunks = dst;
    }

    // ---- queries ------------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of populated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Bytes held by chunks that differ between `self` and `other`, counting both
    /// versions. A chunk both share costs a pointer. Depends only on chunk
    /// identity, so the result stays the same as other clones come and go.
    pub fn delta_bytes(&self, other: &RasterBuffer) -> usize {
        let chunk_byte_size = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
        if self.dimensions() != other.dimensions() {
            return self.memory_bytes_total() + other.memory_bytes_total();
        }
        self.chunks
            .iter()
            .zip(&other.chunks)
            .map(|(a, b)| match (a, b) {
                (Some(a), Some(b)) if Arc::ptr_eq(a, b) => std::mem::size_of::<usize>() * 2,
                _ => (a.is_some() as usize + b.is_some() as usize) * chunk_byte_size,
            })
            .sum()
    }

    /// Total pixel memory referenced by this buffer (ignoring sharing).
    pub fn memory_bytes_total(&self) -> usize {
        self.chunk_count() * (CHUNK_SIZE * CHUNK_SIZE * 4) as usize
    }

    // ---- chunk geometry -----------------------------------------------------

    #[inline]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    /// `(base_x, base_y, width, height)` of the in-bounds part of chunk `idx`.
    fn chunk_extent(&self, idx: usize) -> (u32, u32, u32, u32) {
        let base_x = (idx as u32 % self.chunks_per_row) * CHUNK_SIZE;
        let base_y = (idx as u32 / self.chunks_per_row) * CHUNK_SIZE;
        (
            base_x,
            base_y,
            CHUNK_SIZE.min(self.width - base_x),
            CHUNK_SIZE.min(self.height - base_y),
        )
    }
}

/// Two buffers are equal when they have the same size and the same in-bounds pixels,
/// regardless of which chunks happen to be allocated.
impl PartialEq for RasterBuffer {
    fn eq(&self, other: &Self) -> bool {
        if self.dimensions() != other.dimensions() {
            return false;
        }
        let stride = CHUNK_SIZE as usize * 4;
        (0..self.chunks.len()).all(|idx| {
            let (_, _, cw, ch) = self.chunk_extent(idx);
            let a = self.chunks[idx].as_deref();
            let b = other.chunks[idx].as_deref();
            if let (Some(a), Some(b)) = (&self.chunks[idx], &other.chunks[idx])
                && Arc::ptr_eq(a, b)
            {
                return true;
            }
            (0..ch as usize).all(|ly| {
                fn row_of(c: Option<&RgbaImage>, ly: usize, stride: usize, cw: u32) -> Option<&[u8]> {
                    c.map(|c| &c.as_raw()[ly * stride..ly * stride + cw as usize * 4])
                }
                let row = |c| row_of(c, ly, stride, cw);
                match (row(a), row(b)) {
                    (None, None) => true,
                    (Some(r), None) | (None, Some(r)) => r.iter().all(|&v| v == 0),
                    (Some(ra), Some(rb)) => ra == rb,
                }
            })
        })
    }
}

/// Split a flat RGBA buffer into 64×64 chunks, skipping fully transparent ones.
fn build_chunks(width: u32, height: u32, chunks_per_row: u32, data: &[u8]) -> Vec<Option<Arc<RgbaImage>>> {
    let chunks_x = chunks_per_row as usize;
    let chunks_y = height.div_ceil(CHUNK_SIZE) as usize;

    (0..chunks_x * chunks_y)
        .into_par_iter()
        .map(|flat| {
            let base_x = (flat % chunks_x) as u32 * CHUNK_SIZE;
            let base_y = (flat / chunks_x) as u32 * CHUNK_SIZE;
            let cw = CHUNK_SIZE.min(width - base_x);
            let ch = CHUNK_SIZE.min(height - base_y);
            let chunk_stride = CHUNK_SIZE as usize * 4;
            let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
            let mut has_content = false;

            for ly in 0..ch {
                let src_start = ((base_y + ly) * width + base_x) as usize * 4;
                let dst_start = ly as usize * chunk_stride;
                let byte_len = cw as usize * 4;
                let row = &data[src_start..src_start + byte_len];
                chunk_data[dst_start..dst_start + byte_len].copy_from_slice(row);
                has_content |= row.chunks_exact(4).any(|px| px[3] != 0);
            }

            if has_content {
                RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data).map(Arc::new)
            } else {
                None
            }
        })
        .collect()
}

// ============================================================================
// BLEND MODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Darken,
    Multiply,
    ColorBurn,
    Lighten,
    Screen,
    ColorDodge,
    Overlay,
    SoftLight,
    HardLight,
    Difference,
    Exclusion,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// All blend modes in menu order.
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Darken,
            BlendMode::Multiply,
            BlendMode::ColorBurn,
            BlendMode::Lighten,
            BlendMode::Screen,
            BlendMode::ColorDodge,
            BlendMode::Overlay,
            BlendMode::SoftLight,
            BlendMode::HardLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Hue,
            BlendMode::Saturation,
            BlendMode::Color,
            BlendMode::Luminosity,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Darken => "Darken",
            BlendMode::Multiply => "Multiply",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::Lighten => "Lighten",
            BlendMode::Screen => "Screen",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::Overlay => "Overlay",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::HardLight => "Hard Light",
            BlendMode::Difference => "Difference",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Hue => "Hue",
            BlendMode::Saturation => "Saturation",
            BlendMode::Color => "Color",
            BlendMode::Luminosity => "Luminosity",
        }
    }

    /// Composite-operation name used by layered documents (`"source-over"` for Normal).
    pub fn op_name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "source-over",
            BlendMode::Darken => "darken",
            BlendMode::Multiply => "multiply",
            BlendMode::ColorBurn => "color-burn",
            BlendMode::Lighten => "lighten",
            BlendMode::Screen => "screen",
            BlendMode::ColorDodge => "color-dodge",
            BlendMode::Overlay => "overlay",
            BlendMode::SoftLight => "soft-light",
            BlendMode::HardLight => "hard-light",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
            BlendMode::Hue => "hue",
            BlendMode::Saturation => "saturation",
            BlendMode::Color => "color",
            BlendMode::Luminosity => "luminosity",
        }
    }

    /// Parse a composite-operation name. Unknown names map to Normal.
    pub fn from_op_name(name: &str) -> Self {
        BlendMode::all()
            .iter()
            .copied()
            .find(|m| m.op_name() == name)
            .unwrap_or_default()
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Darken => 1,
            BlendMode::Multiply => 2,
            BlendMode::ColorBurn => 3,
            BlendMode::Lighten => 4,
            BlendMode::Screen => 5,
            BlendMode::ColorDodge => 6,
            BlendMode::Overlay => 7,
            BlendMode::SoftLight => 8,
            BlendMode::HardLight => 9,
            BlendMode::Difference => 10,
            BlendMode::Exclusion => 11,
            BlendMode::Hue => 12,
            BlendMode::Saturation => 13,
            BlendMode::Color => 14,
            BlendMode::Luminosity => 15,
        }
    }

    /// Reconstruct from a u8 (defaults to Normal for unknown values)
    pub fn from_u8(v: u8) -> Self {
        BlendMode::all().get(v as usize).copied().unwrap_or_default()
    }

    /// Separable modes blend each channel independently.
    pub fn is_separable(&self) -> bool {
        !matches!(
            self,
            BlendMode::Hue | BlendMode::Saturation | BlendMode::Color | BlendMode::Luminosity
        )
    }
}

// ============================================================================
// LAYER
// ============================================================================

#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    pub blend_mode: BlendMode,
    opacity: f32,
    pixels: RasterBuffer,
}

impl Layer {
    /// Transparent layer of the given size.
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Result<Self, CanvasError> {
        Ok(Self::from_buffer(name, RasterBuffer::new(width, height)?))
    }

    pub fn from_buffer(name: impl Into<String>, pixels: RasterBuffer) -> Self {
        Self {
            name: name.into(),
            blend_mode: BlendMode::Normal,
            opacity: 1.0,
            pixels,
        }
    }

    pub fn from_source(name: impl Into<String>, src: &dyn RasterSource) -> Result<Self, CanvasError> {
        Ok(Self::from_buffer(name, RasterBuffer::from_source(src)?))
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Set opacity, clamped to `[0, 1]`.
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { 1.0 } else { opacity.clamp(0.0, 1.0) };
    }

    pub fn pixels(&self) -> &RasterBuffer {
        &self.pixels
    }

    /// Mutable pixel access for operations that keep the buffer size.
    pub(crate) fn pixels_mut(&mut self) -> &mut RasterBuffer {
        &mut self.pixels
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Pixel) -> Result<(), CanvasError> {
        self.pixels.put_pixel(x, y, pixel)
    }

    /// Swap in a new buffer of identical size, returning the old one.
    pub fn replace_pixels(&mut self, pixels: RasterBuffer) -> Result<RasterBuffer, CanvasError> {
        if pixels.dimensions() != self.pixels.dimensions() {
            return Err(CanvasError::DimensionMismatch {
                expected: self.pixels.dimensions(),
                actual: pixels.dimensions(),
            });
        }
        Ok(std::mem::replace(&mut self.pixels, pixels))
    }
}

// ============================================================================
// LAYER STACK
// ============================================================================

/// Ordered layers (index 0 = bottom) sharing one canvas size, plus the focused layer.
#[derive(Clone, Debug)]
pub struct LayerStack {
    layers: Vec<Layer>,
    width: u32,
    height: u32,
    focus: usize,
}

impl LayerStack {
    /// Empty stack. Dimensions are validated as for a buffer.
    pub fn new(width: u32, height: u32) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 || width as u64 * height as u64 > MAX_PIXELS {
            return Err(CanvasError::InvalidDimensions { width, height });
        }
        Ok(Self { layers: Vec::new(), width, height, focus: 0 })
    }

    /// Stack holding a single opaque "Background" layer.
    pub fn with_background(width: u32, height: u32, color: Pixel) -> Result<Self, CanvasError> {
        let mut stack = Self::new(width, height)?;
        let background = Layer::from_buffer("Background", RasterBuffer::new_filled(width, height, color)?);
        stack.insert(0, background)?;
        Ok(stack)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers bottom to top.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Result<&Layer, CanvasError> {
        let len = self.layers.len();
        self.layers.get(index).ok_or(CanvasError::LayerIndex { index, len })
    }

    pub fn layer_mut(&mut self, index: usize) -> Result<&mut Layer, CanvasError> {
        let len = self.layers.len();
        self.layers.get_mut(index).ok_or(CanvasError::LayerIndex { index, len })
    }

    // ---- focus --------------------------------------------------------------

    /// Focused layer index, `None` while the stack is empty.
    pub fn focus(&self) -> Option<usize> {
        (!self.layers.is_empty()).then_some(self.focus)
    }

    pub fn set_focus(&mut self, index: usize) -> Result<(), CanvasError> {
        self.layer(index)?;
        self.focus = index;
        Ok(())
    }

    pub fn focused_layer(&self) -> Result<&Layer, CanvasError> {
        let index = self.focus().ok_or(CanvasError::EmptyStack)?;
        self.layer(index)
    }

    pub fn focused_layer_mut(&mut self) -> Result<&mut Layer, CanvasError> {
        let index = self.focus().ok_or(CanvasError::EmptyStack)?;
        self.layer_mut(index)
    }

    // ---- structure ----------------------------------------------------------

    /// A transparent layer at stack dimensions, not yet inserted.
    pub fn new_layer(&self, name: impl Into<String>) -> Result<Layer, CanvasError> {
        Layer::new(name, self.width, self.height)
    }

    /// Insert a fresh transparent layer at `index` and focus it.
    pub fn insert_layer(&mut self, index: usize, name: impl Into<String>) -> Result<usize, CanvasError> {
        let layer = self.new_layer(name)?;
        self.insert(index, layer)
    }

    /// Insert an existing layer at `index` and focus it.
    ///
    /// A layer of a different size is a programmer error: it asserts in debug
    /// builds and is rejected with `DimensionMismatch` in release builds.
    pub fn insert(&mut self, index: usize, layer: Layer) -> Result<usize, CanvasError> {
        let actual = layer.pixels.dimensions();
        debug_assert_eq!(actual, self.dimensions(), "layer '{}' does not match the canvas", layer.name);
        if actual != self.dimensions() {
            return Err(CanvasError::DimensionMismatch { expected: self.dimensions(), actual });
        }
        let len = self.layers.len();
        if index > len {
            return Err(CanvasError::LayerIndex { index, len });
        }
        self.layers.insert(index, layer);
        self.focus = index;
        Ok(index)
    }

    /// Remove and return the layer at `index`. Focus stays on the same layer when it
    /// survives. Removing the focused layer focuses the one below it, or the new
    /// bottom layer when the bottom one was removed.
    pub fn remove_layer(&mut self, index: usize) -> Result<Layer, CanvasError> {
        self.layer(index)?;
        let removed = self.layers.remove(index);
        if index <= self.focus {
            self.focus = self.focus.saturating_sub(1);
        }
        Ok(removed)
    }

    /// Move the layer at `from` so it ends up at index `to`. Focus follows the layer it was on.
    pub fn move_layer(&mut self, from: usize, to: usize) -> Result<(), CanvasError> {
        self.layer(from)?;
        self.layer(to)?;
        if from == to {
            return Ok(());
        }
        let focused = self.focus;
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        self.focus = if focused == from {
            to
        } else if from < focused && focused <= to {
            focused - 1
        } else if to <= focused && focused < from {
            focused + 1
        } else {
            focused
        };
        Ok(())
    }

    /// Put `layer` in place of the layer at `index`, returning the old one. Focus is unchanged.
    pub fn replace_layer(&mut self, index: usize, layer: Layer) -> Result<Layer, CanvasError> {
        let actual = layer.pixels.dimensions();
        if actual != self.dimensions() {
            return Err(CanvasError::DimensionMismatch { expected: self.dimensions(), actual });
        }
        let slot = self.layer_mut(index)?;
        Ok(std::mem::replace(slot, layer))
    }

    /// Copy the layer at `index` directly above it and focus the copy.
    pub fn duplicate_layer(&mut self, index: usize) -> Result<usize, CanvasError> {
        let mut copy = self.layer(index)?.clone();
        copy.name = format!("{} copy", copy.name);
        self.insert(index + 1, copy)
    }

    // ---- per-layer properties ----------------------------------------------

    pub fn rename_layer(&mut self, index: usize, name: impl Into<String>) -> Result<(), CanvasError> {
        self.layer_mut(index)?.name = name.into();
        Ok(())
    }

    pub fn opacity(&self, index: usize) -> Result<f32, CanvasError> {
        Ok(self.layer(index)?.opacity())
    }

    pub fn set_opacity(&mut self, index: usize, opacity: f32) -> Result<(), CanvasError> {
        self.layer_mut(index)?.set_opacity(opacity);
        Ok(())
    }

    pub fn blend_mode(&self, index: usize) -> Result<BlendMode, CanvasError> {
        Ok(self.layer(index)?.blend_mode)
    }

    pub fn set_blend_mode(&mut self, index: usize, mode: BlendMode) -> Result<(), CanvasError> {
        self.layer_mut(index)?.blend_mode = mode;
        Ok(())
    }

    // ---- rendering ----------------------------------------------------------

    /// Flatten all layers into a new buffer.
    pub fn composite(&self) -> RasterBuffer {
        compositor::render(self)
    }

    /// Flatten all layers into a contiguous image.
    pub fn composite_image(&self) -> RgbaImage {
        compositor::render_image(self)
    }
}
