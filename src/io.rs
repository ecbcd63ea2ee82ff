use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, ImageEncoder, ImageFormat, RgbaImage};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::{BlendMode, CanvasError, Layer, LayerStack, RasterBuffer};

// ============================================================================
// STORED PROJECT FORMAT
// ============================================================================

/// Magic header of the legacy record (no thumbnail)
const STORAGE_MAGIC_V0: &str = "PCS0";
/// Magic header of the current record
const STORAGE_MAGIC_V1: &str = "PCS1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
pub const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
pub const MAX_LAYERS: usize = 256;

/// V0 (legacy) serializable record
#[derive(Serialize, Deserialize)]
struct StorageFileV0 {
    magic: String,
    id: String,
    timestamp_ms: u64,
    width: u32,
    height: u32,
    layers: Vec<StorageLayer>,
}

/// V1 serializable record, adds the thumbnail
#[derive(Serialize, Deserialize)]
struct StorageFileV1 {
    magic: String,
    id: String,
    timestamp_ms: u64,
    thumbnail: Option<Vec<u8>>,
    width: u32,
    height: u32,
    layers: Vec<StorageLayer>,
}

/// One stored layer; `blob` is a PNG of the full canvas size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageLayer {
    pub name: String,
    pub opacity: f32,
    /// Stable blend mode code, absent means normal.
    pub blend_mode: Option<u8>,
    pub blob: Vec<u8>,
}

/// A project as kept by the blob store.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageProject {
    pub id: Uuid,
    pub timestamp_ms: u64,
    /// PNG thumbnail. Older records have none.
    pub thumbnail: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub layers: Vec<StorageLayer>,
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] Box<bincode::ErrorKind>),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl StorageProject {
    /// Encode every layer of `stack` as PNG. `thumbnail_max_edge` of `None` skips the thumbnail.
    pub fn capture(id: Uuid, stack: &LayerStack, thumbnail_max_edge: Option<u32>) -> Result<Self, StorageError> {
        let layers = stack
            .layers()
            .par_iter()
            .map(|layer| -> Result<StorageLayer, StorageError> {
                Ok(StorageLayer {
                    name: layer.name.clone(),
                    opacity: layer.opacity(),
                    blend_mode: Some(layer.blend_mode.to_u8()),
                    blob: encode_png(&layer.pixels().to_rgba_image())?,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let thumbnail = match thumbnail_max_edge {
            Some(edge) => Some(encode_png(&thumbnail(&stack.composite_image(), edge))?),
            None => None,
        };

        Ok(Self { id, timestamp_ms: now_ms(), thumbnail, width: stack.width(), height: stack.height(), layers })
    }

    /// Decode back into a stack. The top layer gets focus.
    pub fn to_layer_stack(&self) -> Result<LayerStack, StorageError> {
        check_limits(self.width, self.height, self.layers.len())?;
        let (w, h) = (self.width, self.height);

        let buffers = self
            .layers
            .par_iter()
            .map(|sl| -> Result<RasterBuffer, StorageError> {
                let img = image::load_from_memory_with_format(&sl.blob, ImageFormat::Png)?.to_rgba8();
                if img.dimensions() == (w, h) {
                    return Ok(RasterBuffer::from_rgba_image(&img)?);
                }
                warn!("Stored layer '{}' is {:?}, clipping to {}x{}", sl.name, img.dimensions(), w, h);
                let mut buf = RasterBuffer::new(w, h)?;
                buf.copy_from_source_clipped(&img);
                Ok(buf)
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        let mut stack = LayerStack::new(w, h)?;
        for (sl, pixels) in self.layers.iter().zip(buffers) {
            let mut layer = Layer::from_buffer(sl.name.clone(), pixels);
            layer.set_opacity(sl.opacity);
            layer.blend_mode = sl.blend_mode.map(BlendMode::from_u8).unwrap_or_default();
            stack.insert(stack.len(), layer)?;
        }
        Ok(stack)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let file = StorageFileV1 {
            magic: STORAGE_MAGIC_V1.to_string(),
            id: self.id.to_string(),
            timestamp_ms: self.timestamp_ms,
            thumbnail: self.thumbnail.clone(),
            width: self.width,
            height: self.height,
            layers: self.layers.clone(),
        };
        Ok(bincode::serialize(&file)?)
    }

    /// Parse a record of either version.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, StorageError> {
        if raw.len() < 12 {
            return Err(StorageError::InvalidFormat("File too small".into()));
        }
        // bincode encodes a String as an 8-byte length prefix + UTF-8 data,
        // so bytes 8..12 hold the 4-char magic.
        let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
        let project = match magic {
            STORAGE_MAGIC_V1 => {
                let f: StorageFileV1 = bincode::deserialize(raw)?;
                Self {
                    id: parse_id(&f.id)?,
                    timestamp_ms: f.timestamp_ms,
                    thumbnail: f.thumbnail,
                    width: f.width,
                    height: f.height,
                    layers: f.layers,
                }
            }
            STORAGE_MAGIC_V0 => {
                let f: StorageFileV0 = bincode::deserialize(raw)?;
                Self {
                    id: parse_id(&f.id)?,
                    timestamp_ms: f.timestamp_ms,
                    thumbnail: None,
                    width: f.width,
                    height: f.height,
                    layers: f.layers,
                }
            }
            _ => return Err(StorageError::InvalidFormat(format!("Unknown magic '{}'", magic))),
        };
        check_limits(project.width, project.height, project.layers.len())?;
        Ok(project)
    }

    /// Serialize + write to disk.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let bytes = self.to_bytes()?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&bytes)?;
        writer.flush()?;
        info!("Saved project {} to {}", self.id, path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let raw = std::fs::read(path)?;
        let project = Self::from_bytes(&raw)?;
        info!("Loaded project {} from {} ({} layers)", project.id, path.display(), project.layers.len());
        Ok(project)
    }
}

fn parse_id(id: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(id).map_err(|e| StorageError::InvalidFormat(format!("Bad project id '{}': {}", id, e)))
}

fn check_limits(width: u32, height: u32, layers: usize) -> Result<(), StorageError> {
    if width == 0 || height == 0 {
        return Err(StorageError::InvalidFormat("Canvas dimensions cannot be zero".into()));
    }
    if width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(StorageError::InvalidFormat(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            width, height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if layers == 0 {
        return Err(StorageError::InvalidFormat("Project contains no layers".into()));
    }
    if layers > MAX_LAYERS {
        return Err(StorageError::InvalidFormat(format!(
            "Project contains {} layers, which exceeds the maximum of {}",
            layers, MAX_LAYERS
        )));
    }
    Ok(())
}

// ============================================================================
// PNG / THUMBNAIL HELPERS
// ============================================================================

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgba8)?;
    Ok(bytes)
}

/// Downscale so the longest edge is at most `max_edge`. Smaller images are kept as is.
pub fn thumbnail(image: &RgbaImage, max_edge: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= max_edge || max_edge == 0 {
        return image.clone();
    }
    let scale = max_edge as f32 / longest as f32;
    let tw = ((w as f32 * scale).round() as u32).max(1);
    let th = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(image, tw, th, FilterType::Triangle)
}

/// Write a flattened image as PNG.
pub fn write_png(image: &RgbaImage, path: &Path) -> Result<(), StorageError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&encode_png(image)?)?;
    writer.flush()?;
    Ok(())
}

/// Load a stored project (`.pcs`, layers kept) or an image file (one layer named
/// after the file).
pub fn load_layer_stack(path: &Path) -> Result<LayerStack, StorageError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    if ext == "pcs" {
        return StorageProject::load(path)?.to_layer_stack();
    }

    let img = image::open(path)?.to_rgba8();
    check_limits(img.width(), img.height(), 1)?;
    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("Background").to_string();
    let mut stack = LayerStack::new(img.width(), img.height())?;
    stack.insert(0, Layer::from_buffer(name, RasterBuffer::from_rgba_image(&img)?))?;
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn sample_stack() -> LayerStack {
        let mut stack = LayerStack::with_background(40, 20, Rgba([200, 100, 50, 255])).unwrap();
        let top = stack.insert_layer(1, "Ink").unwrap();
        stack.layer_mut(top).unwrap().put_pixel(5, 5, Rgba([0, 0, 0, 255])).unwrap();
        stack.set_blend_mode(top, BlendMode::Multiply).unwrap();
        stack.set_opacity(top, 0.5).unwrap();
        stack
    }

    #[test]
    fn record_round_trips_through_file() {
        let stack = sample_stack();
        let project = StorageProject::capture(Uuid::new_v4(), &stack, Some(16)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pcs");
        project.save(&path).unwrap();

        let loaded = StorageProject::load(&path).unwrap();
        assert_eq!(loaded, project);
        let thumb = image::load_from_memory(loaded.thumbnail.as_deref().unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (16, 8));

        let back = load_layer_stack(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.focus(), Some(1));
        assert_eq!(back.layer(1).unwrap().blend_mode, BlendMode::Multiply);
        assert_eq!(back.layer(1).unwrap().opacity(), 0.5);
        assert_eq!(back.layer(1).unwrap().pixels(), stack.layer(1).unwrap().pixels());
    }

    #[test]
    fn legacy_record_loads_without_thumbnail() {
        let stack = sample_stack();
        let current = StorageProject::capture(Uuid::new_v4(), &stack, None).unwrap();
        let mut layers = current.layers.clone();
        layers[1].blend_mode = None;
        let legacy = StorageFileV0 {
            magic: STORAGE_MAGIC_V0.to_string(),
            id: current.id.to_string(),
            timestamp_ms: 7,
            width: 40,
            height: 20,
            layers,
        };
        let loaded = StorageProject::from_bytes(&bincode::serialize(&legacy).unwrap()).unwrap();
        assert_eq!(loaded.thumbnail, None);
        assert_eq!(loaded.id, current.id);
        let back = loaded.to_layer_stack().unwrap();
        assert_eq!(back.layer(1).unwrap().blend_mode, BlendMode::Normal);
    }

    #[test]
    fn rejects_bad_records() {
        assert!(matches!(StorageProject::from_bytes(b"tiny"), Err(StorageError::InvalidFormat(_))));

        let mut project = StorageProject::capture(Uuid::new_v4(), &sample_stack(), None).unwrap();
        project.width = MAX_CANVAS_DIM + 1;
        let bytes = project.to_bytes().unwrap();
        assert!(matches!(StorageProject::from_bytes(&bytes), Err(StorageError::InvalidFormat(_))));

        let mut bytes = StorageProject::capture(Uuid::new_v4(), &sample_stack(), None).unwrap().to_bytes().unwrap();
        bytes[8..12].copy_from_slice(b"XXXX");
        assert!(matches!(StorageProject::from_bytes(&bytes), Err(StorageError::InvalidFormat(_))));
    }

    #[test]
    fn thumbnail_keeps_small_images() {
        let img = RgbaImage::new(10, 30);
        assert_eq!(thumbnail(&img, 256).dimensions(), (10, 30));
        assert_eq!(thumbnail(&img, 15).dimensions(), (5, 15));
    }

    #[test]
    fn png_input_loads_as_one_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_png(&RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255])), &path).unwrap();
        let stack = load_layer_stack(&path).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.layer(0).unwrap().name, "photo");
        assert_eq!(stack.dimensions(), (3, 2));
    }
}
