use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::canvas::{BlendMode, CanvasError, Layer, LayerStack, RasterBuffer, RasterSource};

/// A decoded image shared between the importer and the project.
pub type SharedSource = Arc<dyn RasterSource + Send + Sync>;

/// Features of a layered document the importer could not represent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImportWarning {
    Mask,
    Clipping,
    Group,
    Adjustment,
    LayerEffect,
    SmartObject,
    BlendMode,
    BitsPerChannel,
}

impl ImportWarning {
    pub fn name(&self) -> &'static str {
        match self {
            ImportWarning::Mask => "mask",
            ImportWarning::Clipping => "clipping",
            ImportWarning::Group => "group",
            ImportWarning::Adjustment => "adjustment",
            ImportWarning::LayerEffect => "layer-effect",
            ImportWarning::SmartObject => "smart-object",
            ImportWarning::BlendMode => "blend-mode",
            ImportWarning::BitsPerChannel => "bits-per-channel",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            ImportWarning::Mask,
            ImportWarning::Clipping,
            ImportWarning::Group,
            ImportWarning::Adjustment,
            ImportWarning::LayerEffect,
            ImportWarning::SmartObject,
            ImportWarning::BlendMode,
            ImportWarning::BitsPerChannel,
        ]
        .into_iter()
        .find(|w| w.name() == name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ImportError {
    #[error("document has neither layers nor a composite image")]
    NoImageData,
    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

/// One layer as handed over by an external document decoder.
#[derive(Clone)]
pub struct ImportedLayer {
    pub name: String,
    pub opacity: f32,
    /// Compositing operation name, e.g. `"multiply"`.
    pub blend_mode: String,
    pub image: SharedSource,
}

/// The result of decoding an external layered document.
#[derive(Clone)]
pub struct ImportedDocument {
    pub width: u32,
    pub height: u32,
    pub layers: Option<Vec<ImportedLayer>>,
    pub warnings: Vec<ImportWarning>,
    /// The decoder could only produce the flattened composite.
    pub flattened: bool,
    pub composite: Option<SharedSource>,
}

impl ImportedDocument {
    /// Turn the decoded document into a project. Warnings are passed through, plus
    /// `BlendMode` when a layer used an unknown compositing operation.
    pub fn into_project(self) -> Result<(Project, Vec<ImportWarning>), ImportError> {
        if self.width == 0 || self.height == 0 {
            return Err(CanvasError::InvalidDimensions { width: self.width, height: self.height }.into());
        }
        let mut warnings = self.warnings;
        let layers = match self.layers {
            Some(layers) if !layers.is_empty() && !self.flattened => layers
                .into_iter()
                .map(|l| {
                    let blend_mode = BlendMode::from_op_name(&l.blend_mode);
                    if blend_mode.op_name() != l.blend_mode && !warnings.contains(&ImportWarning::BlendMode) {
                        warnings.push(ImportWarning::BlendMode);
                    }
                    ProjectLayer { name: l.name, opacity: l.opacity, blend_mode, image: l.image }
                })
                .collect(),
            _ => {
                let composite = self.composite.ok_or(ImportError::NoImageData)?;
                vec![ProjectLayer::new("Background", composite)]
            }
        };
        for w in &warnings {
            warn!("Import: unsupported document feature '{}'", w.name());
        }
        Ok((Project { width: self.width, height: self.height, layers }, warnings))
    }
}

#[derive(Clone)]
pub struct ProjectLayer {
    pub name: String,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub image: SharedSource,
}

impl ProjectLayer {
    pub fn new(name: impl Into<String>, image: SharedSource) -> Self {
        Self { name: name.into(), opacity: 1.0, blend_mode: BlendMode::Normal, image }
    }
}

impl fmt::Debug for ProjectLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectLayer")
            .field("name", &self.name)
            .field("opacity", &self.opacity)
            .field("blend_mode", &self.blend_mode)
            .field("image", &self.image.dimensions())
            .finish()
    }
}

/// Value snapshot of a layered image, independent of any live stack.
#[derive(Clone, Debug)]
pub struct Project {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<ProjectLayer>,
}

impl Project {
    pub fn from_stack(stack: &LayerStack) -> Self {
        let layers = stack
            .layers()
            .iter()
            .map(|layer| ProjectLayer {
                name: layer.name.clone(),
                opacity: layer.opacity(),
                blend_mode: layer.blend_mode,
                image: Arc::new(layer.pixels().clone()) as SharedSource,
            })
            .collect();
        Self { width: stack.width(), height: stack.height(), layers }
    }

    /// Build a stack at the project's size. Images of another size are drawn at the
    /// origin and clipped. The top layer gets focus.
    pub fn into_layer_stack(&self) -> Result<LayerStack, CanvasError> {
        let mut stack = LayerStack::new(self.width, self.height)?;
        for pl in &self.layers {
            let mut pixels = RasterBuffer::new(self.width, self.height)?;
            if pl.image.dimensions() != (self.width, self.height) {
                warn!(
                    "Layer '{}' is {:?}, clipping to {}x{}",
                    pl.name,
                    pl.image.dimensions(),
                    self.width,
                    self.height
                );
            }
            pixels.copy_from_source_clipped(pl.image.as_ref());
            let mut layer = Layer::from_buffer(pl.name.clone(), pixels);
            layer.set_opacity(pl.opacity);
            layer.blend_mode = pl.blend_mode;
            stack.insert(stack.len(), layer)?;
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32, v: u8) -> SharedSource {
        Arc::new(RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255])))
    }

    fn doc(layers: Option<Vec<ImportedLayer>>, composite: Option<SharedSource>) -> ImportedDocument {
        ImportedDocument { width: 4, height: 4, layers, warnings: vec![ImportWarning::Mask], flattened: false, composite }
    }

    #[test]
    fn composite_becomes_single_layer() {
        let (project, warnings) = doc(None, Some(solid(4, 4, 7))).into_project().unwrap();
        assert_eq!(project.layers.len(), 1);
        assert_eq!(warnings, vec![ImportWarning::Mask]);
        let stack = project.into_layer_stack().unwrap();
        assert_eq!(stack.layer(0).unwrap().pixels().get_pixel(3, 3).unwrap(), Rgba([7, 7, 7, 255]));
        assert!(matches!(doc(None, None).into_project(), Err(ImportError::NoImageData)));
    }

    #[test]
    fn unknown_blend_mode_warns_once() {
        let layer = |mode: &str| ImportedLayer {
            name: "l".into(),
            opacity: 0.5,
            blend_mode: mode.into(),
            image: solid(4, 4, 1),
        };
        let layers = vec![layer("multiply"), layer("pin-light"), layer("vivid-light")];
        let (project, warnings) = doc(Some(layers), None).into_project().unwrap();
        assert_eq!(project.layers[0].blend_mode, BlendMode::Multiply);
        assert_eq!(project.layers[1].blend_mode, BlendMode::Normal);
        assert_eq!(warnings, vec![ImportWarning::Mask, ImportWarning::BlendMode]);
    }

    #[test]
    fn oversized_images_are_clipped_and_top_is_focused() {
        let project = Project {
            width: 2,
            height: 2,
            layers: vec![ProjectLayer::new("big", solid(5, 5, 9)), ProjectLayer::new("small", solid(1, 1, 3))],
        };
        let stack = project.into_layer_stack().unwrap();
        assert_eq!(stack.focus(), Some(1));
        assert_eq!(stack.layer(0).unwrap().pixels().get_pixel(1, 1).unwrap(), Rgba([9, 9, 9, 255]));
        assert_eq!(stack.layer(1).unwrap().pixels().get_pixel(1, 1).unwrap()[3], 0);
    }

    #[test]
    fn stack_round_trips_through_project() {
        let mut stack = LayerStack::with_background(3, 3, Rgba([1, 2, 3, 255])).unwrap();
        stack.set_blend_mode(0, BlendMode::Screen).unwrap();
        stack.set_opacity(0, 0.25).unwrap();
        let back = Project::from_stack(&stack).into_layer_stack().unwrap();
        assert_eq!(back.layer(0).unwrap().blend_mode, BlendMode::Screen);
        assert_eq!(back.layer(0).unwrap().opacity(), 0.25);
        assert_eq!(back.layer(0).unwrap().pixels(), stack.layer(0).unwrap().pixels());
        assert_eq!(ImportWarning::from_name("smart-object"), Some(ImportWarning::SmartObject));
    }
}
