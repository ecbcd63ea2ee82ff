// ============================================================================
// FILTERS - descriptors, typed inputs and the built-in registry
// ============================================================================
//
// A filter is either instant (apply only), modal (dialog + apply) or inert.
// Apply functions receive the target layer, the stack, their typed input and
// a pending history buffer; they record their own undo entries.
// ============================================================================

use std::fmt;

use crate::canvas::{CanvasError, LayerStack, RasterBuffer};
use crate::components::history::{PendingHistory, SingleLayerSnapshotCommand, StackSnapshotCommand};
use crate::ops::adjustments::{self, GrayscaleMode};
use crate::ops::dialogs::{DialogFactory, DialogRequest, ParamDialog};
use crate::ops::gradient::{GradientParams, render_gradient};
use crate::ops::shapes::{PaintError, ShapeKind, ShapeParams, rasterize_shape};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("{0}")]
    Rejected(String),
    #[error("filter {expected:?} received {actual:?} input")]
    InputMismatch { expected: FilterId, actual: FilterId },
    #[error("invalid filter descriptor: {0}")]
    InvalidDescriptor(&'static str),
    #[error(transparent)]
    Paint(#[from] PaintError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterId {
    Invert,
    Grayscale,
    BrightnessContrast,
    HueSaturation,
    Flip,
    Gradient,
    Shape,
}

impl FilterId {
    pub fn all() -> &'static [FilterId] {
        &[
            FilterId::Invert,
            FilterId::Grayscale,
            FilterId::BrightnessContrast,
            FilterId::HueSaturation,
            FilterId::Flip,
            FilterId::Gradient,
            FilterId::Shape,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterId::Invert => "invert",
            FilterId::Grayscale => "grayscale",
            FilterId::BrightnessContrast => "brightness-contrast",
            FilterId::HueSaturation => "hue-saturation",
            FilterId::Flip => "flip",
            FilterId::Gradient => "gradient",
            FilterId::Shape => "shape",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|id| id.name() == name)
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// TYPED INPUTS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GrayscaleInput {
    pub mode: GrayscaleMode,
    /// 0..1
    pub strength: f32,
}

impl Default for GrayscaleInput {
    fn default() -> Self {
        Self { mode: GrayscaleMode::Luminance, strength: 1.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BrightnessContrastInput {
    /// -1..1
    pub brightness: f32,
    /// -1..1
    pub contrast: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct HueSaturationInput {
    /// Degrees.
    pub hue: f32,
    /// -1..1
    pub saturation: f32,
    /// -1..1
    pub lightness: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlipInput {
    pub horizontal: bool,
    pub vertical: bool,
    /// Flip every layer instead of only the target.
    pub whole_stack: bool,
}

impl Default for FlipInput {
    fn default() -> Self {
        Self { horizontal: true, vertical: false, whole_stack: false }
    }
}

/// Input of one filter invocation, tagged by filter.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterInput {
    Invert,
    Grayscale(GrayscaleInput),
    BrightnessContrast(BrightnessContrastInput),
    HueSaturation(HueSaturationInput),
    Flip(FlipInput),
    Gradient(GradientParams),
    Shape(ShapeParams),
}

impl FilterInput {
    pub fn filter_id(&self) -> FilterId {
        match self {
            FilterInput::Invert => FilterId::Invert,
            FilterInput::Grayscale(_) => FilterId::Grayscale,
            FilterInput::BrightnessContrast(_) => FilterId::BrightnessContrast,
            FilterInput::HueSaturation(_) => FilterId::HueSaturation,
            FilterInput::Flip(_) => FilterId::Flip,
            FilterInput::Gradient(_) => FilterId::Gradient,
            FilterInput::Shape(_) => FilterId::Shape,
        }
    }

    /// Starting input for a filter's dialog.
    pub fn defaults(filter: FilterId, request: &DialogRequest) -> Self {
        let w = request.canvas_width as f32;
        let h = request.canvas_height as f32;
        match filter {
            FilterId::Invert => FilterInput::Invert,
            FilterId::Grayscale => FilterInput::Grayscale(GrayscaleInput::default()),
            FilterId::BrightnessContrast => FilterInput::BrightnessContrast(BrightnessContrastInput::default()),
            FilterId::HueSaturation => FilterInput::HueSaturation(HueSaturationInput::default()),
            FilterId::Flip => FilterInput::Flip(FlipInput::default()),
            FilterId::Gradient => FilterInput::Gradient(GradientParams {
                color: request.primary,
                x1: 0.0,
                y1: h * 0.5,
                x2: w,
                y2: h * 0.5,
                ..GradientParams::default()
            }),
            FilterId::Shape => FilterInput::Shape(ShapeParams {
                fill: Some(request.primary),
                stroke: Some(request.secondary),
                line_width: Some(1.0),
                ..ShapeParams::new(ShapeKind::Rect, (w * 0.25, h * 0.25), (w * 0.75, h * 0.75))
            }),
        }
    }
}

// ============================================================================
// APPLY
// ============================================================================

/// Everything an apply function gets to work with.
pub struct ApplyParams<'a> {
    pub layer_index: usize,
    pub stack: &'a mut LayerStack,
    pub input: &'a FilterInput,
    pub history: &'a mut PendingHistory,
}

impl ApplyParams<'_> {
    /// Run `edit` on the target layer's pixels and record a single-layer history entry.
    pub fn edit_layer(
        &mut self,
        description: &str,
        edit: impl FnOnce(&mut RasterBuffer) -> Result<(), FilterError>,
    ) -> Result<(), FilterError> {
        let mut cmd = SingleLayerSnapshotCommand::new_for_layer(description, self.stack, self.layer_index)?;
        edit(self.stack.layer_mut(self.layer_index)?.pixels_mut())?;
        cmd.set_after(self.stack)?;
        self.history.record(cmd);
        Ok(())
    }

    /// Run `edit` on every layer and record one whole-stack history entry.
    pub fn edit_all_layers(
        &mut self,
        description: &str,
        edit: impl Fn(&mut RasterBuffer) -> Result<(), FilterError>,
    ) -> Result<(), FilterError> {
        let mut cmd = StackSnapshotCommand::new(description, self.stack);
        for index in 0..self.stack.len() {
            edit(self.stack.layer_mut(index)?.pixels_mut())?;
        }
        cmd.set_after(self.stack);
        self.history.record(cmd);
        Ok(())
    }

    fn mismatch(&self, expected: FilterId) -> FilterError {
        FilterError::InputMismatch { expected, actual: self.input.filter_id() }
    }
}

pub type ApplyFn = fn(&mut ApplyParams<'_>) -> Result<(), FilterError>;

fn apply_invert(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    if !matches!(p.input, FilterInput::Invert) {
        return Err(p.mismatch(FilterId::Invert));
    }
    p.edit_layer("Invert Colors", |buf| {
        adjustments::invert_colors(buf);
        Ok(())
    })
}

fn apply_grayscale(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    let FilterInput::Grayscale(input) = p.input else {
        return Err(p.mismatch(FilterId::Grayscale));
    };
    let input = *input;
    p.edit_layer("Grayscale", |buf| {
        adjustments::desaturate(buf, input.mode, input.strength);
        Ok(())
    })
}

fn apply_brightness_contrast(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    let FilterInput::BrightnessContrast(input) = p.input else {
        return Err(p.mismatch(FilterId::BrightnessContrast));
    };
    let input = *input;
    p.edit_layer("Brightness / Contrast", |buf| {
        adjustments::brightness_contrast(buf, input.brightness, input.contrast);
        Ok(())
    })
}

fn apply_hue_saturation(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    let FilterInput::HueSaturation(input) = p.input else {
        return Err(p.mismatch(FilterId::HueSaturation));
    };
    let input = *input;
    p.edit_layer("Hue / Saturation", |buf| {
        adjustments::hue_saturation_lightness(buf, input.hue, input.saturation, input.lightness);
        Ok(())
    })
}

fn apply_flip(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    let FilterInput::Flip(input) = p.input else {
        return Err(p.mismatch(FilterId::Flip));
    };
    let input = *input;
    if !input.horizontal && !input.vertical {
        return Err(FilterError::Rejected("nothing to flip".into()));
    }
    let flip = |buf: &mut RasterBuffer| {
        if input.horizontal {
            buf.flip_horizontal();
        }
        if input.vertical {
            buf.flip_vertical();
        }
        Ok(())
    };
    if input.whole_stack {
        p.edit_all_layers("Flip Image", flip)
    } else {
        p.edit_layer("Flip Layer", flip)
    }
}

fn apply_gradient(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    let FilterInput::Gradient(params) = p.input else {
        return Err(p.mismatch(FilterId::Gradient));
    };
    p.edit_layer("Gradient", |buf| Ok(render_gradient(buf, params)?))
}

fn apply_shape(p: &mut ApplyParams<'_>) -> Result<(), FilterError> {
    let FilterInput::Shape(params) = p.input else {
        return Err(p.mismatch(FilterId::Shape));
    };
    p.edit_layer("Shape", |buf| Ok(rasterize_shape(buf, params)?))
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// Display metadata of a filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterInfo {
    pub display_name: String,
    pub button_label: String,
    pub changes_geometry: bool,
    pub icon: String,
    pub available_in_embed: bool,
}

impl FilterInfo {
    pub fn new(display_name: &str, icon: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            button_label: display_name.to_string(),
            changes_geometry: false,
            icon: icon.to_string(),
            available_in_embed: true,
        }
    }
}

#[derive(Clone, Copy)]
pub enum FilterBehavior {
    Instant { apply: ApplyFn },
    Modal { dialog: DialogFactory, apply: ApplyFn },
    Inert,
}

impl fmt::Debug for FilterBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterBehavior::Instant { .. } => "Instant",
            FilterBehavior::Modal { .. } => "Modal",
            FilterBehavior::Inert => "Inert",
        })
    }
}

#[derive(Clone, Debug)]
pub struct FilterDescriptor {
    pub id: FilterId,
    pub info: FilterInfo,
    behavior: FilterBehavior,
}

impl FilterDescriptor {
    pub fn instant(id: FilterId, info: FilterInfo, apply: ApplyFn) -> Self {
        Self { id, info, behavior: FilterBehavior::Instant { apply } }
    }

    pub fn modal(id: FilterId, info: FilterInfo, dialog: DialogFactory, apply: ApplyFn) -> Self {
        Self { id, info, behavior: FilterBehavior::Modal { dialog, apply } }
    }

    pub fn inert(id: FilterId, info: FilterInfo) -> Self {
        Self { id, info, behavior: FilterBehavior::Inert }
    }

    /// Build from loose parts, checking that dialog and apply are either both present,
    /// apply-only on an instant filter, or both absent.
    pub fn from_parts(
        id: FilterId,
        info: FilterInfo,
        is_instant: bool,
        dialog: Option<DialogFactory>,
        apply: Option<ApplyFn>,
    ) -> Result<Self, FilterError> {
        match (is_instant, dialog, apply) {
            (_, None, None) => Ok(Self::inert(id, info)),
            (true, None, Some(apply)) => Ok(Self::instant(id, info, apply)),
            (true, Some(_), _) => Err(FilterError::InvalidDescriptor("instant filter cannot have a dialog")),
            (false, Some(dialog), Some(apply)) => Ok(Self::modal(id, info, dialog, apply)),
            (false, None, Some(_)) => Err(FilterError::InvalidDescriptor("modal filter needs a dialog")),
            (false, Some(_), None) => Err(FilterError::InvalidDescriptor("dialog without apply")),
        }
    }

    pub fn behavior(&self) -> FilterBehavior {
        self.behavior
    }

    pub fn is_instant(&self) -> bool {
        matches!(self.behavior, FilterBehavior::Instant { .. })
    }

    pub fn is_inert(&self) -> bool {
        matches!(self.behavior, FilterBehavior::Inert)
    }
}

/// Descriptor of a built-in filter.
pub fn builtin(id: FilterId) -> FilterDescriptor {
    let dialog = ParamDialog::factory;
    match id {
        FilterId::Invert => FilterDescriptor::instant(id, FilterInfo::new("Invert", "invert"), apply_invert),
        FilterId::Grayscale => {
            FilterDescriptor::modal(id, FilterInfo::new("Grayscale", "grayscale"), dialog, apply_grayscale)
        }
        FilterId::BrightnessContrast => FilterDescriptor::modal(
            id,
            FilterInfo::new("Brightness / Contrast", "brightness-contrast"),
            dialog,
            apply_brightness_contrast,
        ),
        FilterId::HueSaturation => FilterDescriptor::modal(
            id,
            FilterInfo::new("Hue / Saturation", "hue-saturation"),
            dialog,
            apply_hue_saturation,
        ),
        FilterId::Flip => FilterDescriptor::modal(id, FilterInfo::new("Flip", "flip"), dialog, apply_flip),
        FilterId::Gradient => {
            FilterDescriptor::modal(id, FilterInfo::new("Gradient", "gradient"), dialog, apply_gradient)
        }
        FilterId::Shape => FilterDescriptor::modal(id, FilterInfo::new("Shape", "shape"), dialog, apply_shape),
    }
}

/// All built-in filters in menu order.
pub fn builtin_filters() -> Vec<FilterDescriptor> {
    FilterId::all().iter().map(|&id| builtin(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn noop(_: &mut ApplyParams<'_>) -> Result<(), FilterError> {
        Ok(())
    }

    fn info() -> FilterInfo {
        FilterInfo::new("Test", "test")
    }

    #[test]
    fn descriptor_contract_is_checked() {
        let dialog: DialogFactory = ParamDialog::factory;
        let id = FilterId::Invert;
        assert!(FilterDescriptor::from_parts(id, info(), true, None, Some(noop)).unwrap().is_instant());
        assert!(FilterDescriptor::from_parts(id, info(), false, None, None).unwrap().is_inert());
        assert!(matches!(
            FilterDescriptor::from_parts(id, info(), false, Some(dialog), Some(noop)).unwrap().behavior(),
            FilterBehavior::Modal { .. }
        ));
        for (instant, d, a) in [
            (true, Some(dialog), Some(noop as ApplyFn)),
            (false, None, Some(noop as ApplyFn)),
            (false, Some(dialog), None),
        ] {
            assert!(matches!(
                FilterDescriptor::from_parts(id, info(), instant, d, a),
                Err(FilterError::InvalidDescriptor(_))
            ));
        }
    }

    #[test]
    fn only_invert_is_instant() {
        for desc in builtin_filters() {
            assert_eq!(desc.is_instant(), desc.id == FilterId::Invert, "{}", desc.id);
            assert!(!desc.is_inert());
        }
        assert_eq!(FilterId::from_name("hue-saturation"), Some(FilterId::HueSaturation));
        assert_eq!(FilterId::from_name("blur"), None);
    }

    #[test]
    fn apply_records_one_layer_entry() {
        let mut stack = LayerStack::with_background(4, 4, Rgba([10, 20, 30, 255])).unwrap();
        let mut history = PendingHistory::new();
        let input = FilterInput::Invert;
        let mut params = ApplyParams { layer_index: 0, stack: &mut stack, input: &input, history: &mut history };
        apply_invert(&mut params).unwrap();
        assert_eq!(history.descriptions(), ["Invert Colors"]);
        assert_eq!(stack.layer(0).unwrap().pixels().get_pixel(1, 1).unwrap(), Rgba([245, 235, 225, 255]));
    }

    #[test]
    fn wrong_input_is_rejected_without_recording() {
        let mut stack = LayerStack::with_background(4, 4, Rgba([10, 20, 30, 255])).unwrap();
        let mut history = PendingHistory::new();
        let input = FilterInput::Invert;
        let mut params = ApplyParams { layer_index: 0, stack: &mut stack, input: &input, history: &mut history };
        let err = apply_grayscale(&mut params).unwrap_err();
        assert_eq!(err, FilterError::InputMismatch { expected: FilterId::Grayscale, actual: FilterId::Invert });
        assert!(history.is_empty());
    }

    #[test]
    fn whole_stack_flip_records_one_stack_entry() {
        let mut stack = LayerStack::with_background(4, 1, Rgba([0, 0, 0, 0])).unwrap();
        stack.insert_layer(1, "top").unwrap();
        for i in 0..2 {
            stack.layer_mut(i).unwrap().put_pixel(0, 0, Rgba([1, 1, 1, 255])).unwrap();
        }
        let mut history = PendingHistory::new();
        let input = FilterInput::Flip(FlipInput { horizontal: true, vertical: false, whole_stack: true });
        let mut params = ApplyParams { layer_index: 1, stack: &mut stack, input: &input, history: &mut history };
        apply_flip(&mut params).unwrap();
        assert_eq!(history.len(), 1);
        for i in 0..2 {
            assert_eq!(stack.layer(i).unwrap().pixels().get_pixel(3, 0).unwrap()[3], 255);
        }
    }
}
