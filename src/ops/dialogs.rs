// ============================================================================
// FILTER DIALOGS - parameter collection for modal filters
// ============================================================================
//
// The widgets themselves belong to the UI. This module defines what the
// pipeline hands to a dialog factory, the handle it gets back, and a headless
// dialog that simply holds a typed input (used by the CLI and by tests).
// ============================================================================

use crate::canvas::RasterBuffer;
use crate::color::Rgb;
use crate::ops::filters::{FilterId, FilterInput};

/// What a dialog factory is told when a modal filter is invoked.
#[derive(Clone, Debug, PartialEq)]
pub struct DialogRequest {
    pub filter: FilterId,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Largest canvas dimension a dialog may propose.
    pub max_width: u32,
    pub max_height: u32,
    pub primary: Rgb,
    pub secondary: Rgb,
    /// Layer the filter will target if confirmed now.
    pub layer_index: Option<usize>,
    /// Copy-on-write snapshot of that layer for live previews.
    pub layer_preview: Option<RasterBuffer>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DialogError {
    #[error("dialog reported an error: {0}")]
    Reported(String),
    #[error("dialog was already released")]
    Released,
    #[error("dialog produced {actual:?} input for the {expected:?} filter")]
    InputMismatch { expected: FilterId, actual: FilterId },
}

/// Result of one round of user interaction with a dialog.
#[derive(Clone, Debug, PartialEq)]
pub enum DialogResult<T> {
    /// Dialog is still open, no action needed.
    Open,
    /// A parameter changed.
    Changed(T),
    /// User clicked OK - contains the final values.
    Ok(T),
    /// User clicked Cancel.
    Cancel,
}

/// Handle to an open parameter dialog. `destroy` is called exactly once by the pipeline.
pub trait FilterDialog: Send {
    /// The input as currently entered.
    fn input(&self) -> Result<FilterInput, DialogError>;

    /// Replace the entered input.
    fn update(&mut self, input: FilterInput) -> Result<(), DialogError>;

    /// Width the dialog would like to be shown at, if it cares.
    fn preferred_width(&self) -> Option<u32> {
        None
    }

    /// Release whatever the dialog holds.
    fn destroy(&mut self);
}

/// Builds the dialog for a modal filter.
pub type DialogFactory = fn(&DialogRequest) -> Box<dyn FilterDialog>;

/// Dialog with no widgets: starts from the filter's defaults and keeps whatever input it is given.
#[derive(Debug)]
pub struct ParamDialog {
    filter: FilterId,
    input: FilterInput,
    error: Option<String>,
    released: bool,
}

impl ParamDialog {
    pub fn new(request: &DialogRequest) -> Self {
        Self {
            filter: request.filter,
            input: FilterInput::defaults(request.filter, request),
            error: None,
            released: false,
        }
    }

    /// Factory for [`crate::ops::filters::FilterDescriptor::modal`].
    pub fn factory(request: &DialogRequest) -> Box<dyn FilterDialog> {
        Box::new(Self::new(request))
    }

    /// Make the next `input()` call fail.
    pub fn report_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl FilterDialog for ParamDialog {
    fn input(&self) -> Result<FilterInput, DialogError> {
        if self.released {
            return Err(DialogError::Released);
        }
        if let Some(message) = &self.error {
            return Err(DialogError::Reported(message.clone()));
        }
        Ok(self.input.clone())
    }

    fn update(&mut self, input: FilterInput) -> Result<(), DialogError> {
        if self.released {
            return Err(DialogError::Released);
        }
        if input.filter_id() != self.filter {
            return Err(DialogError::InputMismatch { expected: self.filter, actual: input.filter_id() });
        }
        self.input = input;
        Ok(())
    }

    fn destroy(&mut self) {
        self.released = true;
    }
}
