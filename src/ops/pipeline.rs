// ============================================================================
// FILTER PIPELINE - parameter collection, apply, commit or rollback
// ============================================================================
//
//   Idle ──instant──────────────────────────► Applying ──ok──► Committed
//    │                                           ▲  └──err/panic──► Aborted
//    └──modal──► AwaitingParameters ──confirm────┘
//                      └──cancel / dialog error──► Aborted
//
// Only one Applying phase may exist per session; a second one is rejected
// with `Busy`. A modal invocation waiting for parameters holds no lock.
// ============================================================================

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};

use crate::canvas::CanvasError;
use crate::components::history::PendingHistory;
use crate::ops::dialogs::{DialogError, DialogResult, FilterDialog};
use crate::ops::filters::{ApplyFn, ApplyParams, FilterBehavior, FilterDescriptor, FilterId, FilterInput};
use crate::session::{ApplyGuard, EditingSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    AwaitingParameters,
    Applying,
    Committed,
    Aborted,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("another operation is already being applied")]
    Busy,
    #[error("filter {0} has nothing to run")]
    Inert(FilterId),
    #[error("no layer to apply to")]
    NoTarget,
    #[error("{filter} failed: {message}")]
    ApplyFailed { filter: FilterId, message: String },
    #[error(transparent)]
    Dialog(#[from] DialogError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error("invocation has already finished")]
    Finished,
}

/// What a committed apply left behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub filter: FilterId,
    pub layer_index: usize,
    /// History entries the filter committed.
    pub history_entries: usize,
}

pub enum Invocation<'s> {
    /// Instant filter, already committed.
    Applied(ApplyOutcome),
    /// Modal filter waiting for its parameters.
    Pending(PendingInvocation<'s>),
}

/// Start a filter on the session's focused layer.
pub fn invoke<'s>(
    session: &'s EditingSession,
    descriptor: &FilterDescriptor,
) -> Result<Invocation<'s>, PipelineError> {
    let filter = descriptor.id;
    match descriptor.behavior() {
        FilterBehavior::Inert => Err(PipelineError::Inert(filter)),
        FilterBehavior::Instant { apply } => {
            let guard = session.try_begin_apply().ok_or(PipelineError::Busy)?;
            debug!("Filter '{}': Idle -> Applying", filter);
            let input = FilterInput::defaults(filter, &session.dialog_request(filter)?);
            apply_exclusive(session, guard, filter, apply, &input).map(Invocation::Applied)
        }
        FilterBehavior::Modal { dialog, apply } => {
            // Held only while the request is read; the dialog itself waits unguarded.
            let request = {
                let _guard = session.try_begin_apply().ok_or(PipelineError::Busy)?;
                session.dialog_request(filter)?
            };
            debug!("Filter '{}': Idle -> AwaitingParameters", filter);
            Ok(Invocation::Pending(PendingInvocation {
                session,
                filter,
                apply,
                dialog: Some(dialog(&request)),
                state: PipelineState::AwaitingParameters,
            }))
        }
    }
}

/// A modal filter whose dialog is open.
///
/// The dialog is released exactly once: on confirm, cancel, dialog error or drop.
pub struct PendingInvocation<'s> {
    session: &'s EditingSession,
    filter: FilterId,
    apply: ApplyFn,
    dialog: Option<Box<dyn FilterDialog>>,
    state: PipelineState,
}

impl PendingInvocation<'_> {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn filter(&self) -> FilterId {
        self.filter
    }

    pub fn preferred_width(&self) -> Option<u32> {
        self.dialog.as_ref().and_then(|d| d.preferred_width())
    }

    /// Current input of the dialog.
    pub fn input(&self) -> Result<FilterInput, PipelineError> {
        match &self.dialog {
            Some(dialog) => Ok(dialog.input()?),
            None => Err(PipelineError::Finished),
        }
    }

    /// Replace the dialog's input.
    pub fn update(&mut self, input: FilterInput) -> Result<(), PipelineError> {
        match &mut self.dialog {
            Some(dialog) => Ok(dialog.update(input)?),
            None => Err(PipelineError::Finished),
        }
    }

    /// Feed one round of dialog interaction. Returns the outcome once the filter committed.
    pub fn respond(&mut self, result: DialogResult<FilterInput>) -> Result<Option<ApplyOutcome>, PipelineError> {
        match result {
            DialogResult::Open => Ok(None),
            DialogResult::Changed(input) => self.update(input).map(|_| None),
            DialogResult::Ok(input) => {
                self.update(input)?;
                self.confirm().map(Some)
            }
            DialogResult::Cancel => {
                self.cancel();
                Ok(None)
            }
        }
    }

    /// Read the input and apply it.
    ///
    /// `Busy` leaves the invocation waiting so it can be confirmed again. A dialog
    /// error aborts it.
    pub fn confirm(&mut self) -> Result<ApplyOutcome, PipelineError> {
        if self.state != PipelineState::AwaitingParameters {
            return Err(PipelineError::Finished);
        }
        let input = match self.input() {
            Ok(input) => input,
            Err(e) => {
                warn!("Filter '{}' dialog error: {}", self.filter, e);
                self.abort();
                return Err(e);
            }
        };
        let guard = self.session.try_begin_apply().ok_or(PipelineError::Busy)?;

        self.release_dialog();
        self.state = PipelineState::Applying;
        debug!("Filter '{}': AwaitingParameters -> Applying", self.filter);

        let result = apply_exclusive(self.session, guard, self.filter, self.apply, &input);
        self.state = if result.is_ok() { PipelineState::Committed } else { PipelineState::Aborted };
        result
    }

    /// Close the dialog without applying anything. No-op once finished.
    pub fn cancel(&mut self) {
        if self.state == PipelineState::AwaitingParameters {
            debug!("Filter '{}': cancelled", self.filter);
            self.abort();
        }
    }

    /// Abort because the dialog failed.
    pub fn fail(&mut self, message: impl Into<String>) -> PipelineError {
        let err = PipelineError::Dialog(DialogError::Reported(message.into()));
        if self.state == PipelineState::AwaitingParameters {
            warn!("Filter '{}' dialog error: {}", self.filter, err);
            self.abort();
        }
        err
    }

    fn abort(&mut self) {
        self.release_dialog();
        self.state = PipelineState::Aborted;
    }

    fn release_dialog(&mut self) {
        if let Some(mut dialog) = self.dialog.take() {
            dialog.destroy();
        }
    }
}

impl Drop for PendingInvocation<'_> {
    fn drop(&mut self) {
        self.release_dialog();
    }
}

/// Run `apply` under the write lock. Success commits the recorded entries; failure
/// or panic puts the whole stack back and commits nothing.
fn apply_exclusive(
    session: &EditingSession,
    _guard: ApplyGuard<'_>,
    filter: FilterId,
    apply: ApplyFn,
    input: &FilterInput,
) -> Result<ApplyOutcome, PipelineError> {
    let mut stack = session.write_stack();
    let layer_index = stack.focus().ok_or(PipelineError::NoTarget)?;
    let backup = stack.clone();
    let mut pending = PendingHistory::new();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut params = ApplyParams { layer_index, stack: &mut *stack, input, history: &mut pending };
        apply(&mut params)
    }));

    let message = match result {
        Ok(Ok(())) => {
            drop(stack);
            let history_entries = session.history().commit_pending(pending);
            session.mark_dirty();
            info!("Filter '{}' applied to layer {} ({} history entries)", filter, layer_index, history_entries);
            return Ok(ApplyOutcome { filter, layer_index, history_entries });
        }
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    *stack = backup;
    warn!("Filter '{}' failed, layers restored: {}", filter, message);
    Err(PipelineError::ApplyFailed { filter, message })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
