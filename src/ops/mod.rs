// ============================================================================
// OPS MODULE - everything that mutates pixels
// ============================================================================
//
//   adjustments.rs - per-pixel color adjustments (invert, grayscale, ...)
//   shapes.rs      - SDF shape rasterizer and the shared paint deposit
//   gradient.rs    - one-color gradient renderer
//   filters.rs     - filter descriptors, typed inputs, built-in registry
//   dialogs.rs     - parameter dialog contract + headless dialog
//   pipeline.rs    - invoke / confirm / commit-or-rollback state machine
// ============================================================================

pub mod adjustments;
pub mod dialogs;
pub mod filters;
pub mod gradient;
pub mod pipeline;
pub mod shapes;

pub use filters::{FilterDescriptor, FilterId, FilterInput, builtin, builtin_filters};
pub use pipeline::{Invocation, PendingInvocation, PipelineError, PipelineState};
