//! Layered raster editing core: layer stacks, blend-mode compositing, undo history
//! and a transactional filter pipeline.

pub mod canvas;
pub mod cli;
pub mod color;
pub mod components;
pub mod compositor;
pub mod io;
pub mod logger;
pub mod ops;
pub mod project;
pub mod session;
pub mod settings;

pub use canvas::{BlendMode, CanvasError, Layer, LayerStack, RasterBuffer};
pub use session::EditingSession;
