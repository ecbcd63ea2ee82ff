use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbaImage;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::canvas::{BlendMode, CanvasError, LayerStack, RasterBuffer};
use crate::color::Rgb;
use crate::components::history::{HistoryEntry, HistoryLog, LayerOpCommand, LayerOperation};
use crate::io::{StorageError, StorageProject};
use crate::ops::dialogs::DialogRequest;
use crate::ops::filters::{FilterDescriptor, FilterId};
use crate::ops::pipeline::{self, Invocation, PipelineError};
use crate::project::Project;
use crate::settings::EngineSettings;

/// Held while one operation mutates the stack. Dropping it lets the next one in.
pub struct ApplyGuard<'s> {
    flag: &'s AtomicBool,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Single open document: its layers, undo timeline and paint colors.
///
/// Reads (rendering, inspection) may run concurrently. Everything that mutates the
/// stack first takes the exclusive apply guard and is rejected with `Busy` when it
/// is already held.
pub struct EditingSession {
    id: Uuid,
    /// Display name (derived from path or "Untitled-X")
    name: String,
    path: Option<PathBuf>,
    stack: RwLock<LayerStack>,
    /// Fixed for the session's lifetime; cached so it never waits on the lock.
    dimensions: (u32, u32),
    history: Mutex<HistoryLog>,
    applying: AtomicBool,
    colors: Mutex<(Rgb, Rgb)>,
    dirty: AtomicBool,
    max_canvas_dim: u32,
    thumbnail_max_edge: u32,
}

impl EditingSession {
    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32, settings: &EngineSettings) -> Result<Self, CanvasError> {
        let stack = LayerStack::with_background(width, height, settings.secondary_color.to_pixel())?;
        Ok(Self::from_stack(format!("Untitled-{}", untitled_counter), stack, settings))
    }

    pub fn from_stack(name: impl Into<String>, stack: LayerStack, settings: &EngineSettings) -> Self {
        Self::with_id(Uuid::new_v4(), name.into(), stack, settings)
    }

    pub fn from_project(name: impl Into<String>, project: &Project, settings: &EngineSettings) -> Result<Self, CanvasError> {
        Ok(Self::from_stack(name, project.into_layer_stack()?, settings))
    }

    /// Reopen a stored project under its stored id.
    pub fn from_storage(name: impl Into<String>, stored: &StorageProject, settings: &EngineSettings) -> Result<Self, StorageError> {
        Ok(Self::with_id(stored.id, name.into(), stored.to_layer_stack()?, settings))
    }

    /// Open an image or stored project from disk.
    pub fn open(path: &Path, settings: &EngineSettings) -> Result<Self, StorageError> {
        let stack = crate::io::load_layer_stack(path)?;
        let name = path.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "Unknown".to_string());
        let mut session = Self::from_stack(name, stack, settings);
        session.path = Some(path.to_path_buf());
        Ok(session)
    }

    fn with_id(id: Uuid, name: String, stack: LayerStack, settings: &EngineSettings) -> Self {
        info!("Session {} '{}' opened ({}x{}, {} layers)", id, name, stack.width(), stack.height(), stack.len());
        let history = HistoryLog::new(settings.max_undo_steps).with_memory_limit(settings.history_memory_limit());
        Self {
            id,
            name,
            path: None,
            dimensions: stack.dimensions(),
            stack: RwLock::new(stack),
            history: Mutex::new(history),
            applying: AtomicBool::new(false),
            colors: Mutex::new((settings.primary_color, settings.secondary_color)),
            dirty: AtomicBool::new(false),
            max_canvas_dim: settings.max_canvas_dim,
            thumbnail_max_edge: settings.thumbnail_max_edge,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty() {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    // ---- reading -----------------------------------------------------------

    /// Shared read access to the layers. Blocks while an apply holds the write lock.
    pub fn read(&self) -> RwLockReadGuard<'_, LayerStack> {
        self.stack.read()
    }

    pub(crate) fn write_stack(&self) -> RwLockWriteGuard<'_, LayerStack> {
        self.stack.write()
    }

    pub(crate) fn history(&self) -> MutexGuard<'_, HistoryLog> {
        self.history.lock()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    pub fn composite(&self) -> RasterBuffer {
        self.stack.read().composite()
    }

    pub fn composite_image(&self) -> RgbaImage {
        self.stack.read().composite_image()
    }

    // ---- colors ------------------------------------------------------------

    pub fn primary_color(&self) -> Rgb {
        self.colors.lock().0
    }

    pub fn secondary_color(&self) -> Rgb {
        self.colors.lock().1
    }

    pub fn set_primary_color(&self, color: Rgb) {
        self.colors.lock().0 = color;
    }

    pub fn set_secondary_color(&self, color: Rgb) {
        self.colors.lock().1 = color;
    }

    pub fn swap_colors(&self) {
        let mut colors = self.colors.lock();
        *colors = (colors.1, colors.0);
    }

    // ---- filters -----------------------------------------------------------

    /// Build what a dialog factory sees for `filter`. Never waits on the stack lock:
    /// while an apply holds it the request is refused with `Busy`.
    pub fn dialog_request(&self, filter: FilterId) -> Result<DialogRequest, PipelineError> {
        let stack = self.stack.try_read().ok_or(PipelineError::Busy)?;
        let layer_preview = stack.focused_layer().ok().map(|layer| layer.pixels().clone());
        let (primary, secondary) = *self.colors.lock();
        Ok(DialogRequest {
            filter,
            canvas_width: stack.width(),
            canvas_height: stack.height(),
            max_width: self.max_canvas_dim,
            max_height: self.max_canvas_dim,
            primary,
            secondary,
            layer_index: stack.focus(),
            layer_preview,
        })
    }

    /// Start a filter on the focused layer.
    pub fn invoke(&self, descriptor: &FilterDescriptor) -> Result<Invocation<'_>, PipelineError> {
        pipeline::invoke(self, descriptor)
    }

    /// Take the exclusive guard, `None` when something else holds it.
    pub(crate) fn try_begin_apply(&self) -> Option<ApplyGuard<'_>> {
        self.applying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ApplyGuard { flag: &self.applying })
    }

    pub fn is_applying(&self) -> bool {
        self.applying.load(Ordering::Acquire)
    }

    // ---- history -----------------------------------------------------------

    pub fn undo(&self) -> Result<Option<String>, PipelineError> {
        let _guard = self.try_begin_apply().ok_or(PipelineError::Busy)?;
        let mut stack = self.stack.write();
        let undone = self.history.lock().undo(&mut stack)?;
        if undone.is_some() {
            self.mark_dirty();
        }
        Ok(undone)
    }

    pub fn redo(&self) -> Result<Option<String>, PipelineError> {
        let _guard = self.try_begin_apply().ok_or(PipelineError::Busy)?;
        let mut stack = self.stack.write();
        let redone = self.history.lock().redo(&mut stack)?;
        if redone.is_some() {
            self.mark_dirty();
        }
        Ok(redone)
    }

    /// Undo up to `steps` entries, returns how many were undone.
    pub fn undo_to(&self, steps: usize) -> Result<usize, PipelineError> {
        let _guard = self.try_begin_apply().ok_or(PipelineError::Busy)?;
        let mut stack = self.stack.write();
        let undone = self.history.lock().undo_to(steps, &mut stack)?;
        if undone > 0 {
            self.mark_dirty();
        }
        Ok(undone)
    }

    pub fn can_undo(&self) -> bool {
        self.history.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.lock().can_redo()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.history.lock().undo_description().map(str::to_string)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.history.lock().redo_description().map(str::to_string)
    }

    /// Undoable entries, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.history.lock().undo_history()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn history_memory_usage(&self) -> usize {
        self.history.lock().memory_usage()
    }

    // ---- layer structure ---------------------------------------------------

    /// Run a structure edit under the guard and commit its layer-operation entry.
    fn edit_structure<T>(
        &self,
        edit: impl FnOnce(&mut LayerStack) -> Result<(T, LayerOperation), CanvasError>,
    ) -> Result<T, PipelineError> {
        let _guard = self.try_begin_apply().ok_or(PipelineError::Busy)?;
        let mut stack = self.stack.write();
        let focus_before = stack.focus();
        let (value, operation) = edit(&mut *stack)?;
        let command = LayerOpCommand::new(operation, focus_before, stack.focus());
        drop(stack);
        let entry = HistoryEntry::new(Box::new(command));
        debug!("Layer edit: {}", entry.description());
        self.history.lock().commit(entry);
        self.mark_dirty();
        Ok(value)
    }

    /// Add an empty layer above the focused one (or at the bottom of an empty stack).
    pub fn add_layer(&self, name: impl Into<String>) -> Result<usize, PipelineError> {
        let name = name.into();
        self.edit_structure(|stack| {
            let index = stack.focus().map_or(0, |f| f + 1);
            stack.insert_layer(index, name)?;
            let layer = stack.layer(index)?.clone();
            Ok((index, LayerOperation::Add { index, layer }))
        })
    }

    pub fn remove_layer(&self, index: usize) -> Result<(), PipelineError> {
        self.edit_structure(|stack| {
            let layer = stack.remove_layer(index)?;
            Ok(((), LayerOperation::Delete { index, layer }))
        })
    }

    pub fn move_layer(&self, from_index: usize, to_index: usize) -> Result<(), PipelineError> {
        self.edit_structure(|stack| {
            stack.move_layer(from_index, to_index)?;
            Ok(((), LayerOperation::Move { from_index, to_index }))
        })
    }

    pub fn duplicate_layer(&self, index: usize) -> Result<usize, PipelineError> {
        self.edit_structure(|stack| {
            let new_index = stack.duplicate_layer(index)?;
            Ok((new_index, LayerOperation::Duplicate { source_index: index, new_index }))
        })
    }

    pub fn rename_layer(&self, index: usize, name: impl Into<String>) -> Result<(), PipelineError> {
        let new_name = name.into();
        self.edit_structure(|stack| {
            let old_name = stack.layer(index)?.name.clone();
            stack.rename_layer(index, new_name.clone())?;
            Ok(((), LayerOperation::Rename { index, old_name, new_name }))
        })
    }

    pub fn set_layer_opacity(&self, index: usize, opacity: f32) -> Result<(), PipelineError> {
        self.edit_structure(|stack| {
            let old_opacity = stack.opacity(index)?;
            stack.set_opacity(index, opacity)?;
            let new_opacity = stack.opacity(index)?;
            Ok(((), LayerOperation::Opacity { index, old_opacity, new_opacity }))
        })
    }

    pub fn set_layer_blend_mode(&self, index: usize, mode: BlendMode) -> Result<(), PipelineError> {
        self.edit_structure(|stack| {
            let old_mode = stack.blend_mode(index)?;
            stack.set_blend_mode(index, mode)?;
            Ok(((), LayerOperation::BlendMode { index, old_mode, new_mode: mode }))
        })
    }

    /// Change the focused layer. Not recorded in history.
    pub fn set_focus(&self, index: usize) -> Result<(), PipelineError> {
        let _guard = self.try_begin_apply().ok_or(PipelineError::Busy)?;
        self.stack.write().set_focus(index)?;
        Ok(())
    }

    pub fn focus(&self) -> Option<usize> {
        self.stack.read().focus()
    }

    // ---- storage -----------------------------------------------------------

    /// Snapshot for the blob store, with a thumbnail unless `with_thumbnail` is false.
    pub fn to_storage(&self, with_thumbnail: bool) -> Result<StorageProject, StorageError> {
        let edge = with_thumbnail.then_some(self.thumbnail_max_edge);
        StorageProject::capture(self.id, &self.stack.read(), edge)
    }

    pub fn to_project(&self) -> Project {
        Project::from_stack(&self.stack.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn session() -> EditingSession {
        EditingSession::new_untitled(1, 4, 4, &EngineSettings::default()).unwrap()
    }

    #[test]
    fn untitled_session_has_white_background() {
        let s = session();
        assert_eq!(s.name(), "Untitled-1");
        assert_eq!(s.read().layer(0).unwrap().pixels().get_pixel(0, 0).unwrap(), Rgba([255, 255, 255, 255]));
        assert_eq!(s.display_title(), "Untitled-1");
    }

    #[test]
    fn layer_edits_are_undoable_and_restore_focus() {
        let s = session();
        let top = s.add_layer("Ink").unwrap();
        assert_eq!(top, 1);
        s.set_layer_blend_mode(top, BlendMode::Screen).unwrap();
        s.set_layer_opacity(top, 2.0).unwrap();
        assert_eq!(s.read().opacity(top).unwrap(), 1.0);
        s.rename_layer(top, "Lines").unwrap();
        s.set_focus(0).unwrap();
        assert_eq!(s.history_len(), 4);
        assert!(s.is_dirty());
        assert_eq!(s.display_title(), "Untitled-1*");

        assert_eq!(s.undo_to(3).unwrap(), 3);
        assert_eq!(s.read().layer(1).unwrap().name, "Ink");
        assert_eq!(s.read().blend_mode(1).unwrap(), BlendMode::Normal);
        assert_eq!(s.undo().unwrap().as_deref(), Some("Add Layer"));
        assert_eq!(s.read().len(), 1);
        assert_eq!(s.focus(), Some(0));

        assert_eq!(s.redo().unwrap().as_deref(), Some("Add Layer"));
        assert_eq!(s.focus(), Some(1));
    }

    #[test]
    fn remove_and_duplicate_round_trip() {
        let s = session();
        s.duplicate_layer(0).unwrap();
        assert_eq!(s.read().layer(1).unwrap().name, "Background copy");
        s.remove_layer(0).unwrap();
        assert_eq!(s.read().len(), 1);
        s.undo().unwrap();
        assert_eq!(s.read().layer(0).unwrap().name, "Background");
        s.undo().unwrap();
        assert_eq!(s.read().len(), 1);
        assert!(s.remove_layer(5).is_err());
        assert_eq!(s.history_len(), 2);
    }

    #[test]
    fn colors_feed_dialog_requests() {
        let s = session();
        s.set_primary_color(Rgb::new(1, 2, 3));
        s.swap_colors();
        let req = s.dialog_request(FilterId::Gradient).unwrap();
        assert_eq!(req.primary, Rgb::WHITE);
        assert_eq!(req.secondary, Rgb::new(1, 2, 3));
        assert_eq!((req.canvas_width, req.max_width), (4, 32768));
        assert_eq!(req.layer_index, Some(0));
        assert_eq!(req.layer_preview.as_ref(), Some(s.read().layer(0).unwrap().pixels()));
    }

    #[test]
    fn storage_snapshot_keeps_id() {
        let s = session();
        let stored = s.to_storage(false).unwrap();
        assert!(stored.thumbnail.is_none());
        let reopened = EditingSession::from_storage("copy", &stored, &EngineSettings::default()).unwrap();
        assert_eq!(reopened.id(), s.id());
        assert_eq!(*reopened.read().layer(0).unwrap().pixels(), *s.read().layer(0).unwrap().pixels());
    }
}
