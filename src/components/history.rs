use std::time::{SystemTime, UNIX_EPOCH};

use crate::canvas::{BlendMode, CanvasError, Layer, LayerStack};

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// Trait for undoable/redoable commands.
///
/// A command owns both its forward and backward data, so it stays valid no
/// matter what happened to the live stack in between.
pub trait Command: Send + Sync {
    fn undo(&self, stack: &mut LayerStack) -> Result<(), CanvasError>;
    fn redo(&self, stack: &mut LayerStack) -> Result<(), CanvasError>;
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
}

/// One committed mutation on the timeline.
pub struct HistoryEntry {
    description: String,
    timestamp_ms: u64,
    /// Cost measured once at creation; the running total adds and removes exactly this.
    memory_size: usize,
    command: Box<dyn Command>,
}

impl HistoryEntry {
    pub fn new(command: Box<dyn Command>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self { description: command.description(), timestamp_ms, memory_size: command.memory_size(), command }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Milliseconds since the Unix epoch at creation.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }
}

impl std::fmt::Debug for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEntry")
            .field("description", &self.description)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

// ============================================================================
// PENDING HISTORY - entries recorded during an apply, committed on success
// ============================================================================

/// Entries a filter records while it runs. The pipeline moves them into the
/// [`HistoryLog`] only when the apply succeeds.
#[derive(Default, Debug)]
pub struct PendingHistory {
    entries: Vec<HistoryEntry>,
}

impl PendingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, command: impl Command + 'static) {
        self.entries.push(HistoryEntry::new(Box::new(command)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.description.clone()).collect()
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }
}

// ============================================================================
// LAYER OPERATION COMMAND - For layer add/delete/reorder/property changes
// ============================================================================

/// Types of layer operations that can be undone/redone
#[derive(Clone, Debug)]
pub enum LayerOperation {
    /// A layer was added at the given index (stores the layer for redo)
    Add { index: usize, layer: Layer },
    /// A layer was deleted (stores the full layer data for restore)
    Delete { index: usize, layer: Layer },
    /// Layer was moved from one index to another
    Move { from_index: usize, to_index: usize },
    Opacity { index: usize, old_opacity: f32, new_opacity: f32 },
    BlendMode { index: usize, old_mode: BlendMode, new_mode: BlendMode },
    Rename { index: usize, old_name: String, new_name: String },
    /// Layer was duplicated directly above its source
    Duplicate { source_index: usize, new_index: usize },
}

/// Command for layer structure operations
pub struct LayerOpCommand {
    operation: LayerOperation,
    focus_before: Option<usize>,
    focus_after: Option<usize>,
}

impl LayerOpCommand {
    pub fn new(operation: LayerOperation, focus_before: Option<usize>, focus_after: Option<usize>) -> Self {
        Self { operation, focus_before, focus_after }
    }

    pub fn operation(&self) -> &LayerOperation {
        &self.operation
    }

    fn restore_focus(stack: &mut LayerStack, focus: Option<usize>) -> Result<(), CanvasError> {
        match focus {
            Some(index) if index < stack.len() => stack.set_focus(index),
            _ => Ok(()),
        }
    }
}

impl Command for LayerOpCommand {
    fn undo(&self, stack: &mut LayerStack) -> Result<(), CanvasError> {
        match &self.operation {
            LayerOperation::Add { index, .. } => {
                stack.remove_layer(*index)?;
            }
            LayerOperation::Delete { index, layer } => {
                stack.insert(*index, layer.clone())?;
            }
            LayerOperation::Move { from_index, to_index } => {
                stack.move_layer(*to_index, *from_index)?;
            }
            LayerOperation::Opacity { index, old_opacity, .. } => {
                stack.set_opacity(*index, *old_opacity)?;
            }
            LayerOperation::BlendMode { index, old_mode, .. } => {
                stack.set_blend_mode(*index, *old_mode)?;
            }
            LayerOperation::Rename { index, old_name, .. } => {
                stack.rename_layer(*index, old_name.clone())?;
            }
            LayerOperation::Duplicate { new_index, .. } => {
                stack.remove_layer(*new_index)?;
            }
        }
        Self::restore_focus(stack, self.focus_before)
    }

    fn redo(&self, stack: &mut LayerStack) -> Result<(), CanvasError> {
        match &self.operation {
            LayerOperation::Add { index, layer } => {
                stack.insert(*index, layer.clone())?;
            }
            LayerOperation::Delete { index, .. } => {
                stack.remove_layer(*index)?;
            }
            LayerOperation::Move { from_index, to_index } => {
                stack.move_layer(*from_index, *to_index)?;
            }
            LayerOperation::Opacity { index, new_opacity, .. } => {
                stack.set_opacity(*index, *new_opacity)?;
            }
            LayerOperation::BlendMode { index, new_mode, .. } => {
                stack.set_blend_mode(*index, *new_mode)?;
            }
            LayerOperation::Rename { index, new_name, .. } => {
                stack.rename_layer(*index, new_name.clone())?;
            }
            LayerOperation::Duplicate { source_index, .. } => {
                stack.duplicate_layer(*source_index)?;
            }
        }
        Self::restore_focus(stack, self.focus_after)
    }

    fn description(&self) -> String {
        match &self.operation {
            LayerOperation::Add { .. } => "Add Layer".to_string(),
            LayerOperation::Delete { .. } => "Delete Layer".to_string(),
            LayerOperation::Move { .. } => "Move Layer".to_string(),
            LayerOperation::Opacity { .. } => "Layer Opacity".to_string(),
            LayerOperation::BlendMode { .. } => "Layer Blend Mode".to_string(),
            LayerOperation::Rename { .. } => "Rename Layer".to_string(),
            LayerOperation::Duplicate { .. } => "Duplicate Layer".to_string(),
        }
    }

    fn memory_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        match &self.operation {
            LayerOperation::Add { layer, .. } | LayerOperation::Delete { layer, .. } => {
                base + layer.pixels().memory_bytes_total() + layer.name.len()
            }
            LayerOperation::Rename { old_name, new_name, .. } => base + old_name.len() + new_name.len(),
            _ => base,
        }
    }
}

// ============================================================================
// HISTORY LOG - pointer-addressed undo/redo timeline with limits
// ============================================================================

const DEFAULT_MAX_ENTRIES: usize = 50;
const DEFAULT_MAX_MEMORY_BYTES: usize = 100 * 1024 * 1024;

/// Committed entries plus a position pointer. Entries below the pointer are
/// undoable, entries at or above it are redoable.
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
    position: usize,
    max_entries: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across all entries.
    total_memory: usize,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl std::fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLog")
            .field("entries", &self.entries.len())
            .field("position", &self.position)
            .field("total_memory", &self.total_memory)
            .finish()
    }
}

impl HistoryLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            position: 0,
            max_entries: max_entries.max(1),
            max_memory_bytes: Some(DEFAULT_MAX_MEMORY_BYTES),
            total_memory: 0,
        }
    }

    pub fn with_memory_limit(mut self, max_memory_bytes: Option<usize>) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    /// Append `entry` at the pointer. Redoable entries are discarded first.
    pub fn commit(&mut self, entry: HistoryEntry) {
        for pruned in self.entries.drain(self.position..) {
            self.total_memory = self.total_memory.saturating_sub(pruned.memory_size());
        }
        log::debug!("history: commit '{}'", entry.description);
        self.total_memory += entry.memory_size();
        self.entries.push(entry);
        self.position = self.entries.len();
        self.prune();
    }

    /// Commit every entry recorded during one apply, in order.
    pub fn commit_pending(&mut self, pending: PendingHistory) -> usize {
        let entries = pending.into_entries();
        let count = entries.len();
        for entry in entries {
            self.commit(entry);
        }
        count
    }

    /// Apply the entry below the pointer backwards. Returns its description,
    /// or `None` when there is nothing to undo.
    pub fn undo(&mut self, stack: &mut LayerStack) -> Result<Option<String>, CanvasError> {
        if !self.can_undo() {
            return Ok(None);
        }
        let entry = &self.entries[self.position - 1];
        entry.command.undo(stack)?;
        let description = entry.description.clone();
        self.position -= 1;
        log::info!("history: undo '{description}'");
        Ok(Some(description))
    }

    /// Re-apply the entry at the pointer. Returns its description,
    /// or `None` when there is nothing to redo.
    pub fn redo(&mut self, stack: &mut LayerStack) -> Result<Option<String>, CanvasError> {
        if !self.can_redo() {
            return Ok(None);
        }
        let entry = &self.entries[self.position];
        entry.command.redo(stack)?;
        let description = entry.description.clone();
        self.position += 1;
        log::info!("history: redo '{description}'");
        Ok(Some(description))
    }

    pub fn can_undo(&self) -> bool {
        self.position > 0
    }

    pub fn can_redo(&self) -> bool {
        self.position < self.entries.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.position.checked_sub(1).map(|i| self.entries[i].description())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.entries.get(self.position).map(|e| e.description())
    }

    /// Get all undo descriptions (most recent first)
    pub fn undo_history(&self) -> Vec<String> {
        self.entries[..self.position]
            .iter()
            .rev()
            .map(|e| e.description.clone())
            .collect()
    }

    /// Current memory usage of the history (O(1) via cached total)
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    /// Undo `steps` entries (0 = nothing). Stops early when the log runs out.
    pub fn undo_to(&mut self, steps: usize, stack: &mut LayerStack) -> Result<usize, CanvasError> {
        let mut done = 0;
        while done < steps && self.undo(stack)?.is_some() {
            done += 1;
        }
        Ok(done)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.position = 0;
        self.total_memory = 0;
    }

    /// Drop the oldest entries to stay within the count and memory limits.
    fn prune(&mut self) {
        let mut dropped = 0;
        while self.entries.len() > self.max_entries {
            self.drop_oldest();
            dropped += 1;
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.entries.len() > 1 {
                self.drop_oldest();
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!("history: dropped {dropped} oldest entr{}", if dropped == 1 { "y" } else { "ies" });
        }
    }

    fn drop_oldest(&mut self) {
        let removed = self.entries.remove(0);
        self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
        self.position = self.position.saturating_sub(1);
    }
}

// ============================================================================
// STACK SNAPSHOT COMMAND - whole-stack undo for multi-layer operations
// ============================================================================

/// Stores the complete stack before and after an operation. Buffers are
/// copy-on-write, so unchanged chunks are shared with the live stack.
pub struct StackSnapshotCommand {
    description: String,
    before: LayerStack,
    after: Option<LayerStack>,
}

impl StackSnapshotCommand {
    /// Create before performing the operation. Call `set_after()` when done.
    pub fn new(description: impl Into<String>, stack: &LayerStack) -> Self {
        Self { description: description.into(), before: stack.clone(), after: None }
    }

    /// Capture the "after" state. Call this AFTER the operation completes.
    pub fn set_after(&mut self, stack: &LayerStack) {
        self.after = Some(stack.clone());
    }

    /// Layers are paired by position; a layer without a counterpart counts in full.
    fn delta_bytes(before: &LayerStack, after: &LayerStack) -> usize {
        let paired: usize = before
            .layers()
            .iter()
            .zip(after.layers())
            .map(|(b, a)| b.pixels().delta_bytes(a.pixels()) + b.name.len() + a.name.len())
            .sum();
        let (longer, shorter) = if before.len() >= after.len() { (before, after) } else { (after, before) };
        let unpaired: usize =
            longer.layers()[shorter.len()..].iter().map(|l| l.pixels().memory_bytes_total() + l.name.len()).sum();
        paired + unpaired
    }
}

impl Command for StackSnapshotCommand {
    fn undo(&self, stack: &mut LayerStack) -> Result<(), CanvasError> {
        *stack = self.before.clone();
        Ok(())
    }

    fn redo(&self, stack: &mut LayerStack) -> Result<(), CanvasError> {
        if let Some(after) = &self.after {
            *stack = after.clone();
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        match &self.after {
            Some(after) => Self::delta_bytes(&self.before, after),
            None => Self::delta_bytes(&self.before, &self.before),
        }
    }
}

// ============================================================================
// SINGLE-LAYER SNAPSHOT - efficient undo for single-layer operations
// ============================================================================

/// Captures one layer's pixels and metadata before/after an operation.
pub struct SingleLayerSnapshotCommand {
    description: String,
    layer_index: usize,
    before: Layer,
    after: Option<Layer>,
}

impl SingleLayerSnapshotCommand {
    /// Create before performing the operation. Call `set_after()` when done.
    pub fn new_for_layer(
        description: impl Into<String>,
        stack: &LayerStack,
        layer_index: usize,
    ) -> Result<Self, CanvasError> {
        Ok(Self {
            description: description.into(),
            layer_index,
            before: stack.layer(layer_index)?.clone(),
            after: None,
        })
    }

    /// Capture the layer's state after the operation.
    pub fn set_after(&mut self, stack: &LayerStack) -> Result<(), CanvasError> {
        self.after = Some(stack.layer(self.layer_index)?.clone());
        Ok(())
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }
}

impl Command for SingleLayerSnapshotCommand {
    fn undo(&self, stack: &mut LayerStack) -> Result<(), CanvasError> {
        stack.replace_layer(self.layer_index, self.before.clone())?;
        Ok(())
    }

    fn redo(&self, stack: &mut LayerStack) -> Result<(), CanvasError> {
        if let Some(after) = &self.after {
            stack.replace_layer(self.layer_index, after.clone())?;
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        let before = self.before.pixels();
        let after = self.after.as_ref().map_or(before, |l| l.pixels());
        std::mem::size_of::<Self>() + before.delta_bytes(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::CHUNK_SIZE;
    use image::Rgba;

    const CHUNK_BYTES: usize = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;

    fn stack() -> LayerStack {
        LayerStack::with_background(16, 16, Rgba([255, 255, 255, 255])).unwrap()
    }

    /// Paint one pixel on layer 0 and commit it as a single-layer snapshot.
    fn paint(stack: &mut LayerStack, log: &mut HistoryLog, x: u32, value: u8) {
        let mut cmd = SingleLayerSnapshotCommand::new_for_layer(format!("Paint {x}"), stack, 0).unwrap();
        stack.layer_mut(0).unwrap().put_pixel(x, 0, Rgba([value, 0, 0, 255])).unwrap();
        cmd.set_after(stack).unwrap();
        log.commit(HistoryEntry::new(Box::new(cmd)));
    }

    #[test]
    fn undo_n_then_redo_n_round_trips() {
        let mut stack = stack();
        let mut log = HistoryLog::default();
        let initial = stack.layer(0).unwrap().pixels().clone();
        for i in 0..5 {
            paint(&mut stack, &mut log, i, 10 * i as u8 + 1);
        }
        let fin = stack.layer(0).unwrap().pixels().clone();

        assert_eq!(log.undo_to(5, &mut stack).unwrap(), 5);
        assert_eq!(stack.layer(0).unwrap().pixels(), &initial);
        assert!(!log.can_undo());

        for _ in 0..5 {
            assert!(log.redo(&mut stack).unwrap().is_some());
        }
        assert_eq!(stack.layer(0).unwrap().pixels(), &fin);
        assert!(!log.can_redo());
    }

    #[test]
    fn new_commit_prunes_redo_branch() {
        let mut stack = stack();
        let mut log = HistoryLog::default();
        paint(&mut stack, &mut log, 0, 1);
        paint(&mut stack, &mut log, 1, 2);
        log.undo(&mut stack).unwrap();
        assert!(log.can_redo());

        paint(&mut stack, &mut log, 2, 3);
        assert!(!log.can_redo());
        assert_eq!(log.redo(&mut stack).unwrap(), None);
        assert_eq!(log.len(), 2);
        assert_eq!(log.undo_history(), ["Paint 2", "Paint 0"]);
    }

    #[test]
    fn count_limit_drops_oldest_and_keeps_pointer_in_range() {
        let mut stack = stack();
        let mut log = HistoryLog::new(3);
        for i in 0..5 {
            paint(&mut stack, &mut log, i, 5);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.position(), 3);
        assert_eq!(log.undo_description(), Some("Paint 4"));
        assert_eq!(log.undo_to(10, &mut stack).unwrap(), 3);
    }

    #[test]
    fn memory_limit_keeps_at_least_one_entry() {
        let mut stack = stack();
        let mut log = HistoryLog::new(50).with_memory_limit(Some(1));
        paint(&mut stack, &mut log, 0, 1);
        paint(&mut stack, &mut log, 1, 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.undo_description(), Some("Paint 1"));
    }

    #[test]
    fn memory_total_matches_entry_costs_as_sharing_changes() {
        let mut stack = stack();
        let mut log = HistoryLog::new(2).with_memory_limit(None);
        paint(&mut stack, &mut log, 0, 1);
        let first = log.memory_usage();
        assert!(first >= CHUNK_BYTES * 2);

        // A later snapshot shares chunks with the first entry; its cost must not
        // change what the first entry gives back when it is dropped.
        paint(&mut stack, &mut log, 1, 2);
        paint(&mut stack, &mut log, 2, 3);
        paint(&mut stack, &mut log, 3, 4);
        assert_eq!(log.len(), 2);
        let expected: usize = log.entries().iter().map(HistoryEntry::memory_size).sum();
        assert_eq!(log.memory_usage(), expected);
        assert_eq!(log.entries()[0].memory_size(), first);

        log.undo(&mut stack).unwrap();
        paint(&mut stack, &mut log, 4, 5);
        let expected: usize = log.entries().iter().map(HistoryEntry::memory_size).sum();
        assert_eq!(log.memory_usage(), expected);
    }

    #[test]
    fn layer_ops_restore_structure_and_focus() {
        let mut stack = stack();
        let mut log = HistoryLog::default();

        let before = stack.focus();
        let index = stack.insert_layer(1, "Layer 2").unwrap();
        let layer = stack.layer(index).unwrap().clone();
        log.commit(HistoryEntry::new(Box::new(LayerOpCommand::new(
            LayerOperation::Add { index, layer },
            before,
            stack.focus(),
        ))));

        log.undo(&mut stack).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.focus(), Some(0));

        log.redo(&mut stack).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.focused_layer().unwrap().name, "Layer 2");
    }

    #[test]
    fn stack_snapshot_restores_every_layer() {
        let mut stack = stack();
        stack.insert_layer(1, "top").unwrap();
        let mut cmd = StackSnapshotCommand::new("Flip", &stack);
        let original = stack.clone();
        for layer in 0..2 {
            stack.layer_mut(layer).unwrap().put_pixel(0, 0, Rgba([1, 2, 3, 255])).unwrap();
        }
        cmd.set_after(&stack);
        let after = stack.clone();

        cmd.undo(&mut stack).unwrap();
        for i in 0..2 {
            assert_eq!(stack.layer(i).unwrap().pixels(), original.layer(i).unwrap().pixels());
        }
        cmd.redo(&mut stack).unwrap();
        assert_eq!(stack.layer(1).unwrap().pixels(), after.layer(1).unwrap().pixels());
    }

    #[test]
    fn pending_entries_commit_in_order() {
        let stack = stack();
        let mut pending = PendingHistory::new();
        pending.record(StackSnapshotCommand::new("A", &stack));
        pending.record(StackSnapshotCommand::new("B", &stack));
        let mut log = HistoryLog::default();
        assert_eq!(log.commit_pending(pending), 2);
        assert_eq!(log.undo_history(), ["B", "A"]);
    }
}
