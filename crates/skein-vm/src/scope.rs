//! The save stack: a log of scope-scoped undo actions giving dynamic-scope
//! (acquire-with-guaranteed-release) semantics across both normal and
//! exceptional exits.

use std::any::Any;
use std::fmt;

use skein_code::Slot;

use crate::{Value, ValueCell, Vm};

/// A save-stack height recorded at scope entry; bounds the reverse drain of
/// [`Vm::close_scope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(pub(crate) usize);

/// A cleanup closure run during scope exit. Returning `Err` raises, feeding
/// the re-entrant unwind path.
pub type Cleanup = Box<dyn FnOnce(&mut Vm) -> Result<(), String>>;

/// A single undo action. Actions are applied in exact reverse order of
/// registration, unconditionally.
pub enum SaveAction {
    /// Restore a slot's cell to a previously captured value.
    RestoreScalar { slot: Slot, value: Value },
    /// Restore which cell a slot binds to.
    RestoreBinding { slot: Slot, cell: ValueCell },
    /// Run an arbitrary cleanup.
    RunCleanup(Cleanup),
    /// Drop an owned host resource.
    ReleaseOwned(OwnedHandle),
}

impl fmt::Debug for SaveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveAction::RestoreScalar { slot, value } => f
                .debug_struct("RestoreScalar")
                .field("slot", slot)
                .field("value", value)
                .finish(),
            SaveAction::RestoreBinding { slot, .. } => f
                .debug_struct("RestoreBinding")
                .field("slot", slot)
                .finish_non_exhaustive(),
            SaveAction::RunCleanup(_) => f.write_str("RunCleanup(..)"),
            SaveAction::ReleaseOwned(h) => f.debug_tuple("ReleaseOwned").field(h).finish(),
        }
    }
}

#[derive(Default)]
pub(crate) struct SaveStack {
    entries: Vec<SaveAction>,
}

impl SaveStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn height(&self) -> Watermark {
        Watermark(self.entries.len())
    }

    pub(crate) fn push(&mut self, action: SaveAction) {
        self.entries.push(action);
    }

    pub(crate) fn pop_above(&mut self, w: Watermark) -> Option<SaveAction> {
        if self.entries.len() > w.0 {
            self.entries.pop()
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A generation-checked handle to a resource registered with [`Vm::own`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnedHandle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Default)]
pub(crate) struct OwnedSlab {
    entries: Vec<(u32, Option<Box<dyn Any>>)>,
    free: Vec<u32>,
}

impl OwnedSlab {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, resource: Box<dyn Any>) -> OwnedHandle {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.1 = Some(resource);
            OwnedHandle {
                index,
                generation: entry.0,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push((0, Some(resource)));
            OwnedHandle {
                index,
                generation: 0,
            }
        }
    }

    pub(crate) fn remove(&mut self, handle: OwnedHandle) -> Option<Box<dyn Any>> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.0 != handle.generation {
            return None;
        }
        let resource = entry.1.take()?;
        entry.0 = entry.0.wrapping_add(1);
        self.free.push(handle.index);
        Some(resource)
    }
}

impl Vm {
    /// Records the current save-stack height. Pass the watermark back to
    /// [`Vm::close_scope`] to undo everything saved since.
    pub fn open_scope(&mut self) -> Watermark {
        self.saves.height()
    }

    /// Appends an undo action to the open scope.
    pub fn save(&mut self, action: SaveAction) {
        self.saves.push(action);
    }

    /// Pops and applies save entries down to `w`, in exact reverse order of
    /// registration.
    ///
    /// A failing cleanup stops the drain and returns its message; the
    /// remaining entries stay on the stack and are applied by whichever
    /// outer scope closes next, so the watermark invariant of an unwind
    /// already in progress survives a raise from inside a cleanup.
    pub fn close_scope(&mut self, w: Watermark) -> Result<(), String> {
        while let Some(action) = self.saves.pop_above(w) {
            match action {
                SaveAction::RestoreScalar { slot, value } => {
                    *self.slots[slot.0 as usize].borrow_mut() = value;
                }
                SaveAction::RestoreBinding { slot, cell } => {
                    self.slots[slot.0 as usize] = cell;
                }
                SaveAction::RunCleanup(cleanup) => cleanup(self)?,
                SaveAction::ReleaseOwned(handle) => {
                    self.owned.remove(handle);
                }
            }
        }
        Ok(())
    }
}
