//! Undo/redo history over whole-list snapshots.
//!
//! The log holds full states rather than diffs and knows nothing about what
//! a state contains. Pushing after an undo discards the redo branch.

/// Maximum number of states kept, including the current one.
pub const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone)]
pub struct EditHistory<T> {
    states: Vec<T>,
    cursor: usize,
    capacity: usize,
}

impl<T: Clone> EditHistory<T> {
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, MAX_HISTORY)
    }

    pub fn with_capacity(initial: T, capacity: usize) -> Self {
        Self {
            states: vec![initial],
            cursor: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn current(&self) -> &T {
        &self.states[self.cursor]
    }

    /// Record a new state, dropping any redo branch and the oldest state
    /// once the cap is exceeded.
    pub fn push(&mut self, next: T) {
        self.states.truncate(self.cursor + 1);
        self.states.push(next);
        self.cursor = self.states.len() - 1;

        if self.states.len() > self.capacity {
            self.states.remove(0);
            self.cursor -= 1;
        }
    }

    /// Step back one state. `None` (and no change) at the oldest state.
    pub fn undo(&mut self) -> Option<&T> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        Some(self.current())
    }

    /// Step forward one state. `None` (and no change) at the newest state.
    pub fn redo(&mut self) -> Option<&T> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        Some(self.current())
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.states.len()
    }

    /// Forget everything and start over from `state`.
    pub fn reset(&mut self, state: T) {
        self.states.clear();
        self.states.push(state);
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
