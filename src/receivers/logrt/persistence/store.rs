// SPDX-License-Identifier: Apache-2.0

use crate::receivers::logrt::error::Result;
use crate::receivers::logrt::state::WatchState;

/// Storage for watch state between agent runs.
pub trait StateStore {
    /// Load the state of a watch. `Ok(None)` means the watch has never been persisted.
    fn load_watch(&mut self) -> Result<Option<WatchState>>;

    /// Persist the state of a watch.
    fn save_watch(&mut self, state: &WatchState) -> Result<()>;
}

/// In-memory store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    current: Option<WatchState>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `save_watch` was called.
    pub fn saves(&self) -> usize {
        self.saves
    }

    pub fn current(&self) -> Option<&WatchState> {
        self.current.as_ref()
    }
}

impl StateStore for MemoryStore {
    fn load_watch(&mut self) -> Result<Option<WatchState>> {
        Ok(self.current.clone())
    }

    fn save_watch(&mut self, state: &WatchState) -> Result<()> {
        self.current = Some(state.clone());
        self.saves += 1;
        Ok(())
    }
}
