// SPDX-License-Identifier: Apache-2.0

//! Persistence of watch state across agent restarts.

pub mod schema;
pub mod state_file;
pub mod store;

pub use schema::{PERSISTED_STATE_VERSION, PersistedWatchStateV1, base64_bytes};
pub use state_file::{StateFile, WatchSlot};
pub use store::{MemoryStore, StateStore};
