// SPDX-License-Identifier: Apache-2.0

//! Rotation-aware log file tailing.
//!
//! A watch names either a single file or a directory plus a file name expression. Each cycle
//! reads the records appended since the previous one and hands them to a [`RecordSink`],
//! following the files through rename and copy-truncate rotation.
//!
//! Features:
//! - Device/inode tracking with a content digest fallback
//! - Separate read and acknowledged offsets, so refused records are offered again
//! - Per-cycle record and time budgets
//! - Position persistence for resume after restarts

pub mod config;
pub mod cycle;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod input;
pub mod persistence;
pub mod rotation;
pub mod state;

pub use config::{Destination, RotationPolicy, WatchConfig, WatchKind};
pub use cycle::{CycleReport, LogWatcher};
pub use delivery::{CycleBudget, Delivery, DeliveryTracker, RecordSink};
pub use error::{DeliveryError, Error, Result};
pub use filter::{OutputTemplate, RecordFilter};
pub use input::{Candidate, Encoding, FileId, FileMatcher, PrefixDigest, RecordReader, Scan};
pub use persistence::{MemoryStore, StateFile, StateStore, WatchSlot};
pub use rotation::{Resolution, RotationResolver, Transition};
pub use state::{LogFile, WatchState};
