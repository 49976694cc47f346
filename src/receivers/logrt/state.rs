// SPDX-License-Identifier: Apache-2.0

//! Identity and position state of watched files.
//!
//! A [`WatchState`] is owned by the caller, handed to every cycle and serialized between
//! agent runs. It carries the identity list produced by the previous cycle, which together with
//! a fresh directory scan is all the next cycle needs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::receivers::logrt::input::{FileId, PrefixDigest};
use crate::receivers::logrt::persistence::base64_bytes;

/// One physical file known to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub path: PathBuf,
    /// Modification time in seconds since the Unix epoch
    pub mtime: i64,
    pub file_id: FileId,
    /// Size observed by the last scan
    pub size: u64,
    /// Offset up to which records have been consumed (delivered, filtered, or buffered as tail)
    pub processed_size: u64,
    pub digest: PrefixDigest,
    /// Processing order within a cycle
    pub seq: usize,
    /// Consecutive delivery failures
    #[serde(default)]
    pub retry: u32,
    /// The last read chunk ended without a terminator
    #[serde(default)]
    pub incomplete: bool,
    /// Bytes of the unterminated record, ending at `processed_size`
    #[serde(default, with = "base64_bytes")]
    pub tail: Vec<u8>,
    /// Skipping the remainder of an oversized record
    #[serde(default)]
    pub big_rec: bool,
    /// Index into the previous cycle's list of the file this one is a copy of
    #[serde(skip)]
    pub copy_of: Option<usize>,
}

impl LogFile {
    /// Bytes available beyond what has been consumed.
    pub fn unread(&self) -> u64 {
        self.size.saturating_sub(self.processed_size)
    }

    /// Offset where the buffered tail starts.
    pub fn tail_start(&self) -> u64 {
        self.processed_size - self.tail.len() as u64
    }

    /// Forget all read progress, as after an in-place truncation.
    pub fn reset_progress(&mut self) {
        self.processed_size = 0;
        self.incomplete = false;
        self.tail.clear();
        self.big_rec = false;
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Per-watch position state, persisted across agent restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchState {
    /// Processed offset in the most recently processed file
    pub last_size: u64,
    /// Modification time of the most recently processed file
    pub last_mtime: i64,
    /// End offset of the most recently delivered record
    pub last_size_sent: u64,
    /// Modification time of the file the most recent record was delivered from
    pub last_mtime_sent: i64,
    /// Start at the end of existing files; cleared after the first cycle
    pub skip_old_data: bool,
    /// Use device/inode identities for matching
    pub use_inode: bool,
    /// Identity list produced by the last cycle
    pub files: Vec<LogFile>,
    /// Bytes consumed over the lifetime of the watch
    pub processed_bytes: u64,
}

impl WatchState {
    /// State for a watch that has never run.
    pub fn new(skip_old_data: bool) -> Self {
        Self {
            skip_old_data,
            use_inode: crate::receivers::logrt::input::FileId::supported(),
            ..Default::default()
        }
    }

    /// Whether any tracked file still has work: bytes not consumed, or the buffered last
    /// record of a file that a newer one has replaced, which is flushed as is.
    pub fn has_pending(&self) -> bool {
        let newest = self.files.len().saturating_sub(1);
        self.files.iter().enumerate().any(|(idx, f)| {
            f.unread() > 0 || (idx < newest && !f.tail.is_empty() && !f.big_rec)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a LogFile for tests that never touch the disk.
    pub fn log_file(path: &str, ino: u64, size: u64, mtime: i64, head: &[u8]) -> LogFile {
        LogFile {
            path: PathBuf::from(path),
            mtime,
            file_id: FileId::new(1, ino, 0),
            size,
            processed_size: 0,
            digest: PrefixDigest::of_bytes(head),
            seq: 0,
            retry: 0,
            incomplete: false,
            tail: Vec::new(),
            big_rec: false,
            copy_of: None,
        }
    }
}
