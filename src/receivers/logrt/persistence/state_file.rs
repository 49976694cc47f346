// SPDX-License-Identifier: Apache-2.0

//! Watch state kept in a single JSON document.
//!
//! Every watch owns one entry of the document, keyed by its watch key. Saving a watch rewrites
//! the whole document into a temporary file that is then renamed over the old one, so an
//! interrupted save leaves the previous positions in place.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::receivers::logrt::error::{Error, Result};
use crate::receivers::logrt::persistence::schema::{
    PERSISTED_STATE_VERSION, PersistedWatchStateV1,
};
use crate::receivers::logrt::persistence::store::StateStore;
use crate::receivers::logrt::state::WatchState;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    watches: BTreeMap<String, Value>,
}

/// Handle on a state file shared by all watches of an agent.
#[derive(Debug, Clone)]
pub struct StateFile {
    /// None for a document that is never written to disk
    path: Option<PathBuf>,
    document: Arc<RwLock<Document>>,
}

impl StateFile {
    /// Open the state file at `path`. A missing or empty file is an empty document.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let document = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Document::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Persistence(format!("state file {:?} is not valid JSON: {}", path, e))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Document::default(),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "cannot read state file {:?}: {}",
                    path, e
                )));
            }
        };
        debug!(path = ?path, watches = document.watches.len(), "Opened state file");

        Ok(Self {
            path: Some(path),
            document: Arc::new(RwLock::new(document)),
        })
    }

    /// A document that lives only as long as the handle.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Arc::new(RwLock::new(Document::default())),
        }
    }

    /// The entry of one watch.
    pub fn watch(&self, key: impl Into<String>) -> WatchSlot {
        WatchSlot {
            file: self.clone(),
            key: key.into(),
        }
    }

    /// Keys of all watches with saved state.
    pub fn keys(&self) -> Result<Vec<String>> {
        let document = self
            .document
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(document.watches.keys().cloned().collect())
    }

    fn entry(&self, key: &str) -> Result<Option<Value>> {
        let document = self
            .document
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(document.watches.get(key).cloned())
    }

    /// Replace or remove one entry and write the document out. When the write fails the entry
    /// keeps its previous value, so memory never runs ahead of disk.
    fn set_entry(&self, key: &str, value: Option<Value>) -> Result<()> {
        let mut document = self
            .document
            .write()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let previous = match value {
            Some(value) => document.watches.insert(key.to_string(), value),
            None => document.watches.remove(key),
        };

        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Err(e) = replace_file(path, &document) {
            match previous {
                Some(previous) => document.watches.insert(key.to_string(), previous),
                None => document.watches.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

fn replace_file(path: &Path, document: &Document) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static NEXT_TEMP: AtomicU64 = AtomicU64::new(0);

    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| Error::Persistence(format!("cannot encode state: {}", e)))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Persistence(format!("cannot create state directory {:?}: {}", dir, e))
        })?;
    }

    // Unique per process and save, so concurrent agents never share a temporary
    let temp = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        NEXT_TEMP.fetch_add(1, Ordering::Relaxed)
    ));
    let written = File::create(&temp)
        .and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&temp, path));

    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(Error::Persistence(format!(
            "cannot write state file {:?}: {}",
            path, e
        )));
    }
    Ok(())
}

/// The entry of one watch inside a [`StateFile`].
#[derive(Debug, Clone)]
pub struct WatchSlot {
    file: StateFile,
    key: String,
}

impl WatchSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Forget the saved state of this watch.
    pub fn remove(&mut self) -> Result<()> {
        self.file.set_entry(&self.key, None)
    }
}

impl StateStore for WatchSlot {
    fn load_watch(&mut self) -> Result<Option<WatchState>> {
        let Some(value) = self.file.entry(&self.key)? else {
            debug!(watch = %self.key, "No persisted state found, starting fresh");
            return Ok(None);
        };

        // Checked first, a newer layout would not parse as this one
        let version = value.get("version").and_then(Value::as_u64);
        if let Some(version) = version.filter(|v| *v > PERSISTED_STATE_VERSION as u64) {
            return Err(Error::Persistence(format!(
                "persisted state for {:?} has unsupported version {}",
                self.key, version
            )));
        }

        let persisted: PersistedWatchStateV1 = serde_json::from_value(value).map_err(|e| {
            Error::Persistence(format!(
                "persisted state for {:?} is corrupted and cannot be loaded: {}. \
                 To start fresh, delete the state file and restart.",
                self.key, e
            ))
        })?;

        debug!(
            watch = %self.key,
            files = persisted.state.files.len(),
            version = persisted.version,
            "Loaded persisted watch state"
        );
        Ok(Some(persisted.state))
    }

    fn save_watch(&mut self, state: &WatchState) -> Result<()> {
        let value = serde_json::to_value(PersistedWatchStateV1::new(state.clone()))
            .map_err(|e| Error::Persistence(format!("cannot encode state: {}", e)))?;
        self.file.set_entry(&self.key, Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> WatchState {
        WatchState {
            last_size: 120,
            last_mtime: 1_700_000_000,
            last_size_sent: 118,
            ..WatchState::new(false)
        }
    }

    #[test]
    fn test_round_trip_through_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("logrt.json");

        {
            let file = StateFile::open(&path).unwrap();
            let mut slot = file.watch("logrt[/var/log/app.log]");
            assert!(slot.load_watch().unwrap().is_none());
            slot.save_watch(&sample_state()).unwrap();
        }

        let file = StateFile::open(&path).unwrap();
        assert_eq!(file.keys().unwrap(), vec!["logrt[/var/log/app.log]"]);
        let mut slot = file.watch("logrt[/var/log/app.log]");
        assert_eq!(slot.load_watch().unwrap(), Some(sample_state()));

        // No temporaries left next to the file
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_watches_are_isolated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("logrt.json");
        let file = StateFile::open(&path).unwrap();

        let mut first = file.watch("logrt[/var/log/a.log]");
        let mut second = file.watch("logrt[/var/log/b.log]");
        first.save_watch(&sample_state()).unwrap();
        second.save_watch(&WatchState::new(true)).unwrap();
        first.remove().unwrap();

        let reopened = StateFile::open(&path).unwrap();
        assert!(reopened.watch(first.key()).load_watch().unwrap().is_none());
        assert!(
            reopened
                .watch(second.key())
                .load_watch()
                .unwrap()
                .unwrap()
                .skip_old_data
        );
    }

    #[test]
    fn test_empty_file_is_empty_document() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("logrt.json");
        fs::write(&path, "").unwrap();

        let file = StateFile::open(&path).unwrap();
        assert!(file.keys().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_file_fails_to_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("logrt.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(StateFile::open(&path), Err(Error::Persistence(_))));
    }

    #[test]
    fn test_corrupted_state_fails_to_load() {
        let file = StateFile::in_memory();
        file.set_entry("watch", Some(json!({"version": 1, "state": 5})))
            .unwrap();

        let err = file.watch("watch").load_watch().unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let file = StateFile::in_memory();
        file.set_entry("watch", Some(json!({"version": 9, "state": {"layout": "new"}})))
            .unwrap();

        let err = file.watch("watch").load_watch().unwrap_err();
        assert!(err.to_string().contains("unsupported version 9"));
    }

    #[test]
    fn test_failed_save_keeps_previous_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("logrt.json");
        let file = StateFile::open(&path).unwrap();
        let mut slot = file.watch("logrt[/var/log/app.log]");
        slot.save_watch(&sample_state()).unwrap();

        // A directory in its place makes the rename fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let mut next = sample_state();
        next.last_size_sent = 120;
        assert!(matches!(
            slot.save_watch(&next),
            Err(Error::Persistence(_))
        ));
        assert_eq!(slot.load_watch().unwrap(), Some(sample_state()));

        let mut other = file.watch("logrt[/var/log/other.log]");
        assert!(other.save_watch(&WatchState::new(true)).is_err());
        assert_eq!(file.keys().unwrap(), vec!["logrt[/var/log/app.log]"]);
    }
}
