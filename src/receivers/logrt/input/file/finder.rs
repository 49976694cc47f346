// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use std::cmp::Ordering;
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

use super::digest::read_head;
use super::file_id::FileId;
use crate::receivers::logrt::config::{WatchConfig, WatchKind, split_pattern};
use crate::receivers::logrt::error::{Error, Result};

/// A file found by a scan, with the stat data and leading bytes needed to identify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in seconds since the Unix epoch
    pub mtime: i64,
    pub file_id: FileId,
    /// Up to `digest_window` leading bytes
    pub head: Vec<u8>,
}

impl Candidate {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Result of one directory scan.
#[derive(Debug, Default)]
pub struct Scan {
    /// Matching files in processing order: oldest first, then by descending name
    pub candidates: Vec<Candidate>,
    /// Matching files that could not be opened
    pub unreadable: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Directory { dir: PathBuf, name: Regex },
}

/// FileMatcher enumerates the files a watch pattern currently names
#[derive(Debug, Clone)]
pub struct FileMatcher {
    target: Target,
    digest_window: usize,
}

impl FileMatcher {
    /// Create a matcher for a single exact path or a `directory/regex` pattern
    pub fn new(kind: WatchKind, pattern: &str, digest_window: usize) -> Result<Self> {
        let target = match kind {
            WatchKind::Log => Target::File(PathBuf::from(pattern)),
            WatchKind::LogRt => {
                let (dir, name) = split_pattern(pattern)?;
                let name = Regex::new(name).map_err(|e| {
                    Error::Config(format!("invalid file name pattern {:?}: {}", name, e))
                })?;
                Target::Directory {
                    dir: dir.to_path_buf(),
                    name,
                }
            }
        };

        Ok(Self {
            target,
            digest_window,
        })
    }

    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        Self::new(config.kind, &config.pattern, config.digest_window)
    }

    /// Directory the watch lives in
    pub fn directory(&self) -> &Path {
        match &self.target {
            Target::File(path) => path.parent().unwrap_or_else(|| Path::new("")),
            Target::Directory { dir, .. } => dir,
        }
    }

    /// List the files matching the pattern. Fails only when the directory (or, for a single
    /// file watch, the file itself) cannot be examined.
    pub fn scan(&self) -> Result<Scan> {
        let mut scan = Scan::default();

        match &self.target {
            Target::File(path) => {
                let metadata = fs::metadata(path).map_err(|source| Error::Scan {
                    path: path.clone(),
                    source,
                })?;
                if !metadata.is_file() {
                    return Err(Error::Scan {
                        path: path.clone(),
                        source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
                    });
                }
                self.add_candidate(&mut scan, path.clone(), &metadata);
            }
            Target::Directory { dir, name } => {
                let entries = fs::read_dir(dir).map_err(|source| Error::Scan {
                    path: dir.clone(),
                    source,
                })?;

                for entry in entries {
                    let entry = entry.map_err(|source| Error::Scan {
                        path: dir.clone(),
                        source,
                    })?;
                    let file_name = entry.file_name();
                    if !name.is_match(&file_name.to_string_lossy()) {
                        continue;
                    }

                    let path = entry.path();
                    let metadata = match fs::metadata(&path) {
                        Ok(m) => m,
                        Err(e) => {
                            // Removed between listing and stat
                            debug!(path = ?path, error = %e, "Cannot stat matched file");
                            continue;
                        }
                    };
                    if !metadata.is_file() {
                        continue;
                    }
                    self.add_candidate(&mut scan, path, &metadata);
                }
            }
        }

        scan.candidates.sort_by(processing_order);
        Ok(scan)
    }

    fn add_candidate(&self, scan: &mut Scan, path: PathBuf, metadata: &Metadata) {
        match self.open_candidate(&path, metadata) {
            Ok(candidate) => scan.candidates.push(candidate),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "Matched file vanished before it could be opened");
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Matched file is not readable");
                scan.unreadable.push(path);
            }
        }
    }

    fn open_candidate(&self, path: &Path, metadata: &Metadata) -> io::Result<Candidate> {
        let mut file = File::open(path)?;
        let file_id = FileId::from_file(&file)?;
        let head = read_head(&mut file, self.digest_window)?;

        // Take size from the open handle, the file may have grown since it was listed
        let size = file.metadata().map(|m| m.len()).unwrap_or(metadata.len());

        Ok(Candidate {
            path: path.to_path_buf(),
            size,
            mtime: mtime_secs(metadata),
            file_id,
            head,
        })
    }
}

/// Oldest files first; equal mtimes by descending name, so `app.log.2` precedes `app.log.1`
/// and both precede `app.log`.
fn processing_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.mtime
        .cmp(&b.mtime)
        .then_with(|| b.path.file_name().cmp(&a.path.file_name()))
}

/// Modification time in whole seconds since the Unix epoch.
pub fn mtime_secs(metadata: &Metadata) -> i64 {
    match metadata.modified() {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write_at(dir: &TempDir, name: &str, content: &str, mtime: u64) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime))
            .unwrap();
        path
    }

    fn pattern(dir: &TempDir, regex: &str) -> String {
        format!("{}/{}", dir.path().display(), regex)
    }

    fn names(scan: &Scan) -> Vec<&str> {
        scan.candidates
            .iter()
            .map(|c| c.file_name().unwrap())
            .collect()
    }

    #[test]
    fn test_scan_matches_regex() {
        let dir = TempDir::new().unwrap();
        write_at(&dir, "app.log", "a\n", 100);
        write_at(&dir, "app.log.1", "b\n", 100);
        write_at(&dir, "other.txt", "c\n", 100);
        fs::create_dir(dir.path().join("app.log.d")).unwrap();

        let matcher = FileMatcher::new(WatchKind::LogRt, &pattern(&dir, r"^app\.log"), 512).unwrap();
        let scan = matcher.scan().unwrap();

        assert_eq!(names(&scan), vec!["app.log.1", "app.log"]);
        assert!(scan.unreadable.is_empty());
    }

    #[test]
    fn test_scan_orders_by_mtime_then_name_descending() {
        let dir = TempDir::new().unwrap();
        write_at(&dir, "app.log", "current\n", 300);
        write_at(&dir, "app.log.1", "older\n", 200);
        write_at(&dir, "app.log.3", "oldest\n", 100);
        write_at(&dir, "app.log.2", "older\n", 200);

        let matcher = FileMatcher::new(WatchKind::LogRt, &pattern(&dir, r"^app\.log"), 512).unwrap();
        let scan = matcher.scan().unwrap();

        assert_eq!(
            names(&scan),
            vec!["app.log.3", "app.log.2", "app.log.1", "app.log"]
        );
    }

    #[test]
    fn test_candidate_stat_data() {
        let dir = TempDir::new().unwrap();
        let path = write_at(&dir, "app.log", "0123456789abcdef", 1_700_000_000);

        let matcher = FileMatcher::new(WatchKind::LogRt, &pattern(&dir, r"app"), 4).unwrap();
        let scan = matcher.scan().unwrap();
        let candidate = &scan.candidates[0];

        assert_eq!(candidate.path, path);
        assert_eq!(candidate.size, 16);
        assert_eq!(candidate.mtime, 1_700_000_000);
        assert_eq!(candidate.head, b"0123");
        assert_eq!(candidate.file_id, FileId::from_path(&path).unwrap());
    }

    #[test]
    fn test_missing_directory_is_scan_error() {
        let dir = TempDir::new().unwrap();
        let missing = format!("{}/nope/app.*", dir.path().display());

        let matcher = FileMatcher::new(WatchKind::LogRt, &missing, 512).unwrap();
        assert!(matches!(matcher.scan(), Err(Error::Scan { .. })));
    }

    #[test]
    fn test_single_file_watch() {
        let dir = TempDir::new().unwrap();
        let path = write_at(&dir, "app.log", "line\n", 100);
        write_at(&dir, "app.log.1", "old\n", 50);

        let matcher =
            FileMatcher::new(WatchKind::Log, path.to_str().unwrap(), 512).unwrap();
        let scan = matcher.scan().unwrap();
        assert_eq!(names(&scan), vec!["app.log"]);

        fs::remove_file(&path).unwrap();
        assert!(matches!(matcher.scan(), Err(Error::Scan { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = write_at(&dir, "app.log", "secret\n", 100);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can open the file regardless of its mode
        if File::open(&path).is_ok() {
            return;
        }

        let matcher = FileMatcher::new(WatchKind::LogRt, &pattern(&dir, "app"), 512).unwrap();
        let scan = matcher.scan().unwrap();
        assert!(scan.candidates.is_empty());
        assert_eq!(scan.unreadable, vec![path]);
    }

    #[test]
    fn test_invalid_file_regex() {
        assert!(matches!(
            FileMatcher::new(WatchKind::LogRt, "/var/log/app(", 512),
            Err(Error::Config(_))
        ));
    }
}
