// SPDX-License-Identifier: Apache-2.0

//! One processing cycle of a watch.
//!
//! A cycle scans the directory, reconciles the scan with the previous identity list, drains
//! files that rotated away, and then reads every tracked file in sequence order until all new
//! records are consumed or the budget runs out.

use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::receivers::logrt::config::WatchConfig;
use crate::receivers::logrt::delivery::{CycleBudget, DeliveryTracker, Outcome, RecordSink};
use crate::receivers::logrt::error::{Error, Result};
use crate::receivers::logrt::filter::RecordFilter;
use crate::receivers::logrt::input::file::read_head;
use crate::receivers::logrt::input::{
    FileId, FileMatcher, ReadEvent, ReaderOptions, RecordReader,
};
use crate::receivers::logrt::rotation::{Resolution, RotationResolver};
use crate::receivers::logrt::state::{LogFile, WatchState};

/// Summary of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records analysed (delivered or filtered out)
    pub processed: usize,
    /// Records delivered
    pub sent: usize,
    /// Bytes consumed
    pub processed_bytes: u64,
    /// The budget ran out with work left; the next cycle should run right away
    pub pending: bool,
    /// Files whose delivery failed more often than `max_retries`
    pub stalled: Vec<PathBuf>,
    /// Files that could not be read during the cycle
    pub read_errors: Vec<PathBuf>,
    /// Files whose identity could not be resolved uniquely
    pub ambiguities: Vec<PathBuf>,
    /// Matched files that could not be opened
    pub unreadable: Vec<PathBuf>,
    pub delivery_failures: usize,
}

/// How reading one file ended.
#[derive(Debug)]
enum FileOutcome {
    /// Everything up to the scanned size was consumed.
    Done,
    /// Nothing to read.
    Idle,
    Budget,
    Rejected,
    ReadFailed(Error),
}

/// LogWatcher runs the cycles of one configured watch
#[derive(Debug, Clone)]
pub struct LogWatcher {
    config: WatchConfig,
    matcher: FileMatcher,
    resolver: RotationResolver,
    filter: RecordFilter,
}

impl LogWatcher {
    /// Validate the configuration and compile its expressions
    pub fn new(config: WatchConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            matcher: FileMatcher::from_config(&config)?,
            resolver: RotationResolver::new(config.rotation, config.encoding),
            filter: RecordFilter::from_config(&config)?,
            config,
        })
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Run one cycle against `state`, delivering new records to `sink`.
    ///
    /// A scan failure returns an error and leaves `state` untouched. Every other failure is
    /// recorded in the report and the cycle carries on.
    pub fn process<S: RecordSink + ?Sized>(
        &self,
        state: &mut WatchState,
        sink: &mut S,
        started: Instant,
    ) -> Result<CycleReport> {
        let scan = self.matcher.scan()?;
        let Resolution {
            files,
            transitions,
            rotated_away,
            ambiguous,
        } = self.resolver.resolve(state, scan.candidates);

        let mut report = CycleReport {
            unreadable: scan.unreadable,
            ..Default::default()
        };
        for path in &ambiguous {
            warn!(error = %Error::IdentityAmbiguity(path.clone()), "Tracking file as new");
        }
        report.ambiguities = ambiguous;

        debug!(
            files = files.len(),
            rotated_away = rotated_away.len(),
            transitions = ?transitions,
            "Resolved watched files"
        );

        let budget = CycleBudget::new(&self.config, started);
        let mut tracker = DeliveryTracker::new(sink, &self.config.destination, budget);
        let mut next_files = Vec::with_capacity(files.len() + rotated_away.len());
        let mut halted = false;
        let mut budget_halted = false;
        let mut last_processed: Option<(u64, i64)> = None;

        for mut file in rotated_away {
            if halted {
                next_files.push(file);
                continue;
            }

            let outcome = match self.prepare_drain(&mut file, state.use_inode) {
                Ok(true) => self.read_file(&mut file, true, state.use_inode, &mut tracker),
                Ok(false) => {
                    debug!(path = ?file.path, "Rotated file is gone, nothing to drain");
                    continue;
                }
                Err(source) => FileOutcome::ReadFailed(Error::Read {
                    path: file.path.clone(),
                    source,
                }),
            };

            match outcome {
                FileOutcome::Done | FileOutcome::Idle => {
                    info!(path = ?file.path, offset = file.processed_size, "Finished rotated file");
                }
                FileOutcome::Budget => {
                    halted = true;
                    budget_halted = true;
                    last_processed = Some((file.tail_start(), file.mtime));
                    next_files.push(file);
                }
                FileOutcome::Rejected if file.retry <= self.config.max_retries => {
                    halted = true;
                    next_files.push(file);
                }
                FileOutcome::Rejected => {
                    warn!(path = ?file.path, retry = file.retry, "Giving up on rotated file");
                    report.stalled.push(file.path);
                }
                FileOutcome::ReadFailed(e) => {
                    warn!(error = %e, "Cannot drain rotated file");
                    report.read_errors.push(file.path);
                }
            }
        }

        let newest = files.len().saturating_sub(1);
        for (idx, mut file) in files.into_iter().enumerate() {
            if !halted {
                let outcome =
                    self.read_file(&mut file, idx < newest, state.use_inode, &mut tracker);
                if !matches!(outcome, FileOutcome::Idle | FileOutcome::ReadFailed(_)) {
                    last_processed = Some((file.tail_start(), file.mtime));
                }

                match outcome {
                    FileOutcome::Done | FileOutcome::Idle => {}
                    FileOutcome::Budget => {
                        halted = true;
                        budget_halted = true;
                    }
                    FileOutcome::Rejected if file.retry <= self.config.max_retries => {
                        // Later files wait so that records stay in order
                        halted = true;
                    }
                    FileOutcome::Rejected => {
                        warn!(path = ?file.path, retry = file.retry, "File is stalled, continuing with the next file");
                        report.stalled.push(file.path.clone());
                    }
                    FileOutcome::ReadFailed(e) => {
                        warn!(error = %e, "Cannot read file, keeping its progress");
                        report.read_errors.push(file.path.clone());
                    }
                }
            }
            next_files.push(file);
        }

        for (seq, file) in next_files.iter_mut().enumerate() {
            file.seq = seq;
            file.copy_of = None;
        }

        report.processed = tracker.budget().processed();
        report.sent = tracker.budget().sent();
        report.processed_bytes = tracker.processed_bytes();
        report.delivery_failures = tracker.failures();

        if let Some((size, mtime)) = tracker.last_sent() {
            state.last_size_sent = size;
            state.last_mtime_sent = mtime;
        }
        if let Some((size, mtime)) = last_processed {
            state.last_size = size;
            state.last_mtime = mtime;
        }
        state.files = next_files;
        state.processed_bytes += report.processed_bytes;
        state.skip_old_data = false;
        report.pending = budget_halted && state.has_pending();

        debug!(
            processed = report.processed,
            sent = report.sent,
            bytes = report.processed_bytes,
            pending = report.pending,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Check that a rotated-away file is still reachable under its last path, and pick up
    /// its current size. Returns false when there is nothing to drain.
    fn prepare_drain(&self, file: &mut LogFile, use_inode: bool) -> std::io::Result<bool> {
        let mut handle = match File::open(&file.path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let same = if use_inode {
            FileId::from_file(&handle)? == file.file_id
        } else {
            let head = read_head(&mut handle, self.config.digest_window)?;
            file.digest.matches_head(&head)
        };
        if !same {
            return Ok(false);
        }

        let size = handle.metadata()?.len();
        if size < file.processed_size {
            return Ok(false);
        }
        file.size = size;
        Ok(true)
    }

    /// Read the new records of one file. `finished` marks a file nothing will be appended to
    /// any more, whose unterminated last record is delivered as is.
    fn read_file<S: RecordSink + ?Sized>(
        &self,
        file: &mut LogFile,
        finished: bool,
        use_inode: bool,
        tracker: &mut DeliveryTracker<'_, S>,
    ) -> FileOutcome {
        let flush_tail = finished && !file.tail.is_empty() && !file.big_rec;
        if file.unread() == 0 && !flush_tail {
            return FileOutcome::Idle;
        }
        if tracker.exhausted() {
            return FileOutcome::Budget;
        }

        let options = ReaderOptions {
            encoding: self.config.encoding,
            chunk_size: self.config.chunk_size,
            max_record_size: self.config.max_record_size,
            verify_identity: use_inode,
        };
        let read_failed = |path: &PathBuf, source| {
            FileOutcome::ReadFailed(Error::Read {
                path: path.clone(),
                source,
            })
        };
        let mut reader = match RecordReader::open(file, options) {
            Ok(reader) => reader,
            Err(e) => return read_failed(&file.path, e),
        };
        debug!(path = ?file.path, offset = file.processed_size, size = file.size, seq = file.seq, "Reading file");

        loop {
            if tracker.exhausted() {
                return FileOutcome::Budget;
            }

            match reader.next_event() {
                Err(e) => return read_failed(&file.path, e),
                Ok(None) => break,
                Ok(Some(ReadEvent::Skipped { end, finished })) => {
                    tracker.advance(file, end);
                    file.big_rec = !finished;
                }
                Ok(Some(ReadEvent::Record {
                    end,
                    bytes,
                    truncated,
                    ..
                })) => {
                    if self.consume(file, &bytes, end, tracker) == Outcome::Rejected {
                        return FileOutcome::Rejected;
                    }
                    if truncated {
                        debug!(path = ?file.path, offset = end, "Record too long, skipping its remainder");
                        file.big_rec = true;
                    }
                }
            }
        }

        tracker.buffer_tail(file, reader.position(), reader.remainder());
        file.big_rec = reader.is_skipping();

        if finished {
            if let Some(ReadEvent::Record { end, bytes, .. }) = reader.take_remainder() {
                if tracker.exhausted() {
                    return FileOutcome::Budget;
                }
                if self.consume(file, &bytes, end, tracker) == Outcome::Rejected {
                    return FileOutcome::Rejected;
                }
            }
        }

        FileOutcome::Done
    }

    /// Filter, format and deliver one record.
    fn consume<S: RecordSink + ?Sized>(
        &self,
        file: &mut LogFile,
        bytes: &[u8],
        end: u64,
        tracker: &mut DeliveryTracker<'_, S>,
    ) -> Outcome {
        let text = self.config.encoding.decode(bytes);
        match self.filter.apply(&text) {
            Some(value) => tracker.deliver(file, value, end),
            None => {
                tracker.discard(file, end);
                Outcome::Consumed
            }
        }
    }
}
