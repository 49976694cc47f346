// SPDX-License-Identifier: Apache-2.0

//! Delivery of records and the bookkeeping of what has been acknowledged.
//!
//! ## Offset Semantics
//!
//! A file's `processed_size` moves forward only when a record is consumed: delivered and
//! acknowledged by the sink, dropped by the filters, or buffered as an unterminated tail.
//! A record the sink refuses leaves `processed_size` at the record's start, so the next cycle
//! reads it again from the acknowledged position.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::receivers::logrt::config::{Destination, WatchConfig};
use crate::receivers::logrt::error::DeliveryError;
use crate::receivers::logrt::state::LogFile;

/// A formatted record with the metadata the collector needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub server: String,
    pub port: u16,
    pub hostname: String,
    pub key: String,
    pub value: String,
    /// Seconds since the Unix epoch at which the record was read
    pub timestamp: i64,
    /// Modification time of the source file
    pub mtime: i64,
    /// Offset just past the record in the source file
    pub last_log_size: u64,
    pub path: PathBuf,
    pub seq: usize,
    /// The collector must buffer the record rather than drop it under load
    pub persistent: bool,
}

/// Receiver of formatted records.
pub trait RecordSink {
    /// Deliver one record. An error means the record was not accepted and will be offered
    /// again in a later cycle.
    fn deliver(&mut self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

impl<F> RecordSink for F
where
    F: FnMut(&Delivery) -> Result<(), DeliveryError>,
{
    fn deliver(&mut self, delivery: &Delivery) -> Result<(), DeliveryError> {
        self(delivery)
    }
}

/// Per-cycle limits on time and record counts.
#[derive(Debug, Clone)]
pub struct CycleBudget {
    started: Instant,
    max_delay: Option<Duration>,
    max_sent: usize,
    max_processed: usize,
    sent: usize,
    processed: usize,
}

impl CycleBudget {
    pub fn new(config: &WatchConfig, started: Instant) -> Self {
        Self {
            started,
            max_delay: config.max_delay,
            max_sent: config.max_lines_sent,
            max_processed: config.max_lines_processed,
            sent: 0,
            processed: 0,
        }
    }

    /// Whether the cycle must stop before analysing another record.
    pub fn exhausted(&self) -> bool {
        if self.sent >= self.max_sent || self.processed >= self.max_processed {
            return true;
        }
        match self.max_delay {
            Some(max_delay) => self.started.elapsed() >= max_delay,
            None => false,
        }
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn processed(&self) -> usize {
        self.processed
    }
}

/// Result of offering one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The record's bytes were consumed and the offset advanced.
    Consumed,
    /// The sink refused the record; the offset did not move.
    Rejected,
}

/// DeliveryTracker hands records to the sink and moves offsets forward
pub struct DeliveryTracker<'a, S: RecordSink + ?Sized> {
    sink: &'a mut S,
    destination: &'a Destination,
    budget: CycleBudget,
    /// Offset and file mtime of the last acknowledged record
    last_sent: Option<(u64, i64)>,
    processed_bytes: u64,
    failures: usize,
}

impl<'a, S: RecordSink + ?Sized> DeliveryTracker<'a, S> {
    pub fn new(sink: &'a mut S, destination: &'a Destination, budget: CycleBudget) -> Self {
        Self {
            sink,
            destination,
            budget,
            last_sent: None,
            processed_bytes: 0,
            failures: 0,
        }
    }

    pub fn budget(&self) -> &CycleBudget {
        &self.budget
    }

    pub fn exhausted(&self) -> bool {
        self.budget.exhausted()
    }

    /// Offset and file mtime of the last acknowledged record, if any was delivered.
    pub fn last_sent(&self) -> Option<(u64, i64)> {
        self.last_sent
    }

    /// Bytes consumed during this cycle.
    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Hand a formatted record to the sink. On success the file's offset moves to `end`.
    pub fn deliver(&mut self, file: &mut LogFile, value: String, end: u64) -> Outcome {
        let delivery = Delivery {
            server: self.destination.server.clone(),
            port: self.destination.port,
            hostname: self.destination.hostname.clone(),
            key: self.destination.key.clone(),
            value,
            timestamp: chrono::Utc::now().timestamp(),
            mtime: file.mtime,
            last_log_size: end,
            path: file.path.clone(),
            seq: file.seq,
            persistent: true,
        };

        match self.sink.deliver(&delivery) {
            Ok(()) => {
                self.budget.sent += 1;
                self.budget.processed += 1;
                self.last_sent = Some((end, file.mtime));
                file.retry = 0;
                self.advance(file, end);
                debug!(path = ?file.path, offset = end, seq = file.seq, "Delivered record");
                Outcome::Consumed
            }
            Err(e) => {
                file.retry += 1;
                self.failures += 1;
                warn!(
                    path = ?file.path,
                    offset = file.processed_size,
                    retry = file.retry,
                    error = %e,
                    "Record delivery failed"
                );
                Outcome::Rejected
            }
        }
    }

    /// Consume a record the filters dropped.
    pub fn discard(&mut self, file: &mut LogFile, end: u64) {
        self.budget.processed += 1;
        self.advance(file, end);
    }

    /// Move the file's offset to `end`, with nothing left buffered.
    pub fn advance(&mut self, file: &mut LogFile, end: u64) {
        self.processed_bytes += end.saturating_sub(file.processed_size);
        file.processed_size = file.processed_size.max(end);
        file.tail.clear();
        file.incomplete = false;
    }

    /// Move the file's offset to `end`, keeping `tail` as the start of the next record.
    pub fn buffer_tail(&mut self, file: &mut LogFile, end: u64, tail: &[u8]) {
        self.advance(file, end);
        file.tail = tail.to_vec();
        file.incomplete = !tail.is_empty();
    }
}
