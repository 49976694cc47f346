// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::encoding::Encoding;
use super::file_id::FileId;
use crate::receivers::logrt::state::LogFile;

/// Options controlling how a file is split into records
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub encoding: Encoding,
    /// Bytes read from disk at a time
    pub chunk_size: usize,
    /// Longest record kept whole
    pub max_record_size: usize,
    /// Refuse to read if the path no longer refers to the tracked device/inode
    pub verify_identity: bool,
}

/// One step of reading a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete record. `bytes` excludes the terminator; `end` is the offset just past it.
    Record {
        start: u64,
        end: u64,
        bytes: Vec<u8>,
        /// The record was longer than `max_record_size` and was cut
        truncated: bool,
    },
    /// Bytes of an oversized record were discarded up to `end`.
    Skipped {
        end: u64,
        /// The terminator of the oversized record was reached
        finished: bool,
    },
}

/// RecordReader streams the records between a file's processed offset and its scanned size.
///
/// The reader never commits anything itself: the caller moves `processed_size` forward as it
/// consumes events, so a record that could not be delivered is read again next cycle.
pub struct RecordReader {
    path: PathBuf,
    file: File,
    options: ReaderOptions,
    /// Unconsumed bytes, starting at file offset `buf_start`
    buf: Vec<u8>,
    buf_start: u64,
    /// Next offset to read from disk
    read_pos: u64,
    /// Stop reading at this offset
    limit: u64,
    skipping: bool,
}

impl RecordReader {
    /// Open a tracked file and position it after the consumed bytes. The buffered tail of the
    /// previous read becomes the start of the first record.
    pub fn open(log_file: &LogFile, options: ReaderOptions) -> io::Result<Self> {
        let mut file = File::open(&log_file.path)?;

        if options.verify_identity && FileId::from_file(&file)? != log_file.file_id {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "path now refers to a different file",
            ));
        }

        file.seek(SeekFrom::Start(log_file.processed_size))?;

        Ok(Self {
            path: log_file.path.clone(),
            file,
            options,
            buf: log_file.tail.clone(),
            buf_start: log_file.tail_start(),
            read_pos: log_file.processed_size,
            limit: log_file.size,
            skipping: log_file.big_rec,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset up to which the file has been read
    pub fn position(&self) -> u64 {
        self.read_pos
    }

    /// Whether the reader is discarding the rest of an oversized record
    pub fn is_skipping(&self) -> bool {
        self.skipping
    }

    /// Unterminated bytes left over once `next_event` has returned `None`
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }

    /// Return the next record or skip, or `None` once everything up to the limit has been read.
    pub fn next_event(&mut self) -> io::Result<Option<ReadEvent>> {
        let encoding = self.options.encoding;

        loop {
            if self.skipping {
                if let Some((_, record_end)) = encoding.find_terminator(&self.buf) {
                    self.consume(record_end);
                    self.skipping = false;
                    return Ok(Some(ReadEvent::Skipped {
                        end: self.buf_start,
                        finished: true,
                    }));
                }

                let discard = encoding.align_down(self.buf.len());
                if discard > 0 {
                    self.consume(discard);
                    return Ok(Some(ReadEvent::Skipped {
                        end: self.buf_start,
                        finished: false,
                    }));
                }
            } else if let Some((content_end, record_end)) = encoding.find_terminator(&self.buf) {
                return Ok(Some(self.take_record(content_end, record_end, false)));
            } else if self.buf.len() >= self.options.max_record_size {
                let cut = encoding.align_down(self.options.max_record_size);
                self.skipping = true;
                return Ok(Some(self.take_record(cut, cut, true)));
            }

            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Turn the unterminated remainder into a final record, used when no more data will ever
    /// be appended to the file.
    pub fn take_remainder(&mut self) -> Option<ReadEvent> {
        if self.buf.is_empty() || self.skipping {
            return None;
        }
        let len = self.buf.len();
        Some(self.take_record(len, len, false))
    }

    fn take_record(&mut self, content_end: usize, record_end: usize, truncated: bool) -> ReadEvent {
        let start = self.buf_start;
        let mut bytes = &self.buf[..content_end];
        if start == 0 {
            bytes = self.options.encoding.strip_bom(bytes);
        }
        let bytes = bytes.to_vec();
        self.consume(record_end);

        ReadEvent::Record {
            start,
            end: self.buf_start,
            bytes,
            truncated,
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.buf_start += n as u64;
    }

    /// Read the next chunk. Returns false at the limit or when the file ends early.
    fn fill(&mut self) -> io::Result<bool> {
        if self.read_pos >= self.limit {
            return Ok(false);
        }

        // Never buffer more than one maximal record
        let room = if self.skipping {
            self.options.chunk_size
        } else {
            self.options.max_record_size - self.buf.len()
        };
        let want = (self.limit - self.read_pos)
            .min(self.options.chunk_size as u64)
            .min(room as u64) as usize;

        let old_len = self.buf.len();
        self.buf.resize(old_len + want, 0);
        let mut filled = 0;
        while filled < want {
            match self.file.read(&mut self.buf[old_len + filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e);
                }
            }
        }
        self.buf.truncate(old_len + filled);
        self.read_pos += filled as u64;

        if filled < want {
            // The file shrank after it was scanned
            self.limit = self.read_pos;
        }
        Ok(filled > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receivers::logrt::input::PrefixDigest;
    use crate::receivers::logrt::state::test_support::log_file;
    use std::fs;
    use tempfile::TempDir;

    fn options() -> ReaderOptions {
        ReaderOptions {
            encoding: Encoding::Utf8,
            chunk_size: 8,
            max_record_size: 16,
            verify_identity: true,
        }
    }

    fn tracked(dir: &TempDir, content: &[u8]) -> LogFile {
        let path = dir.path().join("app.log");
        fs::write(&path, content).unwrap();
        let mut lf = log_file(path.to_str().unwrap(), 0, content.len() as u64, 0, b"");
        lf.file_id = FileId::from_path(&path).unwrap();
        lf.digest = PrefixDigest::empty();
        lf
    }

    fn records(reader: &mut RecordReader) -> Vec<(u64, u64, String)> {
        let mut out = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            if let ReadEvent::Record {
                start, end, bytes, ..
            } = event
            {
                out.push((start, end, String::from_utf8(bytes).unwrap()));
            }
        }
        out
    }

    #[test]
    fn test_reads_records_across_chunks() {
        let dir = TempDir::new().unwrap();
        let lf = tracked(&dir, b"first line\nsecond\r\nthird");

        let mut reader = RecordReader::open(&lf, options()).unwrap();
        assert_eq!(
            records(&mut reader),
            vec![
                (0, 11, "first line".to_string()),
                (11, 19, "second".to_string()),
            ]
        );
        assert_eq!(reader.remainder(), b"third");
        assert_eq!(reader.position(), 24);
    }

    #[test]
    fn test_tail_is_prefixed_to_next_read() {
        let dir = TempDir::new().unwrap();
        let mut lf = tracked(&dir, b"partial record\n");
        lf.processed_size = 7;
        lf.tail = b"partial".to_vec();

        let mut reader = RecordReader::open(&lf, options()).unwrap();
        assert_eq!(
            records(&mut reader),
            vec![(0, 15, "partial record".to_string())]
        );
        assert!(reader.remainder().is_empty());
    }

    #[test]
    fn test_stops_at_scanned_size() {
        let dir = TempDir::new().unwrap();
        let mut lf = tracked(&dir, b"one\ntwo\n");
        lf.size = 4;

        let mut reader = RecordReader::open(&lf, options()).unwrap();
        assert_eq!(records(&mut reader), vec![(0, 4, "one".to_string())]);
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn test_oversized_record_is_cut_and_skipped() {
        let dir = TempDir::new().unwrap();
        let lf = tracked(&dir, b"0123456789abcdefghijklmnopqrstuvwxyz\nnext\n");

        let mut reader = RecordReader::open(&lf, options()).unwrap();
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            events.push(event);
        }

        assert_eq!(
            events.first(),
            Some(&ReadEvent::Record {
                start: 0,
                end: 16,
                bytes: b"0123456789abcdef".to_vec(),
                truncated: true,
            })
        );
        assert!(events.contains(&ReadEvent::Skipped {
            end: 37,
            finished: true
        }));
        assert_eq!(
            events.last(),
            Some(&ReadEvent::Record {
                start: 37,
                end: 42,
                bytes: b"next".to_vec(),
                truncated: false,
            })
        );
    }

    #[test]
    fn test_skipping_resumes_from_state() {
        let dir = TempDir::new().unwrap();
        let mut lf = tracked(&dir, b"xxxxxxxxrest of big\nok\n");
        lf.processed_size = 8;
        lf.big_rec = true;

        let mut reader = RecordReader::open(&lf, options()).unwrap();
        assert_eq!(records(&mut reader), vec![(20, 23, "ok".to_string())]);
        assert!(!reader.is_skipping());
    }

    #[test]
    fn test_take_remainder_and_bom() {
        let dir = TempDir::new().unwrap();
        let lf = tracked(&dir, b"\xEF\xBB\xBFno newline");

        let mut reader = RecordReader::open(&lf, options()).unwrap();
        assert!(reader.next_event().unwrap().is_none());
        assert_eq!(
            reader.take_remainder(),
            Some(ReadEvent::Record {
                start: 0,
                end: 13,
                bytes: b"no newline".to_vec(),
                truncated: false,
            })
        );
        assert!(reader.take_remainder().is_none());
    }

    #[test]
    fn test_utf16_records() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = "hi\nyo\n"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let lf = tracked(&dir, &content);

        let opts = ReaderOptions {
            encoding: Encoding::Utf16Le,
            ..options()
        };
        let mut reader = RecordReader::open(&lf, opts).unwrap();
        let got: Vec<String> = records(&mut reader)
            .into_iter()
            .map(|(_, _, s)| s)
            .collect();
        assert_eq!(got, vec!["h\0i\0".to_string(), "y\0o\0".to_string()]);
    }

    #[test]
    fn test_replaced_file_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut lf = tracked(&dir, b"line\n");
        lf.file_id = FileId::new(u64::MAX, u64::MAX, 0);

        let err = RecordReader::open(&lf, options()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
