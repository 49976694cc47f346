// SPDX-License-Identifier: Apache-2.0

pub mod file;

pub use file::{
    Candidate, Encoding, FileId, FileMatcher, PrefixDigest, ReadEvent, ReaderOptions,
    RecordReader, Scan,
};
