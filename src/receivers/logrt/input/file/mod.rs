// SPDX-License-Identifier: Apache-2.0

mod digest;
mod encoding;
mod file_id;
mod finder;
mod reader;

pub use digest::{DEFAULT_DIGEST_WINDOW, PrefixDigest, read_head};
pub use encoding::Encoding;
pub use file_id::FileId;
pub use finder::{Candidate, FileMatcher, Scan, mtime_secs};
pub use reader::{ReadEvent, ReaderOptions, RecordReader};
