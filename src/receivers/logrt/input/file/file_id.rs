// SPDX-License-Identifier: Apache-2.0

//! Physical identity of a watched file.
//!
//! On Unix this is the device and inode, on Windows the volume serial and the file index. The
//! identity survives renames, which is what lets a rotated `app.log.1` be recognised as the
//! `app.log` tracked in the previous cycle. Platforms without either fall back to content
//! digests, see [`FileId::supported`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

/// Device plus inode. The inode is split in two halves because a ReFS file index is 128 bits;
/// everywhere else `inode_hi` stays zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    device: u64,
    inode: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    inode_hi: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl FileId {
    pub fn new(device: u64, inode: u64, inode_hi: u64) -> Self {
        Self {
            device,
            inode,
            inode_hi,
        }
    }

    /// Whether identities on this platform are stable enough to match files across renames.
    pub fn supported() -> bool {
        cfg!(any(unix, windows))
    }

    pub fn from_file(file: &File) -> io::Result<Self> {
        sys::identify(file)
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        sys::identify(&File::open(path)?)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inode_hi {
            0 => write!(f, "dev={} ino={}", self.device, self.inode),
            hi => write!(f, "dev={} ino={:x}{:016x}", self.device, hi, self.inode),
        }
    }
}

#[cfg(unix)]
mod sys {
    use super::FileId;
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::MetadataExt;

    pub fn identify(file: &File) -> io::Result<FileId> {
        let meta = file.metadata()?;
        Ok(FileId::new(meta.dev(), meta.ino(), 0))
    }
}

#[cfg(windows)]
mod sys {
    use super::FileId;
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::{
        BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
    };

    pub fn identify(file: &File) -> io::Result<FileId> {
        // SAFETY: zero is a valid bit pattern for this plain-data struct
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
        // SAFETY: the handle stays open for the duration of the call
        let ok = unsafe { GetFileInformationByHandle(file.as_raw_handle() as _, &mut info) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(FileId::new(
            u64::from(info.dwVolumeSerialNumber),
            u64::from(info.nFileIndexLow),
            u64::from(info.nFileIndexHigh),
        ))
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use super::FileId;
    use std::fs::File;
    use std::io;

    /// Every file looks the same; callers match by digest instead.
    pub fn identify(_file: &File) -> io::Result<FileId> {
        Ok(FileId::new(0, 0, 0))
    }
}
