//! File metadata capture and restoration.
//!
//! Completed transfers restore the source modification time onto the
//! destination so later sync runs see the trees as identical.

use filetime::FileTime;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Size and mtime snapshot used for change detection and resume validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,
}

impl FileStamp {
    /// Read the stamp for a path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

/// Copy the source file's modification time onto the destination.
pub fn copy_mtime(source: &Path, destination: &Path) -> std::io::Result<()> {
    let metadata = fs::metadata(source)?;
    let mtime = FileTime::from_last_modification_time(&metadata);
    filetime::set_file_mtime(destination, mtime)?;
    Ok(())
}

/// Compare two mtimes at whole-second resolution.
///
/// Different filesystems truncate timestamps differently; sub-second noise
/// must not make an untouched file look modified.
pub fn mtime_eq(a: SystemTime, b: SystemTime) -> bool {
    let a = FileTime::from_system_time(a);
    let b = FileTime::from_system_time(b);
    a.unix_seconds() == b.unix_seconds()
}

/// True when `a` is strictly newer than `b` at whole-second resolution.
pub fn mtime_newer(a: SystemTime, b: SystemTime) -> bool {
    let a = FileTime::from_system_time(a);
    let b = FileTime::from_system_time(b);
    a.unix_seconds() > b.unix_seconds()
}
