//! On-disk storage for partitions.
//!
//! - [`layout`]: directory and file naming
//! - [`segment`]: write-ahead segments produced by commits
//! - [`chunk`]: immutable columnar chunks produced by compaction
//!
//! Every data file is written with the same durability contract:
//! 1. Write to a temp file (`<name>.tmp`)
//! 2. fsync the temp file
//! 3. Atomic rename to the final path
//! 4. fsync the directory (rename persistence)

pub mod chunk;
pub mod layout;
pub mod segment;

pub use chunk::{ChunkContents, ChunkHeader};
pub use layout::{DataFileKind, PartitionLayout};
pub use segment::SegmentContents;

use crate::error::{BurrowError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Sync mode for data file durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fsync files and directories (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync for files (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Writes a file through a temp file and an atomic rename.
///
/// On error the temp file is removed and `path` is left untouched, unless
/// only the final directory sync failed.
pub fn write_atomic<F>(path: &Path, sync_mode: SyncMode, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let installed = write_atomic_with(path, sync_mode, write, sync_dir)?;
    installed.dir_synced?;
    Ok(installed.size)
}

/// A file installed by [`write_atomic_with`].
#[derive(Debug)]
pub struct Installed {
    /// Size of the written file.
    pub size: u64,
    /// Outcome of the directory sync that follows the rename.
    pub dir_synced: std::io::Result<()>,
}

/// Like [`write_atomic`], with the directory sync supplied by the caller.
///
/// Once the rename happened the file is in place, so a failed directory
/// sync is returned in [`Installed::dir_synced`] instead of as an error.
pub fn write_atomic_with<F, S>(
    path: &Path,
    sync_mode: SyncMode,
    write: F,
    sync_dir: S,
) -> Result<Installed>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
    S: FnOnce(&Path) -> std::io::Result<()>,
{
    let tmp_path = temp_path(path);
    let size = match write_and_rename(path, &tmp_path, sync_mode, write) {
        Ok(size) => size,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
    };
    let dir_synced = match path.parent() {
        Some(dir) if sync_mode != SyncMode::None => sync_dir(dir),
        _ => Ok(()),
    };
    Ok(Installed { size, dir_synced })
}

/// Fsyncs a directory so renames inside it persist.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn write_and_rename<F>(path: &Path, tmp_path: &Path, sync_mode: SyncMode, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let file = File::create(tmp_path)?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    match sync_mode {
        SyncMode::Fsync => file.sync_all()?,
        SyncMode::Fdatasync => file.sync_data()?,
        SyncMode::None => {}
    }
    let size = file.metadata()?.len();
    drop(file);

    fs::rename(tmp_path, path)?;
    Ok(size)
}

/// Path of the temp file used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub(crate) fn u16_at(buf: &[u8], pos: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[pos..pos + 2]);
    u16::from_le_bytes(bytes)
}

pub(crate) fn u32_at(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn u64_at(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn magic_at(buf: &[u8], pos: usize) -> [u8; 4] {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[pos..pos + 4]);
    magic
}

/// Bounds-checked little-endian reader over an in-memory buffer.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(BurrowError::Corrupted(format!(
                "need {} bytes at position {}, buffer holds {}",
                len,
                self.pos,
                self.data.len()
            )));
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16_at(self.bytes(2)?, 0))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32_at(self.bytes(4)?, 0))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64_at(self.bytes(8)?, 0))
    }

    pub(crate) fn magic(&mut self) -> Result<[u8; 4]> {
        Ok(magic_at(self.bytes(4)?, 0))
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Reference-counted handle to a data file.
///
/// Snapshots share guards for the files they reference. A guard marked
/// obsolete deletes its file when the last holder drops it.
#[derive(Debug)]
pub struct FileGuard {
    path: PathBuf,
    obsolete: AtomicBool,
}

impl FileGuard {
    /// Wraps an existing file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            obsolete: AtomicBool::new(false),
        }
    }

    /// Path of the guarded file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schedules deletion for when the last holder releases the guard.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Returns true once the file is scheduled for deletion.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Reclaimed obsolete file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "Failed to reclaim obsolete file"
            ),
        }
    }
}
