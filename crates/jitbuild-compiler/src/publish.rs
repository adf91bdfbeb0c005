//! Atomic artifact publishing.
//!
//! Output is written to a swap file, stamped with the source's timestamps
//! and renamed over the destination, so readers only ever see the previous
//! artifact or the complete new one.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;

use crate::error::CompileError;

/// The filesystem stats the cache cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: FileTime,
    pub accessed: FileTime,
}

impl FileStamp {
    /// Capture the stamp of an already-fetched metadata record.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: FileTime::from_last_modification_time(metadata),
            accessed: FileTime::from_last_access_time(metadata),
        }
    }

    /// Stat `path`, following symlinks.
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(&metadata))
    }

    /// Modification time in nanoseconds since the Unix epoch.
    pub fn modified_nanos(&self) -> i128 {
        i128::from(self.modified.unix_seconds()) * 1_000_000_000
            + i128::from(self.modified.nanoseconds())
    }

    /// Modification time as a `SystemTime`.
    pub fn modified_time(&self) -> SystemTime {
        let nanos = self.modified_nanos();
        if nanos >= 0 {
            SystemTime::UNIX_EPOCH + std::time::Duration::from_nanos(nanos as u64)
        } else {
            SystemTime::UNIX_EPOCH - std::time::Duration::from_nanos(nanos.unsigned_abs() as u64)
        }
    }
}

/// Options for [`write_artifact`].
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Create parent directories of the destination and swap file.
    pub make_dirs: bool,
    /// Stage the write through this path and rename it into place.
    pub swap_path: Option<PathBuf>,
    /// Timestamps to apply before the file becomes visible.
    pub copy_stats: Option<FileStamp>,
    /// Which output unit to write. Required when there is more than one.
    pub output_index: Option<usize>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            make_dirs: true,
            swap_path: None,
            copy_stats: None,
            output_index: None,
        }
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_swap_path(mut self, swap_path: impl Into<PathBuf>) -> Self {
        self.swap_path = Some(swap_path.into());
        self
    }

    pub fn with_copy_stats(mut self, stats: FileStamp) -> Self {
        self.copy_stats = Some(stats);
        self
    }

    pub fn with_output_index(mut self, index: usize) -> Self {
        self.output_index = Some(index);
        self
    }

    pub fn without_dirs(mut self) -> Self {
        self.make_dirs = false;
        self
    }
}

/// Write `contents` to `dest` following the publish options.
///
/// Strictly ordered: write the staging file, apply timestamps, rename. On
/// failure the destination is untouched; a partially written swap file is
/// left for the caller's cleanup.
pub async fn write_artifact(
    dest: &Path,
    contents: &[u8],
    options: &PublishOptions,
) -> Result<(), CompileError> {
    if options.make_dirs {
        let dest_dir = parent_dir(dest);
        let swap_dir = options.swap_path.as_deref().map(parent_dir);
        let (dest_made, swap_made) = tokio::join!(
            create_dir_all(dest_dir),
            async {
                match swap_dir {
                    Some(dir) => create_dir_all(dir).await,
                    None => Ok(()),
                }
            }
        );
        dest_made?;
        swap_made?;
    }

    let staging = options.swap_path.as_deref().unwrap_or(dest);

    tokio::fs::write(staging, contents)
        .await
        .map_err(|source| write_error(staging, source))?;

    if let Some(stats) = options.copy_stats {
        stamp_times(staging, stats).await?;
    }

    if let Some(swap) = &options.swap_path {
        tokio::fs::rename(swap, dest)
            .await
            .map_err(|source| write_error(dest, source))?;
    }

    Ok(())
}

async fn stamp_times(path: &Path, stats: FileStamp) -> Result<(), CompileError> {
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        filetime::set_file_times(&target, stats.accessed, stats.modified)
    })
    .await
    .map_err(|e| write_error(path, std::io::Error::other(e)))?
    .map_err(|source| write_error(path, source))
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

async fn create_dir_all(dir: Option<&Path>) -> Result<(), CompileError> {
    match dir {
        Some(dir) => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| write_error(dir, source)),
        None => Ok(()),
    }
}

fn write_error(path: &Path, source: std::io::Error) -> CompileError {
    CompileError::Write {
        path: path.to_path_buf(),
        source,
    }
}
