//! Newline-delimited JSON file output with size-based rotation.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use logroller::{LogRoller, LogRollerBuilder, Rotation, RotationSize};
use parking_lot::Mutex;

use super::Sink;
use crate::errors::SinkError;
use crate::record::LogRecord;

/// Default size at which the active file is rotated.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated files kept.
pub const DEFAULT_MAX_FILES: usize = 5;

/// Appends one JSON object per line to a size-rotated file.
///
/// Rotation and retention are handled by `logroller`: once the active file
/// reaches `max_bytes` it is rolled over, and only the newest `max_files`
/// rotated files are kept next to it.
pub struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    roller: Mutex<LogRoller>,
}

impl FileSink {
    /// Opens `path` for appending with the default rotation limits.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        Self::with_rotation(path, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES)
    }

    /// Opens `path` for appending with explicit rotation limits.
    pub fn with_rotation(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        max_files: usize,
    ) -> Result<Self, SinkError> {
        let path = path.into();
        let file_name = path
            .file_name()
            .ok_or_else(|| SinkError::Rotation(format!("{} has no file name", path.display())))?
            .to_owned();
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        fs::create_dir_all(&directory)?;

        let max_bytes = max_bytes.max(1);
        let max_files = max_files.max(1);
        let roller = LogRollerBuilder::new(directory.as_path(), Path::new(&file_name))
            .rotation(Rotation::SizeBased(RotationSize::Bytes(max_bytes)))
            .max_keep_files(max_files as u64)
            .build()
            .map_err(|e| SinkError::Rotation(e.to_string()))?;

        tracing::debug!(path = %path.display(), max_bytes, max_files, "Opened rotating log file");
        Ok(Self {
            path,
            max_bytes,
            max_files,
            roller: Mutex::new(roller),
        })
    }

    /// Configured path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every file this sink has written that still exists, active and
    /// rotated, sorted by name.
    pub fn files(&self) -> Result<Vec<PathBuf>, SinkError> {
        let Some(stem) = self.path.file_name() else {
            return Ok(Vec::new());
        };
        let stem = stem.to_string_lossy();
        let directory = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut files = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && entry.file_name().to_string_lossy().starts_with(stem.as_ref())
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl fmt::Debug for FileSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("max_bytes", &self.max_bytes)
            .field("max_files", &self.max_files)
            .finish_non_exhaustive()
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&record.to_json())?;
        line.push(b'\n');
        self.roller.lock().write_all(&line)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.roller.lock().flush()?;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.roller.get_mut().flush();
    }
}
