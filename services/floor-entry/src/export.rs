use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write CSV row: {0}")]
    Csv(#[from] csv::Error),

    #[error("export task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Appends rows to per-sheet CSV files under one directory.
///
/// Each file has its own lock held across the emptiness check and the write,
/// so the header is written exactly once and rows never interleave. A lock
/// lives in the table only while some writer holds or waits on it.
pub struct ExportAppender {
    dir: PathBuf,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ExportAppender {
    /// Create an appender, creating `dir` if it does not exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ExportError::Io {
            path: dir.clone(),
            source,
        })?;

        info!(dir = %dir.display(), "Export directory ready");

        Ok(Self {
            dir,
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the CSV file backing a sheet
    pub fn path_for(&self, sheet: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", sheet))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the table entry for `path` once no other writer references it
    fn release(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.file_locks.lock();
        let tracked = locks.get(path).is_some_and(|held| Arc::ptr_eq(held, &lock));
        // One reference in the table, one held here
        if tracked && Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.file_locks.lock().len()
    }

    /// Append one row, writing `headers` first if the file is new or empty.
    ///
    /// Blocking; async callers go through [`ExportAppender::append`].
    pub fn append_row(
        &self,
        sheet: &str,
        headers: &[&str],
        row: &[String],
    ) -> Result<PathBuf, ExportError> {
        let path = self.path_for(sheet);
        let lock = self.lock_for(&path);
        let written = {
            let _guard = lock.lock();
            Self::write_locked(&path, headers, row)
        };
        self.release(&path, lock);
        written.map(|()| path)
    }

    fn write_locked(path: &Path, headers: &[&str], row: &[String]) -> Result<(), ExportError> {
        let io_err = |source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        let fresh = file.metadata().map_err(io_err)?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::CRLF)
            .from_writer(file);

        if fresh {
            writer.write_record(headers)?;
        }
        writer.write_record(row)?;
        writer.flush().map_err(io_err)?;

        debug!(path = %path.display(), header_written = fresh, "Row appended");

        Ok(())
    }

    /// Append a row on the blocking pool
    #[instrument(skip(self, headers, row))]
    pub async fn append(
        self: &Arc<Self>,
        sheet: String,
        headers: &'static [&'static str],
        row: Vec<String>,
    ) -> Result<PathBuf, ExportError> {
        let appender = Arc::clone(self);
        tokio::task::spawn_blocking(move || appender.append_row(&sheet, headers, &row)).await?
    }
}
