//! An unsorted staging file open for append.

use super::file_set::FileSetId;
use super::record::StagingRecord;
use super::sort::Sorter;
use super::sorted::SortedStagingFile;
use crate::core::{Result, TierError, Timestamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Append handle on one sequence file of a file-set.
///
/// Only the intake writer appends, but the collector may close the file at
/// any time; a write to a closed file reports `false` so the writer can move
/// on to the next sequence.
#[derive(Debug)]
pub struct StagingFile {
    file_set: FileSetId,
    seq: u32,
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    last_modified: AtomicU32,
}

impl StagingFile {
    /// Open sequence `seq` of `file_set` in `dir` for append, creating it if needed.
    pub fn open(dir: &Path, file_set: FileSetId, seq: u32, now: Timestamp) -> Result<Self> {
        let path = dir.join(file_set.unsorted_name(seq));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!("Opened staging file {:?}", path);
        Ok(Self {
            file_set,
            seq,
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            last_modified: AtomicU32::new(now),
        })
    }

    /// File-set this file belongs to.
    pub fn file_set(&self) -> &FileSetId {
        &self.file_set
    }

    /// Sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last time a record was appended.
    pub fn last_modified(&self) -> Timestamp {
        self.last_modified.load(Ordering::Relaxed)
    }

    /// Append a record. `Ok(false)` when the file was already closed.
    pub fn write(&self, record: &StagingRecord, now: Timestamp) -> Result<bool> {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Ok(false);
        };
        record.write_line(writer)?;
        self.last_modified.store(now, Ordering::Relaxed);
        Ok(true)
    }

    /// Flush buffered records.
    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush and close. Later writes report `false`.
    pub fn close(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.flush() {
                tracing::error!("Error closing staging file {:?}: {}", self.path, e);
            }
        }
    }

    /// Whether the file was closed.
    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Sort this closed file together with the set's previous sorted file.
    ///
    /// A sorted output that already exists is complete (sorters rename it into
    /// place) and is handed back as-is without sorting again. The merged
    /// previous file is deleted once the new sorted file is complete.
    pub fn sort(
        &self,
        sorter: &dyn Sorter,
        previous: Option<PathBuf>,
    ) -> Result<SortedStagingFile> {
        if !self.is_closed() {
            return Err(TierError::staging(format!(
                "staging file {:?} must be closed before sorting",
                self.path
            )));
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let out = dir.join(self.file_set.sorted_name(self.seq));
        if out.exists() {
            tracing::info!("Sorted file {:?} already exists, processing it as-is", out);
            return Ok(SortedStagingFile::new(out, self.file_set.clone()));
        }

        let started = std::time::Instant::now();
        let records = sorter.sort(&self.path, previous.as_deref(), &out)?;
        if let Some(previous) = previous {
            if let Err(e) = std::fs::remove_file(&previous) {
                tracing::warn!("Failed to remove merged sorted file {:?}: {}", previous, e);
            }
        }
        tracing::debug!(
            "Sorted {:?} ({} records) in {:?}",
            self.path,
            records,
            started.elapsed()
        );
        Ok(SortedStagingFile::new(out, self.file_set.clone()))
    }
}
