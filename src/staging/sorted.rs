//! Sequential reader over a sorted staging file, yielding one group of values
//! per metric.

use super::file_set::FileSetId;
use super::interval::IntervalValues;
use super::record::{parse_line, StagedValue};
use crate::core::{MetricIndex, Result, TierError};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// A sorted staging file.
#[derive(Debug)]
pub struct SortedStagingFile {
    path: PathBuf,
    file_set: FileSetId,
    lines: Option<Lines<BufReader<File>>>,
    put_back: Option<StagedValue>,
    corrupt: u64,
    line_no: u64,
}

impl SortedStagingFile {
    /// Handle on a sorted file; not opened yet.
    pub fn new(path: PathBuf, file_set: FileSetId) -> Self {
        Self {
            path,
            file_set,
            lines: None,
            put_back: None,
            corrupt: 0,
            line_no: 0,
        }
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File-set this file belongs to.
    pub fn file_set(&self) -> &FileSetId {
        &self.file_set
    }

    /// Destination tier.
    pub fn db_name(&self) -> &str {
        &self.file_set.db_name
    }

    /// Corrupt lines skipped so far.
    pub fn corrupt_lines(&self) -> u64 {
        self.corrupt
    }

    /// Start reading from the beginning.
    pub fn open(&mut self) -> Result<()> {
        self.lines = Some(BufReader::new(File::open(&self.path)?).lines());
        self.put_back = None;
        self.line_no = 0;
        Ok(())
    }

    /// Release the reader.
    pub fn close(&mut self) {
        self.lines = None;
        self.put_back = None;
    }

    /// Whether the file is not being read.
    pub fn is_closed(&self) -> bool {
        self.lines.is_none()
    }

    fn next_record(&mut self) -> Result<Option<StagedValue>> {
        if let Some(record) = self.put_back.take() {
            return Ok(Some(record));
        }
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| TierError::staging(format!("sorted file {:?} is not open", self.path)))?;
        for line in lines.by_ref() {
            let line = line?;
            self.line_no += 1;
            if line.is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    self.corrupt += 1;
                    tracing::warn!("{:?}:{}: skipping record: {}", self.path, self.line_no, e);
                },
            }
        }
        Ok(None)
    }

    /// Values of the next metric in the file, `None` at end of file.
    ///
    /// The metric is looked up by id, then by the staged name if any line of
    /// the group carried one. A metric missing from the index fails with
    /// [`TierError::UnknownMetric`] after its records were consumed, so the
    /// caller can log it and go on with the next group.
    pub fn next_group(&mut self, index: &dyn MetricIndex) -> Result<Option<IntervalValues>> {
        let Some(first) = self.next_record()? else {
            return Ok(None);
        };
        let metric_id = first.metric_id;
        let mut name = first.metric_name;
        let mut values = vec![first.value];
        while let Some(next) = self.next_record()? {
            if next.metric_id != metric_id {
                self.put_back = Some(next);
                break;
            }
            if name.is_none() {
                name = next.metric_name;
            }
            values.push(next.value);
        }

        let metric = index
            .for_id(metric_id)
            .or_else(|| name.as_deref().and_then(|n| index.for_name(n)))
            .ok_or_else(|| TierError::UnknownMetric(format!("id {metric_id}")))?;
        Ok(Some(IntervalValues {
            metric,
            values,
            interval: self.file_set.from,
            db_name: self.file_set.db_name.clone(),
        }))
    }
}
