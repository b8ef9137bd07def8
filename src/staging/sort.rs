//! Sorting unsorted staging files by metric id.
//!
//! The sorted output of a file-set is produced from its newest unsorted file
//! plus, when one exists, the previous sorted file of the same set. Records
//! are ordered numerically by metric id; order among records of one metric is
//! not preserved.

use super::record::parse_id;
use crate::core::Result;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

/// Sorts one unsorted staging file, optionally merging a previous sorted file.
pub trait Sorter: Send + Sync + std::fmt::Debug {
    /// Write the sorted merge of `unsorted` and `previous` to `out`.
    ///
    /// Returns the number of records written. `out` must not exist yet and
    /// only appears once complete. Inputs are left in place.
    fn sort(&self, unsorted: &Path, previous: Option<&Path>, out: &Path) -> Result<u64>;
}

/// A staging line keyed by metric id.
type Keyed = (u64, String);

fn read_keyed(path: &Path) -> Result<Vec<Keyed>> {
    let mut out = Vec::new();
    for line in BufReader::new(File::open(path)?).lines() {
        if let Some(keyed) = keyed(line?) {
            out.push(keyed);
        }
    }
    Ok(out)
}

fn keyed(line: String) -> Option<Keyed> {
    if line.is_empty() {
        return None;
    }
    match parse_id(&line) {
        Ok(id) => Some((id, line)),
        Err(e) => {
            tracing::warn!("Dropping unsortable staging line: {}", e);
            None
        },
    }
}

fn tmp_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write through a temp file that is renamed onto `out` once complete.
fn write_atomically(
    out: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<u64>,
) -> Result<u64> {
    let tmp = tmp_path(out);
    let result = (|| -> Result<u64> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let count = write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(count)
    })();
    match result {
        Ok(count) => {
            fs::rename(&tmp, out)?;
            Ok(count)
        },
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        },
    }
}

/// Loads everything into memory. Fine for tests and small files.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemorySort;

impl Sorter for InMemorySort {
    fn sort(&self, unsorted: &Path, previous: Option<&Path>, out: &Path) -> Result<u64> {
        let mut records = read_keyed(unsorted)?;
        if let Some(previous) = previous {
            records.extend(read_keyed(previous)?);
        }
        records.sort_by_key(|(id, _)| *id);
        write_atomically(out, |w| {
            for (_, line) in &records {
                writeln!(w, "{line}")?;
            }
            Ok(records.len() as u64)
        })
    }
}

/// Bounded-memory merge sort: sorted runs of `chunk_records` lines are spilled
/// next to the output and k-way merged.
#[derive(Debug, Clone)]
pub struct ExternalSort {
    chunk_records: usize,
}

impl ExternalSort {
    /// Sort holding at most `chunk_records` lines in memory per run.
    pub fn new(chunk_records: usize) -> Self {
        Self {
            chunk_records: chunk_records.max(1),
        }
    }

    fn spill(&self, out: &Path, index: usize, chunk: &mut Vec<Keyed>) -> Result<PathBuf> {
        chunk.par_sort_by_key(|(id, _)| *id);
        let mut name = out.as_os_str().to_os_string();
        name.push(format!(".run{index}"));
        let path = PathBuf::from(name);
        let mut writer = BufWriter::new(File::create(&path)?);
        for (_, line) in chunk.drain(..) {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        Ok(path)
    }

    fn split_runs(&self, unsorted: &Path, out: &Path) -> Result<Vec<PathBuf>> {
        let mut runs = Vec::new();
        let mut chunk = Vec::with_capacity(self.chunk_records.min(1 << 16));
        let result = (|| -> Result<()> {
            for line in BufReader::new(File::open(unsorted)?).lines() {
                if let Some(keyed) = keyed(line?) {
                    chunk.push(keyed);
                }
                if chunk.len() >= self.chunk_records {
                    runs.push(self.spill(out, runs.len(), &mut chunk)?);
                }
            }
            if !chunk.is_empty() {
                runs.push(self.spill(out, runs.len(), &mut chunk)?);
            }
            Ok(())
        })();
        if let Err(e) = result {
            remove_all(&runs);
            return Err(e);
        }
        Ok(runs)
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove sort run {:?}: {}", path, e);
        }
    }
}

/// A sorted input being merged.
struct Run {
    lines: Lines<BufReader<File>>,
}

impl Run {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            lines: BufReader::new(File::open(path)?).lines(),
        })
    }

    fn next(&mut self) -> Result<Option<Keyed>> {
        for line in self.lines.by_ref() {
            if let Some(keyed) = keyed(line?) {
                return Ok(Some(keyed));
            }
        }
        Ok(None)
    }
}

fn merge(inputs: &[&Path], out: &Path) -> Result<u64> {
    let mut runs = inputs.iter().map(|p| Run::open(p)).collect::<Result<Vec<_>>>()?;
    // (id, run index) orders ties by run, keeping the merge deterministic
    let mut heap = BinaryHeap::with_capacity(runs.len());
    let mut heads: Vec<Option<String>> = vec![None; runs.len()];
    for (i, run) in runs.iter_mut().enumerate() {
        if let Some((id, line)) = run.next()? {
            heads[i] = Some(line);
            heap.push(Reverse((id, i)));
        }
    }

    write_atomically(out, |w| {
        let mut count = 0u64;
        while let Some(Reverse((_, i))) = heap.pop() {
            if let Some(line) = heads[i].take() {
                writeln!(w, "{line}")?;
                count += 1;
            }
            if let Some((id, line)) = runs[i].next()? {
                heads[i] = Some(line);
                heap.push(Reverse((id, i)));
            }
        }
        Ok(count)
    })
}

impl Sorter for ExternalSort {
    fn sort(&self, unsorted: &Path, previous: Option<&Path>, out: &Path) -> Result<u64> {
        let runs = self.split_runs(unsorted, out)?;
        let mut inputs: Vec<&Path> = runs.iter().map(PathBuf::as_path).collect();
        if let Some(previous) = previous {
            inputs.push(previous);
        }
        let result = merge(&inputs, out);
        remove_all(&runs);
        result
    }
}
