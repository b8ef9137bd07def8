//! Staging file-set identity and on-disk naming.
//!
//! A file-set collects raw points for one `(tier, interval, shard)`. Its files
//! live flat in the staging directory:
//!
//! - `<db>-<from>-<shard>.<seq>` unsorted, append-only
//! - `<db>-<from>-<shard>.<seq>.s` sorted by metric id

use crate::core::{Result, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

const DELIMITER: char = '-';
const SORTED_EXT: &str = "s";

/// Identity of a staging file-set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileSetId {
    /// Destination tier
    pub db_name: String,
    /// Interval start in the destination tier
    pub from: Timestamp,
    /// Shard within the interval
    pub shard: u32,
}

/// Highest sequence numbers found on disk for one file-set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sequences {
    pub last_unsorted: u32,
    pub last_sorted: u32,
}

impl Sequences {
    /// Next free sequence number; sorted and unsorted files share the space.
    pub fn next(&self) -> u32 {
        self.last_unsorted.max(self.last_sorted) + 1
    }

    /// Whether the newest unsorted file has not been sorted yet.
    pub fn is_incomplete(&self) -> bool {
        self.last_unsorted > self.last_sorted
    }
}

impl FileSetId {
    /// File-set for `(db_name, from, shard)`.
    pub fn new(db_name: impl Into<String>, from: Timestamp, shard: u32) -> Self {
        Self {
            db_name: db_name.into(),
            from,
            shard,
        }
    }

    /// Parse the id part of a staging file name; `None` for unrelated files.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let id = name.split('.').next()?;
        let mut parts = id.split(DELIMITER);
        let db_name = parts.next().filter(|s| !s.is_empty())?;
        let from = parts.next()?.parse().ok()?;
        let shard = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(db_name, from, shard))
    }

    /// Name of unsorted file number `seq`.
    pub fn unsorted_name(&self, seq: u32) -> String {
        format!("{self}.{seq}")
    }

    /// Name of sorted file number `seq`.
    pub fn sorted_name(&self, seq: u32) -> String {
        format!("{self}.{seq}.{SORTED_EXT}")
    }

    /// Sequence of a file belonging to this set, with its sortedness.
    pub fn parse_sequence(&self, file_name: &str) -> Option<(u32, bool)> {
        let rest = file_name.strip_prefix(&self.to_string())?.strip_prefix('.')?;
        match rest.split_once('.') {
            Some((seq, ext)) if ext == SORTED_EXT => Some((seq.parse().ok()?, true)),
            Some(_) => None,
            None => Some((rest.parse().ok()?, false)),
        }
    }

    /// Sequences of this set present in `dir`.
    pub fn sequences(&self, dir: &Path) -> Result<Sequences> {
        let mut seqs = Sequences::default();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match self.parse_sequence(name) {
                Some((seq, true)) => seqs.last_sorted = seqs.last_sorted.max(seq),
                Some((seq, false)) => seqs.last_unsorted = seqs.last_unsorted.max(seq),
                None => {},
            }
        }
        Ok(seqs)
    }

    /// Every file-set with files in `dir`, with their sequences.
    pub fn scan_dir(dir: &Path) -> Result<HashMap<FileSetId, Sequences>> {
        let mut sets: HashMap<FileSetId, Sequences> = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(id) = FileSetId::from_file_name(name) else {
                continue;
            };
            let Some((seq, sorted)) = id.parse_sequence(name) else {
                continue;
            };
            let seqs = sets.entry(id).or_default();
            if sorted {
                seqs.last_sorted = seqs.last_sorted.max(seq);
            } else {
                seqs.last_unsorted = seqs.last_unsorted.max(seq);
            }
        }
        Ok(sets)
    }
}

impl fmt::Display for FileSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}{DELIMITER}{}", self.db_name, self.from, self.shard)
    }
}
