//! Staging record lines: `<metric id> <value>[ <metric name>]\n`.
//!
//! Values are written with Rust's shortest round-trip float formatting, so a
//! parsed value is bit-identical to the one that was staged. The name is
//! optional and only used when the id no longer resolves.

use super::file_set::FileSetId;
use crate::core::{Result, TierError};
use std::io::Write;

/// A raw point waiting in the intake queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRecord {
    /// Destination file-set
    pub file_set: FileSetId,
    /// Metric id
    pub metric_id: u64,
    /// Raw value
    pub value: f64,
    /// Metric name, when the producer knows it
    pub metric_name: Option<String>,
}

impl StagingRecord {
    /// Append this record as one line.
    pub fn write_line<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        match &self.metric_name {
            Some(name) => writeln!(out, "{} {} {}", self.metric_id, self.value, name),
            None => writeln!(out, "{} {}", self.metric_id, self.value),
        }
    }
}

/// One parsed staging line.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedValue {
    pub metric_id: u64,
    pub value: f64,
    pub metric_name: Option<String>,
}

/// Metric id of a line; the cheap part used as sort key.
pub fn parse_id(line: &str) -> Result<u64> {
    let id = line.split_once(' ').map_or(line, |(id, _)| id);
    id.parse()
        .map_err(|_| TierError::corrupt(format!("bad metric id in staging line {line:?}")))
}

/// Parse a full line.
pub fn parse_line(line: &str) -> Result<StagedValue> {
    let mut fields = line.split_ascii_whitespace();
    let (Some(id), Some(value)) = (fields.next(), fields.next()) else {
        return Err(TierError::corrupt(format!("staging line {line:?} has no value")));
    };
    let metric_name = fields.next().map(str::to_string);
    if fields.next().is_some() {
        return Err(TierError::corrupt(format!("trailing fields in staging line {line:?}")));
    }
    Ok(StagedValue {
        metric_id: id
            .parse()
            .map_err(|_| TierError::corrupt(format!("bad metric id in staging line {line:?}")))?,
        value: value
            .parse()
            .map_err(|_| TierError::corrupt(format!("bad value in staging line {line:?}")))?,
        metric_name,
    })
}
