//! Destinations for streamed series.

use crate::core::Series;
use parking_lot::Mutex;
use std::io::{self, Write};

/// Output stream written to by several batch tasks at once.
pub trait SeriesSink: Send + Sync {
    /// Called once before the first series.
    fn open(&self) -> io::Result<()> {
        Ok(())
    }

    /// Write one series.
    fn write_series(&self, series: &Series) -> io::Result<()>;

    /// Called once after the last series, also after a failure.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps every series in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    series: Mutex<Vec<Series>>,
}

impl CollectingSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected series sorted by name.
    pub fn take(&self) -> Vec<Series> {
        let mut all = std::mem::take(&mut *self.series.lock());
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl SeriesSink for CollectingSink {
    fn write_series(&self, series: &Series) -> io::Result<()> {
        self.series.lock().push(series.clone());
        Ok(())
    }
}

/// One JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Sink writing into `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Give back the writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> SeriesSink for JsonLinesSink<W> {
    fn write_series(&self, series: &Series) -> io::Result<()> {
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, series)?;
        out.write_all(b"\n")
    }

    fn close(&self) -> io::Result<()> {
        self.out.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let sink = JsonLinesSink::new(Vec::new());
        let mut series = Series::gaps("a.b", 60, 120, 60);
        series.values[0] = Some(1.5);
        sink.write_series(&series).unwrap();
        sink.write_series(&Series::gaps("c", 0, 0, 60)).unwrap();
        sink.close().unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Series = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, series);
    }

    #[test]
    fn test_collecting_sink_sorts() {
        let sink = CollectingSink::new();
        for name in ["b", "a", "c"] {
            sink.write_series(&Series::gaps(name, 0, 0, 60)).unwrap();
        }
        let names: Vec<String> = sink.take().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(sink.take().is_empty());
    }
}
