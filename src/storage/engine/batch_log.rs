//! Built-in engine: an ordered in-memory map made durable by an append-only
//! log of committed batches.
//!
//! Every batch is one frame on disk: `u32` little-endian length followed by an
//! lz4 compressed bincode list of records. Opening replays the frames; a torn
//! trailing frame from a crash is cut off. Each record remembers when it was
//! written so [`KvEngine::compact`] can drop records older than the TTL and
//! rewrite the log as a snapshot.

use super::{BatchOp, Cursor, KvEngine, KvPair, WriteBatch};
use crate::core::{Clock, Result, SystemClock, TierError, Timestamp};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const LOG_FILE: &str = "archive.log";
const SNAPSHOT_FRAME_RECORDS: usize = 10_000;

type Records = Arc<RwLock<BTreeMap<Vec<u8>, Stored>>>;

#[derive(Debug)]
struct Stored {
    value: Vec<u8>,
    written_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        written_at: Timestamp,
    },
    Delete {
        key: Vec<u8>,
    },
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, records: &[LogRecord], sync: bool) -> Result<()> {
        write_frame(&mut self.writer, records)?;
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// Ordered map + batch log engine with write-time TTL.
#[derive(Debug)]
pub struct LogEngine {
    ttl: u32,
    sync: bool,
    clock: Arc<dyn Clock>,
    data: Records,
    log: Mutex<Option<LogFile>>,
    closed: AtomicBool,
}

impl LogEngine {
    /// Open (or create) the engine under `dir`, replaying its log.
    pub fn open(dir: &Path, ttl: u32, sync: bool, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let data = replay(&path)?;
        tracing::debug!("Replayed {} records from {:?}", data.len(), path);
        Ok(Self {
            ttl,
            sync,
            clock,
            data: Arc::new(RwLock::new(data)),
            log: Mutex::new(Some(LogFile::open(path)?)),
            closed: AtomicBool::new(false),
        })
    }

    /// Engine without a log, for tests and scratch tiers.
    pub fn in_memory(ttl: u32) -> Self {
        Self::in_memory_with_clock(ttl, Arc::new(SystemClock))
    }

    /// Log-less engine driven by `clock`.
    pub fn in_memory_with_clock(ttl: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            sync: false,
            clock,
            data: Arc::new(RwLock::new(BTreeMap::new())),
            log: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Records currently held, expired ones included until compaction.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether no record is held.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TierError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl KvEngine for LogEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.data.read().get(key).map(|s| s.value.clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }
        let written_at = self.clock.now();
        let records: Vec<LogRecord> = batch
            .into_ops()
            .into_iter()
            .map(|op| match op {
                BatchOp::Put(key, value) => LogRecord::Put {
                    key,
                    value,
                    written_at,
                },
                BatchOp::Delete(key) => LogRecord::Delete { key },
            })
            .collect();

        // log lock first, then the map: commit order on disk equals apply order
        let mut log = self.log.lock();
        if let Some(file) = log.as_mut() {
            file.append(&records, self.sync)?;
        }
        let mut data = self.data.write();
        for record in records {
            apply(&mut data, record);
        }
        Ok(())
    }

    fn scan(&self, from: Option<&[u8]>, chunk: usize) -> Result<Cursor> {
        self.ensure_open()?;
        Ok(Cursor::new(LogScan {
            data: Arc::clone(&self.data),
            next_from: from.map_or(Bound::Unbounded, |k| Bound::Included(k.to_vec())),
            buf: VecDeque::new(),
            chunk: chunk.max(1),
            exhausted: false,
        }))
    }

    fn compact(&self) -> Result<usize> {
        self.ensure_open()?;
        let cutoff = self.clock.now().saturating_sub(self.ttl);
        let mut log = self.log.lock();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|_, s| s.written_at >= cutoff);
        let removed = before - data.len();

        if let Some(file) = log.as_mut() {
            let path = file.path.clone();
            rewrite_snapshot(&path, &data)?;
            *file = LogFile::open(path)?;
        }
        if removed > 0 {
            tracing::info!("Compaction expired {} records older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        let mut log = self.log.lock();
        if let Some(file) = log.as_mut() {
            file.writer.flush()?;
            file.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut log = self.log.lock();
        if let Some(mut file) = log.take() {
            file.writer.flush()?;
            file.writer.get_ref().sync_data()?;
        }
        self.data.write().clear();
        Ok(())
    }
}

/// Reads the map a chunk at a time and holds no lock in between, so writers
/// are never blocked by a slow reader.
struct LogScan {
    data: Records,
    next_from: Bound<Vec<u8>>,
    buf: VecDeque<KvPair>,
    chunk: usize,
    exhausted: bool,
}

impl LogScan {
    fn refill(&mut self) {
        let from = match &self.next_from {
            Bound::Included(k) => Bound::Included(k.as_slice()),
            Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let data = self.data.read();
        self.buf.extend(
            data.range::<[u8], _>((from, Bound::Unbounded))
                .take(self.chunk)
                .map(|(k, s)| (k.clone(), s.value.clone())),
        );
        drop(data);
        if self.buf.len() < self.chunk {
            self.exhausted = true;
        }
        if let Some((last, _)) = self.buf.back() {
            self.next_from = Bound::Excluded(last.clone());
        }
    }
}

impl Iterator for LogScan {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buf.pop_front().map(Ok)
    }
}

fn apply(data: &mut BTreeMap<Vec<u8>, Stored>, record: LogRecord) {
    match record {
        LogRecord::Put {
            key,
            value,
            written_at,
        } => {
            data.insert(key, Stored { value, written_at });
        },
        LogRecord::Delete { key } => {
            data.remove(&key);
        },
    }
}

fn write_frame<W: Write>(out: &mut W, records: &[LogRecord]) -> Result<()> {
    let payload = compress_prepend_size(&bincode::serialize(records)?);
    let len = u32::try_from(payload.len())
        .map_err(|_| TierError::storage("write batch too large for one log frame"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    Ok(())
}

fn replay(path: &Path) -> Result<BTreeMap<Vec<u8>, Stored>> {
    let mut data = BTreeMap::new();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(data),
        Err(e) => return Err(e.into()),
    };

    let mut offset = 0usize;
    while offset < bytes.len() {
        let Some(frame) = read_frame(&bytes[offset..]) else {
            break;
        };
        let (consumed, records) = frame;
        for record in records {
            apply(&mut data, record);
        }
        offset += consumed;
    }

    if offset < bytes.len() {
        tracing::warn!(
            "Discarding {} bytes of torn log tail in {:?}",
            bytes.len() - offset,
            path
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
    }
    Ok(data)
}

fn read_frame(buf: &[u8]) -> Option<(usize, Vec<LogRecord>)> {
    let len_bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let payload = buf.get(4..4 + len)?;
    let raw = decompress_size_prepended(payload).ok()?;
    let records = bincode::deserialize(&raw).ok()?;
    Some((4 + len, records))
}

fn rewrite_snapshot(path: &Path, data: &BTreeMap<Vec<u8>, Stored>) -> Result<()> {
    let tmp = path.with_extension("log.compact");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut frame = Vec::with_capacity(SNAPSHOT_FRAME_RECORDS.min(data.len()));
        for (key, stored) in data {
            frame.push(LogRecord::Put {
                key: key.clone(),
                value: stored.value.clone(),
                written_at: stored.written_at,
            });
            if frame.len() == SNAPSHOT_FRAME_RECORDS {
                write_frame(&mut out, &frame)?;
                frame.clear();
            }
        }
        if !frame.is_empty() {
            write_frame(&mut out, &frame)?;
        }
        out.flush()?;
        out.get_ref().sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use tempfile::TempDir;

    fn scan_all(engine: &LogEngine) -> Vec<KvPair> {
        engine.scan(None, 1024).unwrap().map(Result::unwrap).collect()
    }

    #[test]
    fn test_reopen_replays_batches() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        {
            let engine = LogEngine::open(dir.path(), 3600, false, clock.clone()).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"a", b"1");
            batch.put(b"b", b"2");
            batch.put(b"c", b"3");
            engine.write(batch).unwrap();
            engine.delete(b"b").unwrap();
            engine.put(b"a", b"9").unwrap();
            engine.close().unwrap();
        }
        let engine = LogEngine::open(dir.path(), 3600, false, clock).unwrap();
        assert_eq!(
            scan_all(&engine),
            vec![(b"a".to_vec(), b"9".to_vec()), (b"c".to_vec(), b"3".to_vec())]
        );
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        {
            let engine = LogEngine::open(dir.path(), 3600, false, clock.clone()).unwrap();
            engine.put(b"k", b"v").unwrap();
            engine.close().unwrap();
        }
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let engine = LogEngine::open(dir.path(), 3600, false, clock).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
        // the log is writable again after the cut
        engine.put(b"k2", b"v2").unwrap();
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_compaction_expires_by_write_time() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let engine = LogEngine::open(dir.path(), 600, false, clock.clone()).unwrap();
        engine.put(b"old", b"1").unwrap();
        clock.advance(500);
        engine.put(b"new", b"2").unwrap();
        clock.advance(200);

        // reads do not filter by TTL
        assert!(engine.get(b"old").unwrap().is_some());
        assert_eq!(engine.compact().unwrap(), 1);
        assert!(engine.get(b"old").unwrap().is_none());
        assert!(engine.get(b"new").unwrap().is_some());
        engine.close().unwrap();

        let reopened = LogEngine::open(dir.path(), 600, false, clock).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_closed_engine_rejects_access() {
        let engine = LogEngine::in_memory(60);
        engine.put(b"a", b"1").unwrap();
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.put(b"b", b"2"), Err(TierError::Shutdown)));
        assert!(matches!(engine.get(b"a"), Err(TierError::Shutdown)));
    }

    #[test]
    fn test_scan_bounds() {
        let engine = LogEngine::in_memory(60);
        for k in [b"a", b"b", b"c", b"d"] {
            engine.put(k, b"x").unwrap();
        }
        let keys = |from: Option<&[u8]>, chunk| -> Vec<Vec<u8>> {
            engine
                .scan(from, chunk)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect()
        };
        assert_eq!(
            keys(Some(&b"b"[..]), 2),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(keys(Some(&b"bb"[..]), 1), vec![b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(keys(None, 10).len(), 4);
    }

    #[test]
    fn test_open_cursor_does_not_block_writers() {
        let engine = LogEngine::in_memory(60);
        for k in [b"a", b"b", b"c"] {
            engine.put(k, b"x").unwrap();
        }
        let mut cursor = engine.scan(None, 1).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().0, b"a".to_vec());
        // written past the cursor position, seen by the next chunk
        engine.put(b"bb", b"y").unwrap();
        let rest: Vec<Vec<u8>> = cursor.map(|r| r.unwrap().0).collect();
        assert_eq!(rest, vec![b"b".to_vec(), b"bb".to_vec(), b"c".to_vec()]);
        engine.close().unwrap();
        assert!(matches!(engine.scan(None, 1), Err(TierError::Shutdown)));
    }
}
