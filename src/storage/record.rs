//! On-disk archive record layout.
//!
//! Key: metric id (4 or 8 bytes) followed by the interval timestamp (4 bytes),
//! both big-endian. Value: the IEEE-754 bit pattern of the sample (8 bytes).
//! Big-endian unsigned fields make byte-wise comparison of two keys agree with
//! numeric comparison of their `(metric_id, ts)` pairs; range scans and the
//! delete paths depend on that.

use crate::core::{Result, TierError, Timestamp};
use bytes::{Buf, BufMut};
use smallvec::SmallVec;

/// Encoded archive key.
pub type ArchiveKey = SmallVec<[u8; 12]>;

/// Encodes and decodes archive keys for one id width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCodec {
    long_id: bool,
}

impl KeyCodec {
    /// 8-byte ids when `long_id`, 4-byte ids otherwise.
    pub const fn new(long_id: bool) -> Self {
        Self { long_id }
    }

    /// Encoded key length.
    pub const fn key_len(&self) -> usize {
        if self.long_id {
            12
        } else {
            8
        }
    }

    /// Key for `(metric_id, ts)`.
    pub fn encode_key(&self, metric_id: u64, ts: Timestamp) -> Result<ArchiveKey> {
        let mut buf = [0u8; 12];
        let mut out = &mut buf[..];
        if self.long_id {
            out.put_u64(metric_id);
        } else {
            let id = u32::try_from(metric_id).map_err(|_| {
                TierError::storage(format!(
                    "metric id {metric_id} does not fit a 4-byte key, enable long_id"
                ))
            })?;
            out.put_u32(id);
        }
        out.put_u32(ts);
        Ok(SmallVec::from_slice(&buf[..self.key_len()]))
    }

    /// `(metric_id, ts)` back from a key.
    pub fn decode_key(&self, key: &[u8]) -> Result<(u64, Timestamp)> {
        if key.len() != self.key_len() {
            return Err(TierError::corrupt(format!(
                "archive key {} has {} bytes, expected {}",
                hex::encode(key),
                key.len(),
                self.key_len()
            )));
        }
        let mut buf = key;
        let id = if self.long_id {
            buf.get_u64()
        } else {
            u64::from(buf.get_u32())
        };
        Ok((id, buf.get_u32()))
    }

    /// Timestamp part of a key.
    pub fn decode_ts(&self, key: &[u8]) -> Result<Timestamp> {
        self.decode_key(key).map(|(_, ts)| ts)
    }
}

/// Value bytes for a sample.
pub fn encode_value(value: f64) -> [u8; 8] {
    value.to_bits().to_be_bytes()
}

/// Sample from value bytes.
pub fn decode_value(bytes: &[u8]) -> Result<f64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        TierError::corrupt(format!("archive value {} is not 8 bytes", hex::encode(bytes)))
    })?;
    Ok(f64::from_bits(u64::from_be_bytes(raw)))
}
