//! Binary layout of a shard file.
//!
//! Header (16 bytes):
//! - Magic: 4 bytes (`TLYS`)
//! - Version: 1 byte
//! - Class code: 1 byte (see [`ShardClass::code`])
//! - Reserved: 2 bytes
//! - Used: 4 bytes (little-endian, header plus committed entries)
//! - Reserved: 4 bytes
//!
//! Entry (8-byte aligned):
//! - Key length: 4 bytes (little-endian)
//! - Key CRC32: 4 bytes (little-endian)
//! - Key: `key length` bytes, zero padded to 8-byte alignment
//! - Value: 8 bytes (little-endian f64 bits)
//! - Timestamp: 8 bytes (little-endian, ns since UNIX epoch of last write)
//!
//! A writer fills an entry completely before publishing the new `used`, so
//! readers never trust bytes past it. The file may be longer than `used`
//! (pre-grown capacity) or, after a crash or truncation, shorter.

use crate::checksum::key_checksum;
use crate::{Bound, Component, LabelSet, Result, SampleKey, ShardClass, TallyError};

pub const SHARD_MAGIC: [u8; 4] = *b"TLYS";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 16;
/// Byte offset of the `used` field inside the header.
pub const USED_OFFSET: usize = 8;
pub const ENTRY_PREFIX_SIZE: usize = 8;
/// Value plus timestamp.
pub const SLOT_SIZE: usize = 16;
/// Upper bound on an encoded key; anything larger is treated as garbage.
pub const MAX_KEY_LEN: usize = 64 * 1024;

const TAG_VALUE: u8 = 0;
const TAG_BUCKET: u8 = 1;
const TAG_SUM: u8 = 2;
const TAG_COUNT: u8 = 3;

#[inline]
#[must_use]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Total bytes an entry with a key of `key_len` bytes occupies.
#[inline]
#[must_use]
pub const fn entry_size(key_len: usize) -> usize {
    align8(ENTRY_PREFIX_SIZE + key_len) + SLOT_SIZE
}

/// Offset of the value field for an entry starting at `entry_start`.
#[inline]
#[must_use]
pub const fn value_offset(entry_start: usize, key_len: usize) -> usize {
    entry_start + align8(ENTRY_PREFIX_SIZE + key_len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub class: ShardClass,
    pub used: usize,
}

/// Header of a freshly created shard with no entries.
#[must_use]
pub fn encode_header(class: ShardClass) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[..4].copy_from_slice(&SHARD_MAGIC);
    buf[4] = FORMAT_VERSION;
    buf[5] = class.code();
    buf[USED_OFFSET..USED_OFFSET + 4].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    buf
}

pub fn decode_header(data: &[u8]) -> Result<ShardHeader> {
    if data.len() < HEADER_SIZE {
        return Err(TallyError::BufferTooSmall {
            required: HEADER_SIZE,
            available: data.len(),
        });
    }
    if data[..4] != SHARD_MAGIC {
        return Err(TallyError::InvalidHeader("bad magic".into()));
    }
    if data[4] != FORMAT_VERSION {
        return Err(TallyError::InvalidHeader(format!(
            "unsupported version {}",
            data[4]
        )));
    }
    let class = ShardClass::from_code(data[5])?;
    let used = read_u32(data, USED_OFFSET) as usize;
    if used < HEADER_SIZE {
        return Err(TallyError::InvalidHeader(format!("used {used} below header size")));
    }
    Ok(ShardHeader { class, used })
}

pub fn encode_key(key: &SampleKey) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    put_str(&mut buf, &key.family)?;
    match key.component {
        Component::Value => buf.push(TAG_VALUE),
        Component::Bucket(bound) => {
            buf.push(TAG_BUCKET);
            buf.extend_from_slice(&bound.value().to_bits().to_le_bytes());
        },
        Component::Sum => buf.push(TAG_SUM),
        Component::Count => buf.push(TAG_COUNT),
    }
    let count =
        u16::try_from(key.labels.len()).map_err(|_| TallyError::KeyTooLong(key.labels.len()))?;
    buf.extend_from_slice(&count.to_le_bytes());
    for (name, value) in key.labels.iter() {
        put_str(&mut buf, name)?;
        put_str(&mut buf, value)?;
    }
    if buf.len() > MAX_KEY_LEN {
        return Err(TallyError::KeyTooLong(buf.len()));
    }
    Ok(buf)
}

pub fn decode_key(data: &[u8]) -> Result<SampleKey> {
    let mut cursor = Cursor { data, pos: 0 };
    let family = cursor.string()?;
    let component = match cursor.u8()? {
        TAG_VALUE => Component::Value,
        TAG_BUCKET => Component::Bucket(Bound::new(f64::from_bits(cursor.u64()?))),
        TAG_SUM => Component::Sum,
        TAG_COUNT => Component::Count,
        tag => return Err(cursor.corrupt(format!("unknown component tag {tag}"))),
    };
    let count = cursor.u16()?;
    let mut pairs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = cursor.string()?;
        let value = cursor.string()?;
        pairs.push((name, value));
    }
    if cursor.pos != data.len() {
        return Err(cursor.corrupt("trailing bytes after key".into()));
    }
    let labels = LabelSet::try_from_pairs(pairs).map_err(|e| cursor.corrupt(e.to_string()))?;
    Ok(SampleKey {
        family,
        labels,
        component,
    })
}

/// Complete bytes of a new zero-valued entry for an encoded key.
#[must_use]
pub fn encode_entry(key_bytes: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; entry_size(key_bytes.len())];
    buf[..4].copy_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&key_checksum(key_bytes).to_le_bytes());
    buf[ENTRY_PREFIX_SIZE..ENTRY_PREFIX_SIZE + key_bytes.len()].copy_from_slice(key_bytes);
    buf
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSlot {
    pub key: SampleKey,
    pub value: f64,
    pub timestamp_ns: u64,
    /// Offset of the value field within the shard.
    pub value_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSlot {
    pub offset: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct SlotScan {
    pub slots: Vec<DecodedSlot>,
    pub skipped: Vec<SkippedSlot>,
    /// Byte offset where decoding stopped early, if the tail was unreadable.
    pub truncated_at: Option<usize>,
    /// End of the last entry that was walked, valid or skipped.
    pub end: usize,
}

/// Decode every readable slot of a shard region.
///
/// Fails only when the header itself is unusable. Individual entries with a
/// bad checksum or undecodable key are skipped; an entry that runs past the
/// readable limit ends the scan.
pub fn decode_slots(region: &[u8]) -> Result<(ShardHeader, SlotScan)> {
    let header = decode_header(region)?;
    let limit = header.used.min(region.len());
    let mut scan = SlotScan {
        end: HEADER_SIZE,
        ..SlotScan::default()
    };
    if header.used > region.len() {
        scan.truncated_at = Some(region.len());
    }

    let mut pos = HEADER_SIZE;
    while pos < limit {
        if limit - pos < ENTRY_PREFIX_SIZE {
            scan.truncated_at = Some(pos);
            break;
        }
        let key_len = read_u32(region, pos) as usize;
        let crc = read_u32(region, pos + 4);
        if key_len == 0 || key_len > MAX_KEY_LEN {
            scan.skipped.push(SkippedSlot {
                offset: pos,
                reason: format!("implausible key length {key_len}"),
            });
            scan.truncated_at = Some(pos);
            break;
        }
        let size = entry_size(key_len);
        if pos + size > limit {
            scan.truncated_at = Some(pos);
            break;
        }

        let key_bytes = &region[pos + ENTRY_PREFIX_SIZE..pos + ENTRY_PREFIX_SIZE + key_len];
        let value_at = value_offset(pos, key_len);
        if key_checksum(key_bytes) != crc {
            scan.skipped.push(SkippedSlot {
                offset: pos,
                reason: "key checksum mismatch".into(),
            });
        } else {
            match decode_key(key_bytes) {
                Ok(key) => scan.slots.push(DecodedSlot {
                    key,
                    value: f64::from_bits(read_u64(region, value_at)),
                    timestamp_ns: read_u64(region, value_at + 8),
                    value_offset: value_at,
                }),
                Err(e) => scan.skipped.push(SkippedSlot {
                    offset: pos,
                    reason: e.to_string(),
                }),
            }
        }
        pos += size;
        scan.end = pos;
    }

    Ok((header, scan))
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| TallyError::KeyTooLong(s.len()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(self.corrupt(format!("key ends {n} bytes early")));
        }
        let data = self.data;
        let bytes = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(read_u64(self.take(8)?, 0))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let pos = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TallyError::CorruptSlot {
            offset: pos,
            reason: "key is not valid UTF-8".into(),
        })
    }

    fn corrupt(&self, reason: String) -> TallyError {
        TallyError::CorruptSlot {
            offset: self.pos,
            reason,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::GaugeMode;

    fn shard_with(keys: &[SampleKey]) -> Vec<u8> {
        let mut buf = encode_header(ShardClass::Counter).to_vec();
        for key in keys {
            buf.extend_from_slice(&encode_entry(&encode_key(key).unwrap()));
        }
        let used = buf.len() as u32;
        buf[USED_OFFSET..USED_OFFSET + 4].copy_from_slice(&used.to_le_bytes());
        buf
    }

    fn set_value(buf: &mut [u8], slot: &DecodedSlot, value: f64) {
        let at = slot.value_offset;
        buf[at..at + 8].copy_from_slice(&value.to_bits().to_le_bytes());
    }

    #[test]
    fn test_header_fields() {
        let header = decode_header(&encode_header(ShardClass::Gauge(GaugeMode::Max))).unwrap();
        assert_eq!(header.class, ShardClass::Gauge(GaugeMode::Max));
        assert_eq!(header.used, HEADER_SIZE);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(matches!(
            decode_header(&[0u8; 4]),
            Err(TallyError::BufferTooSmall { .. })
        ));
        assert!(matches!(
            decode_header(&[0xAB; HEADER_SIZE]),
            Err(TallyError::InvalidHeader(_))
        ));
        let mut header = encode_header(ShardClass::Counter);
        header[4] = 9;
        assert!(decode_header(&header).is_err());
    }

    #[test]
    fn test_entries_are_aligned() {
        for key_len in 1..40 {
            assert_eq!(entry_size(key_len) % 8, 0);
            assert_eq!(value_offset(HEADER_SIZE, key_len) % 8, 0);
        }
    }

    #[test]
    fn test_histogram_key_survives_encoding() {
        let labels = LabelSet::new().with("op", "get");
        let key = SampleKey::bucket("latency_seconds", labels, f64::INFINITY);
        let decoded = decode_key(&encode_key(&key).unwrap()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_decode_values() {
        let keys = [
            SampleKey::new("requests_total", LabelSet::new()),
            SampleKey::new("requests_total", LabelSet::new().with("code", "500")),
        ];
        let mut buf = shard_with(&keys);
        let (_, scan) = decode_slots(&buf).unwrap();
        assert_eq!(scan.slots.len(), 2);
        assert!(scan.slots.iter().all(|s| s.value == 0.0));

        let second = scan.slots[1].clone();
        set_value(&mut buf, &second, 7.5);
        let (_, scan) = decode_slots(&buf).unwrap();
        assert_eq!(scan.slots[1].value, 7.5);
        assert_eq!(scan.slots[1].key, keys[1]);
        assert!(scan.truncated_at.is_none());
        assert_eq!(scan.end, buf.len());
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let keys = [
            SampleKey::new("a_total", LabelSet::new()),
            SampleKey::new("b_total", LabelSet::new()),
        ];
        let buf = shard_with(&keys);
        let cut = &buf[..buf.len() - 5];
        let (_, scan) = decode_slots(cut).unwrap();
        assert_eq!(scan.slots.len(), 1);
        assert_eq!(scan.slots[0].key.family, "a_total");
        assert!(scan.truncated_at.is_some());
    }

    #[test]
    fn test_checksum_mismatch_skips_only_that_slot() {
        let keys = [
            SampleKey::new("a_total", LabelSet::new()),
            SampleKey::new("b_total", LabelSet::new()),
            SampleKey::new("c_total", LabelSet::new()),
        ];
        let mut buf = shard_with(&keys);
        // Flip a byte inside the second key.
        let second = HEADER_SIZE + entry_size(encode_key(&keys[0]).unwrap().len());
        buf[second + ENTRY_PREFIX_SIZE + 3] ^= 0xFF;

        let (_, scan) = decode_slots(&buf).unwrap();
        let families: Vec<_> = scan.slots.iter().map(|s| s.key.family.as_str()).collect();
        assert_eq!(families, vec!["a_total", "c_total"]);
        assert_eq!(scan.skipped.len(), 1);
        assert_eq!(scan.skipped[0].offset, second);
    }

    #[test]
    fn test_uncommitted_entry_ignored() {
        let mut buf = shard_with(&[SampleKey::new("a_total", LabelSet::new())]);
        // Entry written but `used` never published.
        buf.extend_from_slice(&encode_entry(
            &encode_key(&SampleKey::new("b_total", LabelSet::new())).unwrap(),
        ));
        let (_, scan) = decode_slots(&buf).unwrap();
        assert_eq!(scan.slots.len(), 1);
        assert!(scan.truncated_at.is_none());
    }

    #[test]
    fn test_zero_length_key_stops_scan() {
        let mut buf = shard_with(&[SampleKey::new("a_total", LabelSet::new())]);
        let start = buf.len();
        buf.extend_from_slice(&[0u8; 32]);
        let used = buf.len() as u32;
        buf[USED_OFFSET..USED_OFFSET + 4].copy_from_slice(&used.to_le_bytes());

        let (_, scan) = decode_slots(&buf).unwrap();
        assert_eq!(scan.slots.len(), 1);
        assert_eq!(scan.truncated_at, Some(start));
    }

    #[test]
    fn test_key_too_long() {
        let key = SampleKey::new("x".repeat(70_000), LabelSet::new());
        assert!(matches!(encode_key(&key), Err(TallyError::KeyTooLong(_))));
    }
}
