use crc32fast::Hasher;

/// Checksum stored alongside every slot key.
#[inline]
#[must_use]
pub fn key_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
