//! Partition routing.
//!
//! The partition of an event is `crc32(key) mod partition_count`, where the
//! key is the caller's explicit key or, without one, the JSON-serialized
//! payload. The checksum is the zlib CRC-32 (IEEE polynomial) so that every
//! producer implementation lands a given key on the same partition.

use serde_json::Value;

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// zlib-compatible CRC-32.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Hash used to route an event.
pub fn partition_key(key: Option<&str>, payload: &Value) -> u32 {
    match key {
        Some(key) => crc32(key.as_bytes()),
        None => crc32(payload.to_string().as_bytes()),
    }
}

/// Partition index for one subscriber. A zero count is treated as one.
pub fn partition_index(key_hash: u32, partition_count: u32) -> u32 {
    key_hash % partition_count.max(1)
}

/// Destination partition for every `(service, partition_count)` subscriber.
///
/// Computed per subscriber since services pick their own partition counts.
pub fn route<'a>(
    key_hash: u32,
    subscribers: impl IntoIterator<Item = (&'a str, u32)>,
) -> Vec<(&'a str, u32)> {
    subscribers
        .into_iter()
        .map(|(service, count)| (service, partition_index(key_hash, count)))
        .collect()
}
