// src/core/cluster/slot.rs

//! Implements the cluster hash slot algorithm and the fixed-size slot bitmap
//! every node carries in its gossip header and persisted configuration.

use bytes::Bytes;
use crc::{CRC_16_XMODEM, Crc};

/// The total number of hash slots in the cluster.
pub const NUM_SLOTS: usize = 16384;

/// The slot bitmap size in bytes, as carried on the wire.
pub const SLOT_BITMAP_LEN: usize = NUM_SLOTS / 8;

/// The CRC16 algorithm used for calculating hash slots.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the hash slot for a given key.
///
/// It first checks for a "hash tag" (a substring enclosed in `{...}`) within
/// the key. If a hash tag is found, only the content within the tag is used
/// for the CRC16 calculation. This allows users to force multiple keys into
/// the same hash slot. If no hash tag is found, the entire key is used.
pub fn get_slot(key: &Bytes) -> u16 {
    // Check for a hash tag, e.g., "user:{123}:name".
    if let Some(start) = key.iter().position(|&b| b == b'{')
        && let Some(end_offset) = key[start + 1..].iter().position(|&b| b == b'}')
    {
        let end = start + 1 + end_offset;
        // Ensure the tag is not empty, e.g., "user:{}".
        if end > start + 1 {
            return CRC16_ALGO.checksum(&key[start + 1..end]) % (NUM_SLOTS as u16);
        }
    }
    // If no valid hash tag is found, hash the entire key.
    CRC16_ALGO.checksum(key) % (NUM_SLOTS as u16)
}

/// A fixed 16384-bit bitmap recording which slots a node claims. The byte
/// layout matches the wire format: slot `s` lives in byte `s / 8`, bit
/// `s % 8` counted from the least significant bit.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: [u8; SLOT_BITMAP_LEN],
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotBitmap({} slots)", self.count())
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: [0u8; SLOT_BITMAP_LEN],
        }
    }

    /// Builds a bitmap from raw wire bytes.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != SLOT_BITMAP_LEN {
            return None;
        }
        let mut bits = [0u8; SLOT_BITMAP_LEN];
        bits.copy_from_slice(raw);
        Some(Self { bits })
    }

    pub fn as_bytes(&self) -> &[u8; SLOT_BITMAP_LEN] {
        &self.bits
    }

    pub fn test(&self, slot: u16) -> bool {
        let slot = slot as usize;
        debug_assert!(slot < NUM_SLOTS);
        self.bits[slot / 8] & (1 << (slot % 8)) != 0
    }

    /// Sets the bit for `slot`, returning the previous value.
    pub fn set(&mut self, slot: u16) -> bool {
        let old = self.test(slot);
        let slot = slot as usize;
        self.bits[slot / 8] |= 1 << (slot % 8);
        old
    }

    /// Clears the bit for `slot`, returning the previous value.
    pub fn clear(&mut self, slot: u16) -> bool {
        let old = self.test(slot);
        let slot = slot as usize;
        self.bits[slot / 8] &= !(1 << (slot % 8));
        old
    }

    /// Number of set bits. Node slot counters must always agree with this.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Iterates over all set slots in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u16> + '_ {
        (0..NUM_SLOTS as u16).filter(move |&s| self.test(s))
    }

    pub fn clear_all(&mut self) {
        self.bits = [0u8; SLOT_BITMAP_LEN];
    }
}

/// Collapses a set of slots into the `N` / `N-M` range notation used by the
/// persisted configuration and operator surfaces.
pub fn format_slot_ranges(slots: &SlotBitmap) -> Vec<String> {
    let mut out = Vec::new();
    let mut run: Option<(u16, u16)> = None;
    for slot in slots.iter_ones() {
        match run {
            Some((start, end)) if slot == end + 1 => run = Some((start, slot)),
            Some((start, end)) => {
                out.push(if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                });
                run = Some((slot, slot));
            }
            None => run = Some((slot, slot)),
        }
    }
    if let Some((start, end)) = run {
        out.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_report_previous_bit() {
        let mut map = SlotBitmap::new();
        assert!(!map.set(42));
        assert!(map.set(42));
        assert_eq!(map.count(), 1);
        assert!(map.clear(42));
        assert!(!map.clear(42));
        assert_eq!(map.count(), 0);
    }

    #[test]
    fn hash_tag_restricts_hashing() {
        let tagged_a = Bytes::from_static(b"user:{123}:name");
        let tagged_b = Bytes::from_static(b"post:{123}:body");
        assert_eq!(get_slot(&tagged_a), get_slot(&tagged_b));
    }

    #[test]
    fn range_formatting_collapses_runs() {
        let mut map = SlotBitmap::new();
        for s in [0u16, 1, 2, 5, 9, 10] {
            map.set(s);
        }
        assert_eq!(format_slot_ranges(&map), vec!["0-2", "5", "9-10"]);
    }
}
