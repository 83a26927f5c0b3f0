//! Hash slots: key hashing, slot ranges, per-node slot bitmaps and the
//! slot ownership table.
//!
//! Keys hash with CRC16 (XMODEM) into 16384 slots. A `{tag}` inside the key
//! narrows the hashed portion so related keys land together.

use std::fmt;

use crate::{ClusterError, NodeName};

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Size in bytes of a slot bitmap, as carried in every bus header.
pub const SLOT_BITMAP_LEN: usize = SLOT_COUNT as usize / 8;

/// CRC16 lookup table, CCITT polynomial 0x1021.
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];


fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) ^ byte as u16) as usize]
    })
}

/// Returns the part of `key` that is hashed.
///
/// That's the content between the first `{` and the next `}`, unless the
/// braces are missing or enclose nothing, in which case the whole key.
fn hash_input(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

/// Computes the hash slot for a key, in `0..SLOT_COUNT`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_input(key)) % SLOT_COUNT
}

/// Validates an externally supplied slot number.
pub fn check_slot(slot: u32) -> Result<u16, ClusterError> {
    if slot < SLOT_COUNT as u32 {
        Ok(slot as u16)
    } else {
        Err(ClusterError::SlotOutOfRange(slot))
    }
}

/// A contiguous, inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a range after checking `start <= end < SLOT_COUNT`.
    pub fn new(start: u16, end: u16) -> Result<Self, ClusterError> {
        if end >= SLOT_COUNT {
            return Err(ClusterError::SlotOutOfRange(end as u32));
        }
        if start > end {
            return Err(ClusterError::Configuration(format!(
                "slot range {start}-{end} is inverted"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(slot: u16) -> Self {
        Self {
            start: slot,
            end: slot,
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl std::str::FromStr for SlotRange {
    type Err = ClusterError;

    /// Parses `"5"` or `"0-5460"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| ClusterError::Configuration(format!("invalid slot '{part}'")))
                .and_then(check_slot)
        };
        match s.split_once('-') {
            Some((start, end)) => SlotRange::new(parse(start)?, parse(end)?),
            None => Ok(SlotRange::single(parse(s)?)),
        }
    }
}

/// Collapses an ascending sequence of slots into ranges.
fn collect_ranges(slots: impl Iterator<Item = u16>) -> Vec<SlotRange> {
    let mut ranges: Vec<SlotRange> = Vec::new();
    for slot in slots {
        match ranges.last_mut() {
            Some(range) if range.end + 1 == slot => range.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }
    ranges
}

/// One bit per slot: the slots a master serves.
///
/// Byte `slot / 8`, bit `slot % 8`, which is also the wire layout.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: Box<[u8; SLOT_BITMAP_LEN]>,
    count: u16,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0; SLOT_BITMAP_LEN]),
            count: 0,
        }
    }

    /// Builds a bitmap from its wire form. `bytes` must be exactly
    /// [`SLOT_BITMAP_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClusterError> {
        let bits: [u8; SLOT_BITMAP_LEN] = bytes.try_into().map_err(|_| {
            ClusterError::malformed(format!(
                "slot bitmap is {} bytes, expected {SLOT_BITMAP_LEN}",
                bytes.len()
            ))
        })?;
        let count = bits.iter().map(|b| b.count_ones() as u16).sum();
        Ok(Self {
            bits: Box::new(bits),
            count,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits[..]
    }

    pub fn contains(&self, slot: u16) -> bool {
        let slot = slot as usize;
        slot < SLOT_COUNT as usize && self.bits[slot >> 3] & (1 << (slot & 7)) != 0
    }

    /// Sets the bit for `slot`. Returns false if it was already set.
    pub fn insert(&mut self, slot: u16) -> bool {
        if slot >= SLOT_COUNT || self.contains(slot) {
            return false;
        }
        self.bits[slot as usize >> 3] |= 1 << (slot & 7);
        self.count += 1;
        true
    }

    /// Clears the bit for `slot`. Returns false if it wasn't set.
    pub fn remove(&mut self, slot: u16) -> bool {
        if !self.contains(slot) {
            return false;
        }
        self.bits[slot as usize >> 3] &= !(1 << (slot & 7));
        self.count -= 1;
        true
    }

    /// Number of slots set.
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterates the set slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..SLOT_COUNT).filter(move |&slot| self.contains(slot))
    }

    pub fn ranges(&self) -> Vec<SlotRange> {
        collect_ranges(self.iter())
    }
}

impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self.ranges().iter().map(|r| r.to_string()).collect();
        write!(f, "SlotBitmap({} slots: [{}])", self.count, ranges.join(" "))
    }
}

impl FromIterator<u16> for SlotBitmap {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut bitmap = SlotBitmap::new();
        for slot in iter {
            bitmap.insert(slot);
        }
        bitmap
    }
}

/// Maps each of the 16384 slots to an optional node.
///
/// Used for the ownership table as well as the migrating/importing markers.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: Box<[Option<NodeName>]>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    pub fn get(&self, slot: u16) -> Option<NodeName> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// Sets or clears the entry for `slot`, returning the previous value.
    pub fn set(&mut self, slot: u16, node: Option<NodeName>) -> Option<NodeName> {
        match self.slots.get_mut(slot as usize) {
            Some(entry) => std::mem::replace(entry, node),
            None => None,
        }
    }

    /// Clears every entry pointing at `node`.
    pub fn clear_node(&mut self, node: &NodeName) {
        for entry in self.slots.iter_mut() {
            if entry.as_ref() == Some(node) {
                *entry = None;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn assigned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Iterates `(slot, node)` for every set entry.
    pub fn iter(&self) -> impl Iterator<Item = (u16, NodeName)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.map(|n| (slot as u16, n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // vectors checked against CLUSTER KEYSLOT
    #[test]
    fn crc16_matches_reference() {
        assert_eq!(key_slot(b""), 0);
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"hello"), 866);
        assert_eq!(key_slot(b"123456789"), 12739);
    }

    #[test]
    fn hash_tags() {
        assert_eq!(key_slot(b"user:{123}:profile"), key_slot(b"123"));
        assert_eq!(key_slot(b"{user}:123"), key_slot(b"user"));
        assert_eq!(key_slot(b"{a}{b}"), key_slot(b"a"));
        assert_eq!(hash_input(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_input(b"foo{bar"), b"foo{bar");
        assert_eq!(hash_input(b"foo{bar}{zap}"), b"bar");
    }

    #[test]
    fn tagged_keys_share_a_slot() {
        for i in 0..200 {
            let a = format!("{{tag{i}}}:left");
            let b = format!("prefix:{{tag{i}}}:right");
            assert_eq!(key_slot(a.as_bytes()), key_slot(b.as_bytes()));
        }
    }

    #[test]
    fn slot_range_parsing() {
        assert_eq!("0-5460".parse::<SlotRange>().unwrap(), SlotRange::new(0, 5460).unwrap());
        assert_eq!("7".parse::<SlotRange>().unwrap(), SlotRange::single(7));
        assert!("10-5".parse::<SlotRange>().is_err());
        assert!("0-16384".parse::<SlotRange>().is_err());
        assert!("abc".parse::<SlotRange>().is_err());
        assert_eq!(SlotRange::new(0, 5460).unwrap().to_string(), "0-5460");
        assert_eq!(SlotRange::single(100).to_string(), "100");
        assert_eq!(SlotRange::new(0, 5460).unwrap().len(), 5461);
    }

    #[test]
    fn check_slot_bounds() {
        assert_eq!(check_slot(16383).unwrap(), 16383);
        assert!(matches!(check_slot(16384), Err(ClusterError::SlotOutOfRange(16384))));
    }

    #[test]
    fn bitmap_insert_remove_count() {
        let mut bitmap = SlotBitmap::new();
        assert!(bitmap.insert(0));
        assert!(bitmap.insert(9));
        assert!(bitmap.insert(16383));
        assert!(!bitmap.insert(9));
        assert!(!bitmap.insert(SLOT_COUNT));
        assert_eq!(bitmap.count(), 3);

        // byte slot/8, bit slot%8
        assert_eq!(bitmap.as_bytes()[1], 0b0000_0010);
        assert_eq!(bitmap.as_bytes()[SLOT_BITMAP_LEN - 1], 0b1000_0000);

        assert!(bitmap.remove(9));
        assert!(!bitmap.remove(9));
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 16383]);
    }

    #[test]
    fn bitmap_from_bytes_recounts() {
        let original: SlotBitmap = (0..=100).chain(5000..5010).collect();
        let copy = SlotBitmap::from_bytes(original.as_bytes()).unwrap();
        assert_eq!(copy, original);
        assert_eq!(copy.count(), 111);
        assert_eq!(
            copy.ranges(),
            vec![SlotRange::new(0, 100).unwrap(), SlotRange::new(5000, 5009).unwrap()]
        );
        assert!(SlotBitmap::from_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn slot_map_tracks_owners() {
        let a = NodeName::from_bytes([1; 20]);
        let b = NodeName::from_bytes([2; 20]);
        let mut map = SlotMap::new();
        assert!(!map.is_complete());

        for slot in 0..SLOT_COUNT {
            map.set(slot, Some(if slot < 8192 { a } else { b }));
        }
        assert!(map.is_complete());
        assert_eq!(map.get(8191), Some(a));
        assert_eq!(map.set(8192, Some(a)), Some(b));
        assert_eq!(map.iter().filter(|(_, n)| *n == b).count(), 8191);

        map.clear_node(&a);
        assert_eq!(map.assigned_count(), 8191);
        assert_eq!(map.get(0), None);
    }
}
