use std::collections::BTreeSet;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::base::{BufLoc, Key};
use crate::error::{Error, Result};
use crate::iid::Iid;
use crate::segment::Segment;

/// Fixed stride of one lookup record: key plus two offset/length pairs.
pub(crate) const LUT_STRIDE: usize = 20;

/// One live entry: the identifier and segment sharing a key.
#[derive(Debug, Clone)]
pub struct Entry {
    pub iid: Iid,
    pub seg: Segment,
}

impl Entry {
    pub fn key(&self) -> Key {
        self.iid.key
    }
}

/// Raw record kept for slots excluded by an open-time restriction, so
/// save can rewrite them without ever materializing the entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawRecord {
    pub iid: BufLoc,
    pub seg: BufLoc,
}

#[derive(Debug, Clone)]
pub(crate) enum Slot {
    /// Logically removed. The slot persists so later keys keep their index.
    Tombstone,
    /// Present in the file but excluded from this session's view.
    Skipped(RawRecord),
    Live(Entry),
}

/// The authoritative index: one fixed-stride record per key, in key
/// order. Keys equal the record index and never move.
#[derive(Debug, Default)]
pub struct LookupTable {
    pub(crate) slots: Vec<Slot>,
}

impl LookupTable {
    pub fn new() -> Self {
        LookupTable { slots: Vec::new() }
    }

    /// Total slot count, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Assign the next key and append, writing the key into both halves.
    pub fn append(&mut self, mut iid: Iid, mut seg: Segment) -> Result<Key> {
        if self.slots.len() > u32::MAX as usize {
            return Err(Error::OutOfKeys);
        }

        let key = self.slots.len() as Key;
        iid.key = key;
        seg.key = key;
        self.slots.push(Slot::Live(Entry { iid, seg }));
        Ok(key)
    }

    pub fn get(&self, key: Key) -> Result<&Entry> {
        match self.slots.get(key as usize) {
            Some(Slot::Live(entry)) => Ok(entry),
            _ => Err(Error::UnknownKey(key)),
        }
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Result<&mut Entry> {
        match self.slots.get_mut(key as usize) {
            Some(Slot::Live(entry)) => Ok(entry),
            _ => Err(Error::UnknownKey(key)),
        }
    }

    /// Tombstone the slot. The key is never reused.
    pub fn remove(&mut self, key: Key) -> Result<()> {
        match self.slots.get_mut(key as usize) {
            Some(slot @ Slot::Live(_)) => {
                *slot = Slot::Tombstone;
                Ok(())
            }
            _ => Err(Error::UnknownKey(key)),
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        matches!(self.slots.get(key as usize), Some(Slot::Live(_)))
    }

    pub fn live_keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            matches!(slot, Slot::Live(_)).then_some(index as Key)
        })
    }

    /// Decode the block. An all-zero record is a tombstone. Records
    /// outside `filter` (when given) are kept raw and stay inaccessible
    /// for the life of the instance.
    pub(crate) fn load(buf: &[u8], filter: Option<&BTreeSet<Key>>) -> Result<Self> {
        if buf.len() % LUT_STRIDE != 0 {
            return Err(Error::CorruptLayout(format!(
                "lookup table of {} bytes is not a multiple of the {}-byte stride",
                buf.len(),
                LUT_STRIDE
            )));
        }

        let mut slots = Vec::with_capacity(buf.len() / LUT_STRIDE);
        for (index, record) in buf.chunks_exact(LUT_STRIDE).enumerate() {
            if record.iter().all(|&b| b == 0) {
                slots.push(Slot::Tombstone);
                continue;
            }

            let mut reader = record;
            let key = reader.read_u32::<LittleEndian>()?;
            let iid = BufLoc::decode_from(&mut reader)?;
            let seg = BufLoc::decode_from(&mut reader)?;

            if key as usize != index {
                return Err(Error::CorruptLayout(format!(
                    "lookup record {} stores key {}",
                    index, key
                )));
            }

            if filter.is_some_and(|keys| !keys.contains(&key)) {
                slots.push(Slot::Skipped(RawRecord { iid, seg }));
            } else {
                slots.push(Slot::Live(Entry {
                    iid: Iid::unloaded(key, iid),
                    seg: Segment::unloaded(key, seg),
                }));
            }
        }

        Ok(LookupTable { slots })
    }

    /// Serialize in key order. Non-tombstone records take their payload
    /// locations from the per-key vectors built during the payload pass.
    pub(crate) fn dump(&self, iid_locs: &[BufLoc], seg_locs: &[BufLoc]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.slots.len() * LUT_STRIDE);
        for (index, slot) in self.slots.iter().enumerate() {
            match slot {
                Slot::Tombstone => buf.extend_from_slice(&[0u8; LUT_STRIDE]),
                Slot::Skipped(_) | Slot::Live(_) => {
                    buf.write_u32::<LittleEndian>(index as Key).expect("vec write");
                    iid_locs[index].encode_into(&mut buf).expect("vec write");
                    seg_locs[index].encode_into(&mut buf).expect("vec write");
                }
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::BBox;

    fn entry_parts() -> (Iid, Segment) {
        (Iid::new(b"id".to_vec()), Segment::new(BBox::new(0, 0, 1, 1), 1, Vec::new()))
    }

    #[test]
    fn append_assigns_dense_keys() {
        let mut lut = LookupTable::new();
        for expected in 0..3 {
            let (iid, seg) = entry_parts();
            let key = lut.append(iid, seg).expect("append failed");
            assert_eq!(key, expected);
        }

        let entry = lut.get(1).expect("get failed");
        assert_eq!(entry.key(), 1);
        assert_eq!(entry.iid.key, 1);
        assert_eq!(entry.seg.key, 1);
    }

    #[test]
    fn remove_leaves_tombstone() {
        let mut lut = LookupTable::new();
        for _ in 0..3 {
            let (iid, seg) = entry_parts();
            lut.append(iid, seg).expect("append failed");
        }

        lut.remove(1).expect("remove failed");
        assert_eq!(lut.len(), 3);
        assert!(!lut.contains(1));
        assert!(matches!(lut.get(1), Err(Error::UnknownKey(1))));
        assert!(matches!(lut.remove(1), Err(Error::UnknownKey(1))));
        assert_eq!(lut.live_keys().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn get_out_of_range() {
        let lut = LookupTable::new();
        assert!(matches!(lut.get(0), Err(Error::UnknownKey(0))));
    }

    #[test]
    fn dump_load_roundtrip_with_tombstone() {
        let mut lut = LookupTable::new();
        for _ in 0..3 {
            let (iid, seg) = entry_parts();
            lut.append(iid, seg).expect("append failed");
        }
        lut.remove(1).expect("remove failed");

        let iid_locs = vec![BufLoc::new(0, 10), BufLoc::default(), BufLoc::new(10, 14)];
        let seg_locs = vec![BufLoc::new(0, 16), BufLoc::default(), BufLoc::new(16, 20)];
        let buf = lut.dump(&iid_locs, &seg_locs);
        assert_eq!(buf.len(), 3 * LUT_STRIDE);
        assert!(buf[LUT_STRIDE..2 * LUT_STRIDE].iter().all(|&b| b == 0));

        let loaded = LookupTable::load(&buf, None).expect("load failed");
        assert_eq!(loaded.len(), 3);
        assert!(!loaded.contains(1));

        let entry = loaded.get(2).expect("get failed");
        assert_eq!(entry.key(), 2);
        assert_eq!(entry.iid.state.loc(), Some(BufLoc::new(10, 14)));
        assert_eq!(entry.seg.state.loc(), Some(BufLoc::new(16, 20)));
    }

    #[test]
    fn load_rejects_bad_stride() {
        assert!(LookupTable::load(&[0u8; 21], None).is_err());
    }

    #[test]
    fn load_rejects_misplaced_key() {
        let mut lut = LookupTable::new();
        let (iid, seg) = entry_parts();
        lut.append(iid, seg).expect("append failed");

        let mut buf = lut.dump(&[BufLoc::new(0, 12)], &[BufLoc::new(0, 16)]);
        buf[0] = 9; // key no longer equals its index
        assert!(LookupTable::load(&buf, None).is_err());
    }

    #[test]
    fn load_with_filter_skips_slots() {
        let mut lut = LookupTable::new();
        for _ in 0..2 {
            let (iid, seg) = entry_parts();
            lut.append(iid, seg).expect("append failed");
        }

        let locs = vec![BufLoc::new(0, 12), BufLoc::new(12, 12)];
        let buf = lut.dump(&locs, &locs);

        let filter: BTreeSet<Key> = [1].into_iter().collect();
        let loaded = LookupTable::load(&buf, Some(&filter)).expect("load failed");
        assert!(matches!(loaded.get(0), Err(Error::UnknownKey(0))));
        assert!(loaded.get(1).is_ok());
        // Skipped slots still count toward the table length.
        assert_eq!(loaded.len(), 2);
    }
}
