use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Stable entry index into the lookup table.
///
/// Keys are assigned densely in add order and never reused, even after
/// the entry is tombstoned.
pub type Key = u32;

/// Offset/length pair addressing a contiguous byte range.
///
/// Header-level locations are absolute file offsets; per-entry locations
/// are relative to the start of their block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufLoc {
    pub offset: u32,
    pub length: u32,
}

impl BufLoc {
    pub fn new(offset: u32, length: u32) -> Self {
        BufLoc { offset, length }
    }

    /// One past the last byte addressed.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Slice the addressed range out of `buf`, which must be the buffer
    /// the offset is relative to.
    pub fn slice<'a>(&self, buf: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = start + self.length as usize;
        buf.get(start..end).ok_or_else(|| {
            Error::CorruptLayout(format!(
                "range {}..{} exceeds buffer of {} bytes",
                start,
                end,
                buf.len()
            ))
        })
    }

    pub fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.offset)?;
        writer.write_u32::<LittleEndian>(self.length)?;
        Ok(())
    }

    pub fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let offset = reader.read_u32::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;
        Ok(BufLoc { offset, length })
    }
}

/// Fetch state of a lazily materialized payload.
///
/// Fetching transitions `Unloaded` to `Loaded` exactly once; fetching a
/// loaded payload is a no-op, which is what makes repeat fetches cheap.
#[derive(Debug, Clone)]
pub enum Payload<T> {
    /// Still only in the file; location is relative to the owning block.
    Unloaded(BufLoc),
    /// Materialized in memory.
    Loaded(T),
}

impl<T> Payload<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Payload::Loaded(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Payload::Loaded(value) => Some(value),
            Payload::Unloaded(_) => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Payload::Loaded(value) => Some(value),
            Payload::Unloaded(_) => None,
        }
    }

    /// File location, if the payload has not been materialized.
    pub fn loc(&self) -> Option<BufLoc> {
        match self {
            Payload::Unloaded(loc) => Some(*loc),
            Payload::Loaded(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bufloc_roundtrip() {
        let loc = BufLoc::new(48, 120);
        let mut buf = Vec::new();
        loc.encode_into(&mut buf).expect("encode failed");
        assert_eq!(buf.len(), 8);

        let decoded = BufLoc::decode_from(&mut buf.as_slice()).expect("decode failed");
        assert_eq!(decoded, loc);
        assert_eq!(decoded.end(), 168);
    }

    #[test]
    fn bufloc_slice_bounds() {
        let buf = [0u8; 16];
        assert!(BufLoc::new(8, 8).slice(&buf).is_ok());
        assert!(BufLoc::new(8, 9).slice(&buf).is_err());
    }
}
