use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::base::BufLoc;
use crate::error::{Error, Result};

/// Serialized header size: twelve little-endian u32 fields.
pub const HEADER_LEN: usize = 48;

/// The only format version this build reads and writes.
pub const FORMAT_VERSION: u32 = 0;

/// Fixed block at file offset 0 naming the absolute location of every
/// other block.
#[derive(Debug, Clone, Default)]
pub(crate) struct Header {
    pub version: u32,
    /// Reserved for format evolution; carried through opaquely.
    pub rformat: u32,
    pub lut: BufLoc,
    pub iids: BufLoc,
    pub meta: BufLoc,
    pub groups: BufLoc,
    pub segs: BufLoc,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::CorruptLayout(format!(
                "file of {} bytes is shorter than the {}-byte header",
                buf.len(),
                HEADER_LEN
            )));
        }

        let mut reader = &buf[..HEADER_LEN];
        let version = reader.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let rformat = reader.read_u32::<LittleEndian>()?;

        Ok(Header {
            version,
            rformat,
            lut: BufLoc::decode_from(&mut reader)?,
            iids: BufLoc::decode_from(&mut reader)?,
            meta: BufLoc::decode_from(&mut reader)?,
            groups: BufLoc::decode_from(&mut reader)?,
            segs: BufLoc::decode_from(&mut reader)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.write_u32::<LittleEndian>(self.version).expect("vec write");
        buf.write_u32::<LittleEndian>(self.rformat).expect("vec write");
        for loc in [self.lut, self.iids, self.meta, self.groups, self.segs] {
            loc.encode_into(&mut buf).expect("vec write");
        }
        buf
    }

    /// Non-empty blocks must appear in fixed order, contiguous from the
    /// end of the header, and together with it exactly cover the file.
    /// Empty blocks record a zero pair and are skipped.
    pub fn validate(&self, file_len: u64) -> Result<()> {
        let blocks = [
            ("lookup table", self.lut),
            ("identifiers", self.iids),
            ("metadata", self.meta),
            ("groups", self.groups),
            ("segments", self.segs),
        ];

        let mut cursor = HEADER_LEN as u64;
        for (name, loc) in blocks {
            if loc.is_empty() {
                continue;
            }
            if loc.offset as u64 != cursor {
                return Err(Error::CorruptLayout(format!(
                    "{} block at offset {}, expected {}",
                    name, loc.offset, cursor
                )));
            }
            cursor = loc.end();
        }

        if cursor != file_len {
            return Err(Error::CorruptLayout(format!(
                "header and blocks cover {} bytes of a {}-byte file",
                cursor, file_len
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_header_roundtrip() {
        let header = Header::default();
        let buf = header.encode();
        assert_eq!(buf.len(), HEADER_LEN);
        assert!(buf.iter().all(|&b| b == 0));

        let decoded = Header::decode(&buf).expect("decode failed");
        decoded.validate(HEADER_LEN as u64).expect("empty file should validate");
    }

    #[test]
    fn rejects_unknown_version() {
        let mut header = Header::default();
        header.version = 7;
        let buf = header.encode();

        match Header::decode(&buf) {
            Err(Error::UnsupportedVersion(7)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_gapped_blocks() {
        let mut header = Header::default();
        header.lut = BufLoc::new(HEADER_LEN as u32, 20);
        // Gap of 4 bytes between lut and iids.
        header.iids = BufLoc::new(HEADER_LEN as u32 + 24, 12);

        assert!(header.validate(HEADER_LEN as u64 + 36).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut header = Header::default();
        header.lut = BufLoc::new(HEADER_LEN as u32, 20);

        assert!(header.validate(HEADER_LEN as u64 + 20).is_ok());
        assert!(header.validate(HEADER_LEN as u64 + 21).is_err());
    }
}
