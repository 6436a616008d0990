use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::segment::mask::{Mask, pack_bits, unpack_bits};

/// Rectangular bounds in image coordinates, row-major, half-open on the
/// high side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BBox {
    pub minr: u16,
    pub minc: u16,
    pub maxr: u16,
    pub maxc: u16,
}

impl BBox {
    pub fn new(minr: u16, minc: u16, maxr: u16, maxc: u16) -> Self {
        assert!(minr <= maxr && minc <= maxc, "inverted bbox");
        BBox { minr, minc, maxr, maxc }
    }

    pub fn height(&self) -> usize {
        (self.maxr - self.minr) as usize
    }

    pub fn width(&self) -> usize {
        (self.maxc - self.minc) as usize
    }

    pub fn contains(&self, other: &BBox) -> bool {
        other.minr >= self.minr
            && other.minc >= self.minc
            && other.maxr <= self.maxr
            && other.maxc <= self.maxc
    }
}

/// Record size up to the start of the mask stream: the self-inclusive
/// length prefix plus four u16 bbox fields.
const REGION_FIXED: usize = 12;

/// One connected sub-tile of a segment: a bbox in the global coordinate
/// frame and the bit-packed mask covering exactly that bbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    bbox: BBox,
    mask: Mask,
}

impl Region {
    /// The mask shape must match the bbox shape.
    pub fn new(bbox: BBox, mask: Mask) -> Self {
        assert_eq!(
            (mask.rows(), mask.cols()),
            (bbox.height(), bbox.width()),
            "mask shape does not match bbox"
        );
        Region { bbox, mask }
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        let packed = pack_bits(self.mask.as_bits());
        buf.write_u32::<LittleEndian>((REGION_FIXED + packed.len()) as u32)
            .expect("vec write");
        buf.write_u16::<LittleEndian>(self.bbox.minr).expect("vec write");
        buf.write_u16::<LittleEndian>(self.bbox.minc).expect("vec write");
        buf.write_u16::<LittleEndian>(self.bbox.maxr).expect("vec write");
        buf.write_u16::<LittleEndian>(self.bbox.maxc).expect("vec write");
        buf.extend_from_slice(&packed);
    }

    /// Decode one record. `buf` must span exactly the record, length
    /// prefix included.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REGION_FIXED {
            return Err(Error::CorruptLayout(format!(
                "region record of {} bytes is shorter than its fixed fields",
                buf.len()
            )));
        }

        let mut reader = buf;
        let total = reader.read_u32::<LittleEndian>()? as usize;
        if total != buf.len() {
            return Err(Error::CorruptLayout(format!(
                "region length prefix {} does not match record of {} bytes",
                total,
                buf.len()
            )));
        }

        let minr = reader.read_u16::<LittleEndian>()?;
        let minc = reader.read_u16::<LittleEndian>()?;
        let maxr = reader.read_u16::<LittleEndian>()?;
        let maxc = reader.read_u16::<LittleEndian>()?;
        if maxr < minr || maxc < minc {
            return Err(Error::CorruptLayout(format!(
                "inverted region bbox ({}, {}, {}, {})",
                minr, minc, maxr, maxc
            )));
        }

        let bbox = BBox::new(minr, minc, maxr, maxc);
        let pixels = bbox.height() * bbox.width();
        let packed = &buf[REGION_FIXED..];
        if packed.len() != pixels.div_ceil(8) {
            return Err(Error::CorruptLayout(format!(
                "region mask stream of {} bytes cannot hold {} pixels",
                packed.len(),
                pixels
            )));
        }

        let mask = Mask::from_bits(bbox.height(), bbox.width(), unpack_bits(packed, pixels));
        Ok(Region { bbox, mask })
    }
}

/// Walk a concatenation of region records until the buffer is exhausted.
pub(crate) fn decode_stream(buf: &[u8]) -> Result<Vec<Region>> {
    let mut regions = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::CorruptLayout(
                "truncated region stream".to_string(),
            ));
        }
        let total = LittleEndian::read_u32(&rest[..4]) as usize;
        if total < REGION_FIXED || total > rest.len() {
            return Err(Error::CorruptLayout(format!(
                "region length prefix {} exceeds remaining {} bytes",
                total,
                rest.len()
            )));
        }
        regions.push(Region::decode(&rest[..total])?);
        rest = &rest[total..];
    }
    Ok(regions)
}

pub(crate) fn encode_stream(regions: &[Region], buf: &mut Vec<u8>) {
    for region in regions {
        region.encode_into(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mask = Mask::from_rows(&[&[true, true], &[true, false]]);
        let region = Region::new(BBox::new(0, 0, 2, 2), mask);

        let mut buf = Vec::new();
        region.encode_into(&mut buf);
        // prefix + bbox + 4 pixels packed into one byte
        assert_eq!(buf.len(), 13);

        let decoded = Region::decode(&buf).expect("decode failed");
        assert_eq!(decoded, region);
    }

    #[test]
    fn wire_pinning() {
        // One row of 13 alternating pixels packs to 0xAA 0xA8; the last
        // three bits of the second byte are padding.
        let bits: Vec<bool> = (0..13).map(|i| i % 2 == 0).collect();
        let region = Region::new(BBox::new(0, 0, 1, 13), Mask::from_bits(1, 13, bits));

        let mut buf = Vec::new();
        region.encode_into(&mut buf);
        assert_eq!(
            buf,
            vec![
                14, 0, 0, 0, // total length, prefix included
                0, 0, 0, 0, 1, 0, 13, 0, // bbox (0, 0, 1, 13)
                0xAA, 0xA8, // packed mask
            ]
        );

        let decoded = Region::decode(&buf).expect("decode failed");
        assert_eq!(decoded.mask().count_ones(), 7);
    }

    #[test]
    fn zero_sized_region() {
        let region = Region::new(BBox::new(3, 3, 3, 7), Mask::new(0, 4));

        let mut buf = Vec::new();
        region.encode_into(&mut buf);
        assert_eq!(buf.len(), REGION_FIXED);

        let decoded = Region::decode(&buf).expect("decode failed");
        assert!(decoded.mask().is_empty());
    }

    #[test]
    fn stream_roundtrip() {
        let a = Region::new(BBox::new(0, 0, 1, 1), Mask::from_rows(&[&[true]]));
        let b = Region::new(BBox::new(3, 3, 4, 4), Mask::from_rows(&[&[true]]));

        let mut buf = Vec::new();
        encode_stream(&[a.clone(), b.clone()], &mut buf);

        let decoded = decode_stream(&buf).expect("decode failed");
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn stream_rejects_bad_prefix() {
        let region = Region::new(BBox::new(0, 0, 1, 1), Mask::from_rows(&[&[true]]));
        let mut buf = Vec::new();
        region.encode_into(&mut buf);
        buf[0] += 1; // prefix now overruns the buffer

        assert!(decode_stream(&buf).is_err());
    }
}
