mod label;
mod mask;
mod region;

pub use label::{EightConnected, Labeler};
pub use mask::Mask;
pub use region::{BBox, Region};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::base::{BufLoc, Key, Payload};
use crate::error::{Error, Result};

/// Fixed fields at the head of a segment record: key, four u16 bbox
/// fields, area.
const SEGMENT_FIXED: usize = 16;

/// Materialized segment contents.
#[derive(Debug, Clone)]
pub struct SegmentData {
    pub bbox: BBox,
    pub area: u32,
    pub regions: Vec<Region>,
}

/// The full spatial footprint of one identifier: a bounding box in image
/// coordinates, a pixel area, and the disjoint regions covering it.
///
/// Segments read from a file stay unloaded until fetched.
#[derive(Debug, Clone)]
pub struct Segment {
    pub(crate) key: Key,
    pub(crate) state: Payload<SegmentData>,
}

impl Segment {
    /// Assemble from parts. Every region bbox must lie within `bbox`.
    pub fn new(bbox: BBox, area: u32, regions: Vec<Region>) -> Self {
        for region in &regions {
            assert!(
                bbox.contains(&region.bbox()),
                "region bbox outside segment bbox"
            );
        }
        Segment {
            key: 0,
            state: Payload::Loaded(SegmentData { bbox, area, regions }),
        }
    }

    /// Decompose a mask covering `bbox` into connected regions with the
    /// default labeler. Area is the number of set pixels.
    pub fn from_mask(mask: &Mask, bbox: BBox) -> Self {
        Self::from_mask_with(mask, bbox, &EightConnected)
    }

    /// Like [`Segment::from_mask`] with a caller-supplied labeler.
    ///
    /// Component bboxes come back local to the mask and are lifted into
    /// the global frame by the segment origin.
    pub fn from_mask_with(mask: &Mask, bbox: BBox, labeler: &dyn Labeler) -> Self {
        assert_eq!(
            (mask.rows(), mask.cols()),
            (bbox.height(), bbox.width()),
            "mask shape does not match segment bbox"
        );

        let regions = labeler
            .label(mask)
            .into_iter()
            .map(|(local, cropped)| {
                let global = BBox::new(
                    local.minr + bbox.minr,
                    local.minc + bbox.minc,
                    local.maxr + bbox.minr,
                    local.maxc + bbox.minc,
                );
                Region::new(global, cropped)
            })
            .collect();

        Self::new(bbox, mask.count_ones(), regions)
    }

    pub(crate) fn unloaded(key: Key, loc: BufLoc) -> Self {
        Segment {
            key,
            state: Payload::Unloaded(loc),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_loaded()
    }

    /// `None` until fetched.
    pub fn bbox(&self) -> Option<BBox> {
        self.state.get().map(|data| data.bbox)
    }

    /// `None` until fetched.
    pub fn area(&self) -> Option<u32> {
        self.state.get().map(|data| data.area)
    }

    /// `None` until fetched.
    pub fn regions(&self) -> Option<&[Region]> {
        self.state.get().map(|data| data.regions.as_slice())
    }

    /// Reconstruct the full mask over the segment bbox by OR-stamping
    /// each region into its bbox-relative window. `None` until fetched.
    pub fn to_mask(&self) -> Option<Mask> {
        let data = self.state.get()?;
        let mut out = Mask::new(data.bbox.height(), data.bbox.width());

        for region in &data.regions {
            let rb = region.bbox();
            let row0 = (rb.minr - data.bbox.minr) as usize;
            let col0 = (rb.minc - data.bbox.minc) as usize;
            for row in 0..rb.height() {
                for col in 0..rb.width() {
                    if region.mask().get(row, col) {
                        out.set(row0 + row, col0 + col, true);
                    }
                }
            }
        }

        Some(out)
    }
}

pub(crate) fn encode(key: Key, data: &SegmentData, buf: &mut Vec<u8>) {
    buf.write_u32::<LittleEndian>(key).expect("vec write");
    buf.write_u16::<LittleEndian>(data.bbox.minr).expect("vec write");
    buf.write_u16::<LittleEndian>(data.bbox.minc).expect("vec write");
    buf.write_u16::<LittleEndian>(data.bbox.maxr).expect("vec write");
    buf.write_u16::<LittleEndian>(data.bbox.maxc).expect("vec write");
    buf.write_u32::<LittleEndian>(data.area).expect("vec write");
    region::encode_stream(&data.regions, buf);
}

/// Decode one segment record. The stored key must match the lookup
/// table key the record was reached through.
pub(crate) fn decode(buf: &[u8], expected: Key) -> Result<SegmentData> {
    if buf.len() < SEGMENT_FIXED {
        return Err(Error::CorruptLayout(format!(
            "segment record of {} bytes is shorter than its fixed fields",
            buf.len()
        )));
    }

    let mut reader = buf;
    let key = reader.read_u32::<LittleEndian>()?;
    if key != expected {
        return Err(Error::CorruptLayout(format!(
            "segment record stores key {}, reached through key {}",
            key, expected
        )));
    }

    let minr = reader.read_u16::<LittleEndian>()?;
    let minc = reader.read_u16::<LittleEndian>()?;
    let maxr = reader.read_u16::<LittleEndian>()?;
    let maxc = reader.read_u16::<LittleEndian>()?;
    let area = reader.read_u32::<LittleEndian>()?;
    if maxr < minr || maxc < minc {
        return Err(Error::CorruptLayout(format!(
            "inverted segment bbox ({}, {}, {}, {})",
            minr, minc, maxr, maxc
        )));
    }

    let bbox = BBox::new(minr, minc, maxr, maxc);
    let regions = region::decode_stream(&buf[SEGMENT_FIXED..])?;
    for region in &regions {
        if !bbox.contains(&region.bbox()) {
            return Err(Error::CorruptLayout(format!(
                "region bbox {:?} outside segment bbox {:?}",
                region.bbox(),
                bbox
            )));
        }
    }

    Ok(SegmentData { bbox, area, regions })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(segment: &Segment) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(
            segment.key,
            segment.state.get().expect("segment not loaded"),
            &mut buf,
        );
        buf
    }

    #[test]
    fn record_roundtrip() {
        let mask = Mask::from_rows(&[&[true, true], &[true, false]]);
        let mut segment = Segment::from_mask(&mask, BBox::new(0, 0, 2, 2));
        segment.key = 9;

        let buf = encoded(&segment);
        let data = decode(&buf, 9).expect("decode failed");
        assert_eq!(data.bbox, BBox::new(0, 0, 2, 2));
        assert_eq!(data.area, 3);
        assert_eq!(data.regions.len(), 1);
    }

    #[test]
    fn decode_rejects_key_mismatch() {
        let segment = Segment::new(BBox::new(0, 0, 1, 1), 1, Vec::new());
        let buf = encoded(&segment);
        assert!(decode(&buf, 3).is_err());
    }

    #[test]
    fn zero_region_segment() {
        let segment = Segment::new(BBox::new(0, 0, 8, 8), 0, Vec::new());
        let buf = encoded(&segment);
        assert_eq!(buf.len(), SEGMENT_FIXED);

        let data = decode(&buf, 0).expect("decode failed");
        assert!(data.regions.is_empty());
    }

    #[test]
    fn from_mask_splits_islands() {
        let mut mask = Mask::new(4, 4);
        mask.set(0, 0, true);
        mask.set(3, 3, true);

        // Segment placed away from the origin: region bboxes are global.
        let segment = Segment::from_mask(&mask, BBox::new(10, 20, 14, 24));
        let regions = segment.regions().expect("segment not loaded");
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].bbox(), BBox::new(10, 20, 11, 21));
        assert_eq!(regions[1].bbox(), BBox::new(13, 23, 14, 24));
        assert_eq!(segment.area(), Some(2));
    }

    #[test]
    fn to_mask_stamps_regions() {
        let regions = vec![
            Region::new(BBox::new(0, 0, 1, 1), Mask::from_rows(&[&[true]])),
            Region::new(BBox::new(3, 3, 4, 4), Mask::from_rows(&[&[true]])),
        ];
        let segment = Segment::new(BBox::new(0, 0, 4, 4), 2, regions);

        let out = segment.to_mask().expect("segment not loaded");
        for row in 0..4 {
            for col in 0..4 {
                let expected = (row, col) == (0, 0) || (row, col) == (3, 3);
                assert_eq!(out.get(row, col), expected, "pixel ({}, {})", row, col);
            }
        }
    }

    #[test]
    fn mask_decomposition_roundtrip() {
        let mut mask = Mask::new(5, 7);
        mask.set(0, 0, true);
        mask.set(1, 1, true);
        mask.set(4, 6, true);
        mask.set(4, 5, true);

        let segment = Segment::from_mask(&mask, BBox::new(100, 200, 105, 207));
        assert_eq!(segment.to_mask().expect("segment not loaded"), mask);
    }
}
