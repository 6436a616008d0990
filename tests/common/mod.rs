use std::path::PathBuf;

use iidfile::{BBox, Iid, IidFile, Mask, Segment};
use tempfile::TempDir;

/// Isolated directory holding container files for one test.
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        TestDir {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// 2x2 segment at the origin with three pixels set (area 3).
#[allow(dead_code)]
pub fn corner_segment() -> Segment {
    let mask = Mask::from_rows(&[&[true, true], &[true, false]]);
    Segment::from_mask(&mask, BBox::new(0, 0, 2, 2))
}

/// Square segment with every pixel set and the given side, placed at
/// the origin. Area grows with the side, which makes area filters easy
/// to target.
#[allow(dead_code)]
pub fn square_segment(side: u16) -> Segment {
    let mut mask = Mask::new(side as usize, side as usize);
    for row in 0..side as usize {
        for col in 0..side as usize {
            mask.set(row, col, true);
        }
    }
    Segment::from_mask(&mask, BBox::new(0, 0, side, side))
}

/// Container with three entries `x`, `y`, `z` (keys 0, 1, 2).
#[allow(dead_code)]
pub fn xyz_file() -> IidFile {
    let mut file = IidFile::create();
    for bytes in [b"x", b"y", b"z"] {
        file.add(Iid::new(bytes.to_vec()), corner_segment(), None)
            .expect("add failed");
    }
    file
}
