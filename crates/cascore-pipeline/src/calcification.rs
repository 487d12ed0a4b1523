//! Intensity-threshold calcification detector.
//!
//! The non-learned alternative to the calcification model: every voxel
//! at or above the threshold is marked, then the mask is dilated once
//! with the 6-connected cross so that small plaques survive the later
//! intersection with the heart mask.

use crate::types::{Mask, Voxels};

/// Offsets of the 6-connected structuring element.
const CROSS: [(isize, isize, isize); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// Mark voxels with intensity `>= threshold` and dilate the result
/// once.
#[must_use = "returns the calcification mask"]
pub fn threshold_calcifications(voxels: &Voxels, threshold: i16) -> Mask {
    let seeds = voxels.mapv(|v| u8::from(v >= threshold));
    dilate(&seeds)
}

/// One binary dilation pass with the 6-connected cross.
#[must_use]
pub fn dilate(mask: &Mask) -> Mask {
    let (nz, nx, ny) = mask.dim();
    let mut out = mask.clone();
    for ((z, x, y), &v) in mask.indexed_iter() {
        if v == 0 {
            continue;
        }
        for (dz, dx, dy) in CROSS {
            let (Some(tz), Some(tx), Some(ty)) = (
                z.checked_add_signed(dz),
                x.checked_add_signed(dx),
                y.checked_add_signed(dy),
            ) else {
                continue;
            };
            if tz < nz && tx < nx && ty < ny {
                out[[tz, tx, ty]] = 1;
            }
        }
    }
    out
}
