//! ROI geometry: bounding boxes, margins and cropping.
//!
//! All coordinates are inclusive. A bounding box derived from a mask
//! always satisfies `min <= max < extent` on every axis, and
//! [`apply_margin`] preserves that invariant for any margin.

use ndarray::{Array3, ArrayView3, Axis, s};

use crate::types::{
    HeartSegmentation, Mask, PartialMask, PipelineError, PlaneBox, RoiCoordinates, ViewBoxes,
    Volume,
};

/// Derive ROI coordinates from a heart segmentation.
///
/// Full masks yield their tight bounding box. Partial masks combine the
/// per-view plane boxes (see [`partial_bounding_box`]).
///
/// # Errors
///
/// Returns [`PipelineError::EmptyMask`] if the segmentation has no
/// foreground voxels.
pub fn extract_bounding_box(
    segmentation: &HeartSegmentation,
) -> Result<RoiCoordinates, PipelineError> {
    match segmentation {
        HeartSegmentation::Full(mask) => bounding_box(mask),
        HeartSegmentation::Partial(partial) => partial_bounding_box(partial),
    }
}

/// Tight bounding box of all nonzero voxels in a full-volume mask.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyMask`] if every voxel is zero.
pub fn bounding_box(mask: &Mask) -> Result<RoiCoordinates, PipelineError> {
    let mut lo = [usize::MAX; 3];
    let mut hi = [0_usize; 3];
    let mut any = false;

    for ((z, x, y), &v) in mask.indexed_iter() {
        if v == 0 {
            continue;
        }
        any = true;
        for (axis, idx) in [z, x, y].into_iter().enumerate() {
            lo[axis] = lo[axis].min(idx);
            hi[axis] = hi[axis].max(idx);
        }
    }

    if !any {
        return Err(PipelineError::EmptyMask);
    }
    Ok(RoiCoordinates::from_array([
        lo[0], hi[0], lo[1], hi[1], lo[2], hi[2],
    ]))
}

/// Bounding box of the foreground in a `(slices, rows, cols)` stack,
/// projected onto the slice plane.
#[must_use]
pub fn plane_box(stack: ArrayView3<'_, u8>) -> Option<PlaneBox> {
    let rows = occupied_range(stack, Axis(1))?;
    let cols = occupied_range(stack, Axis(2))?;
    Some(PlaneBox {
        row_min: rows.0,
        row_max: rows.1,
        col_min: cols.0,
        col_max: cols.1,
    })
}

fn occupied_range(stack: ArrayView3<'_, u8>, axis: Axis) -> Option<(usize, usize)> {
    let mut occupied = stack
        .axis_iter(axis)
        .enumerate()
        .filter(|(_, lane)| lane.iter().any(|&v| v != 0))
        .map(|(i, _)| i);
    let first = occupied.next()?;
    let last = occupied.last().unwrap_or(first);
    Some((first, last))
}

/// ROI coordinates from the 3-slices-per-axis segmentation.
///
/// The axial view observes `(x, y)`, the sagittal view `(z, y)` and the
/// coronal view `(z, x)`. Each volume axis is therefore seen by two
/// views, and takes the union of their ranges.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyMask`] if any of the three views has
/// no foreground.
pub fn partial_bounding_box(partial: &PartialMask) -> Result<RoiCoordinates, PipelineError> {
    let boxes = ViewBoxes {
        axial: plane_box(partial.axial.view()).ok_or(PipelineError::EmptyMask)?,
        sagittal: plane_box(partial.sagittal.view()).ok_or(PipelineError::EmptyMask)?,
        coronal: plane_box(partial.coronal.view()).ok_or(PipelineError::EmptyMask)?,
    };
    Ok(roi_from_view_boxes(&boxes))
}

/// Merge per-view plane boxes into volume coordinates.
#[must_use]
pub fn roi_from_view_boxes(boxes: &ViewBoxes) -> RoiCoordinates {
    let ViewBoxes {
        axial,
        sagittal,
        coronal,
    } = boxes;
    RoiCoordinates {
        z_min: sagittal.row_min.min(coronal.row_min),
        z_max: sagittal.row_max.max(coronal.row_max),
        x_min: axial.row_min.min(coronal.col_min),
        x_max: axial.row_max.max(coronal.col_max),
        y_min: axial.col_min.min(sagittal.col_min),
        y_max: axial.col_max.max(sagittal.col_max),
    }
}

/// Grow `coords` by `margin` voxels on every side, clamped to
/// `[0, extent - 1]`.
///
/// Coordinates already outside the volume (for example a box reported
/// by a server for a differently-sized input) are clamped as well.
#[must_use]
pub fn apply_margin(shape: [usize; 3], coords: RoiCoordinates, margin: usize) -> RoiCoordinates {
    let c = coords.to_array();
    let mut out = [0_usize; 6];
    for axis in 0..3 {
        let last = shape[axis].saturating_sub(1);
        let lo = c[2 * axis].saturating_sub(margin).min(last);
        let hi = c[2 * axis + 1].saturating_add(margin).min(last);
        out[2 * axis] = lo.min(hi);
        out[2 * axis + 1] = hi;
    }
    RoiCoordinates::from_array(out)
}

/// Copy the inclusive region `coords` out of `array`.
///
/// The result owns its data; writes to it never reach `array`.
///
/// # Errors
///
/// Returns [`PipelineError::ShapeMismatch`] when `coords` reach outside
/// `array`.
pub fn crop<T: Clone>(array: &Array3<T>, coords: RoiCoordinates) -> Result<Array3<T>, PipelineError> {
    let (z, x, y) = array.dim();
    let needed = [coords.z_max + 1, coords.x_max + 1, coords.y_max + 1];
    if needed[0] > z
        || needed[1] > x
        || needed[2] > y
        || coords.z_min > coords.z_max
        || coords.x_min > coords.x_max
        || coords.y_min > coords.y_max
    {
        return Err(PipelineError::shape_mismatch(&[z, x, y], &needed));
    }
    Ok(array
        .slice(s![
            coords.z_min..=coords.z_max,
            coords.x_min..=coords.x_max,
            coords.y_min..=coords.y_max
        ])
        .to_owned())
}

/// Crop a volume, keeping its name, spacing and placement.
///
/// # Errors
///
/// See [`crop`].
pub fn crop_volume(volume: &Volume, coords: RoiCoordinates) -> Result<Volume, PipelineError> {
    Ok(volume.with_voxels(crop(volume.voxels(), coords)?))
}
