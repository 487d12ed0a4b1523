//! Slice sampler: the three middle slices along each axis.
//!
//! Partial segmentation only looks at 9 slices of the volume. For
//! remote transport each slice is shifted to non-negative values and
//! encoded as a 16-bit grayscale PNG; the shift travels next to it so
//! the receiver can restore the original intensities exactly.

use std::io::Cursor;

use image::{ImageBuffer, ImageFormat, Luma};
use ndarray::{Array2, ArrayView2, Axis, stack};

use crate::types::{PipelineError, Voxels};

/// One of the three anatomical views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    /// Slices along axis 0, planes `(x, y)`.
    Axial,
    /// Slices along axis 1, planes `(z, y)`.
    Sagittal,
    /// Slices along axis 2, planes `(z, x)`.
    Coronal,
}

impl View {
    /// All views in transport order.
    pub const ALL: [Self; 3] = [Self::Axial, Self::Sagittal, Self::Coronal];

    /// Short name used for bundle keys and slice names.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Axial => "Ax",
            Self::Sagittal => "Sag",
            Self::Coronal => "Cor",
        }
    }

    /// Volume axis the view slices along.
    #[must_use]
    pub const fn axis(self) -> usize {
        match self {
            Self::Axial => 0,
            Self::Sagittal => 1,
            Self::Coronal => 2,
        }
    }
}

/// Indices of the three sampled slices along an axis of length
/// `extent`: the midpoint `extent / 2` and its two neighbours.
#[must_use]
pub const fn slice_indices(extent: usize) -> [usize; 3] {
    let mid = extent / 2;
    [mid.saturating_sub(1), mid, mid + 1]
}

/// Raw sampled slices, one `(3, rows, cols)` stack per view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSet {
    /// Axial slices, `(3, x, y)`.
    pub axial: Voxels,
    /// Sagittal slices, `(3, z, y)`.
    pub sagittal: Voxels,
    /// Coronal slices, `(3, z, x)`.
    pub coronal: Voxels,
}

impl SliceSet {
    /// The stack for `view`.
    #[must_use]
    pub const fn view(&self, view: View) -> &Voxels {
        match view {
            View::Axial => &self.axial,
            View::Sagittal => &self.sagittal,
            View::Coronal => &self.coronal,
        }
    }

    /// The 9 slices in deterministic order (view, then offset
    /// ascending), named `Ax1`..`Cor3`.
    pub fn named_slices(&self) -> impl Iterator<Item = (String, ArrayView2<'_, i16>)> {
        View::ALL.into_iter().flat_map(move |view| {
            self.view(view)
                .outer_iter()
                .enumerate()
                .map(move |(i, slice)| (format!("{}{}", view.key(), i + 1), slice))
        })
    }
}

/// Extract the 3 middle slices along every axis.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if any extent is below 3,
/// since the midpoint then has no neighbour on both sides.
pub fn sample_slices(voxels: &Voxels) -> Result<SliceSet, PipelineError> {
    let (z, x, y) = voxels.dim();
    if z < 3 || x < 3 || y < 3 {
        return Err(PipelineError::InvalidConfig(format!(
            "volume {:?} is too small to sample, need at least 3 voxels per axis",
            [z, x, y]
        )));
    }

    let mut stacks = Vec::with_capacity(3);
    for view in View::ALL {
        let axis = Axis(view.axis());
        let indices = slice_indices(voxels.len_of(axis));
        tracing::debug!(view = view.key(), ?indices, "sampling slices");
        let planes: Vec<ArrayView2<'_, i16>> = indices
            .iter()
            .map(|&i| voxels.index_axis(axis, i))
            .collect();
        let stacked = stack(Axis(0), &planes)
            .map_err(|e| PipelineError::Codec(format!("failed to stack slices: {e}")))?;
        stacks.push(stacked);
    }

    let mut stacks = stacks.into_iter();
    match (stacks.next(), stacks.next(), stacks.next()) {
        (Some(axial), Some(sagittal), Some(coronal)) => Ok(SliceSet {
            axial,
            sagittal,
            coronal,
        }),
        _ => Err(PipelineError::Codec("missing slice stack".to_string())),
    }
}

/// Shift a slice to non-negative values.
///
/// Returns the shifted slice and the shift: the slice minimum if it is
/// negative, else `0`. [`shift_decode`] reverses it exactly.
#[must_use]
pub fn shift_encode(slice: ArrayView2<'_, i16>) -> (Array2<u16>, i32) {
    let min = slice.iter().copied().min().map_or(0, i32::from);
    let shift = min.min(0);
    // value - shift lies in [0, 65535] for every i16 value.
    let shifted = slice.mapv(|v| u16::try_from(i32::from(v) - shift).unwrap_or(u16::MAX));
    (shifted, shift)
}

/// Undo [`shift_encode`].
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] if a restored value does not fit
/// in `i16`, which means the shift does not belong to this slice.
pub fn shift_decode(encoded: &Array2<u16>, shift: i32) -> Result<Array2<i16>, PipelineError> {
    let mut out = Array2::<i16>::zeros(encoded.raw_dim());
    for (dst, &src) in out.iter_mut().zip(encoded.iter()) {
        *dst = i16::try_from(i32::from(src) + shift).map_err(|_| {
            PipelineError::Codec(format!("shift {shift} does not match slice values"))
        })?;
    }
    Ok(out)
}

/// Encode a 16-bit slice as a grayscale PNG.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] if the slice is too large or the
/// encoder fails.
pub fn encode_png(slice: &Array2<u16>) -> Result<Vec<u8>, PipelineError> {
    let (rows, cols) = slice.dim();
    let width = u32::try_from(cols).map_err(|e| PipelineError::Codec(e.to_string()))?;
    let height = u32::try_from(rows).map_err(|e| PipelineError::Codec(e.to_string()))?;
    let pixels: Vec<u16> = slice.iter().copied().collect();
    let img = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, pixels)
        .ok_or_else(|| PipelineError::Codec("slice buffer does not match its shape".to_string()))?;

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| PipelineError::Codec(format!("PNG encode failed: {e}")))?;
    Ok(bytes)
}

/// Decode a grayscale PNG back into a 16-bit slice.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] if the bytes are not a PNG.
pub fn decode_png(bytes: &[u8]) -> Result<Array2<u16>, PipelineError> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .map_err(|e| PipelineError::Codec(format!("PNG decode failed: {e}")))?
        .into_luma16();
    let (width, height) = img.dimensions();
    Array2::from_shape_vec((height as usize, width as usize), img.into_raw())
        .map_err(|e| PipelineError::Codec(e.to_string()))
}

/// A slice prepared for image transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSlice {
    /// Slice name, `Ax1`..`Cor3`.
    pub name: String,
    /// PNG bytes of the shifted slice.
    pub png: Vec<u8>,
    /// Shift to add back after decoding.
    pub shift: i32,
}

/// Shift-encode and PNG-encode all 9 slices.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] if PNG encoding fails.
pub fn encode_slices(slices: &SliceSet) -> Result<Vec<EncodedSlice>, PipelineError> {
    slices
        .named_slices()
        .map(|(name, slice)| {
            let (shifted, shift) = shift_encode(slice);
            Ok(EncodedSlice {
                name,
                png: encode_png(&shifted)?,
                shift,
            })
        })
        .collect()
}

/// Rebuild a [`SliceSet`] from the 9 transported slices.
///
/// # Errors
///
/// Returns [`PipelineError::Codec`] if a slice is missing, cannot be
/// decoded, or the slices of one view differ in shape.
pub fn decode_slices(encoded: &[EncodedSlice]) -> Result<SliceSet, PipelineError> {
    let mut views = Vec::with_capacity(3);
    for view in View::ALL {
        let mut planes = Vec::with_capacity(3);
        for i in 1..=3 {
            let name = format!("{}{i}", view.key());
            let slice = encoded
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| PipelineError::Codec(format!("missing slice {name}")))?;
            planes.push(shift_decode(&decode_png(&slice.png)?, slice.shift)?);
        }
        let plane_views: Vec<_> = planes.iter().map(Array2::view).collect();
        views.push(
            stack(Axis(0), &plane_views)
                .map_err(|e| PipelineError::Codec(format!("inconsistent {} slices: {e}", view.key())))?,
        );
    }
    let mut views = views.into_iter();
    match (views.next(), views.next(), views.next()) {
        (Some(axial), Some(sagittal), Some(coronal)) => Ok(SliceSet {
            axial,
            sagittal,
            coronal,
        }),
        _ => Err(PipelineError::Codec("missing slice stack".to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ramp(shape: (usize, usize, usize)) -> Voxels {
        Voxels::from_shape_fn(shape, |(z, x, y)| {
            i16::try_from(z * 100 + x * 10 + y).unwrap() - 500
        })
    }

    #[test]
    fn slice_indices_surround_midpoint() {
        assert_eq!(slice_indices(64), [31, 32, 33]);
        assert_eq!(slice_indices(5), [1, 2, 3]);
        assert_eq!(slice_indices(3), [0, 1, 2]);
    }

    #[test]
    fn sample_shapes_follow_views() {
        let set = sample_slices(&ramp((5, 7, 9))).unwrap();
        assert_eq!(set.axial.dim(), (3, 7, 9));
        assert_eq!(set.sagittal.dim(), (3, 5, 9));
        assert_eq!(set.coronal.dim(), (3, 5, 7));
    }

    #[test]
    fn sampled_values_come_from_middle_slices() {
        let volume = ramp((5, 7, 9));
        let set = sample_slices(&volume).unwrap();
        // Axial offset 0 is z = 2.
        assert_eq!(set.axial[[1, 4, 6]], volume[[2, 4, 6]]);
        // Sagittal offset +1 is x = 4.
        assert_eq!(set.sagittal[[2, 1, 8]], volume[[1, 4, 8]]);
        // Coronal offset -1 is y = 3.
        assert_eq!(set.coronal[[0, 3, 2]], volume[[3, 2, 3]]);
    }

    #[test]
    fn named_slices_are_ordered() {
        let set = sample_slices(&ramp((4, 4, 4))).unwrap();
        let names: Vec<String> = set.named_slices().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["Ax1", "Ax2", "Ax3", "Sag1", "Sag2", "Sag3", "Cor1", "Cor2", "Cor3"]
        );
    }

    #[test]
    fn tiny_volume_cannot_be_sampled() {
        assert!(sample_slices(&Voxels::zeros((2, 8, 8))).is_err());
    }

    #[test]
    fn shift_is_zero_for_non_negative_slice() {
        let slice = array![[0_i16, 5], [7, 9]];
        let (shifted, shift) = shift_encode(slice.view());
        assert_eq!(shift, 0);
        assert_eq!(shifted, array![[0_u16, 5], [7, 9]]);
    }

    #[test]
    fn shift_round_trips_negative_slice() {
        let slice = array![[-1024_i16, -3], [0, 3071]];
        let (shifted, shift) = shift_encode(slice.view());
        assert_eq!(shift, -1024);
        assert_eq!(shifted[[0, 0]], 0);
        assert_eq!(shift_decode(&shifted, shift).unwrap(), slice);
    }

    #[test]
    fn shift_round_trips_full_i16_range() {
        let slice = array![[i16::MIN, i16::MAX], [-1, 1]];
        let (shifted, shift) = shift_encode(slice.view());
        assert_eq!(shift_decode(&shifted, shift).unwrap(), slice);
    }

    #[test]
    fn wrong_shift_is_detected() {
        let encoded = array![[60_000_u16]];
        assert!(shift_decode(&encoded, 0).is_err());
    }

    #[test]
    fn png_round_trip_is_lossless() {
        let slice = Array2::from_shape_fn((6, 11), |(r, c)| u16::try_from(r * 9000 + c).unwrap());
        let png = encode_png(&slice).unwrap();
        assert_eq!(decode_png(&png).unwrap(), slice);
    }

    #[test]
    fn transported_slices_restore_exactly() {
        let set = sample_slices(&ramp((6, 5, 4))).unwrap();
        let encoded = encode_slices(&set).unwrap();
        assert_eq!(encoded.len(), 9);
        assert_eq!(encoded[0].shift, i32::from(set.axial.iter().copied().min().unwrap()).min(0));
        assert_eq!(decode_slices(&encoded).unwrap(), set);
    }

    #[test]
    fn missing_transported_slice_is_reported() {
        let set = sample_slices(&ramp((4, 4, 4))).unwrap();
        let mut encoded = encode_slices(&set).unwrap();
        encoded.retain(|s| s.name != "Sag2");
        assert!(decode_slices(&encoded).is_err());
    }
}
