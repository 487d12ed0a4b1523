//! Calcification quantifier.

use crate::types::{Mask, PipelineError, VoxelSpacing};

/// Calcifications restricted to a region of interest, with their
/// physical volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantification {
    /// Calcification mask ANDed with the ROI mask.
    pub masked: Mask,
    /// Number of voxels set in `masked`.
    pub voxel_count: usize,
    /// `voxel_count` times the voxel volume, in mm³.
    pub volume_mm3: f64,
}

/// Intersect a calcification mask with the ROI mask and convert the
/// surviving voxel count to mm³.
///
/// The operation is symmetric in its two mask arguments.
///
/// # Errors
///
/// Returns [`PipelineError::ShapeMismatch`] if the masks are not
/// congruent.
pub fn quantify(
    calcifications: &Mask,
    roi: &Mask,
    spacing: VoxelSpacing,
) -> Result<Quantification, PipelineError> {
    if calcifications.shape() != roi.shape() {
        return Err(PipelineError::shape_mismatch(
            roi.shape(),
            calcifications.shape(),
        ));
    }

    let mut masked = Mask::zeros(roi.raw_dim());
    let mut voxel_count = 0_usize;
    ndarray::Zip::from(&mut masked)
        .and(calcifications)
        .and(roi)
        .for_each(|out, &c, &r| {
            if c != 0 && r != 0 {
                *out = 1;
                voxel_count += 1;
            }
        });

    #[allow(clippy::cast_precision_loss)]
    let volume_mm3 = voxel_count as f64 * spacing.voxel_volume();
    tracing::debug!(voxel_count, volume_mm3, "quantified calcifications");

    Ok(Quantification {
        masked,
        voxel_count,
        volume_mm3,
    })
}
