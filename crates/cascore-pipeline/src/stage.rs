//! Pipeline stage identifiers and progress steps.
//!
//! Each [`StageId`] is one completion marker of a run. The host only
//! sees the coarser [`ProgressStep`], which groups stages the way the
//! progress display numbers them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for one stage of a calcium scoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageId {
    /// Remote locate-and-crop (segmentation and bounding box in one call).
    LocateAndCrop,
    /// Heart segmentation, full or partial.
    HeartSegmentation,
    /// Bounding box extraction and margin.
    Coordinates,
    /// Volume cropped to the ROI.
    Cropping,
    /// Heart display node created.
    HeartDisplay,
    /// Calcification segmentation, learned or thresholded.
    CalcificationSegmentation,
    /// Calcifications masked to the heart and measured.
    Quantification,
    /// Calcification display node created.
    CalcificationDisplay,
}

impl StageId {
    /// All stages in run order.
    pub const ALL: [Self; 8] = [
        Self::LocateAndCrop,
        Self::HeartSegmentation,
        Self::Coordinates,
        Self::Cropping,
        Self::HeartDisplay,
        Self::CalcificationSegmentation,
        Self::Quantification,
        Self::CalcificationDisplay,
    ];

    /// Display label for the stage.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::LocateAndCrop => "Locate & Crop",
            Self::HeartSegmentation => "Heart Segmentation",
            Self::Coordinates => "Coordinates",
            Self::Cropping => "Cropping",
            Self::HeartDisplay => "Heart Display",
            Self::CalcificationSegmentation => "Calcification Segmentation",
            Self::Quantification => "Quantification",
            Self::CalcificationDisplay => "Calcification Display",
        }
    }

    /// Progress step this stage reports under.
    #[must_use]
    pub const fn progress_step(self) -> ProgressStep {
        match self {
            Self::LocateAndCrop | Self::HeartSegmentation => ProgressStep::Segmentation,
            Self::Coordinates | Self::Cropping => ProgressStep::Cropping,
            Self::CalcificationSegmentation => ProgressStep::Calcifications,
            Self::HeartDisplay | Self::CalcificationDisplay => ProgressStep::Visualization,
            Self::Quantification => ProgressStep::Results,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The five numbered steps of the progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressStep {
    /// 1: heart segmentation.
    Segmentation,
    /// 2: cropping.
    Cropping,
    /// 3: calcification detection.
    Calcifications,
    /// 4: display nodes.
    Visualization,
    /// 5: final score.
    Results,
}

impl ProgressStep {
    /// 1-based index shown to the user.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::Segmentation => 1,
            Self::Cropping => 2,
            Self::Calcifications => 3,
            Self::Visualization => 4,
            Self::Results => 5,
        }
    }
}

impl fmt::Display for ProgressStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/5", self.index())
    }
}
