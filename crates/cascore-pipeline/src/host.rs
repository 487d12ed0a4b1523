//! The volume host: progress display, display nodes and errors.

use crate::diagnostics::RunSummary;
use crate::stage::ProgressStep;
use crate::types::{Mask, PipelineError, Placement, Volume};

/// Collaborator that owns the scene the pipeline reports into.
///
/// Callbacks run on the thread that drives the orchestrator.
pub trait Host {
    /// Progress update for one of the five numbered steps.
    fn report(&mut self, step: ProgressStep, message: &str);

    /// Create a display node for a segmentation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Host`] if the node cannot be created.
    fn create_segmentation_display(
        &mut self,
        mask: &Mask,
        name: &str,
        placement: &Placement,
        surface_3d: bool,
    ) -> Result<(), PipelineError>;

    /// Replace the displayed volume with `volume`, after cropping.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Host`] if the volume cannot be updated.
    fn replace_volume_contents(&mut self, volume: &Volume) -> Result<(), PipelineError>;

    /// The run completed.
    fn finished(&mut self, summary: &RunSummary);

    /// The run was aborted by `error`.
    fn error(&mut self, error: &PipelineError);
}

/// Display name of the heart segmentation of `volume`.
#[must_use]
pub fn heart_display_name(volume: &str) -> String {
    format!("{volume}-Heart")
}

/// Display name of the masked calcifications of `volume`.
#[must_use]
pub fn calcification_display_name(volume: &str) -> String {
    format!("{volume}-CalcificationsMasked")
}
