//! cascore-pipeline: coronary calcium scoring pipeline core (sans-IO).
//!
//! Locates the heart in a CT volume, optionally crops the volume to it,
//! detects calcifications and measures their volume:
//! heart segmentation -> coordinates -> crop -> heart display ->
//! calcification segmentation -> quantification -> calcification display.
//!
//! This crate has **no I/O dependencies** -- inference runs behind the
//! [`Backend`] trait and the scene behind the [`Host`] trait. The
//! remote, worker-process and ONNX Runtime implementations live in
//! `cascore-io`.

pub mod backend;
pub mod calcification;
pub mod diagnostics;
pub mod host;
pub mod local;
pub mod orchestrator;
pub mod quantify;
pub mod roi;
pub mod sampler;
pub mod stage;
pub mod types;

pub use backend::{Backend, EnvelopeValue, Job, Poll, StageEnvelope, Submission, Task};
pub use diagnostics::{RunDiagnostics, RunSummary, StageDiagnostics, StageMetrics};
pub use host::Host;
pub use local::{LocalBackend, ModelLoader, Segmenter, execute_job};
pub use orchestrator::{Action, Orchestrator, RunState, RunStatus, next_action};
pub use stage::{ProgressStep, StageId};
pub use types::{
    HeartSegmentation, Mask, ModelRef, PartialMask, PipelineConfig, PipelineError, Placement,
    PlaneBox, ProcessingLocation, RoiCoordinates, Routes, ViewBoxes, Volume, VoxelSpacing, Voxels,
};

/// Run a whole pipeline to completion on the calling thread.
///
/// Starts the run and, while an asynchronous backend call is in
/// flight, blocks on [`Backend::wait`] and resumes. The host receives
/// the same callbacks as with a manually driven [`Orchestrator`].
///
/// # Errors
///
/// Returns the first error of the run. The host has already been
/// notified of it.
pub fn process<B: Backend, H: Host>(
    volume: Volume,
    config: PipelineConfig,
    backend: B,
    host: H,
) -> Result<(RunSummary, H), PipelineError> {
    let mut orchestrator = Orchestrator::new(backend, host);
    let mut status = orchestrator.start(volume, config)?;
    loop {
        match status {
            RunStatus::Waiting => status = orchestrator.wait()?,
            RunStatus::Finished(summary) => {
                let (_, host) = orchestrator.into_parts();
                return Ok((*summary, host));
            }
        }
    }
}
