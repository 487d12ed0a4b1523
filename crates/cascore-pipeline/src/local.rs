//! In-process backend.
//!
//! The model runtime is abstracted behind [`ModelLoader`] and
//! [`Segmenter`] so that the core stays free of I/O. The ONNX Runtime
//! loader lives in `cascore-io`; tests plug in deterministic fakes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::backend::{Backend, Job, StageEnvelope, Submission, Task};
use crate::roi::plane_box;
use crate::sampler::sample_slices;
use crate::types::{HeartSegmentation, Mask, ModelRef, PartialMask, PipelineError, ViewBoxes, Voxels};

/// A loaded segmentation model.
pub trait Segmenter {
    /// Predict a binary mask congruent to `input`.
    ///
    /// `input` is either a volume or a `(3, rows, cols)` slice stack.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Inference`] if the model fails.
    fn predict(&mut self, input: &Voxels) -> Result<Mask, PipelineError>;
}

/// Loads segmentation models from disk.
pub trait ModelLoader {
    /// The loaded model type.
    type Model: Segmenter;

    /// Load `model`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the model is missing
    /// and [`PipelineError::Inference`] if it cannot be loaded.
    fn load(&mut self, model: &ModelRef) -> Result<Self::Model, PipelineError>;
}

/// Run one job against a loaded model on the calling thread.
///
/// Shared by [`LocalBackend`] and the worker process.
///
/// # Errors
///
/// Propagates model failures. Returns [`PipelineError::InvalidConfig`]
/// for a volume with an empty axis,
/// [`PipelineError::ShapeMismatch`] if the model returns a mask that
/// does not match its input, and [`PipelineError::EmptyMask`] if a
/// locate-and-crop finds no heart in one of the views.
pub fn execute_job<S: Segmenter + ?Sized>(
    segmenter: &mut S,
    job: &Job,
) -> Result<StageEnvelope, PipelineError> {
    if job.voxels.is_empty() {
        return Err(PipelineError::empty_volume(job.voxels.shape()));
    }
    let start = Instant::now();
    match job.task {
        Task::SegmentHeart | Task::SegmentCalcifications => {
            let segmentation = if job.partial {
                HeartSegmentation::Partial(segment_slices(segmenter, &job.voxels)?)
            } else {
                HeartSegmentation::Full(predict_checked(segmenter, &job.voxels)?)
            };
            Ok(StageEnvelope::segmentation(
                segmentation,
                start.elapsed().as_secs_f64(),
            ))
        }
        Task::LocateAndCrop => {
            let partial = segment_slices(segmenter, &job.voxels)?;
            let boxes = ViewBoxes {
                axial: plane_box(partial.axial.view()).ok_or(PipelineError::EmptyMask)?,
                sagittal: plane_box(partial.sagittal.view()).ok_or(PipelineError::EmptyMask)?,
                coronal: plane_box(partial.coronal.view()).ok_or(PipelineError::EmptyMask)?,
            };
            Ok(StageEnvelope::located(boxes, start.elapsed().as_secs_f64()))
        }
    }
}

fn segment_slices<S: Segmenter + ?Sized>(
    segmenter: &mut S,
    voxels: &Voxels,
) -> Result<PartialMask, PipelineError> {
    let slices = sample_slices(voxels)?;
    Ok(PartialMask {
        axial: predict_checked(segmenter, &slices.axial)?,
        sagittal: predict_checked(segmenter, &slices.sagittal)?,
        coronal: predict_checked(segmenter, &slices.coronal)?,
    })
}

fn predict_checked<S: Segmenter + ?Sized>(
    segmenter: &mut S,
    input: &Voxels,
) -> Result<Mask, PipelineError> {
    let mask = segmenter.predict(input)?;
    if mask.shape() != input.shape() {
        return Err(PipelineError::shape_mismatch(input.shape(), mask.shape()));
    }
    Ok(mask)
}

/// Synchronous in-process backend.
///
/// Models are loaded on first use and kept for the lifetime of the
/// backend.
pub struct LocalBackend<L: ModelLoader> {
    loader: L,
    models: HashMap<PathBuf, L::Model>,
}

impl<L: ModelLoader> LocalBackend<L> {
    /// Create a backend that loads models through `loader`.
    #[must_use]
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            models: HashMap::new(),
        }
    }

    fn model(&mut self, model: &ModelRef) -> Result<&mut L::Model, PipelineError> {
        if !self.models.contains_key(&model.path) {
            tracing::info!(model = %model.label(), "loading model");
            let loaded = self.loader.load(model)?;
            self.models.insert(model.path.clone(), loaded);
        }
        self.models
            .get_mut(&model.path)
            .ok_or_else(|| PipelineError::Inference(format!("model {} not cached", model.label())))
    }
}

impl<L: ModelLoader> Backend for LocalBackend<L> {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&mut self, job: Job) -> Result<Submission, PipelineError> {
        tracing::debug!(task = %job.task, partial = job.partial, "running job in-process");
        let segmenter = self.model(&job.model)?;
        execute_job(segmenter, &job).map(Submission::Completed)
    }
}
