//! The inference backend capability and the stage result envelope.
//!
//! A run selects one [`Backend`] and hands every inference stage to it
//! as a [`Job`]. Synchronous backends answer with
//! [`Submission::Completed`]; asynchronous ones answer with
//! [`Submission::Dispatched`] and deliver the envelope later through
//! [`Backend::poll`] or [`Backend::wait`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{HeartSegmentation, Mask, ModelRef, PipelineError, ViewBoxes, Voxels};

/// What a backend is asked to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Heart segmentation of the volume or of its sampled slices.
    SegmentHeart,
    /// Calcification segmentation of the (possibly cropped) volume.
    SegmentCalcifications,
    /// Segment the sampled slices and return per-view boxes only.
    LocateAndCrop,
}

impl Task {
    /// Stable lowercase name, used in logs and on the worker wire.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SegmentHeart => "segment_heart",
            Self::SegmentCalcifications => "segment_calcifications",
            Self::LocateAndCrop => "locate_and_crop",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One unit of work for a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// What to compute.
    pub task: Task,
    /// Input voxels.
    pub voxels: Voxels,
    /// Model to run.
    pub model: ModelRef,
    /// Only segment the sampled slices.
    pub partial: bool,
}

/// A value stored in a [`StageEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeValue {
    /// A heart or calcification segmentation.
    Segmentation(HeartSegmentation),
    /// Elapsed seconds reported by the backend.
    Seconds(f64),
    /// Per-view boxes from locate-and-crop.
    Coordinates(ViewBoxes),
}

/// Named outputs of a completed backend call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageEnvelope {
    entries: BTreeMap<String, EnvelopeValue>,
}

impl StageEnvelope {
    /// Segmentation output.
    pub const SEGMENTATION: &str = "Segmentation";
    /// Backend time of a segmentation.
    pub const SEGMENTATION_TIME: &str = "SegmentationTime";
    /// Per-view boxes of a locate-and-crop.
    pub const COORDINATES: &str = "Coordinates";
    /// Backend time of a locate-and-crop.
    pub const SEG_AND_CROP_TIME: &str = "SegAndCropTime";

    /// An empty envelope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelope of a segmentation task.
    #[must_use]
    pub fn segmentation(segmentation: HeartSegmentation, seconds: f64) -> Self {
        Self::new()
            .with(Self::SEGMENTATION, EnvelopeValue::Segmentation(segmentation))
            .with(Self::SEGMENTATION_TIME, EnvelopeValue::Seconds(seconds))
    }

    /// Envelope of a locate-and-crop task.
    #[must_use]
    pub fn located(boxes: ViewBoxes, seconds: f64) -> Self {
        Self::new()
            .with(Self::COORDINATES, EnvelopeValue::Coordinates(boxes))
            .with(Self::SEG_AND_CROP_TIME, EnvelopeValue::Seconds(seconds))
    }

    /// Add or replace an entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: EnvelopeValue) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&EnvelopeValue> {
        self.entries.get(key)
    }

    /// Entry names, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Remove and return the segmentation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Protocol`] if the envelope has no
    /// segmentation.
    pub fn take_segmentation(&mut self) -> Result<HeartSegmentation, PipelineError> {
        match self.entries.remove(Self::SEGMENTATION) {
            Some(EnvelopeValue::Segmentation(s)) => Ok(s),
            _ => Err(missing(Self::SEGMENTATION)),
        }
    }

    /// Remove and return a full-volume mask.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Protocol`] if the envelope has no
    /// segmentation or only a partial one.
    pub fn take_mask(&mut self) -> Result<Mask, PipelineError> {
        match self.take_segmentation()? {
            HeartSegmentation::Full(mask) => Ok(mask),
            HeartSegmentation::Partial(_) => Err(PipelineError::Protocol(
                "expected a full-volume segmentation, got a partial one".to_string(),
            )),
        }
    }

    /// The per-view boxes of a locate-and-crop.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Protocol`] if the envelope has no
    /// coordinates.
    pub fn coordinates(&self) -> Result<ViewBoxes, PipelineError> {
        match self.entries.get(Self::COORDINATES) {
            Some(EnvelopeValue::Coordinates(b)) => Ok(*b),
            _ => Err(missing(Self::COORDINATES)),
        }
    }

    /// Seconds stored under `key`, if present.
    #[must_use]
    pub fn seconds(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(EnvelopeValue::Seconds(s)) => Some(*s),
            _ => None,
        }
    }
}

fn missing(key: &str) -> PipelineError {
    PipelineError::Protocol(format!("result envelope is missing \"{key}\""))
}

/// Outcome of handing a job to a backend.
#[derive(Debug)]
pub enum Submission {
    /// The job ran to completion on the calling thread.
    Completed(StageEnvelope),
    /// The job runs elsewhere; its envelope arrives later.
    Dispatched,
}

/// State of an asynchronous backend.
#[derive(Debug)]
pub enum Poll {
    /// The in-flight job finished.
    Ready(Result<StageEnvelope, PipelineError>),
    /// A job is in flight and has not finished.
    Pending,
    /// Nothing is in flight.
    Idle,
}

/// Inference backend: local, remote, or worker process.
pub trait Backend {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Check the backend can accept work.
    ///
    /// Called once at run start, before any stage runs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BackendUnavailable`] if the backend
    /// cannot be reached.
    fn check_available(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Hand a job to the backend.
    ///
    /// # Errors
    ///
    /// Synchronous backends return the job's failure directly.
    /// Asynchronous backends return only dispatch failures; job
    /// failures arrive through [`poll`](Self::poll).
    fn submit(&mut self, job: Job) -> Result<Submission, PipelineError>;

    /// Check for the completion of a dispatched job without blocking.
    fn poll(&mut self) -> Poll {
        Poll::Idle
    }

    /// Block until the dispatched job completes.
    ///
    /// Returns `None` when nothing is in flight.
    fn wait(&mut self) -> Option<Result<StageEnvelope, PipelineError>> {
        None
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn check_available(&mut self) -> Result<(), PipelineError> {
        (**self).check_available()
    }

    fn submit(&mut self, job: Job) -> Result<Submission, PipelineError> {
        (**self).submit(job)
    }

    fn poll(&mut self) -> Poll {
        (**self).poll()
    }

    fn wait(&mut self) -> Option<Result<StageEnvelope, PipelineError>> {
        (**self).wait()
    }
}
