//! Wire format between the worker backend and the `cascore-worker`
//! process.
//!
//! Each direction is one JSON header line followed by a compressed
//! bundle that runs to the end of the stream. The request bundle holds
//! `VolumeArray`; the response bundle holds `Segmentation`, or `Ax`,
//! `Sag` and `Cor` for a partial segmentation, and is empty for a
//! locate-and-crop or a failure.

use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use cascore_pipeline::backend::{Job, StageEnvelope, Task};
use cascore_pipeline::{
    HeartSegmentation, ModelRef, PartialMask, PipelineConfig, PipelineError, Routes, ViewBoxes,
    Voxels,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, BundleWriter, SEGMENTATION};

/// Request bundle entry holding the input voxels.
pub const VOLUME_ARRAY: &str = "VolumeArray";

/// Header of a worker request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// What to compute.
    pub task: Task,
    /// Model file.
    pub model_path: PathBuf,
    /// Model input shape.
    pub model_shape: [usize; 3],
    /// Run the model in the worker rather than forwarding to a server.
    pub local: bool,
    /// Server to forward to when not local.
    pub server_url: Option<String>,
    /// Segment sampled slices only.
    pub partial: bool,
    /// Server endpoint paths.
    pub routes: Routes,
    /// Server request timeout, seconds.
    pub timeout_secs: u64,
}

impl WorkerRequest {
    /// Header for `job` under `config`.
    #[must_use]
    pub fn new(job: &Job, config: &PipelineConfig) -> Self {
        Self {
            task: job.task,
            model_path: job.model.path.clone(),
            model_shape: job.model.input_shape,
            local: config.location.is_local(),
            server_url: config.location.url().map(str::to_string),
            partial: job.partial,
            routes: config.routes.clone(),
            timeout_secs: config.request_timeout_secs,
        }
    }

    /// Model reference of the request.
    #[must_use]
    pub fn model(&self) -> ModelRef {
        ModelRef::new(self.model_path.clone(), self.model_shape)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Rebuild the job around `voxels`.
    #[must_use]
    pub fn job(&self, voxels: Voxels) -> Job {
        Job {
            task: self.task,
            voxels,
            model: self.model(),
            partial: self.partial,
        }
    }
}

/// Header of a worker response.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Whether the job succeeded.
    pub ok: bool,
    /// Failure of the job.
    pub error: Option<PipelineError>,
    /// Whether the bundle holds a partial segmentation.
    pub partial: bool,
    /// Backend seconds of a segmentation.
    pub segmentation_time: Option<f64>,
    /// Backend seconds of a locate-and-crop.
    pub seg_and_crop_time: Option<f64>,
    /// Per-view boxes of a locate-and-crop.
    pub coordinates: Option<ViewBoxes>,
}

fn io_error(what: &str, e: &std::io::Error) -> PipelineError {
    PipelineError::Protocol(format!("{what}: {e}"))
}

fn write_header<W: Write, T: Serialize>(output: &mut W, header: &T) -> Result<(), PipelineError> {
    serde_json::to_writer(&mut *output, header)
        .map_err(|e| PipelineError::Protocol(format!("cannot encode header: {e}")))?;
    output
        .write_all(b"\n")
        .map_err(|e| io_error("cannot write header", &e))
}

fn read_header<R: BufRead, T: DeserializeOwned>(input: &mut R) -> Result<T, PipelineError> {
    let mut line = String::new();
    let n = input
        .read_line(&mut line)
        .map_err(|e| io_error("cannot read header", &e))?;
    if n == 0 {
        return Err(PipelineError::Protocol("stream ended before the header".to_string()));
    }
    serde_json::from_str(&line).map_err(|e| PipelineError::Protocol(format!("malformed header: {e}")))
}

fn read_rest<R: Read>(input: &mut R) -> Result<Vec<u8>, PipelineError> {
    let mut bytes = Vec::new();
    input
        .read_to_end(&mut bytes)
        .map_err(|e| io_error("cannot read bundle", &e))?;
    Ok(bytes)
}

/// Write a request.
///
/// # Errors
///
/// Returns [`PipelineError::Protocol`] on I/O failure and
/// [`PipelineError::Codec`] if the voxels cannot be bundled.
pub fn write_request<W: Write>(
    mut output: W,
    request: &WorkerRequest,
    voxels: &Voxels,
) -> Result<(), PipelineError> {
    write_header(&mut output, request)?;
    let bundle = BundleWriter::new().with(VOLUME_ARRAY, voxels)?.finish()?;
    output
        .write_all(&bundle)
        .and_then(|()| output.flush())
        .map_err(|e| io_error("cannot write request bundle", &e))
}

/// Read a request.
///
/// # Errors
///
/// Returns [`PipelineError::Protocol`] for a malformed header and
/// [`PipelineError::Codec`] for a malformed bundle.
pub fn read_request<R: BufRead>(mut input: R) -> Result<(WorkerRequest, Voxels), PipelineError> {
    let request: WorkerRequest = read_header(&mut input)?;
    let mut bundle = Bundle::from_bytes(read_rest(&mut input)?)?;
    let voxels = bundle.voxels(VOLUME_ARRAY)?;
    Ok((request, voxels))
}

/// Write the outcome of a job.
///
/// # Errors
///
/// Returns [`PipelineError::Protocol`] on I/O failure and
/// [`PipelineError::Codec`] if a mask cannot be bundled.
pub fn write_response<W: Write>(
    mut output: W,
    result: Result<StageEnvelope, PipelineError>,
) -> Result<(), PipelineError> {
    let mut envelope = match result {
        Ok(envelope) => envelope,
        Err(error) => {
            let header = WorkerResponse {
                error: Some(error),
                ..WorkerResponse::default()
            };
            write_header(&mut output, &header)?;
            return output.flush().map_err(|e| io_error("cannot flush", &e));
        }
    };

    let mut header = WorkerResponse {
        ok: true,
        segmentation_time: envelope.seconds(StageEnvelope::SEGMENTATION_TIME),
        seg_and_crop_time: envelope.seconds(StageEnvelope::SEG_AND_CROP_TIME),
        coordinates: envelope.coordinates().ok(),
        ..WorkerResponse::default()
    };
    let mut bundle = BundleWriter::new();
    if header.coordinates.is_none() {
        match envelope.take_segmentation()? {
            HeartSegmentation::Full(mask) => bundle.add(SEGMENTATION, &mask)?,
            HeartSegmentation::Partial(p) => {
                header.partial = true;
                bundle.add("Ax", &p.axial)?;
                bundle.add("Sag", &p.sagittal)?;
                bundle.add("Cor", &p.coronal)?;
            }
        }
    }
    write_header(&mut output, &header)?;
    output
        .write_all(&bundle.finish()?)
        .and_then(|()| output.flush())
        .map_err(|e| io_error("cannot write response bundle", &e))
}

/// Read a response back into a result envelope.
///
/// A failure reported by the worker comes back as its original
/// [`PipelineError`].
///
/// # Errors
///
/// Returns the worker's error, or [`PipelineError::Protocol`] /
/// [`PipelineError::Codec`] if the response is malformed.
pub fn read_response<R: BufRead>(mut input: R) -> Result<StageEnvelope, PipelineError> {
    let header: WorkerResponse = read_header(&mut input)?;
    if !header.ok {
        return Err(header.error.unwrap_or_else(|| {
            PipelineError::Backend("worker reported a failure without an error".to_string())
        }));
    }
    if let Some(boxes) = header.coordinates {
        return Ok(StageEnvelope::located(
            boxes,
            header.seg_and_crop_time.unwrap_or_default(),
        ));
    }
    let mut bundle = Bundle::from_bytes(read_rest(&mut input)?)?;
    let segmentation = if header.partial {
        HeartSegmentation::Partial(PartialMask {
            axial: bundle.mask("Ax")?,
            sagittal: bundle.mask("Sag")?,
            coronal: bundle.mask("Cor")?,
        })
    } else {
        HeartSegmentation::Full(bundle.mask(SEGMENTATION)?)
    };
    Ok(StageEnvelope::segmentation(
        segmentation,
        header.segmentation_time.unwrap_or_default(),
    ))
}
