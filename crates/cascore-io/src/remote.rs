//! Remote inference server backend.
//!
//! Requests are blocking and carry a timeout. Full volumes travel as
//! a compressed bundle under `Volume`; sampled slices travel as nine
//! PNG files (`Ax1`..`Cor3`) with their shift values as form fields.

use std::time::{Duration, Instant};

use cascore_pipeline::backend::{Backend, Job, StageEnvelope, Submission, Task};
use cascore_pipeline::sampler::{SliceSet, encode_slices, sample_slices};
use cascore_pipeline::{
    HeartSegmentation, Mask, PartialMask, PipelineConfig, PipelineError, PlaneBox, Routes,
    ViewBoxes, Voxels,
};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use serde::Deserialize;

use crate::bundle::{Bundle, SEGMENTATION, VOLUME, encode_voxels};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend that runs every stage on an inference server over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base: String,
    routes: Routes,
}

/// Body of the `/crop` response.
#[derive(Debug, Deserialize)]
struct CropResponse {
    /// `[axial, sagittal, coronal]`, each `[row_min, row_max, col_min, col_max]`.
    #[serde(rename = "Coor")]
    coor: [[usize; 4]; 3],
}

impl RemoteBackend {
    /// Backend talking to the server at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the URL is empty or
    /// the HTTP client cannot be built.
    pub fn new(url: &str, routes: Routes, timeout: Duration) -> Result<Self, PipelineError> {
        let base = url.trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "remote processing needs a server URL".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base,
            routes,
        })
    }

    /// Backend for the remote location of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` is not
    /// remote.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let url = config.location.url().ok_or_else(|| {
            PipelineError::InvalidConfig("remote backend needs a remote location".to_string())
        })?;
        Self::new(
            url,
            config.routes.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn endpoint(&self, route: &str) -> String {
        if route.starts_with('/') {
            format!("{}{route}", self.base)
        } else {
            format!("{}/{route}", self.base)
        }
    }

    fn post(&self, route: &str, form: Form) -> Result<Response, PipelineError> {
        let url = self.endpoint(route);
        tracing::debug!(%url, "posting to inference server");
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(|e| transport_error(&url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Backend(format!("{url} answered {status}")));
        }
        Ok(response)
    }

    fn post_bundle(&self, route: &str, form: Form) -> Result<Bundle<std::io::Cursor<Vec<u8>>>, PipelineError> {
        let url = self.endpoint(route);
        let body = self
            .post(route, form)?
            .bytes()
            .map_err(|e| PipelineError::Backend(format!("failed to read response from {url}: {e}")))?;
        Ok(Bundle::from_bytes(body.to_vec())?)
    }

    fn volume_form(voxels: &Voxels) -> Result<Form, PipelineError> {
        let part = Part::bytes(encode_voxels(VOLUME, voxels)?)
            .file_name("Volume.npz")
            .mime_str("application/octet-stream")
            .map_err(|e| PipelineError::Codec(e.to_string()))?;
        Ok(Form::new().part(VOLUME, part))
    }

    fn slice_form(slices: &SliceSet) -> Result<Form, PipelineError> {
        let mut form = Form::new();
        for slice in encode_slices(slices)? {
            let part = Part::bytes(slice.png)
                .file_name(format!("{}.png", slice.name))
                .mime_str("image/png")
                .map_err(|e| PipelineError::Codec(e.to_string()))?;
            form = form
                .part(slice.name.clone(), part)
                .text(slice.name, slice.shift.to_string());
        }
        Ok(form)
    }

    /// Full-volume segmentation on `route`.
    fn segment_volume(&self, route: &str, voxels: &Voxels) -> Result<Mask, PipelineError> {
        let mut bundle = self.post_bundle(route, Self::volume_form(voxels)?)?;
        let mask = bundle.mask(SEGMENTATION)?;
        if mask.shape() != voxels.shape() {
            return Err(PipelineError::shape_mismatch(voxels.shape(), mask.shape()));
        }
        Ok(mask)
    }

    /// Heart segmentation of the nine sampled slices.
    fn segment_slices(&self, voxels: &Voxels) -> Result<PartialMask, PipelineError> {
        let slices = sample_slices(voxels)?;
        let mut bundle = self.post_bundle(&self.routes.segment_slices, Self::slice_form(&slices)?)?;
        let mut read = |key: &str, expected: &Voxels| -> Result<Mask, PipelineError> {
            let mask = bundle.mask(key)?;
            if mask.shape() != expected.shape() {
                return Err(PipelineError::shape_mismatch(expected.shape(), mask.shape()));
            }
            Ok(mask)
        };
        Ok(PartialMask {
            axial: read("Ax", &slices.axial)?,
            sagittal: read("Sag", &slices.sagittal)?,
            coronal: read("Cor", &slices.coronal)?,
        })
    }

    /// Combined locate-and-crop: per-view boxes of the sampled slices.
    fn locate(&self, voxels: &Voxels) -> Result<ViewBoxes, PipelineError> {
        let url = self.endpoint(&self.routes.crop);
        let body: CropResponse = self
            .post(&self.routes.crop, Self::slice_form(&sample_slices(voxels)?)?)?
            .json()
            .map_err(|e| PipelineError::Backend(format!("malformed response from {url}: {e}")))?;
        let plane = |[row_min, row_max, col_min, col_max]: [usize; 4]| PlaneBox {
            row_min,
            row_max,
            col_min,
            col_max,
        };
        Ok(ViewBoxes {
            axial: plane(body.coor[0]),
            sagittal: plane(body.coor[1]),
            coronal: plane(body.coor[2]),
        })
    }
}

fn transport_error(url: &str, e: &reqwest::Error) -> PipelineError {
    if e.is_connect() || e.is_timeout() {
        PipelineError::BackendUnavailable(format!("{url}: {e}"))
    } else {
        PipelineError::Backend(format!("{url}: {e}"))
    }
}

impl Backend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn check_available(&mut self) -> Result<(), PipelineError> {
        // Any HTTP answer counts; only transport failures do not.
        self.client
            .get(&self.base)
            .send()
            .map_err(|e| PipelineError::BackendUnavailable(format!("{}: {e}", self.base)))?;
        tracing::debug!(url = %self.base, "inference server reachable");
        Ok(())
    }

    fn submit(&mut self, job: Job) -> Result<Submission, PipelineError> {
        let start = Instant::now();
        tracing::info!(task = %job.task, partial = job.partial, url = %self.base, "sending job to the server");
        let envelope = match job.task {
            Task::SegmentHeart if job.partial => StageEnvelope::segmentation(
                HeartSegmentation::Partial(self.segment_slices(&job.voxels)?),
                start.elapsed().as_secs_f64(),
            ),
            Task::SegmentHeart => StageEnvelope::segmentation(
                HeartSegmentation::Full(self.segment_volume(&self.routes.segment_volume, &job.voxels)?),
                start.elapsed().as_secs_f64(),
            ),
            Task::SegmentCalcifications => StageEnvelope::segmentation(
                HeartSegmentation::Full(
                    self.segment_volume(&self.routes.calcifications_volume, &job.voxels)?,
                ),
                start.elapsed().as_secs_f64(),
            ),
            Task::LocateAndCrop => {
                StageEnvelope::located(self.locate(&job.voxels)?, start.elapsed().as_secs_f64())
            }
        };
        tracing::info!(task = %job.task, seconds = start.elapsed().as_secs_f64(), "received from the server");
        Ok(Submission::Completed(envelope))
    }
}
