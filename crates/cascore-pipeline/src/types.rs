//! Shared types for the cascore calcium scoring pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Re-export the array types so downstream crates can reference volumes
/// and masks without depending on `ndarray` directly.
pub use ndarray::{Array2, Array3};

/// Signed CT intensities, indexed `[z, x, y]`.
pub type Voxels = Array3<i16>;

/// Binary mask congruent to a [`Voxels`] array. Elements are `0` or `1`.
pub type Mask = Array3<u8>;

/// Physical size of one voxel step along each array axis, in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelSpacing(pub [f64; 3]);

impl VoxelSpacing {
    /// Volume of a single voxel in mm³.
    #[must_use]
    pub fn voxel_volume(self) -> f64 {
        self.0.iter().product()
    }
}

impl Default for VoxelSpacing {
    fn default() -> Self {
        Self([1.0, 1.0, 1.0])
    }
}

/// Index-to-world placement transform of a volume.
///
/// Owned by the volume host. The pipeline never interprets it; it is
/// handed back unchanged when display nodes are created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement(pub [[f64; 4]; 4]);

impl Default for Placement {
    fn default() -> Self {
        Self([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }
}

/// A CT volume together with the metadata the pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    name: String,
    voxels: Voxels,
    spacing: VoxelSpacing,
    placement: Placement,
}

impl Volume {
    /// Create a new volume.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        voxels: Voxels,
        spacing: VoxelSpacing,
        placement: Placement,
    ) -> Self {
        Self {
            name: name.into(),
            voxels,
            spacing,
            placement,
        }
    }

    /// Host-facing name, used to label display nodes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The voxel array.
    #[must_use]
    pub const fn voxels(&self) -> &Voxels {
        &self.voxels
    }

    /// Voxel spacing in mm.
    #[must_use]
    pub const fn spacing(&self) -> VoxelSpacing {
        self.spacing
    }

    /// The opaque placement transform.
    #[must_use]
    pub const fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Array extents `[z, x, y]`.
    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        let (z, x, y) = self.voxels.dim();
        [z, x, y]
    }

    /// Return a copy of this volume with its voxels replaced.
    ///
    /// Used after cropping: name, spacing and placement carry over.
    #[must_use]
    pub fn with_voxels(&self, voxels: Voxels) -> Self {
        Self {
            name: self.name.clone(),
            voxels,
            spacing: self.spacing,
            placement: self.placement,
        }
    }
}

/// Inclusive region of interest bounds, `0 <= min <= max < extent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiCoordinates {
    /// First slice along axis 0.
    pub z_min: usize,
    /// Last slice along axis 0.
    pub z_max: usize,
    /// First row along axis 1.
    pub x_min: usize,
    /// Last row along axis 1.
    pub x_max: usize,
    /// First column along axis 2.
    pub y_min: usize,
    /// Last column along axis 2.
    pub y_max: usize,
}

impl RoiCoordinates {
    /// Build coordinates from a `[z1, z2, x1, x2, y1, y2]` array.
    #[must_use]
    pub const fn from_array(c: [usize; 6]) -> Self {
        Self {
            z_min: c[0],
            z_max: c[1],
            x_min: c[2],
            x_max: c[3],
            y_min: c[4],
            y_max: c[5],
        }
    }

    /// The bounds as `[z1, z2, x1, x2, y1, y2]`.
    #[must_use]
    pub const fn to_array(self) -> [usize; 6] {
        [
            self.z_min, self.z_max, self.x_min, self.x_max, self.y_min, self.y_max,
        ]
    }

    /// Shape of the region these bounds select.
    #[must_use]
    pub const fn extent(self) -> [usize; 3] {
        [
            self.z_max - self.z_min + 1,
            self.x_max - self.x_min + 1,
            self.y_max - self.y_min + 1,
        ]
    }
}

impl fmt::Display for RoiCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Z->{}:{}, X->{}:{}, Y->{}:{}",
            self.z_min, self.z_max, self.x_min, self.x_max, self.y_min, self.y_max
        )
    }
}

/// Inclusive 2-D bounding box inside one slice plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneBox {
    /// First row.
    pub row_min: usize,
    /// Last row.
    pub row_max: usize,
    /// First column.
    pub col_min: usize,
    /// Last column.
    pub col_max: usize,
}

/// One bounding box per anatomical view, as returned by a
/// locate-and-crop backend.
///
/// Axial planes are `(x, y)`, sagittal planes `(z, y)` and coronal
/// planes `(z, x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewBoxes {
    /// Box in the axial slice set.
    pub axial: PlaneBox,
    /// Box in the sagittal slice set.
    pub sagittal: PlaneBox,
    /// Box in the coronal slice set.
    pub coronal: PlaneBox,
}

/// Segmentation of the 3-slices-per-axis sample set.
///
/// Each stack has shape `(3, rows, cols)` of its view's plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMask {
    /// Axial stack, `(3, x, y)`.
    pub axial: Mask,
    /// Sagittal stack, `(3, z, y)`.
    pub sagittal: Mask,
    /// Coronal stack, `(3, z, x)`.
    pub coronal: Mask,
}

/// Heart segmentation produced by the first pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartSegmentation {
    /// Mask congruent to the full volume.
    Full(Mask),
    /// Masks of the sampled slices only.
    Partial(PartialMask),
}

/// A segmentation model on disk plus the input shape it expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    /// Filesystem path of the model.
    pub path: PathBuf,
    /// Input shape the model was trained on.
    pub input_shape: [usize; 3],
}

impl ModelRef {
    /// Create a model reference.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, input_shape: [usize; 3]) -> Self {
        Self {
            path: path.into(),
            input_shape,
        }
    }

    /// File name of the model, for log and display labels.
    #[must_use]
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    fn exists(&self) -> bool {
        Path::new(&self.path).exists()
    }
}

/// Where inference runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingLocation {
    /// In-process (or in a local worker process).
    #[default]
    Local,
    /// On an inference server reachable over HTTP.
    Remote {
        /// Base URL of the server, e.g. `http://localhost:5000`.
        url: String,
    },
}

impl ProcessingLocation {
    /// Whether this is [`ProcessingLocation::Local`].
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Server URL for remote processing.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Remote { url } => Some(url),
        }
    }
}

/// Endpoint paths on the remote inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routes {
    /// Heart segmentation of the sampled slice set.
    pub segment_slices: String,
    /// Heart segmentation of the full volume.
    pub segment_volume: String,
    /// Combined locate-and-crop.
    pub crop: String,
    /// Calcification segmentation of the full volume.
    pub calcifications_volume: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            segment_slices: "/segment/slices".to_string(),
            segment_volume: "/segment/volume".to_string(),
            crop: "/crop".to_string(),
            calcifications_volume: "/calcifications/volume".to_string(),
        }
    }
}

/// Configuration for one pipeline run.
///
/// Flags map one-to-one onto requested stages. Not every combination
/// is meaningful; [`validate`](Self::validate) rejects the ones the
/// orchestrator cannot drive to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PipelineConfig {
    /// Local or remote inference.
    pub location: ProcessingLocation,

    /// Run backend calls in a separate worker process.
    pub use_subprocess: bool,

    /// Segment only 3 slices per axis. Only good enough to locate the
    /// heart for cropping.
    pub partial: bool,

    /// Crop the working volume to the heart bounding box.
    pub cropping_enabled: bool,

    /// Ask the server for crop coordinates directly instead of a
    /// segmentation.
    pub seg_and_crop: bool,

    /// Create a display node for the heart segmentation.
    pub heart_seg_node: bool,

    /// Also build a 3-D surface for the heart display.
    pub heart_seg_3d: bool,

    /// Detect calcifications and create a display node for them.
    pub cal_seg_node: bool,

    /// Also build a 3-D surface for the calcification display.
    pub cal_seg_3d: bool,

    /// Detect calcifications with the learned model instead of
    /// intensity thresholding.
    pub deep_cal: bool,

    /// Heart localization model.
    pub heart_model: ModelRef,

    /// Calcification model.
    pub cal_model: ModelRef,

    /// Margin added around the heart bounding box, in voxels.
    pub margin: usize,

    /// Intensity threshold for the non-deep calcification detector.
    pub calcium_threshold_hu: i16,

    /// Timeout for a single remote request, in seconds.
    pub request_timeout_secs: u64,

    /// Remote endpoint paths.
    pub routes: Routes,
}

impl PipelineConfig {
    /// Default inference server URL.
    pub const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
    /// Default heart model input shape.
    pub const HEART_MODEL_SHAPE: [usize; 3] = [112, 112, 112];
    /// Default calcification model input shape.
    pub const CAL_MODEL_SHAPE: [usize; 3] = [128, 128, 80];
    /// Default ROI margin.
    pub const DEFAULT_MARGIN: usize = 0;
    /// Default calcium threshold (Hounsfield units).
    pub const DEFAULT_CALCIUM_THRESHOLD_HU: i16 = 130;
    /// Default remote request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

    /// Reject flag combinations the orchestrator cannot complete.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// violated rule.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));
        if self.heart_seg_node && self.partial {
            return fail("heart segmentation display requires a full segmentation");
        }
        if self.heart_seg_node && self.seg_and_crop {
            return fail("heart segmentation display cannot be combined with seg-and-crop");
        }
        if self.partial && !self.cropping_enabled {
            return fail("partial segmentation is only used for cropping");
        }
        if self.seg_and_crop && !(self.partial && self.cropping_enabled) {
            return fail("seg-and-crop requires partial segmentation and cropping");
        }
        if self.seg_and_crop && self.location.is_local() {
            return fail("seg-and-crop is only available with remote processing");
        }
        if self.cal_seg_node && !self.heart_seg_node {
            return fail("calcification display requires the heart segmentation display");
        }
        if self.heart_seg_3d && !self.heart_seg_node {
            return fail("heart 3D surface requires the heart segmentation display");
        }
        if self.cal_seg_3d && !self.cal_seg_node {
            return fail("calcification 3D surface requires the calcification display");
        }
        if let ProcessingLocation::Remote { url } = &self.location
            && url.trim().is_empty()
        {
            return fail("remote processing requires a server URL");
        }
        Ok(())
    }

    /// Check that every model a local run will load exists on disk.
    ///
    /// Remote runs load models on the server and are not checked.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when a required model
    /// path does not exist.
    pub fn check_models(&self) -> Result<(), PipelineError> {
        if !self.location.is_local() {
            return Ok(());
        }
        if self.cal_seg_node && self.deep_cal && !self.cal_model.exists() {
            return Err(PipelineError::InvalidConfig(format!(
                "calcifications model doesn't exist: {}",
                self.cal_model.path.display()
            )));
        }
        if (self.cropping_enabled || self.heart_seg_node) && !self.heart_model.exists() {
            return Err(PipelineError::InvalidConfig(format!(
                "heart segmentation model doesn't exist: {}",
                self.heart_model.path.display()
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            location: ProcessingLocation::Local,
            use_subprocess: true,
            partial: false,
            cropping_enabled: false,
            seg_and_crop: false,
            heart_seg_node: false,
            heart_seg_3d: false,
            cal_seg_node: false,
            cal_seg_3d: false,
            deep_cal: true,
            heart_model: ModelRef::new(
                "Models_Saved/Heart_Localization",
                Self::HEART_MODEL_SHAPE,
            ),
            cal_model: ModelRef::new("Models_Saved/CAC", Self::CAL_MODEL_SHAPE),
            margin: Self::DEFAULT_MARGIN,
            calcium_threshold_hu: Self::DEFAULT_CALCIUM_THRESHOLD_HU,
            request_timeout_secs: Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            routes: Routes::default(),
        }
    }
}

/// Errors that can occur during a pipeline run.
///
/// Serializable so a worker process can report failures back through
/// its response.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration is invalid or a required model is missing.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The remote inference server could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Bounding-box extraction was given a mask with no foreground.
    #[error("segmentation mask is empty, cannot derive a bounding box")]
    EmptyMask,

    /// Two arrays that must be congruent are not.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Shape of the reference array.
        expected: Vec<usize>,
        /// Shape of the offending array.
        found: Vec<usize>,
    },

    /// A backend answered, but the answer was unusable.
    #[error("backend error: {0}")]
    Backend(String),

    /// The segmentation model failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Encoding or decoding of transported data failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A completion arrived that the run was not waiting for, or a
    /// result envelope lacked an expected output.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The display host rejected a request.
    #[error("host error: {0}")]
    Host(String),
}

impl PipelineError {
    /// Build a [`PipelineError::ShapeMismatch`] from two array shapes.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Build the [`PipelineError::InvalidConfig`] for a volume with no
    /// voxels along some axis.
    #[must_use]
    pub fn empty_volume(shape: &[usize]) -> Self {
        Self::InvalidConfig(format!("volume {shape:?} has an empty axis"))
    }
}

/// Serde-compatible proxy for `PipelineError`.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    InvalidConfig(String),
    BackendUnavailable(String),
    EmptyMask,
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    Backend(String),
    Inference(String),
    Codec(String),
    Protocol(String),
    Host(String),
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::InvalidConfig(s) => PipelineErrorProxy::InvalidConfig(s.clone()),
            Self::BackendUnavailable(s) => PipelineErrorProxy::BackendUnavailable(s.clone()),
            Self::EmptyMask => PipelineErrorProxy::EmptyMask,
            Self::ShapeMismatch { expected, found } => PipelineErrorProxy::ShapeMismatch {
                expected: expected.clone(),
                found: found.clone(),
            },
            Self::Backend(s) => PipelineErrorProxy::Backend(s.clone()),
            Self::Inference(s) => PipelineErrorProxy::Inference(s.clone()),
            Self::Codec(s) => PipelineErrorProxy::Codec(s.clone()),
            Self::Protocol(s) => PipelineErrorProxy::Protocol(s.clone()),
            Self::Host(s) => PipelineErrorProxy::Host(s.clone()),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            PipelineErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            PipelineErrorProxy::BackendUnavailable(s) => Self::BackendUnavailable(s),
            PipelineErrorProxy::EmptyMask => Self::EmptyMask,
            PipelineErrorProxy::ShapeMismatch { expected, found } => {
                Self::ShapeMismatch { expected, found }
            }
            PipelineErrorProxy::Backend(s) => Self::Backend(s),
            PipelineErrorProxy::Inference(s) => Self::Inference(s),
            PipelineErrorProxy::Codec(s) => Self::Codec(s),
            PipelineErrorProxy::Protocol(s) => Self::Protocol(s),
            PipelineErrorProxy::Host(s) => Self::Host(s),
        })
    }
}
