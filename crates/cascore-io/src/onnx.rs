//! ONNX Runtime segmentation models.
//!
//! Models take a single `(1, d0, d1, d2, 1)` float tensor of
//! normalized intensities at their fixed input shape and return
//! per-voxel foreground probabilities of the same spatial shape.
//! Inputs of any other shape are nearest-neighbour resampled to the
//! model shape and the prediction is resampled back.

use cascore_pipeline::{Mask, ModelLoader, ModelRef, PipelineError, Segmenter, Voxels};
use ndarray::{Array3, Array5, ArrayView3, Axis};
use ort::session::Session;
use ort::value::TensorRef;

/// Lower clip bound, in Hounsfield units.
pub const HU_MIN: f32 = -1024.0;
/// Upper clip bound, in Hounsfield units.
pub const HU_MAX: f32 = 3071.0;

const FOREGROUND: f32 = 0.5;

/// Map a voxel to the model's input range.
#[must_use]
pub fn normalize(v: i16) -> f32 {
    let center = f32::midpoint(HU_MIN, HU_MAX);
    let half_range = (HU_MAX - HU_MIN) / 2.0;
    (f32::from(v).clamp(HU_MIN, HU_MAX) - center) / half_range
}

/// Nearest-neighbour resample of `input` to `shape`.
///
/// `input` must have at least one voxel on every axis that `shape`
/// does.
#[must_use]
pub fn resample_nearest<T: Copy>(input: ArrayView3<'_, T>, shape: [usize; 3]) -> Array3<T> {
    let src = input.shape();
    if src == shape {
        return input.to_owned();
    }
    let pick = |i: usize, axis: usize| -> usize {
        // Sample at voxel centres.
        let pos = (i * 2 + 1) * src[axis] / (shape[axis] * 2);
        pos.min(src[axis] - 1)
    };
    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(a, b, c)| {
        input[[pick(a, 0), pick(b, 1), pick(c, 2)]]
    })
}

/// Loads `.onnx` model files.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxModelLoader;

impl ModelLoader for OnnxModelLoader {
    type Model = OnnxSegmenter;

    fn load(&mut self, model: &ModelRef) -> Result<OnnxSegmenter, PipelineError> {
        if !model.path.exists() {
            return Err(PipelineError::InvalidConfig(format!(
                "model not found: {}",
                model.path.display()
            )));
        }
        tracing::info!(model = %model.label(), "loading ONNX model");
        let session = Session::builder()
            .and_then(|b| b.commit_from_file(&model.path))
            .map_err(|e| {
                PipelineError::Inference(format!("cannot load {}: {e}", model.path.display()))
            })?;
        Ok(OnnxSegmenter {
            session,
            input_shape: model.input_shape,
        })
    }
}

/// A loaded segmentation model.
pub struct OnnxSegmenter {
    session: Session,
    input_shape: [usize; 3],
}

impl OnnxSegmenter {
    fn input_tensor(&self, input: &Voxels) -> Array5<f32> {
        let normalized = input.mapv(normalize);
        resample_nearest(normalized.view(), self.input_shape)
            .insert_axis(Axis(0))
            .insert_axis(Axis(4))
    }
}

impl Segmenter for OnnxSegmenter {
    fn predict(&mut self, input: &Voxels) -> Result<Mask, PipelineError> {
        if input.is_empty() {
            return Err(PipelineError::empty_volume(input.shape()));
        }
        let tensor_data = self.input_tensor(input);
        let inference = |e: ort::Error| PipelineError::Inference(e.to_string());

        let tensor = TensorRef::from_array_view(tensor_data.view()).map_err(inference)?;
        let outputs = self.session.run(ort::inputs![tensor]).map_err(inference)?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(inference)?;

        let [d0, d1, d2] = self.input_shape;
        let voxels = d0 * d1 * d2;
        if voxels == 0 || data.len() % voxels != 0 {
            return Err(PipelineError::Inference(format!(
                "model output {:?} does not match input shape {:?}",
                shape.as_ref(),
                self.input_shape
            )));
        }
        // Channels-last; the last channel is foreground.
        let channels = data.len() / voxels;
        let probabilities = Array3::from_shape_fn((d0, d1, d2), |(a, b, c)| {
            data[((a * d1 + b) * d2 + c) * channels + channels - 1]
        });
        let mask = probabilities.mapv(|p| u8::from(p > FOREGROUND));
        let (s0, s1, s2) = input.dim();
        Ok(resample_nearest(mask.view(), [s0, s1, s2]))
    }
}
