//! `serve` with a fake model loader.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cascore_io::protocol::{WorkerRequest, read_response, write_request};
use cascore_pipeline::backend::{Job, Task};
use cascore_pipeline::{
    HeartSegmentation, Mask, ModelLoader, ModelRef, PipelineConfig, PipelineError,
    ProcessingLocation, Segmenter, Voxels,
};

/// Marks voxels above 100 HU.
struct Dense;

impl Segmenter for Dense {
    fn predict(&mut self, input: &Voxels) -> Result<Mask, PipelineError> {
        Ok(input.mapv(|v| u8::from(v > 100)))
    }
}

#[derive(Default)]
struct Loader {
    loaded: Vec<ModelRef>,
}

impl ModelLoader for Loader {
    type Model = Dense;

    fn load(&mut self, model: &ModelRef) -> Result<Dense, PipelineError> {
        self.loaded.push(model.clone());
        Ok(Dense)
    }
}

fn heart() -> Voxels {
    let mut v = Voxels::from_elem((10, 12, 14), -50);
    v.slice_mut(ndarray::s![3..7, 4..9, 5..11]).fill(300);
    v
}

fn round_trip(task: Task, partial: bool, config: &PipelineConfig, loader: &mut Loader) -> Vec<u8> {
    let job = Job {
        task,
        voxels: heart(),
        model: ModelRef::new("models/heart.onnx", [112, 112, 112]),
        partial,
    };
    let mut request = Vec::new();
    write_request(&mut request, &WorkerRequest::new(&job, config), &job.voxels).unwrap();
    let mut response = Vec::new();
    cascore_worker::serve(request.as_slice(), &mut response, loader).unwrap();
    response
}

#[test]
fn local_segmentation_uses_the_requested_model() {
    let mut loader = Loader::default();
    let response = round_trip(Task::SegmentHeart, false, &PipelineConfig::default(), &mut loader);
    let mut envelope = read_response(response.as_slice()).unwrap();
    let mask = envelope.take_mask().unwrap();
    assert_eq!(mask.iter().filter(|&&v| v == 1).count(), 4 * 5 * 6);
    assert_eq!(loader.loaded.len(), 1);
    assert_eq!(loader.loaded[0].input_shape, [112, 112, 112]);
}

#[test]
fn local_partial_segmentation_returns_three_views() {
    let mut loader = Loader::default();
    let response = round_trip(Task::SegmentHeart, true, &PipelineConfig::default(), &mut loader);
    let mut envelope = read_response(response.as_slice()).unwrap();
    match envelope.take_segmentation().unwrap() {
        HeartSegmentation::Partial(p) => {
            assert_eq!(p.axial.dim(), (3, 12, 14));
            assert_eq!(p.sagittal.dim(), (3, 10, 14));
            assert_eq!(p.coronal.dim(), (3, 10, 12));
        }
        HeartSegmentation::Full(_) => unreachable!("expected a partial segmentation"),
    }
}

#[test]
fn local_locate_and_crop_returns_boxes() {
    let mut loader = Loader::default();
    let response = round_trip(Task::LocateAndCrop, true, &PipelineConfig::default(), &mut loader);
    let boxes = read_response(response.as_slice())
        .unwrap()
        .coordinates()
        .unwrap();
    // Axial plane is (x, y).
    assert_eq!((boxes.axial.row_min, boxes.axial.row_max), (4, 8));
    assert_eq!((boxes.axial.col_min, boxes.axial.col_max), (5, 10));
}

#[test]
fn forwarding_to_an_unreachable_server_reports_unavailable() {
    let config = PipelineConfig {
        location: ProcessingLocation::Remote {
            url: "http://127.0.0.1:1".to_string(),
        },
        ..PipelineConfig::default()
    };
    let mut loader = Loader::default();
    let response = round_trip(Task::SegmentHeart, false, &config, &mut loader);
    assert!(matches!(
        read_response(response.as_slice()),
        Err(PipelineError::BackendUnavailable(_))
    ));
    assert!(loader.loaded.is_empty());
}

#[test]
fn malformed_request_is_answered_with_an_error() {
    let mut response = Vec::new();
    cascore_worker::serve(&b"not json\n"[..], &mut response, &mut Loader::default()).unwrap();
    let header: serde_json::Value =
        serde_json::from_slice(response.split(|&c| c == b'\n').next().unwrap()).unwrap();
    assert_eq!(header["ok"], false);
    assert!(matches!(
        read_response(response.as_slice()),
        Err(PipelineError::Protocol(_))
    ));
}
