//! Integration tests: drive whole runs through the orchestrator with a
//! scripted backend and a recording host.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cascore_pipeline::{
    Backend, HeartSegmentation, Host, Job, Mask, ModelRef, Orchestrator, PartialMask, PipelineConfig,
    PipelineError, Placement, PlaneBox, Poll, ProcessingLocation, ProgressStep, RunStatus,
    RunSummary, Segmenter, StageEnvelope, StageId, StageMetrics, Submission, Task, ViewBoxes,
    Volume, VoxelSpacing, Voxels, execute_job,
};
use ndarray::s;

type Responder = Box<dyn FnMut(&Job) -> Result<StageEnvelope, PipelineError>>;

/// Answers every job from a closure, either synchronously or by
/// queueing the answer for `poll`/`wait`.
struct Scripted {
    respond: Responder,
    asynchronous: bool,
    available: bool,
    calls: Vec<Task>,
    queued: Option<Result<StageEnvelope, PipelineError>>,
}

impl Scripted {
    fn sync(respond: impl FnMut(&Job) -> Result<StageEnvelope, PipelineError> + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            asynchronous: false,
            available: true,
            calls: Vec::new(),
            queued: None,
        }
    }

    fn asynchronous(
        respond: impl FnMut(&Job) -> Result<StageEnvelope, PipelineError> + 'static,
    ) -> Self {
        Self {
            asynchronous: true,
            ..Self::sync(respond)
        }
    }
}

impl Backend for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn check_available(&mut self) -> Result<(), PipelineError> {
        if self.available {
            Ok(())
        } else {
            Err(PipelineError::BackendUnavailable(
                "connection refused".to_string(),
            ))
        }
    }

    fn submit(&mut self, job: Job) -> Result<Submission, PipelineError> {
        self.calls.push(job.task);
        let result = (self.respond)(&job);
        if self.asynchronous {
            self.queued = Some(result);
            Ok(Submission::Dispatched)
        } else {
            result.map(Submission::Completed)
        }
    }

    fn poll(&mut self) -> Poll {
        self.queued.take().map_or(Poll::Idle, Poll::Ready)
    }

    fn wait(&mut self) -> Option<Result<StageEnvelope, PipelineError>> {
        self.queued.take()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Display {
    name: String,
    shape: Vec<usize>,
    foreground: usize,
    surface_3d: bool,
}

#[derive(Default)]
struct Recorder {
    reports: Vec<(u8, String)>,
    displays: Vec<Display>,
    replaced: Vec<[usize; 3]>,
    finished: Vec<RunSummary>,
    errors: Vec<String>,
}

impl Host for Recorder {
    fn report(&mut self, step: ProgressStep, message: &str) {
        self.reports.push((step.index(), message.to_string()));
    }

    fn create_segmentation_display(
        &mut self,
        mask: &Mask,
        name: &str,
        _placement: &Placement,
        surface_3d: bool,
    ) -> Result<(), PipelineError> {
        self.displays.push(Display {
            name: name.to_string(),
            shape: mask.shape().to_vec(),
            foreground: mask.iter().filter(|&&v| v != 0).count(),
            surface_3d,
        });
        Ok(())
    }

    fn replace_volume_contents(&mut self, volume: &Volume) -> Result<(), PipelineError> {
        self.replaced.push(volume.shape());
        Ok(())
    }

    fn finished(&mut self, summary: &RunSummary) {
        self.finished.push(summary.clone());
    }

    fn error(&mut self, error: &PipelineError) {
        self.errors.push(error.to_string());
    }
}

fn volume(shape: (usize, usize, usize)) -> Volume {
    Volume::new(
        "CT",
        Voxels::from_elem(shape, -1000),
        VoxelSpacing::default(),
        Placement::default(),
    )
}

fn box_mask(shape: (usize, usize, usize), roi: [usize; 6]) -> Mask {
    let mut mask = Mask::zeros(shape);
    mask.slice_mut(s![roi[0]..=roi[1], roi[2]..=roi[3], roi[4]..=roi[5]])
        .fill(1);
    mask
}

fn full(mask: Mask) -> StageEnvelope {
    StageEnvelope::segmentation(HeartSegmentation::Full(mask), 0.5)
}

/// Point both model paths at a directory that exists, so the eager
/// model check passes for local runs.
fn with_models(config: PipelineConfig) -> PipelineConfig {
    let here = env!("CARGO_MANIFEST_DIR");
    PipelineConfig {
        heart_model: ModelRef::new(here, PipelineConfig::HEART_MODEL_SHAPE),
        cal_model: ModelRef::new(here, PipelineConfig::CAL_MODEL_SHAPE),
        ..config
    }
}

fn crop_and_display() -> PipelineConfig {
    with_models(PipelineConfig {
        cropping_enabled: true,
        heart_seg_node: true,
        ..PipelineConfig::default()
    })
}

#[test]
fn crop_and_heart_display_uses_one_segment_call() {
    let heart = box_mask((64, 64, 64), [10, 50, 5, 55, 8, 58]);
    let backend = Scripted::sync(move |_| Ok(full(heart.clone())));
    let mut orch = Orchestrator::new(backend, Recorder::default());

    let status = orch.start(volume((64, 64, 64)), crop_and_display()).unwrap();
    let RunStatus::Finished(summary) = status else {
        unreachable!("synchronous run must finish in one call");
    };

    assert_eq!(orch.backend().calls, [Task::SegmentHeart]);
    assert!(!orch.is_running());
    assert_eq!(
        summary.coordinates.unwrap().to_array(),
        [10, 50, 5, 55, 8, 58]
    );
    assert_eq!(summary.diagnostics.working_shape, [41, 51, 51]);
    assert!(summary.calcium_volume_mm3.is_none());

    let host = orch.host();
    assert_eq!(host.replaced, [[41, 51, 51]]);
    assert_eq!(host.displays.len(), 1);
    assert_eq!(host.displays[0].name, "CT-Heart");
    assert_eq!(host.displays[0].shape, [41, 51, 51]);
    assert_eq!(host.displays[0].foreground, 41 * 51 * 51);
    assert_eq!(host.finished.len(), 1);
    assert!(host.errors.is_empty());
    assert!(
        host.reports
            .contains(&(2, "Cropping Volume Z->10:50, X->5:55, Y->8:58".to_string()))
    );
    assert!(host.reports.contains(&(1, "Completed in 0.50 Seconds".to_string())));
    assert!(matches!(
        summary.diagnostics.stage(StageId::Cropping).unwrap().metrics,
        StageMetrics::Cropping {
            before: [64, 64, 64],
            after: [41, 51, 51],
        }
    ));
}

#[test]
fn threshold_calcifications_are_quantified_inside_heart() {
    let heart = box_mask((20, 20, 20), [5, 9, 5, 14, 5, 14]);
    let mut voxels = Voxels::from_elem((20, 20, 20), -1000);
    voxels.slice_mut(s![5..10, 5..15, 5..15]).fill(400);
    let vol = Volume::new("CT", voxels, VoxelSpacing::default(), Placement::default());
    let backend = Scripted::sync(move |job| {
        assert_eq!(job.task, Task::SegmentHeart);
        Ok(full(heart.clone()))
    });
    let config = with_models(PipelineConfig {
        heart_seg_node: true,
        cal_seg_node: true,
        cal_seg_3d: true,
        deep_cal: false,
        ..PipelineConfig::default()
    });
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let RunStatus::Finished(summary) = orch.start(vol, config).unwrap() else {
        unreachable!("synchronous run must finish in one call");
    };

    assert_eq!(orch.backend().calls, [Task::SegmentHeart]);
    let volume_mm3 = summary.calcium_volume_mm3.unwrap();
    assert!((volume_mm3 - 500.0).abs() < 1e-9);

    let host = orch.host();
    let names: Vec<&str> = host.displays.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["CT-Heart", "CT-CalcificationsMasked"]);
    assert_eq!(host.displays[1].foreground, 500);
    assert!(host.displays[1].surface_3d);
    assert!(host.reports.contains(&(5, "500.00 mm³".to_string())));
    assert!(
        summary
            .diagnostics
            .stage(StageId::Quantification)
            .is_some()
    );
}

#[test]
fn empty_heart_mask_aborts_before_cropping() {
    let backend = Scripted::sync(|_| Ok(full(Mask::zeros((16, 16, 16)))));
    let mut orch = Orchestrator::new(backend, Recorder::default());

    let err = orch.start(volume((16, 16, 16)), crop_and_display()).unwrap_err();

    assert!(matches!(err, PipelineError::EmptyMask));
    assert!(!orch.is_running());
    let host = orch.host();
    assert!(host.replaced.is_empty());
    assert!(host.displays.is_empty());
    assert!(host.finished.is_empty());
    assert_eq!(host.errors.len(), 1);
    assert!(!host.reports.iter().any(|(_, m)| m == "Volume Cropped"));
}

#[test]
fn unavailable_backend_aborts_before_any_stage() {
    let mut backend = Scripted::sync(|_| Ok(full(Mask::zeros((8, 8, 8)))));
    backend.available = false;
    let mut orch = Orchestrator::new(backend, Recorder::default());

    let err = orch.start(volume((8, 8, 8)), crop_and_display()).unwrap_err();

    assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    assert!(orch.backend().calls.is_empty());
    assert!(orch.host().reports.is_empty());
    assert_eq!(orch.host().errors.len(), 1);
    assert!(orch.state().is_none());
}

#[test]
fn invalid_config_is_rejected_before_probing() {
    let mut backend = Scripted::sync(|_| Ok(full(Mask::zeros((8, 8, 8)))));
    backend.available = false;
    let config = PipelineConfig {
        partial: true,
        ..PipelineConfig::default()
    };
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let err = orch.start(volume((8, 8, 8)), config).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
}

#[test]
fn missing_local_model_is_reported_before_any_call() {
    let backend = Scripted::sync(|_| Ok(full(Mask::zeros((8, 8, 8)))));
    let config = PipelineConfig {
        heart_model: ModelRef::new("/nonexistent/heart.onnx", [112, 112, 112]),
        ..crop_and_display()
    };
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let err = orch.start(volume((8, 8, 8)), config).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(_)));
    assert!(orch.backend().calls.is_empty());
}

#[test]
fn asynchronous_run_resumes_on_completion() {
    let heart = box_mask((24, 24, 24), [4, 19, 4, 19, 4, 19]);
    let backend = Scripted::asynchronous(move |job| match job.task {
        Task::SegmentHeart => Ok(full(heart.clone())),
        Task::SegmentCalcifications => {
            assert_eq!(job.voxels.dim(), (16, 16, 16));
            assert_eq!(job.model.input_shape, [128, 128, 80]);
            let mut cal = Mask::zeros((16, 16, 16));
            cal.slice_mut(s![0..2, 0..2, 0..2]).fill(1);
            Ok(full(cal))
        }
        Task::LocateAndCrop => unreachable!("not requested"),
    });
    let config = with_models(PipelineConfig {
        cropping_enabled: true,
        heart_seg_node: true,
        cal_seg_node: true,
        ..PipelineConfig::default()
    });
    let mut orch = Orchestrator::new(backend, Recorder::default());

    assert!(matches!(
        orch.start(volume((24, 24, 24)), config.clone()).unwrap(),
        RunStatus::Waiting
    ));
    assert!(orch.is_running());
    assert_eq!(orch.state().unwrap().in_flight(), Some(Task::SegmentHeart));

    // A second run cannot start while the first is waiting.
    assert!(matches!(
        orch.start(volume((24, 24, 24)), config),
        Err(PipelineError::Protocol(_))
    ));
    assert!(orch.is_running());

    // Heart segmentation completes: crop, display, then dispatch calcifications.
    assert!(matches!(orch.poll().unwrap(), Some(RunStatus::Waiting)));
    let state = orch.state().unwrap();
    assert!(state.is_done(StageId::Cropping));
    assert!(state.is_done(StageId::HeartDisplay));
    assert_eq!(state.in_flight(), Some(Task::SegmentCalcifications));

    let status = orch.wait().unwrap();
    let RunStatus::Finished(summary) = status else {
        unreachable!("calcification completion finishes the run");
    };
    assert!((summary.calcium_volume_mm3.unwrap() - 8.0).abs() < 1e-9);
    assert_eq!(
        orch.backend().calls,
        [Task::SegmentHeart, Task::SegmentCalcifications]
    );
    assert_eq!(orch.host().finished.len(), 1);
}

#[test]
fn asynchronous_error_resets_the_run() {
    let backend = Scripted::asynchronous(|_| {
        Err(PipelineError::Inference("model crashed".to_string()))
    });
    let mut orch = Orchestrator::new(backend, Recorder::default());
    assert!(matches!(
        orch.start(volume((8, 8, 8)), crop_and_display()).unwrap(),
        RunStatus::Waiting
    ));

    let err = orch.wait().unwrap_err();
    assert!(matches!(err, PipelineError::Inference(_)));
    assert!(!orch.is_running());
    assert_eq!(orch.host().errors, ["inference failed: model crashed"]);

    // A new run starts from fresh markers.
    assert!(matches!(
        orch.start(volume((8, 8, 8)), crop_and_display()).unwrap(),
        RunStatus::Waiting
    ));
    assert!(orch.state().unwrap().completed().is_empty());
}

#[test]
fn completion_without_run_is_a_protocol_error() {
    let backend = Scripted::sync(|_| Ok(StageEnvelope::new()));
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let err = orch.resume(Ok(StageEnvelope::new())).unwrap_err();
    assert!(matches!(err, PipelineError::Protocol(_)));
    assert!(matches!(orch.wait(), Err(PipelineError::Protocol(_))));
}

#[test]
fn envelope_without_segmentation_is_a_protocol_error() {
    let backend = Scripted::sync(|_| Ok(StageEnvelope::new()));
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let err = orch.start(volume((8, 8, 8)), crop_and_display()).unwrap_err();
    assert!(err.to_string().contains("Segmentation"));
}

#[test]
fn seg_and_crop_applies_margin_to_server_box() {
    let plane = |rows: (usize, usize), cols: (usize, usize)| PlaneBox {
        row_min: rows.0,
        row_max: rows.1,
        col_min: cols.0,
        col_max: cols.1,
    };
    let boxes = ViewBoxes {
        axial: plane((4, 20), (6, 18)),
        sagittal: plane((2, 12), (6, 25)),
        coronal: plane((3, 14), (5, 20)),
    };
    let backend = Scripted::sync(move |job| {
        assert_eq!(job.task, Task::LocateAndCrop);
        assert!(job.partial);
        Ok(StageEnvelope::located(boxes, 0.1))
    });
    let config = PipelineConfig {
        location: ProcessingLocation::Remote {
            url: PipelineConfig::DEFAULT_SERVER_URL.to_string(),
        },
        partial: true,
        cropping_enabled: true,
        seg_and_crop: true,
        margin: 2,
        ..PipelineConfig::default()
    };
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let RunStatus::Finished(summary) = orch.start(volume((16, 24, 26)), config).unwrap() else {
        unreachable!("synchronous run must finish in one call");
    };

    // z: 2..14, x: 4..20, y: 6..25, then margin 2 clamped to the volume.
    assert_eq!(
        summary.coordinates.unwrap().to_array(),
        [0, 15, 2, 22, 4, 25]
    );
    assert_eq!(summary.diagnostics.working_shape, [16, 21, 22]);
    assert_eq!(orch.backend().calls, [Task::LocateAndCrop]);
    assert!(
        orch.host()
            .reports
            .contains(&(2, "Received From The Server".to_string()))
    );
}

#[test]
fn partial_segmentation_crops_from_slice_masks() {
    let backend = Scripted::sync(|job| {
        assert!(job.partial);
        let partial = PartialMask {
            axial: box_mask((3, 20, 20), [0, 2, 5, 10, 6, 12]),
            sagittal: box_mask((3, 20, 20), [1, 1, 3, 15, 6, 12]),
            coronal: box_mask((3, 20, 20), [0, 0, 3, 15, 5, 10]),
        };
        Ok(StageEnvelope::segmentation(
            HeartSegmentation::Partial(partial),
            0.2,
        ))
    });
    let config = with_models(PipelineConfig {
        partial: true,
        cropping_enabled: true,
        ..PipelineConfig::default()
    });
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let RunStatus::Finished(summary) = orch.start(volume((20, 20, 20)), config).unwrap() else {
        unreachable!("synchronous run must finish in one call");
    };
    assert_eq!(
        summary.coordinates.unwrap().to_array(),
        [3, 15, 5, 10, 6, 12]
    );
    assert!(orch.host().displays.is_empty());
}

#[test]
fn process_drives_asynchronous_backend_to_completion() {
    let heart = box_mask((12, 12, 12), [2, 9, 2, 9, 2, 9]);
    let backend = Scripted::asynchronous(move |_| Ok(full(heart.clone())));
    let (summary, host) = cascore_pipeline::process(
        volume((12, 12, 12)),
        crop_and_display(),
        backend,
        Recorder::default(),
    )
    .unwrap();
    assert_eq!(summary.diagnostics.working_shape, [8, 8, 8]);
    assert_eq!(host.finished.len(), 1);
    assert_eq!(summary.diagnostics.stages.len(), 4);
}

#[test]
fn empty_volume_is_rejected_before_any_call() {
    let backend = Scripted::sync(|_| Ok(full(Mask::zeros((0, 8, 8)))));
    let mut orch = Orchestrator::new(backend, Recorder::default());
    let err = orch.start(volume((0, 8, 8)), crop_and_display()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig(ref m) if m.contains("empty axis")));
    assert!(orch.backend().calls.is_empty());
    assert!(orch.host().reports.is_empty());
    assert_eq!(orch.host().errors.len(), 1);
}

/// Marks every voxel above zero.
struct Positive;

impl Segmenter for Positive {
    fn predict(&mut self, input: &Voxels) -> Result<Mask, PipelineError> {
        Ok(input.mapv(|v| u8::from(v > 0)))
    }
}

/// Every combination of the nine run flags.
fn flag_combinations() -> impl Iterator<Item = PipelineConfig> {
    (0..1_u16 << 9).map(|bits| {
        let on = |bit: u16| bits & (1 << bit) != 0;
        let location = if on(0) {
            ProcessingLocation::Remote {
                url: "http://inference.test".to_string(),
            }
        } else {
            ProcessingLocation::Local
        };
        with_models(PipelineConfig {
            location,
            partial: on(1),
            cropping_enabled: on(2),
            seg_and_crop: on(3),
            heart_seg_node: on(4),
            heart_seg_3d: on(5),
            cal_seg_node: on(6),
            cal_seg_3d: on(7),
            deep_cal: on(8),
            ..PipelineConfig::default()
        })
    })
}

fn heart_volume() -> Volume {
    let mut voxels = Voxels::from_elem((24, 24, 24), -1000);
    voxels.slice_mut(s![4..20, 4..20, 4..20]).fill(100);
    voxels.slice_mut(s![10..13, 10..13, 10..13]).fill(400);
    Volume::new("CT", voxels, VoxelSpacing::default(), Placement::default())
}

#[test]
fn every_legal_flag_combination_finishes() {
    const MAX_WAITS: usize = 10;
    let mut checked = 0;
    for asynchronous in [false, true] {
        for config in flag_combinations().filter(|c| c.validate().is_ok()) {
            let respond = |job: &Job| execute_job(&mut Positive, job);
            let backend = if asynchronous {
                Scripted::asynchronous(respond)
            } else {
                Scripted::sync(respond)
            };
            let mut orch = Orchestrator::new(backend, Recorder::default());

            let mut status = orch.start(heart_volume(), config.clone()).unwrap();
            let mut waits = 0;
            while matches!(status, RunStatus::Waiting) {
                assert!(waits < MAX_WAITS, "run did not finish: {config:?}");
                status = orch.wait().unwrap();
                waits += 1;
            }
            if !asynchronous {
                assert_eq!(waits, 0, "synchronous run waited: {config:?}");
            }

            assert!(matches!(status, RunStatus::Finished(_)), "{config:?}");
            assert!(!orch.is_running());
            let host = orch.host();
            assert_eq!(host.finished.len(), 1, "{config:?}");
            assert!(host.errors.is_empty(), "{config:?}: {:?}", host.errors);
            checked += 1;
        }
    }
    assert_eq!(checked, 124);
}
