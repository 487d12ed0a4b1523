//! Pipeline orchestrator: drive a run stage by stage, resuming whenever
//! an asynchronous backend call completes.
//!
//! ```rust
//! # use cascore_pipeline::{Backend, Host, Orchestrator, PipelineConfig, PipelineError, RunStatus, Volume};
//! # fn run<B: Backend, H: Host>(backend: B, host: H, volume: Volume) -> Result<(), PipelineError> {
//! let config = PipelineConfig {
//!     cropping_enabled: true,
//!     heart_seg_node: true,
//!     ..PipelineConfig::default()
//! };
//! let mut orchestrator = Orchestrator::new(backend, host);
//! let mut status = orchestrator.start(volume, config)?;
//! while let RunStatus::Waiting = status {
//!     status = orchestrator.wait()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! All per-run data lives in a [`RunState`] value. Each transition
//! consumes the state and returns its successor, and a new run always
//! starts from a fresh state, so nothing leaks from one run into the
//! next. Which transition runs next is decided by [`next_action`] from
//! the completion markers alone, independent of the order in which
//! callbacks fired.
//!
//! Any error aborts the run: it is reported to the [`Host`], the state
//! is dropped, and the error is returned to the caller.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::backend::{Backend, Job, Poll, StageEnvelope, Submission, Task};
use crate::calcification::threshold_calcifications;
use crate::diagnostics::{RunDiagnostics, RunSummary, StageDiagnostics, StageMetrics};
use crate::host::{Host, calcification_display_name, heart_display_name};
use crate::quantify::{Quantification, quantify};
use crate::roi::{apply_margin, crop, crop_volume, extract_bounding_box, roi_from_view_boxes};
use crate::stage::{ProgressStep, StageId};
use crate::types::{
    HeartSegmentation, Mask, PipelineConfig, PipelineError, RoiCoordinates, Volume,
};

/// Stages a configuration asks for.
///
/// A run is finished exactly when the set of completed stages equals
/// this set.
#[must_use]
pub fn requested_stages(config: &PipelineConfig) -> BTreeSet<StageId> {
    let mut stages = BTreeSet::new();
    if config.seg_and_crop {
        stages.insert(StageId::LocateAndCrop);
    } else if config.cropping_enabled || config.heart_seg_node {
        stages.insert(StageId::HeartSegmentation);
    }
    if config.cropping_enabled {
        stages.insert(StageId::Coordinates);
        stages.insert(StageId::Cropping);
    }
    if config.heart_seg_node {
        stages.insert(StageId::HeartDisplay);
    }
    if config.cal_seg_node {
        stages.insert(StageId::CalcificationSegmentation);
        stages.insert(StageId::Quantification);
        stages.insert(StageId::CalcificationDisplay);
    }
    stages
}

/// The next thing a run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Hand `task` to the backend; completing it completes `stage`.
    Dispatch(StageId, Task),
    /// Derive the ROI from the heart segmentation or the located boxes.
    ComputeCoordinates,
    /// Crop the working volume (and the heart mask) to the ROI.
    Crop,
    /// Create the heart display node.
    ShowHeart,
    /// Detect calcifications by thresholding.
    Threshold,
    /// Mask calcifications to the heart and measure them.
    Quantify,
    /// Create the calcification display node.
    ShowCalcifications,
    /// A backend call is in flight.
    Await,
    /// Every requested stage is done.
    Finish,
}

/// A backend call that has been dispatched and not yet completed.
#[derive(Debug, Clone)]
struct InFlight {
    stage: StageId,
    task: Task,
    since: Instant,
}

/// Working record of one run.
#[derive(Debug, Clone)]
pub struct RunState {
    config: PipelineConfig,
    requested: BTreeSet<StageId>,
    completed: BTreeSet<StageId>,
    input_shape: [usize; 3],
    working: Volume,
    in_flight: Option<InFlight>,
    segmentation: Option<HeartSegmentation>,
    located: Option<RoiCoordinates>,
    coordinates: Option<RoiCoordinates>,
    calcifications: Option<Mask>,
    quantification: Option<Quantification>,
    stages: Vec<StageDiagnostics>,
    started: Instant,
}

impl RunState {
    /// Fresh state for a run over `volume`: nothing completed.
    #[must_use]
    pub fn new(volume: Volume, config: PipelineConfig) -> Self {
        Self {
            requested: requested_stages(&config),
            completed: BTreeSet::new(),
            input_shape: volume.shape(),
            working: volume,
            config,
            in_flight: None,
            segmentation: None,
            located: None,
            coordinates: None,
            calcifications: None,
            quantification: None,
            stages: Vec::new(),
            started: Instant::now(),
        }
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The working volume (cropped once cropping is done).
    #[must_use]
    pub const fn working(&self) -> &Volume {
        &self.working
    }

    /// Whether `stage` is part of this run.
    #[must_use]
    pub fn is_requested(&self, stage: StageId) -> bool {
        self.requested.contains(&stage)
    }

    /// Whether `stage` has completed.
    #[must_use]
    pub fn is_done(&self, stage: StageId) -> bool {
        self.completed.contains(&stage)
    }

    /// Completed stages.
    #[must_use]
    pub const fn completed(&self) -> &BTreeSet<StageId> {
        &self.completed
    }

    /// The task currently in flight, if any.
    #[must_use]
    pub fn in_flight(&self) -> Option<Task> {
        self.in_flight.as_ref().map(|f| f.task)
    }

    /// The final ROI, once computed.
    #[must_use]
    pub const fn coordinates(&self) -> Option<RoiCoordinates> {
        self.coordinates
    }

    /// Whether every requested stage, and nothing else, has completed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.in_flight.is_none() && self.completed == self.requested
    }

    fn wants(&self, stage: StageId) -> bool {
        self.is_requested(stage) && !self.is_done(stage)
    }

    fn settled(&self, stage: StageId) -> bool {
        self.is_requested(stage) == self.is_done(stage)
    }

    fn record(&mut self, stage: StageId, since: Instant, metrics: StageMetrics) {
        self.completed.insert(stage);
        self.stages.push(StageDiagnostics {
            stage,
            duration: since.elapsed(),
            metrics,
        });
        tracing::info!(%stage, "stage complete");
    }

    fn heart_mask(&self) -> Result<&Mask, PipelineError> {
        match &self.segmentation {
            Some(HeartSegmentation::Full(mask)) => Ok(mask),
            Some(HeartSegmentation::Partial(_)) => Err(PipelineError::Protocol(
                "a full heart segmentation is required but only a partial one exists".to_string(),
            )),
            None => Err(PipelineError::Protocol(
                "heart segmentation is not available".to_string(),
            )),
        }
    }

    fn job(&self, task: Task) -> Job {
        let (model, partial) = match task {
            Task::SegmentHeart => (&self.config.heart_model, self.config.partial),
            Task::LocateAndCrop => (&self.config.heart_model, true),
            Task::SegmentCalcifications => (&self.config.cal_model, false),
        };
        Job {
            task,
            voxels: self.working.voxels().clone(),
            model: model.clone(),
            partial,
        }
    }

    fn dispatch<H: Host>(mut self, stage: StageId, task: Task, host: &mut H) -> (Self, Job) {
        let local = self.config.location.is_local();
        let message = match (task, local, self.config.partial) {
            (Task::LocateAndCrop, _, _) => "Sending Slices To The Server",
            (Task::SegmentHeart, true, _) => "Segmenting Locally",
            (Task::SegmentHeart, false, true) => "Sending Slices To The Server",
            (Task::SegmentHeart, false, false) => "Sending Volume To The Server",
            (Task::SegmentCalcifications, true, _) => "Finding Calcifications Locally",
            (Task::SegmentCalcifications, false, _) => "Sending Volume To The Server",
        };
        if stage.progress_step() == ProgressStep::Segmentation {
            host.report(ProgressStep::Segmentation, "Segmentation Started");
        }
        host.report(stage.progress_step(), message);
        tracing::info!(%stage, %task, "dispatching");

        let job = self.job(task);
        self.in_flight = Some(InFlight {
            stage,
            task,
            since: Instant::now(),
        });
        (self, job)
    }

    fn complete<H: Host>(
        mut self,
        result: Result<StageEnvelope, PipelineError>,
        backend: &str,
        host: &mut H,
    ) -> Result<Self, PipelineError> {
        let Some(flight) = self.in_flight.take() else {
            return Err(PipelineError::Protocol(
                "received a completion while no stage was in flight".to_string(),
            ));
        };
        let mut envelope = result?;
        let step = flight.stage.progress_step();

        match flight.stage {
            StageId::LocateAndCrop => {
                let roi = roi_from_view_boxes(&envelope.coordinates()?);
                let backend_seconds = envelope.seconds(StageEnvelope::SEG_AND_CROP_TIME);
                self.located = Some(roi);
                host.report(step, &completed_in(backend_seconds, flight.since));
                host.report(ProgressStep::Cropping, "Received From The Server");
                self.record(
                    flight.stage,
                    flight.since,
                    StageMetrics::LocateAndCrop {
                        backend: backend.to_string(),
                        roi,
                        backend_seconds,
                    },
                );
            }
            StageId::HeartSegmentation => {
                let segmentation = envelope.take_segmentation()?;
                let foreground_voxels = match &segmentation {
                    HeartSegmentation::Full(mask) => {
                        check_congruent(&self.working, mask)?;
                        foreground(mask)
                    }
                    HeartSegmentation::Partial(p) => {
                        foreground(&p.axial) + foreground(&p.sagittal) + foreground(&p.coronal)
                    }
                };
                let partial = matches!(segmentation, HeartSegmentation::Partial(_));
                if partial != self.config.partial {
                    return Err(PipelineError::Protocol(format!(
                        "requested partial={} segmentation, backend returned partial={partial}",
                        self.config.partial
                    )));
                }
                let backend_seconds = envelope.seconds(StageEnvelope::SEGMENTATION_TIME);
                self.segmentation = Some(segmentation);
                host.report(step, &completed_in(backend_seconds, flight.since));
                self.record(
                    flight.stage,
                    flight.since,
                    StageMetrics::Segmentation {
                        backend: backend.to_string(),
                        partial,
                        foreground_voxels,
                        backend_seconds,
                    },
                );
            }
            StageId::CalcificationSegmentation => {
                let mask = envelope.take_mask()?;
                check_congruent(&self.working, &mask)?;
                let backend_seconds = envelope.seconds(StageEnvelope::SEGMENTATION_TIME);
                host.report(step, &completed_in(backend_seconds, flight.since));
                self.record(
                    flight.stage,
                    flight.since,
                    StageMetrics::Segmentation {
                        backend: backend.to_string(),
                        partial: false,
                        foreground_voxels: foreground(&mask),
                        backend_seconds,
                    },
                );
                self.calcifications = Some(mask);
            }
            other => {
                return Err(PipelineError::Protocol(format!(
                    "stage {other} is never dispatched to a backend"
                )));
            }
        }
        Ok(self)
    }

    fn compute_coordinates<H: Host>(mut self, host: &mut H) -> Result<Self, PipelineError> {
        let since = Instant::now();
        let margin = self.config.margin;
        let shape = self.working.shape();
        let raw = if let Some(located) = self.located {
            host.report(ProgressStep::Cropping, "Adding Margins");
            located
        } else {
            host.report(ProgressStep::Cropping, "Calculating Cropping Coordinates");
            let segmentation = self.segmentation.as_ref().ok_or_else(|| {
                PipelineError::Protocol("heart segmentation is not available".to_string())
            })?;
            extract_bounding_box(segmentation)?
        };
        let roi = apply_margin(shape, raw, margin);
        tracing::info!(%roi, margin, "cropping coordinates");
        self.coordinates = Some(roi);
        self.record(
            StageId::Coordinates,
            since,
            StageMetrics::Coordinates { roi, margin },
        );
        Ok(self)
    }

    fn crop<H: Host>(mut self, host: &mut H) -> Result<Self, PipelineError> {
        let since = Instant::now();
        let roi = self.coordinates.ok_or_else(|| {
            PipelineError::Protocol("cropping coordinates are not available".to_string())
        })?;
        host.report(ProgressStep::Cropping, &format!("Cropping Volume {roi}"));

        let before = self.working.shape();
        let cropped = crop_volume(&self.working, roi)?;
        if let Some(HeartSegmentation::Full(mask)) = &self.segmentation {
            self.segmentation = Some(HeartSegmentation::Full(crop(mask, roi)?));
        }
        host.replace_volume_contents(&cropped)?;
        let after = roi.extent();
        self.working = cropped;

        host.report(ProgressStep::Cropping, "Volume Cropped");
        self.record(StageId::Cropping, since, StageMetrics::Cropping { before, after });
        Ok(self)
    }

    fn show_heart<H: Host>(mut self, host: &mut H) -> Result<Self, PipelineError> {
        let since = Instant::now();
        host.report(
            ProgressStep::Visualization,
            "Creating The Heart Segmentation Node",
        );
        let name = heart_display_name(self.working.name());
        let surface_3d = self.config.heart_seg_3d;
        host.create_segmentation_display(
            self.heart_mask()?,
            &name,
            self.working.placement(),
            surface_3d,
        )?;
        host.report(ProgressStep::Visualization, "Heart Visualized");
        self.record(
            StageId::HeartDisplay,
            since,
            StageMetrics::Display { name, surface_3d },
        );
        Ok(self)
    }

    fn threshold<H: Host>(mut self, host: &mut H) -> Self {
        let since = Instant::now();
        let threshold = self.config.calcium_threshold_hu;
        host.report(
            ProgressStep::Calcifications,
            "Finding Calcifications By Thresholding",
        );
        let mask = threshold_calcifications(self.working.voxels(), threshold);
        host.report(ProgressStep::Calcifications, &completed_in(None, since));
        self.record(
            StageId::CalcificationSegmentation,
            since,
            StageMetrics::Threshold {
                threshold,
                voxel_count: foreground(&mask),
            },
        );
        self.calcifications = Some(mask);
        self
    }

    fn quantify<H: Host>(mut self, host: &mut H) -> Result<Self, PipelineError> {
        let since = Instant::now();
        let calcifications = self.calcifications.as_ref().ok_or_else(|| {
            PipelineError::Protocol("calcification mask is not available".to_string())
        })?;
        let q = quantify(calcifications, self.heart_mask()?, self.working.spacing())?;
        tracing::info!(volume_mm3 = q.volume_mm3, voxels = q.voxel_count, "calcium volume");
        host.report(ProgressStep::Results, &format!("{:.2} mm³", q.volume_mm3));
        self.record(
            StageId::Quantification,
            since,
            StageMetrics::Quantification {
                voxel_count: q.voxel_count,
                volume_mm3: q.volume_mm3,
            },
        );
        self.quantification = Some(q);
        Ok(self)
    }

    fn show_calcifications<H: Host>(mut self, host: &mut H) -> Result<Self, PipelineError> {
        let since = Instant::now();
        let name = calcification_display_name(self.working.name());
        let surface_3d = self.config.cal_seg_3d;
        let masked = self.quantification.as_ref().map(|q| &q.masked).ok_or_else(|| {
            PipelineError::Protocol("quantified calcifications are not available".to_string())
        })?;
        host.create_segmentation_display(masked, &name, self.working.placement(), surface_3d)?;
        host.report(ProgressStep::Visualization, "Calcifications Visualized");
        self.record(
            StageId::CalcificationDisplay,
            since,
            StageMetrics::Display { name, surface_3d },
        );
        Ok(self)
    }

    fn finish(self) -> RunSummary {
        RunSummary {
            volume_name: self.working.name().to_string(),
            calcium_volume_mm3: self.quantification.as_ref().map(|q| q.volume_mm3),
            coordinates: self.coordinates,
            diagnostics: RunDiagnostics {
                total_duration: self.started.elapsed(),
                input_shape: self.input_shape,
                working_shape: self.working.shape(),
                stages: self.stages,
            },
        }
    }
}

/// Decide what `state` should do next.
///
/// # Errors
///
/// Returns [`PipelineError::Protocol`] if requested stages remain but
/// none of them can run, which only happens for configurations that
/// [`PipelineConfig::validate`] rejects.
pub fn next_action(state: &RunState) -> Result<Action, PipelineError> {
    use StageId::{
        CalcificationDisplay, CalcificationSegmentation, Coordinates, Cropping, HeartDisplay,
        HeartSegmentation, LocateAndCrop, Quantification,
    };

    if state.in_flight.is_some() {
        return Ok(Action::Await);
    }
    if state.wants(LocateAndCrop) {
        return Ok(Action::Dispatch(LocateAndCrop, Task::LocateAndCrop));
    }
    if state.wants(HeartSegmentation) {
        return Ok(Action::Dispatch(HeartSegmentation, Task::SegmentHeart));
    }
    let located = state.is_done(HeartSegmentation) || state.is_done(LocateAndCrop);
    if state.wants(Coordinates) && located {
        return Ok(Action::ComputeCoordinates);
    }
    if state.wants(Cropping) && state.is_done(Coordinates) {
        return Ok(Action::Crop);
    }
    let crop_settled = state.settled(Cropping) && state.settled(LocateAndCrop);
    if state.wants(HeartDisplay) && state.is_done(HeartSegmentation) && crop_settled {
        return Ok(Action::ShowHeart);
    }
    if state.wants(CalcificationSegmentation) && state.is_done(HeartSegmentation) && crop_settled {
        return Ok(if state.config.deep_cal {
            Action::Dispatch(CalcificationSegmentation, Task::SegmentCalcifications)
        } else {
            Action::Threshold
        });
    }
    if state.wants(Quantification) && state.is_done(CalcificationSegmentation) {
        return Ok(Action::Quantify);
    }
    if state.wants(CalcificationDisplay) && state.is_done(Quantification) {
        return Ok(Action::ShowCalcifications);
    }
    if state.is_terminal() {
        return Ok(Action::Finish);
    }
    let outstanding: Vec<&str> = state
        .requested
        .difference(&state.completed)
        .map(|s| s.label())
        .collect();
    Err(PipelineError::Protocol(format!(
        "run stalled with stages outstanding: {}",
        outstanding.join(", ")
    )))
}

/// Where a run stands after the orchestrator returns control.
#[derive(Debug)]
#[must_use]
pub enum RunStatus {
    /// A backend call is in flight; resume when it completes.
    Waiting,
    /// The run completed; the host has been notified.
    Finished(Box<RunSummary>),
}

enum Outcome {
    Waiting(RunState),
    Finished(RunSummary),
}

/// Drives runs against one backend and one host.
pub struct Orchestrator<B, H> {
    backend: B,
    host: H,
    state: Option<RunState>,
}

impl<B: Backend, H: Host> Orchestrator<B, H> {
    /// Create an idle orchestrator.
    pub const fn new(backend: B, host: H) -> Self {
        Self {
            backend,
            host,
            state: None,
        }
    }

    /// The backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The host.
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Mutable access to the host.
    pub const fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Take the backend and host back.
    pub fn into_parts(self) -> (B, H) {
        (self.backend, self.host)
    }

    /// Whether a run is in progress.
    pub const fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// State of the run in progress.
    pub const fn state(&self) -> Option<&RunState> {
        self.state.as_ref()
    }

    /// Start a run over `volume`.
    ///
    /// The configuration is validated, required models are checked and
    /// the backend is probed before any stage runs. Synchronous stages
    /// execute before this returns.
    ///
    /// # Errors
    ///
    /// Returns the first error of the run, after reporting it to the
    /// host. Returns [`PipelineError::Protocol`] if a run is already in
    /// progress; that run is left untouched.
    pub fn start(
        &mut self,
        volume: Volume,
        config: PipelineConfig,
    ) -> Result<RunStatus, PipelineError> {
        if self.state.is_some() {
            let err = PipelineError::Protocol("a run is already in progress".to_string());
            self.host.error(&err);
            return Err(err);
        }
        tracing::info!(
            volume = volume.name(),
            shape = ?volume.shape(),
            backend = self.backend.name(),
            "starting run"
        );
        let outcome = self.begin(volume, config);
        self.settle(outcome)
    }

    /// Feed the completion of the in-flight backend call back into the
    /// run.
    ///
    /// # Errors
    ///
    /// Returns the completion's error or any later stage error, after
    /// reporting it to the host. Returns [`PipelineError::Protocol`] if
    /// no run is waiting for a completion.
    pub fn resume(
        &mut self,
        result: Result<StageEnvelope, PipelineError>,
    ) -> Result<RunStatus, PipelineError> {
        let outcome = match self.state.take() {
            Some(state) => {
                let backend = self.backend.name();
                state
                    .complete(result, backend, &mut self.host)
                    .and_then(|s| self.drive(s))
            }
            None => Err(PipelineError::Protocol(
                "received a completion while no run is in progress".to_string(),
            )),
        };
        self.settle(outcome)
    }

    /// Resume the run if the backend has finished, without blocking.
    ///
    /// Returns `Ok(None)` while the backend is still busy.
    ///
    /// # Errors
    ///
    /// See [`resume`](Self::resume).
    pub fn poll(&mut self) -> Result<Option<RunStatus>, PipelineError> {
        match self.backend.poll() {
            Poll::Ready(result) => self.resume(result).map(Some),
            Poll::Pending | Poll::Idle => Ok(None),
        }
    }

    /// Block until the backend finishes, then resume the run.
    ///
    /// # Errors
    ///
    /// See [`resume`](Self::resume). Returns
    /// [`PipelineError::Protocol`] if nothing is in flight.
    pub fn wait(&mut self) -> Result<RunStatus, PipelineError> {
        match self.backend.wait() {
            Some(result) => self.resume(result),
            None => {
                let err = PipelineError::Protocol("no backend call is in flight".to_string());
                self.abort(&err);
                Err(err)
            }
        }
    }

    fn begin(&mut self, volume: Volume, config: PipelineConfig) -> Result<Outcome, PipelineError> {
        config.validate()?;
        if volume.voxels().is_empty() {
            return Err(PipelineError::empty_volume(&volume.shape()));
        }
        config.check_models()?;
        self.backend.check_available()?;
        self.drive(RunState::new(volume, config))
    }

    fn drive(&mut self, mut state: RunState) -> Result<Outcome, PipelineError> {
        let host = &mut self.host;
        loop {
            let action = next_action(&state)?;
            tracing::debug!(?action, "next action");
            state = match action {
                Action::Await => return Ok(Outcome::Waiting(state)),
                Action::Finish => return Ok(Outcome::Finished(state.finish())),
                Action::Dispatch(stage, task) => {
                    let (state, job) = state.dispatch(stage, task, host);
                    match self.backend.submit(job)? {
                        Submission::Completed(envelope) => {
                            state.complete(Ok(envelope), self.backend.name(), host)?
                        }
                        Submission::Dispatched => state,
                    }
                }
                Action::ComputeCoordinates => state.compute_coordinates(host)?,
                Action::Crop => state.crop(host)?,
                Action::ShowHeart => state.show_heart(host)?,
                Action::Threshold => state.threshold(host),
                Action::Quantify => state.quantify(host)?,
                Action::ShowCalcifications => state.show_calcifications(host)?,
            };
        }
    }

    fn settle(&mut self, outcome: Result<Outcome, PipelineError>) -> Result<RunStatus, PipelineError> {
        match outcome {
            Ok(Outcome::Waiting(state)) => {
                self.state = Some(state);
                Ok(RunStatus::Waiting)
            }
            Ok(Outcome::Finished(summary)) => {
                tracing::info!(
                    calcium_mm3 = ?summary.calcium_volume_mm3,
                    total_secs = summary.diagnostics.total_duration.as_secs_f64(),
                    "run finished"
                );
                self.state = None;
                self.host.finished(&summary);
                Ok(RunStatus::Finished(Box::new(summary)))
            }
            Err(err) => {
                self.abort(&err);
                Err(err)
            }
        }
    }

    fn abort(&mut self, err: &PipelineError) {
        tracing::error!(error = %err, "run aborted");
        self.state = None;
        self.host.error(err);
    }
}

fn check_congruent(volume: &Volume, mask: &Mask) -> Result<(), PipelineError> {
    if mask.shape() == volume.voxels().shape() {
        Ok(())
    } else {
        Err(PipelineError::shape_mismatch(
            volume.voxels().shape(),
            mask.shape(),
        ))
    }
}

fn foreground(mask: &Mask) -> usize {
    mask.iter().filter(|&&v| v != 0).count()
}

fn completed_in(backend_seconds: Option<f64>, since: Instant) -> String {
    let secs = backend_seconds.unwrap_or_else(|| since.elapsed().as_secs_f64());
    format!("Completed in {secs:.2} Seconds")
}
