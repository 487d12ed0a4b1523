//! Out-of-process backend.
//!
//! [`WorkerBackend`] runs each job in a fresh `cascore-worker` process.
//! The process is driven from a helper thread so that
//! [`Backend::submit`] returns immediately; the result arrives over a
//! channel and is picked up by [`Backend::poll`] or [`Backend::wait`].
//! Failures inside the worker come back through the same channel as
//! successes.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use cascore_pipeline::backend::{Backend, Job, Poll, StageEnvelope, Submission};
use cascore_pipeline::{PipelineConfig, PipelineError};

use crate::protocol::{WorkerRequest, read_response, write_request};
use crate::remote::RemoteBackend;

/// Environment variable overriding the worker executable.
pub const WORKER_ENV: &str = "CASCORE_WORKER";

/// Name of the worker executable.
pub const WORKER_BINARY: &str = "cascore-worker";

type Outcome = Result<StageEnvelope, PipelineError>;

/// Backend that hands each job to a worker process.
///
/// At most one job is in flight; a second submit before the first
/// completes is rejected.
pub struct WorkerBackend {
    program: PathBuf,
    config: PipelineConfig,
    in_flight: Option<Receiver<Outcome>>,
    generation: u64,
}

impl WorkerBackend {
    /// Backend running `program` with the location, routes and timeout
    /// of `config`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, config: PipelineConfig) -> Self {
        Self {
            program: program.into(),
            config,
            in_flight: None,
            generation: 0,
        }
    }

    /// Find the worker executable.
    ///
    /// Uses [`WORKER_ENV`] when set, otherwise the `cascore-worker`
    /// binary next to the running executable.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if no worker executable
    /// can be found.
    pub fn locate() -> Result<PathBuf, PipelineError> {
        if let Some(path) = std::env::var_os(WORKER_ENV) {
            return Ok(PathBuf::from(path));
        }
        let exe = std::env::current_exe()
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot locate executable: {e}")))?;
        let sibling = exe
            .parent()
            .map(|dir| dir.join(format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX)))
            .filter(|p| p.exists());
        sibling.ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "{WORKER_BINARY} not found next to {}; set {WORKER_ENV}",
                exe.display()
            ))
        })
    }

    /// Path of the worker executable.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether a job is in flight.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Run one job in a worker process and collect its response.
fn run_worker(program: &Path, request: &WorkerRequest, job: &Job) -> Outcome {
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            PipelineError::Backend(format!("cannot start worker {}: {e}", program.display()))
        })?;

    // Close stdin after writing so the worker sees the end of the bundle.
    let written = child
        .stdin
        .take()
        .ok_or_else(|| PipelineError::Backend("worker stdin unavailable".to_string()))
        .and_then(|stdin| write_request(BufWriter::new(stdin), request, &job.voxels));

    let output = child
        .wait_with_output()
        .map_err(|e| PipelineError::Backend(format!("worker did not finish: {e}")))?;

    // A worker that fails early reports why before we finish writing.
    if !output.stdout.is_empty() {
        return read_response(BufReader::new(output.stdout.as_slice()));
    }
    written?;
    Err(PipelineError::Backend(format!(
        "worker exited with {} and no response",
        output.status
    )))
}

impl Backend for WorkerBackend {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn check_available(&mut self) -> Result<(), PipelineError> {
        if !self.program.exists() {
            return Err(PipelineError::InvalidConfig(format!(
                "worker executable {} does not exist",
                self.program.display()
            )));
        }
        // The worker forwards to the server, so probe it from here.
        if self.config.location.is_local() {
            Ok(())
        } else {
            RemoteBackend::from_config(&self.config)?.check_available()
        }
    }

    fn submit(&mut self, job: Job) -> Result<Submission, PipelineError> {
        if self.in_flight.is_some() {
            return Err(PipelineError::Protocol(
                "a worker job is already in flight".to_string(),
            ));
        }
        self.generation += 1;
        let generation = self.generation;
        let request = WorkerRequest::new(&job, &self.config);
        let program = self.program.clone();
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name(format!("cascore-worker-{generation}"))
            .spawn(move || {
                tracing::debug!(generation, task = %job.task, "worker started");
                let outcome = run_worker(&program, &request, &job);
                tracing::debug!(generation, ok = outcome.is_ok(), "worker finished");
                // The receiver is gone only if the backend was dropped.
                let _ = tx.send(outcome);
            })
            .map_err(|e| PipelineError::Backend(format!("cannot spawn worker thread: {e}")))?;

        self.in_flight = Some(rx);
        tracing::info!(generation, program = %self.program.display(), "job dispatched to worker");
        Ok(Submission::Dispatched)
    }

    fn poll(&mut self) -> Poll {
        let Some(rx) = &self.in_flight else {
            return Poll::Idle;
        };
        match rx.try_recv() {
            Ok(outcome) => {
                self.in_flight = None;
                Poll::Ready(outcome)
            }
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Disconnected) => {
                self.in_flight = None;
                Poll::Ready(Err(lost()))
            }
        }
    }

    fn wait(&mut self) -> Option<Outcome> {
        let rx = self.in_flight.take()?;
        Some(rx.recv().unwrap_or_else(|_| Err(lost())))
    }
}

fn lost() -> PipelineError {
    PipelineError::Backend("worker thread ended without a result".to_string())
}
