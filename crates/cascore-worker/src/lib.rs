//! Worker process for out-of-process inference.
//!
//! The worker reads one request from its input, runs it and writes
//! one response to its output (see [`cascore_io::protocol`]). A local
//! request runs the model in this process; a remote one is forwarded
//! to the inference server. Failures are written into the response
//! rather than returned, so the parent sees them the same way as
//! results.

use std::io::{BufRead, Write};

use cascore_io::RemoteBackend;
use cascore_io::protocol::{WorkerRequest, read_request, write_response};
use cascore_pipeline::backend::{Backend, StageEnvelope, Submission};
use cascore_pipeline::{ModelLoader, PipelineError, Voxels, execute_job};

/// Answer one request from `input` on `output`.
///
/// # Errors
///
/// Returns an error only if the response itself cannot be written.
pub fn serve<R, W, L>(input: R, output: W, loader: &mut L) -> Result<(), PipelineError>
where
    R: BufRead,
    W: Write,
    L: ModelLoader,
{
    let result = read_request(input).and_then(|(request, voxels)| run(&request, voxels, loader));
    if let Err(e) = &result {
        tracing::warn!(error = %e, "job failed");
    }
    write_response(output, result)
}

fn run<L: ModelLoader>(
    request: &WorkerRequest,
    voxels: Voxels,
    loader: &mut L,
) -> Result<StageEnvelope, PipelineError> {
    tracing::info!(
        task = %request.task,
        partial = request.partial,
        local = request.local,
        shape = ?voxels.shape(),
        "job received"
    );
    let job = request.job(voxels);
    if request.local {
        let mut model = loader.load(&job.model)?;
        return execute_job(&mut model, &job);
    }

    let url = request.server_url.as_deref().ok_or_else(|| {
        PipelineError::InvalidConfig("remote request without a server URL".to_string())
    })?;
    let mut remote = RemoteBackend::new(url, request.routes.clone(), request.timeout())?;
    match remote.submit(job)? {
        Submission::Completed(envelope) => Ok(envelope),
        Submission::Dispatched => Err(PipelineError::Protocol(
            "remote backend dispatched instead of completing".to_string(),
        )),
    }
}
