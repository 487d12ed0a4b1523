//! cascore-io: the I/O side of the calcium scoring pipeline.
//!
//! Array bundles on disk and on the wire, the remote HTTP backend,
//! the worker-process backend and its protocol, and ONNX Runtime
//! models for in-process inference.

pub mod bundle;
pub mod onnx;
pub mod protocol;
pub mod remote;
pub mod worker;

use std::path::Path;

use cascore_pipeline::{Backend, LocalBackend, PipelineConfig, PipelineError};

pub use bundle::{Bundle, BundleError, BundleWriter};
pub use onnx::{OnnxModelLoader, OnnxSegmenter};
pub use remote::RemoteBackend;
pub use worker::WorkerBackend;

/// Build the backend `config` asks for.
///
/// A worker process is used when `use_subprocess` is set; otherwise
/// models run in-process when local, or on the server when remote.
/// `worker` overrides the worker executable; by default it is found
/// with [`WorkerBackend::locate`].
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if the worker executable
/// cannot be found or the remote client cannot be built.
pub fn select_backend(
    config: &PipelineConfig,
    worker: Option<&Path>,
) -> Result<Box<dyn Backend>, PipelineError> {
    let backend: Box<dyn Backend> = if config.use_subprocess {
        let program = match worker {
            Some(path) => path.to_path_buf(),
            None => WorkerBackend::locate()?,
        };
        Box::new(WorkerBackend::new(program, config.clone()))
    } else if config.location.is_local() {
        Box::new(LocalBackend::new(OnnxModelLoader))
    } else {
        Box::new(RemoteBackend::from_config(config)?)
    };
    tracing::debug!(backend = backend.name(), "backend selected");
    Ok(backend)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cascore_pipeline::ProcessingLocation;

    fn config(use_subprocess: bool, location: ProcessingLocation) -> PipelineConfig {
        PipelineConfig {
            use_subprocess,
            location,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn selection_follows_config() {
        let remote = ProcessingLocation::Remote {
            url: "http://127.0.0.1:5000".to_string(),
        };
        let worker = Path::new("/opt/cascore/cascore-worker");
        let pick = |c: &PipelineConfig| select_backend(c, Some(worker)).unwrap().name();
        assert_eq!(pick(&config(false, ProcessingLocation::Local)), "local");
        assert_eq!(pick(&config(false, remote.clone())), "remote");
        assert_eq!(pick(&config(true, ProcessingLocation::Local)), "worker");
        assert_eq!(pick(&config(true, remote)), "worker");
    }

    #[test]
    fn empty_server_url_is_rejected() {
        let c = config(
            false,
            ProcessingLocation::Remote {
                url: "  ".to_string(),
            },
        );
        assert!(matches!(
            select_backend(&c, None),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
