//! `cascore-worker`: run one inference job read from stdin.
//!
//! Logs go to stderr; stdout carries only the response.

use std::io::{self, BufWriter};
use std::process::ExitCode;

use cascore_io::OnnxModelLoader;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    match cascore_worker::serve(stdin, stdout, &mut OnnxModelLoader) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "cannot write response");
            ExitCode::FAILURE
        }
    }
}
