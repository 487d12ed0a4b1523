//! cascore: run the coronary calcium scoring pipeline on a CT volume.
//!
//! Loads a volume bundle (`.npz` with `Volume`, optional `Spacing` and
//! `Placement`), runs the requested stages and prints per-stage
//! diagnostics. Display masks and the cropped volume are written as
//! bundles when `--output-dir` is given.
//!
//! # Usage
//!
//! ```text
//! cascore run [OPTIONS] <VOLUME>
//! cascore config
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cascore_io::bundle::{SEGMENTATION, save_mask, save_volume};
use cascore_pipeline::{
    Host, Mask, ModelRef, PipelineConfig, PipelineError, Placement, ProcessingLocation,
    ProgressStep, RunSummary, Volume,
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Coronary calcium scoring for CT volumes.
#[derive(Parser)]
#[command(name = "cascore", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline on a volume bundle.
    Run(RunArgs),
    /// Print the default configuration as JSON.
    Config,
}

#[derive(Args)]
#[allow(clippy::struct_excessive_bools)]
struct RunArgs {
    /// Volume bundle (`.npz`).
    volume: PathBuf,

    /// Run inference on this server instead of locally.
    #[arg(long, value_name = "URL")]
    remote: Option<String>,

    /// Run inference in this process instead of a worker process.
    #[arg(long)]
    in_process: bool,

    /// Worker executable (default: next to this binary).
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Segment only 3 sampled slices per axis to locate the heart.
    #[arg(long)]
    partial: bool,

    /// Crop the volume to the heart.
    #[arg(long)]
    crop: bool,

    /// Locate and crop in one server call.
    #[arg(long)]
    seg_and_crop: bool,

    /// Create the heart display.
    #[arg(long)]
    heart_node: bool,

    /// Build a 3D surface for the heart display.
    #[arg(long)]
    heart_3d: bool,

    /// Create the calcification display and measure calcium.
    #[arg(long)]
    cal_node: bool,

    /// Build a 3D surface for the calcification display.
    #[arg(long)]
    cal_3d: bool,

    /// Detect calcifications by thresholding instead of the model.
    #[arg(long)]
    threshold: bool,

    /// Heart localization model.
    #[arg(long)]
    heart_model: Option<PathBuf>,

    /// Calcification model.
    #[arg(long)]
    cal_model: Option<PathBuf>,

    /// ROI margin in voxels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MARGIN)]
    margin: usize,

    /// Calcium threshold for `--threshold`, in HU.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_CALCIUM_THRESHOLD_HU, allow_negative_numbers = true)]
    calcium_threshold: i16,

    /// Server request timeout in seconds.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_REQUEST_TIMEOUT_SECS)]
    timeout: u64,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline flags are ignored.
    #[arg(long, conflicts_with = "config")]
    config_json: Option<String>,

    /// Full pipeline config from a JSON file.
    ///
    /// When provided, all other pipeline flags are ignored.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for display masks and the cropped volume.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Output the run summary as JSON instead of a report.
    #[arg(long)]
    json: bool,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// `--config-json` and `--config` replace the individual flags.
fn config_from_args(args: &RunArgs) -> Result<PipelineConfig, String> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    if let Some(ref path) = args.config {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        return serde_json::from_str(&text)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }

    let defaults = PipelineConfig::default();
    let model = |path: Option<&PathBuf>, default: ModelRef| match path {
        Some(p) => ModelRef::new(p.clone(), default.input_shape),
        None => default,
    };
    Ok(PipelineConfig {
        location: args
            .remote
            .clone()
            .map_or(ProcessingLocation::Local, |url| ProcessingLocation::Remote { url }),
        use_subprocess: !args.in_process,
        partial: args.partial,
        cropping_enabled: args.crop,
        seg_and_crop: args.seg_and_crop,
        heart_seg_node: args.heart_node,
        heart_seg_3d: args.heart_3d,
        cal_seg_node: args.cal_node,
        cal_seg_3d: args.cal_3d,
        deep_cal: !args.threshold,
        heart_model: model(args.heart_model.as_ref(), defaults.heart_model.clone()),
        cal_model: model(args.cal_model.as_ref(), defaults.cal_model.clone()),
        margin: args.margin,
        calcium_threshold_hu: args.calcium_threshold,
        request_timeout_secs: args.timeout,
        ..defaults
    })
}

/// Host that logs progress and writes displays to bundle files.
struct CliHost {
    output_dir: Option<PathBuf>,
    written: Vec<PathBuf>,
}

impl CliHost {
    const fn new(output_dir: Option<PathBuf>) -> Self {
        Self {
            output_dir,
            written: Vec::new(),
        }
    }

    fn target(&self, name: &str) -> Option<PathBuf> {
        self.output_dir
            .as_deref()
            .map(|dir| dir.join(format!("{name}.npz")))
    }

    fn record(&mut self, path: PathBuf) {
        tracing::info!(path = %path.display(), "written");
        self.written.push(path);
    }
}

fn host_error(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Host(format!("cannot write {}: {e}", path.display()))
}

impl Host for CliHost {
    fn report(&mut self, step: ProgressStep, message: &str) {
        tracing::info!(step = %step, "{message}");
    }

    fn create_segmentation_display(
        &mut self,
        mask: &Mask,
        name: &str,
        _placement: &Placement,
        surface_3d: bool,
    ) -> Result<(), PipelineError> {
        let foreground = mask.iter().filter(|&&v| v != 0).count();
        tracing::info!(name, foreground, surface_3d, "display created");
        if let Some(path) = self.target(name) {
            save_mask(&path, SEGMENTATION, mask).map_err(|e| host_error(&path, e))?;
            self.record(path);
        }
        Ok(())
    }

    fn replace_volume_contents(&mut self, volume: &Volume) -> Result<(), PipelineError> {
        tracing::info!(shape = ?volume.shape(), "volume replaced");
        if let Some(path) = self.target(&format!("{}-Cropped", volume.name())) {
            save_volume(&path, volume).map_err(|e| host_error(&path, e))?;
            self.record(path);
        }
        Ok(())
    }

    fn finished(&mut self, summary: &RunSummary) {
        tracing::info!(
            volume = %summary.volume_name,
            seconds = summary.diagnostics.total_duration.as_secs_f64(),
            "run finished"
        );
    }

    fn error(&mut self, error: &PipelineError) {
        tracing::error!(%error, "run aborted");
    }
}

fn run(args: &RunArgs) -> Result<(), String> {
    let config = config_from_args(args)?;
    let volume = cascore_io::bundle::load_volume(&args.volume)
        .map_err(|e| format!("Error reading {}: {e}", args.volume.display()))?;
    if let Some(ref dir) = args.output_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Error creating {}: {e}", dir.display()))?;
    }

    let backend = cascore_io::select_backend(&config, args.worker.as_deref())
        .map_err(|e| format!("Backend error: {e}"))?;
    let host = CliHost::new(args.output_dir.clone());
    let (summary, host) = cascore_pipeline::process(volume, config, backend, host)
        .map_err(|e| format!("Pipeline error: {e}"))?;

    if args.json {
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("Error serializing summary: {e}"))?;
        println!("{json}");
    } else {
        println!("{}", summary.diagnostics.report());
        if let Some(coords) = summary.coordinates {
            println!("Coordinates: {coords}");
        }
        if let Some(mm3) = summary.calcium_volume_mm3 {
            println!("Calcium volume: {mm3:.2} mm³");
        }
        for path in &host.written {
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(ref args) => run(args),
        Command::Config => serde_json::to_string_pretty(&PipelineConfig::default())
            .map(|json| println!("{json}"))
            .map_err(|e| format!("Error serializing config: {e}")),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}
