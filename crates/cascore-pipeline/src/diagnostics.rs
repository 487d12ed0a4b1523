//! Run diagnostics: timing, voxel counts, and other metrics per stage.
//!
//! Every run collects diagnostics alongside its results, whichever
//! backend executed the inference stages. Stages that were not
//! requested simply have no entry.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stage::StageId;
use crate::types::RoiCoordinates;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Completed stages in completion order.
    pub stages: Vec<StageDiagnostics>,
    /// Wall-clock duration from run start to completion (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Shape of the input volume.
    pub input_shape: [usize; 3],
    /// Shape of the working volume at the end of the run.
    pub working_shape: [usize; 3],
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage.
    pub stage: StageId,
    /// Wall-clock duration as seen by the orchestrator (seconds).
    ///
    /// For asynchronous stages this spans dispatch to completion.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Heart or calcification segmentation by a model.
    Segmentation {
        /// Backend that ran the model.
        backend: String,
        /// Whether only the sampled slices were segmented.
        partial: bool,
        /// Foreground voxels in the returned mask(s).
        foreground_voxels: usize,
        /// Elapsed time reported by the backend itself, if any.
        backend_seconds: Option<f64>,
    },
    /// Remote locate-and-crop.
    LocateAndCrop {
        /// Backend that answered.
        backend: String,
        /// Merged ROI from the per-view boxes.
        roi: RoiCoordinates,
        /// Elapsed time reported by the backend itself, if any.
        backend_seconds: Option<f64>,
    },
    /// Bounding box and margin.
    Coordinates {
        /// Final ROI after margin.
        roi: RoiCoordinates,
        /// Margin that was applied, in voxels.
        margin: usize,
    },
    /// Volume crop.
    Cropping {
        /// Shape before cropping.
        before: [usize; 3],
        /// Shape after cropping.
        after: [usize; 3],
    },
    /// Threshold calcification detection.
    Threshold {
        /// Threshold used.
        threshold: i16,
        /// Voxels marked after dilation.
        voxel_count: usize,
    },
    /// Calcifications masked to the heart and measured.
    Quantification {
        /// Calcified voxels inside the heart.
        voxel_count: usize,
        /// Calcified volume in mm³.
        volume_mm3: f64,
    },
    /// A display node was created.
    Display {
        /// Display name.
        name: String,
        /// Whether a 3-D surface was requested.
        surface_3d: bool,
    },
}

impl RunDiagnostics {
    /// Diagnostics of `stage`, if it ran.
    #[must_use]
    pub fn stage(&self, stage: StageId) -> Option<&StageDiagnostics> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Run Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Volume: {:?} -> working {:?}",
            self.input_shape, self.working_shape,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<28} {:>12} {:>8}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!(
                "{:<28} {ms:>10.3}ms {pct:>7.1}%  {details}",
                diag.stage.label()
            ));
        }

        lines.join("\n")
    }
}

/// Result of a completed run, handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Name of the input volume.
    pub volume_name: String,
    /// Calcified volume inside the heart, when calcifications were
    /// requested.
    pub calcium_volume_mm3: Option<f64>,
    /// Final cropping coordinates, when cropping ran.
    pub coordinates: Option<RoiCoordinates>,
    /// Per-stage diagnostics.
    pub diagnostics: RunDiagnostics,
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Segmentation {
            backend,
            partial,
            foreground_voxels,
            backend_seconds,
        } => {
            let kind = if *partial { "partial" } else { "full" };
            let reported =
                backend_seconds.map_or_else(String::new, |s| format!(" (backend {s:.2}s)"));
            format!("{backend} {kind}, {foreground_voxels} fg voxels{reported}")
        }
        StageMetrics::LocateAndCrop {
            backend,
            roi,
            backend_seconds,
        } => {
            let reported =
                backend_seconds.map_or_else(String::new, |s| format!(" (backend {s:.2}s)"));
            format!("{backend} {roi}{reported}")
        }
        StageMetrics::Coordinates { roi, margin } => format!("{roi} margin={margin}"),
        StageMetrics::Cropping { before, after } => format!("{before:?} -> {after:?}"),
        StageMetrics::Threshold {
            threshold,
            voxel_count,
        } => format!(">= {threshold} HU, {voxel_count} voxels"),
        StageMetrics::Quantification {
            voxel_count,
            volume_mm3,
        } => format!("{voxel_count} voxels, {volume_mm3:.2} mm³"),
        StageMetrics::Display { name, surface_3d } => {
            if *surface_3d {
                format!("{name} (3D)")
            } else {
                name.clone()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> RunDiagnostics {
        RunDiagnostics {
            stages: vec![
                StageDiagnostics {
                    stage: StageId::HeartSegmentation,
                    duration: Duration::from_millis(80),
                    metrics: StageMetrics::Segmentation {
                        backend: "local".to_string(),
                        partial: false,
                        foreground_voxels: 1200,
                        backend_seconds: Some(0.07),
                    },
                },
                StageDiagnostics {
                    stage: StageId::Cropping,
                    duration: Duration::from_millis(5),
                    metrics: StageMetrics::Cropping {
                        before: [64, 64, 64],
                        after: [41, 51, 51],
                    },
                },
                StageDiagnostics {
                    stage: StageId::Quantification,
                    duration: Duration::from_millis(15),
                    metrics: StageMetrics::Quantification {
                        voxel_count: 500,
                        volume_mm3: 500.0,
                    },
                },
            ],
            total_duration: Duration::from_millis(100),
            input_shape: [64, 64, 64],
            working_shape: [41, 51, 51],
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        let ms = duration_ms(d);
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn report_lists_every_stage() {
        let report = sample().report();
        assert!(report.contains("Run Diagnostics Report"));
        assert!(report.contains("Heart Segmentation"));
        assert!(report.contains("[64, 64, 64] -> [41, 51, 51]"));
        assert!(report.contains("500.00 mm³"));
    }

    #[test]
    fn stage_lookup() {
        let diag = sample();
        assert!(diag.stage(StageId::Cropping).is_some());
        assert!(diag.stage(StageId::LocateAndCrop).is_none());
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!((json["total_duration"].as_f64().unwrap() - 0.1).abs() < 1e-9);
        let back: RunDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.stages.len(), 3);
        assert_eq!(back.working_shape, [41, 51, 51]);
        assert_eq!(back.stages[1].metrics, sample().stages[1].metrics);
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["total_duration"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<RunDiagnostics>(json).is_err());
    }
}
