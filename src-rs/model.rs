use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::geometry::ScreenRect;

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// One predicted UI element. Immutable once produced by an analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedStep {
    pub id: String,
    pub label: String,
    pub rect: ScreenRect,
    pub description: String,
}

impl PredictedStep {
    pub fn with_rect(&self, rect: ScreenRect) -> Self {
        Self {
            rect,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReply {
    pub message: String,
    pub steps: Vec<PredictedStep>,
}

impl AnalysisReply {
    pub fn best(&self) -> Option<&PredictedStep> {
        self.steps.first()
    }
}

/// What crosses the process boundary to the rendering host: an owned copy of a
/// logical-space step and how long to show it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub step: PredictedStep,
    pub duration_ms: u64,
}

impl RenderRequest {
    pub fn new(step: PredictedStep, duration: Duration) -> Self {
        Self {
            step,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionOffset {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeCorrection {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub accuracy_score: f64,
    pub position_offset: PositionOffset,
    pub size_correction: SizeCorrection,
    pub feedback: String,
    /// Advisory, already logical; never routed through the transform.
    pub corrected_rect: Option<ScreenRect>,
}

impl CalibrationResult {
    pub fn is_low_confidence(&self, threshold: f64) -> bool {
        self.accuracy_score < threshold
    }
}
