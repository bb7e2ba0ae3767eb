use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::analysis::AnalysisClient;
use crate::capture::ScreenCapture;
use crate::error::AnalysisError;
use crate::geometry::ScreenContext;
use crate::model::{CalibrationResult, PredictedStep, LOW_CONFIDENCE_THRESHOLD};
use crate::overlay::{OverlaySupervisor, RenderOutcome, RenderTransport};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(800);

/// Outcome of one render-and-verify pass. `skipped` explains why no
/// verification happened; `result` is set otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub step: Option<PredictedStep>,
    pub rendered: Option<RenderOutcome>,
    pub result: Option<CalibrationResult>,
    pub low_confidence: bool,
    pub skipped: Option<String>,
}

impl CalibrationReport {
    fn skipped(step: Option<PredictedStep>, rendered: Option<RenderOutcome>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("calibration skipped: {reason}");
        Self {
            step,
            rendered,
            result: None,
            low_confidence: false,
            skipped: Some(reason),
        }
    }
}

/// Render, let the overlay settle, recapture, ask the service how well the
/// marker landed. One pass; a low score is reported, not re-rendered.
#[derive(Clone)]
pub struct CalibrationLoop {
    client: AnalysisClient,
    settle_delay: Duration,
    threshold: f64,
    display_duration: Duration,
}

impl CalibrationLoop {
    pub fn new(client: AnalysisClient) -> Self {
        Self {
            client,
            settle_delay: DEFAULT_SETTLE_DELAY,
            threshold: LOW_CONFIDENCE_THRESHOLD,
            display_duration: Duration::from_secs(5),
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_display_duration(mut self, display_duration: Duration) -> Self {
        self.display_duration = display_duration;
        self
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn display_duration(&self) -> Duration {
        self.display_duration
    }

    pub async fn run<T: RenderTransport>(
        &self,
        initial_steps: &[PredictedStep],
        render: &mut OverlaySupervisor<T>,
        capture: Arc<dyn ScreenCapture>,
        ctx: &ScreenContext,
    ) -> Result<CalibrationReport, AnalysisError> {
        let Some(step) = initial_steps.first() else {
            return Ok(CalibrationReport::skipped(None, None, "no prediction to calibrate"));
        };
        if initial_steps.len() > 1 {
            info!(
                "calibrating the first of {} predictions only",
                initial_steps.len()
            );
        }

        let outcome = render.render(step, ctx, self.display_duration).await;
        self.verify_rendered(step, outcome, capture, &CancellationToken::new())
            .await
    }

    /// Post-render half: settle, capture, verify. `step` is the prediction as
    /// the service stated it, not the clamped rect that was drawn.
    pub async fn verify_rendered(
        &self,
        step: &PredictedStep,
        rendered: RenderOutcome,
        capture: Arc<dyn ScreenCapture>,
        cancel: &CancellationToken,
    ) -> Result<CalibrationReport, AnalysisError> {
        if let RenderOutcome::NotShown { reason } = &rendered {
            let reason = format!("overlay was not shown: {reason}");
            return Ok(CalibrationReport::skipped(Some(step.clone()), Some(rendered), reason));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        let captured = match tokio::task::spawn_blocking(move || capture.capture()).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(err)) => {
                warn!("recapture failed: {err:#}");
                return Ok(CalibrationReport::skipped(
                    Some(step.clone()),
                    Some(rendered),
                    format!("screen capture failed: {err:#}"),
                ));
            }
            Err(err) => {
                warn!("recapture worker failed: {err}");
                return Ok(CalibrationReport::skipped(
                    Some(step.clone()),
                    Some(rendered),
                    format!("screen capture failed: {err}"),
                ));
            }
        };

        let result = self
            .client
            .verify_with_cancel(&captured.bytes, step, &captured.ctx, cancel)
            .await?;
        let low_confidence = result.is_low_confidence(self.threshold);
        if low_confidence {
            warn!(
                "low calibration confidence for '{}': {:.2} < {:.2} ({})",
                step.label, result.accuracy_score, self.threshold, result.feedback
            );
        } else {
            info!(
                "calibration for '{}' scored {:.2}",
                step.label, result.accuracy_score
            );
        }

        Ok(CalibrationReport {
            step: Some(step.clone()),
            rendered: Some(rendered),
            result: Some(result),
            low_confidence,
            skipped: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::{reply, ScriptedTransport};
    use crate::analysis::RetryPolicy;
    use crate::capture::FileCapture;
    use crate::error::TransportError;
    use crate::geometry::{GeometryLimits, ScreenRect};
    use crate::overlay::transport::testing::RecordingTransport;
    use crate::overlay::DeliveryPath;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn screenshot() -> (TempDir, Arc<dyn ScreenCapture>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("screen.png");
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 48, Rgba([200, 200, 200, 255])))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        let capture: Arc<dyn ScreenCapture> =
            Arc::new(FileCapture::new(path, Some(ScreenContext::new(1440.0, 900.0, 2.0))));
        (dir, capture)
    }

    fn step(label: &str) -> PredictedStep {
        PredictedStep {
            id: format!("step-{label}"),
            label: label.to_string(),
            rect: ScreenRect::physical(200.0, 400.0, 100.0, 60.0),
            description: "toolbar".to_string(),
        }
    }

    fn supervisor(log: Arc<Mutex<Vec<String>>>, fail: bool) -> OverlaySupervisor<RecordingTransport> {
        let mut transport = RecordingTransport::new("host", DeliveryPath::Channel, log);
        if fail {
            transport = transport.failing(TransportError::Unavailable("down".to_string()));
        }
        OverlaySupervisor::new(transport, GeometryLimits::default())
    }

    fn calibration(transport: Arc<ScriptedTransport>) -> CalibrationLoop {
        CalibrationLoop::new(AnalysisClient::new(transport, RetryPolicy::default()))
            .with_settle_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn renders_first_step_and_flags_low_confidence() {
        let transport = ScriptedTransport::new(vec![reply(
            200,
            r#"{"accuracy_score": 0.55, "position_offset": {"x": 12, "y": -4}, "size_correction": {"width": 0, "height": 0}, "feedback": "slightly left"}"#,
        )]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut overlay = supervisor(log.clone(), false);
        let (_dir, capture) = screenshot();

        let report = calibration(transport.clone())
            .run(
                &[step("Save"), step("Open")],
                &mut overlay,
                capture,
                &ScreenContext::new(1440.0, 900.0, 2.0),
            )
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["host:show:Save"]);
        assert!(report.low_confidence);
        assert_eq!(report.result.unwrap().position_offset.x, 12.0);
        assert_eq!(transport.call_count(), 1);
        let body = transport.last_body();
        assert_eq!(body["original_step"]["text"], "Save");
        assert_eq!(body["original_step"]["x"], 200.0);
        assert_eq!(body["scale_factor"], 2.0);
    }

    #[tokio::test]
    async fn confident_result_is_not_flagged() {
        let transport = ScriptedTransport::new(vec![reply(200, r#"{"accuracy_score": 0.93, "feedback": "ok"}"#)]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut overlay = supervisor(log, false);
        let (_dir, capture) = screenshot();

        let report = calibration(transport)
            .run(&[step("Save")], &mut overlay, capture, &ScreenContext::default())
            .await
            .unwrap();
        assert!(!report.low_confidence);
        assert!(report.skipped.is_none());
    }

    #[tokio::test]
    async fn nothing_rendered_means_no_verification() {
        let transport = ScriptedTransport::new(vec![]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut overlay = supervisor(log, true);
        let (_dir, capture) = screenshot();

        let report = calibration(transport.clone())
            .run(&[step("Save")], &mut overlay, capture, &ScreenContext::default())
            .await
            .unwrap();
        assert!(report.result.is_none());
        assert!(report.skipped.unwrap().contains("not shown"));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_prediction_list_is_skipped() {
        let transport = ScriptedTransport::new(vec![]);
        let mut overlay = supervisor(Arc::new(Mutex::new(Vec::new())), false);
        let (_dir, capture) = screenshot();

        let report = calibration(transport)
            .run(&[], &mut overlay, capture, &ScreenContext::default())
            .await
            .unwrap();
        assert!(report.step.is_none());
        assert!(report.skipped.is_some());
    }

    #[tokio::test]
    async fn cancellation_during_settle_aborts() {
        let transport = ScriptedTransport::new(vec![]);
        let (_dir, capture) = screenshot();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = calibration(transport.clone())
            .with_settle_delay(Duration::from_secs(60))
            .verify_rendered(
                &step("Save"),
                RenderOutcome::Shown {
                    path: DeliveryPath::Channel,
                    rect: ScreenRect::logical(100.0, 200.0, 100.0, 60.0),
                },
                capture,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
        assert_eq!(transport.call_count(), 0);
    }
}
