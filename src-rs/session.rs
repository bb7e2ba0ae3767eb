use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::analysis::payload::compress_for_upload;
use crate::analysis::AnalysisClient;
use crate::calibration::{CalibrationLoop, CalibrationReport};
use crate::capture::ScreenCapture;
use crate::error::AnalysisError;
use crate::geometry::ScreenContext;
use crate::model::{AnalysisReply, PredictedStep};
use crate::overlay::{OverlaySupervisor, RenderOutcome, RenderTransport};

#[derive(Debug, Clone)]
pub enum SessionCommand {
    Ask { question: String },
    Hide,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Answered {
        generation: u64,
        message: String,
        step: Option<PredictedStep>,
    },
    Rendered {
        generation: u64,
        outcome: RenderOutcome,
    },
    Calibrated {
        generation: u64,
        report: CalibrationReport,
    },
    Failed {
        generation: u64,
        message: String,
    },
    Hidden,
    Expired,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub display_duration: Duration,
    pub upload_ceiling: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            display_duration: Duration::from_secs(5),
            upload_ceiling: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
enum WorkerFailure {
    Capture(String),
    Analysis(AnalysisError),
}

impl WorkerFailure {
    fn user_message(&self) -> String {
        match self {
            Self::Capture(reason) => format!("The screen could not be captured: {reason}"),
            Self::Analysis(err) => err.user_message(),
        }
    }
}

struct Located {
    reply: AnalysisReply,
    ctx: ScreenContext,
}

enum WorkerReport {
    Analysis {
        generation: u64,
        result: Result<Located, WorkerFailure>,
    },
    Calibration {
        generation: u64,
        result: Result<CalibrationReport, AnalysisError>,
    },
}

/// The foreground coordinator. Owns the overlay exclusively; analysis,
/// capture and calibration run on workers whose results are tagged with the
/// request generation. Only the newest generation is ever acted on.
pub struct Session<T> {
    client: AnalysisClient,
    overlay: OverlaySupervisor<T>,
    capture: Arc<dyn ScreenCapture>,
    calibration: Option<CalibrationLoop>,
    options: SessionOptions,
    generation: u64,
    in_flight: Option<CancellationToken>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<T: RenderTransport> Session<T> {
    pub fn new(
        client: AnalysisClient,
        overlay: OverlaySupervisor<T>,
        capture: Arc<dyn ScreenCapture>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            client,
            overlay,
            capture,
            calibration: None,
            options: SessionOptions::default(),
            generation: 0,
            in_flight: None,
            events,
        }
    }

    pub fn with_calibration(mut self, calibration: CalibrationLoop) -> Self {
        self.calibration = Some(calibration);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let (report_tx, mut reports) = mpsc::unbounded_channel::<WorkerReport>();
        loop {
            let deadline = self.overlay.expires_at();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Ask { question }) => self.ask(question, &report_tx),
                    Some(SessionCommand::Hide) => {
                        self.overlay.hide().await;
                        self.emit(SessionEvent::Hidden);
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report, &report_tx).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.overlay.expire_if_due(Instant::now()).await {
                        self.emit(SessionEvent::Expired);
                    }
                }
            }
        }

        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
        self.overlay.hide().await;
        info!("session stopped after {} request(s)", self.generation);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event dropped; no listener");
        }
    }

    fn ask(&mut self, question: String, reports: &mpsc::UnboundedSender<WorkerReport>) {
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.in_flight = Some(cancel.clone());
        info!("request {generation}: {question}");

        let client = self.client.clone();
        let capture = self.capture.clone();
        let ceiling = self.options.upload_ceiling;
        let reports = reports.clone();
        tokio::spawn(async move {
            let result = locate(client, capture, ceiling, question, cancel).await;
            let _ = reports.send(WorkerReport::Analysis { generation, result });
        });
    }

    async fn handle_report(&mut self, report: WorkerReport, reports: &mpsc::UnboundedSender<WorkerReport>) {
        match report {
            WorkerReport::Analysis { generation, .. } | WorkerReport::Calibration { generation, .. }
                if generation != self.generation =>
            {
                debug!("discarding stale result for request {generation}");
            }
            WorkerReport::Analysis { generation, result } => match result {
                Ok(located) => self.show_answer(generation, located, reports).await,
                Err(WorkerFailure::Analysis(AnalysisError::Cancelled)) => {
                    debug!("request {generation} was cancelled");
                }
                Err(failure) => {
                    warn!("request {generation} failed: {failure:?}");
                    self.emit(SessionEvent::Failed {
                        generation,
                        message: failure.user_message(),
                    });
                }
            },
            WorkerReport::Calibration { generation, result } => match result {
                Ok(report) => self.emit(SessionEvent::Calibrated { generation, report }),
                Err(AnalysisError::Cancelled) => debug!("calibration {generation} was cancelled"),
                Err(err) => {
                    warn!("calibration {generation} failed: {err}");
                    self.emit(SessionEvent::Failed {
                        generation,
                        message: err.user_message(),
                    });
                }
            },
        }
    }

    async fn show_answer(
        &mut self,
        generation: u64,
        located: Located,
        reports: &mpsc::UnboundedSender<WorkerReport>,
    ) {
        let Located { reply, ctx } = located;
        let best = reply.best().cloned();
        self.emit(SessionEvent::Answered {
            generation,
            message: reply.message.clone(),
            step: best.clone(),
        });
        let Some(step) = best else {
            return;
        };

        let outcome = self
            .overlay
            .render(&step, &ctx, self.options.display_duration)
            .await;
        self.emit(SessionEvent::Rendered {
            generation,
            outcome: outcome.clone(),
        });

        let (Some(calibration), Some(cancel)) = (self.calibration.clone(), self.in_flight.clone()) else {
            return;
        };
        if !outcome.is_shown() {
            return;
        }
        let capture = self.capture.clone();
        let reports = reports.clone();
        tokio::spawn(async move {
            let result = calibration
                .verify_rendered(&step, outcome, capture, &cancel)
                .await;
            let _ = reports.send(WorkerReport::Calibration { generation, result });
        });
    }
}

async fn locate(
    client: AnalysisClient,
    capture: Arc<dyn ScreenCapture>,
    ceiling: usize,
    question: String,
    cancel: CancellationToken,
) -> Result<Located, WorkerFailure> {
    let grabbed = tokio::task::spawn_blocking(move || {
        let screen = capture.capture()?;
        let payload = compress_for_upload(&screen.bytes, ceiling)?;
        Ok::<_, anyhow::Error>((payload, screen.ctx))
    })
    .await;
    let (payload, ctx) = match grabbed {
        Ok(Ok(grabbed)) => grabbed,
        Ok(Err(err)) => return Err(WorkerFailure::Capture(format!("{err:#}"))),
        Err(err) => return Err(WorkerFailure::Capture(err.to_string())),
    };

    let mut reply = client
        .analyze_with_cancel(&payload.bytes, &question, &ctx, &cancel)
        .await
        .map_err(WorkerFailure::Analysis)?;
    payload.rescale_reply(&mut reply);
    Ok(Located { reply, ctx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::{reply, ScriptedTransport};
    use crate::analysis::RetryPolicy;
    use crate::capture::FileCapture;
    use crate::geometry::GeometryLimits;
    use crate::overlay::transport::testing::RecordingTransport;
    use crate::overlay::DeliveryPath;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const STEPS_BODY: &str = r#"{"message": "Click Save", "steps": [{"text": "Save", "x": 200, "y": 400, "width": 100, "height": 60, "description": "toolbar"}]}"#;

    struct Harness {
        _dir: TempDir,
        commands: mpsc::Sender<SessionCommand>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        overlay_log: Arc<Mutex<Vec<String>>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(
        replies: Vec<Result<crate::analysis::HttpReply, crate::analysis::NetworkFailure>>,
        display: Duration,
        calibrate: bool,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let path = dir.path().join("screen.png");
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(96, 64, Rgba([240, 240, 240, 255])))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        let capture: Arc<dyn ScreenCapture> =
            Arc::new(FileCapture::new(path, Some(ScreenContext::new(1440.0, 900.0, 2.0))));

        let client = AnalysisClient::new(ScriptedTransport::new(replies), RetryPolicy::default());
        let overlay_log = Arc::new(Mutex::new(Vec::new()));
        let overlay = OverlaySupervisor::new(
            RecordingTransport::new("host", DeliveryPath::Channel, overlay_log.clone()),
            GeometryLimits::default(),
        );
        let (event_tx, events) = mpsc::unbounded_channel();
        let mut session = Session::new(client.clone(), overlay, capture, event_tx).with_options(SessionOptions {
            display_duration: display,
            upload_ceiling: 1_000_000,
        });
        if calibrate {
            session = session
                .with_calibration(CalibrationLoop::new(client).with_settle_delay(Duration::from_millis(10)));
        }
        let (commands, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(session.run(command_rx));
        Harness {
            _dir: dir,
            commands,
            events,
            overlay_log,
            task,
        }
    }

    async fn ask(harness: &Harness, question: &str) {
        harness
            .commands
            .send(SessionCommand::Ask {
                question: question.to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn question_is_answered_and_rendered() {
        let mut harness = start(vec![reply(200, STEPS_BODY)], Duration::from_secs(30), false);
        ask(&harness, "where is save?").await;

        match harness.events.recv().await.unwrap() {
            SessionEvent::Answered { generation, message, step } => {
                assert_eq!(generation, 1);
                assert_eq!(message, "Click Save");
                assert_eq!(step.unwrap().label, "Save");
            }
            other => panic!("unexpected event {other:?}"),
        }
        match harness.events.recv().await.unwrap() {
            SessionEvent::Rendered { outcome, .. } => assert!(outcome.is_shown()),
            other => panic!("unexpected event {other:?}"),
        }

        harness.commands.send(SessionCommand::Hide).await.unwrap();
        assert!(matches!(harness.events.recv().await.unwrap(), SessionEvent::Hidden));
        harness.commands.send(SessionCommand::Shutdown).await.unwrap();
        harness.task.await.unwrap();
        assert_eq!(
            *harness.overlay_log.lock().unwrap(),
            vec!["host:show:Save", "host:hide"]
        );
    }

    #[tokio::test]
    async fn only_the_newest_request_is_shown() {
        let mut harness = start(
            vec![reply(200, STEPS_BODY), reply(200, STEPS_BODY)],
            Duration::from_secs(30),
            false,
        );
        ask(&harness, "first").await;
        ask(&harness, "second").await;

        let mut answered = Vec::new();
        loop {
            match harness.events.recv().await.unwrap() {
                SessionEvent::Answered { generation, .. } => answered.push(generation),
                SessionEvent::Rendered { generation, .. } => {
                    assert_eq!(generation, 2);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        harness.commands.send(SessionCommand::Shutdown).await.unwrap();
        harness.task.await.unwrap();
        assert_eq!(answered, vec![2]);
        while let Ok(event) = harness.events.try_recv() {
            panic!("unexpected trailing event {event:?}");
        }
    }

    #[tokio::test]
    async fn failures_surface_user_messages() {
        let mut harness = start(vec![reply(400, "bad image")], Duration::from_secs(30), false);
        ask(&harness, "where?").await;

        match harness.events.recv().await.unwrap() {
            SessionEvent::Failed { generation, message } => {
                assert_eq!(generation, 1);
                assert!(message.contains("bad image"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(harness.overlay_log.lock().unwrap().is_empty());
        drop(harness.commands);
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn overlay_expires_in_foreground_loop() {
        let mut harness = start(vec![reply(200, STEPS_BODY)], Duration::from_millis(50), false);
        ask(&harness, "where is save?").await;

        let mut saw_expired = false;
        while let Some(event) = harness.events.recv().await {
            if matches!(event, SessionEvent::Expired) {
                saw_expired = true;
                break;
            }
        }
        assert!(saw_expired);
        assert_eq!(
            *harness.overlay_log.lock().unwrap(),
            vec!["host:show:Save", "host:hide"]
        );
        harness.commands.send(SessionCommand::Shutdown).await.unwrap();
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn rendered_overlay_is_calibrated() {
        let mut harness = start(
            vec![
                reply(200, STEPS_BODY),
                reply(200, r#"{"accuracy_score": +0.9, "feedback": "covers the button"}"#),
            ],
            Duration::from_secs(30),
            true,
        );
        ask(&harness, "where is save?").await;

        let report = loop {
            match harness.events.recv().await.unwrap() {
                SessionEvent::Calibrated { report, .. } => break report,
                SessionEvent::Failed { message, .. } => panic!("failed: {message}"),
                _ => {}
            }
        };
        assert!(!report.low_confidence);
        assert_eq!(report.result.unwrap().accuracy_score, 0.9);
        harness.commands.send(SessionCommand::Shutdown).await.unwrap();
        harness.task.await.unwrap();
    }
}
