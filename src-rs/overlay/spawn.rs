use async_trait::async_trait;
use log::{debug, info, warn};
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::task::JoinHandle;
use wait_timeout::ChildExt;

use super::transport::{DeliveryPath, LivenessToken, RenderTransport};
use crate::error::TransportError;
use crate::model::{PredictedStep, RenderRequest};

/// How long a fallback marker stays on screen. Fixed; request durations are ignored.
pub const MARKER_LIFETIME: Duration = Duration::from_secs(5);
/// Extra time the monitor allows before killing a marker that did not exit.
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

pub const MARKER_BIN_NAME: &str = "screen-pointer-marker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerExit {
    Exited(Option<i32>),
    Killed,
    WaitFailed(String),
}

/// Positional arguments understood by the marker binary:
/// `-- label x y width height description`. Label and description are free
/// text from the service, so `--` keeps a leading dash from reading as a flag.
pub fn marker_args(step: &PredictedStep) -> Vec<String> {
    vec![
        "--".to_string(),
        step.label.clone(),
        format_coord(step.rect.x),
        format_coord(step.rect.y),
        format_coord(step.rect.width),
        format_coord(step.rect.height),
        step.description.clone(),
    ]
}

fn format_coord(value: f64) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    if rounded == 0.0 || !rounded.is_finite() {
        return "0".to_string();
    }
    format!("{rounded}")
}

/// The marker binary installed next to the running executable.
pub fn default_program() -> PathBuf {
    let file_name = format!("{MARKER_BIN_NAME}{}", env::consts::EXE_SUFFIX);
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

/// Fallback path: one independent short-lived process per overlay. It cannot
/// be dismissed early; it removes itself after [`MARKER_LIFETIME`].
pub struct ProcessSpawnTransport {
    program: PathBuf,
    overlay_dir: Option<PathBuf>,
    last_invocation: Option<MarkerInvocation>,
    monitors: Vec<JoinHandle<MarkerExit>>,
}

impl ProcessSpawnTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            overlay_dir: None,
            last_invocation: None,
            monitors: Vec::new(),
        }
    }

    pub fn with_overlay_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overlay_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn last_invocation(&self) -> Option<&MarkerInvocation> {
        self.last_invocation.as_ref()
    }

    /// Waits for every marker launched so far and reports how each ended.
    pub async fn wait_for_markers(&mut self) -> Vec<MarkerExit> {
        let mut exits = Vec::with_capacity(self.monitors.len());
        for monitor in self.monitors.drain(..) {
            exits.push(match monitor.await {
                Ok(exit) => exit,
                Err(err) => MarkerExit::WaitFailed(err.to_string()),
            });
        }
        exits
    }

    fn launch(&mut self, step: &PredictedStep) -> Result<(), TransportError> {
        let invocation = MarkerInvocation {
            program: self.program.clone(),
            args: marker_args(step),
        };
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        if let Some(dir) = &self.overlay_dir {
            cmd.env("SP_OVERLAY_DIR", dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| TransportError::Spawn(format!("{}: {err}", invocation.program.display())))?;
        info!(
            "launched marker pid {} for '{}'",
            child.id(),
            step.label
        );
        self.last_invocation = Some(invocation);

        self.monitors.retain(|monitor| !monitor.is_finished());
        self.monitors.push(tokio::task::spawn_blocking(move || {
            match child.wait_timeout(MARKER_LIFETIME + EXIT_GRACE) {
                Ok(Some(status)) if status.success() => {
                    debug!("marker exited with {status}");
                    MarkerExit::Exited(status.code())
                }
                Ok(Some(status)) => {
                    warn!("marker failed with {status}");
                    MarkerExit::Exited(status.code())
                }
                Ok(None) => {
                    warn!("marker outlived its lifetime; killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    MarkerExit::Killed
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    MarkerExit::WaitFailed(err.to_string())
                }
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl RenderTransport for ProcessSpawnTransport {
    async fn show(&mut self, requests: &[RenderRequest]) -> Result<DeliveryPath, TransportError> {
        if requests.is_empty() {
            return Err(TransportError::Rejected("no render requests".to_string()));
        }
        for request in requests {
            self.launch(&request.step)?;
        }
        Ok(DeliveryPath::FallbackProcess)
    }

    async fn hide(&mut self) -> Result<(), TransportError> {
        // Markers are independent processes with no control channel.
        info!("fallback markers cannot be dismissed early; they expire on their own");
        Ok(())
    }

    async fn ping(&mut self) -> Result<LivenessToken, TransportError> {
        Ok(LivenessToken(format!("spawn:{}", self.program.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScreenRect;

    fn step() -> PredictedStep {
        PredictedStep {
            id: "step-1".to_string(),
            label: "Save".to_string(),
            rect: ScreenRect::logical(100.0, 200.04, 100.25, 60.0),
            description: "toolbar".to_string(),
        }
    }

    #[test]
    fn args_are_positional_and_rounded() {
        assert_eq!(
            marker_args(&step()),
            vec!["--", "Save", "100", "200", "100.3", "60", "toolbar"]
        );
        assert_eq!(format_coord(-0.01), "0");
        assert_eq!(format_coord(f64::NAN), "0");
    }

    #[test]
    fn dashed_text_stays_after_separator() {
        let step = PredictedStep {
            label: "-5 volume".to_string(),
            description: "--help-style hint".to_string(),
            ..step()
        };
        let args = marker_args(&step);
        assert_eq!(args.len(), 7);
        assert_eq!(args[0], "--");
        assert_eq!(args[1], "-5 volume");
        assert_eq!(args[6], "--help-style hint");
    }

    #[test]
    fn default_program_sits_next_to_executable() {
        let program = default_program();
        let name = program.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(MARKER_BIN_NAME));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let mut transport = ProcessSpawnTransport::new("/nonexistent/screen-pointer-marker");
        let err = transport
            .show(&[RenderRequest::new(step(), Duration::from_secs(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
        assert!(transport.last_invocation().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launches_marker_and_monitors_exit() {
        let mut transport = ProcessSpawnTransport::new("true");
        let path = transport
            .show(&[RenderRequest::new(step(), Duration::from_secs(1))])
            .await
            .unwrap();
        assert_eq!(path, DeliveryPath::FallbackProcess);
        let invocation = transport.last_invocation().unwrap();
        assert_eq!(invocation.program, PathBuf::from("true"));
        assert_eq!(invocation.args[..2], ["--", "Save"]);
        assert_eq!(transport.wait_for_markers().await, vec![MarkerExit::Exited(Some(0))]);
        transport.hide().await.unwrap();
    }
}
