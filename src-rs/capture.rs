use anyhow::{bail, Context, Result};
use image::ImageReader;
use log::debug;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::geometry::ScreenContext;

#[derive(Debug, Clone)]
pub struct CapturedScreen {
    pub bytes: Vec<u8>,
    pub ctx: ScreenContext,
}

/// Blocking screen grab; callers run it on a blocking worker.
pub trait ScreenCapture: Send + Sync {
    fn capture(&self) -> Result<CapturedScreen>;
}

/// Shells out to the platform screenshot tool (`screencapture` on macOS,
/// `grim` elsewhere) and reads the file it writes.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    scratch_dir: PathBuf,
    ctx: Option<ScreenContext>,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(scratch_dir: impl Into<PathBuf>, ctx: Option<ScreenContext>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            ctx,
            timeout: Duration::from_secs(10),
        }
    }

    fn command(out_path: &Path) -> Command {
        let mut cmd = if cfg!(target_os = "macos") {
            let mut cmd = Command::new("screencapture");
            cmd.arg("-x");
            cmd
        } else {
            Command::new("grim")
        };
        cmd.arg(out_path);
        cmd
    }
}

impl ScreenCapture for CommandCapture {
    fn capture(&self) -> Result<CapturedScreen> {
        fs::create_dir_all(&self.scratch_dir).with_context(|| {
            format!("failed to create capture dir: {}", self.scratch_dir.display())
        })?;
        let out_path = self.scratch_dir.join("capture.png");
        let _ = fs::remove_file(&out_path);

        let mut cmd = Self::command(&out_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let mut child = cmd.spawn().context("failed to launch screenshot tool")?;
        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("screenshot tool timed out after {}s", self.timeout.as_secs());
            }
        };
        if !status.success() {
            bail!("screenshot tool failed with {status}");
        }

        let bytes = fs::read(&out_path)
            .with_context(|| format!("failed to read capture: {}", out_path.display()))?;
        debug!("captured {} bytes via {}", bytes.len(), out_path.display());
        screen_from_bytes(bytes, self.ctx)
    }
}

/// Serves a fixed image file as "the screen". Used by `locate --image` and tests.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
    ctx: Option<ScreenContext>,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>, ctx: Option<ScreenContext>) -> Self {
        Self {
            path: path.into(),
            ctx,
        }
    }
}

impl ScreenCapture for FileCapture {
    fn capture(&self) -> Result<CapturedScreen> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("failed to read screenshot: {}", self.path.display()))?;
        screen_from_bytes(bytes, self.ctx)
    }
}

/// Without an explicit context the image is taken as a 1x logical screen.
fn screen_from_bytes(bytes: Vec<u8>, ctx: Option<ScreenContext>) -> Result<CapturedScreen> {
    let ctx = match ctx {
        Some(ctx) => ctx,
        None => {
            let (width, height) = ImageReader::new(Cursor::new(&bytes))
                .with_guessed_format()
                .context("failed to sniff screenshot format")?
                .into_dimensions()
                .context("failed to read screenshot dimensions")?;
            ScreenContext::new(f64::from(width), f64::from(height), 1.0)
        }
    };
    Ok(CapturedScreen { bytes, ctx })
}
