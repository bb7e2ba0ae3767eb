use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use screen_pointer::analysis::http::HttpTransport;
use screen_pointer::analysis::payload::compress_for_upload;
use screen_pointer::analysis::AnalysisClient;
use screen_pointer::calibration::CalibrationLoop;
use screen_pointer::capture::{CommandCapture, FileCapture, ScreenCapture};
use screen_pointer::config::Settings;
use screen_pointer::geometry::{to_logical_with, ScreenContext, ScreenRect};
use screen_pointer::overlay::canvas::{FrameSink, MarkerStyle};
use screen_pointer::overlay::channel::{ChannelConfig, ChannelTransport};
use screen_pointer::overlay::host::RenderHost;
use screen_pointer::overlay::spawn::{default_program, ProcessSpawnTransport};
use screen_pointer::overlay::{DefaultTransport, FallbackTransport, OverlaySupervisor, RenderTransport};
use screen_pointer::parser;
use screen_pointer::session::{Session, SessionCommand, SessionOptions};

#[derive(Parser, Debug)]
#[command(
    name = "screen-pointer",
    version,
    about = "Ask where something is on screen, highlight it, and check the highlight"
)]
struct Cli {
    /// Settings JSON (default: $SP_CONFIG, then .screen-pointer/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Convert a service rectangle into the clamped logical rectangle that would be drawn
    Transform(TransformArgs),
    /// Parse a raw service response (file or stdin) the way the client does
    Parse(ParseArgs),
    /// Capture the screen, ask one question, highlight the answer
    Locate(LocateArgs),
    /// Interactive session: one question per stdin line, `hide` and `quit` commands
    Watch(WatchArgs),
    /// Run the long-lived rendering host
    Host(HostArgs),
    /// Check that the rendering host answers
    Ping,
    /// Dismiss whatever the rendering host is showing
    Hide,
}

#[derive(Args, Debug)]
struct ScreenArgs {
    /// Logical screen width (default: derived from the capture)
    #[arg(long)]
    screen_width: Option<f64>,
    /// Logical screen height (default: derived from the capture)
    #[arg(long)]
    screen_height: Option<f64>,
    /// Physical pixels per logical point
    #[arg(long, default_value_t = 1.0)]
    scale: f64,
}

impl ScreenArgs {
    fn context(&self) -> Option<ScreenContext> {
        match (self.screen_width, self.screen_height) {
            (Some(width), Some(height)) => Some(ScreenContext::new(width, height, self.scale)),
            _ => None,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SpaceArg {
    Physical,
    Logical,
}

#[derive(Args, Debug)]
struct TransformArgs {
    #[arg(long, allow_negative_numbers = true)]
    x: f64,
    #[arg(long, allow_negative_numbers = true)]
    y: f64,
    #[arg(long)]
    width: f64,
    #[arg(long)]
    height: f64,
    /// Coordinate space of the input rectangle
    #[arg(long, value_enum, default_value = "physical")]
    space: SpaceArg,
    #[arg(long, default_value_t = 1920.0)]
    screen_width: f64,
    #[arg(long, default_value_t = 1080.0)]
    screen_height: f64,
    #[arg(long, default_value_t = 1.0)]
    scale: f64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ParseKind {
    Auto,
    Analysis,
    Calibration,
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Response file (default: stdin)
    input: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "auto")]
    kind: ParseKind,
    /// Also print the repaired JSON span
    #[arg(long, action = ArgAction::SetTrue)]
    show_repair: bool,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Question about the screen, e.g. "where is the save button?"
    question: String,
    /// Use this screenshot instead of capturing the screen
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    screen: ScreenArgs,
    /// Only print the answer; do not draw anything
    #[arg(long, action = ArgAction::SetTrue)]
    no_render: bool,
    /// Re-capture after drawing and ask the service how well the marker landed
    #[arg(long, action = ArgAction::SetTrue)]
    calibrate: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Serve captures from this screenshot instead of the screen
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    screen: ScreenArgs,
    /// Skip the render-and-verify pass after each answer
    #[arg(long, action = ArgAction::SetTrue)]
    no_calibrate: bool,
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Listen address (default: overlay.host_addr)
    #[arg(long)]
    addr: Option<String>,
    /// Where frames are published (default: overlay.overlay_dir)
    #[arg(long)]
    overlay_dir: Option<PathBuf>,
}

fn main() {
    screen_pointer::init_logging();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Transform(args) => command_transform(args, &settings),
        Commands::Parse(args) => command_parse(args),
        command => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(async move {
                match command {
                    Commands::Locate(args) => command_locate(args, &settings).await,
                    Commands::Watch(args) => command_watch(args, &settings).await,
                    Commands::Host(args) => command_host(args, &settings).await,
                    Commands::Ping => command_ping(&settings).await,
                    Commands::Hide => command_hide(&settings).await,
                    Commands::Commands | Commands::Transform(_) | Commands::Parse(_) => Ok(()),
                }
            })
        }
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({"name": "transform", "description": "Clamp a service rectangle into drawable logical geometry."}),
        json!({"name": "parse", "description": "Decode a raw service response with repair and extraction fallbacks."}),
        json!({"name": "locate", "description": "Capture, ask, highlight, and optionally calibrate once."}),
        json!({"name": "watch", "description": "Interactive session with last-request-wins semantics."}),
        json!({"name": "host", "description": "Serve the overlay control plane and publish marker frames."}),
        json!({"name": "ping", "description": "Probe the rendering host."}),
        json!({"name": "hide", "description": "Dismiss the current overlay on the rendering host."}),
    ];
    print_json(&json!({ "commands": rows }))
}

fn command_transform(args: TransformArgs, settings: &Settings) -> Result<()> {
    let input = match args.space {
        SpaceArg::Physical => ScreenRect::physical(args.x, args.y, args.width, args.height),
        SpaceArg::Logical => ScreenRect::logical(args.x, args.y, args.width, args.height),
    };
    let ctx = ScreenContext::new(args.screen_width, args.screen_height, args.scale);
    let output = to_logical_with(&input, &ctx, &settings.geometry);
    print_json(&json!({
        "input": input,
        "screen": ctx,
        "limits": settings.geometry,
        "output": output,
    }))
}

fn command_parse(args: ParseArgs) -> Result<()> {
    let raw = match &args.input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read response: {}", path.display()))?,
        None => {
            let mut raw = String::new();
            io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read response from stdin")?;
            raw
        }
    };

    let (value, recovery) = match args.kind {
        ParseKind::Auto => {
            let parsed = parser::parse(&raw)?;
            (serde_json::to_value(parsed.value)?, parsed.recovery)
        }
        ParseKind::Analysis => {
            let parsed = parser::parse_analysis(&raw)?;
            (serde_json::to_value(parsed.value)?, parsed.recovery)
        }
        ParseKind::Calibration => {
            let parsed = parser::parse_calibration(&raw)?;
            (serde_json::to_value(parsed.value)?, parsed.recovery)
        }
    };

    let mut out = json!({ "recovery": recovery, "value": value });
    if args.show_repair {
        out["repaired"] = parser::repair(&raw).map(Value::String).unwrap_or(Value::Null);
    }
    print_json(&out)
}

async fn command_locate(args: LocateArgs, settings: &Settings) -> Result<()> {
    let client = build_client(settings)?;
    let capture = build_capture(args.image.as_deref(), args.screen.context(), settings);

    let ceiling = settings.service.upload_ceiling_bytes;
    let grab_capture = capture.clone();
    let (screen, upload) = tokio::task::spawn_blocking(move || -> Result<_> {
        let screen = grab_capture.capture()?;
        let upload = compress_for_upload(&screen.bytes, ceiling)?;
        Ok((screen, upload))
    })
    .await
    .context("capture worker failed")??;
    info!(
        "uploading {} bytes ({}, {}x{})",
        upload.bytes.len(),
        upload.media_type,
        upload.width,
        upload.height
    );

    let mut reply = match client.analyze(&upload.bytes, &args.question, &screen.ctx).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!("analysis failed: {err}");
            bail!("{}", err.user_message());
        }
    };
    if upload.is_downscaled() {
        info!(
            "mapping answer from {}x{} upload back to {}x{} capture",
            upload.width, upload.height, upload.source_width, upload.source_height
        );
    }
    upload.rescale_reply(&mut reply);
    let mut out = json!({
        "question": args.question,
        "screen": screen.ctx,
        "answer": reply,
    });

    let Some(step) = reply.best().cloned() else {
        return print_json(&out);
    };
    if args.no_render {
        out["logical"] = json!(to_logical_with(&step.rect, &screen.ctx, &settings.geometry));
        return print_json(&out);
    }

    let mut overlay = build_supervisor(settings);
    let duration = settings.overlay.display_duration();
    if args.calibrate {
        let calibration = build_calibration(client, settings);
        let report = calibration
            .run(std::slice::from_ref(&step), &mut overlay, capture, &screen.ctx)
            .await
            .map_err(|err| anyhow::anyhow!(err.user_message()))?;
        out["calibration"] = serde_json::to_value(&report)?;
    } else {
        let outcome = overlay.render(&step, &screen.ctx, duration).await;
        out["render"] = serde_json::to_value(&outcome)?;
    }
    out["phases"] = serde_json::to_value(overlay.history())?;
    print_json(&out)?;

    // Fallback markers outlive this call unless we wait for them.
    let markers = overlay.transport_mut().fallback_mut().wait_for_markers().await;
    if !markers.is_empty() {
        info!("fallback marker(s) finished: {markers:?}");
    }
    Ok(())
}

async fn command_watch(args: WatchArgs, settings: &Settings) -> Result<()> {
    let client = build_client(settings)?;
    let capture = build_capture(args.image.as_deref(), args.screen.context(), settings);
    let overlay = build_supervisor(settings);

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut session = Session::new(client.clone(), overlay, capture, event_tx).with_options(SessionOptions {
        display_duration: settings.overlay.display_duration(),
        upload_ceiling: settings.service.upload_ceiling_bytes,
    });
    if settings.calibration.enabled && !args.no_calibrate {
        session = session.with_calibration(build_calibration(client, settings));
    }

    let (command_tx, command_rx) = mpsc::channel(16);
    let session_task = tokio::spawn(session.run(command_rx));
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("failed to encode session event: {err}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let command = match line.trim() {
            "" => continue,
            "hide" => SessionCommand::Hide,
            "quit" | "exit" => break,
            question => SessionCommand::Ask {
                question: question.to_string(),
            },
        };
        if command_tx.send(command).await.is_err() {
            break;
        }
    }

    let _ = command_tx.send(SessionCommand::Shutdown).await;
    session_task.await.context("session task failed")?;
    printer.await.context("event printer failed")?;
    Ok(())
}

async fn command_host(args: HostArgs, settings: &Settings) -> Result<()> {
    let addr = args
        .addr
        .unwrap_or_else(|| settings.overlay.host_addr.clone());
    let dir = args
        .overlay_dir
        .unwrap_or_else(|| settings.overlay.overlay_dir.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind rendering host on {addr}"))?;

    let host = RenderHost::new(FrameSink::new(&dir), MarkerStyle::default());
    print_json(&json!({
        "addr": listener.local_addr()?.to_string(),
        "overlay_dir": abs_path(&dir).display().to_string(),
        "token": host.token(),
    }))?;

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    host.serve(listener, cancel).await
}

async fn command_ping(settings: &Settings) -> Result<()> {
    let mut channel = ChannelTransport::new(channel_config(settings));
    let token = channel.ping().await?;
    print_json(&json!({ "addr": channel.addr(), "token": token }))
}

async fn command_hide(settings: &Settings) -> Result<()> {
    let mut channel = ChannelTransport::new(channel_config(settings));
    channel.hide().await?;
    print_json(&json!({ "addr": channel.addr(), "hidden": true }))
}

fn build_client(settings: &Settings) -> Result<AnalysisClient> {
    let transport = HttpTransport::new(
        &settings.service.base_url,
        settings.service.api_key.clone(),
        Duration::from_millis(settings.service.timeout_ms),
    )?;
    Ok(AnalysisClient::new(Arc::new(transport), settings.retry.clone()))
}

fn build_capture(
    image: Option<&Path>,
    ctx: Option<ScreenContext>,
    settings: &Settings,
) -> Arc<dyn ScreenCapture> {
    match image {
        Some(path) => Arc::new(FileCapture::new(path, ctx)),
        None => Arc::new(CommandCapture::new(
            settings.overlay.overlay_dir.join("captures"),
            ctx,
        )),
    }
}

fn channel_config(settings: &Settings) -> ChannelConfig {
    ChannelConfig {
        addr: settings.overlay.host_addr.clone(),
        connect_timeout: Duration::from_millis(settings.overlay.connect_timeout_ms),
        call_timeout: Duration::from_millis(settings.overlay.call_timeout_ms),
    }
}

fn build_supervisor(settings: &Settings) -> OverlaySupervisor<DefaultTransport> {
    let program = settings
        .overlay
        .marker_bin
        .clone()
        .unwrap_or_else(default_program);
    let fallback =
        ProcessSpawnTransport::new(program).with_overlay_dir(settings.overlay.overlay_dir.clone());
    let transport = FallbackTransport::new(ChannelTransport::new(channel_config(settings)), fallback);
    OverlaySupervisor::new(transport, settings.geometry)
}

fn build_calibration(client: AnalysisClient, settings: &Settings) -> CalibrationLoop {
    CalibrationLoop::new(client)
        .with_settle_delay(settings.calibration.settle_delay())
        .with_threshold(settings.calibration.low_confidence_threshold)
        .with_display_duration(settings.overlay.display_duration())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_every_command() {
        let cli = Cli::try_parse_from([
            "screen-pointer",
            "transform",
            "--x",
            "-20",
            "--y",
            "400",
            "--width",
            "100",
            "--height",
            "60",
            "--scale",
            "2",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Transform(ref args) if args.x == -20.0));

        let cli = Cli::try_parse_from(["screen-pointer", "--config", "c.json", "locate", "where is save?", "--no-render"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
        assert!(matches!(cli.command, Commands::Locate(ref args) if args.no_render && !args.calibrate));

        for cmd in ["ping", "hide", "commands", "host", "watch", "parse"] {
            assert!(Cli::try_parse_from(["screen-pointer", cmd]).is_ok(), "{cmd}");
        }
    }

    #[test]
    fn screen_args_need_both_dimensions() {
        let partial = ScreenArgs {
            screen_width: Some(1440.0),
            screen_height: None,
            scale: 2.0,
        };
        assert!(partial.context().is_none());
        let full = ScreenArgs {
            screen_width: Some(1440.0),
            screen_height: Some(900.0),
            scale: 2.0,
        };
        assert_eq!(full.context(), Some(ScreenContext::new(1440.0, 900.0, 2.0)));
    }

    #[test]
    fn supervisor_wiring_uses_configured_marker() {
        let mut settings = Settings::default();
        settings.overlay.marker_bin = Some(PathBuf::from("/opt/bin/marker"));
        let supervisor = build_supervisor(&settings);
        assert_eq!(
            supervisor.transport().fallback().program(),
            Path::new("/opt/bin/marker")
        );
        assert_eq!(supervisor.transport().primary().addr(), settings.overlay.host_addr);
    }
}
