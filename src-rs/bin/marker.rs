use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::thread;

use screen_pointer::geometry::ScreenRect;
use screen_pointer::model::PredictedStep;
use screen_pointer::overlay::canvas::{draw_marker, FrameSidecar, FrameSink, MarkerStyle};
use screen_pointer::overlay::spawn::MARKER_LIFETIME;

/// Standalone fallback marker: draws one highlight, keeps it up for a fixed
/// lifetime, then removes it and exits.
#[derive(Parser, Debug)]
#[command(name = "screen-pointer-marker", version)]
struct MarkerArgs {
    /// Text shown in the marker's label band
    label: String,
    /// Logical x of the top-left corner
    #[arg(allow_negative_numbers = true)]
    x: f64,
    /// Logical y of the top-left corner
    #[arg(allow_negative_numbers = true)]
    y: f64,
    width: f64,
    height: f64,
    /// Optional longer description stored with the frame
    #[arg(default_value = "")]
    description: String,
    /// Overlay directory (default: $SP_OVERLAY_DIR or .screen-pointer/overlay)
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
    let args = MarkerArgs::parse();
    let rect = ScreenRect::logical(args.x, args.y, args.width, args.height);
    if !rect.is_valid() {
        anyhow::bail!(
            "marker rect must be finite and positive, got {}x{} at ({}, {})",
            args.width,
            args.height,
            args.x,
            args.y
        );
    }

    let dir = args
        .overlay_dir
        .or_else(|| {
            env::var("SP_OVERLAY_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(".screen-pointer/overlay"));
    let sink = FrameSink::new(dir);

    let step = PredictedStep {
        id: "marker".to_string(),
        label: args.label,
        rect,
        description: args.description,
    };
    let owner = format!("marker-{}", std::process::id());
    let tile = draw_marker(&step, &MarkerStyle::default());
    let sidecar = FrameSidecar::for_step(&owner, "marker", &step, MARKER_LIFETIME);
    sink.publish(&tile, &sidecar)
        .with_context(|| format!("failed to publish marker into {}", sink.dir().display()))?;
    info!("marker '{}' up for {}s", step.label, MARKER_LIFETIME.as_secs());

    thread::sleep(MARKER_LIFETIME);

    // A newer overlay may have replaced ours in the meantime.
    match sink.clear_if_owner(&owner) {
        Ok(true) => info!("marker '{}' removed", step.label),
        Ok(false) => info!("marker '{}' already replaced", step.label),
        Err(err) => warn!("failed to remove marker: {err:#}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use screen_pointer::overlay::spawn::marker_args;

    fn parse(label: &str, description: &str) -> MarkerArgs {
        let step = PredictedStep {
            id: "step-1".to_string(),
            label: label.to_string(),
            rect: ScreenRect::logical(-10.0, 200.0, 100.0, 60.0),
            description: description.to_string(),
        };
        let argv = std::iter::once("screen-pointer-marker".to_string()).chain(marker_args(&step));
        MarkerArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn spawned_arguments_parse() {
        let args = parse("Save", "toolbar");
        assert_eq!(args.label, "Save");
        assert_eq!((args.x, args.y, args.width, args.height), (-10.0, 200.0, 100.0, 60.0));
        assert_eq!(args.description, "toolbar");
        assert!(args.overlay_dir.is_none());
    }

    #[test]
    fn dash_prefixed_text_is_not_a_flag() {
        let args = parse("-5 volume", "--help-style hint");
        assert_eq!(args.label, "-5 volume");
        assert_eq!(args.description, "--help-style hint");

        let args = parse("--overlay-dir", "-x");
        assert_eq!(args.label, "--overlay-dir");
        assert!(args.overlay_dir.is_none());
    }

    #[test]
    fn overlay_dir_goes_before_separator() {
        let args = MarkerArgs::try_parse_from([
            "screen-pointer-marker",
            "--overlay-dir",
            "/tmp/overlay",
            "--",
            "Open",
            "1",
            "2",
            "100",
            "60",
        ])
        .unwrap();
        assert_eq!(args.overlay_dir, Some(PathBuf::from("/tmp/overlay")));
        assert_eq!(args.description, "");
    }
}
