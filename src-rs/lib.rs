//! Locate a UI element from a question about a screenshot, mark it on screen,
//! and check the marker against a fresh capture.

pub mod analysis;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod error;
pub mod geometry;
pub mod model;
pub mod overlay;
pub mod parser;
pub mod session;

pub use analysis::{AnalysisClient, AnalysisTransport, RetryPolicy};
pub use calibration::{CalibrationLoop, CalibrationReport};
pub use config::Settings;
pub use error::{AnalysisError, ParseError, TransportError};
pub use geometry::{to_logical, to_logical_with, GeometryLimits, ScreenContext, ScreenRect};
pub use model::{AnalysisReply, CalibrationResult, PredictedStep, RenderRequest};
pub use overlay::{OverlaySupervisor, RenderOutcome};
pub use session::{Session, SessionCommand, SessionEvent};

/// Logs go to stderr; stdout is reserved for JSON output.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
