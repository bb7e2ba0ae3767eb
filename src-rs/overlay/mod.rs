pub mod canvas;
pub mod channel;
pub mod host;
pub mod protocol;
pub mod spawn;
pub mod transport;

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{timeout, Instant};

use crate::geometry::{to_logical_with, GeometryLimits, ScreenContext, ScreenRect};
use crate::model::{PredictedStep, RenderRequest};
use channel::ChannelTransport;
use spawn::ProcessSpawnTransport;
pub use transport::{DeliveryPath, FallbackTransport, LivenessToken, RenderTransport};

/// Production wiring: control plane first, marker process as the fallback.
pub type DefaultTransport = FallbackTransport<ChannelTransport, ProcessSpawnTransport>;

const HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPhase {
    Idle,
    Connecting,
    FallbackSpawn,
    Displaying,
    Expiring,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenderOutcome {
    Shown { path: DeliveryPath, rect: ScreenRect },
    NotShown { reason: String },
}

impl RenderOutcome {
    pub fn is_shown(&self) -> bool {
        matches!(self, Self::Shown { .. })
    }
}

/// Owns the overlay lifecycle for one foreground session. Only one overlay
/// is ever live: every render tears the previous one down first.
pub struct OverlaySupervisor<T> {
    transport: T,
    limits: GeometryLimits,
    phase: OverlayPhase,
    expires_at: Option<Instant>,
    active_path: Option<DeliveryPath>,
    history: VecDeque<OverlayPhase>,
    teardown_timeout: Duration,
}

impl<T: RenderTransport> OverlaySupervisor<T> {
    pub fn new(transport: T, limits: GeometryLimits) -> Self {
        Self {
            transport,
            limits: limits.sanitized(),
            phase: OverlayPhase::Idle,
            expires_at: None,
            active_path: None,
            history: VecDeque::from([OverlayPhase::Idle]),
            teardown_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_teardown_timeout(mut self, teardown_timeout: Duration) -> Self {
        self.teardown_timeout = teardown_timeout;
        self
    }

    pub fn phase(&self) -> OverlayPhase {
        self.phase
    }

    /// Recent phase transitions, oldest first.
    pub fn history(&self) -> Vec<OverlayPhase> {
        self.history.iter().copied().collect()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn active_path(&self) -> Option<DeliveryPath> {
        self.active_path
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn enter(&mut self, next: OverlayPhase) {
        if self.phase == next {
            return;
        }
        debug!("overlay phase {:?} -> {next:?}", self.phase);
        self.phase = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(next);
    }

    /// Shows `step` for `duration`. The step's rect is converted to clamped
    /// logical space here; failures come back as `NotShown`, never as errors.
    pub async fn render(
        &mut self,
        step: &PredictedStep,
        ctx: &ScreenContext,
        duration: Duration,
    ) -> RenderOutcome {
        self.teardown().await;

        let rect = to_logical_with(&step.rect, ctx, &self.limits);
        let request = RenderRequest::new(step.with_rect(rect), duration);

        self.enter(OverlayPhase::Connecting);
        match self.transport.show(std::slice::from_ref(&request)).await {
            Ok(path) => {
                if path == DeliveryPath::FallbackProcess {
                    self.enter(OverlayPhase::FallbackSpawn);
                }
                self.enter(OverlayPhase::Displaying);
                self.expires_at = Some(Instant::now() + duration);
                self.active_path = Some(path);
                info!(
                    "overlay '{}' shown via {path:?} at ({}, {}) {}x{}",
                    step.label, rect.x, rect.y, rect.width, rect.height
                );
                RenderOutcome::Shown { path, rect }
            }
            Err(err) => {
                warn!("overlay for '{}' could not be shown: {err}", step.label);
                self.enter(OverlayPhase::Idle);
                RenderOutcome::NotShown {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Early dismissal. Safe to call when nothing is displayed.
    pub async fn hide(&mut self) {
        self.teardown().await;
    }

    /// Natural expiry; returns true when an overlay was retired.
    pub async fn expire_if_due(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) if deadline <= now => {
                self.teardown().await;
                true
            }
            _ => false,
        }
    }

    async fn teardown(&mut self) {
        if self.phase != OverlayPhase::Displaying {
            return;
        }
        self.enter(OverlayPhase::Expiring);
        match timeout(self.teardown_timeout, self.transport.hide()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("overlay teardown failed: {err}"),
            Err(_) => warn!("overlay teardown timed out after {:?}", self.teardown_timeout),
        }
        self.expires_at = None;
        self.active_path = None;
        self.enter(OverlayPhase::Idle);
    }
}
