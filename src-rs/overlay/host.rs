use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::canvas::{draw_marker, FrameSidecar, FrameSink, MarkerStyle};
use super::protocol::{
    decode_line, encode_line, read_line_bounded, HostCommand, HostReply, HostRequest, LineRead,
    MAX_LINE_BYTES,
};
use crate::geometry::CoordinateSpace;
use crate::model::RenderRequest;

struct ActiveOverlay {
    owner: String,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct HostState {
    active: Option<ActiveOverlay>,
}

/// Long-lived rendering host. Holds at most one overlay; a new `show`
/// replaces the previous one, and each overlay clears itself when its
/// duration runs out.
#[derive(Clone)]
pub struct RenderHost {
    sink: FrameSink,
    style: MarkerStyle,
    token: String,
    sequence: Arc<AtomicU64>,
    state: Arc<Mutex<HostState>>,
}

impl RenderHost {
    pub fn new(sink: FrameSink, style: MarkerStyle) -> Self {
        let token = format!("host-{}-{:08x}", std::process::id(), rand::random::<u32>());
        Self {
            sink,
            style,
            token,
            sequence: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    /// Accepts control-plane connections until `cancel` fires, then clears
    /// whatever is still on screen.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;
        info!("rendering host {} listening on {addr}", self.token);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.context("failed to accept control connection")?;
                    debug!("control connection from {peer}");
                    let host = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = host.handle_connection(socket, cancel).await {
                            warn!("control connection from {peer} ended: {err:#}");
                        }
                    });
                }
            }
        }
        self.teardown().await;
        info!("rendering host {} stopped", self.token);
        Ok(())
    }

    async fn handle_connection(&self, socket: TcpStream, cancel: CancellationToken) -> Result<()> {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = read_line_bounded(&mut reader) => read.context("failed to read control message")?,
            };
            let (reply, keep_open) = match read {
                LineRead::Line(line) => (self.dispatch(&line).await, true),
                LineRead::Eof => return Ok(()),
                LineRead::TooLong => {
                    warn!("control message exceeds {MAX_LINE_BYTES} bytes; closing connection");
                    (HostReply::failure(0, "message too large"), false)
                }
            };
            let encoded = encode_line(&reply)?;
            write
                .write_all(encoded.as_bytes())
                .await
                .context("failed to write control reply")?;
            if !keep_open {
                return Ok(());
            }
        }
    }

    /// Handles one raw request line. Undecodable input gets a failure reply
    /// with id 0 rather than dropping the connection.
    pub async fn dispatch(&self, line: &str) -> HostReply {
        if line.len() > MAX_LINE_BYTES {
            return HostReply::failure(0, "message too large");
        }
        let request: HostRequest = match decode_line(line) {
            Ok(request) => request,
            Err(err) => return HostReply::failure(0, err.to_string()),
        };
        let id = request.id;
        match request.command {
            HostCommand::Ping => HostReply::success(id, Some(self.token.clone())),
            HostCommand::Hide => {
                self.teardown().await;
                HostReply::success(id, None)
            }
            HostCommand::Show { requests } => match self.show(requests).await {
                Ok(owner) => HostReply::success(id, Some(owner)),
                Err(err) => {
                    warn!("show rejected: {err:#}");
                    HostReply::failure(id, format!("{err:#}"))
                }
            },
        }
    }

    async fn show(&self, requests: Vec<RenderRequest>) -> Result<String> {
        let Some(request) = requests.into_iter().next() else {
            anyhow::bail!("no render requests");
        };
        let rect = request.step.rect;
        if !rect.is_valid() || rect.space != CoordinateSpace::Logical {
            anyhow::bail!("render rect must be finite, positive and logical");
        }

        let mut state = self.state.lock().await;
        if let Some(previous) = state.active.take() {
            previous.expiry.abort();
        }

        let owner = format!(
            "{}#{}",
            self.token,
            self.sequence.fetch_add(1, Ordering::SeqCst) + 1
        );
        let sink = self.sink.clone();
        let style = self.style;
        let sidecar = FrameSidecar::for_step(&owner, "host", &request.step, request.duration());
        let step = request.step.clone();
        tokio::task::spawn_blocking(move || {
            let tile = draw_marker(&step, &style);
            sink.publish(&tile, &sidecar)
        })
        .await
        .context("render worker panicked")??;
        info!(
            "showing '{}' at ({}, {}) {}x{} for {}ms",
            request.step.label, rect.x, rect.y, rect.width, rect.height, request.duration_ms
        );

        let host = self.clone();
        let expiry_owner = owner.clone();
        let duration = request.duration();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            host.expire(&expiry_owner).await;
        });
        state.active = Some(ActiveOverlay {
            owner: owner.clone(),
            expiry,
        });
        Ok(owner)
    }

    async fn expire(&self, owner: &str) {
        let mut state = self.state.lock().await;
        if state.active.as_ref().map(|a| a.owner.as_str()) != Some(owner) {
            return;
        }
        state.active = None;
        match self.sink.clear_if_owner(owner) {
            Ok(_) => debug!("overlay {owner} expired"),
            Err(err) => error!("failed to clear expired overlay {owner}: {err:#}"),
        }
    }

    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.active.take() {
            previous.expiry.abort();
            if let Err(err) = self.sink.clear_if_owner(&previous.owner) {
                error!("failed to clear overlay {}: {err:#}", previous.owner);
            }
        }
    }
}
