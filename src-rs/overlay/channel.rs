use async_trait::async_trait;
use log::{debug, info, warn};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{
    decode_line, encode_line, read_line_bounded, HostCommand, HostReply, HostRequest, LineRead,
    MAX_LINE_BYTES,
};
use super::transport::{DeliveryPath, LivenessToken, RenderTransport};
use crate::error::TransportError;
use crate::model::RenderRequest;

/// Lifecycle of the control-plane connection.
///
/// `Disconnected` is the initial state. `Invalidated` means the last attempt
/// failed and the cached connection was dropped; the next call reconnects from
/// scratch. `Interrupted` is transient: the one permitted reconnect is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connected,
    Interrupted,
    Invalidated,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub addr: String,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_secs(2),
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

enum CallFailure {
    Io(io::Error),
    Closed,
    TimedOut,
    Protocol(TransportError),
}

/// Client side of the control plane. Never shares its connection: the
/// supervisor owns it exclusively.
pub struct ChannelTransport {
    config: ChannelConfig,
    conn: Option<Connection>,
    state: ChannelState,
    next_id: u64,
    reconnects: u32,
}

impl ChannelTransport {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            conn: None,
            state: ChannelState::Disconnected,
            next_id: 1,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    fn invalidate(&mut self) {
        self.conn = None;
        self.state = ChannelState::Invalidated;
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let attempt = timeout(self.config.connect_timeout, TcpStream::connect(&self.config.addr)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.invalidate();
                return Err(TransportError::Unavailable(format!("{}: {err}", self.config.addr)));
            }
            Err(_) => {
                self.invalidate();
                return Err(TransportError::Unavailable(format!(
                    "{}: connect timed out after {:?}",
                    self.config.addr, self.config.connect_timeout
                )));
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(read),
            writer: write,
        });
        self.state = ChannelState::Connected;
        debug!("control plane connected to {}", self.config.addr);
        Ok(())
    }

    async fn exchange(&mut self, line: &str, id: u64) -> Result<HostReply, CallFailure> {
        let call_timeout = self.config.call_timeout;
        let Some(conn) = self.conn.as_mut() else {
            return Err(CallFailure::Closed);
        };
        let round_trip = async {
            conn.writer.write_all(line.as_bytes()).await.map_err(CallFailure::Io)?;
            conn.writer.flush().await.map_err(CallFailure::Io)?;
            let reply_line = match read_line_bounded(&mut conn.reader).await.map_err(CallFailure::Io)? {
                LineRead::Line(line) => line,
                LineRead::Eof => return Err(CallFailure::Closed),
                LineRead::TooLong => {
                    return Err(CallFailure::Protocol(TransportError::Protocol(format!(
                        "reply exceeds {MAX_LINE_BYTES} bytes"
                    ))))
                }
            };
            let reply: HostReply = decode_line(&reply_line).map_err(CallFailure::Protocol)?;
            if reply.id != id {
                return Err(CallFailure::Protocol(TransportError::Protocol(format!(
                    "reply id {} does not match request {id}",
                    reply.id
                ))));
            }
            Ok(reply)
        };
        match timeout(call_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(CallFailure::TimedOut),
        }
    }

    /// One request/reply round trip with at most one reconnect-and-resend.
    async fn call(&mut self, command: HostCommand) -> Result<HostReply, TransportError> {
        let id = self.next_id;
        self.next_id += 1;
        let line = encode_line(&HostRequest { id, command })?;

        if self.conn.is_none() {
            self.connect().await?;
        }

        let mut resent = false;
        loop {
            let failure = match self.exchange(&line, id).await {
                Ok(reply) if reply.ok => return Ok(reply),
                Ok(reply) => {
                    let reason = reply.error.unwrap_or_else(|| "unspecified".to_string());
                    return Err(TransportError::Rejected(reason));
                }
                Err(failure) => failure,
            };

            let reason = match failure {
                CallFailure::TimedOut => {
                    self.invalidate();
                    return Err(TransportError::Timeout(self.config.call_timeout));
                }
                CallFailure::Protocol(err) => {
                    self.invalidate();
                    return Err(err);
                }
                CallFailure::Io(err) => err.to_string(),
                CallFailure::Closed => "connection closed by host".to_string(),
            };

            if resent {
                self.invalidate();
                return Err(TransportError::Interrupted(reason));
            }

            warn!("control plane interrupted ({reason}); reconnecting once");
            self.state = ChannelState::Interrupted;
            self.conn = None;
            resent = true;
            self.reconnects += 1;
            if let Err(err) = self.connect().await {
                self.invalidate();
                return Err(TransportError::Interrupted(format!("{reason}; reconnect failed: {err}")));
            }
        }
    }
}

#[async_trait]
impl RenderTransport for ChannelTransport {
    async fn show(&mut self, requests: &[RenderRequest]) -> Result<DeliveryPath, TransportError> {
        self.call(HostCommand::Show {
            requests: requests.to_vec(),
        })
        .await?;
        info!("rendering host accepted {} request(s)", requests.len());
        Ok(DeliveryPath::Channel)
    }

    async fn hide(&mut self) -> Result<(), TransportError> {
        self.call(HostCommand::Hide).await.map(|_| ())
    }

    async fn ping(&mut self) -> Result<LivenessToken, TransportError> {
        let reply = self.call(HostCommand::Ping).await?;
        reply
            .token
            .map(LivenessToken)
            .ok_or_else(|| TransportError::Protocol("ping reply carried no token".to_string()))
    }
}
