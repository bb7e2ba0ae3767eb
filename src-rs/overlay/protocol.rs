use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::TransportError;
use crate::model::RenderRequest;

/// Upper bound for one newline-delimited control-plane message.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostCommand {
    Show { requests: Vec<RenderRequest> },
    Hide,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRequest {
    pub id: u64,
    #[serde(flatten)]
    pub command: HostCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostReply {
    pub fn success(id: u64, token: Option<String>) -> Self {
        Self {
            id,
            ok: true,
            token,
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            token: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    Eof,
    /// More than [`MAX_LINE_BYTES`] arrived without a newline. The rest of the
    /// message is still unread, so the stream cannot be resynchronized.
    TooLong,
}

/// Reads one newline-terminated message, buffering at most
/// `MAX_LINE_BYTES + 1` bytes however much the peer sends.
pub async fn read_line_bounded<R>(reader: &mut R) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.len() > MAX_LINE_BYTES {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()))
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, TransportError> {
    let mut line =
        serde_json::to_string(message).map_err(|err| TransportError::Protocol(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, TransportError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(TransportError::Protocol(format!(
            "message of {} bytes exceeds {MAX_LINE_BYTES}",
            line.len()
        )));
    }
    serde_json::from_str(line.trim_end()).map_err(|err| TransportError::Protocol(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ScreenRect;
    use crate::model::PredictedStep;
    use std::time::Duration;

    #[test]
    fn show_request_wire_shape() {
        let request = HostRequest {
            id: 4,
            command: HostCommand::Show {
                requests: vec![RenderRequest::new(
                    PredictedStep {
                        id: "step-1".to_string(),
                        label: "Save".to_string(),
                        rect: ScreenRect::logical(1.0, 2.0, 100.0, 60.0),
                        description: "toolbar".to_string(),
                    },
                    Duration::from_secs(3),
                )],
            },
        };
        let line = encode_line(&request).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["op"], "show");
        assert_eq!(value["id"], 4);
        assert_eq!(value["requests"][0]["duration_ms"], 3000);
        assert_eq!(value["requests"][0]["step"]["rect"]["space"], "logical");

        let decoded: HostRequest = decode_line(&line).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn unit_commands_and_replies_decode() {
        let ping: HostRequest = decode_line("{\"id\":1,\"op\":\"ping\"}\n").unwrap();
        assert_eq!(ping.command, HostCommand::Ping);
        let reply: HostReply = decode_line(r#"{"id":1,"ok":false,"error":"nope"}"#).unwrap();
        assert_eq!(reply, HostReply::failure(1, "nope"));
        assert!(decode_line::<HostRequest>(r#"{"id":1,"op":"explode"}"#).is_err());
    }

    #[tokio::test]
    async fn bounded_reads_stop_at_the_cap() {
        let mut input = b"{\"id\":1,\"op\":\"ping\"}\n".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_LINE_BYTES + 10));
        let mut reader = tokio::io::BufReader::new(&input[..]);

        match read_line_bounded(&mut reader).await.unwrap() {
            LineRead::Line(line) => assert_eq!(line, "{\"id\":1,\"op\":\"ping\"}\n"),
            other => panic!("expected a line, got {other:?}"),
        }
        assert_eq!(read_line_bounded(&mut reader).await.unwrap(), LineRead::TooLong);
    }

    #[tokio::test]
    async fn line_at_the_cap_is_accepted() {
        let mut input = vec![b' '; MAX_LINE_BYTES - 1];
        input.push(b'\n');
        let mut reader = tokio::io::BufReader::new(&input[..]);
        match read_line_bounded(&mut reader).await.unwrap() {
            LineRead::Line(line) => assert_eq!(line.len(), MAX_LINE_BYTES),
            other => panic!("expected a line, got {other:?}"),
        }
        assert_eq!(read_line_bounded(&mut reader).await.unwrap(), LineRead::Eof);
    }
}
