pub mod http;
pub mod payload;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AnalysisError, TransientKind};
use crate::geometry::ScreenContext;
use crate::model::{AnalysisReply, CalibrationResult, PredictedStep};
use crate::parser;

pub const OVERLOADED_STATUS: u16 = 529;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Analyze,
    Verify,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// The request never produced an HTTP status.
#[derive(Debug, Clone)]
pub struct NetworkFailure {
    pub message: String,
}

impl NetworkFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    async fn post(&self, endpoint: Endpoint, body: &Value) -> Result<HttpReply, NetworkFailure>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: vec![2_000, 5_000, 10_000],
        }
    }
}

impl RetryPolicy {
    /// Wait after the `attempt`-th (1-based) failed attempt. The last entry repeats.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).saturating_sub(1);
        let ms = self
            .backoff_ms
            .get(idx)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

enum ReplyClass {
    Success,
    Transient {
        kind: TransientKind,
        status: Option<u16>,
        message: String,
    },
    Terminal {
        status: Option<u16>,
        message: String,
    },
}

/// Explicitly constructed client; the transport is injected so the retry
/// schedule can be exercised without a network.
#[derive(Clone)]
pub struct AnalysisClient {
    transport: Arc<dyn AnalysisTransport>,
    policy: RetryPolicy,
}

impl AnalysisClient {
    pub fn new(transport: Arc<dyn AnalysisTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Steps come back exactly as the service states them (physical pixels).
    pub async fn analyze(
        &self,
        image: &[u8],
        question: &str,
        ctx: &ScreenContext,
    ) -> Result<AnalysisReply, AnalysisError> {
        self.analyze_with_cancel(image, question, ctx, &CancellationToken::new())
            .await
    }

    pub async fn analyze_with_cancel(
        &self,
        image: &[u8],
        question: &str,
        ctx: &ScreenContext,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReply, AnalysisError> {
        let ctx = ctx.sanitized();
        let body = json!({
            "image_base64": STANDARD.encode(image),
            "media_type": payload::sniff_media_type(image),
            "question": question,
            "screen_width": ctx.logical_size.width,
            "screen_height": ctx.logical_size.height,
            "scale_factor": ctx.scale_factor,
        });

        let raw = self.call(Endpoint::Analyze, &body, cancel).await?;
        let parsed = parser::parse_analysis(&raw)?;
        info!(
            "analysis returned {} step(s) ({:?})",
            parsed.value.steps.len(),
            parsed.recovery
        );
        Ok(parsed.value)
    }

    /// The corrected rectangle, if any, is advisory logical data and is passed through.
    pub async fn verify(
        &self,
        image: &[u8],
        original: &PredictedStep,
        ctx: &ScreenContext,
    ) -> Result<CalibrationResult, AnalysisError> {
        self.verify_with_cancel(image, original, ctx, &CancellationToken::new())
            .await
    }

    pub async fn verify_with_cancel(
        &self,
        image: &[u8],
        original: &PredictedStep,
        ctx: &ScreenContext,
        cancel: &CancellationToken,
    ) -> Result<CalibrationResult, AnalysisError> {
        let ctx = ctx.sanitized();
        let body = json!({
            "image_base64": STANDARD.encode(image),
            "media_type": payload::sniff_media_type(image),
            "original_step": {
                "id": original.id,
                "text": original.label,
                "x": original.rect.x,
                "y": original.rect.y,
                "width": original.rect.width,
                "height": original.rect.height,
                "space": original.rect.space,
                "description": original.description,
            },
            "screen_width": ctx.logical_size.width,
            "screen_height": ctx.logical_size.height,
            "scale_factor": ctx.scale_factor,
        });

        let raw = self.call(Endpoint::Verify, &body, cancel).await?;
        let parsed = parser::parse_calibration(&raw)?;
        info!(
            "verification scored {:.2} ({:?})",
            parsed.value.accuracy_score, parsed.recovery
        );
        Ok(parsed.value)
    }

    async fn call(
        &self,
        endpoint: Endpoint,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, AnalysisError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            attempt += 1;

            let (kind, status, message) = match self.transport.post(endpoint, body).await {
                Ok(reply) => match classify_reply(&reply) {
                    ReplyClass::Success => {
                        debug!("{} succeeded on attempt {attempt}", endpoint.path());
                        return Ok(reply.body);
                    }
                    ReplyClass::Transient {
                        kind,
                        status,
                        message,
                    } => (kind, status, message),
                    ReplyClass::Terminal { status, message } => {
                        warn!("{} failed terminally: {message}", endpoint.path());
                        return Err(AnalysisError::Terminal { status, message });
                    }
                },
                Err(failure) => (TransientKind::Network, None, failure.message),
            };

            if attempt >= max_attempts {
                warn!(
                    "{} giving up after {attempt} attempt(s): {message}",
                    endpoint.path()
                );
                return Err(match kind {
                    TransientKind::Overloaded => AnalysisError::Overloaded { attempts: attempt },
                    TransientKind::Unavailable | TransientKind::Network => {
                        AnalysisError::Unavailable {
                            status,
                            attempts: attempt,
                            message,
                        }
                    }
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                "{} attempt {attempt}/{max_attempts} failed ({kind:?}: {message}); retrying in {}s",
                endpoint.path(),
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            }
        }
    }
}

fn classify_reply(reply: &HttpReply) -> ReplyClass {
    let envelope = serde_json::from_str::<Value>(&reply.body)
        .ok()
        .filter(|value| value.get("error").is_some_and(|err| !err.is_null()));

    let status = envelope
        .as_ref()
        .and_then(|value| value.get("code"))
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(reply.status);

    if (200..300).contains(&status) && envelope.is_none() {
        return ReplyClass::Success;
    }

    let message = envelope
        .as_ref()
        .and_then(|value| value.get("error"))
        .map(|err| match err {
            Value::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        })
        .unwrap_or_else(|| {
            let snippet: String = reply.body.chars().take(200).collect();
            format!("HTTP {status}: {snippet}")
        });

    match status {
        OVERLOADED_STATUS => ReplyClass::Transient {
            kind: TransientKind::Overloaded,
            status: Some(status),
            message,
        },
        502 | 503 => ReplyClass::Transient {
            kind: TransientKind::Unavailable,
            status: Some(status),
            message,
        },
        _ => ReplyClass::Terminal {
            status: Some(status),
            message,
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays canned replies in order and records every call.
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<HttpReply, NetworkFailure>>>,
        calls: Mutex<Vec<(Endpoint, Value, Instant)>>,
    }

    impl ScriptedTransport {
        pub fn new(replies: Vec<Result<HttpReply, NetworkFailure>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|pair| pair[1].2 - pair[0].2).collect()
        }

        pub fn last_body(&self) -> Value {
            self.calls.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl AnalysisTransport for ScriptedTransport {
        async fn post(&self, endpoint: Endpoint, body: &Value) -> Result<HttpReply, NetworkFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint, body.clone(), Instant::now()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(NetworkFailure::new("script exhausted")))
        }
    }

    pub fn reply(status: u16, body: &str) -> Result<HttpReply, NetworkFailure> {
        Ok(HttpReply {
            status,
            body: body.to_string(),
        })
    }
}
