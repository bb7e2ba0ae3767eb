use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::model::RenderRequest;

/// Which path actually delivered a render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    Channel,
    FallbackProcess,
}

/// Opaque identity of whatever answered a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessToken(pub String);

impl LivenessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait RenderTransport: Send {
    async fn show(&mut self, requests: &[RenderRequest]) -> Result<DeliveryPath, TransportError>;
    async fn hide(&mut self) -> Result<(), TransportError>;
    async fn ping(&mut self) -> Result<LivenessToken, TransportError>;
}

/// Tries `primary` first and degrades to `fallback` when it fails. Remembers
/// which one delivered the last overlay so `hide` goes to the same place.
pub struct FallbackTransport<P, F> {
    primary: P,
    fallback: F,
    active: Option<DeliveryPath>,
    last_primary_error: Option<TransportError>,
}

impl<P, F> FallbackTransport<P, F>
where
    P: RenderTransport,
    F: RenderTransport,
{
    pub fn new(primary: P, fallback: F) -> Self {
        Self {
            primary,
            fallback,
            active: None,
            last_primary_error: None,
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    pub fn fallback_mut(&mut self) -> &mut F {
        &mut self.fallback
    }

    pub fn active(&self) -> Option<DeliveryPath> {
        self.active
    }

    pub fn last_primary_error(&self) -> Option<&TransportError> {
        self.last_primary_error.as_ref()
    }
}

#[async_trait]
impl<P, F> RenderTransport for FallbackTransport<P, F>
where
    P: RenderTransport,
    F: RenderTransport,
{
    async fn show(&mut self, requests: &[RenderRequest]) -> Result<DeliveryPath, TransportError> {
        match self.primary.show(requests).await {
            Ok(path) => {
                self.active = Some(path);
                self.last_primary_error = None;
                Ok(path)
            }
            Err(primary_err) => {
                warn!("rendering host failed ({primary_err}); launching fallback marker");
                self.last_primary_error = Some(primary_err);
                self.active = None;
                let path = self.fallback.show(requests).await?;
                info!("overlay delivered via {path:?}");
                self.active = Some(path);
                Ok(path)
            }
        }
    }

    async fn hide(&mut self) -> Result<(), TransportError> {
        match self.active.take() {
            Some(DeliveryPath::Channel) => self.primary.hide().await,
            Some(DeliveryPath::FallbackProcess) => self.fallback.hide().await,
            None => Ok(()),
        }
    }

    async fn ping(&mut self) -> Result<LivenessToken, TransportError> {
        self.primary.ping().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Scriptable transport that records every call into a shared log.
    pub struct RecordingTransport {
        pub name: &'static str,
        pub path: DeliveryPath,
        pub fail_show: Option<TransportError>,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTransport {
        pub fn new(name: &'static str, path: DeliveryPath, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                path,
                fail_show: None,
                log,
            }
        }

        pub fn failing(mut self, err: TransportError) -> Self {
            self.fail_show = Some(err);
            self
        }
    }

    #[async_trait]
    impl RenderTransport for RecordingTransport {
        async fn show(&mut self, requests: &[RenderRequest]) -> Result<DeliveryPath, TransportError> {
            let labels: Vec<&str> = requests.iter().map(|r| r.step.label.as_str()).collect();
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:show:{}", self.name, labels.join(",")));
            match &self.fail_show {
                Some(err) => Err(err.clone()),
                None => Ok(self.path),
            }
        }

        async fn hide(&mut self) -> Result<(), TransportError> {
            self.log.lock().unwrap().push(format!("{}:hide", self.name));
            Ok(())
        }

        async fn ping(&mut self) -> Result<LivenessToken, TransportError> {
            Ok(LivenessToken(self.name.to_string()))
        }
    }
}
