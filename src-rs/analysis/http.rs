use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{AnalysisTransport, Endpoint, HttpReply, NetworkFailure};

/// reqwest-backed transport: `POST <base>/analyze` and `POST <base>/verify`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build analysis HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url, endpoint.path())
    }
}

#[async_trait]
impl AnalysisTransport for HttpTransport {
    async fn post(&self, endpoint: Endpoint, body: &Value) -> Result<HttpReply, NetworkFailure> {
        let mut request = self.client.post(self.url(endpoint)).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| NetworkFailure::new(format!("request failed: {err}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| NetworkFailure::new(format!("failed to read response body: {err}")))?;
        Ok(HttpReply { status, body })
    }
}
