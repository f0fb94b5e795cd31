//! Production and stub `VideoClient` implementations.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

use super::{url as video_url, VideoClient};

pub struct HttpVideoClient {
    client: Client,
    base_url: String,
}

impl HttpVideoClient {
    pub fn new(base_url: String, read_timeout: Duration, write_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(write_timeout.max(read_timeout))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[derive(Debug, Deserialize)]
struct ViewCountResponse {
    view_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClipResponse {
    clip_url: String,
}

#[async_trait]
impl VideoClient for HttpVideoClient {
    /// §4.5: "if the probe returns 0 or null, processing fails with a
    /// retryable error" — modeled as `UpstreamUnavailable`, which the bus
    /// consumer treats as retryable.
    async fn probe_view_count(&self, url: &str) -> PipelineResult<u64> {
        let parsed = video_url::parse(url)?;
        let endpoint = format!("{}/videos/{}/views", self.base_url, parsed.video_id);
        let resp = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "view-count probe returned {}",
                resp.status()
            )));
        }
        let body: ViewCountResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Poison(format!("malformed view-count response: {e}")))?;
        match body.view_count {
            Some(0) | None => Err(PipelineError::UpstreamUnavailable(
                "view-count probe returned zero/null".to_string(),
            )),
            Some(n) => Ok(n),
        }
    }

    async fn create_clip(&self, url: &str, account_credential_ref: &str) -> PipelineResult<String> {
        let parsed = video_url::parse(url)?;
        let endpoint = format!("{}/clips", self.base_url);
        let body = serde_json::json!({
            "videoId": parsed.video_id,
            "account": account_credential_ref,
        });
        let resp = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "clip creation returned {}",
                resp.status()
            )));
        }
        let body: ClipResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Poison(format!("malformed clip response: {e}")))?;
        Ok(body.clip_url)
    }
}

/// Test double. Public (not `#[cfg(test)]`) for the same reason as
/// `tracker::client::stub` — integration tests in `tests/` need it too.
pub mod stub {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct StubVideoClient {
        pub view_counts: Mutex<HashMap<String, u64>>,
        pub clip_urls: Mutex<HashMap<String, String>>,
    }

    impl StubVideoClient {
        pub fn new() -> Self {
            Self {
                view_counts: Mutex::new(HashMap::new()),
                clip_urls: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl VideoClient for StubVideoClient {
        async fn probe_view_count(&self, url: &str) -> PipelineResult<u64> {
            match self.view_counts.lock().unwrap().get(url).copied() {
                Some(0) | None => Err(PipelineError::UpstreamUnavailable(
                    "stub has no/zero view count seeded".to_string(),
                )),
                Some(n) => Ok(n),
            }
        }

        async fn create_clip(&self, url: &str, _account_credential_ref: &str) -> PipelineResult<String> {
            Ok(self
                .clip_urls
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or_else(|| format!("{url}#clip")))
        }
    }
}
