//! Production and stub `Tracker` implementations (spec.md §4.6, §6.2).
//!
//! Client construction follows `scrapers/dome_rest.rs::DomeRestClient::new`
//! (pooled `reqwest::Client` with timeouts baked in); the retry/backoff
//! wrapper is new, built on the `backoff` crate already in the dependency
//! stack for exactly this purpose.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

use super::circuit_breaker::CircuitBreaker;
use super::{CampaignStats, Offer, Tracker};

/// §4.6: read/write calls use distinct retry policies — reads get more
/// attempts with a shorter ceiling, writes fewer attempts with a longer one
/// so a flaky network doesn't duplicate a tracker-side side effect.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn read(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
        }
    }

    pub fn write(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(8),
        }
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// §4.6: `429`/`418` and `5xx` are retryable; `4xx` (except `408`/`429`) is
/// terminal; `404` on an update is a terminal not-found.
fn classify(status: StatusCode, is_update: bool) -> PipelineError {
    if status == StatusCode::NOT_FOUND && is_update {
        return PipelineError::NotFound(format!("tracker resource ({status})"));
    }
    if status.as_u16() == 429
        || status.as_u16() == 418
        || status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
    {
        PipelineError::UpstreamUnavailable(format!("tracker returned {status}"))
    } else {
        PipelineError::Validation(format!("tracker rejected request: {status}"))
    }
}

async fn retry_with_policy<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: RetryPolicy,
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PipelineResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if !breaker.allow_request() {
            return Err(PipelineError::UpstreamUnavailable(
                "circuit breaker open".to_string(),
            ));
        }
        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                breaker.record_failure();
                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                breaker.record_failure();
                return Err(e);
            }
        }
    }
}

pub struct HttpTracker {
    client: Client,
    base_url: String,
    breaker: CircuitBreaker,
    read_policy: RetryPolicy,
    write_policy: RetryPolicy,
}

impl HttpTracker {
    pub fn new(
        base_url: String,
        api_key: &str,
        read_timeout: Duration,
        write_timeout: Duration,
        read_max_attempts: u32,
        write_max_attempts: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(write_timeout.max(read_timeout))
            .pool_max_idle_per_host(10)
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {api_key}").parse()?,
                );
                headers
            })
            .build()?;

        Ok(Self {
            client,
            base_url,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            read_policy: RetryPolicy::read(read_max_attempts),
            write_policy: RetryPolicy::write(write_max_attempts),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    clicks: u64,
    conversions: u64,
    cost: Decimal,
    revenue: Decimal,
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn campaign_exists(&self, id: &str) -> PipelineResult<bool> {
        let url = self.url(&format!("/campaigns/{id}"));
        retry_with_policy(&self.breaker, self.read_policy, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(false);
                }
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), false));
                }
                Ok(true)
            }
        })
        .await
    }

    async fn get_detailed_stats(
        &self,
        campaign_id: &str,
        from: Option<chrono::DateTime<chrono::Utc>>,
        to: Option<chrono::DateTime<chrono::Utc>>,
    ) -> PipelineResult<CampaignStats> {
        let url = self.url(&format!("/campaigns/{campaign_id}/stats"));
        retry_with_policy(&self.breaker, self.read_policy, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let mut req = client.get(&url);
                if let Some(f) = from {
                    req = req.query(&[("from", f.to_rfc3339())]);
                }
                if let Some(t) = to {
                    req = req.query(&[("to", t.to_rfc3339())]);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), false));
                }
                let body: StatsResponse = resp
                    .json()
                    .await
                    .map_err(|e| PipelineError::Poison(format!("malformed stats response: {e}")))?;
                Ok(CampaignStats {
                    clicks: body.clicks,
                    conversions: body.conversions,
                    cost: body.cost,
                    revenue: body.revenue,
                })
            }
        })
        .await
    }

    async fn pause_campaign(&self, id: &str) -> PipelineResult<bool> {
        let url = self.url(&format!("/campaigns/{id}/pause"));
        retry_with_policy(&self.breaker, self.write_policy, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let resp = client
                    .post(&url)
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), true));
                }
                Ok(true)
            }
        })
        .await
    }

    async fn list_offers(&self) -> PipelineResult<Vec<Offer>> {
        let url = self.url("/offers");
        retry_with_policy(&self.breaker, self.read_policy, || {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), false));
                }
                resp.json::<Vec<Offer>>()
                    .await
                    .map_err(|e| PipelineError::Poison(format!("malformed offer list: {e}")))
            }
        })
        .await
    }

    async fn create_offer(&self, url: &str, name: &str, idempotency_key: &str) -> PipelineResult<Offer> {
        let endpoint = self.url("/offers");
        retry_with_policy(&self.breaker, self.write_policy, || {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let idempotency_key = idempotency_key.to_string();
            let body = serde_json::json!({"url": url, "name": name});
            async move {
                let resp = client
                    .post(&endpoint)
                    .header("Idempotency-Key", idempotency_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), false));
                }
                resp.json::<Offer>()
                    .await
                    .map_err(|e| PipelineError::Poison(format!("malformed offer: {e}")))
            }
        })
        .await
    }

    async fn update_offer(&self, id: &str, url: &str, idempotency_key: &str) -> PipelineResult<()> {
        let endpoint = self.url(&format!("/offers/{id}"));
        retry_with_policy(&self.breaker, self.write_policy, || {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let idempotency_key = idempotency_key.to_string();
            let body = serde_json::json!({"url": url});
            async move {
                let resp = client
                    .put(&endpoint)
                    .header("Idempotency-Key", idempotency_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), true));
                }
                Ok(())
            }
        })
        .await
    }

    async fn set_click_cost(&self, campaign_id: &str, cost_per_click: Decimal) -> PipelineResult<()> {
        let endpoint = self.url(&format!("/campaigns/{campaign_id}/click-cost"));
        retry_with_policy(&self.breaker, self.write_policy, || {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let body = serde_json::json!({"costPerClick": cost_per_click.to_string()});
            async move {
                let resp = client
                    .put(&endpoint)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(classify(resp.status(), false));
                }
                Ok(())
            }
        })
        .await
    }
}

/// Shared handle used by workers so both the real client and test doubles
/// can be passed around uniformly.
pub type SharedTracker = Arc<dyn Tracker>;

/// In-process test doubles. Kept public (not `#[cfg(test)]`) so both unit
/// tests here and the crate's `tests/` integration suite can depend on
/// them without linking network code.
pub mod stub {
    use super::*;
    use std::sync::Mutex;

    /// In-process `Tracker` double for worker unit tests — no network, no
    /// circuit breaker, deterministic responses set up per test.
    pub struct StubTracker {
        pub stats: Mutex<std::collections::HashMap<String, CampaignStats>>,
        pub exists: Mutex<std::collections::HashSet<String>>,
    }

    impl StubTracker {
        pub fn new() -> Self {
            Self {
                stats: Mutex::new(std::collections::HashMap::new()),
                exists: Mutex::new(std::collections::HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl Tracker for StubTracker {
        async fn campaign_exists(&self, id: &str) -> PipelineResult<bool> {
            Ok(self.exists.lock().unwrap().contains(id))
        }

        async fn get_detailed_stats(
            &self,
            campaign_id: &str,
            _from: Option<chrono::DateTime<chrono::Utc>>,
            _to: Option<chrono::DateTime<chrono::Utc>>,
        ) -> PipelineResult<CampaignStats> {
            self.stats
                .lock()
                .unwrap()
                .get(campaign_id)
                .cloned()
                .ok_or_else(|| PipelineError::NotFound(campaign_id.to_string()))
        }

        async fn pause_campaign(&self, _id: &str) -> PipelineResult<bool> {
            Ok(true)
        }

        async fn list_offers(&self) -> PipelineResult<Vec<Offer>> {
            Ok(vec![])
        }

        async fn create_offer(&self, url: &str, name: &str, _idempotency_key: &str) -> PipelineResult<Offer> {
            Ok(Offer {
                id: format!("offer-{name}"),
                url: url.to_string(),
                name: name.to_string(),
            })
        }

        async fn update_offer(&self, _id: &str, _url: &str, _idempotency_key: &str) -> PipelineResult<()> {
            Ok(())
        }

        async fn set_click_cost(&self, _campaign_id: &str, _cost_per_click: Decimal) -> PipelineResult<()> {
            Ok(())
        }
    }
}
