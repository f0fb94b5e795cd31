//! Typed client for the external ad tracker (spec.md §4.6 C4, §6.2).

pub mod circuit_breaker;
pub mod client;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStats {
    pub clicks: u64,
    pub conversions: u64,
    pub cost: Decimal,
    pub revenue: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub url: String,
    pub name: String,
}

/// §6.2 black-box contract. Reads go through `R_read`, writes through
/// `R_write` — see `client::TrackerClient::call_with_retry`.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn campaign_exists(&self, id: &str) -> PipelineResult<bool>;

    async fn get_detailed_stats(
        &self,
        campaign_id: &str,
        from: Option<chrono::DateTime<chrono::Utc>>,
        to: Option<chrono::DateTime<chrono::Utc>>,
    ) -> PipelineResult<CampaignStats>;

    async fn pause_campaign(&self, id: &str) -> PipelineResult<bool>;

    async fn list_offers(&self) -> PipelineResult<Vec<Offer>>;

    /// `idempotency_key` is `orderId:attemptNumber` per §6.2.
    async fn create_offer(&self, url: &str, name: &str, idempotency_key: &str) -> PipelineResult<Offer>;

    async fn update_offer(&self, id: &str, url: &str, idempotency_key: &str) -> PipelineResult<()>;

    async fn set_click_cost(&self, campaign_id: &str, cost_per_click: Decimal) -> PipelineResult<()>;
}
