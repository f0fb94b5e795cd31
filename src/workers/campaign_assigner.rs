//! Campaign assigner (spec.md §4.6 C8): consumes `offer.assignment`,
//! creates a tracker offer, distributes required clicks across the fixed
//! campaign pool, and persists one `CampaignBinding` per campaign.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use tracing::info;

use crate::bus::messages::OfferAssignmentMessage;
use crate::bus::Envelope;
use crate::domain::{FixedCampaign, OrderStatus, REQUIRED_ACTIVE_CAMPAIGNS};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{CampaignStore, OrderStore};
use crate::tracker::Tracker;

pub struct CampaignAssigner {
    order_store: Arc<OrderStore>,
    campaign_store: Arc<CampaignStore>,
    tracker: Arc<dyn Tracker>,
}

impl CampaignAssigner {
    pub fn new(order_store: Arc<OrderStore>, campaign_store: Arc<CampaignStore>, tracker: Arc<dyn Tracker>) -> Self {
        Self { order_store, campaign_store, tracker }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<(), (String, String)> {
        let msg: OfferAssignmentMessage = envelope
            .decode()
            .map_err(|e| ("Poison".to_string(), e.to_string()))?;
        self.process(msg).await.map_err(|e| (e.kind_name().to_string(), e.to_string()))
    }

    async fn process(&self, msg: OfferAssignmentMessage) -> PipelineResult<()> {
        let order = self.order_store.get(msg.order_id).await?;

        // §4.6 step 1: exactly three active campaigns required.
        let campaigns = self.campaign_store.active_campaigns().await?;
        if campaigns.len() != REQUIRED_ACTIVE_CAMPAIGNS {
            return Err(PipelineError::ConfigurationError(format!(
                "expected {REQUIRED_ACTIVE_CAMPAIGNS} active campaigns, found {}",
                campaigns.len()
            )));
        }

        // §4.6 step 2: health-check each campaign against the tracker.
        for campaign in &campaigns {
            if !self.tracker.campaign_exists(&campaign.external_campaign_id).await? {
                return Err(PipelineError::ConfigurationError(format!(
                    "campaign {} is unreachable in the tracker",
                    campaign.external_campaign_id
                )));
            }
        }

        // §4.6 step 3: create the tracker offer.
        let idempotency_key = format!("{}:1", order.id);
        let offer = self
            .tracker
            .create_offer(&msg.target_url, &format!("order-{}", order.id), &idempotency_key)
            .await?;

        // §4.6 step 4: clicksRequired = ceil(quantity * coefficient).
        let clicks_required = (order.quantity as f64 * order.coefficient.to_f64().unwrap_or(1.0)).ceil() as u64;
        let shares = distribute(clicks_required, &campaigns);

        // §4.6 step 5: persist one binding per campaign, transition to ACTIVE.
        for (campaign, clicks) in campaigns.iter().zip(shares.iter()) {
            self.campaign_store
                .create_binding(
                    order.id,
                    &campaign.external_campaign_id,
                    &offer.id,
                    *clicks,
                    order.budget_limit,
                )
                .await?;
        }

        if order.status == OrderStatus::InProgress || order.status == OrderStatus::Processing {
            self.order_store
                .transition(order.id, order.version, OrderStatus::Active, None)
                .await?;
        }

        info!(order_id = order.id, clicks_required, "campaign bindings created");
        Ok(())
    }
}

/// §4.6 step 4: integer-partition `total` across `campaigns` proportional
/// to weight (equal weights ⇒ equal shares), applying the largest-remainder
/// method so the shares sum back to exactly `total`; any final rounding
/// favors the highest-priority (lowest `priority` value) campaign.
fn distribute(total: u64, campaigns: &[FixedCampaign]) -> Vec<u64> {
    if campaigns.is_empty() {
        return vec![];
    }
    let weight_sum: u64 = campaigns.iter().map(|c| c.weight as u64).sum();
    if weight_sum == 0 {
        return equal_split(total, campaigns);
    }

    let mut base = Vec::with_capacity(campaigns.len());
    let mut remainders = Vec::with_capacity(campaigns.len());
    let mut allocated = 0u64;
    for campaign in campaigns {
        let exact = total as f64 * campaign.weight as f64 / weight_sum as f64;
        let floor = exact.floor() as u64;
        base.push(floor);
        remainders.push(exact - floor as f64);
        allocated += floor;
    }

    let mut remaining = total - allocated;
    let mut order: Vec<usize> = (0..campaigns.len()).collect();
    order.sort_by(|&a, &b| {
        remainders[b]
            .partial_cmp(&remainders[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(campaigns[a].priority.cmp(&campaigns[b].priority))
    });
    for &idx in &order {
        if remaining == 0 {
            break;
        }
        base[idx] += 1;
        remaining -= 1;
    }
    base
}

fn equal_split(total: u64, campaigns: &[FixedCampaign]) -> Vec<u64> {
    let n = campaigns.len() as u64;
    let base = total / n;
    let mut remainder = total % n;
    let mut order: Vec<usize> = (0..campaigns.len()).collect();
    order.sort_by_key(|&i| campaigns[i].priority);
    let mut shares = vec![base; campaigns.len()];
    for &idx in &order {
        if remainder == 0 {
            break;
        }
        shares[idx] += 1;
        remainder -= 1;
    }
    shares
}
