//! Fixed external-tracker campaign pool and per-order bindings (spec.md §3.1, §4.6).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedCampaign {
    pub id: i64,
    pub external_campaign_id: String,
    pub name: String,
    pub geo_targeting: Option<String>,
    pub priority: u32,
    pub weight: u32,
    pub active: bool,
    pub description: Option<String>,
}

/// The assigner's health-check invariant: exactly three active campaigns.
pub const REQUIRED_ACTIVE_CAMPAIGNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingStatus {
    Active,
    Paused,
    Finished,
}

impl BindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingStatus::Active => "ACTIVE",
            BindingStatus::Paused => "PAUSED",
            BindingStatus::Finished => "FINISHED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => BindingStatus::Active,
            "PAUSED" => BindingStatus::Paused,
            "FINISHED" => BindingStatus::Finished,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignBinding {
    pub id: i64,
    pub order_id: i64,
    pub external_campaign_id: String,
    pub offer_id: String,
    pub clicks_required: u64,
    pub clicks_delivered: u64,
    pub conversions: u64,
    pub cost: Decimal,
    pub revenue: Decimal,
    pub budget_limit: Option<Decimal>,
    pub status: BindingStatus,
    pub pause_reason: Option<String>,
    pub last_stats_at: Option<DateTime<Utc>>,
}
