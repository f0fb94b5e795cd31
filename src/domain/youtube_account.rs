//! YouTube account pool with daily-quota tracking (spec.md §3.1, §4.5).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Blocked,
    Suspended,
    RateLimited,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Blocked => "BLOCKED",
            AccountStatus::Suspended => "SUSPENDED",
            AccountStatus::RateLimited => "RATE_LIMITED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => AccountStatus::Active,
            "BLOCKED" => AccountStatus::Blocked,
            "SUSPENDED" => AccountStatus::Suspended,
            "RATE_LIMITED" => AccountStatus::RateLimited,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YouTubeAccount {
    pub id: i64,
    pub credential_ref: String,
    pub status: AccountStatus,
    pub daily_clips_count: u32,
    pub last_clip_date: Option<NaiveDate>,
    pub daily_limit: u32,
    pub proxy_config: Option<String>,
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl YouTubeAccount {
    /// True once rolled over to a new UTC day; the count resets on first use.
    pub fn needs_daily_reset(&self, today: NaiveDate) -> bool {
        match self.last_clip_date {
            Some(d) => d < today,
            None => false,
        }
    }

    pub fn has_quota(&self, today: NaiveDate) -> bool {
        self.status == AccountStatus::Active
            && (self.needs_daily_reset(today) || self.daily_clips_count < self.daily_limit)
    }
}
