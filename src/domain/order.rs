//! Order aggregate and its status state machine (spec.md §3.1, §4.2).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    InProgress,
    Active,
    Partial,
    Completed,
    Cancelled,
    Paused,
    Holding,
    Error,
    Refill,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Active => "ACTIVE",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Paused => "PAUSED",
            OrderStatus::Holding => "HOLDING",
            OrderStatus::Error => "ERROR",
            OrderStatus::Refill => "REFILL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => OrderStatus::Pending,
            "PROCESSING" => OrderStatus::Processing,
            "IN_PROGRESS" => OrderStatus::InProgress,
            "ACTIVE" => OrderStatus::Active,
            "PARTIAL" => OrderStatus::Partial,
            "COMPLETED" => OrderStatus::Completed,
            "CANCELLED" => OrderStatus::Cancelled,
            "PAUSED" => OrderStatus::Paused,
            "HOLDING" => OrderStatus::Holding,
            "ERROR" => OrderStatus::Error,
            "REFILL" => OrderStatus::Refill,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Permitted transitions per spec.md §4.2. HOLDING is reachable from, and
    /// returns to, any non-terminal state via an operator action and is
    /// handled separately by callers rather than encoded per-source-state
    /// here (every non-terminal state allows it).
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            return false;
        }
        if next == Holding {
            return !self.is_terminal();
        }
        if *self == Holding {
            // Operator-driven resume; the store layer records which state
            // HOLDING was entered from and passes it back as `next`.
            return !next.is_terminal() || next == Cancelled;
        }
        match (*self, next) {
            (Pending, Processing) => true,
            (Pending, Cancelled) => true,
            (Processing, InProgress) => true,
            (Processing, Error) => true,
            (InProgress, Active) => true,
            (InProgress, Error) => true,
            (Active, Completed) => true,
            (Active, Partial) => true,
            (Active, Paused) => true,
            (Paused, Active) => true,
            (Partial, Completed) => true,
            (Error, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficStatus {
    None,
    Running,
    Delivered,
}

impl TrafficStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficStatus::None => "NONE",
            TrafficStatus::Running => "RUNNING",
            TrafficStatus::Delivered => "DELIVERED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "NONE" => TrafficStatus::None,
            "RUNNING" => TrafficStatus::Running,
            "DELIVERED" => TrafficStatus::Delivered,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub service_id: i64,
    pub link: String,
    pub quantity: u32,
    pub charge: Decimal,
    pub start_count: Option<u64>,
    pub remains: u32,
    pub status: OrderStatus,
    pub youtube_video_id: Option<String>,
    pub coefficient: Decimal,
    pub target_country: Option<String>,
    pub budget_limit: Option<Decimal>,
    pub cost_incurred: Decimal,
    pub views_delivered: u64,
    pub traffic_status: TrafficStatus,
    pub is_refill: bool,
    pub refill_parent_id: Option<i64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remains_invariant_holds(&self) -> bool {
        self.remains <= self.quantity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: i64,
    pub order_id: i64,
    pub event_type: String,
    pub old_status: Option<OrderStatus>,
    pub new_status: Option<OrderStatus>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}
