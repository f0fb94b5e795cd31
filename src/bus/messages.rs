//! Wire envelope shapes carried over the bus (spec.md §6.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Order, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingType {
    Views,
    Likes,
    Comments,
    Subscribers,
    Shares,
}

/// §6.1: the `video.processing` envelope. Other topics carry smaller,
/// purpose-specific payloads (see below) but reuse `attemptNumber` /
/// `maxAttempts` / `scheduleAt` as the common retry bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoProcessingMessage {
    pub order_id: i64,
    pub video_id: String,
    pub original_url: String,
    pub target_quantity: u32,
    pub priority: Priority,
    pub processing_type: ProcessingType,
    pub attempt_number: u8,
    pub max_attempts: u8,
    pub created_at: DateTime<Utc>,
    pub schedule_at: Option<DateTime<Utc>>,
    pub user_id: i64,
    pub geo_targeting: Option<String>,
    pub clip_creation_enabled: bool,
    pub processing_config: Option<serde_json::Value>,
    pub metadata: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedMessage {
    pub order_id: i64,
    pub user_id: i64,
}

impl VideoProcessingMessage {
    /// Builds the `video.processing` envelope (§6.1) for an order that has
    /// just entered the pipeline (fresh intake or a refill child), grounded
    /// on the order/service rows rather than carried separately on
    /// `order.created` — C6/C10 already hold both by the time they publish.
    pub fn for_order(order: &Order, service: &Service, attempt_number: u8, max_attempts: u8) -> Self {
        let video_id = crate::video::url::parse(&order.link)
            .map(|parsed| parsed.video_id)
            .unwrap_or_else(|_| order.link.clone());
        let processing_type = match service.category.to_lowercase().as_str() {
            "likes" => ProcessingType::Likes,
            "comments" => ProcessingType::Comments,
            "subscribers" => ProcessingType::Subscribers,
            "shares" => ProcessingType::Shares,
            _ => ProcessingType::Views,
        };
        Self {
            order_id: order.id,
            video_id,
            original_url: order.link.clone(),
            target_quantity: order.quantity,
            priority: Priority::Medium,
            processing_type,
            attempt_number,
            max_attempts,
            created_at: Utc::now(),
            schedule_at: None,
            user_id: order.user_id,
            geo_targeting: order.target_country.clone(),
            clip_creation_enabled: service.allow_clip_creation,
            processing_config: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStateChangedMessage {
    pub order_id: i64,
    pub old_status: String,
    pub new_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAssignmentMessage {
    pub order_id: i64,
    pub target_url: String,
    pub geo_targeting: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramResultMessage {
    pub external_id: String,
    pub status: String,
    pub completed: u64,
    pub failed: u64,
    pub current_count: Option<u64>,
}
