//! Video-processing sub-state-machine (spec.md §3.1, §4.5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoType {
    Standard,
    Shorts,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoProcessingStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl VideoProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoProcessingStatus::Pending => "PENDING",
            VideoProcessingStatus::Queued => "QUEUED",
            VideoProcessingStatus::Processing => "PROCESSING",
            VideoProcessingStatus::Completed => "COMPLETED",
            VideoProcessingStatus::Failed => "FAILED",
            VideoProcessingStatus::Cancelled => "CANCELLED",
            VideoProcessingStatus::Retrying => "RETRYING",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoProcessing {
    pub order_id: i64,
    pub original_url: String,
    pub video_type: VideoType,
    pub clip_created: bool,
    pub clip_url: Option<String>,
    pub youtube_account_id: Option<i64>,
    pub status: VideoProcessingStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// Which path the worker chose for a given order (spec.md §4.5).
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingMode {
    ClipPath { account_id: i64 },
    DirectPath,
}
