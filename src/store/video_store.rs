//! Video-processing sub-state persistence (spec.md §3.1, §4.5 C5/C7).

use rusqlite::{params, OptionalExtension};

use crate::domain::{VideoProcessing, VideoProcessingStatus, VideoType};
use crate::error::{PipelineError, PipelineResult};

use super::db::Db;

pub struct VideoStore {
    db: Db,
}

fn row_to_video(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoProcessing> {
    let video_type: String = row.get("video_type")?;
    let status: String = row.get("status")?;
    Ok(VideoProcessing {
        order_id: row.get("order_id")?,
        original_url: row.get("original_url")?,
        video_type: match video_type.as_str() {
            "SHORTS" => VideoType::Shorts,
            "LIVE" => VideoType::Live,
            _ => VideoType::Standard,
        },
        clip_created: row.get::<_, i64>("clip_created")? != 0,
        clip_url: row.get("clip_url")?,
        youtube_account_id: row.get("youtube_account_id")?,
        status: parse_status(&status),
        attempt_count: row.get("attempt_count")?,
        last_error: row.get("last_error")?,
    })
}

fn parse_status(s: &str) -> VideoProcessingStatus {
    use VideoProcessingStatus::*;
    match s {
        "QUEUED" => Queued,
        "PROCESSING" => Processing,
        "COMPLETED" => Completed,
        "FAILED" => Failed,
        "CANCELLED" => Cancelled,
        "RETRYING" => Retrying,
        _ => Pending,
    }
}

impl VideoStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        order_id: i64,
        original_url: &str,
        video_type: VideoType,
    ) -> PipelineResult<VideoProcessing> {
        let conn = self.db.conn.lock().await;
        let type_str = match video_type {
            VideoType::Standard => "STANDARD",
            VideoType::Shorts => "SHORTS",
            VideoType::Live => "LIVE",
        };
        conn.execute(
            "INSERT OR IGNORE INTO video_processing (order_id, original_url, video_type, status)
             VALUES (?1, ?2, ?3, 'PENDING')",
            params![order_id, original_url, type_str],
        )?;
        drop(conn);
        self.get(order_id).await
    }

    pub async fn get(&self, order_id: i64) -> PipelineResult<VideoProcessing> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT * FROM video_processing WHERE order_id = ?1",
            params![order_id],
            row_to_video,
        )
        .optional()?
        .ok_or_else(|| PipelineError::NotFound(format!("video processing for order {order_id}")))
    }

    pub async fn mark_status(
        &self,
        order_id: i64,
        status: VideoProcessingStatus,
        last_error: Option<&str>,
    ) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE video_processing
             SET status = ?1, last_error = ?2, attempt_count = attempt_count + 1
             WHERE order_id = ?3",
            params![status.as_str(), last_error, order_id],
        )?;
        Ok(())
    }

    pub async fn attach_clip(
        &self,
        order_id: i64,
        clip_url: &str,
        youtube_account_id: i64,
    ) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE video_processing
             SET clip_created = 1, clip_url = ?1, youtube_account_id = ?2, status = 'COMPLETED'
             WHERE order_id = ?3",
            params![clip_url, youtube_account_id, order_id],
        )?;
        Ok(())
    }
}
