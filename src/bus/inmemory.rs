//! SQLite-backed `MessageBus` implementation plus a keyed worker pool that
//! enforces per-partition FIFO (spec.md §4.3, §5 Ordering).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use rusqlite::params;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::store::db::Db;

use super::{Envelope, MessageBus, Topic};

pub struct SqliteBus {
    db: Db,
    retry_base_delay: Duration,
}

impl SqliteBus {
    pub fn new(db: Db, retry_base_delay: Duration) -> Self {
        Self { db, retry_base_delay }
    }

    fn row_to_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<Envelope> {
        let payload: String = row.get("payload")?;
        let schedule_at: Option<String> = row.get("schedule_at")?;
        let created_at: String = row.get("created_at")?;
        Ok(Envelope {
            id: row.get("id")?,
            topic: row.get("topic")?,
            partition_key: row.get("partition_key")?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            attempt_number: row.get("attempt_number")?,
            max_attempts: row.get("max_attempts")?,
            schedule_at: schedule_at.and_then(|s| s.parse().ok()),
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl MessageBus for SqliteBus {
    async fn publish_value(
        &self,
        topic: Topic,
        key: &str,
        payload: serde_json::Value,
        max_attempts: u8,
    ) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO bus_messages
                (topic, partition_key, payload, attempt_number, max_attempts, schedule_at, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, NULL, ?5)",
            params![
                topic.as_str(),
                key,
                serde_json::to_string(&payload)
                    .map_err(|e| PipelineError::Fatal(format!("unserializable payload: {e}")))?,
                max_attempts,
                now,
            ],
        )?;
        Ok(())
    }

    async fn poll(&self, topic: Topic, batch_size: usize) -> PipelineResult<Vec<Envelope>> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let retry_topic = format!("{}.retry", topic.as_str());
        let mut stmt = conn.prepare(
            "SELECT * FROM bus_messages
             WHERE topic IN (?1, ?2) AND acked = 0 AND (schedule_at IS NULL OR schedule_at <= ?3)
             ORDER BY created_at ASC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![topic.as_str(), retry_topic, now, batch_size as i64],
                Self::row_to_envelope,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn ack(&self, envelope_id: i64) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE bus_messages SET acked = 1 WHERE id = ?1",
            params![envelope_id],
        )?;
        Ok(())
    }

    async fn nack(
        &self,
        envelope: &Envelope,
        error_kind: &str,
        error_message: &str,
    ) -> PipelineResult<()> {
        let next_attempt = envelope.attempt_number + 1;
        let base_topic = envelope.topic.strip_suffix(".retry").unwrap_or(&envelope.topic);
        let conn = self.db.conn.lock().await;
        let now = Utc::now();

        if next_attempt > envelope.max_attempts {
            conn.execute(
                "INSERT INTO bus_dlq (topic, partition_key, payload, failed_at, error_kind, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    base_topic,
                    envelope.partition_key,
                    serde_json::to_string(&envelope.payload).unwrap_or_default(),
                    now.to_rfc3339(),
                    error_kind,
                    error_message,
                ],
            )?;
            conn.execute("UPDATE bus_messages SET acked = 1 WHERE id = ?1", params![envelope.id])?;
            warn!(topic = %envelope.topic, key = %envelope.partition_key, "message moved to DLQ after exhausting retries");
            return Ok(());
        }

        // Exponential backoff: base_delay * 2^(attempt-1).
        let backoff_secs = self.retry_base_delay.as_secs_f64() * 2f64.powi((envelope.attempt_number - 1) as i32);
        let schedule_at = now + chrono::Duration::milliseconds((backoff_secs * 1000.0) as i64);

        conn.execute(
            "INSERT INTO bus_messages
                (topic, partition_key, payload, attempt_number, max_attempts, schedule_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format!("{base_topic}.retry"),
                envelope.partition_key,
                serde_json::to_string(&envelope.payload).unwrap_or_default(),
                next_attempt,
                envelope.max_attempts,
                schedule_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        conn.execute("UPDATE bus_messages SET acked = 1 WHERE id = ?1", params![envelope.id])?;
        info!(topic = %envelope.topic, key = %envelope.partition_key, attempt = next_attempt, "message scheduled for retry");
        Ok(())
    }
}

/// Drives one topic's consumption: polls for due work, hands each envelope
/// to `handler`, acks on success and nacks on error — all while making sure
/// two envelopes with the same `partition_key` never run concurrently
/// (spec.md §5 Ordering). `in_flight` is shared process-wide state; a
/// `DashSet` gives lock-free membership checks under concurrent workers.
pub async fn run_consumer<H, Fut>(
    bus: Arc<dyn MessageBus>,
    topic: Topic,
    worker_count: usize,
    poll_interval: Duration,
    handler: H,
) where
    H: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), (String, String)>> + Send + 'static,
{
    let in_flight: Arc<DashSet<String>> = Arc::new(DashSet::new());
    let permits = Arc::new(Semaphore::new(worker_count));
    let handler = Arc::new(handler);

    loop {
        let batch = match bus.poll(topic, worker_count * 4).await {
            Ok(b) => b,
            Err(e) => {
                warn!(?topic, error = %e, "poll failed");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        for envelope in batch {
            if !in_flight.insert(envelope.partition_key.clone()) {
                // Another in-flight message owns this key; leave it for the
                // next tick so ordering is preserved.
                continue;
            }
            let permit = permits.clone().acquire_owned().await.expect("semaphore open");
            let bus = bus.clone();
            let handler = handler.clone();
            let in_flight = in_flight.clone();
            let key = envelope.partition_key.clone();
            let envelope_id = envelope.id;
            tokio::spawn(async move {
                let _permit = permit;
                match handler(envelope.clone()).await {
                    Ok(()) => {
                        if let Err(e) = bus.ack(envelope_id).await {
                            warn!(error = %e, "ack failed");
                        }
                    }
                    Err((kind, message)) => {
                        if let Err(e) = bus.nack(&envelope, &kind, &message).await {
                            warn!(error = %e, "nack failed");
                        }
                    }
                }
                in_flight.remove(&key);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::publish_json;
    use serde_json::json;

    #[tokio::test]
    async fn publish_then_poll_then_ack_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let bus = SqliteBus::new(db, Duration::from_millis(1));

        publish_json(&bus, Topic::OrderCreated, "42", &json!({"orderId": 42}), 3)
            .await
            .unwrap();

        let batch = bus.poll(Topic::OrderCreated, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].partition_key, "42");
        assert_eq!(batch[0].attempt_number, 1);

        bus.ack(batch[0].id).await.unwrap();
        let batch = bus.poll(Topic::OrderCreated, 10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn nack_requeues_to_retry_topic_until_exhausted() {
        let db = Db::open_in_memory().unwrap();
        let bus = SqliteBus::new(db, Duration::from_millis(0));

        publish_json(&bus, Topic::VideoProcessing, "7", &json!({"orderId": 7}), 2)
            .await
            .unwrap();

        let batch = bus.poll(Topic::VideoProcessing, 10).await.unwrap();
        bus.nack(&batch[0], "UpstreamUnavailable", "timeout").await.unwrap();

        // Retry row should now be visible (zero backoff in this test).
        let batch = bus.poll(Topic::VideoProcessing, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempt_number, 2);

        bus.nack(&batch[0], "UpstreamUnavailable", "timeout again").await.unwrap();
        // Exhausted max_attempts=2: nothing left pollable, it went to the DLQ.
        let batch = bus.poll(Topic::VideoProcessing, 10).await.unwrap();
        assert!(batch.is_empty());
    }
}
