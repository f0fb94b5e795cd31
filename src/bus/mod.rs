//! Durable, partitioned message bus abstraction (spec.md §4.3).
//!
//! No Kafka client exists anywhere in the corpus this crate was grown from,
//! so the bus is implemented from scratch as a SQLite-backed durable log:
//! publish is an INSERT, ack is a row update, and redelivery is another row
//! with a later `schedule_at`. The public `MessageBus` trait is what
//! workers actually depend on, so a future Kafka-backed implementation is a
//! drop-in replacement. Grounded on the teacher's `rusqlite` access pattern
//! (`store::db::Db`) and its `tokio::spawn` consumer-loop shape in
//! `scrapers/dome_tracker.rs`; the per-key in-flight tracking uses
//! `dashmap`, already in the teacher's dependency stack for concurrent
//! keyed state.

pub mod inmemory;
pub mod messages;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    OrderCreated,
    OrderStateChanged,
    VideoProcessing,
    OfferAssignment,
    InstagramResults,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OrderCreated => "order.created",
            Topic::OrderStateChanged => "order.state.changed",
            Topic::VideoProcessing => "video.processing",
            Topic::OfferAssignment => "offer.assignment",
            Topic::InstagramResults => "instagram.results",
        }
    }

    /// §4.3 retention floor per topic; the in-memory/SQLite bus doesn't
    /// enforce retention itself (no background compaction here is grounded
    /// in the spec — reconciliation's audit-row cleanup is the one retention
    /// job the spec actually names) but `reconcile::cleanup` uses this for
    /// the analogous DLQ/retry rows.
    pub fn min_retention_days(&self) -> i64 {
        match self {
            Topic::OrderCreated | Topic::OrderStateChanged | Topic::InstagramResults => 7,
            Topic::VideoProcessing | Topic::OfferAssignment => 30,
        }
    }
}

/// A message pulled off a topic, ready for a consumer to process.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: i64,
    pub topic: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub attempt_number: u8,
    pub max_attempts: u8,
    pub schedule_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> PipelineResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| crate::error::PipelineError::Poison(format!("undecodable envelope: {e}")))
    }
}

/// §4.3: producer contract is idempotent publish keyed by orderId; consumer
/// contract is manual ack after successful processing, with poison/failed
/// messages routed to `<topic>.retry` or `<topic>.dlq`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Raw, already-serialized publish. Kept object-safe (no generic
    /// parameter) so workers can share one `Arc<dyn MessageBus>`; typed
    /// producers go through the `publish_json` helper below.
    async fn publish_value(
        &self,
        topic: Topic,
        key: &str,
        payload: serde_json::Value,
        max_attempts: u8,
    ) -> PipelineResult<()>;

    /// Pull up to `batch_size` due messages from `topic` (including its
    /// `.retry` rows whose `schedule_at` has elapsed), oldest first.
    async fn poll(&self, topic: Topic, batch_size: usize) -> PipelineResult<Vec<Envelope>>;

    async fn ack(&self, envelope_id: i64) -> PipelineResult<()>;

    /// §4.3 failure path: bump `attemptNumber`; if still within
    /// `maxAttempts`, requeue with exponential backoff, otherwise move to
    /// the DLQ with failure metadata attached.
    async fn nack(
        &self,
        envelope: &Envelope,
        error_kind: &str,
        error_message: &str,
    ) -> PipelineResult<()>;
}

/// Typed convenience wrapper over `publish_value` — serializes `payload`
/// then delegates, so producers never touch `serde_json::Value` directly.
pub async fn publish_json<B: MessageBus + ?Sized, T: Serialize + Sync>(
    bus: &B,
    topic: Topic,
    key: &str,
    payload: &T,
    max_attempts: u8,
) -> PipelineResult<()> {
    let value = serde_json::to_value(payload)
        .map_err(|e| PipelineError::Fatal(format!("unserializable message: {e}")))?;
    bus.publish_value(topic, key, value, max_attempts).await
}
