//! Video-processing worker (spec.md §4.5 C7): decides clip vs direct path,
//! probes the starting view count, optionally creates a clip, and hands the
//! order off to the campaign assigner via `offer.assignment`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::bus::messages::{OfferAssignmentMessage, VideoProcessingMessage};
use crate::bus::{publish_json, Envelope, MessageBus, Topic};
use crate::domain::{AccountStatus, CoefficientMode, OrderStatus, ProcessingMode, VideoProcessingStatus};
use crate::error::PipelineResult;
use crate::store::{AccountStore, OrderStore, ServiceStore, VideoStore};
use crate::video::VideoClient;

pub struct VideoProcessingWorker {
    order_store: Arc<OrderStore>,
    service_store: Arc<ServiceStore>,
    video_store: Arc<VideoStore>,
    account_store: Arc<AccountStore>,
    video_client: Arc<dyn VideoClient>,
    bus: Arc<dyn MessageBus>,
    bus_max_attempts: u8,
}

impl VideoProcessingWorker {
    pub fn new(
        order_store: Arc<OrderStore>,
        service_store: Arc<ServiceStore>,
        video_store: Arc<VideoStore>,
        account_store: Arc<AccountStore>,
        video_client: Arc<dyn VideoClient>,
        bus: Arc<dyn MessageBus>,
        bus_max_attempts: u8,
    ) -> Self {
        Self {
            order_store,
            service_store,
            video_store,
            account_store,
            video_client,
            bus,
            bus_max_attempts,
        }
    }

    /// Entry point for the bus consumer loop (`bus::inmemory::run_consumer`).
    /// Returns `Err((kind, message))` so the caller can nack with retry
    /// metadata; `Poison` failures (malformed envelope) are the one class
    /// that should go straight to the DLQ, which the bus does automatically
    /// once `max_attempts` is reached — a poison envelope is reported with
    /// `max_attempts` pre-exhausted by the caller's `nack` handling the
    /// normal way since the message itself still carries a real
    /// `max_attempts` value.
    pub async fn handle(&self, envelope: Envelope) -> Result<(), (String, String)> {
        let msg: VideoProcessingMessage = envelope
            .decode()
            .map_err(|e| ("Poison".to_string(), e.to_string()))?;

        self.process(msg)
            .await
            .map_err(|e| (e.kind_name().to_string(), e.to_string()))
    }

    async fn process(&self, msg: VideoProcessingMessage) -> PipelineResult<()> {
        let order = self.order_store.get(msg.order_id).await?;
        // Idempotent: a retried envelope finds the row already present.
        self.video_store
            .create(order.id, &msg.original_url, crate::domain::VideoType::Standard)
            .await?;
        self.video_store
            .mark_status(order.id, VideoProcessingStatus::Processing, None)
            .await?;

        let order = if order.status == OrderStatus::Pending {
            self.order_store
                .transition(order.id, order.version, OrderStatus::Processing, None)
                .await?
        } else {
            order
        };

        let service = self.service_store.get(order.service_id).await?;
        let today = Utc::now().date_naive();

        let mode = self.decide_mode(&service, today).await?;
        let coefficient = match mode {
            ProcessingMode::ClipPath { .. } => {
                self.service_store.coefficient(order.service_id, CoefficientMode::WithClip).await?
            }
            ProcessingMode::DirectPath => {
                self.service_store.coefficient(order.service_id, CoefficientMode::WithoutClip).await?
            }
        };

        let start_count = self.video_client.probe_view_count(&msg.original_url).await.map_err(|e| {
            warn!(order_id = order.id, error = %e, "start-count probe failed");
            e
        })?;

        let target_url = match mode {
            ProcessingMode::ClipPath { account_id } => {
                match self.video_client.create_clip(&msg.original_url, &account_id.to_string()).await {
                    Ok(clip_url) => {
                        self.video_store.attach_clip(order.id, &clip_url, account_id).await?;
                        clip_url
                    }
                    Err(e) => {
                        warn!(order_id = order.id, error = %e, "clip creation failed, falling back to direct path");
                        let _ = self.account_store.mark_status(account_id, AccountStatus::Active).await;
                        msg.original_url.clone()
                    }
                }
            }
            ProcessingMode::DirectPath => msg.original_url.clone(),
        };

        let order = self
            .order_store
            .set_coefficient(order.id, order.version, coefficient)
            .await?;
        self.order_store
            .set_video_link(order.id, order.version, &msg.video_id, start_count)
            .await?;
        let order = self.order_store.get(order.id).await?;
        // §4.2/§4.6: C7 stops at IN_PROGRESS; the assigner (C8) owns the
        // IN_PROGRESS -> ACTIVE transition once campaign bindings exist.
        let order = self
            .order_store
            .transition(order.id, order.version, OrderStatus::InProgress, None)
            .await?;

        let _ = self.video_store.mark_status(order.id, VideoProcessingStatus::Completed, None).await;

        publish_json(
            self.bus.as_ref(),
            Topic::OfferAssignment,
            &order.id.to_string(),
            &OfferAssignmentMessage {
                order_id: order.id,
                target_url,
                geo_targeting: msg.geo_targeting,
            },
            self.bus_max_attempts,
        )
        .await?;

        info!(order_id = order.id, coefficient = %coefficient, "video processing complete");
        Ok(())
    }

    /// §4.5 mode decision: clip path requires the service to allow it, the
    /// video type to permit clipping, and a pooled account with quota left.
    async fn decide_mode(
        &self,
        service: &crate::domain::Service,
        today: chrono::NaiveDate,
    ) -> PipelineResult<ProcessingMode> {
        if !service.allow_clip_creation {
            return Ok(ProcessingMode::DirectPath);
        }
        match self.account_store.reserve_account(today).await? {
            Some(account) => Ok(ProcessingMode::ClipPath { account_id: account.id }),
            None => Ok(ProcessingMode::DirectPath),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::inmemory::SqliteBus;
    use crate::bus::MessageBus;
    use crate::store::{Db, NewOrder};
    use crate::video::client::stub::StubVideoClient;
    use rusqlite::params;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    async fn seed_service(db: &Db, allow_clip: bool) -> i64 {
        let conn = db.conn.lock().await;
        conn.execute(
            "INSERT INTO services
                (name, category, min_order_qty, max_order_qty, price_per_thousand,
                 active, allow_clip_creation, url_host_whitelist)
             VALUES ('YouTube Views', 'views', 100, 100000, '5.00', 1, ?1, '[]')",
            params![allow_clip as i64],
        )
        .unwrap();
        let service_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO coefficients (service_id, mode, coefficient) VALUES (?1, 'WITH_CLIP', '3.0')",
            params![service_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO coefficients (service_id, mode, coefficient) VALUES (?1, 'WITHOUT_CLIP', '4.0')",
            params![service_id],
        )
        .unwrap();
        service_id
    }

    async fn seed_account(db: &Db) -> i64 {
        let conn = db.conn.lock().await;
        conn.execute(
            "INSERT INTO youtube_accounts (credential_ref, status, daily_clips_count, daily_limit)
             VALUES ('cred-1', 'ACTIVE', 0, 10)",
            [],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn video_msg(order_id: i64, user_id: i64, video_id: &str, original_url: &str) -> VideoProcessingMessage {
        use crate::bus::messages::{Priority, ProcessingType};
        VideoProcessingMessage {
            order_id,
            video_id: video_id.to_string(),
            original_url: original_url.to_string(),
            target_quantity: 2000,
            priority: Priority::Medium,
            processing_type: ProcessingType::Views,
            attempt_number: 1,
            max_attempts: 3,
            created_at: chrono::Utc::now(),
            schedule_at: None,
            user_id,
            geo_targeting: None,
            clip_creation_enabled: true,
            processing_config: None,
            metadata: None,
        }
    }

    fn worker(
        db: Db,
        video_client: Arc<dyn crate::video::VideoClient>,
        bus: Arc<dyn MessageBus>,
    ) -> VideoProcessingWorker {
        VideoProcessingWorker::new(
            Arc::new(OrderStore::new(db.clone())),
            Arc::new(ServiceStore::new(db.clone())),
            Arc::new(VideoStore::new(db.clone())),
            Arc::new(AccountStore::new(db)),
            video_client,
            bus,
            3,
        )
    }

    #[tokio::test]
    async fn direct_path_persists_without_clip_coefficient_and_start_count() {
        let db = Db::open_in_memory().unwrap();
        let service_id = seed_service(&db, false).await;
        let order_store = OrderStore::new(db.clone());
        let order = order_store
            .create(NewOrder {
                user_id: 1,
                service_id,
                link: "https://youtu.be/abc123".to_string(),
                quantity: 2000,
                charge: dec!(5.00),
                coefficient: Decimal::ONE,
                target_country: None,
                budget_limit: None,
                is_refill: false,
                refill_parent_id: None,
            })
            .await
            .unwrap();

        let video_client = Arc::new(StubVideoClient::new());
        video_client
            .view_counts
            .lock()
            .unwrap()
            .insert("https://youtu.be/abc123".to_string(), 1000);
        let bus = Arc::new(SqliteBus::new(db.clone(), std::time::Duration::from_millis(10)));
        let worker = worker(db.clone(), video_client, bus.clone());

        worker
            .process(video_msg(order.id, 1, "abc123", "https://youtu.be/abc123"))
            .await
            .unwrap();

        let updated = order_store.get(order.id).await.unwrap();
        assert_eq!(updated.coefficient, Decimal::from_str("4.0").unwrap());
        assert_eq!(updated.start_count, Some(1000));
        assert_eq!(updated.status, OrderStatus::InProgress);

        let batch = bus.poll(Topic::OfferAssignment, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn clip_path_reserves_account_and_persists_clip_coefficient() {
        let db = Db::open_in_memory().unwrap();
        let service_id = seed_service(&db, true).await;
        seed_account(&db).await;
        let order_store = OrderStore::new(db.clone());
        let order = order_store
            .create(NewOrder {
                user_id: 1,
                service_id,
                link: "https://youtu.be/abc123".to_string(),
                quantity: 2000,
                charge: dec!(5.00),
                coefficient: Decimal::ONE,
                target_country: None,
                budget_limit: None,
                is_refill: false,
                refill_parent_id: None,
            })
            .await
            .unwrap();

        let video_client = Arc::new(StubVideoClient::new());
        video_client
            .view_counts
            .lock()
            .unwrap()
            .insert("https://youtu.be/abc123".to_string(), 500);
        let bus = Arc::new(SqliteBus::new(db.clone(), std::time::Duration::from_millis(10)));
        let worker = worker(db.clone(), video_client, bus);

        worker
            .process(video_msg(order.id, 1, "abc123", "https://youtu.be/abc123"))
            .await
            .unwrap();

        let updated = order_store.get(order.id).await.unwrap();
        assert_eq!(updated.coefficient, Decimal::from_str("3.0").unwrap());

        let video = VideoStore::new(db).get(order.id).await.unwrap();
        assert!(video.clip_created);
        assert_eq!(video.youtube_account_id, Some(1));
    }
}
