//! Result ingress (spec.md §4.9 C11): consumes external bot-result records
//! keyed by `externalId = order.id` and advances delivery counters and
//! order status accordingly.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::messages::InstagramResultMessage;
use crate::bus::Envelope;
use crate::domain::OrderStatus;
use crate::error::{PipelineError, PipelineResult};
use crate::store::OrderStore;

pub struct ResultIngressWorker {
    order_store: Arc<OrderStore>,
}

impl ResultIngressWorker {
    pub fn new(order_store: Arc<OrderStore>) -> Self {
        Self { order_store }
    }

    /// Entry point for the `instagram.results` consumer loop. A malformed
    /// `externalId` is a poison message: logged, not re-queued.
    pub async fn handle(&self, envelope: Envelope) -> Result<(), (String, String)> {
        let msg: InstagramResultMessage = envelope
            .decode()
            .map_err(|e| ("Poison".to_string(), e.to_string()))?;

        self.process(msg)
            .await
            .map_err(|e| (e.kind_name().to_string(), e.to_string()))
    }

    async fn process(&self, msg: InstagramResultMessage) -> PipelineResult<()> {
        let order_id: i64 = msg.external_id.trim().parse().map_err(|_| {
            warn!(external_id = %msg.external_id, "malformed externalId, dropping record");
            PipelineError::Poison(format!("malformed externalId {:?}", msg.external_id))
        })?;

        let mut order = self.order_store.get(order_id).await?;

        let delivered = msg.current_count.unwrap_or(msg.completed);
        if delivered != order.views_delivered {
            order = self
                .order_store
                .set_delivery_totals(order.id, order.version, delivered, order.cost_incurred)
                .await?;
        }

        let next_status = derive_status(&msg);
        if order.status != next_status && order.status.can_transition_to(next_status) {
            order = self
                .order_store
                .transition(order.id, order.version, next_status, None)
                .await?;
        }

        info!(order_id = order.id, status = order.status.as_str(), delivered, "result ingested");
        Ok(())
    }
}

/// §4.9's status-derivation table.
fn derive_status(msg: &InstagramResultMessage) -> OrderStatus {
    match msg.status.as_str() {
        "completed" => OrderStatus::Completed,
        "failed" => OrderStatus::Error,
        "partial" if msg.completed > 0 && msg.failed > 0 => OrderStatus::Partial,
        "partial" if msg.completed > 0 => OrderStatus::Completed,
        "partial" => OrderStatus::Error,
        "processing" | "in_progress" => OrderStatus::Processing,
        "cancelled" => OrderStatus::Cancelled,
        _ => OrderStatus::Processing,
    }
}
