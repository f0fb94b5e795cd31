//! Refill engine (spec.md §4.7 C10): admin-triggered re-measurement of an
//! underdelivered order that creates a zero-charge child order to make up
//! the shortfall, under strict idempotency and concurrency guards.
//!
//! Grounded on `vault/pool.rs::PooledVault::withdraw`'s reject-early ladder
//! (validate every precondition before any mutation) generalized to the
//! twelve-step guard chain spec.md §4.7 specifies.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use crate::bus::messages::{OrderCreatedMessage, VideoProcessingMessage};
use crate::bus::{publish_json, MessageBus, Topic};
use crate::domain::{Order, OrderRefill, OrderStatus, MAX_REFILLS, REFILL_IDEMPOTENCY_WINDOW_SECS};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{NewOrder, OrderStore, RefillStore, ServiceStore};
use crate::video::VideoClient;

pub struct RefillEngine {
    order_store: Arc<OrderStore>,
    refill_store: Arc<RefillStore>,
    service_store: Arc<ServiceStore>,
    video_client: Arc<dyn VideoClient>,
    bus: Arc<dyn MessageBus>,
    bus_max_attempts: u8,
    idempotency_window: std::time::Duration,
    sanity_multiplier: f64,
    max_refills: usize,
}

pub struct RefillResult {
    pub child_order: Order,
    pub refill_number: u32,
    pub delivered: u64,
    pub refill_quantity: u32,
}

/// Non-terminal-or-completed statuses a refill child can be in while still
/// counting against a parent's §4.7 step 5 / invariant 4 cap of 5.
fn counts_toward_cap(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Completed
            | OrderStatus::InProgress
            | OrderStatus::Partial
            | OrderStatus::Active
            | OrderStatus::Pending
            | OrderStatus::Processing
    )
}

fn is_non_terminal(status: OrderStatus) -> bool {
    !matches!(status, OrderStatus::Completed | OrderStatus::Cancelled)
}

impl RefillEngine {
    pub fn new(
        order_store: Arc<OrderStore>,
        refill_store: Arc<RefillStore>,
        service_store: Arc<ServiceStore>,
        video_client: Arc<dyn VideoClient>,
        bus: Arc<dyn MessageBus>,
        bus_max_attempts: u8,
        idempotency_window: std::time::Duration,
        sanity_multiplier: f64,
        max_refills: usize,
    ) -> Self {
        Self {
            order_store,
            refill_store,
            service_store,
            video_client,
            bus,
            bus_max_attempts,
            idempotency_window,
            sanity_multiplier,
            max_refills: max_refills.min(MAX_REFILLS),
        }
    }

    /// §4.7 steps 1-13.
    pub async fn create_refill(&self, original_order_id: i64) -> PipelineResult<RefillResult> {
        let parent = self.order_store.get(original_order_id).await?;

        // Step 2: a refill may not itself be refilled.
        if parent.is_refill {
            return Err(PipelineError::Validation(
                "cannot refill an order that is itself a refill".to_string(),
            ));
        }

        // Step 6: parent must be in a state where delivery is measurable.
        if !matches!(
            parent.status,
            OrderStatus::Completed | OrderStatus::InProgress | OrderStatus::Partial
        ) {
            return Err(PipelineError::Validation(format!(
                "parent order {original_order_id} is in status {:?}, not eligible for refill",
                parent.status
            )));
        }
        let start_count = parent
            .start_count
            .ok_or_else(|| PipelineError::Validation("parent order has no recorded start count".to_string()))?;

        let children = self.order_store.refill_children(original_order_id).await?;

        // Step 3: reject if any child refill is still non-terminal.
        if children.iter().any(|c| is_non_terminal(c.status)) {
            return Err(PipelineError::Conflict(format!(
                "parent order {original_order_id} has a refill still in progress"
            )));
        }

        // Step 4: idempotency window — a prior request within the window
        // returns Conflict rather than creating a second child.
        if self
            .refill_store
            .most_recent_within(original_order_id, self.idempotency_window)
            .await?
            .is_some()
        {
            return Err(PipelineError::Conflict(format!(
                "a refill for order {original_order_id} was already created within the last {} s",
                REFILL_IDEMPOTENCY_WINDOW_SECS
            )));
        }

        // Step 5 / invariant 4: at most `max_refills` counted children.
        let active_or_completed = children.iter().filter(|c| counts_toward_cap(c.status)).count();
        if active_or_completed >= self.max_refills {
            return Err(PipelineError::Conflict(format!(
                "parent order {original_order_id} already has {active_or_completed} refills"
            )));
        }

        // Step 7: re-probe the current view count.
        let current_views = self.video_client.probe_view_count(&parent.link).await?;

        // Step 8.
        let delivered = current_views.saturating_sub(start_count);
        if delivered as u32 > parent.quantity {
            // Delivered more than ordered: nothing left to refill but not
            // itself an error worth surfacing differently from "already
            // delivered".
            return Err(PipelineError::Validation(
                "parent order already fully delivered".to_string(),
            ));
        }
        let refill_qty = parent.quantity.saturating_sub(delivered as u32);

        // Step 9: sanity checks.
        if refill_qty == 0 {
            return Err(PipelineError::Validation(
                "parent order already fully delivered".to_string(),
            ));
        }
        let sanity_cap = (parent.quantity as f64 * self.sanity_multiplier).floor() as u32;
        if refill_qty > sanity_cap {
            return Err(PipelineError::Conflict(format!(
                "refill quantity {refill_qty} exceeds the {}x sanity cap ({sanity_cap}); likely an upstream counter error",
                self.sanity_multiplier
            )));
        }

        // Step 10: `refill_number` is 1-based and sequential, tracked in the
        // audit table rather than derived from the Order rows.
        let refill_number = self.refill_store.count_for_parent(original_order_id).await? as u32 + 1;

        // Step 11: create the child order.
        let child = self
            .order_store
            .create(NewOrder {
                user_id: parent.user_id,
                service_id: parent.service_id,
                link: parent.link.clone(),
                quantity: refill_qty,
                charge: Decimal::ZERO,
                coefficient: parent.coefficient,
                target_country: parent.target_country.clone(),
                budget_limit: parent.budget_limit,
                is_refill: true,
                refill_parent_id: Some(parent.id),
            })
            .await?;

        // Step 12.
        let refill_row = OrderRefill {
            original_order_id: parent.id,
            refill_order_id: child.id,
            refill_number,
            original_quantity: parent.quantity,
            delivered_quantity: delivered,
            refill_quantity: refill_qty,
            start_count_at_refill: current_views,
            created_at: chrono::Utc::now(),
        };
        self.refill_store.record(&refill_row).await?;

        // Step 13: the child re-enters the normal pipeline, the same way a
        // fresh intake order does (§4.4 step 5 / §2 data flow): a slim
        // `order.created` notification plus the rich `video.processing`
        // envelope C7 actually consumes.
        publish_json(
            self.bus.as_ref(),
            Topic::OrderCreated,
            &child.id.to_string(),
            &OrderCreatedMessage {
                order_id: child.id,
                user_id: child.user_id,
            },
            self.bus_max_attempts,
        )
        .await?;
        let service = self.service_store.get(child.service_id).await?;
        publish_json(
            self.bus.as_ref(),
            Topic::VideoProcessing,
            &child.id.to_string(),
            &VideoProcessingMessage::for_order(&child, &service, 1, self.bus_max_attempts),
            self.bus_max_attempts,
        )
        .await?;

        info!(parent_id = parent.id, child_id = child.id, refill_number, refill_qty, "refill created");

        Ok(RefillResult {
            child_order: child,
            refill_number,
            delivered,
            refill_quantity: refill_qty,
        })
    }

}
