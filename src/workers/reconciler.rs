//! Reconciler (spec.md §4.6 C9): the periodic job that pulls tracker stats
//! for every active order's campaign bindings, applies the auto-pause
//! rules, and advances order status as the target quantity is met.
//!
//! Grounded on `route_quality/mitigation.rs::MitigationController`'s tick
//! loop (fixed interval, tolerant of partial per-item failure) and
//! `scrapers/dome_tracker.rs`'s retry-wrapped stat pulls, which the
//! `tracker::client` module already wraps for us.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::domain::{BindingStatus, CampaignBinding, Order, OrderStatus, TrafficStatus};
use crate::error::PipelineResult;
use crate::store::db::Db;
use crate::store::{CampaignStore, OrderStore};
use crate::tracker::Tracker;

pub struct Reconciler {
    order_store: Arc<OrderStore>,
    campaign_store: Arc<CampaignStore>,
    tracker: Arc<dyn Tracker>,
    db: Db,
    batch_size: usize,
    audit_retention_days: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileSummary {
    pub orders_scanned: usize,
    pub bindings_updated: usize,
    pub errors: usize,
}

impl Reconciler {
    pub fn new(
        order_store: Arc<OrderStore>,
        campaign_store: Arc<CampaignStore>,
        tracker: Arc<dyn Tracker>,
        db: Db,
        batch_size: usize,
        audit_retention_days: i64,
    ) -> Self {
        Self {
            order_store,
            campaign_store,
            tracker,
            db,
            batch_size,
            audit_retention_days,
        }
    }

    /// Drives the tick loop at `interval`. Never returns; errors within a
    /// tick are logged and the loop continues at the next interval per
    /// spec.md §4.6 ("must tolerate partial failure").
    pub async fn run(&self, interval: Duration) -> ! {
        let mut ticks_since_cleanup = 0u32;
        loop {
            match self.run_tick().await {
                Ok(summary) => info!(
                    orders = summary.orders_scanned,
                    bindings = summary.bindings_updated,
                    errors = summary.errors,
                    "reconciliation tick complete"
                ),
                Err(e) => error!(error = %e, "reconciliation tick failed to start"),
            }

            // §4.6: "A daily cleanup removes reconciliation-job audit rows
            // older than 30 days." Approximated here by counting ticks
            // against the configured interval rather than wall-clock date,
            // since the loop has no separate scheduler.
            ticks_since_cleanup += 1;
            let ticks_per_day = (Duration::from_secs(86_400).as_secs() / interval.as_secs().max(1)).max(1) as u32;
            if ticks_since_cleanup >= ticks_per_day {
                if let Err(e) = self.cleanup_audit_rows().await {
                    warn!(error = %e, "reconciliation audit cleanup failed");
                }
                ticks_since_cleanup = 0;
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// §4.6: processed in batches, tolerant of partial per-binding failure.
    pub async fn run_tick(&self) -> PipelineResult<ReconcileSummary> {
        let orders = self.order_store.list_reconcilable(self.batch_size as u32).await?;
        let mut summary = ReconcileSummary {
            orders_scanned: orders.len(),
            ..Default::default()
        };

        for order in &orders {
            match self.reconcile_order(order).await {
                Ok(updated) => summary.bindings_updated += updated,
                Err(e) => {
                    warn!(order_id = order.id, error = %e, "reconciling order failed, continuing with next");
                    summary.errors += 1;
                }
            }
        }

        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO reconciliation_audit (ran_at, orders_scanned, bindings_updated, errors)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                chrono::Utc::now().to_rfc3339(),
                summary.orders_scanned as i64,
                summary.bindings_updated as i64,
                summary.errors as i64,
            ],
        )?;

        Ok(summary)
    }

    async fn reconcile_order(&self, order: &Order) -> PipelineResult<usize> {
        let bindings = self.campaign_store.bindings_for_order(order.id).await?;
        let mut updated = 0usize;

        for binding in bindings.iter().filter(|b| b.status == BindingStatus::Active) {
            if let Err(e) = self.reconcile_binding(order, binding).await {
                warn!(order_id = order.id, binding_id = binding.id, error = %e, "binding reconciliation failed");
                continue;
            }
            updated += 1;
        }

        // Re-read bindings (some may have just been paused) to total up
        // delivery across all of them, active or not — a paused binding's
        // accumulated clicks still count toward delivered views.
        let bindings = self.campaign_store.bindings_for_order(order.id).await?;
        let total_clicks: u64 = bindings.iter().map(|b| b.clicks_delivered).sum();
        let total_cost: Decimal = bindings.iter().map(|b| b.cost).sum();
        let coefficient = order.coefficient.to_f64().unwrap_or(1.0).max(f64::MIN_POSITIVE);
        let total_views = (total_clicks as f64 / coefficient).floor() as u64;

        let current = self.order_store.get(order.id).await?;
        if total_views != current.views_delivered || total_cost != current.cost_incurred {
            let current = self
                .order_store
                .set_delivery_totals(current.id, current.version, total_views, total_cost)
                .await?;
            self.advance_status(&current, total_views).await?;
        } else {
            self.advance_status(&current, total_views).await?;
        }

        Ok(updated)
    }

    async fn advance_status(&self, order: &Order, total_views: u64) -> PipelineResult<()> {
        if total_views >= order.quantity as u64 {
            if order.status != OrderStatus::Completed && order.status.can_transition_to(OrderStatus::Completed) {
                // Status and traffic status land in the same version-guarded
                // update so the second write can't miss on a version the
                // first write just bumped.
                self.order_store
                    .transition_with_traffic_status(
                        order.id,
                        order.version,
                        OrderStatus::Completed,
                        TrafficStatus::Delivered,
                        Some("target quantity reached"),
                    )
                    .await?;
            } else if order.traffic_status != TrafficStatus::Delivered {
                self.order_store
                    .set_traffic_status(order.id, order.version, TrafficStatus::Delivered)
                    .await?;
            }
        } else if total_views > 0 && order.traffic_status != TrafficStatus::Running {
            self.order_store
                .set_traffic_status(order.id, order.version, TrafficStatus::Running)
                .await?;
        }
        Ok(())
    }

    async fn reconcile_binding(&self, order: &Order, binding: &CampaignBinding) -> PipelineResult<()> {
        let stats = self
            .tracker
            .get_detailed_stats(&binding.external_campaign_id, None, None)
            .await?;

        // The tracker reports lifetime totals; the store accumulates via
        // deltas, so only the increment since the last pull is applied.
        let clicks_delta = stats.clicks.saturating_sub(binding.clicks_delivered);
        let conversions_delta = stats.conversions.saturating_sub(binding.conversions);
        let cost_delta = (stats.cost - binding.cost).max(Decimal::ZERO);
        let revenue_delta = (stats.revenue - binding.revenue).max(Decimal::ZERO);

        let updated_binding = self
            .campaign_store
            .record_stats(binding.id, clicks_delta, conversions_delta, cost_delta, revenue_delta)
            .await?;

        if let Some(reason) = auto_pause_reason(order, &updated_binding, &stats) {
            self.tracker.pause_campaign(&binding.external_campaign_id).await?;
            self.campaign_store
                .set_binding_status(binding.id, BindingStatus::Paused, Some(&reason))
                .await?;
        }

        Ok(())
    }

    async fn cleanup_audit_rows(&self) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.audit_retention_days);
        conn.execute(
            "DELETE FROM reconciliation_audit WHERE ran_at < ?1",
            rusqlite::params![cutoff.to_rfc3339()],
        )?;
        Ok(())
    }
}

/// §4.6 auto-pause triggers, first match wins.
fn auto_pause_reason(
    order: &Order,
    binding: &CampaignBinding,
    stats: &crate::tracker::CampaignStats,
) -> Option<String> {
    let coefficient = order.coefficient.to_f64().unwrap_or(1.0).max(f64::MIN_POSITIVE);
    if (stats.clicks as f64 / coefficient).floor() as u64 >= order.quantity as u64 {
        return Some("Order quantity target reached".to_string());
    }
    if let Some(limit) = binding.budget_limit {
        if stats.cost >= limit {
            return Some("Campaign budget limit reached".to_string());
        }
    }
    if let Some(limit) = order.budget_limit {
        if order.cost_incurred + stats.cost >= limit {
            return Some("Order budget limit reached".to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderStatus;
    use crate::store::{CampaignStore, Db, NewOrder, OrderStore};
    use crate::tracker::client::stub::StubTracker;
    use crate::tracker::CampaignStats;
    use rust_decimal_macros::dec;

    async fn setup() -> (Db, Arc<OrderStore>, Arc<CampaignStore>, Arc<StubTracker>) {
        let db = Db::open_in_memory().unwrap();
        let order_store = Arc::new(OrderStore::new(db.clone()));
        let campaign_store = Arc::new(CampaignStore::new(db.clone()));
        let tracker = Arc::new(StubTracker::new());
        (db, order_store, campaign_store, tracker)
    }

    #[tokio::test]
    async fn reconcile_tick_completes_order_on_target_reached() {
        let (db, order_store, campaign_store, tracker) = setup().await;

        let order = order_store
            .create(NewOrder {
                user_id: 1,
                service_id: 1,
                link: "https://youtu.be/abc".to_string(),
                quantity: 2000,
                charge: dec!(5.00),
                coefficient: dec!(3.0),
                target_country: None,
                budget_limit: None,
                is_refill: false,
                refill_parent_id: None,
            })
            .await
            .unwrap();
        let order = order_store
            .transition(order.id, order.version, OrderStatus::Processing, None)
            .await
            .unwrap();
        let order = order_store
            .transition(order.id, order.version, OrderStatus::InProgress, None)
            .await
            .unwrap();
        order_store
            .transition(order.id, order.version, OrderStatus::Active, None)
            .await
            .unwrap();

        let binding = campaign_store
            .create_binding(order.id, "ext-1", "offer-1", 6000, None)
            .await
            .unwrap();
        tracker.exists.lock().unwrap().insert("ext-1".to_string());
        tracker.stats.lock().unwrap().insert(
            binding.external_campaign_id.clone(),
            CampaignStats {
                clicks: 6000,
                conversions: 10,
                cost: dec!(30.00),
                revenue: dec!(0),
            },
        );

        let reconciler = Reconciler::new(order_store.clone(), campaign_store.clone(), tracker.clone(), db, 50, 30);
        let summary = reconciler.run_tick().await.unwrap();
        assert_eq!(summary.bindings_updated, 1);

        let order = order_store.get(order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.views_delivered, 2000);
        assert_eq!(order.traffic_status, TrafficStatus::Delivered);
    }

    #[tokio::test]
    async fn reconcile_tick_is_idempotent() {
        let (db, order_store, campaign_store, tracker) = setup().await;
        let order = order_store
            .create(NewOrder {
                user_id: 1,
                service_id: 1,
                link: "https://youtu.be/abc".to_string(),
                quantity: 10_000,
                charge: dec!(5.00),
                coefficient: dec!(4.0),
                target_country: None,
                budget_limit: None,
                is_refill: false,
                refill_parent_id: None,
            })
            .await
            .unwrap();
        let order = order_store
            .transition(order.id, order.version, OrderStatus::Processing, None)
            .await
            .unwrap();
        order_store
            .transition(order.id, order.version, OrderStatus::InProgress, None)
            .await
            .unwrap();

        let binding = campaign_store
            .create_binding(order.id, "ext-2", "offer-2", 40_000, None)
            .await
            .unwrap();
        tracker.exists.lock().unwrap().insert("ext-2".to_string());
        tracker.stats.lock().unwrap().insert(
            binding.external_campaign_id.clone(),
            CampaignStats {
                clicks: 8000,
                conversions: 1,
                cost: dec!(10.00),
                revenue: dec!(0),
            },
        );

        let reconciler = Reconciler::new(order_store.clone(), campaign_store.clone(), tracker.clone(), db, 50, 30);
        reconciler.run_tick().await.unwrap();
        let after_first = order_store.get(order.id).await.unwrap();

        reconciler.run_tick().await.unwrap();
        let after_second = order_store.get(order.id).await.unwrap();

        assert_eq!(after_first.views_delivered, after_second.views_delivered);
        assert_eq!(after_first.cost_incurred, after_second.cost_incurred);
        assert_eq!(after_first.status, after_second.status);
    }

    #[tokio::test]
    async fn budget_limit_triggers_pause_with_expected_reason() {
        let (db, order_store, campaign_store, tracker) = setup().await;
        let order = order_store
            .create(NewOrder {
                user_id: 1,
                service_id: 1,
                link: "https://youtu.be/abc".to_string(),
                quantity: 10_000,
                charge: dec!(5.00),
                coefficient: dec!(4.0),
                target_country: None,
                budget_limit: Some(dec!(50.00)),
                is_refill: false,
                refill_parent_id: None,
            })
            .await
            .unwrap();
        let order = order_store
            .transition(order.id, order.version, OrderStatus::Processing, None)
            .await
            .unwrap();
        order_store
            .transition(order.id, order.version, OrderStatus::InProgress, None)
            .await
            .unwrap();

        let binding = campaign_store
            .create_binding(order.id, "ext-3", "offer-3", 40_000, None)
            .await
            .unwrap();
        tracker.exists.lock().unwrap().insert("ext-3".to_string());
        tracker.stats.lock().unwrap().insert(
            binding.external_campaign_id.clone(),
            CampaignStats {
                clicks: 8000,
                conversions: 1,
                cost: dec!(50.10),
                revenue: dec!(0),
            },
        );

        let reconciler = Reconciler::new(order_store.clone(), campaign_store.clone(), tracker.clone(), db, 50, 30);
        reconciler.run_tick().await.unwrap();

        let binding = campaign_store.get_binding(binding.id).await.unwrap();
        assert_eq!(binding.status, BindingStatus::Paused);
        assert_eq!(binding.pause_reason.as_deref(), Some("Order budget limit reached"));
    }
}
