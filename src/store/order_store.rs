//! Order CRUD, the status-transition guard, and the append-only order-event
//! log (spec.md §3.1 Order/OrderEvent, §4.2, §4.4 C2).

use chrono::Utc;
use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension};
use std::str::FromStr;

use crate::domain::{Order, OrderEvent, OrderStatus, TrafficStatus};
use crate::error::{PipelineError, PipelineResult};

use super::db::Db;

pub struct OrderStore {
    db: Db,
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let status: String = row.get("status")?;
    let traffic_status: String = row.get("traffic_status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let budget_limit: Option<String> = row.get("budget_limit")?;
    Ok(Order {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        service_id: row.get("service_id")?,
        link: row.get("link")?,
        quantity: row.get("quantity")?,
        charge: Decimal::from_str(&row.get::<_, String>("charge")?).unwrap_or_default(),
        start_count: row.get("start_count")?,
        remains: row.get("remains")?,
        status: OrderStatus::from_str(&status).unwrap_or(OrderStatus::Error),
        youtube_video_id: row.get("youtube_video_id")?,
        coefficient: Decimal::from_str(&row.get::<_, String>("coefficient")?).unwrap_or_default(),
        target_country: row.get("target_country")?,
        budget_limit: budget_limit.and_then(|s| Decimal::from_str(&s).ok()),
        cost_incurred: Decimal::from_str(&row.get::<_, String>("cost_incurred")?).unwrap_or_default(),
        views_delivered: row.get("views_delivered")?,
        traffic_status: TrafficStatus::from_str(&traffic_status).unwrap_or(TrafficStatus::None),
        is_refill: row.get::<_, i64>("is_refill")? != 0,
        refill_parent_id: row.get("refill_parent_id")?,
        version: row.get("version")?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

/// Fields needed to create an order; everything derivable (id, timestamps,
/// version) is assigned by the store.
pub struct NewOrder {
    pub user_id: i64,
    pub service_id: i64,
    pub link: String,
    pub quantity: u32,
    pub charge: Decimal,
    pub coefficient: Decimal,
    pub target_country: Option<String>,
    pub budget_limit: Option<Decimal>,
    pub is_refill: bool,
    pub refill_parent_id: Option<i64>,
}

impl OrderStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, order_id: i64) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        conn.query_row("SELECT * FROM orders WHERE id = ?1", params![order_id], row_to_order)
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("order {order_id}")))
    }

    /// §4.4 step 3: create the order row in PENDING with `remains = quantity`.
    pub async fn create(&self, new: NewOrder) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO orders
                (user_id, service_id, link, quantity, charge, remains, status,
                 coefficient, target_country, budget_limit, is_refill, refill_parent_id,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?4, 'PENDING', ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                new.user_id,
                new.service_id,
                new.link,
                new.quantity,
                new.charge.to_string(),
                new.coefficient.to_string(),
                new.target_country,
                new.budget_limit.map(|d| d.to_string()),
                new.is_refill as i64,
                new.refill_parent_id,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id).await
    }

    /// §4.2: move `order_id` from its current status to `next`, guarded by
    /// both the state-machine table and the optimistic-concurrency version.
    /// Appends an `OrderEvent` row in the same transaction.
    pub async fn transition(
        &self,
        order_id: i64,
        expected_version: i64,
        next: OrderStatus,
        event_payload: Option<&str>,
    ) -> PipelineResult<Order> {
        let mut conn = self.db.conn.lock().await;
        let tx = conn.transaction()?;

        let (status_str, version, held_from): (String, i64, Option<String>) = tx
            .query_row(
                "SELECT status, version, held_from_status FROM orders WHERE id = ?1",
                params![order_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("order {order_id}")))?;

        if version != expected_version {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} version mismatch: expected {expected_version}, found {version}"
            )));
        }

        let current = OrderStatus::from_str(&status_str)
            .ok_or_else(|| PipelineError::Fatal(format!("corrupt status {status_str}")))?;
        if !current.can_transition_to(next) {
            return Err(PipelineError::Validation(format!(
                "{current:?} -> {next:?} is not a permitted transition"
            )));
        }

        let next_version = version + 1;
        let now = Utc::now().to_rfc3339();

        if next == OrderStatus::Holding {
            tx.execute(
                "UPDATE orders SET status = ?1, held_from_status = ?2, version = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![next.as_str(), current.as_str(), next_version, now, order_id],
            )?;
        } else if current == OrderStatus::Holding {
            // Resuming out of HOLDING clears the saved source state.
            let _ = held_from;
            tx.execute(
                "UPDATE orders SET status = ?1, held_from_status = NULL, version = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![next.as_str(), next_version, now, order_id],
            )?;
        } else {
            tx.execute(
                "UPDATE orders SET status = ?1, version = ?2, updated_at = ?3 WHERE id = ?4",
                params![next.as_str(), next_version, now, order_id],
            )?;
        }

        tx.execute(
            "INSERT INTO order_events (order_id, event_type, old_status, new_status, payload, created_at)
             VALUES (?1, 'STATUS_CHANGE', ?2, ?3, ?4, ?5)",
            params![order_id, current.as_str(), next.as_str(), event_payload, now],
        )?;

        tx.commit()?;
        drop(conn);
        self.get(order_id).await
    }

    /// §4.6 reconciler completion tick: transitions status and sets traffic
    /// status in the same version-guarded UPDATE, so the two fields land on
    /// one version bump instead of racing a second call against the version
    /// the first call just advanced.
    pub async fn transition_with_traffic_status(
        &self,
        order_id: i64,
        expected_version: i64,
        next: OrderStatus,
        traffic_status: TrafficStatus,
        event_payload: Option<&str>,
    ) -> PipelineResult<Order> {
        let mut conn = self.db.conn.lock().await;
        let tx = conn.transaction()?;

        let (status_str, version): (String, i64) = tx
            .query_row(
                "SELECT status, version FROM orders WHERE id = ?1",
                params![order_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("order {order_id}")))?;

        if version != expected_version {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} version mismatch: expected {expected_version}, found {version}"
            )));
        }

        let current = OrderStatus::from_str(&status_str)
            .ok_or_else(|| PipelineError::Fatal(format!("corrupt status {status_str}")))?;
        if !current.can_transition_to(next) {
            return Err(PipelineError::Validation(format!(
                "{current:?} -> {next:?} is not a permitted transition"
            )));
        }

        let next_version = version + 1;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "UPDATE orders SET status = ?1, traffic_status = ?2, version = ?3, updated_at = ?4
             WHERE id = ?5",
            params![next.as_str(), traffic_status.as_str(), next_version, now, order_id],
        )?;

        tx.execute(
            "INSERT INTO order_events (order_id, event_type, old_status, new_status, payload, created_at)
             VALUES (?1, 'STATUS_CHANGE', ?2, ?3, ?4, ?5)",
            params![order_id, current.as_str(), next.as_str(), event_payload, now],
        )?;

        tx.commit()?;
        drop(conn);
        self.get(order_id).await
    }

    /// §4.8/§4.9: advance delivery counters without a status change, used by
    /// the reconciler and result-ingress workers as they pull tracker stats.
    pub async fn record_delivery(
        &self,
        order_id: i64,
        expected_version: i64,
        views_delivered_delta: u64,
        cost_incurred_delta: Decimal,
    ) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE orders
             SET views_delivered = views_delivered + ?1,
                 cost_incurred = cost_incurred + ?2,
                 remains = MAX(remains - ?1, 0),
                 version = version + 1,
                 updated_at = ?3
             WHERE id = ?4 AND version = ?5",
            params![
                views_delivered_delta as i64,
                cost_incurred_delta.to_string(),
                now,
                order_id,
                expected_version
            ],
        )?;
        if updated == 0 {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} updated concurrently"
            )));
        }
        drop(conn);
        self.get(order_id).await
    }

    /// §4.5: the coefficient is chosen by the video-processing worker
    /// (clip vs direct path) and persisted before the order leaves PENDING.
    pub async fn set_coefficient(
        &self,
        order_id: i64,
        expected_version: i64,
        coefficient: Decimal,
    ) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE orders SET coefficient = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4",
            params![coefficient.to_string(), now, order_id, expected_version],
        )?;
        if updated == 0 {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} updated concurrently"
            )));
        }
        drop(conn);
        self.get(order_id).await
    }

    pub async fn set_video_link(
        &self,
        order_id: i64,
        expected_version: i64,
        youtube_video_id: &str,
        start_count: u64,
    ) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE orders
             SET youtube_video_id = ?1, start_count = ?2, version = version + 1, updated_at = ?3
             WHERE id = ?4 AND version = ?5",
            params![youtube_video_id, start_count as i64, now, order_id, expected_version],
        )?;
        if updated == 0 {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} updated concurrently"
            )));
        }
        drop(conn);
        self.get(order_id).await
    }

    pub async fn set_traffic_status(
        &self,
        order_id: i64,
        expected_version: i64,
        traffic_status: TrafficStatus,
    ) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE orders SET traffic_status = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4",
            params![traffic_status.as_str(), now, order_id, expected_version],
        )?;
        if updated == 0 {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} updated concurrently"
            )));
        }
        drop(conn);
        self.get(order_id).await
    }

    /// §6.3 admin query pattern: recent orders for a user.
    pub async fn list_for_user(&self, user_id: i64, limit: u32) -> PipelineResult<Vec<Order>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM orders WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// §4.6 reconciler scan: orders whose campaigns are still being worked,
    /// oldest-touched first so a slow tick eventually cycles through all of
    /// them.
    pub async fn list_reconcilable(&self, limit: u32) -> PipelineResult<Vec<Order>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM orders
             WHERE status IN ('PROCESSING', 'ACTIVE', 'IN_PROGRESS')
             ORDER BY updated_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// §4.6 reconciler update: set the order's delivery counters to the
    /// freshly-recomputed absolute totals (rather than an increment), so
    /// running the same tick twice against unchanged tracker stats is a
    /// no-op — required for the idempotence law in spec.md §8.
    pub async fn set_delivery_totals(
        &self,
        order_id: i64,
        expected_version: i64,
        views_delivered: u64,
        cost_incurred: Decimal,
    ) -> PipelineResult<Order> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE orders
             SET views_delivered = ?1,
                 cost_incurred = ?2,
                 remains = MAX(CAST(quantity AS INTEGER) - ?1, 0),
                 version = version + 1,
                 updated_at = ?3
             WHERE id = ?4 AND version = ?5",
            params![
                views_delivered as i64,
                cost_incurred.to_string(),
                now,
                order_id,
                expected_version
            ],
        )?;
        if updated == 0 {
            return Err(PipelineError::Conflict(format!(
                "order {order_id} updated concurrently"
            )));
        }
        drop(conn);
        self.get(order_id).await
    }

    /// §4.7: all refill children of `parent_id`, oldest first.
    pub async fn refill_children(&self, parent_id: i64) -> PipelineResult<Vec<Order>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM orders WHERE refill_parent_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![parent_id], row_to_order)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn events(&self, order_id: i64) -> PipelineResult<Vec<OrderEvent>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM order_events WHERE order_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![order_id], |row| {
                let old_status: Option<String> = row.get("old_status")?;
                let new_status: Option<String> = row.get("new_status")?;
                let created_at: String = row.get("created_at")?;
                Ok(OrderEvent {
                    id: row.get("id")?,
                    order_id: row.get("order_id")?,
                    event_type: row.get("event_type")?,
                    old_status: old_status.and_then(|s| OrderStatus::from_str(&s)),
                    new_status: new_status.and_then(|s| OrderStatus::from_str(&s)),
                    payload: row.get("payload")?,
                    created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
