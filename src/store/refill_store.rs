//! Refill audit trail and idempotency checks (spec.md §3.1, §4.7 C10).

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::domain::OrderRefill;
use crate::error::PipelineResult;

use super::db::Db;

pub struct RefillStore {
    db: Db,
}

impl RefillStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn count_for_parent(&self, original_order_id: i64) -> PipelineResult<usize> {
        let conn = self.db.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_refills WHERE original_order_id = ?1",
            params![original_order_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// §4.7 step 4: a prior refill request for the same parent within the
    /// idempotency window is a conflict, not a new refill.
    pub async fn most_recent_within(
        &self,
        original_order_id: i64,
        window: std::time::Duration,
    ) -> PipelineResult<Option<OrderRefill>> {
        let conn = self.db.conn.lock().await;
        let cutoff = Utc::now() - Duration::from_std(window).unwrap_or(Duration::seconds(60));
        let row: Option<(i64, i64, u32, u32, u64, u32, u64, String)> = conn
            .query_row(
                "SELECT original_order_id, refill_order_id, refill_number, original_quantity,
                        delivered_quantity, refill_quantity, start_count_at_refill, created_at
                 FROM order_refills
                 WHERE original_order_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![original_order_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                    ))
                },
            )
            .ok();

        Ok(row.and_then(|(orig, refill_id, num, orig_qty, delivered, refill_qty, start_count, created_at)| {
            let created_at: DateTime<Utc> = created_at.parse().ok()?;
            if created_at < cutoff {
                return None;
            }
            Some(OrderRefill {
                original_order_id: orig,
                refill_order_id: refill_id,
                refill_number: num,
                original_quantity: orig_qty,
                delivered_quantity: delivered,
                refill_quantity: refill_qty,
                start_count_at_refill: start_count,
                created_at,
            })
        }))
    }

    pub async fn record(&self, refill: &OrderRefill) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO order_refills
                (original_order_id, refill_order_id, refill_number, original_quantity,
                 delivered_quantity, refill_quantity, start_count_at_refill, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                refill.original_order_id,
                refill.refill_order_id,
                refill.refill_number,
                refill.original_quantity,
                refill.delivered_quantity as i64,
                refill.refill_quantity,
                refill.start_count_at_refill as i64,
                refill.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::Db;

    fn sample_refill(original_order_id: i64, refill_number: u32) -> OrderRefill {
        OrderRefill {
            original_order_id,
            refill_order_id: original_order_id * 100 + refill_number as i64,
            refill_number,
            original_quantity: 2000,
            delivered_quantity: 1500,
            refill_quantity: 500,
            start_count_at_refill: 1000,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn count_for_parent_reflects_recorded_refills() {
        let db = Db::open_in_memory().unwrap();
        let store = RefillStore::new(db);
        assert_eq!(store.count_for_parent(1).await.unwrap(), 0);

        store.record(&sample_refill(1, 1)).await.unwrap();
        store.record(&sample_refill(1, 2)).await.unwrap();
        store.record(&sample_refill(2, 1)).await.unwrap();

        assert_eq!(store.count_for_parent(1).await.unwrap(), 2);
        assert_eq!(store.count_for_parent(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn most_recent_within_window_finds_just_recorded_refill() {
        let db = Db::open_in_memory().unwrap();
        let store = RefillStore::new(db);
        store.record(&sample_refill(1, 1)).await.unwrap();

        let found = store
            .most_recent_within(1, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().refill_number, 1);
    }

    #[tokio::test]
    async fn most_recent_within_window_is_none_outside_the_window() {
        let db = Db::open_in_memory().unwrap();
        let store = RefillStore::new(db);
        let mut refill = sample_refill(1, 1);
        refill.created_at = Utc::now() - Duration::seconds(120);
        store.record(&refill).await.unwrap();

        let found = store
            .most_recent_within(1, std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
