//! Fixed external-tracker campaign pool and per-order bindings (spec.md
//! §3.1, §4.6 C8/C9).

use chrono::Utc;
use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension};
use std::str::FromStr;

use crate::domain::{BindingStatus, CampaignBinding, FixedCampaign};
use crate::error::{PipelineError, PipelineResult};

use super::db::Db;

pub struct CampaignStore {
    db: Db,
}

fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<FixedCampaign> {
    Ok(FixedCampaign {
        id: row.get("id")?,
        external_campaign_id: row.get("external_campaign_id")?,
        name: row.get("name")?,
        geo_targeting: row.get("geo_targeting")?,
        priority: row.get("priority")?,
        weight: row.get("weight")?,
        active: row.get::<_, i64>("active")? != 0,
        description: row.get("description")?,
    })
}

fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<CampaignBinding> {
    let status: String = row.get("status")?;
    let budget_limit: Option<String> = row.get("budget_limit")?;
    let last_stats_at: Option<String> = row.get("last_stats_at")?;
    Ok(CampaignBinding {
        id: row.get("id")?,
        order_id: row.get("order_id")?,
        external_campaign_id: row.get("external_campaign_id")?,
        offer_id: row.get("offer_id")?,
        clicks_required: row.get("clicks_required")?,
        clicks_delivered: row.get("clicks_delivered")?,
        conversions: row.get("conversions")?,
        cost: Decimal::from_str(&row.get::<_, String>("cost")?).unwrap_or_default(),
        revenue: Decimal::from_str(&row.get::<_, String>("revenue")?).unwrap_or_default(),
        budget_limit: budget_limit.and_then(|s| Decimal::from_str(&s).ok()),
        status: BindingStatus::from_str(&status).unwrap_or(BindingStatus::Finished),
        pause_reason: row.get("pause_reason")?,
        last_stats_at: last_stats_at.and_then(|s| s.parse().ok()),
    })
}

impl CampaignStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// §4.6 invariant: the assigner only distributes across exactly
    /// `REQUIRED_ACTIVE_CAMPAIGNS` active campaigns; callers check the count
    /// against that constant before calling `distribute`.
    pub async fn active_campaigns(&self) -> PipelineResult<Vec<FixedCampaign>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM fixed_campaigns WHERE active = 1 ORDER BY priority ASC",
        )?;
        let rows = stmt
            .query_map(params![], row_to_campaign)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn create_binding(
        &self,
        order_id: i64,
        external_campaign_id: &str,
        offer_id: &str,
        clicks_required: u64,
        budget_limit: Option<Decimal>,
    ) -> PipelineResult<CampaignBinding> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO campaign_bindings
                (order_id, external_campaign_id, offer_id, clicks_required, budget_limit, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVE')",
            params![
                order_id,
                external_campaign_id,
                offer_id,
                clicks_required as i64,
                budget_limit.map(|d| d.to_string()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_binding(id).await
    }

    pub async fn get_binding(&self, id: i64) -> PipelineResult<CampaignBinding> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT * FROM campaign_bindings WHERE id = ?1",
            params![id],
            row_to_binding,
        )
        .optional()?
        .ok_or_else(|| PipelineError::NotFound(format!("campaign binding {id}")))
    }

    pub async fn bindings_for_order(&self, order_id: i64) -> PipelineResult<Vec<CampaignBinding>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM campaign_bindings WHERE order_id = ?1")?;
        let rows = stmt
            .query_map(params![order_id], row_to_binding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// §4.6/§4.8: absorb an incremental stats pull from the tracker.
    pub async fn record_stats(
        &self,
        binding_id: i64,
        clicks_delta: u64,
        conversions_delta: u64,
        cost_delta: Decimal,
        revenue_delta: Decimal,
    ) -> PipelineResult<CampaignBinding> {
        let conn = self.db.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE campaign_bindings
             SET clicks_delivered = clicks_delivered + ?1,
                 conversions = conversions + ?2,
                 cost = cost + ?3,
                 revenue = revenue + ?4,
                 last_stats_at = ?5
             WHERE id = ?6",
            params![
                clicks_delta as i64,
                conversions_delta as i64,
                cost_delta.to_string(),
                revenue_delta.to_string(),
                now,
                binding_id,
            ],
        )?;
        drop(conn);
        self.get_binding(binding_id).await
    }

    pub async fn set_binding_status(
        &self,
        binding_id: i64,
        status: BindingStatus,
        pause_reason: Option<&str>,
    ) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE campaign_bindings SET status = ?1, pause_reason = ?2 WHERE id = ?3",
            params![status.as_str(), pause_reason, binding_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_campaign(db: &Db, priority: i64, active: bool) -> i64 {
        let conn = db.conn.lock().await;
        conn.execute(
            "INSERT INTO fixed_campaigns (external_campaign_id, name, priority, weight, active)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![format!("ext-{priority}"), format!("camp-{priority}"), priority, active as i64],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[tokio::test]
    async fn active_campaigns_excludes_inactive_and_orders_by_priority() {
        let db = Db::open_in_memory().unwrap();
        seed_campaign(&db, 2, true).await;
        seed_campaign(&db, 1, true).await;
        seed_campaign(&db, 3, false).await;
        let store = CampaignStore::new(db);

        let active = store.active_campaigns().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].priority, 1);
        assert_eq!(active[1].priority, 2);
    }

    #[tokio::test]
    async fn record_stats_accumulates_deltas_and_pause_updates_status() {
        let db = Db::open_in_memory().unwrap();
        let store = CampaignStore::new(db);
        let binding = store
            .create_binding(1, "ext-1", "offer-1", 6000, None)
            .await
            .unwrap();

        let updated = store
            .record_stats(binding.id, 2000, 10, Decimal::new(500, 2), Decimal::new(100, 2))
            .await
            .unwrap();
        assert_eq!(updated.clicks_delivered, 2000);
        assert_eq!(updated.conversions, 10);

        let updated = store
            .record_stats(binding.id, 1000, 5, Decimal::new(100, 2), Decimal::ZERO)
            .await
            .unwrap();
        assert_eq!(updated.clicks_delivered, 3000);

        store
            .set_binding_status(binding.id, BindingStatus::Paused, Some("Order budget limit reached"))
            .await
            .unwrap();
        let paused = store.get_binding(binding.id).await.unwrap();
        assert_eq!(paused.status, BindingStatus::Paused);
        assert_eq!(paused.pause_reason.as_deref(), Some("Order budget limit reached"));

        let bindings = store.bindings_for_order(1).await.unwrap();
        assert!(bindings.iter().all(|b| b.status != BindingStatus::Active));
    }
}
