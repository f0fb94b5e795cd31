//! Service catalog and per-mode coefficient lookup (spec.md §3.1).

use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension};
use std::str::FromStr;

use crate::domain::{CoefficientMode, Service};
use crate::error::{PipelineError, PipelineResult};

use super::db::Db;

pub struct ServiceStore {
    db: Db,
}

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<Service> {
    let whitelist: String = row.get("url_host_whitelist")?;
    Ok(Service {
        id: row.get("id")?,
        name: row.get("name")?,
        category: row.get("category")?,
        min_order_qty: row.get("min_order_qty")?,
        max_order_qty: row.get("max_order_qty")?,
        price_per_thousand: Decimal::from_str(&row.get::<_, String>("price_per_thousand")?)
            .unwrap_or_default(),
        active: row.get::<_, i64>("active")? != 0,
        allow_clip_creation: row.get::<_, i64>("allow_clip_creation")? != 0,
        url_host_whitelist: serde_json::from_str(&whitelist).unwrap_or_default(),
    })
}

impl ServiceStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, service_id: i64) -> PipelineResult<Service> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT * FROM services WHERE id = ?1",
            params![service_id],
            row_to_service,
        )
        .optional()?
        .ok_or_else(|| PipelineError::NotFound(format!("service {service_id}")))
    }

    pub async fn coefficient(&self, service_id: i64, mode: CoefficientMode) -> PipelineResult<Decimal> {
        let conn = self.db.conn.lock().await;
        let mode_str = match mode {
            CoefficientMode::WithClip => "WITH_CLIP",
            CoefficientMode::WithoutClip => "WITHOUT_CLIP",
        };
        let value: String = conn
            .query_row(
                "SELECT coefficient FROM coefficients WHERE service_id = ?1 AND mode = ?2",
                params![service_id, mode_str],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                PipelineError::ConfigurationError(format!(
                    "no {mode_str} coefficient configured for service {service_id}"
                ))
            })?;
        Decimal::from_str(&value).map_err(|e| PipelineError::Fatal(format!("corrupt coefficient: {e}")))
    }
}
