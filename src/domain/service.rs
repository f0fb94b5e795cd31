//! Service catalog entry and per-mode view/click coefficients (spec.md §3.1).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub min_order_qty: u32,
    pub max_order_qty: u32,
    pub price_per_thousand: Decimal,
    pub active: bool,
    pub allow_clip_creation: bool,
    pub url_host_whitelist: Vec<String>,
}

impl Service {
    pub fn quantity_in_range(&self, quantity: u32) -> bool {
        quantity >= self.min_order_qty && quantity <= self.max_order_qty
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        self.url_host_whitelist
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

/// Per-service, per-mode click→view multiplier (spec.md §3.1 CoefficientTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoefficientMode {
    WithClip,
    WithoutClip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoefficientEntry {
    pub service_id: i64,
    pub mode: CoefficientMode,
    pub coefficient: Decimal,
}
