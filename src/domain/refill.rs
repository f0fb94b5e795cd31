//! Parent→child refill audit row (spec.md §3.1, §4.7).

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct OrderRefill {
    pub original_order_id: i64,
    pub refill_order_id: i64,
    pub refill_number: u32,
    pub original_quantity: u32,
    pub delivered_quantity: u64,
    pub refill_quantity: u32,
    pub start_count_at_refill: u64,
    pub created_at: DateTime<Utc>,
}

/// §4.7 step 5 / invariant 4: at most 5 non-terminal-or-completed refills.
pub const MAX_REFILLS: usize = 5;

/// §4.7 step 4: a second `createRefill` call within this window is a conflict.
pub const REFILL_IDEMPOTENCY_WINDOW_SECS: i64 = 60;

/// §4.7 step 9 sanity cap: reject if `refillQty > 1.5 * parent.quantity`.
pub const REFILL_SANITY_MULTIPLIER: f64 = 1.5;
