//! SQLite connection + schema bootstrap.
//!
//! Grounded on `signals/db_storage.rs::SCHEMA_SQL` (WAL pragmas, covering
//! indexes) and `vault/user_accounts.rs::UserAccountsDB::new` (open +
//! `CREATE TABLE IF NOT EXISTS` + index setup, wrapped for shared async
//! access).

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

/// §6.3: Order range-partitioned by createdAt (monthly); simulated here via
/// a plain index on `created_at` since SQLite has no native partitioning —
/// the index still serves the admin-scan and per-user query patterns §6.3
/// names.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    email TEXT UNIQUE NOT NULL,
    role TEXT NOT NULL,
    balance TEXT NOT NULL DEFAULT '0',
    total_spent TEXT NOT NULL DEFAULT '0',
    api_key_digest TEXT,
    failed_auth_count INTEGER NOT NULL DEFAULT 0,
    account_locked INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_api_key_digest
    ON users(api_key_digest) WHERE api_key_digest IS NOT NULL;

CREATE TABLE IF NOT EXISTS services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    min_order_qty INTEGER NOT NULL,
    max_order_qty INTEGER NOT NULL,
    price_per_thousand TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    allow_clip_creation INTEGER NOT NULL DEFAULT 1,
    url_host_whitelist TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS coefficients (
    service_id INTEGER NOT NULL,
    mode TEXT NOT NULL,
    coefficient TEXT NOT NULL,
    PRIMARY KEY (service_id, mode)
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    service_id INTEGER NOT NULL,
    link TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    charge TEXT NOT NULL,
    start_count INTEGER,
    remains INTEGER NOT NULL,
    status TEXT NOT NULL,
    youtube_video_id TEXT,
    coefficient TEXT NOT NULL,
    target_country TEXT,
    budget_limit TEXT,
    cost_incurred TEXT NOT NULL DEFAULT '0',
    views_delivered INTEGER NOT NULL DEFAULT 0,
    traffic_status TEXT NOT NULL DEFAULT 'NONE',
    is_refill INTEGER NOT NULL DEFAULT 0,
    refill_parent_id INTEGER,
    held_from_status TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_user_status_created
    ON orders(user_id, status, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_status_created
    ON orders(status, created_at);
CREATE INDEX IF NOT EXISTS idx_orders_refill_parent
    ON orders(refill_parent_id);

CREATE TABLE IF NOT EXISTS order_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    old_status TEXT,
    new_status TEXT,
    payload TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_events_order
    ON order_events(order_id, created_at);

CREATE TABLE IF NOT EXISTS balance_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    order_id INTEGER,
    deposit_id INTEGER,
    amount TEXT NOT NULL,
    balance_before TEXT NOT NULL,
    balance_after TEXT NOT NULL,
    kind TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    version INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_balance_tx_user_created
    ON balance_transactions(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS video_processing (
    order_id INTEGER PRIMARY KEY,
    original_url TEXT NOT NULL,
    video_type TEXT NOT NULL,
    clip_created INTEGER NOT NULL DEFAULT 0,
    clip_url TEXT,
    youtube_account_id INTEGER,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS youtube_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    credential_ref TEXT NOT NULL,
    status TEXT NOT NULL,
    daily_clips_count INTEGER NOT NULL DEFAULT 0,
    last_clip_date TEXT,
    daily_limit INTEGER NOT NULL,
    proxy_config TEXT,
    last_used_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_youtube_accounts_selection
    ON youtube_accounts(status, daily_clips_count, last_used_at);

CREATE TABLE IF NOT EXISTS fixed_campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_campaign_id TEXT NOT NULL,
    name TEXT NOT NULL,
    geo_targeting TEXT,
    priority INTEGER NOT NULL,
    weight INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    description TEXT
);

CREATE TABLE IF NOT EXISTS campaign_bindings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL,
    external_campaign_id TEXT NOT NULL,
    offer_id TEXT NOT NULL,
    clicks_required INTEGER NOT NULL,
    clicks_delivered INTEGER NOT NULL DEFAULT 0,
    conversions INTEGER NOT NULL DEFAULT 0,
    cost TEXT NOT NULL DEFAULT '0',
    revenue TEXT NOT NULL DEFAULT '0',
    budget_limit TEXT,
    status TEXT NOT NULL,
    pause_reason TEXT,
    last_stats_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_campaign_bindings_active
    ON campaign_bindings(status, clicks_delivered, clicks_required)
    WHERE status = 'ACTIVE';
CREATE INDEX IF NOT EXISTS idx_campaign_bindings_order
    ON campaign_bindings(order_id);

CREATE TABLE IF NOT EXISTS order_refills (
    original_order_id INTEGER NOT NULL,
    refill_order_id INTEGER NOT NULL,
    refill_number INTEGER NOT NULL,
    original_quantity INTEGER NOT NULL,
    delivered_quantity INTEGER NOT NULL,
    refill_quantity INTEGER NOT NULL,
    start_count_at_refill INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (original_order_id, refill_number)
);

CREATE TABLE IF NOT EXISTS bus_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempt_number INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER NOT NULL,
    schedule_at TEXT,
    acked INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bus_messages_pending
    ON bus_messages(topic, acked, schedule_at);

CREATE TABLE IF NOT EXISTS bus_dlq (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    error_message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reconciliation_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ran_at TEXT NOT NULL,
    orders_scanned INTEGER NOT NULL,
    bindings_updated INTEGER NOT NULL,
    errors INTEGER NOT NULL
);
"#;

#[derive(Clone)]
pub struct Db {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening database {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}
