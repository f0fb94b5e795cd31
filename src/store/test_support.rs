//! Seeding helpers for integration tests under `tests/`.
//!
//! The pipeline itself never creates `users`, `services`, `youtube_accounts`,
//! or `fixed_campaigns` rows — those catalogs are provisioned by whatever
//! admin system sits outside this crate's scope (DESIGN.md open question 8).
//! `Db::conn` stays `pub(crate)` for everything else; this module is the one
//! sanctioned door into it from outside the crate, so `tests/*.rs` can set up
//! fixtures without duplicating schema knowledge or poking at internals.

use rusqlite::params;
use rust_decimal::Decimal;

use super::Db;

pub async fn seed_user(db: &Db, username: &str, balance: Decimal) -> i64 {
    let conn = db.conn.lock().await;
    conn.execute(
        "INSERT INTO users (username, email, role, balance, total_spent)
         VALUES (?1, ?2, 'user', ?3, '0')",
        params![username, format!("{username}@example.com"), balance.to_string()],
    )
    .expect("seed_user insert");
    conn.last_insert_rowid()
}

pub async fn seed_service(db: &Db, price_per_thousand: Decimal, allow_clip_creation: bool) -> i64 {
    let conn = db.conn.lock().await;
    conn.execute(
        "INSERT INTO services
            (name, category, min_order_qty, max_order_qty, price_per_thousand,
             active, allow_clip_creation, url_host_whitelist)
         VALUES ('YouTube Views', 'views', 100, 100000, ?1, 1, ?2, '[]')",
        params![price_per_thousand.to_string(), allow_clip_creation as i64],
    )
    .expect("seed_service insert");
    let service_id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO coefficients (service_id, mode, coefficient) VALUES (?1, 'WITH_CLIP', '3.0')",
        params![service_id],
    )
    .expect("seed_service with-clip coefficient");
    conn.execute(
        "INSERT INTO coefficients (service_id, mode, coefficient) VALUES (?1, 'WITHOUT_CLIP', '4.0')",
        params![service_id],
    )
    .expect("seed_service without-clip coefficient");
    service_id
}

pub async fn seed_account(db: &Db, daily_limit: i64) -> i64 {
    let conn = db.conn.lock().await;
    conn.execute(
        "INSERT INTO youtube_accounts (credential_ref, status, daily_clips_count, daily_limit)
         VALUES ('cred-1', 'ACTIVE', 0, ?1)",
        params![daily_limit],
    )
    .expect("seed_account insert");
    conn.last_insert_rowid()
}

pub async fn seed_campaign(db: &Db, external_campaign_id: &str, priority: i64) -> i64 {
    let conn = db.conn.lock().await;
    conn.execute(
        "INSERT INTO fixed_campaigns (external_campaign_id, name, priority, weight, active)
         VALUES (?1, ?2, ?3, 1, 1)",
        params![external_campaign_id, format!("camp-{external_campaign_id}"), priority],
    )
    .expect("seed_campaign insert");
    conn.last_insert_rowid()
}

/// Three equal-weight, equal-priority active campaigns: the §4.6 step 1
/// invariant the campaign assigner is built around.
pub async fn seed_three_campaigns(db: &Db) {
    seed_campaign(db, "ext-1", 1).await;
    seed_campaign(db, "ext-2", 2).await;
    seed_campaign(db, "ext-3", 3).await;
}
