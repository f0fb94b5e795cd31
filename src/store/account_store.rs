//! YouTube account pool: selection of a free account and daily-quota
//! bookkeeping (spec.md §3.1, §4.5 C7).

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

use crate::domain::{AccountStatus, YouTubeAccount};
use crate::error::{PipelineError, PipelineResult};

use super::db::Db;

pub struct AccountStore {
    db: Db,
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<YouTubeAccount> {
    let status: String = row.get("status")?;
    let last_clip_date: Option<String> = row.get("last_clip_date")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;
    Ok(YouTubeAccount {
        id: row.get("id")?,
        credential_ref: row.get("credential_ref")?,
        status: AccountStatus::from_str(&status).unwrap_or(AccountStatus::Suspended),
        daily_clips_count: row.get("daily_clips_count")?,
        last_clip_date: last_clip_date.and_then(|s| s.parse().ok()),
        daily_limit: row.get("daily_limit")?,
        proxy_config: row.get("proxy_config")?,
        last_used_at: last_used_at.and_then(|s| s.parse().ok()),
    })
}

impl AccountStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// §4.5: pick by `(status=ACTIVE, dailyClipsCount ASC, lastUsedAt ASC)`,
    /// rolling the daily counter over if the last clip was on an earlier UTC
    /// day. Locks the row for the duration of the clip attempt by bumping
    /// `last_used_at` immediately so concurrent workers don't double-book
    /// the same account.
    pub async fn reserve_account(&self, today: NaiveDate) -> PipelineResult<Option<YouTubeAccount>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM youtube_accounts
             WHERE status = 'ACTIVE'
             ORDER BY daily_clips_count ASC, last_used_at ASC NULLS FIRST
             LIMIT 20",
        )?;
        let candidates: Vec<YouTubeAccount> = stmt
            .query_map(params![], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for candidate in candidates {
            if candidate.has_quota(today) {
                let reset = candidate.needs_daily_reset(today);
                let now = Utc::now().to_rfc3339();
                if reset {
                    conn.execute(
                        "UPDATE youtube_accounts
                         SET daily_clips_count = 1, last_clip_date = ?1, last_used_at = ?2
                         WHERE id = ?3",
                        params![today.to_string(), now, candidate.id],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE youtube_accounts
                         SET daily_clips_count = daily_clips_count + 1, last_clip_date = ?1, last_used_at = ?2
                         WHERE id = ?3",
                        params![today.to_string(), now, candidate.id],
                    )?;
                }
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    pub async fn mark_status(&self, account_id: i64, status: AccountStatus) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE youtube_accounts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), account_id],
        )?;
        Ok(())
    }

    pub async fn get(&self, account_id: i64) -> PipelineResult<YouTubeAccount> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT * FROM youtube_accounts WHERE id = ?1",
            params![account_id],
            row_to_account,
        )
        .optional()?
        .ok_or_else(|| PipelineError::NotFound(format!("youtube account {account_id}")))
    }
}
