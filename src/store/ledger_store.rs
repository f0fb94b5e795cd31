//! Balance ledger — optimistic-concurrency credit/debit plus the append-only
//! transaction log (spec.md §3.1 BalanceTransaction, §4.1 C1).
//!
//! Grounded on `vault/user_accounts.rs::UserAccountsDB` (the
//! `conn.lock().await` + `query_row` + `execute` shape) but reworked around
//! compare-and-swap on `version` instead of the teacher's last-write-wins
//! update, since §4.1 requires rejecting a debit against a stale read.

use chrono::Utc;
use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension};
use std::str::FromStr;

use crate::domain::{BalanceTransaction, BalanceTxKind, User};
use crate::error::{PipelineError, PipelineResult};

use super::db::Db;

pub struct LedgerStore {
    db: Db,
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get("role")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        email: row.get("email")?,
        role: crate::domain::Role::from_str(&role).unwrap_or(crate::domain::Role::User),
        balance: Decimal::from_str(&row.get::<_, String>("balance")?).unwrap_or_default(),
        total_spent: Decimal::from_str(&row.get::<_, String>("total_spent")?).unwrap_or_default(),
        api_key_digest: row.get("api_key_digest")?,
        failed_auth_count: row.get("failed_auth_count")?,
        account_locked: row.get::<_, i64>("account_locked")? != 0,
        active: row.get::<_, i64>("active")? != 0,
        version: row.get("version")?,
    })
}

impl LedgerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get_user(&self, user_id: i64) -> PipelineResult<User> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT * FROM users WHERE id = ?1",
            params![user_id],
            row_to_user,
        )
        .optional()?
        .ok_or_else(|| PipelineError::NotFound(format!("user {user_id}")))
    }

    /// §4.1: apply `amount` (positive credits, negative debits) to the
    /// user's balance under optimistic concurrency control. `expected_version`
    /// must match the row's current version or the call fails with
    /// `Conflict` so the caller can re-read and retry (§4.4 step 2, §4.7
    /// step 8's refund path, §4.10 deposits all route through here).
    pub async fn apply_transaction(
        &self,
        user_id: i64,
        expected_version: i64,
        amount: Decimal,
        kind: BalanceTxKind,
        order_id: Option<i64>,
        deposit_id: Option<i64>,
        reference_id: &str,
    ) -> PipelineResult<BalanceTransaction> {
        let mut conn = self.db.conn.lock().await;
        let tx = conn.transaction()?;

        let (balance_before, current_version): (String, i64) = tx
            .query_row(
                "SELECT balance, version FROM users WHERE id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| PipelineError::NotFound(format!("user {user_id}")))?;

        if current_version != expected_version {
            return Err(PipelineError::Conflict(format!(
                "user {user_id} version mismatch: expected {expected_version}, found {current_version}"
            )));
        }

        let balance_before = Decimal::from_str(&balance_before)
            .map_err(|e| PipelineError::Fatal(format!("corrupt balance: {e}")))?;
        let balance_after = balance_before + amount;

        if balance_after < Decimal::ZERO {
            return Err(PipelineError::InsufficientBalance {
                needed: -amount,
                available: balance_before,
            });
        }

        let next_version = current_version + 1;
        let spent_delta = if kind.is_debit() { -amount } else { Decimal::ZERO };

        let updated = tx.execute(
            "UPDATE users
             SET balance = ?1, total_spent = total_spent + ?2, version = ?3
             WHERE id = ?4 AND version = ?5",
            params![
                balance_after.to_string(),
                spent_delta.to_string(),
                next_version,
                user_id,
                expected_version
            ],
        )?;
        if updated == 0 {
            return Err(PipelineError::Conflict(format!(
                "user {user_id} updated concurrently"
            )));
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO balance_transactions
                (user_id, order_id, deposit_id, amount, balance_before, balance_after,
                 kind, reference_id, created_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user_id,
                order_id,
                deposit_id,
                amount.to_string(),
                balance_before.to_string(),
                balance_after.to_string(),
                kind.as_str(),
                reference_id,
                now.to_rfc3339(),
                next_version,
            ],
        )?;
        let tx_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(BalanceTransaction {
            id: tx_id,
            user_id,
            order_id,
            deposit_id,
            amount,
            balance_before,
            balance_after,
            kind,
            reference_id: reference_id.to_string(),
            created_at: now,
            version: next_version,
        })
    }

    /// §4.1: re-read `(balance, version)` and retry `apply_transaction` on a
    /// version conflict, bounded exponential backoff 100/200/400ms over at
    /// most 3 attempts. Exhaustion surfaces as `Conflict`, which callers
    /// treat as retryable-after (§7) rather than a hard failure.
    async fn apply_with_retry(
        &self,
        user_id: i64,
        amount: Decimal,
        kind: BalanceTxKind,
        order_id: Option<i64>,
        deposit_id: Option<i64>,
        reference_id: &str,
    ) -> PipelineResult<BalanceTransaction> {
        const DELAYS_MS: [u64; 3] = [100, 200, 400];
        let mut last_err = None;
        for delay_ms in DELAYS_MS {
            let user = self.get_user(user_id).await?;
            match self
                .apply_transaction(
                    user_id,
                    user.version,
                    amount,
                    kind,
                    order_id,
                    deposit_id,
                    reference_id,
                )
                .await
            {
                Ok(tx) => return Ok(tx),
                Err(PipelineError::Conflict(msg)) => {
                    last_err = Some(PipelineError::Conflict(msg));
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            PipelineError::Conflict(format!("user {user_id} updated concurrently"))
        }))
    }

    pub async fn debit_for_order(
        &self,
        user_id: i64,
        order_id: i64,
        amount: Decimal,
    ) -> PipelineResult<BalanceTransaction> {
        self.apply_with_retry(
            user_id,
            -amount,
            BalanceTxKind::OrderPayment,
            Some(order_id),
            None,
            &format!("order:{order_id}"),
        )
        .await
    }

    /// §4.4 intake: debit before the order row exists. `reference_id` is a
    /// caller-generated idempotency key (not yet an order id); the caller
    /// links it via `link_transaction_to_order` once the order is inserted.
    pub async fn debit_pending_order(
        &self,
        user_id: i64,
        reference_id: &str,
        amount: Decimal,
    ) -> PipelineResult<BalanceTransaction> {
        self.apply_with_retry(
            user_id,
            -amount,
            BalanceTxKind::OrderPayment,
            None,
            None,
            reference_id,
        )
        .await
    }

    pub async fn refund_for_order(
        &self,
        user_id: i64,
        order_id: i64,
        amount: Decimal,
    ) -> PipelineResult<BalanceTransaction> {
        self.apply_with_retry(
            user_id,
            amount,
            BalanceTxKind::Refund,
            Some(order_id),
            None,
            &format!("order-refund:{order_id}"),
        )
        .await
    }

    /// §4.1 `credit`: generic balance top-up, e.g. the crypto-payment
    /// webhook (out of scope per §1, treated as a caller that has already
    /// verified the deposit) or an operator `ADJUSTMENT`.
    pub async fn credit(
        &self,
        user_id: i64,
        amount: Decimal,
        kind: BalanceTxKind,
        deposit_id: Option<i64>,
        reference_id: &str,
    ) -> PipelineResult<BalanceTransaction> {
        self.apply_with_retry(user_id, amount, kind, None, deposit_id, reference_id)
            .await
    }

    /// §4.7 step 11 doesn't itself move money (refill children are zero-
    /// charge), but an operator may later credit a parent for a delivery
    /// shortfall the refill couldn't fully cover; this is that entry point.
    pub async fn refill_credit(
        &self,
        user_id: i64,
        order_id: i64,
        amount: Decimal,
    ) -> PipelineResult<BalanceTransaction> {
        self.apply_with_retry(
            user_id,
            amount,
            BalanceTxKind::RefillCredit,
            Some(order_id),
            None,
            &format!("refill-credit:{order_id}"),
        )
        .await
    }

    /// §4.4: the debit happens before the order row exists (so a rejected
    /// debit never leaves an orphan Order per scenario S2), so the
    /// transaction is first recorded against `order_id = NULL` and patched
    /// once the order is created.
    pub async fn link_transaction_to_order(&self, tx_id: i64, order_id: i64) -> PipelineResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE balance_transactions SET order_id = ?1 WHERE id = ?2",
            params![order_id, tx_id],
        )?;
        Ok(())
    }

    pub async fn history(&self, user_id: i64, limit: u32) -> PipelineResult<Vec<BalanceTransaction>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM balance_transactions WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                let kind: String = row.get("kind")?;
                let created_at: String = row.get("created_at")?;
                Ok(BalanceTransaction {
                    id: row.get("id")?,
                    user_id: row.get("user_id")?,
                    order_id: row.get("order_id")?,
                    deposit_id: row.get("deposit_id")?,
                    amount: Decimal::from_str(&row.get::<_, String>("amount")?).unwrap_or_default(),
                    balance_before: Decimal::from_str(&row.get::<_, String>("balance_before")?)
                        .unwrap_or_default(),
                    balance_after: Decimal::from_str(&row.get::<_, String>("balance_after")?)
                        .unwrap_or_default(),
                    kind: BalanceTxKind::from_str(&kind).unwrap_or(BalanceTxKind::Adjustment),
                    reference_id: row.get("reference_id")?,
                    created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                    version: row.get("version")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
