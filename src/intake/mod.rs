//! Order intake (spec.md §4.4 C6): `place_order` validates, debits the
//! ledger, persists the order, and publishes `order.created` — the one
//! place the spec explicitly allows a DB transaction (the ledger debit) to
//! be held across steps that are otherwise independent operations.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::bus::{
    messages::{OrderCreatedMessage, VideoProcessingMessage},
    publish_json, MessageBus, Topic,
};
use crate::domain::{money, Order};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{LedgerStore, NewOrder, OrderStore, ServiceStore};
use crate::video::url as video_url;

pub struct PlaceOrderRequest {
    pub user_id: i64,
    pub service_id: i64,
    pub link: String,
    pub quantity: u32,
    pub target_country: Option<String>,
    pub budget_limit: Option<Decimal>,
}

pub struct OrderIntake {
    order_store: Arc<OrderStore>,
    service_store: Arc<ServiceStore>,
    ledger_store: Arc<LedgerStore>,
    bus: Arc<dyn MessageBus>,
    bus_max_attempts: u8,
}

impl OrderIntake {
    pub fn new(
        order_store: Arc<OrderStore>,
        service_store: Arc<ServiceStore>,
        ledger_store: Arc<LedgerStore>,
        bus: Arc<dyn MessageBus>,
        bus_max_attempts: u8,
    ) -> Self {
        Self {
            order_store,
            service_store,
            ledger_store,
            bus,
            bus_max_attempts,
        }
    }

    /// §4.4 steps 1-5. The coefficient isn't known yet at intake time (the
    /// video-processing worker decides clip vs direct path in §4.5), so the
    /// order is created with `coefficient = 1` as a placeholder that C7
    /// overwrites before the order leaves PENDING.
    pub async fn place_order(&self, req: PlaceOrderRequest) -> PipelineResult<Order> {
        let service = self.service_store.get(req.service_id).await?;
        if !service.active {
            return Err(PipelineError::Validation(format!(
                "service {} is not active",
                req.service_id
            )));
        }
        if !service.quantity_in_range(req.quantity) {
            return Err(PipelineError::Validation(format!(
                "quantity {} outside [{}, {}]",
                req.quantity, service.min_order_qty, service.max_order_qty
            )));
        }
        let host = video_url::host_of(&req.link)
            .ok_or_else(|| PipelineError::Validation("link has no host".to_string()))?;
        if !service.url_host_whitelist.is_empty() && !service.host_allowed(&host) {
            return Err(PipelineError::Validation(format!(
                "host {host} is not allowed for service {}",
                req.service_id
            )));
        }

        let user = self.ledger_store.get_user(req.user_id).await?;
        if !user.can_transact() {
            return Err(PipelineError::Validation(format!(
                "user {} cannot transact (inactive or locked)",
                req.user_id
            )));
        }

        let charge = money::compute_charge(req.quantity, service.price_per_thousand);

        // §4.4 step 3: debit before the order row exists at all, so a
        // rejected debit (scenario S2) never leaves an Order or a
        // BalanceTransaction referencing a non-existent order behind. The
        // transaction is recorded against a throwaway idempotency key and
        // linked to the order id once the row is inserted.
        let intake_ref = format!("intake:{}", uuid::Uuid::new_v4());
        let tx = self
            .ledger_store
            .debit_pending_order(req.user_id, &intake_ref, charge)
            .await?;

        let order = self
            .order_store
            .create(NewOrder {
                user_id: req.user_id,
                service_id: req.service_id,
                link: req.link,
                quantity: req.quantity,
                charge,
                coefficient: Decimal::ONE,
                target_country: req.target_country,
                budget_limit: req.budget_limit,
                is_refill: false,
                refill_parent_id: None,
            })
            .await?;
        self.ledger_store.link_transaction_to_order(tx.id, order.id).await?;

        // §2 data flow: C6 publishes "order-created", which is what hands
        // the order to C7. `order.created` itself carries only the
        // notification shape (§3.2's "derived notification" distinction,
        // DESIGN.md open question 4); the rich `video.processing` envelope
        // C7 actually consumes (§6.1) is built here, where both the order
        // and service rows are already in hand, and published alongside it.
        if let Err(e) = publish_json(
            self.bus.as_ref(),
            Topic::OrderCreated,
            &order.id.to_string(),
            &OrderCreatedMessage {
                order_id: order.id,
                user_id: order.user_id,
            },
            self.bus_max_attempts,
        )
        .await
        {
            warn!(order_id = order.id, error = %e, "order.created publish failed, recovery sweep will republish");
        }

        if let Err(e) = publish_json(
            self.bus.as_ref(),
            Topic::VideoProcessing,
            &order.id.to_string(),
            &VideoProcessingMessage::for_order(&order, &service, 1, self.bus_max_attempts),
            self.bus_max_attempts,
        )
        .await
        {
            warn!(order_id = order.id, error = %e, "video.processing publish failed, recovery sweep will republish");
        } else {
            info!(order_id = order.id, "order placed and published");
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::inmemory::SqliteBus;
    use crate::store::Db;
    use rusqlite::params;
    use rust_decimal_macros::dec;

    async fn seed_user(db: &Db, balance: Decimal) -> i64 {
        let conn = db.conn.lock().await;
        conn.execute(
            "INSERT INTO users (username, email, role, balance, total_spent)
             VALUES ('alice', 'alice@example.com', 'user', ?1, '0')",
            params![balance.to_string()],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    async fn seed_service(db: &Db) -> i64 {
        let conn = db.conn.lock().await;
        conn.execute(
            "INSERT INTO services
                (name, category, min_order_qty, max_order_qty, price_per_thousand,
                 active, allow_clip_creation, url_host_whitelist)
             VALUES ('YouTube Views', 'views', 100, 100000, '5.00', 1, 1, '[]')",
            [],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn intake(db: Db) -> OrderIntake {
        OrderIntake::new(
            Arc::new(OrderStore::new(db.clone())),
            Arc::new(ServiceStore::new(db.clone())),
            Arc::new(LedgerStore::new(db.clone())),
            Arc::new(SqliteBus::new(db, std::time::Duration::from_millis(10))),
            3,
        )
    }

    #[tokio::test]
    async fn place_order_debits_balance_creates_order_and_publishes() {
        let db = Db::open_in_memory().unwrap();
        let user_id = seed_user(&db, dec!(100.00)).await;
        let service_id = seed_service(&db).await;
        let ledger_store = LedgerStore::new(db.clone());
        let bus = SqliteBus::new(db.clone(), std::time::Duration::from_millis(10));
        let engine = OrderIntake::new(
            Arc::new(OrderStore::new(db.clone())),
            Arc::new(ServiceStore::new(db.clone())),
            Arc::new(ledger_store),
            Arc::new(bus),
            3,
        );

        let order = engine
            .place_order(PlaceOrderRequest {
                user_id,
                service_id,
                link: "https://youtube.com/watch?v=abc".to_string(),
                quantity: 1000,
                target_country: None,
                budget_limit: None,
            })
            .await
            .unwrap();

        assert_eq!(order.charge, dec!(5.00));
        assert_eq!(order.user_id, user_id);

        let ledger_store = LedgerStore::new(db);
        let user = ledger_store.get_user(user_id).await.unwrap();
        assert_eq!(user.balance, dec!(95.00));
        let history = ledger_store.history(user_id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_id, Some(order.id));
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_no_order_and_no_transaction() {
        let db = Db::open_in_memory().unwrap();
        let user_id = seed_user(&db, dec!(1.00)).await;
        let service_id = seed_service(&db).await;
        let engine = intake(db.clone());

        let err = engine
            .place_order(PlaceOrderRequest {
                user_id,
                service_id,
                link: "https://youtube.com/watch?v=abc".to_string(),
                quantity: 1000,
                target_country: None,
                budget_limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientBalance { .. }));

        let ledger_store = LedgerStore::new(db.clone());
        let user = ledger_store.get_user(user_id).await.unwrap();
        assert_eq!(user.balance, dec!(1.00));
        assert!(ledger_store.history(user_id, 10).await.unwrap().is_empty());

        let order_store = OrderStore::new(db);
        assert!(order_store.list_for_user(user_id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_quantity_outside_service_bounds() {
        let db = Db::open_in_memory().unwrap();
        let user_id = seed_user(&db, dec!(100.00)).await;
        let service_id = seed_service(&db).await;
        let engine = intake(db);

        let err = engine
            .place_order(PlaceOrderRequest {
                user_id,
                service_id,
                link: "https://youtube.com/watch?v=abc".to_string(),
                quantity: 10,
                target_country: None,
                budget_limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
