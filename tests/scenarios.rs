//! End-to-end scenario tests for the order-fulfillment pipeline (spec.md
//! §8 S1-S5): drives `OrderIntake`, the bus-driven workers, and the
//! reconciler against an in-memory database and stub tracker/video
//! collaborators, one hop at a time, the way a deployed instance would.

use std::sync::Arc;
use std::time::Duration;

use panel_fulfillment::bus::inmemory::SqliteBus;
use panel_fulfillment::bus::{Envelope, MessageBus, Topic};
use panel_fulfillment::domain::{BindingStatus, OrderStatus, TrafficStatus};
use panel_fulfillment::error::PipelineError;
use panel_fulfillment::intake::{OrderIntake, PlaceOrderRequest};
use panel_fulfillment::store::test_support::{seed_account, seed_service, seed_three_campaigns, seed_user};
use panel_fulfillment::store::{AccountStore, CampaignStore, Db, LedgerStore, NewOrder, OrderStore, RefillStore, ServiceStore, VideoStore};
use panel_fulfillment::tracker::client::stub::StubTracker;
use panel_fulfillment::tracker::CampaignStats;
use panel_fulfillment::video::client::stub::StubVideoClient;
use panel_fulfillment::workers::{CampaignAssigner, Reconciler, RefillEngine, VideoProcessingWorker};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const BUS_MAX_ATTEMPTS: u8 = 3;

struct Harness {
    db: Db,
    bus: Arc<SqliteBus>,
    order_store: Arc<OrderStore>,
    service_store: Arc<ServiceStore>,
    ledger_store: Arc<LedgerStore>,
    video_store: Arc<VideoStore>,
    account_store: Arc<AccountStore>,
    campaign_store: Arc<CampaignStore>,
    refill_store: Arc<RefillStore>,
    tracker: Arc<StubTracker>,
    video_client: Arc<StubVideoClient>,
}

impl Harness {
    fn new(db: Db) -> Self {
        let bus = Arc::new(SqliteBus::new(db.clone(), Duration::from_millis(1)));
        Self {
            order_store: Arc::new(OrderStore::new(db.clone())),
            service_store: Arc::new(ServiceStore::new(db.clone())),
            ledger_store: Arc::new(LedgerStore::new(db.clone())),
            video_store: Arc::new(VideoStore::new(db.clone())),
            account_store: Arc::new(AccountStore::new(db.clone())),
            campaign_store: Arc::new(CampaignStore::new(db.clone())),
            refill_store: Arc::new(RefillStore::new(db.clone())),
            tracker: Arc::new(StubTracker::new()),
            video_client: Arc::new(StubVideoClient::new()),
            bus,
            db,
        }
    }

    fn intake(&self) -> OrderIntake {
        OrderIntake::new(
            self.order_store.clone(),
            self.service_store.clone(),
            self.ledger_store.clone(),
            self.bus.clone(),
            BUS_MAX_ATTEMPTS,
        )
    }

    fn video_worker(&self) -> VideoProcessingWorker {
        VideoProcessingWorker::new(
            self.order_store.clone(),
            self.service_store.clone(),
            self.video_store.clone(),
            self.account_store.clone(),
            self.video_client.clone(),
            self.bus.clone(),
            BUS_MAX_ATTEMPTS,
        )
    }

    fn campaign_assigner(&self) -> CampaignAssigner {
        CampaignAssigner::new(self.order_store.clone(), self.campaign_store.clone(), self.tracker.clone())
    }

    fn reconciler(&self, batch_size: usize) -> Reconciler {
        Reconciler::new(
            self.order_store.clone(),
            self.campaign_store.clone(),
            self.tracker.clone(),
            self.db.clone(),
            batch_size,
            30,
        )
    }

    fn refill_engine(&self) -> RefillEngine {
        RefillEngine::new(
            self.order_store.clone(),
            self.refill_store.clone(),
            self.service_store.clone(),
            self.video_client.clone(),
            self.bus.clone(),
            BUS_MAX_ATTEMPTS,
            Duration::from_secs(60),
            1.5,
            5,
        )
    }

    /// Drains one due envelope from `topic` through `handler`, acking on
    /// success — the manual equivalent of one step of
    /// `bus::inmemory::run_consumer`, since these tests drive each hop
    /// explicitly instead of running the background consumer loop.
    async fn drain_one<F, Fut>(&self, topic: Topic, handler: F)
    where
        F: FnOnce(Envelope) -> Fut,
        Fut: std::future::Future<Output = Result<(), (String, String)>>,
    {
        let batch = self.bus.poll(topic, 10).await.unwrap();
        assert_eq!(batch.len(), 1, "expected exactly one due envelope on {topic:?}");
        let envelope = batch[0].clone();
        let id = envelope.id;
        handler(envelope).await.unwrap();
        self.bus.ack(id).await.unwrap();
    }
}

/// S1: happy path, clip mode. servicePricePerThousand=2.50, quantity=2000,
/// balance=1000.00 -> charge=5.00, clip-path coefficient=3.0, clicks
/// required 6000 split 2000/2000/2000 across three equal campaigns; once
/// the tracker reports 2000 clicks per campaign the order reaches
/// COMPLETED with viewsDelivered=2000.
#[tokio::test]
async fn s1_happy_path_clip_mode_reaches_completed() {
    let db = Db::open_in_memory().unwrap();
    let h = Harness::new(db.clone());
    let user_id = seed_user(&db, "alice", dec!(1000.00)).await;
    let service_id = seed_service(&db, dec!(2.50), true).await;
    seed_account(&db, 10).await;
    seed_three_campaigns(&db).await;

    h.video_client
        .view_counts
        .lock()
        .unwrap()
        .insert("https://youtu.be/ABC123".to_string(), 500);

    let order = h
        .intake()
        .place_order(PlaceOrderRequest {
            user_id,
            service_id,
            link: "https://youtu.be/ABC123".to_string(),
            quantity: 2000,
            target_country: None,
            budget_limit: None,
        })
        .await
        .unwrap();
    assert_eq!(order.charge, dec!(5.00));

    let user = h.ledger_store.get_user(user_id).await.unwrap();
    assert_eq!(user.balance, dec!(995.00));
    let history = h.ledger_store.history(user_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].amount, dec!(-5.00));

    let worker = h.video_worker();
    h.drain_one(Topic::VideoProcessing, |env| async move { worker.handle(env).await }).await;

    let order = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order.coefficient, Decimal::new(30, 1)); // 3.0, clip path
    assert_eq!(order.status, OrderStatus::InProgress);

    let assigner = h.campaign_assigner();
    h.drain_one(Topic::OfferAssignment, |env| async move { assigner.handle(env).await }).await;

    let order = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Active);
    let bindings = h.campaign_store.bindings_for_order(order.id).await.unwrap();
    assert_eq!(bindings.len(), 3);
    let mut shares: Vec<u64> = bindings.iter().map(|b| b.clicks_required).collect();
    shares.sort_unstable();
    assert_eq!(shares, vec![2000, 2000, 2000]);

    for (ext_id, clicks) in [("ext-1", 2000u64), ("ext-2", 2000), ("ext-3", 2000)] {
        h.tracker.exists.lock().unwrap().insert(ext_id.to_string());
        h.tracker.stats.lock().unwrap().insert(
            ext_id.to_string(),
            CampaignStats { clicks, conversions: 10, cost: dec!(20.00), revenue: dec!(40.00) },
        );
    }

    let summary = h.reconciler(50).run_tick().await.unwrap();
    assert_eq!(summary.orders_scanned, 1);
    assert_eq!(summary.errors, 0);

    let order = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order.views_delivered, 2000);
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.traffic_status, TrafficStatus::Delivered);

    // Invariant: floor(sum(clicksDelivered) / coefficient) == viewsDelivered.
    let bindings = h.campaign_store.bindings_for_order(order.id).await.unwrap();
    let total_clicks: u64 = bindings.iter().map(|b| b.clicks_delivered).sum();
    assert_eq!((total_clicks as f64 / 3.0).floor() as u64, order.views_delivered);

    // Idempotence: a second tick against unchanged tracker stats is a no-op.
    let order_before = h.order_store.get(order.id).await.unwrap();
    h.reconciler(50).run_tick().await.unwrap();
    let order_after = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order_before.views_delivered, order_after.views_delivered);
    assert_eq!(order_before.status, order_after.status);
}

/// S2: insufficient funds leaves no order row and no balance transaction.
#[tokio::test]
async fn s2_insufficient_balance_leaves_no_trace() {
    let db = Db::open_in_memory().unwrap();
    let h = Harness::new(db.clone());
    let user_id = seed_user(&db, "bob", dec!(2.00)).await;
    let service_id = seed_service(&db, dec!(2.50), true).await;

    let err = h
        .intake()
        .place_order(PlaceOrderRequest {
            user_id,
            service_id,
            link: "https://youtu.be/ABC123".to_string(),
            quantity: 2000,
            target_country: None,
            budget_limit: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientBalance { .. }));

    let user = h.ledger_store.get_user(user_id).await.unwrap();
    assert_eq!(user.balance, dec!(2.00));
    assert!(h.ledger_store.history(user_id, 10).await.unwrap().is_empty());
    assert!(h.order_store.list_for_user(user_id, 10).await.unwrap().is_empty());
}

/// S3: two concurrent debits against a balance of 10.00 (charges 6.00 and
/// 7.00) — exactly one succeeds, the other fails InsufficientBalance, and
/// invariant 1 (balance == initial + sum of signed transaction amounts)
/// holds.
#[tokio::test]
async fn s3_concurrent_debits_exactly_one_succeeds() {
    let db = Db::open_in_memory().unwrap();
    let user_id = seed_user(&db, "carol", dec!(10.00)).await;
    let ledger_a = Arc::new(LedgerStore::new(db.clone()));
    let ledger_b = ledger_a.clone();

    let (r1, r2) = tokio::join!(
        ledger_a.debit_for_order(user_id, 101, dec!(6.00)),
        ledger_b.debit_for_order(user_id, 102, dec!(7.00)),
    );

    let results = [&r1, &r2];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let failures = results
        .iter()
        .filter(|r| matches!(r, Err(PipelineError::InsufficientBalance { .. })))
        .count();
    assert_eq!(successes, 1, "exactly one of the two concurrent debits should succeed");
    assert_eq!(failures, 1);

    let user = ledger_a.get_user(user_id).await.unwrap();
    assert!(user.balance == dec!(4.00) || user.balance == dec!(3.00));

    let history = ledger_a.history(user_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);

    let signed_sum: Decimal = history.iter().map(|tx| tx.amount).sum();
    assert_eq!(dec!(10.00) + signed_sum, user.balance);
}

/// S4: reconciliation auto-pauses a binding once its own budget limit is
/// reached, while the order keeps running and still completes once the
/// remaining campaigns deliver the target quantity.
#[tokio::test]
async fn s4_budget_auto_pause_then_quantity_completes() {
    let db = Db::open_in_memory().unwrap();
    let h = Harness::new(db.clone());
    seed_three_campaigns(&db).await;
    for ext_id in ["ext-1", "ext-2", "ext-3"] {
        h.tracker.exists.lock().unwrap().insert(ext_id.to_string());
    }

    let order = h
        .order_store
        .create(NewOrder {
            user_id: 1,
            service_id: 1,
            link: "https://youtu.be/ABC123".to_string(),
            quantity: 10_000,
            charge: dec!(25.00),
            coefficient: dec!(4.0),
            target_country: None,
            budget_limit: None,
            is_refill: false,
            refill_parent_id: None,
        })
        .await
        .unwrap();
    let order = h.order_store.transition(order.id, order.version, OrderStatus::Processing, None).await.unwrap();
    let order = h.order_store.transition(order.id, order.version, OrderStatus::InProgress, None).await.unwrap();

    // Only ext-1 carries a per-binding budget limit; ext-2/ext-3 are
    // unconstrained so they can keep delivering after ext-1 pauses.
    h.campaign_store.create_binding(order.id, "ext-1", "offer-1", 8000, Some(dec!(50.00))).await.unwrap();
    h.campaign_store.create_binding(order.id, "ext-2", "offer-1", 16000, None).await.unwrap();
    h.campaign_store.create_binding(order.id, "ext-3", "offer-1", 16000, None).await.unwrap();
    let order = h.order_store.transition(order.id, order.version, OrderStatus::Active, None).await.unwrap();

    // Tick 1: ext-1 below its budget limit, quantity not met.
    h.tracker.stats.lock().unwrap().insert(
        "ext-1".to_string(),
        CampaignStats { clicks: 8000, conversions: 1, cost: dec!(49.90), revenue: dec!(0.00) },
    );
    h.tracker.stats.lock().unwrap().insert(
        "ext-2".to_string(),
        CampaignStats { clicks: 0, conversions: 0, cost: dec!(0.00), revenue: dec!(0.00) },
    );
    h.tracker.stats.lock().unwrap().insert(
        "ext-3".to_string(),
        CampaignStats { clicks: 0, conversions: 0, cost: dec!(0.00), revenue: dec!(0.00) },
    );
    h.reconciler(50).run_tick().await.unwrap();
    let order = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Active);
    assert_eq!(order.traffic_status, TrafficStatus::Running);

    // Tick 2: ext-1's cost crosses its own 50.00 budget limit.
    h.tracker.stats.lock().unwrap().insert(
        "ext-1".to_string(),
        CampaignStats { clicks: 8000, conversions: 1, cost: dec!(50.10), revenue: dec!(0.00) },
    );
    h.reconciler(50).run_tick().await.unwrap();

    let bindings = h.campaign_store.bindings_for_order(order.id).await.unwrap();
    let paused = bindings.iter().find(|b| b.external_campaign_id == "ext-1").unwrap();
    assert_eq!(paused.status, BindingStatus::Paused);
    assert!(paused.pause_reason.as_deref().unwrap_or("").to_lowercase().contains("budget"));

    let order = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Active);

    // Tick 3: ext-2 and ext-3 alone deliver enough clicks to meet the
    // 10000-view target (floor((8000+16000+16000)/4.0) = 10000); the
    // paused ext-1's already-accumulated 8000 clicks still count.
    h.tracker.stats.lock().unwrap().insert(
        "ext-2".to_string(),
        CampaignStats { clicks: 16000, conversions: 5, cost: dec!(10.00), revenue: dec!(0.00) },
    );
    h.tracker.stats.lock().unwrap().insert(
        "ext-3".to_string(),
        CampaignStats { clicks: 16000, conversions: 5, cost: dec!(10.00), revenue: dec!(0.00) },
    );
    h.reconciler(50).run_tick().await.unwrap();
    let order = h.order_store.get(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.traffic_status, TrafficStatus::Delivered);
}

/// S5: refill. Parent completed with quantity=2000, startCount=1000; the
/// probe returns 2600 (delivered=1600) -> refillQty=400. A second refill
/// within the idempotency window is a Conflict and creates no second child.
#[tokio::test]
async fn s5_refill_creates_shortfall_child_then_blocks_duplicates() {
    let db = Db::open_in_memory().unwrap();
    let h = Harness::new(db.clone());
    seed_service(&db, dec!(2.50), false).await;

    let parent = h
        .order_store
        .create(NewOrder {
            user_id: 1,
            service_id: 1,
            link: "https://youtu.be/ABC123".to_string(),
            quantity: 2000,
            charge: dec!(5.00),
            coefficient: dec!(4.0),
            target_country: None,
            budget_limit: None,
            is_refill: false,
            refill_parent_id: None,
        })
        .await
        .unwrap();
    let parent = h.order_store.set_video_link(parent.id, parent.version, "ABC123", 1000).await.unwrap();
    let parent = h.order_store.transition(parent.id, parent.version, OrderStatus::Processing, None).await.unwrap();
    let parent = h.order_store.transition(parent.id, parent.version, OrderStatus::InProgress, None).await.unwrap();
    let parent = h.order_store.transition(parent.id, parent.version, OrderStatus::Active, None).await.unwrap();
    let parent = h.order_store.transition(parent.id, parent.version, OrderStatus::Completed, None).await.unwrap();

    h.video_client.view_counts.lock().unwrap().insert(parent.link.clone(), 2600);

    let result = h.refill_engine().create_refill(parent.id).await.unwrap();
    assert_eq!(result.refill_quantity, 400);
    assert_eq!(result.delivered, 1600);
    assert_eq!(result.refill_number, 1);
    assert_eq!(result.child_order.charge, Decimal::ZERO);
    assert!(result.child_order.is_refill);
    assert_eq!(result.child_order.refill_parent_id, Some(parent.id));

    // The child re-entered the pipeline via a video.processing envelope.
    let batch = h.bus.poll(Topic::VideoProcessing, 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].partition_key, result.child_order.id.to_string());

    // Second refill within the 60s idempotency window: Conflict, no second child.
    let err = h.refill_engine().create_refill(parent.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Conflict(_)));
    assert_eq!(h.order_store.refill_children(parent.id).await.unwrap().len(), 1);
}
