//! Fulfillment engine daemon: wires the persistence layer, external-service
//! clients, and message bus, then drives the background workers (C7-C9,
//! C11) that carry an order from PENDING through to delivery. Order intake
//! (C6) and refills (C10) are on-demand operations exposed by the library
//! and the `reconcile-once` / `trigger-refill` operator binaries rather than
//! continuous consumers; the HTTP/API surface that would call them in
//! production is out of scope here.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use panel_fulfillment::bus::inmemory::{run_consumer, SqliteBus};
use panel_fulfillment::bus::{MessageBus, Topic};
use panel_fulfillment::store::{AccountStore, CampaignStore, Db, OrderStore, ServiceStore, VideoStore};
use panel_fulfillment::tracker::client::HttpTracker;
use panel_fulfillment::tracker::Tracker;
use panel_fulfillment::video::client::HttpVideoClient;
use panel_fulfillment::video::VideoClient;
use panel_fulfillment::workers::{CampaignAssigner, Reconciler, ResultIngressWorker, VideoProcessingWorker};
use panel_fulfillment::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    info!(database_path = %config.database_path, "fulfillment engine starting");

    let db = Db::open(&config.database_path)?;

    let order_store = Arc::new(OrderStore::new(db.clone()));
    let service_store = Arc::new(ServiceStore::new(db.clone()));
    let video_store = Arc::new(VideoStore::new(db.clone()));
    let account_store = Arc::new(AccountStore::new(db.clone()));
    let campaign_store = Arc::new(CampaignStore::new(db.clone()));

    let tracker: Arc<dyn Tracker> = Arc::new(HttpTracker::new(
        config.tracker_base_url.clone(),
        &config.tracker_api_key,
        config.tracker_read_timeout,
        config.tracker_write_timeout,
        config.tracker_read_max_attempts,
        config.tracker_write_max_attempts,
    )?);

    let video_client: Arc<dyn VideoClient> = Arc::new(HttpVideoClient::new(
        config.video_base_url.clone(),
        config.video_read_timeout,
        config.video_write_timeout,
    )?);

    let bus: Arc<dyn MessageBus> = Arc::new(SqliteBus::new(db.clone(), config.bus_retry_base_delay));

    let video_processing = Arc::new(VideoProcessingWorker::new(
        order_store.clone(),
        service_store.clone(),
        video_store.clone(),
        account_store.clone(),
        video_client.clone(),
        bus.clone(),
        config.bus_max_attempts_default,
    ));
    {
        let bus = bus.clone();
        let worker = video_processing.clone();
        let worker_count = config.bus_worker_count;
        tokio::spawn(async move {
            run_consumer(bus, Topic::VideoProcessing, worker_count, std::time::Duration::from_millis(250), move |env| {
                let worker = worker.clone();
                async move { worker.handle(env).await }
            })
            .await;
        });
    }

    let campaign_assigner = Arc::new(CampaignAssigner::new(order_store.clone(), campaign_store.clone(), tracker.clone()));
    {
        let bus = bus.clone();
        let worker = campaign_assigner.clone();
        let worker_count = config.bus_worker_count;
        tokio::spawn(async move {
            run_consumer(bus, Topic::OfferAssignment, worker_count, std::time::Duration::from_millis(250), move |env| {
                let worker = worker.clone();
                async move { worker.handle(env).await }
            })
            .await;
        });
    }

    let result_ingress = Arc::new(ResultIngressWorker::new(order_store.clone()));
    {
        let bus = bus.clone();
        let worker = result_ingress.clone();
        let worker_count = config.bus_worker_count;
        tokio::spawn(async move {
            run_consumer(bus, Topic::InstagramResults, worker_count, std::time::Duration::from_millis(250), move |env| {
                let worker = worker.clone();
                async move { worker.handle(env).await }
            })
            .await;
        });
    }

    let reconciler = Arc::new(Reconciler::new(
        order_store.clone(),
        campaign_store.clone(),
        tracker.clone(),
        db.clone(),
        config.reconcile_batch_size,
        config.reconcile_audit_retention_days,
    ));
    let reconcile_interval = config.reconcile_interval;
    let reconciler_handle = tokio::spawn(async move { reconciler.run(reconcile_interval).await });

    info!("fulfillment engine running: video-processing, offer-assignment, result-ingress consumers and reconciler tick all started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    reconciler_handle.abort();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "panel_fulfillment=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
