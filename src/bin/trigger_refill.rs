//! Operator CLI: manually trigger a refill for an underdelivered order
//! (spec.md §4.7 C10), bypassing whatever admin surface would normally call
//! `RefillEngine::create_refill` in production.
//!
//! Usage:
//!   cargo run --release --bin trigger-refill -- --order-id 42

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use panel_fulfillment::store::{Db, OrderStore, RefillStore, ServiceStore};
use panel_fulfillment::video::client::HttpVideoClient;
use panel_fulfillment::video::VideoClient;
use panel_fulfillment::workers::RefillEngine;
use panel_fulfillment::Config;
use std::sync::Arc;

/// Create a refill child order for one underdelivered order.
#[derive(Parser, Debug)]
#[command(name = "trigger-refill")]
#[command(about = "Manually trigger a refill for one order")]
struct Cli {
    /// Order id to refill.
    #[arg(long)]
    order_id: i64,

    /// Override DATABASE_PATH for this run.
    #[arg(long)]
    database_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "panel_fulfillment=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }

    let db = Db::open(&config.database_path)?;
    let order_store = Arc::new(OrderStore::new(db.clone()));
    let refill_store = Arc::new(RefillStore::new(db.clone()));
    let service_store = Arc::new(ServiceStore::new(db.clone()));
    let video_client: Arc<dyn VideoClient> = Arc::new(HttpVideoClient::new(
        config.video_base_url.clone(),
        config.video_read_timeout,
        config.video_write_timeout,
    )?);
    let bus = Arc::new(panel_fulfillment::bus::inmemory::SqliteBus::new(
        db,
        config.bus_retry_base_delay,
    ));

    let engine = RefillEngine::new(
        order_store,
        refill_store,
        service_store,
        video_client,
        bus,
        config.bus_max_attempts_default,
        config.refill_idempotency_window,
        config.refill_sanity_multiplier,
        config.refill_max_per_parent,
    );

    let result = engine.create_refill(cli.order_id).await?;
    println!(
        "created refill #{} for order {}: child_order_id={} quantity={}",
        result.refill_number, cli.order_id, result.child_order.id, result.refill_quantity
    );
    Ok(())
}
