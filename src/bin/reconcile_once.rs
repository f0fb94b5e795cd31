//! Operator CLI: run a single reconciliation tick (spec.md §4.6 C9) and
//! print the resulting summary, instead of waiting for the daemon's next
//! scheduled pass.
//!
//! Usage:
//!   cargo run --release --bin reconcile-once

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use panel_fulfillment::store::{CampaignStore, Db, OrderStore};
use panel_fulfillment::tracker::client::HttpTracker;
use panel_fulfillment::tracker::Tracker;
use panel_fulfillment::workers::Reconciler;
use panel_fulfillment::Config;
use std::sync::Arc;

/// Run one reconciliation tick against the configured database and tracker.
#[derive(Parser, Debug)]
#[command(name = "reconcile-once")]
#[command(about = "Run a single order-reconciliation tick and print the summary")]
struct Cli {
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
    let campaign_store = Arc::new(CampaignStore::new(db.clone()));
    let tracker: Arc<dyn Tracker> = Arc::new(HttpTracker::new(
        config.tracker_base_url.clone(),
        &config.tracker_api_key,
        config.tracker_read_timeout,
        config.tracker_write_timeout,
        config.tracker_read_max_attempts,
        config.tracker_write_max_attempts,
    )?);

    let reconciler = Reconciler::new(
        order_store,
        campaign_store,
        tracker,
        db,
        config.reconcile_batch_size,
        config.reconcile_audit_retention_days,
    );

    let summary = reconciler.run_tick().await?;
    println!(
        "orders_scanned={} bindings_updated={} errors={}",
        summary.orders_scanned, summary.bindings_updated, summary.errors
    );
    Ok(())
}
