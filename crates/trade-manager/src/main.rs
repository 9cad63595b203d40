//! Trade-Lifecycle Manager
//!
//! Runs the dispatcher and reconciler loops against the shared store, plus
//! the optional broker push-stream listener.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alpaca_broker::{AlpacaBroker, Broker, TradeStream};
use trade_core::Config;
use trade_manager::{Dispatcher, Reconciler, SendPipeline, TradeEventListener};
use trade_store::{RestStore, TradeStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "trade_manager=info,trade_store=info,alpaca_broker=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting trade-lifecycle manager");

    let config = Config::from_env()?;

    let store: Arc<dyn TradeStore> = Arc::new(RestStore::new(
        config.supabase_url.clone(),
        &config.supabase_key,
    )?);
    let broker: Arc<dyn Broker> = Arc::new(AlpacaBroker::new(
        config.alpaca_base.clone(),
        config.alpaca_key.clone(),
        config.alpaca_secret.clone(),
    ));

    let pipeline = SendPipeline::new(store.clone(), broker.clone(), config.max_send_attempts);
    let dispatcher = Dispatcher::new(store.clone(), pipeline, config.interval);
    let reconciler = Reconciler::new(store.clone(), broker.clone(), config.interval);

    if config.trade_events_enabled {
        let stream = TradeStream::new(
            &config.alpaca_base,
            config.alpaca_key.clone(),
            config.alpaca_secret.clone(),
        );
        let listener = TradeEventListener::new(store.clone(), reconciler.clone());
        tokio::spawn(listener.run(stream.subscribe()));
    }

    tokio::spawn(reconciler.run());

    // The dispatcher owns the main task.
    dispatcher.run().await;

    Ok(())
}
