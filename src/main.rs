use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use market_ledger::application::actors::broker_actor::{BrokerActor, BrokerHandle, BrokerSettings};
use market_ledger::application::handlers::{router, ApiState};
use market_ledger::application::services::datafeed::Datafeed;
use market_ledger::application::services::price_feed_bridge::PriceFeedBridge;
use market_ledger::application::services::scheduler::TokioScheduler;
use market_ledger::application::services::subscription_registry::SubscriptionRegistry;
use market_ledger::application::services::symbol_router::SymbolRouter;
use market_ledger::config::AppConfig;
use market_ledger::domain::repositories::provider_adapter::{ProviderAdapter, TickSink};
use market_ledger::domain::services::clock::SystemClock;
use market_ledger::domain::value_objects::bar::Bar;
use market_ledger::domain::value_objects::channel::{ChannelKey, ListenerId};
use market_ledger::domain::value_objects::period::Period;
use market_ledger::infrastructure::adapter_factory::AdapterFactory;
use market_ledger::persistence::{init_database, SqliteSnapshotStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_ledger=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    info!("Market ledger starting for identity {}", config.identity);

    let pool = init_database(&config.database_url).await?;
    let store = Arc::new(SqliteSnapshotStore::new(pool, config.settlement_asset.clone()));

    let broker = BrokerActor::spawn(
        BrokerSettings::from_config(&config),
        store,
        Arc::new(TokioScheduler),
        Arc::new(SystemClock),
    );
    let account = broker.connect().await?;
    info!(
        "Broker connected: balance {:.2}, equity {:.2}",
        account.balance, account.equity
    );

    let adapters = AdapterFactory::create_all(&config);
    for adapter in adapters.values() {
        spawn_event_logger(adapter.clone());
    }

    let symbol_router = Arc::new(SymbolRouter::new(
        adapters,
        config.default_venue,
        config.resolve_cache_size,
    ));
    let bridge = PriceFeedBridge::new(broker.clone());
    let registry = Arc::new(SubscriptionRegistry::with_tap(bridge.tap()));
    let datafeed = Arc::new(Datafeed::new(symbol_router, registry).with_bridge(bridge));

    datafeed.connect_all().await;
    subscribe_watchlist(&datafeed, &config.watchlist).await;

    let app = router(ApiState {
        broker: broker.clone(),
        datafeed: datafeed.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on {}", listener.local_addr()?);

    info!("Server started successfully. Press Ctrl+C to stop.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutting down gracefully...");
    shutdown(&broker, &datafeed).await;
    info!("Shutdown complete");
    Ok(())
}

/// Streams each watchlist symbol at one minute so the ledger is marked even
/// when no chart is open.
async fn subscribe_watchlist(datafeed: &Datafeed, watchlist: &[String]) {
    let noop: TickSink = Arc::new(|_: &ChannelKey, _: &Bar| {});
    for symbol in watchlist {
        let listener = ListenerId::new(format!("watchlist:{}", symbol));
        match datafeed
            .subscribe(symbol, Period::one_minute(), noop.clone(), listener)
            .await
        {
            Ok(channel) => info!("✓ Watching {}", channel),
            Err(e) => error!("✗ Failed to watch {}: {}", symbol, e),
        }
    }
}

fn spawn_event_logger(adapter: Arc<dyn ProviderAdapter>) {
    let mut events = adapter.events();
    let venue = adapter.venue();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("{} adapter event: {:?}", venue, event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} adapter event log skipped {} event(s)", venue, skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown(broker: &BrokerHandle, datafeed: &Datafeed) {
    datafeed.disconnect_all().await;
    if let Err(e) = broker.disconnect().await {
        error!("Failed to persist ledger on shutdown: {}", e);
    }
    broker.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
