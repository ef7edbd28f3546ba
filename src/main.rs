//! Reactive Cache - expiry demonstration
//!
//! Seeds a live cache with items of growing TTL and logs each expiry batch
//! as it happens on the real-time scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reactive_cache::{
    ChangeSet, Config, Expiry, FnObserver, Scheduler, SourceCache, StreamError, TokioScheduler,
};

#[derive(Debug, Clone, PartialEq)]
struct DemoItem {
    id: usize,
    name: String,
    ttl: Duration,
}

/// Main entry point for the expiry demo.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the live cache and attach expiry on the tokio scheduler
/// 4. Seed the cache in one atomic edit
/// 5. Run until Ctrl+C, SIGTERM, or the configured run time elapses
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reactive_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting reactive cache expiry demo");

    let config = Config::from_env();
    info!(
        "Configuration loaded: items={}, base_ttl={}ms, polling={}ms, run={}s",
        config.item_count, config.item_ttl_ms, config.polling_interval_ms, config.run_secs
    );

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current()?);
    let cache = SourceCache::new(|item: &DemoItem| item.id);

    let contents = cache.connect().subscribe(FnObserver::new(
        |changes: &ChangeSet<usize, DemoItem>| {
            debug!(changes = changes.len(), "Cache changed");
        },
        |error: &StreamError| warn!(error = %error, "Cache stream failed"),
        || debug!("Cache stream completed"),
    ));

    let expiry = cache.expire_after(
        |item: &DemoItem| Ok(Expiry::After(item.ttl)),
        config.polling_interval(),
        scheduler,
    )?;
    let expired = expiry.subscribe(FnObserver::new(
        |changes: &ChangeSet<usize, DemoItem>| {
            let names: Vec<&str> = changes.iter().map(|c| c.current().name.as_str()).collect();
            match serde_json::to_string(&changes.summary()) {
                Ok(summary) => info!(summary = %summary, ?names, "Items expired"),
                Err(error) => warn!(error = %error, "Failed to encode batch summary"),
            }
        },
        |error: &StreamError| warn!(error = %error, "Expiry stream failed"),
        || info!("Expiry stream completed"),
    ));

    cache.edit(|updater| {
        for index in 0..config.item_count {
            updater.add_or_update(DemoItem {
                id: index,
                name: format!("item-{index}"),
                ttl: config.ttl_for(index),
            });
        }
    })?;
    info!(items = cache.count(), "Cache seeded");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = tokio::time::sleep(config.run_duration()) => {
            info!("Run time elapsed, initiating shutdown...");
        }
    }

    info!(remaining = cache.count(), "Shutting down");
    drop(expired);
    cache.complete()?;
    drop(contents);

    info!("Demo shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(error = %error, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
