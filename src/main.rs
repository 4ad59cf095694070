mod config;
mod datasources;
mod display;
mod metrics;
mod platform;
mod rotator;
mod shards;
#[cfg(test)]
mod testing;
mod watcher;

use std::{
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{error, info};
use pretty_duration::pretty_duration;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use config::{Settings, WatcherConfig};
use datasources::{
    CachedSource, CoinGeckoSource, PriceCache, PriceSource, TwelveDataSource, YahooQuoteSource,
    YahooRateSource,
};
use metrics::{Metrics, MetricsSink};
use platform::DiscordPlatform;
use watcher::{Watcher, WatcherContext};

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

fn price_source(
    config: &WatcherConfig,
    client: &Arc<Client>,
    cache: &Option<Arc<PriceCache>>,
    metrics: &Arc<Metrics>,
) -> Arc<dyn PriceSource> {
    if config.crypto {
        let source = CoinGeckoSource::new(client.clone());
        return match cache {
            Some(cache) => Arc::new(CachedSource::new(source, cache.clone(), metrics.clone())),
            None => Arc::new(source),
        };
    }
    match &config.twelve_data_key {
        Some(key) if !key.is_empty() => Arc::new(TwelveDataSource::new(client.clone(), key.clone())),
        _ => Arc::new(YahooQuoteSource::new(client.clone())),
    }
}

async fn report_metrics(metrics: Arc<Metrics>, shutdown: CancellationToken) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = metrics.snapshot();
        info!(
            "[METRICS] up={} cache_hits={} cache_misses={} rate_limited={} update_errors={}",
            pretty_duration(&started.elapsed(), None),
            snapshot.cache_hits,
            snapshot.cache_misses,
            snapshot.rate_limited,
            snapshot.update_errors,
        );
        for ((instrument, guild), updated) in &snapshot.last_update {
            info!("[METRICS] last_update {} {} {}", instrument, guild, updated);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = env::var("TICKER_CONFIG").unwrap_or_else(|_| "tickers.json".to_owned());
    let mut settings = Settings::load(&path)?;
    if let Ok(frequency) = env::var("TICKER_FREQUENCY") {
        settings.frequency = frequency
            .parse()
            .with_context(|| format!("invalid TICKER_FREQUENCY {}", frequency))?;
    }

    let client = Arc::new(
        Client::builder()
            .user_agent(concat!("presence-ticker ", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?,
    );
    let rates = Arc::new(YahooRateSource::new(Arc::new(
        yahoo_finance_api::YahooConnector::new()?,
    )));
    let metrics = Arc::new(Metrics::new());
    let cache = settings
        .cache
        .as_ref()
        .map(|cache| Arc::new(PriceCache::new(cache.ttl())));
    if cache.is_none() {
        info!("Price cache disabled, querying providers directly");
    }

    let shutdown = CancellationToken::new();
    let reporter = tokio::spawn(report_metrics(metrics.clone(), shutdown.clone()));

    let frequency_override = settings.frequency_override();
    let mut handles = vec![];
    for config in settings.watchers {
        let ctx = WatcherContext {
            platform: Arc::new(DiscordPlatform::new(
                client.clone(),
                config.token.clone(),
                config.label(),
            )),
            source: price_source(&config, &client, &cache, &metrics),
            rates: rates.clone(),
            metrics: metrics.clone() as Arc<dyn MetricsSink>,
            frequency_override,
            managed: settings.managed,
            base_currency: settings.base_currency.clone(),
        };
        info!("Starting watcher {}", config.label());
        let watcher = Watcher::new(config, ctx);
        handles.push(tokio::spawn(watcher.run(shutdown.child_token())));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    for res in join_all(handles).await {
        if let Err(e) = res {
            error!("Watcher task failed: {}", e);
        }
    }
    let _ = reporter.await;
    Ok(())
}
