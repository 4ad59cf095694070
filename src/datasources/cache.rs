use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;

use super::datasource::{PriceQuote, PriceSource};
use crate::metrics::MetricsSink;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Shared read-through cache for crypto quotes. The lock is never held
/// across the provider call, so two watchers missing at the same time may
/// both populate the entry.
pub struct PriceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, PriceQuote)>>,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> PriceCache {
        PriceCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &str) -> Option<PriceQuote> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((time, quote)) if time.elapsed() < self.ttl => Some(quote.clone()),
            _ => None,
        }
    }

    fn store(&self, key: &str, quote: PriceQuote) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_owned(), (Instant::now(), quote));
        }
    }

    /// Returns the cached quote and `true`, or computes, stores and returns
    /// it with `false`.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<(PriceQuote, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PriceQuote>>,
    {
        if let Some(quote) = self.lookup(key) {
            return Ok((quote, true));
        }
        let quote = compute().await?;
        self.store(key, quote.clone());
        Ok((quote, false))
    }
}

pub struct CachedSource<S> {
    inner: S,
    cache: Arc<PriceCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: PriceSource> CachedSource<S> {
    pub fn new(inner: S, cache: Arc<PriceCache>, metrics: Arc<dyn MetricsSink>) -> CachedSource<S> {
        CachedSource {
            inner,
            cache,
            metrics,
        }
    }
}

#[async_trait]
impl<S: PriceSource> PriceSource for CachedSource<S> {
    async fn fetch(&self, instrument: &str) -> Result<PriceQuote> {
        let res = self
            .cache
            .get_or_compute(instrument, || self.inner.fetch(instrument))
            .await;
        match res {
            Ok((quote, true)) => {
                self.metrics.cache_hit();
                Ok(quote)
            }
            Ok((quote, false)) => {
                self.metrics.cache_miss();
                Ok(quote)
            }
            Err(e) => {
                self.metrics.cache_miss();
                Err(e)
            }
        }
    }
}
