use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

/// Guild label used for updates that are not tied to a guild.
pub const NO_GUILD: &str = "None";

pub trait MetricsSink: Sync + Send {
    fn cache_hit(&self);
    fn cache_miss(&self);
    fn rate_limited(&self);
    fn update_error(&self);
    /// Records "now" as the last successful update for (instrument, guild).
    fn mark_updated(&self, instrument: &str, guild: &str);
    /// Zeroes the last update gauge after a hard failure.
    fn mark_failed(&self, instrument: &str, guild: &str);
}

#[derive(Default)]
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limited: AtomicU64,
    update_errors: AtomicU64,
    last_update: Mutex<BTreeMap<(String, String), u64>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rate_limited: u64,
    pub update_errors: u64,
    pub last_update: BTreeMap<(String, String), u64>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            update_errors: self.update_errors.load(Ordering::Relaxed),
            last_update: self
                .last_update
                .lock()
                .map(|gauges| gauges.clone())
                .unwrap_or_default(),
        }
    }

    fn set_last_update(&self, instrument: &str, guild: &str, value: u64) {
        if let Ok(mut gauges) = self.last_update.lock() {
            gauges.insert((instrument.to_owned(), guild.to_owned()), value);
        }
    }
}

impl MetricsSink for Metrics {
    fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn update_error(&self) {
        self.update_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_updated(&self, instrument: &str, guild: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.set_last_update(instrument, guild, now);
    }

    fn mark_failed(&self, instrument: &str, guild: &str) {
        self.set_last_update(instrument, guild, 0);
    }
}
