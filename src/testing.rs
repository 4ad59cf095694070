//! In-memory fakes for the platform, the price providers and the FX source.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::datasources::{PriceQuote, PriceSource, RateSource};
use crate::platform::{Activity, Guild, Platform, Session, ShardInfo};

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    failing_activity: Mutex<HashSet<String>>,
}

impl Recorder {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct FakePlatform {
    recorder: Arc<Recorder>,
    shards: u32,
    failing_shard: Option<u32>,
    fail_primary: bool,
    guilds: Option<Vec<Guild>>,
}

impl FakePlatform {
    pub fn new() -> FakePlatform {
        FakePlatform {
            recorder: Arc::new(Recorder::default()),
            shards: 1,
            failing_shard: None,
            fail_primary: false,
            guilds: Some(vec![]),
        }
    }

    pub fn with_shards(mut self, shards: u32) -> FakePlatform {
        self.shards = shards;
        self
    }

    pub fn failing_shard(mut self, id: u32) -> FakePlatform {
        self.failing_shard = Some(id);
        self
    }

    pub fn failing_primary(mut self) -> FakePlatform {
        self.fail_primary = true;
        self
    }

    pub fn with_guilds(mut self, names: &[&str]) -> FakePlatform {
        self.guilds = Some(
            names
                .iter()
                .map(|name| Guild {
                    id: format!("id-{}", name),
                    name: (*name).to_owned(),
                })
                .collect(),
        );
        self
    }

    pub fn without_guilds(mut self) -> FakePlatform {
        self.guilds = None;
        self
    }

    pub fn fail_activity_on(&self, shard: u32) {
        self.recorder
            .failing_activity
            .lock()
            .unwrap()
            .insert(format!("shard{}", shard));
    }

    pub fn calls(&self) -> Vec<String> {
        self.recorder.calls.lock().unwrap().clone()
    }

    pub fn calls_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }
}

struct FakeSession {
    label: String,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Session for FakeSession {
    async fn set_activity(&self, activity: &Activity) -> Result<()> {
        if self.recorder.failing_activity.lock().unwrap().contains(&self.label) {
            return Err(anyhow!("{} is down", self.label));
        }
        self.recorder
            .record(format!("activity {} {}", self.label, activity.name));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.recorder.record(format!("close {}", self.label));
        Ok(())
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn open_session(&self, shard: Option<ShardInfo>) -> Result<Box<dyn Session>> {
        let label = match shard {
            Some(shard) if Some(shard.id) == self.failing_shard => {
                return Err(anyhow!("shard {} refused", shard.id))
            }
            Some(shard) => format!("shard{}", shard.id),
            None if self.fail_primary => return Err(anyhow!("gateway refused")),
            None => "primary".to_owned(),
        };
        Ok(Box::new(FakeSession {
            label,
            recorder: self.recorder.clone(),
        }))
    }

    async fn shard_count(&self) -> Result<u32> {
        Ok(self.shards)
    }

    async fn guilds(&self) -> Result<Vec<Guild>> {
        self.guilds.clone().ok_or(anyhow!("guilds unavailable"))
    }

    async fn set_nickname(&self, guild_id: &str, nickname: &str) -> Result<()> {
        self.recorder.record(format!("nick {} {}", guild_id, nickname));
        Ok(())
    }

    async fn set_color_role(&self, guild_id: &str, _user_id: &str, increase: bool) -> Result<()> {
        let direction = if increase { "up" } else { "down" };
        self.recorder.record(format!("role {} {}", guild_id, direction));
        Ok(())
    }

    async fn set_username(&self, name: &str) -> Result<()> {
        self.recorder.record(format!("username {}", name));
        Ok(())
    }
}

pub enum Behavior {
    Quote(PriceQuote),
    Fail(String),
    Hang,
}

/// Price source answering from a fixed table. `started` is notified on
/// every fetch so tests can wait for a tick to be in flight.
pub struct FakeSource {
    behaviors: HashMap<String, Behavior>,
    pub started: Arc<Notify>,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> FakeSource {
        FakeSource {
            behaviors: HashMap::new(),
            started: Arc::new(Notify::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, instrument: &str, behavior: Behavior) -> FakeSource {
        self.behaviors.insert(instrument.to_owned(), behavior);
        self
    }
}

pub fn quote(price: f64, change: f64, percent: f64, symbol: &str) -> PriceQuote {
    PriceQuote {
        price,
        change,
        percent,
        percent_raw: percent,
        session: None,
        symbol: Some(symbol.to_owned()),
    }
}

#[async_trait]
impl PriceSource for FakeSource {
    async fn fetch(&self, instrument: &str) -> Result<PriceQuote> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        match self.behaviors.get(instrument) {
            Some(Behavior::Quote(quote)) => Ok(quote.clone()),
            Some(Behavior::Fail(message)) => Err(anyhow!("{}", message)),
            Some(Behavior::Hang) => futures::future::pending().await,
            None => Err(anyhow!("unknown instrument {}", instrument)),
        }
    }
}

pub struct FakeRates {
    rate: Option<f64>,
    pub calls: AtomicUsize,
}

impl FakeRates {
    pub fn new(rate: Option<f64>) -> FakeRates {
        FakeRates {
            rate,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RateSource for FakeRates {
    async fn spot_rate(&self, currency: &str) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rate.ok_or(anyhow!("no rate for {}", currency))
    }
}
