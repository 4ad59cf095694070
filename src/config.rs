use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::datasources::DEFAULT_TTL;

pub const MAX_DECIMALS: u8 = 13;

fn default_currency() -> String {
    "USD".to_owned()
}

fn default_multiplier() -> u32 {
    1
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Overrides every watcher's frequency when non-zero.
    #[serde(default)]
    pub frequency: u64,
    #[serde(default)]
    pub managed: bool,
    #[serde(default = "default_currency")]
    pub base_currency: String,
    #[serde(default)]
    pub cache: Option<CacheSettings>,
    pub watchers: Vec<WatcherConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        self.ttl_secs.map(Duration::from_secs).unwrap_or(DEFAULT_TTL)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub crypto: bool,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub currency_symbol: Option<String>,
    #[serde(default)]
    pub decimals: Option<u8>,
    pub frequency: u64,
    #[serde(default)]
    pub nickname: bool,
    #[serde(default)]
    pub color: bool,
    #[serde(default)]
    pub decorator: String,
    #[serde(default)]
    pub activity: String,
    #[serde(default)]
    pub pair: String,
    #[serde(default)]
    pub pair_flip: bool,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default)]
    pub client_id: String,
    #[serde(rename = "discord_bot_token")]
    pub token: String,
    #[serde(default)]
    pub twelve_data_key: Option<String>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Settings::from_json(&content).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Settings> {
        let settings: Settings = serde_json::from_str(content)?;
        for watcher in &settings.watchers {
            watcher
                .validate()
                .with_context(|| format!("invalid watcher {}", watcher.instrument()))?;
        }
        Ok(settings)
    }

    pub fn frequency_override(&self) -> Option<u64> {
        if self.frequency == 0 {
            None
        } else {
            Some(self.frequency)
        }
    }
}

impl WatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frequency == 0 {
            bail!("frequency must be greater than zero");
        }
        if let Some(decimals) = self.decimals {
            if decimals > MAX_DECIMALS {
                bail!("decimals must be between 0 and {}", MAX_DECIMALS);
            }
        }
        if self.multiplier == 0 {
            bail!("multiplier must be at least 1");
        }
        if self.token.is_empty() {
            bail!("discord_bot_token is required");
        }
        if self.crypto && self.name.is_empty() {
            bail!("crypto watchers need a name");
        }
        if !self.crypto && self.ticker.is_empty() {
            bail!("stock watchers need a ticker");
        }
        Ok(())
    }

    /// The identifier handed to the price provider.
    pub fn instrument(&self) -> &str {
        if self.crypto {
            &self.name
        } else {
            &self.ticker
        }
    }

    /// Human readable id for the bot, at most 32 bytes.
    pub fn label(&self) -> String {
        let mut label = format!("{}-{}", self.instrument(), self.currency).to_lowercase();
        if label.len() > 32 {
            let mut end = 32;
            while !label.is_char_boundary(end) {
                end -= 1;
            }
            label.truncate(end);
        }
        label
    }

    pub fn custom_activities(&self) -> Vec<String> {
        let mut activities: Vec<String> = if self.activity.is_empty() {
            vec![]
        } else {
            self.activity.split(';').map(str::to_owned).collect()
        };
        if self.crypto {
            if !activities.is_empty() && self.multiplier != 1 {
                activities.push(format!("x{} {}", self.multiplier, self.name));
            } else if activities.is_empty() && self.multiplier > 1 {
                activities.push(format!("x{} {}", self.multiplier, self.name.to_uppercase()));
            }
        }
        activities
    }
}
