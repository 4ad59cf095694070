mod discord;
mod gateway;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

pub use discord::DiscordPlatform;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Guild {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardInfo {
    pub id: u32,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityKind {
    Playing,
    Watching,
}

impl ActivityKind {
    pub fn code(self) -> u8 {
        match self {
            ActivityKind::Playing => 0,
            ActivityKind::Watching => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Activity {
    pub name: String,
    pub kind: ActivityKind,
}

impl Activity {
    pub fn watching(name: impl Into<String>) -> Activity {
        Activity {
            name: name.into(),
            kind: ActivityKind::Watching,
        }
    }

    pub fn playing(name: impl Into<String>) -> Activity {
        Activity {
            name: name.into(),
            kind: ActivityKind::Playing,
        }
    }
}

/// An open gateway connection that can carry presence updates.
#[async_trait]
pub trait Session: Sync + Send {
    async fn set_activity(&self, activity: &Activity) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// The chat platform as seen by a watcher: REST calls plus gateway sessions.
#[async_trait]
pub trait Platform: Sync + Send {
    /// Opens a gateway session, sharded when `shard` is given.
    async fn open_session(&self, shard: Option<ShardInfo>) -> Result<Box<dyn Session>>;
    /// Number of shards the platform recommends for this bot.
    async fn shard_count(&self) -> Result<u32>;
    async fn guilds(&self) -> Result<Vec<Guild>>;
    async fn set_nickname(&self, guild_id: &str, nickname: &str) -> Result<()>;
    async fn set_color_role(&self, guild_id: &str, user_id: &str, increase: bool) -> Result<()>;
    async fn set_username(&self, name: &str) -> Result<()>;
}
