use anyhow::{Context, Result};
use futures::future::join_all;
use log::{debug, error, info};

use crate::platform::{Activity, Platform, Session, ShardInfo};

pub struct ShardManager {
    shards: Vec<Box<dyn Session>>,
}

async fn close_all(sessions: &[Box<dyn Session>]) {
    for res in join_all(sessions.iter().map(|s| s.close())).await {
        if let Err(e) = res {
            error!("Closing session: {:#}", e);
        }
    }
}

impl ShardManager {
    /// Opens `count` shards in parallel. If any of them fails, the ones that
    /// did open are closed again and the first error is returned.
    pub async fn open(platform: &dyn Platform, count: u32) -> Result<ShardManager> {
        let results = join_all(
            (0..count).map(|id| platform.open_session(Some(ShardInfo { id, count }))),
        )
        .await;
        let mut shards = Vec::with_capacity(results.len());
        let mut first_err = None;
        for (id, res) in results.into_iter().enumerate() {
            match res {
                Ok(session) => shards.push(session),
                Err(e) => {
                    error!("Opening shard {}/{}: {:#}", id, count, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(err) = first_err {
            close_all(&shards).await;
            return Err(err).context("opening shards");
        }
        info!("Opened {} shards", shards.len());
        Ok(ShardManager { shards })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Pushes the activity to every shard at once; returns how many accepted it.
    pub async fn set_activity(&self, activity: &Activity) -> usize {
        join_all(self.shards.iter().map(|s| s.set_activity(activity)))
            .await
            .into_iter()
            .filter(|res| match res {
                Ok(()) => true,
                Err(e) => {
                    error!("Unable to set activity: {:#}", e);
                    false
                }
            })
            .count()
    }

    pub async fn close(&self) {
        close_all(&self.shards).await;
    }
}

/// Where a watcher's activity goes: one session, or every shard.
pub enum PresenceTarget {
    Single(Box<dyn Session>),
    Sharded(ShardManager),
}

impl PresenceTarget {
    pub async fn open(platform: &dyn Platform, sharded: bool) -> Result<PresenceTarget> {
        if !sharded {
            let session = platform.open_session(None).await?;
            return Ok(PresenceTarget::Single(session));
        }
        let count = platform
            .shard_count()
            .await
            .context("fetching recommended shard count")?;
        Ok(PresenceTarget::Sharded(ShardManager::open(platform, count).await?))
    }

    pub async fn set_activity(&self, activity: &Activity) -> usize {
        let accepted = match self {
            PresenceTarget::Single(session) => match session.set_activity(activity).await {
                Ok(()) => 1,
                Err(e) => {
                    error!("Unable to set activity: {:#}", e);
                    0
                }
            },
            PresenceTarget::Sharded(shards) => shards.set_activity(activity).await,
        };
        if accepted > 0 {
            debug!("Set activity: {}", activity.name);
        }
        accepted
    }

    pub async fn close(&self) {
        match self {
            PresenceTarget::Single(session) => {
                if let Err(e) = session.close().await {
                    error!("Closing session: {:#}", e);
                }
            }
            PresenceTarget::Sharded(shards) => shards.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    #[tokio::test]
    async fn opens_every_shard_and_fans_out() {
        let platform = FakePlatform::new().with_shards(3);
        let target = PresenceTarget::open(&platform, true).await.unwrap();
        match &target {
            PresenceTarget::Sharded(shards) => assert_eq!(shards.len(), 3),
            PresenceTarget::Single(_) => panic!("expected shards"),
        }

        assert_eq!(target.set_activity(&Activity::watching("hi")).await, 3);
        let mut calls = platform.calls_with("activity");
        calls.sort();
        assert_eq!(
            calls,
            vec!["activity shard0 hi", "activity shard1 hi", "activity shard2 hi"]
        );
    }

    #[tokio::test]
    async fn one_failing_shard_closes_the_rest() {
        let platform = FakePlatform::new().with_shards(3).failing_shard(1);
        assert!(PresenceTarget::open(&platform, true).await.is_err());
        let mut closed = platform.calls_with("close");
        closed.sort();
        assert_eq!(closed, vec!["close shard0", "close shard2"]);
    }

    #[tokio::test]
    async fn single_session_without_sharding() {
        let platform = FakePlatform::new().with_shards(5);
        let target = PresenceTarget::open(&platform, false).await.unwrap();
        assert_eq!(target.set_activity(&Activity::playing("x")).await, 1);
        target.close().await;
        assert_eq!(platform.calls_with("activity"), vec!["activity primary x"]);
        assert_eq!(platform.calls_with("close"), vec!["close primary"]);
    }

    #[tokio::test]
    async fn failed_shard_update_does_not_block_others() {
        let platform = FakePlatform::new().with_shards(2);
        let target = PresenceTarget::open(&platform, true).await.unwrap();
        platform.fail_activity_on(0);
        assert_eq!(target.set_activity(&Activity::watching("hi")).await, 1);
    }
}
