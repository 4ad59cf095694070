use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::WatcherConfig;
use crate::datasources::{exchange_multiplier, is_rate_limited, PriceQuote, PriceSource, RateSource};
use crate::display::{self, Rendered};
use crate::metrics::{MetricsSink, NO_GUILD};
use crate::platform::{Activity, Guild, Platform};
use crate::rotator::ActivityRotator;
use crate::shards::PresenceTarget;

/// Collaborators and process-wide settings handed to every watcher.
#[derive(Clone)]
pub struct WatcherContext {
    pub platform: Arc<dyn Platform>,
    pub source: Arc<dyn PriceSource>,
    pub rates: Arc<dyn RateSource>,
    pub metrics: Arc<dyn MetricsSink>,
    pub frequency_override: Option<u64>,
    pub managed: bool,
    pub base_currency: String,
}

pub struct Watcher {
    config: WatcherConfig,
    ctx: WatcherContext,
}

/// Everything a running watcher mutates between ticks.
struct WatcherState {
    multiplier: f64,
    decorator: String,
    rotator: ActivityRotator,
    guilds: Vec<Guild>,
    nickname: bool,
    frequency: Duration,
}

impl Watcher {
    pub fn new(config: WatcherConfig, ctx: WatcherContext) -> Watcher {
        Watcher { config, ctx }
    }

    /// Runs until `shutdown` is cancelled or the connection cannot be opened.
    pub async fn run(self, shutdown: CancellationToken) {
        let instrument = self.config.instrument().to_owned();
        let started = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            res = self.start() => Some(res),
        };
        let (target, mut state) = match started {
            Some(Ok(started)) => started,
            Some(Err(e)) => {
                error!("Starting watcher for {}: {:#}", instrument, e);
                self.ctx.metrics.mark_failed(&instrument, NO_GUILD);
                return;
            }
            None => {
                info!("Shutting down price watching for {}", instrument);
                return;
            }
        };

        info!(
            "Watching {} price for {} every {}",
            if self.config.crypto { "crypto" } else { "stock" },
            instrument,
            pretty_duration::pretty_duration(&state.frequency, None)
        );
        let mut ticker = interval_at(Instant::now() + state.frequency, state.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.tick(&mut state, &target) => {}
            }
        }

        info!("Shutting down price watching for {}", instrument);
        target.close().await;
    }

    async fn start(&self) -> Result<(PresenceTarget, WatcherState)> {
        let config = &self.config;
        let platform = &*self.ctx.platform;

        let target = PresenceTarget::open(platform, config.crypto).await?;

        let mut nickname = config.nickname;
        let guilds = match platform.guilds().await {
            Ok(guilds) => guilds,
            Err(e) => {
                error!("Getting guilds: {:#}", e);
                vec![]
            }
        };
        if nickname && guilds.is_empty() {
            warn!("No guilds for {}, falling back to status updates", config.instrument());
            nickname = false;
        }

        let frequency = self.ctx.frequency_override.unwrap_or(config.frequency);

        let multiplier = exchange_multiplier(
            &*self.ctx.rates,
            &config.currency,
            &self.ctx.base_currency,
            config.multiplier,
            config.crypto,
        )
        .await;

        if self.ctx.managed {
            if let Err(e) = platform.set_username(&config.label()).await {
                error!("Setting username: {:#}", e);
            }
        }

        let state = WatcherState {
            multiplier,
            decorator: config.decorator.clone(),
            rotator: ActivityRotator::new(config.custom_activities()),
            guilds,
            nickname,
            frequency: Duration::from_secs(frequency),
        };
        Ok((target, state))
    }

    async fn tick(&self, state: &mut WatcherState, target: &PresenceTarget) {
        let config = &self.config;
        let metrics = &self.ctx.metrics;
        let instrument = config.instrument();
        debug!("Fetching price for {}", instrument);

        let quote = match self.ctx.source.fetch(instrument).await {
            Ok(quote) => quote,
            Err(e) => {
                error!("Unable to fetch price for {}: {:#}", instrument, e);
                if is_rate_limited(&e) {
                    metrics.rate_limited();
                } else {
                    metrics.update_error();
                }
                return;
            }
        };

        let rendered = Rendered::new(&quote, config, state.multiplier);
        state.decorator = display::decorator(&config.decorator, rendered.increase);

        let activity = if state.nickname {
            let nickname = display::nickname(config, &rendered);
            let activity = self.nickname_activity(&quote, &rendered).await;
            self.update_nicknames(&state.guilds, &nickname, rendered.increase)
                .await;
            Activity::watching(state.rotator.activity(activity))
        } else {
            let activity = display::status_activity(config, &rendered, &state.decorator);
            if config.crypto {
                Activity::playing(activity)
            } else {
                Activity::watching(activity)
            }
        };

        if target.set_activity(&activity).await > 0 {
            metrics.mark_updated(instrument, NO_GUILD);
        }
    }

    async fn nickname_activity(&self, quote: &PriceQuote, rendered: &Rendered) -> String {
        let config = &self.config;
        if !config.crypto || config.pair.is_empty() {
            return display::nickname_activity(config, quote, rendered);
        }
        match self.ctx.source.fetch(&config.pair).await {
            Ok(pair) => display::pair_activity(
                quote.price,
                &display::display_name(config, quote),
                pair.price,
                &pair.symbol.as_deref().unwrap_or(&config.pair).to_uppercase(),
                config.pair_flip,
            ),
            Err(e) => {
                error!("Unable to fetch pair price for {}: {:#}", config.pair, e);
                display::percent_activity(rendered)
            }
        }
    }

    async fn update_nicknames(&self, guilds: &[Guild], nickname: &str, increase: bool) {
        let config = &self.config;
        let platform = &self.ctx.platform;
        for guild in guilds {
            if let Err(e) = platform.set_nickname(&guild.id, nickname).await {
                error!("Updating nickname: {:#}", e);
                continue;
            }
            debug!("Set nickname in {}: {}", guild.name, nickname);
            self.ctx.metrics.mark_updated(config.instrument(), &guild.name);

            if config.color {
                if let Err(e) = platform
                    .set_color_role(&guild.id, &config.client_id, increase)
                    .await
                {
                    error!("Color roles: {:#}", e);
                }
            }
        }
    }
}
